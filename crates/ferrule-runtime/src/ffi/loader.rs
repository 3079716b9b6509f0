//! Dynamic library loading
//!
//! Cross-platform loading built on `libloading`, with platform-specific
//! naming conventions, a configurable search path list and caching by
//! absolute path. Loading a library executes its initialization code in this
//! process; the caller must trust it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use libloading::Library;

use crate::ctype::CType;
use crate::error::{Error, Result};
use crate::ffi::invoke::{self, Binding};
use crate::structs::StructRegistry;

/// Dynamic library loader with caching and path resolution.
pub struct LibraryLoader {
    loaded: HashMap<PathBuf, Library>,
    search_paths: Vec<PathBuf>,
}

impl LibraryLoader {
    pub fn new() -> Self {
        Self {
            loaded: HashMap::new(),
            search_paths: Self::default_search_paths(),
        }
    }

    /// Standard system library paths for the current platform, with the
    /// current working directory first.
    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(target_os = "linux")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/lib"));
            if cfg!(target_pointer_width = "64") {
                paths.push(PathBuf::from("/usr/lib64"));
                paths.push(PathBuf::from("/lib64"));
                paths.push(PathBuf::from("/usr/lib/x86_64-linux-gnu"));
            }
        }

        #[cfg(target_os = "macos")]
        {
            paths.push(PathBuf::from("/usr/lib"));
            paths.push(PathBuf::from("/usr/local/lib"));
            paths.push(PathBuf::from("/opt/homebrew/lib"));
        }

        #[cfg(target_os = "windows")]
        {
            paths.push(PathBuf::from("C:\\Windows\\System32"));
            if let Ok(system_root) = std::env::var("SystemRoot") {
                paths.push(PathBuf::from(format!("{system_root}\\System32")));
            }
        }

        if let Ok(cwd) = std::env::current_dir() {
            paths.insert(0, cwd);
        }

        paths
    }

    /// Resolve a library name to a full path using platform naming
    /// conventions (`lib{name}.so`, `lib{name}.dylib`, `{name}.dll`).
    fn resolve_library_path(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.is_absolute() && path.exists() {
            return Some(path.to_path_buf());
        }
        // an explicit file name with extension resolves in the search paths
        // as given
        let extensions = if cfg!(target_os = "windows") {
            vec!["dll"]
        } else if cfg!(target_os = "macos") {
            vec!["dylib", "so"]
        } else {
            vec!["so"]
        };
        let prefixes = if cfg!(target_os = "windows") {
            vec!["", "lib"]
        } else {
            vec!["lib", ""]
        };

        for search_path in &self.search_paths {
            let direct = search_path.join(name);
            if name.contains('.') && direct.exists() {
                return Some(direct);
            }
            for prefix in &prefixes {
                for ext in &extensions {
                    let full_path = search_path.join(format!("{prefix}{name}.{ext}"));
                    if full_path.exists() {
                        return Some(full_path);
                    }
                }
            }
        }

        None
    }

    /// Load a library by short name or path, or return the cached instance.
    pub fn load(&mut self, name: &str) -> Result<&Library> {
        let path = self
            .resolve_library_path(name)
            .ok_or_else(|| Error::LibraryNotFound {
                name: name.to_string(),
            })?;

        if !self.loaded.contains_key(&path) {
            let library = unsafe {
                Library::new(&path).map_err(|e| Error::LoadFailed {
                    reason: e.to_string(),
                })?
            };
            self.loaded.insert(path.clone(), library);
        }
        Ok(&self.loaded[&path])
    }

    /// Bind a symbol from a loaded library. Loads the library first if
    /// needed.
    pub fn bind(
        &mut self,
        library_name: &str,
        symbol: &str,
        params: Vec<CType>,
        ret: CType,
        registry: &StructRegistry,
    ) -> Result<Binding> {
        let library = self.load(library_name)?;
        invoke::bind(library, symbol, params, ret, registry).map_err(|e| match e {
            Error::SymbolNotFound { symbol, .. } => Error::SymbolNotFound {
                library: library_name.to_string(),
                symbol,
            },
            other => other,
        })
    }

    /// Prepend a custom search path.
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.insert(0, path);
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Load the platform C runtime, the library every binding sheet starts from.
pub fn load_c_runtime() -> Result<Library> {
    let candidates: &[&str] = if cfg!(target_os = "windows") {
        &["msvcrt.dll", "ucrtbase.dll"]
    } else if cfg!(target_os = "macos") {
        &["/usr/lib/libSystem.B.dylib"]
    } else {
        &["libc.so.6", "libc.so"]
    };

    let mut last = Error::LibraryNotFound {
        name: candidates.join(", "),
    };
    for name in candidates {
        match unsafe { Library::new(name) } {
            Ok(library) => return Ok(library),
            Err(e) => {
                last = Error::LoadFailed {
                    reason: e.to_string(),
                }
            }
        }
    }
    Err(last)
}

//! Curated C runtime bindings
//!
//! A focused binding sheet over the platform C runtime, built entirely on
//! the marshalling pipeline: character classification, string and stdlib
//! routines, `div`/`ldiv` (struct returns by value), `gmtime` (struct
//! pointer return), `qsort` (callback trampoline) and `snprintf` (variadic).
//!
//! Bindings hold raw symbol addresses; keep the [`CRuntime`] alive while
//! using anything bound from it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use libloading::Library;

use crate::ctype::{CType, FnSig};
use crate::error::{Error, Result};
use crate::ffi::callback::CallbackSpec;
use crate::ffi::invoke::{self, Binding};
use crate::ffi::loader;
use crate::pointer::{PtrValue, StructPointer};
use crate::structs::{StructLayout, StructRegistry, StructValue};
use crate::value::Value;

/// Broken-down time, as produced by `gmtime`/`localtime`.
pub const TM: &str = "tm";
/// Quotient/remainder pair returned by `div`.
pub const DIV_T: &str = "div_t";
/// Quotient/remainder pair returned by `ldiv`.
pub const LDIV_T: &str = "ldiv_t";

fn register_std_structs(registry: &StructRegistry) -> Result<()> {
    StructLayout::builder(TM)
        .field("tm_sec", CType::Int)
        .field("tm_min", CType::Int)
        .field("tm_hour", CType::Int)
        .field("tm_mday", CType::Int)
        .field("tm_mon", CType::Int)
        .field("tm_year", CType::Int)
        .field("tm_wday", CType::Int)
        .field("tm_yday", CType::Int)
        .field("tm_isdst", CType::Int)
        .register(registry)?;

    StructLayout::builder(DIV_T)
        .field("quot", CType::Int)
        .field("rem", CType::Int)
        .register(registry)?;

    StructLayout::builder(LDIV_T)
        .field("quot", CType::Long)
        .field("rem", CType::Long)
        .register(registry)?;

    Ok(())
}

/// Handle to the platform C runtime with its standard struct layouts
/// registered and a cache of constructed bindings.
pub struct CRuntime {
    library: Library,
    registry: StructRegistry,
    bindings: RefCell<HashMap<String, Rc<Binding>>>,
}

impl CRuntime {
    /// Load the platform C runtime and register the standard layouts.
    pub fn load() -> Result<CRuntime> {
        let library = loader::load_c_runtime()?;
        let registry = StructRegistry::new();
        register_std_structs(&registry)?;
        Ok(CRuntime {
            library,
            registry,
            bindings: RefCell::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &StructRegistry {
        &self.registry
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    /// Bind a C runtime symbol with the declared signature.
    pub fn bind(&self, symbol: &str, params: Vec<CType>, ret: CType) -> Result<Binding> {
        invoke::bind(&self.library, symbol, params, ret, &self.registry).map_err(|e| match e {
            Error::SymbolNotFound { symbol, .. } => Error::SymbolNotFound {
                library: "c runtime".to_string(),
                symbol,
            },
            other => other,
        })
    }

    /// Bind a symbol whose return must be the named registered struct.
    pub fn bind_with_struct_return(
        &self,
        symbol: &str,
        params: Vec<CType>,
        ret: CType,
        expected: &str,
    ) -> Result<Binding> {
        invoke::bind_with_struct_return(
            &self.library,
            symbol,
            params,
            ret,
            expected,
            &self.registry,
        )
    }

    fn cached(
        &self,
        symbol: &str,
        signature: impl FnOnce() -> (Vec<CType>, CType),
    ) -> Result<Rc<Binding>> {
        if let Some(binding) = self.bindings.borrow().get(symbol) {
            return Ok(Rc::clone(binding));
        }
        let (params, ret) = signature();
        let binding = Rc::new(self.bind(symbol, params, ret)?);
        self.bindings
            .borrow_mut()
            .insert(symbol.to_string(), Rc::clone(&binding));
        Ok(binding)
    }

    // ── character classification ────────────────────────────────────

    pub fn isalpha(&self, c: i64) -> Result<i64> {
        expect_int(self.cached("isalpha", || (vec![CType::Int], CType::Int))?.call(&[Value::Int(c)])?)
    }

    pub fn isdigit(&self, c: i64) -> Result<i64> {
        expect_int(self.cached("isdigit", || (vec![CType::Int], CType::Int))?.call(&[Value::Int(c)])?)
    }

    pub fn toupper(&self, c: i64) -> Result<i64> {
        expect_int(self.cached("toupper", || (vec![CType::Int], CType::Int))?.call(&[Value::Int(c)])?)
    }

    pub fn tolower(&self, c: i64) -> Result<i64> {
        expect_int(self.cached("tolower", || (vec![CType::Int], CType::Int))?.call(&[Value::Int(c)])?)
    }

    // ── strings ─────────────────────────────────────────────────────

    /// `strlen`; accepts anything string-like a char* parameter accepts.
    pub fn strlen(&self, s: &Value) -> Result<i64> {
        expect_int(
            self.cached("strlen", || (vec![CType::CharPtr], CType::SizeT))?
                .call(std::slice::from_ref(s))?,
        )
    }

    pub fn strcmp(&self, a: &Value, b: &Value) -> Result<i64> {
        expect_int(
            self.cached("strcmp", || {
                (vec![CType::CharPtr, CType::CharPtr], CType::Int)
            })?
            .call(&[a.clone(), b.clone()])?,
        )
    }

    /// `strstr`; the result decodes as text when a match is found.
    pub fn strstr(&self, haystack: &Value, needle: &Value) -> Result<Value> {
        self.cached("strstr", || {
            (vec![CType::CharPtr, CType::CharPtr], CType::CharPtr)
        })?
        .call(&[haystack.clone(), needle.clone()])
    }

    // ── stdlib ──────────────────────────────────────────────────────

    pub fn abs(&self, x: i64) -> Result<i64> {
        expect_int(self.cached("abs", || (vec![CType::Int], CType::Int))?.call(&[Value::Int(x)])?)
    }

    pub fn labs(&self, x: i64) -> Result<i64> {
        expect_int(self.cached("labs", || (vec![CType::Long], CType::Long))?.call(&[Value::Int(x)])?)
    }

    pub fn srand(&self, seed: i64) -> Result<()> {
        self.cached("srand", || (vec![CType::UInt], CType::Void))?
            .call(&[Value::Int(seed)])?;
        Ok(())
    }

    pub fn rand(&self) -> Result<i64> {
        expect_int(self.cached("rand", || (vec![], CType::Int))?.call(&[])?)
    }

    /// `div`: quotient and remainder returned as a `div_t` by value.
    pub fn div(&self, numer: i64, denom: i64) -> Result<StructValue> {
        let result = self
            .cached("div", || {
                (vec![CType::Int, CType::Int], CType::Struct(DIV_T.to_string()))
            })?
            .call(&[Value::Int(numer), Value::Int(denom)])?;
        expect_struct(result)
    }

    pub fn ldiv(&self, numer: i64, denom: i64) -> Result<StructValue> {
        let result = self
            .cached("ldiv", || {
                (
                    vec![CType::Long, CType::Long],
                    CType::Struct(LDIV_T.to_string()),
                )
            })?
            .call(&[Value::Int(numer), Value::Int(denom)])?;
        expect_struct(result)
    }

    // ── time ────────────────────────────────────────────────────────

    /// `time(NULL)` style call; pass null or a pointer to a time slot.
    pub fn time(&self, out: &Value) -> Result<i64> {
        expect_int(
            self.cached("time", || {
                (vec![CType::Ptr(Box::new(CType::Long))], CType::Long)
            })?
            .call(std::slice::from_ref(out))?,
        )
    }

    /// `gmtime`: decodes the returned `struct tm*` against the registered
    /// layout.
    pub fn gmtime(&self, timer: &Value) -> Result<StructPointer> {
        let result = self
            .cached("gmtime", || {
                (
                    vec![CType::Ptr(Box::new(CType::Long))],
                    CType::Ptr(Box::new(CType::Struct(TM.to_string()))),
                )
            })?
            .call(std::slice::from_ref(timer))?;
        match result {
            Value::Ptr(PtrValue::Struct(p)) => Ok(p),
            other => Err(Error::Dereference {
                reason: format!("gmtime returned {}", other.type_name()),
            }),
        }
    }

    // ── sorting ─────────────────────────────────────────────────────

    /// `qsort` over a caller-owned buffer, comparing through a callback
    /// trampoline.
    pub fn qsort(
        &self,
        base: &Value,
        count: usize,
        width: usize,
        compare: CallbackSpec,
    ) -> Result<()> {
        self.cached("qsort", || {
            (
                vec![
                    CType::VoidPtr,
                    CType::SizeT,
                    CType::SizeT,
                    CType::FnPtr(Box::new(FnSig {
                        params: vec![CType::VoidPtr, CType::VoidPtr],
                        ret: CType::Int,
                    })),
                ],
                CType::Void,
            )
        })?
        .call(&[
            base.clone(),
            Value::Int(count as i64),
            Value::Int(width as i64),
            Value::Callable(compare),
        ])?;
        Ok(())
    }

    // ── formatted output ────────────────────────────────────────────

    /// `snprintf` into a caller-owned buffer, with variadic format
    /// arguments converted per-argument.
    pub fn snprintf(
        &self,
        buffer: &Value,
        capacity: usize,
        format: &str,
        args: &[Value],
    ) -> Result<i64> {
        let binding = self.cached("snprintf", || {
            (
                vec![CType::CharPtr, CType::SizeT, CType::CharPtr],
                CType::Int,
            )
        })?;
        expect_int(binding.call_variadic(
            &[
                buffer.clone(),
                Value::Int(capacity as i64),
                Value::Str(format.to_string()),
            ],
            args,
        )?)
    }

    pub fn puts(&self, s: &Value) -> Result<i64> {
        expect_int(
            self.cached("puts", || (vec![CType::CharPtr], CType::Int))?
                .call(std::slice::from_ref(s))?,
        )
    }
}

impl std::fmt::Debug for CRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<c runtime, {} cached bindings>", self.bindings.borrow().len())
    }
}

fn expect_int(value: Value) -> Result<i64> {
    match value {
        Value::Int(i) => Ok(i),
        other => Err(Error::TypeMismatch {
            expected: "int".to_string(),
            got: other.type_name().to_string(),
        }),
    }
}

fn expect_struct(value: Value) -> Result<StructValue> {
    match value {
        Value::Struct(s) => Ok(s),
        other => Err(Error::TypeMismatch {
            expected: "struct".to_string(),
            got: other.type_name().to_string(),
        }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn runtime() -> CRuntime {
        CRuntime::load().unwrap()
    }

    #[test]
    fn test_character_classification() {
        let c = runtime();
        assert!(c.isalpha(i64::from(b'a')).unwrap() != 0);
        assert_eq!(c.isalpha(i64::from(b'7')).unwrap(), 0);
        assert!(c.isdigit(i64::from(b'7')).unwrap() != 0);
        assert_eq!(c.toupper(i64::from(b'q')).unwrap(), i64::from(b'Q'));
    }

    #[test]
    fn test_abs_and_labs() {
        let c = runtime();
        assert_eq!(c.abs(-5).unwrap(), 5);
        assert_eq!(c.labs(-5_000_000_000).unwrap(), 5_000_000_000);
    }

    #[test]
    fn test_strlen_accepts_string_likes() {
        let c = runtime();
        assert_eq!(c.strlen(&Value::Str("hello".into())).unwrap(), 5);
        assert_eq!(c.strlen(&Value::Bytes(b"hey".to_vec())).unwrap(), 3);
    }

    #[test]
    fn test_strcmp_and_strstr() {
        let c = runtime();
        assert_eq!(
            c.strcmp(&Value::Str("same".into()), &Value::Str("same".into()))
                .unwrap(),
            0
        );
        assert_eq!(
            c.strstr(
                &Value::Str("hello world".into()),
                &Value::Str("world".into())
            )
            .unwrap(),
            Value::Str("world".into())
        );
        assert_eq!(
            c.strstr(&Value::Str("hello".into()), &Value::Str("xyz".into()))
                .unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_div_returns_struct_by_value() {
        let c = runtime();
        let result = c.div(7, 2).unwrap();
        assert_eq!(result.get("quot").unwrap(), Value::Int(3));
        assert_eq!(result.get("rem").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_binding_cache_reuses_bindings() {
        let c = runtime();
        c.abs(-1).unwrap();
        c.abs(-2).unwrap();
        assert_eq!(c.bindings.borrow().len(), 1);
    }

    #[test]
    fn test_struct_return_expectation_checked_at_bind() {
        let c = runtime();
        let err = c
            .bind_with_struct_return(
                "div",
                vec![CType::Int, CType::Int],
                CType::Int,
                DIV_T,
            )
            .unwrap_err();
        assert!(matches!(err, Error::ReturnTypeMismatch { .. }));
    }
}

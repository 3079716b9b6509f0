//! Ferrule Runtime - typed pointer handles and foreign-call marshalling
//!
//! This library provides explicit, typed handles over three address spaces:
//! - Managed-object handles over an owned arena ([`heap`], [`pointer::object`])
//! - Raw heap allocations with freed/assigned tracking and chunked array
//!   addressing ([`pointer::alloc`], [`pointer::array`])
//! - Foreign memory tagged with a type mapping ([`pointer::foreign`],
//!   [`ctype`], [`structs`])
//!
//! plus the marshalling layer that lets dynamic values cross a C-ABI call
//! boundary with validated conversion in both directions ([`ffi`]), a
//! curated binding sheet over the platform C runtime ([`cstd`]), and a
//! best-effort fault barrier converting native traps into errors ([`fault`]).
//!
//! Single-threaded by design: pointer and allocation state is shared with
//! `Rc`, and nothing here is `Send` or `Sync`.

/// Ferrule runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// Public API modules
pub mod cstd;
pub mod ctype;
pub mod error;
pub mod fault;
pub mod ffi;
pub mod heap;
pub mod pointer;
pub mod structs;
pub mod value;

// Re-export commonly used types
pub use cstd::CRuntime;
pub use ctype::{CType, FnSig};
pub use error::{Error, Result};
pub use fault::guarded;
pub use ffi::{bind, bind_with_struct_return, Binding, CallbackSpec, LibraryLoader};
pub use heap::ManagedHeap;
pub use pointer::{
    calloc, cast, cast_struct, free, malloc, realloc, to_struct_ptr, Address, AllocatedPointer,
    ArrayPointer, Dereference, FrozenPointer, ObjectPointer, PointerBase, PointerKind, PtrValue,
    StructPointer, TypedCPointer, VoidPointer,
};
pub use structs::{StructLayout, StructRegistry, StructValue};
pub use value::{Value, ValueKind};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoke() {
        // Smoke test to verify the crate builds and tests run
        assert_eq!(VERSION, "0.1.0");
    }
}

//! Pointer hierarchy
//!
//! Handles over three distinct address spaces:
//! - [`object::ObjectPointer`] — the managed-object heap (arena handles)
//! - [`alloc::AllocatedPointer`] / [`array::ArrayPointer`] — raw heap
//!   allocations obtained from the platform allocator
//! - [`foreign::VoidPointer`] / [`foreign::TypedCPointer`] /
//!   [`foreign::StructPointer`] — foreign memory tagged with a type mapping
//!
//! Addresses are opaque integers and are not portable across spaces.

pub mod alloc;
pub mod array;
pub mod foreign;
pub mod object;

use std::fmt;

use crate::error::{Error, Result};
use crate::value::Value;

pub use alloc::{free, malloc, realloc, AllocatedPointer};
pub use array::{calloc, ArrayPointer};
pub use foreign::{cast, cast_struct, to_struct_ptr, StructPointer, TypedCPointer, VoidPointer};
pub use object::{FrozenPointer, ObjectPointer};

/// Opaque address of a location in one of the three pointer spaces.
///
/// Zero is the null address in every space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(usize);

impl Address {
    pub const NULL: Address = Address(0);

    pub fn new(raw: usize) -> Self {
        Address(raw)
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Which space and shape a pointer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerKind {
    Object,
    Allocated,
    TypedForeign,
    Void,
    Struct,
}

/// Base contract shared by every pointer kind: an address, null checking,
/// and address-based equality.
pub trait PointerBase {
    /// Address the pointer is looking at.
    fn address(&self) -> Address;

    fn kind(&self) -> PointerKind;

    fn is_null(&self) -> bool {
        self.address().is_null()
    }

    /// Ensure the pointer is not null.
    fn ensure(&self) -> Result<Address> {
        let address = self.address();
        if address.is_null() {
            return Err(Error::NullPointer);
        }
        Ok(address)
    }
}

/// Dereference contract. Every pointer kind resolves to a dynamic [`Value`];
/// what can fail differs per space and is documented on each implementation.
pub trait Dereference {
    fn dereference(&self) -> Result<Value>;
}

/// Closed tagged union of the pointer kinds a foreign-call argument can
/// carry. Dispatch over this union happens once, when an argument list is
/// validated, never per call.
#[derive(Debug, Clone)]
pub enum PtrValue {
    Void(VoidPointer),
    Typed(TypedCPointer),
    Struct(StructPointer),
    Allocated(AllocatedPointer),
}

impl PtrValue {
    pub fn address(&self) -> Address {
        match self {
            PtrValue::Void(p) => p.address(),
            PtrValue::Typed(p) => p.address(),
            PtrValue::Struct(p) => p.address(),
            PtrValue::Allocated(p) => p.address(),
        }
    }

    pub fn kind(&self) -> PointerKind {
        match self {
            PtrValue::Void(p) => p.kind(),
            PtrValue::Typed(p) => p.kind(),
            PtrValue::Struct(p) => p.kind(),
            PtrValue::Allocated(p) => p.kind(),
        }
    }

    /// Name used in binding diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            PtrValue::Void(_) => "void pointer",
            PtrValue::Typed(_) => "typed pointer",
            PtrValue::Struct(_) => "struct pointer",
            PtrValue::Allocated(_) => "allocated pointer",
        }
    }
}

//! Pointers into foreign memory
//!
//! These handles carry no reference claim and no allocation record: they are
//! views over memory something else owns, tagged with the type mapping used
//! to decode it. Dereferencing foreign memory is only as safe as the address
//! is — the crate narrows the risk with null checks and typed widths, it
//! does not remove it.

use std::fmt;
use std::rc::Rc;

use crate::ctype::CType;
use crate::error::{Error, Result};
use crate::pointer::{Address, Dereference, PointerBase, PointerKind};
use crate::structs::{StructLayout, StructRegistry, StructValue};
use crate::value::{attempt_decode, Value};

/// Untyped pointer to a foreign address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoidPointer {
    address: Address,
}

impl VoidPointer {
    pub fn new(address: Address) -> VoidPointer {
        VoidPointer { address }
    }

    /// Size of the pointer representation itself.
    pub fn size(&self) -> usize {
        std::mem::size_of::<usize>()
    }
}

impl PointerBase for VoidPointer {
    fn address(&self) -> Address {
        self.address
    }

    fn kind(&self) -> PointerKind {
        PointerKind::Void
    }
}

impl Dereference for VoidPointer {
    /// Reads the pointer-sized word at the address.
    fn dereference(&self) -> Result<Value> {
        let address = self.ensure()?;
        let word = unsafe { *(address.as_usize() as *const usize) };
        Ok(Value::Int(word as i64))
    }
}

impl fmt::Display for VoidPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<void pointer to {}>", self.address)
    }
}

/// Foreign pointer tagged with a primitive type mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedCPointer {
    address: Address,
    ctype: CType,
}

impl TypedCPointer {
    pub fn new(address: Address, ctype: CType) -> TypedCPointer {
        TypedCPointer { address, ctype }
    }

    pub fn ctype(&self) -> &CType {
        &self.ctype
    }

    /// Byte width of the pointed-to type.
    pub fn size(&self) -> usize {
        self.ctype
            .size(&StructRegistry::new())
            .unwrap_or(std::mem::size_of::<usize>())
    }

    /// Encode a scalar value into the pointed-to location.
    pub fn write(&self, value: &Value) -> Result<()> {
        let address = self.ensure()?;
        let base = address.as_usize() as *mut u8;

        let mismatch = || Error::TypeMismatch {
            expected: self.ctype.display_name(),
            got: value.type_name().to_string(),
        };

        unsafe {
            match (&self.ctype, value) {
                (CType::Bool, Value::Bool(b)) => *base = u8::from(*b),
                (ctype, Value::Int(i)) if ctype.int_range().is_some() => {
                    let (min, max) = ctype.int_range().unwrap();
                    if *i < min || *i > max {
                        return Err(Error::NumberOutOfRange {
                            value: *i,
                            target: ctype.display_name(),
                        });
                    }
                    crate::structs::write_int_at(base, ctype, *i);
                }
                (CType::Float, Value::Float(f)) => *(base as *mut f32) = *f as f32,
                (CType::Double, Value::Float(f)) => *(base as *mut f64) = *f,
                _ => return Err(mismatch()),
            }
        }
        Ok(())
    }
}

impl PointerBase for TypedCPointer {
    fn address(&self) -> Address {
        self.address
    }

    fn kind(&self) -> PointerKind {
        PointerKind::TypedForeign
    }
}

impl Dereference for TypedCPointer {
    /// Reads the type-appropriate byte width and decodes it. Char-pointer
    /// content attempts text decoding with a raw-bytes fallback.
    fn dereference(&self) -> Result<Value> {
        let address = self.ensure()?;
        let base = address.as_usize() as *const u8;

        unsafe {
            Ok(match &self.ctype {
                CType::Bool => Value::Bool(*base != 0),
                CType::Char => Value::Int(i64::from(*(base as *const i8))),
                CType::UChar => Value::Int(i64::from(*base)),
                CType::Short => Value::Int(i64::from(*(base as *const libc::c_short))),
                CType::UShort => Value::Int(i64::from(*(base as *const libc::c_ushort))),
                CType::Int => Value::Int(i64::from(*(base as *const libc::c_int))),
                CType::UInt => Value::Int(i64::from(*(base as *const libc::c_uint))),
                CType::Long => Value::Int(*(base as *const libc::c_long) as i64),
                CType::ULong => Value::Int(*(base as *const libc::c_ulong) as i64),
                CType::LongLong => Value::Int(*(base as *const libc::c_longlong)),
                CType::ULongLong => Value::Int(*(base as *const libc::c_ulonglong) as i64),
                CType::SizeT => Value::Int(*(base as *const libc::size_t) as i64),
                CType::Float => Value::Float(f64::from(*(base as *const f32))),
                CType::Double => Value::Float(*(base as *const f64)),
                // the address is the start of a null-terminated string
                CType::CharPtr => attempt_decode(
                    std::ffi::CStr::from_ptr(base as *const libc::c_char)
                        .to_bytes()
                        .to_vec(),
                ),
                CType::VoidPtr => Value::Int(*(base as *const usize) as i64),
                CType::Ptr(inner) => {
                    let word = *(base as *const usize);
                    if word == 0 {
                        Value::Null
                    } else {
                        Value::Ptr(crate::pointer::PtrValue::Typed(TypedCPointer::new(
                            Address::new(word),
                            inner.as_ref().clone(),
                        )))
                    }
                }
                CType::Struct(name) => {
                    return Err(Error::UnsupportedSignature {
                        reason: format!(
                            "cast to struct {name} produces a struct pointer, not a typed pointer"
                        ),
                    })
                }
                CType::FnPtr(_) | CType::Void => {
                    return Err(Error::UnsupportedSignature {
                        reason: format!("{} cannot be dereferenced", self.ctype.display_name()),
                    })
                }
            })
        }
    }
}

impl fmt::Display for TypedCPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<typed c pointer to {}>", self.address)
    }
}

/// Pointer to a struct value. The foreign-call representation aliases the
/// struct's own backing memory, so mutation through the pointer is visible
/// on the original value.
#[derive(Debug, Clone)]
pub struct StructPointer {
    value: StructValue,
}

impl StructPointer {
    pub(crate) fn to_existing(value: StructValue) -> StructPointer {
        StructPointer { value }
    }

    /// The struct value this pointer aliases.
    pub fn value(&self) -> &StructValue {
        &self.value
    }

    pub fn layout(&self) -> &Rc<StructLayout> {
        self.value.layout()
    }
}

impl PointerBase for StructPointer {
    fn address(&self) -> Address {
        self.value.address()
    }

    fn kind(&self) -> PointerKind {
        PointerKind::Struct
    }
}

impl Dereference for StructPointer {
    fn dereference(&self) -> Result<Value> {
        self.ensure()?;
        Ok(Value::Struct(self.value.clone()))
    }
}

impl PartialEq for StructPointer {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl fmt::Display for StructPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<pointer to struct at {}>", self.address())
    }
}

/// Reinterpret an untyped foreign address as a primitive type.
///
/// Struct names are not primitives; use [`cast_struct`] for them.
pub fn cast(ptr: &VoidPointer, ctype: CType) -> Result<TypedCPointer> {
    if matches!(ctype, CType::Struct(_)) {
        return Err(Error::UnsupportedSignature {
            reason: "cast to a struct type goes through cast_struct".to_string(),
        });
    }
    Ok(TypedCPointer::new(ptr.address(), ctype))
}

/// Reinterpret an untyped foreign address as a pointer to a known struct.
pub fn cast_struct(ptr: &VoidPointer, layout: Rc<StructLayout>) -> Result<StructPointer> {
    Ok(StructPointer::to_existing(StructValue::from_existing(
        layout,
        ptr.address(),
    )?))
}

/// Convert a struct value to a pointer aliasing its backing memory.
pub fn to_struct_ptr(value: &StructValue) -> StructPointer {
    StructPointer::to_existing(value.clone())
}

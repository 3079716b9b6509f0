//! Foreign type tags
//!
//! [`CType`] is the declarative side of the type mapping: each tag names a C
//! type, knows its byte width and alignment, and maps to the libffi type
//! used to build call descriptors. Struct tags refer to registered layouts
//! by name; the names are resolved against a
//! [`StructRegistry`](crate::structs::StructRegistry) once at bind time.

use libffi::middle::Type;
use serde::{Deserialize, Serialize};
use std::mem;

use crate::error::{Error, Result};
use crate::structs::StructRegistry;

/// Signature of a function-pointer parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FnSig {
    pub params: Vec<CType>,
    pub ret: CType,
}

/// C-compatible foreign types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CType {
    Bool,
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    SizeT,
    Float,
    Double,
    /// `char*`, null-terminated
    CharPtr,
    /// `void*`
    VoidPtr,
    /// Typed pointer, e.g. `int*`
    Ptr(Box<CType>),
    /// Struct passed or returned by value, referenced by registered name
    Struct(String),
    /// Function pointer with the given signature
    FnPtr(Box<FnSig>),
    Void,
}

impl CType {
    /// Display name used in binding diagnostics.
    pub fn display_name(&self) -> String {
        match self {
            CType::Bool => "c_bool".to_string(),
            CType::Char => "c_char".to_string(),
            CType::UChar => "c_uchar".to_string(),
            CType::Short => "c_short".to_string(),
            CType::UShort => "c_ushort".to_string(),
            CType::Int => "c_int".to_string(),
            CType::UInt => "c_uint".to_string(),
            CType::Long => "c_long".to_string(),
            CType::ULong => "c_ulong".to_string(),
            CType::LongLong => "c_longlong".to_string(),
            CType::ULongLong => "c_ulonglong".to_string(),
            CType::SizeT => "c_size_t".to_string(),
            CType::Float => "c_float".to_string(),
            CType::Double => "c_double".to_string(),
            CType::CharPtr => "char*".to_string(),
            CType::VoidPtr => "void*".to_string(),
            CType::Ptr(inner) => format!("{}*", inner.display_name()),
            CType::Struct(name) => format!("struct {name}"),
            CType::FnPtr(sig) => {
                let params: Vec<String> = sig.params.iter().map(|p| p.display_name()).collect();
                format!("{} (*)({})", sig.ret.display_name(), params.join(", "))
            }
            CType::Void => "c_void".to_string(),
        }
    }

    /// Whether the tag is represented as an address at the call boundary.
    pub fn is_pointer_like(&self) -> bool {
        matches!(
            self,
            CType::CharPtr | CType::VoidPtr | CType::Ptr(_) | CType::FnPtr(_)
        )
    }

    /// Byte width. Struct tags consult the registry.
    pub fn size(&self, registry: &StructRegistry) -> Result<usize> {
        Ok(match self {
            CType::Bool | CType::Char | CType::UChar => 1,
            CType::Short | CType::UShort => mem::size_of::<libc::c_short>(),
            CType::Int | CType::UInt => mem::size_of::<libc::c_int>(),
            CType::Long | CType::ULong => mem::size_of::<libc::c_long>(),
            CType::LongLong | CType::ULongLong => mem::size_of::<libc::c_longlong>(),
            CType::SizeT => mem::size_of::<libc::size_t>(),
            CType::Float => mem::size_of::<libc::c_float>(),
            CType::Double => mem::size_of::<libc::c_double>(),
            CType::CharPtr | CType::VoidPtr | CType::Ptr(_) | CType::FnPtr(_) => {
                mem::size_of::<usize>()
            }
            CType::Struct(name) => registry.get(name)?.size(),
            CType::Void => 0,
        })
    }

    /// ABI alignment. For every non-struct tag this matches the size-capped
    /// natural alignment of the underlying C type.
    pub fn align(&self, registry: &StructRegistry) -> Result<usize> {
        Ok(match self {
            CType::Struct(name) => registry.get(name)?.align(),
            CType::Void => 1,
            _ => self.size(registry)?,
        })
    }

    /// Range an integer value must fit, when the tag is an integer.
    pub(crate) fn int_range(&self) -> Option<(i64, i64)> {
        match self {
            CType::Bool => Some((0, 1)),
            CType::Char => Some((i64::from(i8::MIN), i64::from(i8::MAX))),
            CType::UChar => Some((0, i64::from(u8::MAX))),
            CType::Short => Some((i64::from(i16::MIN), i64::from(i16::MAX))),
            CType::UShort => Some((0, i64::from(u16::MAX))),
            CType::Int => Some((i64::from(i32::MIN), i64::from(i32::MAX))),
            CType::UInt => Some((0, i64::from(u32::MAX))),
            CType::Long => {
                if mem::size_of::<libc::c_long>() == 4 {
                    Some((i64::from(i32::MIN), i64::from(i32::MAX)))
                } else {
                    Some((i64::MIN, i64::MAX))
                }
            }
            CType::ULong => {
                if mem::size_of::<libc::c_long>() == 4 {
                    Some((0, i64::from(u32::MAX)))
                } else {
                    Some((0, i64::MAX))
                }
            }
            CType::LongLong => Some((i64::MIN, i64::MAX)),
            CType::ULongLong | CType::SizeT => Some((0, i64::MAX)),
            _ => None,
        }
    }

    /// Whether the tag is an integer-family scalar.
    pub fn is_integer(&self) -> bool {
        self.int_range().is_some() && !matches!(self, CType::Bool)
    }

    pub fn is_float(&self) -> bool {
        matches!(self, CType::Float | CType::Double)
    }

    /// libffi type used when building a call descriptor for this tag.
    pub(crate) fn ffi_type(&self, registry: &StructRegistry) -> Result<Type> {
        Ok(match self {
            CType::Bool | CType::UChar => Type::u8(),
            CType::Char => Type::i8(),
            CType::Short => Type::i16(),
            CType::UShort => Type::u16(),
            CType::Int => Type::i32(),
            CType::UInt => Type::u32(),
            CType::Long => {
                if mem::size_of::<libc::c_long>() == 8 {
                    Type::i64()
                } else {
                    Type::i32()
                }
            }
            CType::ULong => {
                if mem::size_of::<libc::c_long>() == 8 {
                    Type::u64()
                } else {
                    Type::u32()
                }
            }
            CType::LongLong => Type::i64(),
            CType::ULongLong => Type::u64(),
            CType::SizeT => {
                if mem::size_of::<libc::size_t>() == 8 {
                    Type::u64()
                } else {
                    Type::u32()
                }
            }
            CType::Float => Type::f32(),
            CType::Double => Type::f64(),
            CType::CharPtr | CType::VoidPtr | CType::Ptr(_) | CType::FnPtr(_) => Type::pointer(),
            CType::Struct(name) => registry.get(name)?.ffi_type(registry)?,
            CType::Void => Type::void(),
        })
    }

    /// Verify the tag is usable as a parameter type.
    pub(crate) fn ensure_parameter(&self) -> Result<()> {
        if matches!(self, CType::Void) {
            return Err(Error::UnsupportedSignature {
                reason: "void is not a parameter type".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names() {
        assert_eq!(CType::Int.display_name(), "c_int");
        assert_eq!(CType::CharPtr.display_name(), "char*");
        assert_eq!(
            CType::Ptr(Box::new(CType::Int)).display_name(),
            "c_int*"
        );
        assert_eq!(
            CType::Struct("tm".to_string()).display_name(),
            "struct tm"
        );
        assert_eq!(
            CType::FnPtr(Box::new(FnSig {
                params: vec![CType::VoidPtr, CType::VoidPtr],
                ret: CType::Int,
            }))
            .display_name(),
            "c_int (*)(void*, void*)"
        );
    }

    #[test]
    fn test_scalar_sizes() {
        let registry = StructRegistry::new();
        assert_eq!(CType::Char.size(&registry).unwrap(), 1);
        assert_eq!(
            CType::Int.size(&registry).unwrap(),
            mem::size_of::<libc::c_int>()
        );
        assert_eq!(
            CType::VoidPtr.size(&registry).unwrap(),
            mem::size_of::<usize>()
        );
        assert_eq!(CType::Void.size(&registry).unwrap(), 0);
    }

    #[test]
    fn test_int_ranges() {
        assert_eq!(CType::Char.int_range(), Some((-128, 127)));
        assert_eq!(CType::UChar.int_range(), Some((0, 255)));
        assert!(CType::Double.int_range().is_none());
        assert!(CType::CharPtr.int_range().is_none());
    }

    #[test]
    fn test_pointer_like() {
        assert!(CType::CharPtr.is_pointer_like());
        assert!(CType::Ptr(Box::new(CType::Double)).is_pointer_like());
        assert!(!CType::Int.is_pointer_like());
        assert!(!CType::Struct("tm".to_string()).is_pointer_like());
    }

    #[test]
    fn test_void_is_not_a_parameter() {
        assert!(CType::Void.ensure_parameter().is_err());
        assert!(CType::Int.ensure_parameter().is_ok());
    }

    #[test]
    fn test_unknown_struct_size_fails() {
        let registry = StructRegistry::new();
        assert!(matches!(
            CType::Struct("nope".to_string()).size(&registry),
            Err(Error::UnknownStruct { .. })
        ));
    }
}

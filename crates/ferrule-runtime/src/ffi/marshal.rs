//! Argument validation and conversion
//!
//! [`validate`] checks each positional argument against its declared foreign
//! parameter type, permitting the implicit conversions the call layer
//! supports: byte buffers for char-pointer parameters, pointer subtypes for
//! void-pointer parameters, null for pointer parameters, and plain callables
//! for function-pointer parameters. Anything else refuses with
//! [`Error::InvalidBindingParameter`] naming the 1-based argument index.
//!
//! [`MarshalContext`] performs the conversion, owning every representation
//! it creates — C strings, byte buffers, struct copies and callback
//! trampolines stay alive inside the context until the call returns.

use std::ffi::CString;
use std::os::raw::c_void;

use libffi::middle::{Arg, Type};

use crate::ctype::CType;
use crate::error::{Error, Result};
use crate::ffi::callback::CallbackHandle;
use crate::pointer::PtrValue;
use crate::structs::StructRegistry;
use crate::value::Value;

/// Validate positional arguments against declared parameter types.
pub fn validate(args: &[Value], params: &[CType]) -> Result<()> {
    if args.len() != params.len() {
        return Err(Error::ArityMismatch {
            expected: params.len(),
            got: args.len(),
        });
    }

    for (index, (value, param)) in args.iter().zip(params).enumerate() {
        check_compatible(index + 1, value, param)?;
    }
    Ok(())
}

fn mismatch(index: usize, param: &CType, value: &Value) -> Error {
    Error::InvalidBindingParameter {
        index,
        expected: param.display_name(),
        got: value.type_name().to_string(),
    }
}

fn check_compatible(index: usize, value: &Value, param: &CType) -> Result<()> {
    param.ensure_parameter()?;

    let ok = match param {
        CType::Bool => matches!(value, Value::Bool(_)),
        CType::Float | CType::Double => matches!(value, Value::Float(_) | Value::Int(_)),
        p if p.int_range().is_some() => match value {
            Value::Int(i) => {
                let (min, max) = p.int_range().unwrap();
                if *i < min || *i > max {
                    return Err(Error::NumberOutOfRange {
                        value: *i,
                        target: p.display_name(),
                    });
                }
                true
            }
            _ => false,
        },
        CType::CharPtr => match value {
            Value::Str(_) | Value::Bytes(_) | Value::Null => true,
            Value::Ptr(PtrValue::Void(_) | PtrValue::Allocated(_)) => true,
            Value::Ptr(PtrValue::Typed(p)) => {
                // a typed pointer must actually point at character data
                if matches!(p.ctype(), CType::Char | CType::UChar | CType::CharPtr | CType::VoidPtr)
                {
                    true
                } else {
                    return Err(mismatch(index, param, value));
                }
            }
            _ => false,
        },
        CType::VoidPtr => matches!(
            value,
            Value::Ptr(_) | Value::Null | Value::Str(_) | Value::Bytes(_)
        ),
        CType::Ptr(_) => matches!(value, Value::Ptr(_) | Value::Null),
        CType::FnPtr(sig) => match value {
            Value::Callable(spec) => {
                // the callback's own declared parameter types must line up
                // with the trampoline signature the parameter expects
                if spec.matches(sig) {
                    true
                } else {
                    return Err(Error::InvalidBindingParameter {
                        index,
                        expected: param.display_name(),
                        got: spec.signature_name(),
                    });
                }
            }
            Value::Ptr(PtrValue::Void(_)) | Value::Null => true,
            _ => false,
        },
        CType::Struct(name) => match value {
            Value::Struct(s) => s.layout().name() == name,
            _ => false,
        },
        _ => false,
    };

    if ok {
        Ok(())
    } else {
        Err(mismatch(index, param, value))
    }
}

/// A converted argument. Variants either carry the scalar inline or point
/// into storage owned by the [`MarshalContext`].
#[derive(Debug)]
pub(crate) enum CValue {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Usize(usize),
    F32(f32),
    F64(f64),
    Ptr(*mut c_void),
    Struct { data: *const u8 },
}

impl CValue {
    pub(crate) fn as_arg(&self) -> Arg {
        match self {
            CValue::I8(v) => Arg::new(v),
            CValue::U8(v) => Arg::new(v),
            CValue::I16(v) => Arg::new(v),
            CValue::U16(v) => Arg::new(v),
            CValue::I32(v) => Arg::new(v),
            CValue::U32(v) => Arg::new(v),
            CValue::I64(v) => Arg::new(v),
            CValue::U64(v) => Arg::new(v),
            CValue::Usize(v) => Arg::new(v),
            CValue::F32(v) => Arg::new(v),
            CValue::F64(v) => Arg::new(v),
            CValue::Ptr(v) => Arg::new(v),
            CValue::Struct { data } => unsafe { Arg::new(&**data) },
        }
    }

    /// Address of the argument storage, for the raw call interface.
    pub(crate) fn raw_ptr(&self) -> *mut c_void {
        match self {
            CValue::I8(v) => v as *const i8 as *mut c_void,
            CValue::U8(v) => v as *const u8 as *mut c_void,
            CValue::I16(v) => v as *const i16 as *mut c_void,
            CValue::U16(v) => v as *const u16 as *mut c_void,
            CValue::I32(v) => v as *const i32 as *mut c_void,
            CValue::U32(v) => v as *const u32 as *mut c_void,
            CValue::I64(v) => v as *const i64 as *mut c_void,
            CValue::U64(v) => v as *const u64 as *mut c_void,
            CValue::Usize(v) => v as *const usize as *mut c_void,
            CValue::F32(v) => v as *const f32 as *mut c_void,
            CValue::F64(v) => v as *const f64 as *mut c_void,
            CValue::Ptr(v) => v as *const *mut c_void as *mut c_void,
            CValue::Struct { data } => *data as *mut c_void,
        }
    }
}

/// Conversion context for one foreign call. Owns every allocated
/// representation until dropped.
#[derive(Debug, Default)]
pub struct MarshalContext {
    registry: StructRegistry,
    cstrings: Vec<CString>,
    buffers: Vec<Vec<u8>>,
    callbacks: Vec<CallbackHandle>,
}

impl MarshalContext {
    pub fn new(registry: StructRegistry) -> MarshalContext {
        MarshalContext {
            registry,
            cstrings: Vec::new(),
            buffers: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    /// Convert a validated argument to its C representation.
    pub(crate) fn convert(&mut self, value: &Value, param: &CType) -> Result<CValue> {
        Ok(match (param, value) {
            (CType::Bool, Value::Bool(b)) => CValue::U8(u8::from(*b)),
            (CType::Char, Value::Int(i)) => CValue::I8(*i as i8),
            (CType::UChar, Value::Int(i)) => CValue::U8(*i as u8),
            (CType::Short, Value::Int(i)) => CValue::I16(*i as i16),
            (CType::UShort, Value::Int(i)) => CValue::U16(*i as u16),
            (CType::Int, Value::Int(i)) => CValue::I32(*i as i32),
            (CType::UInt, Value::Int(i)) => CValue::U32(*i as u32),
            (CType::Long, Value::Int(i)) => {
                if std::mem::size_of::<libc::c_long>() == 8 {
                    CValue::I64(*i)
                } else {
                    CValue::I32(*i as i32)
                }
            }
            (CType::ULong, Value::Int(i)) => {
                if std::mem::size_of::<libc::c_long>() == 8 {
                    CValue::U64(*i as u64)
                } else {
                    CValue::U32(*i as u32)
                }
            }
            (CType::LongLong, Value::Int(i)) => CValue::I64(*i),
            (CType::ULongLong, Value::Int(i)) => CValue::U64(*i as u64),
            (CType::SizeT, Value::Int(i)) => CValue::Usize(*i as usize),
            (CType::Float, Value::Int(i)) => CValue::F32(*i as f32),
            (CType::Float, Value::Float(f)) => CValue::F32(*f as f32),
            (CType::Double, Value::Int(i)) => CValue::F64(*i as f64),
            (CType::Double, Value::Float(f)) => CValue::F64(*f),

            // strings and bytes become owning C-string representations when
            // not already address-backed
            (_, Value::Str(s)) => {
                let cstring = CString::new(s.as_str()).map_err(|e| Error::InvalidString {
                    reason: format!("string contains null byte: {e}"),
                })?;
                let ptr = cstring.as_ptr() as *mut c_void;
                self.cstrings.push(cstring);
                CValue::Ptr(ptr)
            }
            (_, Value::Bytes(b)) => {
                let mut buffer = b.clone();
                buffer.push(0);
                let ptr = buffer.as_ptr() as *mut c_void;
                self.buffers.push(buffer);
                CValue::Ptr(ptr)
            }

            (_, Value::Null) => CValue::Ptr(std::ptr::null_mut()),
            (_, Value::Ptr(p)) => CValue::Ptr(p.address().as_usize() as *mut c_void),

            (CType::Struct(_), Value::Struct(s)) => {
                let buffer = s.backing_bytes();
                let data = buffer.as_ptr();
                self.buffers.push(buffer);
                CValue::Struct { data }
            }

            (CType::FnPtr(_), Value::Callable(spec)) => {
                let handle = CallbackHandle::new(spec, &self.registry)?;
                let code = handle.code_ptr();
                self.callbacks.push(handle);
                CValue::Ptr(code)
            }

            // validate() runs first; anything here is a conversion the call
            // layer cannot express
            (param, value) => {
                return Err(Error::UnsupportedSignature {
                    reason: format!(
                        "cannot convert {} to {}",
                        value.type_name(),
                        param.display_name()
                    ),
                })
            }
        })
    }

    /// Convert a variadic ("format") argument with C default promotions:
    /// integers pass as `int` when they fit, floats as `double`, strings and
    /// byte buffers as C strings, pointers as addresses.
    pub(crate) fn convert_format(&mut self, index: usize, value: &Value) -> Result<(CValue, Type)> {
        Ok(match value {
            Value::Int(i) => {
                if *i >= i64::from(i32::MIN) && *i <= i64::from(i32::MAX) {
                    (CValue::I32(*i as i32), Type::i32())
                } else {
                    (CValue::I64(*i), Type::i64())
                }
            }
            Value::Bool(b) => (CValue::I32(i32::from(*b)), Type::i32()),
            Value::Float(f) => (CValue::F64(*f), Type::f64()),
            Value::Str(_) | Value::Bytes(_) => {
                (self.convert(value, &CType::CharPtr)?, Type::pointer())
            }
            Value::Null => (CValue::Ptr(std::ptr::null_mut()), Type::pointer()),
            Value::Ptr(_) => (self.convert(value, &CType::VoidPtr)?, Type::pointer()),
            Value::Struct(_) | Value::Callable(_) => {
                return Err(Error::InvalidBindingParameter {
                    index,
                    expected: "a format argument".to_string(),
                    got: value.type_name().to_string(),
                })
            }
        })
    }
}

//! Callbacks from C into dynamic closures
//!
//! A [`CallbackSpec`] is a dynamic closure together with the foreign
//! signature it is declared to satisfy. When the marshaller binds one to a
//! function-pointer parameter it builds a [`CallbackHandle`]: a native
//! trampoline matching the target ABI that decodes each received foreign
//! value back to a dynamic value before calling the closure.
//!
//! The handle owns the trampoline and a strong reference to the closure
//! together; both live until the handle is dropped. Callers (the marshal
//! context) retain the handle for the duration of the foreign call.

use std::fmt;
use std::os::raw::c_void;
use std::rc::Rc;

use libffi::low;
use libffi::middle::{Cif, Closure, Type};

use crate::ctype::{CType, FnSig};
use crate::error::{Error, Result};
use crate::pointer::{Address, PtrValue, TypedCPointer, VoidPointer};
use crate::structs::{write_int_at, StructRegistry};
use crate::value::{attempt_decode, Value};

/// Closure type callable from a trampoline.
pub type CallbackFn = Rc<dyn Fn(&[Value]) -> Result<Value>>;

/// A dynamic closure with its declared foreign signature.
#[derive(Clone)]
pub struct CallbackSpec {
    params: Vec<CType>,
    ret: CType,
    func: CallbackFn,
}

impl CallbackSpec {
    pub fn new<F>(params: Vec<CType>, ret: CType, func: F) -> CallbackSpec
    where
        F: Fn(&[Value]) -> Result<Value> + 'static,
    {
        CallbackSpec {
            params,
            ret,
            func: Rc::new(func),
        }
    }

    pub fn params(&self) -> &[CType] {
        &self.params
    }

    pub fn ret(&self) -> &CType {
        &self.ret
    }

    /// Whether the declared signature matches a function-pointer parameter's.
    pub(crate) fn matches(&self, sig: &FnSig) -> bool {
        self.params == sig.params && self.ret == sig.ret
    }

    pub(crate) fn signature_name(&self) -> String {
        CType::FnPtr(Box::new(FnSig {
            params: self.params.clone(),
            ret: self.ret.clone(),
        }))
        .display_name()
    }
}

impl fmt::Debug for CallbackSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<callable {}>", self.signature_name())
    }
}

struct CallbackState {
    params: Vec<CType>,
    ret: CType,
    func: CallbackFn,
}

/// Owns a native trampoline and the closure it dispatches to.
pub struct CallbackHandle {
    code: *mut c_void,
    // Declaration order matters: the closure must drop before the state it
    // borrows.
    _closure: Closure<'static>,
    _state: Box<CallbackState>,
}

impl CallbackHandle {
    /// Build a trampoline for `spec`. The trampoline's call descriptor is
    /// constructed from the declared parameter and return tags; struct
    /// passing by value is not expressible in a callback signature.
    pub fn new(spec: &CallbackSpec, registry: &StructRegistry) -> Result<CallbackHandle> {
        if spec.params.iter().chain([&spec.ret]).any(|t| matches!(t, CType::Struct(_))) {
            return Err(Error::UnsupportedSignature {
                reason: format!(
                    "struct by value in callback signature {}",
                    spec.signature_name()
                ),
            });
        }

        let arg_types: Result<Vec<Type>> =
            spec.params.iter().map(|p| p.ffi_type(registry)).collect();
        let cif = Cif::new(arg_types?, spec.ret.ffi_type(registry)?);

        let state = Box::new(CallbackState {
            params: spec.params.clone(),
            ret: spec.ret.clone(),
            func: Rc::clone(&spec.func),
        });
        // The state box is owned by the handle and outlives the closure; the
        // 'static borrow never escapes the handle.
        let state_ref: &'static CallbackState =
            unsafe { &*(state.as_ref() as *const CallbackState) };

        let closure = Closure::new(cif, trampoline, state_ref);
        let code = *closure.code_ptr() as usize as *mut c_void;

        Ok(CallbackHandle {
            code,
            _closure: closure,
            _state: state,
        })
    }

    /// Function pointer C code can call.
    pub fn code_ptr(&self) -> *mut c_void {
        self.code
    }
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<callback trampoline at {:p}>", self.code)
    }
}

unsafe extern "C" fn trampoline(
    _cif: &low::ffi_cif,
    result: &mut u64,
    args: *const *const c_void,
    state: &CallbackState,
) {
    let mut values = Vec::with_capacity(state.params.len());
    for (i, param) in state.params.iter().enumerate() {
        values.push(decode_received(param, *args.add(i)));
    }

    // A callback cannot propagate an error through the C caller; a failed
    // closure yields the zero value of the declared return type.
    let out = (state.func)(&values).unwrap_or(Value::Null);
    if !matches!(state.ret, CType::Void) {
        *result = 0;
        encode_result(&state.ret, &out, result as *mut u64 as *mut u8);
    }
}

/// Decode one received foreign argument back to a dynamic value.
unsafe fn decode_received(param: &CType, slot: *const c_void) -> Value {
    let base = slot as *const u8;
    match param {
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
        CType::CharPtr => {
            let ptr = *(base as *const *const libc::c_char);
            if ptr.is_null() {
                Value::Null
            } else {
                attempt_decode(std::ffi::CStr::from_ptr(ptr).to_bytes().to_vec())
            }
        }
        CType::Ptr(inner) => {
            let address = *(base as *const usize);
            if address == 0 {
                Value::Null
            } else {
                Value::Ptr(PtrValue::Typed(TypedCPointer::new(
                    Address::new(address),
                    inner.as_ref().clone(),
                )))
            }
        }
        CType::VoidPtr | CType::FnPtr(_) => {
            let address = *(base as *const usize);
            if address == 0 {
                Value::Null
            } else {
                Value::Ptr(PtrValue::Void(VoidPointer::new(Address::new(address))))
            }
        }
        // rejected at handle construction
        CType::Struct(_) | CType::Void => Value::Null,
    }
}

/// Encode the closure's result into the trampoline's return slot.
unsafe fn encode_result(ret: &CType, value: &Value, out: *mut u8) {
    match ret {
        CType::Void => {}
        CType::Float => {
            let f = match value {
                Value::Float(f) => *f as f32,
                Value::Int(i) => *i as f32,
                _ => 0.0,
            };
            *(out as *mut f32) = f;
        }
        CType::Double => {
            let f = match value {
                Value::Float(f) => *f,
                Value::Int(i) => *i as f64,
                _ => 0.0,
            };
            *(out as *mut f64) = f;
        }
        CType::CharPtr | CType::VoidPtr | CType::Ptr(_) | CType::FnPtr(_) => {
            let address = match value {
                Value::Ptr(p) => p.address().as_usize(),
                _ => 0,
            };
            *(out as *mut usize) = address;
        }
        CType::Bool => {
            // integral returns are widened to the full slot
            *(out as *mut u64) = u64::from(matches!(value, Value::Bool(true)));
        }
        _ => {
            let i = match value {
                Value::Int(i) => *i,
                Value::Bool(b) => i64::from(*b),
                Value::Float(f) => *f as i64,
                _ => 0,
            };
            // widen through the full slot first, then overwrite the exact
            // width so both conventions read the same number
            *(out as *mut i64) = i;
            write_int_at(out, ret, i);
        }
    }
}

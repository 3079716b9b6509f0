//! Foreign call construction, invocation and result decoding
//!
//! A [`Binding`] is the reusable product of `bind`: symbol address, declared
//! signature and a prepared call descriptor. Calls run the same pipeline
//! every time — validate, convert, invoke beneath the fault barrier, decode.
//! Foreign calls are positional-only and synchronous; once invoked they
//! cannot be interrupted, only have a fatal signal converted to an error by
//! the barrier.

use std::fmt;
use std::os::raw::c_void;

use libffi::middle::{Cif, CodePtr, Type};
use libffi::raw;
use libloading::Library;

use crate::ctype::CType;
use crate::error::{Error, Result};
use crate::fault;
use crate::ffi::marshal::{self, CValue, MarshalContext};
use crate::pointer::{Address, PtrValue, StructPointer, TypedCPointer, VoidPointer};
use crate::structs::{StructRegistry, StructValue};
use crate::value::{attempt_decode, Value};

/// A bound foreign function.
pub struct Binding {
    name: String,
    code: CodePtr,
    params: Vec<CType>,
    ret: CType,
    cif: Cif,
    registry: StructRegistry,
}

/// Bind `symbol` from a loaded library with the declared signature.
///
/// Struct names in the signature are resolved against the registry here,
/// once; an unregistered name refuses at bind time, not at call time.
pub fn bind(
    library: &Library,
    symbol: &str,
    params: Vec<CType>,
    ret: CType,
    registry: &StructRegistry,
) -> Result<Binding> {
    let code = unsafe {
        let sym: libloading::Symbol<unsafe extern "C" fn()> =
            library
                .get(symbol.as_bytes())
                .map_err(|_| Error::SymbolNotFound {
                    library: "<loaded library>".to_string(),
                    symbol: symbol.to_string(),
                })?;
        CodePtr((*sym) as usize as *mut c_void)
    };
    Binding::from_code(symbol, code, params, ret, registry.clone())
}

/// Bind a symbol whose return is expected to be the named struct.
///
/// The expectation is checked against the declared raw return type at bind
/// time: it must be the struct by value or a pointer to it.
pub fn bind_with_struct_return(
    library: &Library,
    symbol: &str,
    params: Vec<CType>,
    ret: CType,
    expected: &str,
    registry: &StructRegistry,
) -> Result<Binding> {
    let matches_expected = match &ret {
        CType::Struct(name) => name == expected,
        CType::Ptr(inner) => matches!(inner.as_ref(), CType::Struct(name) if name == expected),
        _ => false,
    };
    if !matches_expected {
        return Err(Error::ReturnTypeMismatch {
            expected: expected.to_string(),
            got: ret.display_name(),
        });
    }
    bind(library, symbol, params, ret, registry)
}

impl Binding {
    /// Bind a raw function pointer with the declared signature.
    ///
    /// # Safety
    ///
    /// `fn_ptr` must point to a function whose actual ABI signature matches
    /// `params` and `ret`, and must remain valid for the binding's lifetime.
    pub unsafe fn from_ptr(
        fn_ptr: *const (),
        name: &str,
        params: Vec<CType>,
        ret: CType,
        registry: &StructRegistry,
    ) -> Result<Binding> {
        Binding::from_code(
            name,
            CodePtr(fn_ptr as *mut c_void),
            params,
            ret,
            registry.clone(),
        )
    }

    fn from_code(
        name: &str,
        code: CodePtr,
        params: Vec<CType>,
        ret: CType,
        registry: StructRegistry,
    ) -> Result<Binding> {
        for param in &params {
            param.ensure_parameter()?;
            if let CType::Struct(name) = param {
                registry.get(name)?;
            }
        }
        if let CType::Struct(name) = &ret {
            registry.get(name)?;
        }

        let arg_types: Result<Vec<Type>> =
            params.iter().map(|p| p.ffi_type(&registry)).collect();
        let cif = Cif::new(arg_types?, ret.ffi_type(&registry)?);

        Ok(Binding {
            name: name.to_string(),
            code,
            params,
            ret,
            cif,
            registry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[CType] {
        &self.params
    }

    pub fn ret(&self) -> &CType {
        &self.ret
    }

    /// Run the full pipeline: validate, convert, invoke, decode.
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        marshal::validate(args, &self.params)?;

        let mut ctx = MarshalContext::new(self.registry.clone());
        let cvalues: Result<Vec<CValue>> = args
            .iter()
            .zip(&self.params)
            .map(|(value, param)| ctx.convert(value, param))
            .collect();
        let cvalues = cvalues?;

        fault::guarded(|| unsafe { self.raw_invoke(self.cif.as_raw_ptr(), &cvalues) })?
    }

    /// Call with trailing variadic ("format") arguments, converted
    /// per-argument with C default promotions.
    pub fn call_variadic(&self, args: &[Value], format: &[Value]) -> Result<Value> {
        if matches!(self.ret, CType::Struct(_)) {
            return Err(Error::UnsupportedSignature {
                reason: "struct return on a variadic call".to_string(),
            });
        }
        marshal::validate(args, &self.params)?;

        let mut ctx = MarshalContext::new(self.registry.clone());
        let mut cvalues = Vec::with_capacity(args.len() + format.len());
        for (value, param) in args.iter().zip(&self.params) {
            cvalues.push(ctx.convert(value, param)?);
        }

        let mut all_types: Vec<Type> = self
            .params
            .iter()
            .map(|p| p.ffi_type(&self.registry))
            .collect::<Result<_>>()?;
        for (i, value) in format.iter().enumerate() {
            let (cvalue, ty) = ctx.convert_format(self.params.len() + i + 1, value)?;
            cvalues.push(cvalue);
            all_types.push(ty);
        }

        let ret_type = self.ret.ffi_type(&self.registry)?;
        let mut type_ptrs: Vec<*mut raw::ffi_type> =
            all_types.iter().map(|t| t.as_raw_ptr()).collect();

        let mut var_cif: raw::ffi_cif = unsafe { std::mem::zeroed() };
        let status = unsafe {
            raw::ffi_prep_cif_var(
                &mut var_cif,
                raw::ffi_abi_FFI_DEFAULT_ABI,
                self.params.len() as std::os::raw::c_uint,
                type_ptrs.len() as std::os::raw::c_uint,
                ret_type.as_raw_ptr(),
                type_ptrs.as_mut_ptr(),
            )
        };
        if status != raw::ffi_status_FFI_OK {
            return Err(Error::UnsupportedSignature {
                reason: format!("variadic descriptor for {}", self.name),
            });
        }

        let cif_ptr: *mut raw::ffi_cif = &mut var_cif;
        fault::guarded(|| unsafe { self.raw_invoke(cif_ptr, &cvalues) })?
    }

    /// Invoke through a prepared descriptor and decode the return slot.
    unsafe fn raw_invoke(&self, cif: *mut raw::ffi_cif, cvalues: &[CValue]) -> Result<Value> {
        let mut avalues: Vec<*mut c_void> = cvalues.iter().map(|c| c.raw_ptr()).collect();

        // Return storage: at least one register wide, 8-aligned; integral
        // results narrower than a register are widened by libffi.
        let ret_size = self
            .ret
            .size(&self.registry)?
            .max(std::mem::size_of::<usize>());
        let mut ret_buf = vec![0u64; ret_size.div_ceil(8)];

        raw::ffi_call(
            cif,
            Some(*self.code.as_safe_fun()),
            ret_buf.as_mut_ptr() as *mut c_void,
            avalues.as_mut_ptr(),
        );

        self.decode_return(ret_buf.as_ptr() as *const u8)
    }

    /// Decode the raw return slot per the declared return type.
    unsafe fn decode_return(&self, base: *const u8) -> Result<Value> {
        Ok(match &self.ret {
            CType::Void => Value::Null,
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

            // a returned byte string attempts text decoding, raw on failure
            CType::CharPtr => {
                let ptr = *(base as *const *const libc::c_char);
                if ptr.is_null() {
                    Value::Null
                } else {
                    attempt_decode(std::ffi::CStr::from_ptr(ptr).to_bytes().to_vec())
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

            CType::Ptr(inner) => {
                let address = *(base as *const usize);
                if address == 0 {
                    Value::Null
                } else if let CType::Struct(name) = inner.as_ref() {
                    // registered pointee: materialize a struct value over the
                    // returned memory; unregistered: opaque typed pointer
                    match self.registry.get(name) {
                        Ok(layout) => {
                            let value =
                                StructValue::from_existing(layout, Address::new(address))?;
                            Value::Ptr(PtrValue::Struct(StructPointer::to_existing(value)))
                        }
                        Err(_) => Value::Ptr(PtrValue::Typed(TypedCPointer::new(
                            Address::new(address),
                            inner.as_ref().clone(),
                        ))),
                    }
                } else {
                    Value::Ptr(PtrValue::Typed(TypedCPointer::new(
                        Address::new(address),
                        inner.as_ref().clone(),
                    )))
                }
            }

            CType::Struct(name) => {
                let layout = self.registry.get(name)?;
                let size = layout.size();
                let bytes = std::slice::from_raw_parts(base, size);
                Value::Struct(StructValue::from_bytes(layout, bytes))
            }
        })
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.params.iter().map(|p| p.display_name()).collect();
        write!(
            f,
            "<binding {}({}) -> {}>",
            self.name,
            params.join(", "),
            self.ret.display_name()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::callback::CallbackSpec;

    extern "C" fn test_add(a: libc::c_int, b: libc::c_int) -> libc::c_int {
        a + b
    }

    extern "C" fn test_scale(x: f64, factor: f64) -> f64 {
        x * factor
    }

    extern "C" fn test_strlen(s: *const libc::c_char) -> libc::size_t {
        unsafe { std::ffi::CStr::from_ptr(s).to_bytes().len() }
    }

    extern "C" fn test_apply(
        f: extern "C" fn(libc::c_int) -> libc::c_int,
        x: libc::c_int,
    ) -> libc::c_int {
        f(x)
    }

    fn registry() -> StructRegistry {
        StructRegistry::new()
    }

    #[test]
    fn test_call_int_binding() {
        let binding = unsafe {
            Binding::from_ptr(
                test_add as *const (),
                "test_add",
                vec![CType::Int, CType::Int],
                CType::Int,
                &registry(),
            )
        }
        .unwrap();

        assert_eq!(
            binding.call(&[Value::Int(10), Value::Int(32)]).unwrap(),
            Value::Int(42)
        );
    }

    #[test]
    fn test_call_double_binding() {
        let binding = unsafe {
            Binding::from_ptr(
                test_scale as *const (),
                "test_scale",
                vec![CType::Double, CType::Double],
                CType::Double,
                &registry(),
            )
        }
        .unwrap();

        assert_eq!(
            binding
                .call(&[Value::Float(21.0), Value::Int(2)])
                .unwrap(),
            Value::Float(42.0)
        );
    }

    #[test]
    fn test_call_converts_string_argument() {
        let binding = unsafe {
            Binding::from_ptr(
                test_strlen as *const (),
                "test_strlen",
                vec![CType::CharPtr],
                CType::SizeT,
                &registry(),
            )
        }
        .unwrap();

        assert_eq!(
            binding.call(&[Value::Str("hello".into())]).unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            binding.call(&[Value::Bytes(b"bytes!".to_vec())]).unwrap(),
            Value::Int(6)
        );
    }

    #[test]
    fn test_call_rejects_bad_argument_with_index() {
        let binding = unsafe {
            Binding::from_ptr(
                test_strlen as *const (),
                "test_strlen",
                vec![CType::CharPtr],
                CType::SizeT,
                &registry(),
            )
        }
        .unwrap();

        assert_eq!(
            binding.call(&[Value::Int(3)]).unwrap_err(),
            Error::InvalidBindingParameter {
                index: 1,
                expected: "char*".to_string(),
                got: "int".to_string(),
            }
        );
    }

    #[test]
    fn test_call_arity_checked() {
        let binding = unsafe {
            Binding::from_ptr(
                test_add as *const (),
                "test_add",
                vec![CType::Int, CType::Int],
                CType::Int,
                &registry(),
            )
        }
        .unwrap();

        assert_eq!(
            binding.call(&[Value::Int(1)]).unwrap_err(),
            Error::ArityMismatch {
                expected: 2,
                got: 1,
            }
        );
    }

    #[test]
    fn test_callback_round_trip() {
        let binding = unsafe {
            Binding::from_ptr(
                test_apply as *const (),
                "test_apply",
                vec![
                    CType::FnPtr(Box::new(crate::ctype::FnSig {
                        params: vec![CType::Int],
                        ret: CType::Int,
                    })),
                    CType::Int,
                ],
                CType::Int,
                &registry(),
            )
        }
        .unwrap();

        let triple = CallbackSpec::new(vec![CType::Int], CType::Int, |args| {
            match &args[0] {
                Value::Int(x) => Ok(Value::Int(x * 3)),
                _ => Ok(Value::Int(0)),
            }
        });

        assert_eq!(
            binding
                .call(&[Value::Callable(triple), Value::Int(14)])
                .unwrap(),
            Value::Int(42)
        );
    }

    #[test]
    fn test_bind_time_struct_resolution() {
        let err = Binding::from_code(
            "wants_struct",
            CodePtr(std::ptr::null_mut()),
            vec![CType::Struct("missing".to_string())],
            CType::Void,
            registry(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            Error::UnknownStruct {
                name: "missing".to_string(),
            }
        );
    }
}

//! Foreign bindings end to end: validation, conversion, struct decoding,
//! callbacks and variadic calls against the platform C runtime.

#![cfg(unix)]

use pretty_assertions::assert_eq;

use ferrule_runtime::{
    calloc, cast, free, malloc, to_struct_ptr, CRuntime, CType, CallbackSpec, Dereference, Error,
    PointerBase, PtrValue, StructLayout, StructRegistry, StructValue, Value,
};
use std::rc::Rc;

fn runtime() -> CRuntime {
    CRuntime::load().unwrap()
}

#[test]
fn test_char_pointer_parameter_rejects_plain_integer() {
    let c = runtime();
    let err = c.strlen(&Value::Int(5)).unwrap_err();
    assert_eq!(
        err,
        Error::InvalidBindingParameter {
            index: 1,
            expected: "char*".to_string(),
            got: "int".to_string(),
        }
    );
}

#[test]
fn test_string_likes_cross_the_boundary() {
    let c = runtime();
    assert_eq!(c.strlen(&Value::Str("hello".into())).unwrap(), 5);
    assert_eq!(c.strlen(&Value::Bytes(b"1234".to_vec())).unwrap(), 4);

    // an address-backed buffer passes without copying
    let buffer = malloc(8).unwrap();
    buffer.write(&Value::Str("abc".into())).unwrap();
    buffer.offset(3).unwrap().write_bytes(&[0]).unwrap();
    assert_eq!(
        c.strlen(&Value::Ptr(PtrValue::Allocated(buffer.clone())))
            .unwrap(),
        3
    );
    free(&buffer).unwrap();
}

#[test]
fn test_div_decodes_struct_by_value() {
    let c = runtime();
    let result = c.div(7, 2).unwrap();
    assert_eq!(result.get("quot").unwrap(), Value::Int(3));
    assert_eq!(result.get("rem").unwrap(), Value::Int(1));

    let negative = c.div(-9, 4).unwrap();
    assert_eq!(negative.get("quot").unwrap(), Value::Int(-2));
    assert_eq!(negative.get("rem").unwrap(), Value::Int(-1));
}

#[test]
fn test_ldiv_uses_long_fields() {
    let c = runtime();
    let result = c.ldiv(5_000_000_007, 2).unwrap();
    assert_eq!(result.get("quot").unwrap(), Value::Int(2_500_000_003));
    assert_eq!(result.get("rem").unwrap(), Value::Int(1));
}

#[test]
fn test_gmtime_decodes_struct_pointer() {
    let c = runtime();
    let now = c.time(&Value::Null).unwrap();
    assert!(now > 0);

    let slot = malloc(8).unwrap();
    slot.write(&Value::Int(0)).unwrap();
    let epoch = c
        .gmtime(&Value::Ptr(PtrValue::Allocated(slot.clone())))
        .unwrap();

    // the unix epoch is Thu Jan 1 1970 00:00:00 UTC
    let tm = epoch.value();
    assert_eq!(tm.get("tm_year").unwrap(), Value::Int(70));
    assert_eq!(tm.get("tm_mon").unwrap(), Value::Int(0));
    assert_eq!(tm.get("tm_mday").unwrap(), Value::Int(1));
    assert_eq!(tm.get("tm_hour").unwrap(), Value::Int(0));
    assert_eq!(tm.get("tm_wday").unwrap(), Value::Int(4));
    free(&slot).unwrap();
}

#[test]
fn test_qsort_through_callback_trampoline() {
    let c = runtime();
    let int_size = std::mem::size_of::<libc::c_int>();

    let values: [libc::c_int; 5] = [42, -3, 17, 0, 9];
    let array = calloc(values.len(), int_size).unwrap();
    for (i, v) in values.iter().enumerate() {
        array.at(i).unwrap().write_bytes(&v.to_ne_bytes()).unwrap();
    }

    // comparator receives void* slots; read each as int through a cast
    let compare = CallbackSpec::new(
        vec![CType::VoidPtr, CType::VoidPtr],
        CType::Int,
        |args| {
            let read = |value: &Value| -> i64 {
                match value {
                    Value::Ptr(PtrValue::Void(p)) => {
                        match cast(p, CType::Int).and_then(|t| t.dereference()) {
                            Ok(Value::Int(i)) => i,
                            _ => 0,
                        }
                    }
                    _ => 0,
                }
            };
            Ok(Value::Int(read(&args[0]) - read(&args[1])))
        },
    );

    c.qsort(
        &Value::Ptr(PtrValue::Allocated(array.base_pointer())),
        values.len(),
        int_size,
        compare,
    )
    .unwrap();

    let sorted: Vec<i64> = (0..values.len())
        .map(|i| {
            let bytes = array.at(i).unwrap().read_bytes(int_size).unwrap();
            i64::from(libc::c_int::from_ne_bytes(bytes.try_into().unwrap()))
        })
        .collect();
    assert_eq!(sorted, vec![-3, 0, 9, 17, 42]);
    array.free().unwrap();
}

#[test]
fn test_snprintf_variadic_formatting() {
    let c = runtime();
    let buffer = malloc(64).unwrap();

    let expected = "answer=42 (0.5)";
    let written = c
        .snprintf(
            &Value::Ptr(PtrValue::Allocated(buffer.clone())),
            64,
            "%s=%d (%.1f)",
            &[
                Value::Str("answer".into()),
                Value::Int(42),
                Value::Float(0.5),
            ],
        )
        .unwrap();
    assert_eq!(written as usize, expected.len());

    let text = buffer.read_bytes(written as usize).unwrap();
    assert_eq!(String::from_utf8(text).unwrap(), expected.to_string());
    free(&buffer).unwrap();
}

#[test]
fn test_struct_mutation_shares_backing_with_pointer() {
    let registry = StructRegistry::new();
    let layout = Rc::new(
        StructLayout::builder("pair")
            .field("a", CType::Int)
            .field("b", CType::Int)
            .build(&registry)
            .unwrap(),
    );

    let pair = StructValue::new(layout, &[Value::Int(1), Value::Int(2)]).unwrap();
    assert_eq!(pair.get("a").unwrap(), Value::Int(1));
    assert_eq!(pair.get("b").unwrap(), Value::Int(2));

    let ptr = to_struct_ptr(&pair);
    ptr.value().set("a", &Value::Int(99)).unwrap();

    // no silent copy divergence: the original value observes the mutation
    assert_eq!(pair.get("a").unwrap(), Value::Int(99));
    assert_eq!(ptr.address(), pair.address());
}

#[test]
fn test_callback_signature_mismatch_is_a_binding_error() {
    let c = runtime();
    let wrong = CallbackSpec::new(vec![CType::Double], CType::Int, |_| Ok(Value::Int(0)));

    let err = c
        .qsort(&Value::Null, 0, 1, wrong)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidBindingParameter { index: 4, .. }
    ));
}

#[test]
fn test_toupper_round_trip() {
    let c = runtime();
    assert_eq!(c.toupper(i64::from(b'x')).unwrap(), i64::from(b'X'));
    assert_eq!(c.tolower(i64::from(b'X')).unwrap(), i64::from(b'x'));
}

//! Struct layouts and struct values
//!
//! [`StructLayout`] is the table form of a struct declaration: an ordered
//! list of named, typed fields with C-ABI offsets computed at build time.
//! [`StructValue`] is a value over backing bytes laid out by a layout —
//! either bytes this crate owns, or existing foreign bytes it aliases.
//! [`StructRegistry`] maps layout names to layouts so result decoding can
//! recognize pointers to known structs.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::ctype::CType;
use crate::error::{Error, Result};
use crate::pointer::{Address, PtrValue, StructPointer, TypedCPointer, VoidPointer};
use crate::value::{attempt_decode, Value};

/// One field of a struct layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub ctype: CType,
    /// Layout of a by-value nested struct field, resolved at build time.
    #[serde(skip)]
    pub(crate) nested: Option<Rc<StructLayout>>,
}

/// Ordered field layout of a C struct, with ABI offsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructLayout {
    name: String,
    fields: Vec<FieldSpec>,
    offsets: Vec<usize>,
    size: usize,
    align: usize,
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

impl StructLayout {
    pub fn builder(name: impl Into<String>) -> StructLayoutBuilder {
        StructLayoutBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Field spec and byte offset by name.
    pub fn field(&self, name: &str) -> Result<(&FieldSpec, usize)> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(|i| (&self.fields[i], self.offsets[i]))
            .ok_or_else(|| Error::UnknownField {
                name: self.name.clone(),
                field: name.to_string(),
            })
    }

    /// libffi structure type matching this layout.
    pub(crate) fn ffi_type(
        &self,
        registry: &StructRegistry,
    ) -> Result<libffi::middle::Type> {
        let fields: Result<Vec<_>> = self
            .fields
            .iter()
            .map(|f| f.ctype.ffi_type(registry))
            .collect();
        Ok(libffi::middle::Type::structure(fields?))
    }
}

/// Declarative builder producing a [`StructLayout`] with C-ABI offsets.
pub struct StructLayoutBuilder {
    name: String,
    fields: Vec<(String, CType)>,
}

impl StructLayoutBuilder {
    pub fn field(mut self, name: impl Into<String>, ctype: CType) -> Self {
        self.fields.push((name.into(), ctype));
        self
    }

    /// Compute offsets and register the finished layout.
    pub fn register(self, registry: &StructRegistry) -> Result<Rc<StructLayout>> {
        let layout = self.build(registry)?;
        Ok(registry.register(layout))
    }

    /// Compute offsets against already-registered layouts.
    pub fn build(self, registry: &StructRegistry) -> Result<StructLayout> {
        let mut fields = Vec::with_capacity(self.fields.len());
        let mut offsets = Vec::with_capacity(self.fields.len());
        let mut offset = 0usize;
        let mut max_align = 1usize;

        for (name, ctype) in self.fields {
            ctype.ensure_parameter()?;
            let size = ctype.size(registry)?;
            let align = ctype.align(registry)?.max(1);

            offset = align_up(offset, align);
            offsets.push(offset);
            offset += size;
            max_align = max_align.max(align);

            let nested = match &ctype {
                CType::Struct(n) => Some(registry.get(n)?),
                _ => None,
            };
            fields.push(FieldSpec {
                name,
                ctype,
                nested,
            });
        }

        Ok(StructLayout {
            name: self.name,
            fields,
            offsets,
            size: align_up(offset.max(1), max_align),
            align: max_align,
        })
    }
}

/// Registered struct layouts, consulted when decoding foreign results.
/// Cheap to clone; all clones share one table.
#[derive(Debug, Clone, Default)]
pub struct StructRegistry {
    inner: Rc<RefCell<HashMap<String, Rc<StructLayout>>>>,
}

impl StructRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, layout: StructLayout) -> Rc<StructLayout> {
        let layout = Rc::new(layout);
        self.inner
            .borrow_mut()
            .insert(layout.name.clone(), Rc::clone(&layout));
        layout
    }

    pub fn get(&self, name: &str) -> Result<Rc<StructLayout>> {
        self.inner
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownStruct {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.borrow().contains_key(name)
    }
}

/// Aligned heap buffer for struct backing bytes.
struct AlignedBytes {
    ptr: *mut u8,
    layout: std::alloc::Layout,
}

impl AlignedBytes {
    fn zeroed(size: usize, align: usize) -> AlignedBytes {
        let layout = std::alloc::Layout::from_size_align(size.max(1), align.max(1))
            .expect("struct layout sizes are small and aligned");
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "allocation failed");
        AlignedBytes { ptr, layout }
    }
}

impl Drop for AlignedBytes {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

impl fmt::Debug for AlignedBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AlignedBytes({} bytes)", self.layout.size())
    }
}

#[derive(Debug)]
enum Backing {
    /// Bytes owned by this value.
    Owned(AlignedBytes),
    /// Existing foreign bytes this value aliases.
    Foreign(usize),
}

#[derive(Debug)]
struct StructInner {
    layout: Rc<StructLayout>,
    backing: Backing,
}

/// A struct value over C-ABI backing bytes.
///
/// Clones share the backing, so mutation through any clone (or through a
/// [`StructPointer`] aliasing the value) is visible everywhere — there is no
/// silent copy to diverge from.
#[derive(Debug, Clone)]
pub struct StructValue {
    inner: Rc<StructInner>,
}

impl StructValue {
    /// Build a value with owned, zeroed backing and the given field values
    /// in declaration order.
    pub fn new(layout: Rc<StructLayout>, values: &[Value]) -> Result<StructValue> {
        if values.len() != layout.fields.len() {
            return Err(Error::ArityMismatch {
                expected: layout.fields.len(),
                got: values.len(),
            });
        }
        let value = StructValue {
            inner: Rc::new(StructInner {
                backing: Backing::Owned(AlignedBytes::zeroed(layout.size, layout.align)),
                layout,
            }),
        };
        let names: Vec<String> = value
            .inner
            .layout
            .fields
            .iter()
            .map(|f| f.name.clone())
            .collect();
        for (name, v) in names.iter().zip(values) {
            value.set(name, v)?;
        }
        Ok(value)
    }

    /// Build a value with owned backing initialized from raw bytes, e.g. a
    /// struct returned by value from a foreign call.
    pub(crate) fn from_bytes(layout: Rc<StructLayout>, bytes: &[u8]) -> StructValue {
        let backing = AlignedBytes::zeroed(layout.size, layout.align);
        let len = bytes.len().min(layout.size);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), backing.ptr, len);
        }
        StructValue {
            inner: Rc::new(StructInner {
                layout,
                backing: Backing::Owned(backing),
            }),
        }
    }

    /// Build a value over an existing foreign struct's backing bytes.
    /// The bytes are aliased, not copied; they must stay valid while the
    /// value (or any pointer derived from it) is in use.
    pub fn from_existing(layout: Rc<StructLayout>, address: Address) -> Result<StructValue> {
        if address.is_null() {
            return Err(Error::NullPointer);
        }
        Ok(StructValue {
            inner: Rc::new(StructInner {
                layout,
                backing: Backing::Foreign(address.as_usize()),
            }),
        })
    }

    pub fn layout(&self) -> &Rc<StructLayout> {
        &self.inner.layout
    }

    /// Address of the backing bytes.
    pub fn address(&self) -> Address {
        Address::new(self.data_ptr() as usize)
    }

    pub(crate) fn data_ptr(&self) -> *mut u8 {
        match &self.inner.backing {
            Backing::Owned(bytes) => bytes.ptr,
            Backing::Foreign(address) => *address as *mut u8,
        }
    }

    /// Copy of the backing bytes, used for struct-by-value arguments.
    pub fn backing_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.inner.layout.size];
        unsafe {
            std::ptr::copy_nonoverlapping(self.data_ptr(), out.as_mut_ptr(), out.len());
        }
        out
    }

    /// Read a field. Pointer-typed fields to struct types wrap as typed
    /// pointers; use [`StructValue::get_with`] to resolve them against a
    /// registry of known layouts.
    pub fn get(&self, field: &str) -> Result<Value> {
        self.get_with(field, &StructRegistry::new())
    }

    /// Read a field, auto-wrapping pointer-typed fields as void, typed or
    /// struct pointers depending on whether the pointee is registered.
    pub fn get_with(&self, field: &str, registry: &StructRegistry) -> Result<Value> {
        let (spec, offset) = self.inner.layout.field(field)?;
        let base = unsafe { self.data_ptr().add(offset) };

        unsafe {
            Ok(match &spec.ctype {
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
                        match registry.get(name) {
                            Ok(layout) => {
                                let value =
                                    StructValue::from_existing(layout, Address::new(address))?;
                                Value::Ptr(PtrValue::Struct(StructPointer::to_existing(value)))
                            }
                            Err(_) => Value::Ptr(PtrValue::Typed(TypedCPointer::new(
                                Address::new(address),
                                CType::VoidPtr,
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
                    let layout = match &spec.nested {
                        Some(layout) => Rc::clone(layout),
                        None => registry.get(name)?,
                    };
                    let address = Address::new(base as usize);
                    Value::Struct(StructValue::from_existing(layout, address)?)
                }
                CType::Void => Value::Null,
            })
        }
    }

    /// Write a field. Integers are range-checked against the field type;
    /// pointer fields take pointer values or null.
    pub fn set(&self, field: &str, value: &Value) -> Result<()> {
        let (spec, offset) = self.inner.layout.field(field)?;
        let base = unsafe { self.data_ptr().add(offset) };

        let type_mismatch = || Error::TypeMismatch {
            expected: spec.ctype.display_name(),
            got: value.type_name().to_string(),
        };

        unsafe {
            match (&spec.ctype, value) {
                (CType::Bool, Value::Bool(b)) => *base = u8::from(*b),
                (ctype, Value::Int(i)) if ctype.int_range().is_some() => {
                    let (min, max) = ctype.int_range().unwrap();
                    if *i < min || *i > max {
                        return Err(Error::NumberOutOfRange {
                            value: *i,
                            target: ctype.display_name(),
                        });
                    }
                    write_int_at(base, ctype, *i);
                }
                (CType::Float, Value::Float(f)) => *(base as *mut f32) = *f as f32,
                (CType::Double, Value::Float(f)) => *(base as *mut f64) = *f,
                (CType::Float, Value::Int(i)) => *(base as *mut f32) = *i as f32,
                (CType::Double, Value::Int(i)) => *(base as *mut f64) = *i as f64,
                (ctype, Value::Ptr(p)) if ctype.is_pointer_like() => {
                    *(base as *mut usize) = p.address().as_usize();
                }
                (ctype, Value::Null) if ctype.is_pointer_like() => {
                    *(base as *mut usize) = 0;
                }
                (CType::Struct(_), Value::Struct(s)) => {
                    if s.layout().size() != spec.nested.as_ref().map_or(0, |l| l.size()) {
                        return Err(type_mismatch());
                    }
                    std::ptr::copy_nonoverlapping(s.data_ptr(), base, s.layout().size());
                }
                _ => return Err(type_mismatch()),
            }
        }
        Ok(())
    }
}

/// Write an integer at `base` with the width of `ctype`. Caller has already
/// range-checked `value` and must guarantee `base` is writable.
pub(crate) unsafe fn write_int_at(base: *mut u8, ctype: &CType, value: i64) {
    match ctype {
        CType::Bool | CType::UChar => *base = value as u8,
        CType::Char => *(base as *mut i8) = value as i8,
        CType::Short => *(base as *mut libc::c_short) = value as libc::c_short,
        CType::UShort => *(base as *mut libc::c_ushort) = value as libc::c_ushort,
        CType::Int => *(base as *mut libc::c_int) = value as libc::c_int,
        CType::UInt => *(base as *mut libc::c_uint) = value as libc::c_uint,
        CType::Long => *(base as *mut libc::c_long) = value as libc::c_long,
        CType::ULong => *(base as *mut libc::c_ulong) = value as libc::c_ulong,
        CType::LongLong => *(base as *mut libc::c_longlong) = value,
        CType::ULongLong => *(base as *mut libc::c_ulonglong) = value as libc::c_ulonglong,
        CType::SizeT => *(base as *mut libc::size_t) = value as libc::size_t,
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer::PointerBase;

    fn int_pair_layout() -> Rc<StructLayout> {
        Rc::new(
            StructLayout::builder("pair")
                .field("a", CType::Int)
                .field("b", CType::Int)
                .build(&StructRegistry::new())
                .unwrap(),
        )
    }

    #[test]
    fn test_layout_offsets_simple() {
        let layout = int_pair_layout();
        assert_eq!(layout.field("a").unwrap().1, 0);
        assert_eq!(layout.field("b").unwrap().1, 4);
        assert_eq!(layout.size(), 8);
        assert_eq!(layout.align(), 4);
    }

    #[test]
    fn test_layout_offsets_with_padding() {
        let layout = StructLayout::builder("padded")
            .field("tag", CType::Char)
            .field("value", CType::Double)
            .build(&StructRegistry::new())
            .unwrap();
        assert_eq!(layout.field("tag").unwrap().1, 0);
        assert_eq!(layout.field("value").unwrap().1, 8);
        assert_eq!(layout.size(), 16);
    }

    #[test]
    fn test_struct_value_round_trip() {
        let value =
            StructValue::new(int_pair_layout(), &[Value::Int(1), Value::Int(2)]).unwrap();
        assert_eq!(value.get("a").unwrap(), Value::Int(1));
        assert_eq!(value.get("b").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_mutation_is_visible_through_aliases() {
        let value =
            StructValue::new(int_pair_layout(), &[Value::Int(1), Value::Int(2)]).unwrap();
        let alias = value.clone();

        value.set("a", &Value::Int(42)).unwrap();
        assert_eq!(alias.get("a").unwrap(), Value::Int(42));

        // an aliasing view over the same backing sees the mutation too
        let view =
            StructValue::from_existing(Rc::clone(value.layout()), value.address()).unwrap();
        assert_eq!(view.get("a").unwrap(), Value::Int(42));
    }

    #[test]
    fn test_field_range_check() {
        let value =
            StructValue::new(int_pair_layout(), &[Value::Int(0), Value::Int(0)]).unwrap();
        assert!(matches!(
            value.set("a", &Value::Int(i64::from(i32::MAX) + 1)),
            Err(Error::NumberOutOfRange { .. })
        ));
    }

    #[test]
    fn test_unknown_field() {
        let value =
            StructValue::new(int_pair_layout(), &[Value::Int(0), Value::Int(0)]).unwrap();
        assert!(matches!(
            value.get("missing"),
            Err(Error::UnknownField { .. })
        ));
    }

    #[test]
    fn test_nested_struct_field() {
        let registry = StructRegistry::new();
        StructLayout::builder("pair")
            .field("a", CType::Int)
            .field("b", CType::Int)
            .register(&registry)
            .unwrap();
        let outer = StructLayout::builder("outer")
            .field("tag", CType::Int)
            .field("inner", CType::Struct("pair".to_string()))
            .build(&registry)
            .unwrap();

        assert_eq!(outer.field("inner").unwrap().1, 4);
        assert_eq!(outer.size(), 12);

        let value = StructValue::new(
            Rc::new(outer),
            &[
                Value::Int(7),
                Value::Struct(
                    StructValue::new(
                        registry.get("pair").unwrap(),
                        &[Value::Int(1), Value::Int(2)],
                    )
                    .unwrap(),
                ),
            ],
        )
        .unwrap();

        let inner = match value.get("inner").unwrap() {
            Value::Struct(s) => s,
            other => panic!("expected struct field, got {other:?}"),
        };
        assert_eq!(inner.get("b").unwrap(), Value::Int(2));
    }

    #[test]
    fn test_pointer_field_wrapping() {
        let registry = StructRegistry::new();
        let layout = StructLayout::builder("holder")
            .field("next", CType::Ptr(Box::new(CType::Int)))
            .build(&registry)
            .unwrap();

        let value = StructValue::new(Rc::new(layout), &[Value::Null]).unwrap();
        assert_eq!(value.get("next").unwrap(), Value::Null);

        let target: libc::c_int = 9;
        let address = Address::new(&target as *const libc::c_int as usize);
        value
            .set(
                "next",
                &Value::Ptr(PtrValue::Typed(TypedCPointer::new(address, CType::Int))),
            )
            .unwrap();

        match value.get("next").unwrap() {
            Value::Ptr(PtrValue::Typed(p)) => assert_eq!(p.address(), address),
            other => panic!("expected typed pointer, got {other:?}"),
        }
    }
}

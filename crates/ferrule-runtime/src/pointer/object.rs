//! Pointers into the managed-object heap
//!
//! An [`ObjectPointer`] holds exactly one reference claim on its slot for its
//! entire lifetime once non-null. The claim is taken at construction (or when
//! repointed) and released exactly once, on drop or explicit nulling. Clones
//! take a fresh claim of their own.

use std::fmt;

use crate::error::{Error, Result};
use crate::heap::ManagedHeap;
use crate::pointer::{Address, Dereference, PointerBase, PointerKind};
use crate::value::{Value, ValueKind};

/// Handle to a value in the managed-object heap.
pub struct ObjectPointer {
    heap: ManagedHeap,
    address: Address,
    kind: ValueKind,
}

impl ObjectPointer {
    /// Capture a value into the heap and point at it, taking one claim.
    ///
    /// Fails with [`Error::NullPointer`] when the value resolves to the null
    /// address (the null value has no slot to claim).
    pub fn to_ptr(heap: &ManagedHeap, value: Value) -> Result<ObjectPointer> {
        if matches!(value, Value::Null) {
            return Err(Error::NullPointer);
        }
        let kind = value.kind();
        let address = heap.insert(value);
        heap.add_ref(address)?;
        Ok(ObjectPointer {
            heap: heap.clone(),
            address,
            kind,
        })
    }

    /// A null pointer of the given kind. Holds no claim.
    pub fn null(heap: &ManagedHeap, kind: ValueKind) -> ObjectPointer {
        ObjectPointer {
            heap: heap.clone(),
            address: Address::NULL,
            kind,
        }
    }

    /// Kind of value the pointer looks at.
    pub fn value_kind(&self) -> ValueKind {
        self.kind
    }

    /// Point at the target's address instead, without copying memory.
    ///
    /// Takes a claim on the new address, then releases the claim on the old
    /// one. Fails with [`Error::TypeMismatch`] when the kinds differ.
    pub fn assign(&mut self, target: &ObjectPointer) -> Result<()> {
        if target.kind != self.kind {
            return Err(Error::TypeMismatch {
                expected: self.kind.name().to_string(),
                got: target.kind.name().to_string(),
            });
        }
        let new = target.ensure()?;
        self.heap.add_ref(new)?;
        self.release();
        self.address = new;
        Ok(())
    }

    /// Null the pointer, releasing its claim immediately.
    pub fn clear(&mut self) {
        self.release();
        self.address = Address::NULL;
    }

    /// Replace the referent's stored value in place with the donor's.
    ///
    /// Every pointer at this address observes the new value. The donor must
    /// hold the same kind, and its byte representation may not exceed the
    /// recipient's unless `unsafe_size` is given. Claims on both slots are
    /// untouched: claims attach to addresses, not to the bytes moved.
    pub fn move_from(&self, donor: &ObjectPointer, unsafe_size: bool) -> Result<()> {
        if donor.kind != self.kind {
            return Err(Error::TypeMismatch {
                expected: self.kind.name().to_string(),
                got: donor.kind.name().to_string(),
            });
        }
        let value = donor.dereference()?;
        self.move_value(value, unsafe_size)
    }

    /// [`ObjectPointer::move_from`] for a bare value.
    pub fn move_value(&self, value: Value, unsafe_size: bool) -> Result<()> {
        let address = self.ensure()?;
        let current = self.heap.get(address)?;

        let needed = value.byte_size();
        let available = current.byte_size();
        if needed > available && !unsafe_size {
            return Err(Error::InvalidSize { needed, available });
        }

        self.heap.replace(address, value)
    }

    fn release(&mut self) {
        if !self.address.is_null() {
            // Slot may already be gone if claims were force-set; releasing a
            // dead slot is a no-op rather than an error on this path.
            let _ = self.heap.remove_ref(self.address);
        }
    }
}

impl PointerBase for ObjectPointer {
    fn address(&self) -> Address {
        self.address
    }

    fn kind(&self) -> PointerKind {
        PointerKind::Object
    }
}

impl Dereference for ObjectPointer {
    /// Fails with [`Error::NullPointer`] when null and [`Error::Dereference`]
    /// when the address no longer resolves to a live slot.
    fn dereference(&self) -> Result<Value> {
        let address = self.ensure()?;
        self.heap.get(address)
    }
}

impl Clone for ObjectPointer {
    /// Cloning takes a fresh claim so every live pointer holds exactly one.
    fn clone(&self) -> Self {
        if !self.address.is_null() {
            let _ = self.heap.add_ref(self.address);
        }
        ObjectPointer {
            heap: self.heap.clone(),
            address: self.address,
            kind: self.kind,
        }
    }
}

impl Drop for ObjectPointer {
    fn drop(&mut self) {
        self.release();
    }
}

impl PartialEq for ObjectPointer {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl fmt::Debug for ObjectPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<pointer to {} object at {}>",
            self.kind.name(),
            self.address
        )
    }
}

/// An object pointer that cannot be repointed.
///
/// Read operations are available through `Deref`; `assign` and `clear`
/// require `&mut ObjectPointer` and are therefore unreachable, making the
/// frozen property a compile-time guarantee rather than a runtime error.
pub struct FrozenPointer(ObjectPointer);

impl FrozenPointer {
    pub fn to_const_ptr(heap: &ManagedHeap, value: Value) -> Result<FrozenPointer> {
        Ok(FrozenPointer(ObjectPointer::to_ptr(heap, value)?))
    }
}

impl std::ops::Deref for FrozenPointer {
    type Target = ObjectPointer;

    fn deref(&self) -> &ObjectPointer {
        &self.0
    }
}

impl fmt::Debug for FrozenPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<frozen pointer to {} object at {}>",
            self.0.kind.name(),
            self.0.address
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> ManagedHeap {
        ManagedHeap::new()
    }

    #[test]
    fn test_identity_round_trip() {
        let heap = heap();
        for v in [
            Value::Int(42),
            Value::Float(1.5),
            Value::Bool(true),
            Value::Str("hello".into()),
            Value::Bytes(vec![1, 2, 3]),
        ] {
            let ptr = ObjectPointer::to_ptr(&heap, v.clone()).unwrap();
            assert_eq!(ptr.dereference().unwrap(), v);
        }
    }

    #[test]
    fn test_to_ptr_rejects_null_value() {
        let heap = heap();
        assert_eq!(
            ObjectPointer::to_ptr(&heap, Value::Null).unwrap_err(),
            Error::NullPointer
        );
    }

    #[test]
    fn test_null_pointer_dereference() {
        let heap = heap();
        let ptr = ObjectPointer::null(&heap, ValueKind::Int);
        assert_eq!(ptr.dereference().unwrap_err(), Error::NullPointer);
    }

    #[test]
    fn test_assign_repoints_without_copy() {
        let heap = heap();
        let mut a = ObjectPointer::to_ptr(&heap, Value::Int(1)).unwrap();
        let b = ObjectPointer::to_ptr(&heap, Value::Int(2)).unwrap();

        a.assign(&b).unwrap();
        assert_eq!(a.address(), b.address());
        assert_eq!(a.dereference().unwrap(), Value::Int(2));
    }

    #[test]
    fn test_assign_type_mismatch() {
        let heap = heap();
        let mut a = ObjectPointer::to_ptr(&heap, Value::Int(1)).unwrap();
        let b = ObjectPointer::to_ptr(&heap, Value::Str("x".into())).unwrap();

        assert!(matches!(
            a.assign(&b).unwrap_err(),
            Error::TypeMismatch { .. }
        ));
    }

    #[test]
    fn test_move_replaces_in_place_for_all_aliases() {
        let heap = heap();
        let a = ObjectPointer::to_ptr(&heap, Value::Int(1)).unwrap();
        let alias = a.clone();
        let donor = ObjectPointer::to_ptr(&heap, Value::Int(9)).unwrap();

        a.move_from(&donor, false).unwrap();
        assert_eq!(alias.dereference().unwrap(), Value::Int(9));
    }

    #[test]
    fn test_move_size_check() {
        let heap = heap();
        let small = ObjectPointer::to_ptr(&heap, Value::Str("ab".into())).unwrap();
        let big = ObjectPointer::to_ptr(&heap, Value::Str("abcdef".into())).unwrap();

        assert_eq!(
            small.move_from(&big, false).unwrap_err(),
            Error::InvalidSize {
                needed: 6,
                available: 2,
            }
        );
        // the unsafe override permits the oversized move
        small.move_from(&big, true).unwrap();
        assert_eq!(small.dereference().unwrap(), Value::Str("abcdef".into()));
    }

    #[test]
    fn test_claims_pair_with_releases() {
        let heap = heap();
        {
            let ptr = ObjectPointer::to_ptr(&heap, Value::Int(1)).unwrap();
            let _alias = ptr.clone();
            assert_eq!(heap.live_count(), 1);
            assert_eq!(heap.ref_count(ptr.address()).unwrap(), 2);
        }
        // both pointers dropped: claim count hit zero, slot reclaimed
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_clear_releases_claim_once() {
        let heap = heap();
        let mut ptr = ObjectPointer::to_ptr(&heap, Value::Int(1)).unwrap();
        ptr.clear();
        assert_eq!(heap.live_count(), 0);
        assert!(ptr.is_null());
        // drop after clear must not release a second time
    }

    #[test]
    fn test_dead_address_dereference() {
        let heap = heap();
        let ptr = ObjectPointer::to_ptr(&heap, Value::Int(1)).unwrap();
        let stale = ptr.clone();
        heap.set_ref(ptr.address(), 0).unwrap();

        assert!(matches!(
            stale.dereference().unwrap_err(),
            Error::Dereference { .. }
        ));
    }

    #[test]
    fn test_pointer_equality_is_address_equality() {
        let heap = heap();
        let a = ObjectPointer::to_ptr(&heap, Value::Int(1)).unwrap();
        let b = a.clone();
        let c = ObjectPointer::to_ptr(&heap, Value::Int(1)).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_frozen_pointer_reads() {
        let heap = heap();
        let ptr = FrozenPointer::to_const_ptr(&heap, Value::Int(3)).unwrap();
        assert_eq!(ptr.dereference().unwrap(), Value::Int(3));
        // no `assign` is reachable through a FrozenPointer
    }
}

//! Managed-object heap
//!
//! An arena of owned slots addressed by opaque handles. Object pointers hold
//! reference claims on slots; a slot is reclaimed when its claim count drops
//! to zero, and its address is never reused afterwards. This is the safe
//! stand-in for "address of an arbitrary live object": every managed address
//! this crate hands out resolves through the arena, never through raw memory.
//!
//! The reference-count primitives (`add_ref`, `remove_ref`, `set_ref`)
//! mirror the native pair consumed by the original system, realized here as
//! arena operations.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::pointer::Address;
use crate::value::Value;

#[derive(Debug)]
struct Slot {
    value: Value,
    refs: usize,
}

#[derive(Debug, Default)]
struct HeapInner {
    // Slot index + 1 is the slot's address; reclaimed slots become tombstones
    // so addresses stay dead rather than dangling onto a new value.
    slots: Vec<Option<Slot>>,
}

impl HeapInner {
    fn slot(&self, address: Address) -> Result<&Slot> {
        self.slots
            .get(address.as_usize().wrapping_sub(1))
            .and_then(|s| s.as_ref())
            .ok_or_else(|| Error::Dereference {
                reason: format!("address {address} does not resolve to a live value"),
            })
    }

    fn slot_mut(&mut self, address: Address) -> Result<&mut Slot> {
        self.slots
            .get_mut(address.as_usize().wrapping_sub(1))
            .and_then(|s| s.as_mut())
            .ok_or_else(|| Error::Dereference {
                reason: format!("address {address} does not resolve to a live value"),
            })
    }
}

/// Handle to a managed-object heap. Cheap to clone; all clones share the
/// same arena. Single-threaded by design.
#[derive(Debug, Clone, Default)]
pub struct ManagedHeap {
    inner: Rc<RefCell<HeapInner>>,
}

impl ManagedHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, returning its address with no claim taken yet.
    pub(crate) fn insert(&self, value: Value) -> Address {
        let mut inner = self.inner.borrow_mut();
        inner.slots.push(Some(Slot { value, refs: 0 }));
        Address::new(inner.slots.len())
    }

    /// Take one reference claim on the slot at `address`.
    pub(crate) fn add_ref(&self, address: Address) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.slot_mut(address)?.refs += 1;
        Ok(())
    }

    /// Release one reference claim; the slot is reclaimed at zero.
    pub(crate) fn remove_ref(&self, address: Address) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let slot = inner.slot_mut(address)?;
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            inner.slots[address.as_usize() - 1] = None;
        }
        Ok(())
    }

    /// Overwrite the slot's claim count. Narrow escape hatch mirroring the
    /// native `set_ref` primitive; a count of zero reclaims the slot.
    pub fn set_ref(&self, address: Address, refs: usize) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.slot_mut(address)?.refs = refs;
        if refs == 0 {
            inner.slots[address.as_usize() - 1] = None;
        }
        Ok(())
    }

    /// Current claim count of a live slot.
    pub fn ref_count(&self, address: Address) -> Result<usize> {
        Ok(self.inner.borrow().slot(address)?.refs)
    }

    /// Read the value at `address`.
    pub(crate) fn get(&self, address: Address) -> Result<Value> {
        Ok(self.inner.borrow().slot(address)?.value.clone())
    }

    /// Replace the value stored in the slot, in place. Claims on the slot
    /// are untouched: claims attach to addresses, not to the bytes moved.
    pub(crate) fn replace(&self, address: Address, value: Value) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        inner.slot_mut(address)?.value = value;
        Ok(())
    }

    /// Number of live slots; used by tests to check claim/release pairing.
    pub fn live_count(&self) -> usize {
        self.inner
            .borrow()
            .slots
            .iter()
            .filter(|s| s.is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let heap = ManagedHeap::new();
        let addr = heap.insert(Value::Int(5));
        heap.add_ref(addr).unwrap();
        assert_eq!(heap.get(addr).unwrap(), Value::Int(5));
    }

    #[test]
    fn test_slot_reclaimed_at_zero_refs() {
        let heap = ManagedHeap::new();
        let addr = heap.insert(Value::Int(5));
        heap.add_ref(addr).unwrap();
        assert_eq!(heap.live_count(), 1);

        heap.remove_ref(addr).unwrap();
        assert_eq!(heap.live_count(), 0);
        assert!(matches!(
            heap.get(addr),
            Err(Error::Dereference { .. })
        ));
    }

    #[test]
    fn test_addresses_never_reused() {
        let heap = ManagedHeap::new();
        let a = heap.insert(Value::Int(1));
        heap.add_ref(a).unwrap();
        heap.remove_ref(a).unwrap();

        let b = heap.insert(Value::Int(2));
        assert_ne!(a, b);
        assert!(heap.get(a).is_err());
    }

    #[test]
    fn test_replace_keeps_claims() {
        let heap = ManagedHeap::new();
        let addr = heap.insert(Value::Int(1));
        heap.add_ref(addr).unwrap();
        heap.add_ref(addr).unwrap();

        heap.replace(addr, Value::Int(9)).unwrap();
        assert_eq!(heap.ref_count(addr).unwrap(), 2);
        assert_eq!(heap.get(addr).unwrap(), Value::Int(9));
    }

    #[test]
    fn test_set_ref_zero_reclaims() {
        let heap = ManagedHeap::new();
        let addr = heap.insert(Value::Int(1));
        heap.add_ref(addr).unwrap();
        heap.set_ref(addr, 0).unwrap();
        assert_eq!(heap.live_count(), 0);
    }
}

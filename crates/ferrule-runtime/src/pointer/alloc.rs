//! Pointers to heap memory obtained from the platform allocator
//!
//! Every allocation is described by one [`AllocationRecord`] shared between
//! the pointer returned by [`malloc`] and every offset pointer derived from
//! it. Derived pointers are non-owning views: they consult the shared record
//! on every operation, so a `free` or `realloc` performed through any alias
//! is immediately visible to all others. Addresses are never reused by this
//! abstraction even though the underlying allocator may reuse the bytes.
//!
//! Single-threaded by design: records are shared with `Rc<RefCell<_>>` and
//! no locks are taken. Concurrent use is ruled out by `!Send`/`!Sync`.

use std::cell::RefCell;
use std::fmt;
use std::os::raw::c_void;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::pointer::{Address, Dereference, PointerBase, PointerKind};
use crate::value::{Value, ValueKind};

/// Shared metadata for one raw allocation.
#[derive(Debug)]
pub(crate) struct AllocationRecord {
    pub(crate) address: usize,
    pub(crate) size: usize,
    pub(crate) freed: bool,
    /// Kind and length of the currently assigned value, if any.
    pub(crate) assigned: Option<(ValueKind, usize)>,
}

impl AllocationRecord {
    pub(crate) fn ensure_valid(&self) -> Result<()> {
        if self.freed {
            return Err(Error::FreedMemory);
        }
        Ok(())
    }
}

/// Pointer to allocated memory.
pub struct AllocatedPointer {
    record: Rc<RefCell<AllocationRecord>>,
    offset: usize,
}

/// Allocate `size` bytes.
pub fn malloc(size: usize) -> Result<AllocatedPointer> {
    let mem = unsafe { libc::malloc(size) };
    if mem.is_null() {
        return Err(Error::Allocation);
    }

    Ok(AllocatedPointer {
        record: Rc::new(RefCell::new(AllocationRecord {
            address: mem as usize,
            size,
            freed: false,
            assigned: None,
        })),
        offset: 0,
    })
}

/// Equivalent to `target.free()`.
pub fn free(target: &AllocatedPointer) -> Result<()> {
    target.free()
}

/// Resize a memory block created by [`malloc`].
///
/// Refuses with [`Error::InvalidSize`] when the currently assigned value is
/// larger than `size`; there is no unsafe override for shrinking below it.
/// On success the shared record's address and size are updated in place, so
/// every pointer aliasing the allocation observes the new state.
pub fn realloc(target: &AllocatedPointer, size: usize) -> Result<()> {
    let mut record = target.record.borrow_mut();
    record.ensure_valid()?;

    if let Some((_, len)) = record.assigned {
        if len > size {
            return Err(Error::InvalidSize {
                needed: len,
                available: size,
            });
        }
    }

    let mem = unsafe { libc::realloc(record.address as *mut c_void, size) };
    if mem.is_null() {
        return Err(Error::Allocation);
    }

    record.address = mem as usize;
    record.size = size;
    Ok(())
}

impl AllocatedPointer {
    pub(crate) fn from_record(record: Rc<RefCell<AllocationRecord>>) -> AllocatedPointer {
        AllocatedPointer { record, offset: 0 }
    }

    /// Size of the allocation as visible from this pointer's offset.
    pub fn size(&self) -> usize {
        self.record.borrow().size.saturating_sub(self.offset)
    }

    /// Whether the allocation has been freed.
    pub fn freed(&self) -> bool {
        self.record.borrow().freed
    }

    /// Whether a value is currently inside the memory.
    pub fn assigned(&self) -> bool {
        self.record.borrow().assigned.is_some()
    }

    /// Derive a non-owning view `delta` bytes away, sharing this record.
    pub fn offset(&self, delta: isize) -> Result<AllocatedPointer> {
        self.record.borrow().ensure_valid()?;
        let offset = self.offset as isize + delta;
        if offset < 0 {
            return Err(Error::IndexBelowZero { index: offset });
        }
        Ok(AllocatedPointer {
            record: Rc::clone(&self.record),
            offset: offset as usize,
        })
    }

    /// Serialize `value` and write it into the allocation.
    ///
    /// Fails with [`Error::InvalidSize`] when the representation exceeds the
    /// space remaining at this offset and `unsafe_size` is not given. On
    /// success the shared record is marked assigned.
    pub fn write(&self, value: &Value) -> Result<()> {
        self.write_with(value, false)
    }

    pub fn write_with(&self, value: &Value, unsafe_size: bool) -> Result<()> {
        if matches!(value, Value::Callable(_)) {
            return Err(Error::TypeMismatch {
                expected: "a storable value".to_string(),
                got: value.type_name().to_string(),
            });
        }
        let bytes = value.to_foreign_bytes();
        let kind = value.kind();

        let mut record = self.record.borrow_mut();
        record.ensure_valid()?;

        let available = record.size.saturating_sub(self.offset);
        if bytes.len() > available && !unsafe_size {
            return Err(Error::InvalidSize {
                needed: bytes.len(),
                available,
            });
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (record.address + self.offset) as *mut u8,
                bytes.len(),
            );
        }
        record.assigned = Some((kind, bytes.len()));
        Ok(())
    }

    /// Raw byte write at this offset, bounds-checked against the record.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let record = self.record.borrow();
        record.ensure_valid()?;

        let available = record.size.saturating_sub(self.offset);
        if bytes.len() > available {
            return Err(Error::InvalidSize {
                needed: bytes.len(),
                available,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (record.address + self.offset) as *mut u8,
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Raw byte read at this offset, bounds-checked against the record.
    pub fn read_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let record = self.record.borrow();
        record.ensure_valid()?;

        let available = record.size.saturating_sub(self.offset);
        if len > available {
            return Err(Error::InvalidSize {
                needed: len,
                available,
            });
        }
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                (record.address + self.offset) as *const u8,
                out.as_mut_ptr(),
                len,
            );
        }
        Ok(out)
    }

    /// Release the memory exactly once. Any further read, write or free on
    /// this or any pointer sharing the record fails with
    /// [`Error::FreedMemory`].
    pub fn free(&self) -> Result<()> {
        let mut record = self.record.borrow_mut();
        record.ensure_valid()?;
        unsafe { libc::free(record.address as *mut c_void) };
        record.freed = true;
        Ok(())
    }
}

impl PointerBase for AllocatedPointer {
    fn address(&self) -> Address {
        Address::new(self.record.borrow().address + self.offset)
    }

    fn kind(&self) -> PointerKind {
        PointerKind::Allocated
    }
}

impl Dereference for AllocatedPointer {
    /// Fails with [`Error::FreedMemory`] after a free and
    /// [`Error::Dereference`] while no value has been assigned.
    fn dereference(&self) -> Result<Value> {
        let record = self.record.borrow();
        if record.freed {
            return Err(Error::FreedMemory);
        }
        let (kind, len) = record.assigned.ok_or_else(|| Error::Dereference {
            reason: "allocated memory has no value".to_string(),
        })?;

        let mut bytes = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                (record.address + self.offset) as *const u8,
                bytes.as_mut_ptr(),
                len,
            );
        }
        Ok(Value::from_foreign_bytes(kind, &bytes))
    }
}

impl Clone for AllocatedPointer {
    /// Clones are aliases over the same record, not new allocations.
    fn clone(&self) -> Self {
        AllocatedPointer {
            record: Rc::clone(&self.record),
            offset: self.offset,
        }
    }
}

impl PartialEq for AllocatedPointer {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl fmt::Debug for AllocatedPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AllocatedPointer(address={}, size={})",
            self.address(),
            self.size()
        )
    }
}

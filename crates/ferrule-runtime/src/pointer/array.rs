//! Chunked array allocations
//!
//! [`calloc`] requests `count * size` zeroed bytes and addresses them as
//! `count` chunks of `size` bytes each. Chunk pointers share one
//! [`AllocationRecord`](super::alloc::AllocationRecord) (freeing through any
//! chunk frees them all) while each chunk keeps its own assigned-value state.
//!
//! A chunk cache maps index to previously constructed chunk state, so
//! requesting the same index twice returns the same identity.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::pointer::alloc::AllocationRecord;
use crate::pointer::{Address, Dereference, PointerBase, PointerKind};
use crate::value::{Value, ValueKind};

#[derive(Debug, Default)]
struct ChunkState {
    assigned: Option<(ValueKind, usize)>,
}

type ChunkCache = Rc<RefCell<HashMap<usize, Rc<RefCell<ChunkState>>>>>;

/// Pointer to one chunk of a calloc'd array allocation.
pub struct ArrayPointer {
    record: Rc<RefCell<AllocationRecord>>,
    chunks: usize,
    chunk_size: usize,
    index: usize,
    state: Rc<RefCell<ChunkState>>,
    cache: ChunkCache,
}

/// Allocate `count` zeroed chunks of `size` bytes each.
pub fn calloc(count: usize, size: usize) -> Result<ArrayPointer> {
    let mem = unsafe { libc::calloc(count, size) };
    if mem.is_null() {
        return Err(Error::Allocation);
    }

    let state = Rc::new(RefCell::new(ChunkState::default()));
    let cache: ChunkCache = Rc::new(RefCell::new(HashMap::new()));
    cache.borrow_mut().insert(0, Rc::clone(&state));

    Ok(ArrayPointer {
        record: Rc::new(RefCell::new(AllocationRecord {
            address: mem as usize,
            size: count * size,
            freed: false,
            assigned: None,
        })),
        chunks: count,
        chunk_size: size,
        index: 0,
        state,
        cache,
    })
}

impl ArrayPointer {
    /// Number of allocated chunks.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Size of each chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Index of the chunk this pointer looks at.
    pub fn current_index(&self) -> usize {
        self.index
    }

    pub fn freed(&self) -> bool {
        self.record.borrow().freed
    }

    pub fn assigned(&self) -> bool {
        self.state.borrow().assigned.is_some()
    }

    /// Pointer to the chunk at absolute `index`, validated against
    /// `[0, chunks)`. Repeated requests for the same index share one cached
    /// chunk state.
    pub fn at(&self, index: usize) -> Result<ArrayPointer> {
        self.record.borrow().ensure_valid()?;
        if index >= self.chunks {
            return Err(Error::NotEnoughChunks {
                index,
                chunks: self.chunks,
            });
        }

        let state = {
            let mut cache = self.cache.borrow_mut();
            Rc::clone(cache.entry(index).or_default())
        };

        Ok(ArrayPointer {
            record: Rc::clone(&self.record),
            chunks: self.chunks,
            chunk_size: self.chunk_size,
            index,
            state,
            cache: Rc::clone(&self.cache),
        })
    }

    /// Pointer `delta` chunks away. Below zero fails with
    /// [`Error::IndexBelowZero`], at or above the chunk count with
    /// [`Error::NotEnoughChunks`].
    pub fn offset(&self, delta: isize) -> Result<ArrayPointer> {
        let index = self.index as isize + delta;
        if index < 0 {
            return Err(Error::IndexBelowZero { index });
        }
        self.at(index as usize)
    }

    /// Whether two pointers resolved to the same cached chunk state.
    pub fn is_same_chunk(&self, other: &ArrayPointer) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }

    /// Serialize `value` into this chunk. The representation must fit the
    /// chunk size unless `unsafe_size` is given.
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

        let record = self.record.borrow();
        record.ensure_valid()?;

        if bytes.len() > self.chunk_size && !unsafe_size {
            return Err(Error::InvalidSize {
                needed: bytes.len(),
                available: self.chunk_size,
            });
        }

        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (record.address + self.index * self.chunk_size) as *mut u8,
                bytes.len(),
            );
        }
        self.state.borrow_mut().assigned = Some((value.kind(), bytes.len()));
        Ok(())
    }

    /// Raw byte write into this chunk, bounds-checked against the chunk
    /// size.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        let record = self.record.borrow();
        record.ensure_valid()?;
        if bytes.len() > self.chunk_size {
            return Err(Error::InvalidSize {
                needed: bytes.len(),
                available: self.chunk_size,
            });
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (record.address + self.index * self.chunk_size) as *mut u8,
                bytes.len(),
            );
        }
        Ok(())
    }

    /// Raw byte read from this chunk, bounds-checked against the chunk size.
    pub fn read_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let record = self.record.borrow();
        record.ensure_valid()?;
        if len > self.chunk_size {
            return Err(Error::InvalidSize {
                needed: len,
                available: self.chunk_size,
            });
        }
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                (record.address + self.index * self.chunk_size) as *const u8,
                out.as_mut_ptr(),
                len,
            );
        }
        Ok(out)
    }

    /// Plain allocated-pointer view of the whole backing allocation,
    /// sharing this record.
    pub fn base_pointer(&self) -> crate::pointer::AllocatedPointer {
        crate::pointer::AllocatedPointer::from_record(Rc::clone(&self.record))
    }

    /// Release the whole allocation exactly once; every chunk pointer
    /// sharing the record observes the freed state.
    pub fn free(&self) -> Result<()> {
        let mut record = self.record.borrow_mut();
        record.ensure_valid()?;
        unsafe { libc::free(record.address as *mut std::os::raw::c_void) };
        record.freed = true;
        Ok(())
    }

    /// Chunk pointers from the current index to the end of the allocation.
    pub fn iter_remaining(&self) -> Result<Vec<ArrayPointer>> {
        (self.index..self.chunks).map(|i| self.at(i)).collect()
    }
}

impl PointerBase for ArrayPointer {
    fn address(&self) -> Address {
        Address::new(self.record.borrow().address + self.index * self.chunk_size)
    }

    fn kind(&self) -> PointerKind {
        PointerKind::Allocated
    }
}

impl Dereference for ArrayPointer {
    fn dereference(&self) -> Result<Value> {
        let record = self.record.borrow();
        if record.freed {
            return Err(Error::FreedMemory);
        }
        let (kind, len) = self.state.borrow().assigned.ok_or_else(|| Error::Dereference {
            reason: "allocated chunk has no value".to_string(),
        })?;

        let mut bytes = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                (record.address + self.index * self.chunk_size) as *const u8,
                bytes.as_mut_ptr(),
                len,
            );
        }
        Ok(Value::from_foreign_bytes(kind, &bytes))
    }
}

impl Clone for ArrayPointer {
    fn clone(&self) -> Self {
        ArrayPointer {
            record: Rc::clone(&self.record),
            chunks: self.chunks,
            chunk_size: self.chunk_size,
            index: self.index,
            state: Rc::clone(&self.state),
            cache: Rc::clone(&self.cache),
        }
    }
}

impl PartialEq for ArrayPointer {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl fmt::Debug for ArrayPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<pointer to allocated chunk at {}>", self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_write_and_read_back() {
        let ptr = calloc(4, 28).unwrap();
        for i in 0..4 {
            ptr.at(i).unwrap().write(&Value::Int(i as i64 + 1)).unwrap();
        }
        let got: Vec<Value> = (0..4)
            .map(|i| ptr.at(i).unwrap().dereference().unwrap())
            .collect();
        assert_eq!(
            got,
            vec![Value::Int(1), Value::Int(2), Value::Int(3), Value::Int(4)]
        );
        ptr.free().unwrap();
    }

    #[test]
    fn test_offset_out_of_range() {
        let ptr = calloc(1, 1).unwrap();
        assert_eq!(
            ptr.offset(2).unwrap_err(),
            Error::NotEnoughChunks {
                index: 2,
                chunks: 1,
            }
        );
        assert_eq!(
            ptr.offset(-1).unwrap_err(),
            Error::IndexBelowZero { index: -1 }
        );
        ptr.free().unwrap();
    }

    #[test]
    fn test_index_equal_to_count_is_out_of_range() {
        let ptr = calloc(2, 8).unwrap();
        assert_eq!(
            ptr.at(2).unwrap_err(),
            Error::NotEnoughChunks {
                index: 2,
                chunks: 2,
            }
        );
        ptr.free().unwrap();
    }

    #[test]
    fn test_chunk_identity_is_stable() {
        let ptr = calloc(3, 8).unwrap();
        let a = ptr.at(1).unwrap();
        let b = ptr.at(1).unwrap();
        let c = ptr.offset(1).unwrap();

        assert!(a.is_same_chunk(&b));
        assert!(a.is_same_chunk(&c));
        assert!(!a.is_same_chunk(&ptr.at(2).unwrap()));
        ptr.free().unwrap();
    }

    #[test]
    fn test_chunk_assigned_state_is_per_chunk() {
        let ptr = calloc(2, 8).unwrap();
        ptr.at(0).unwrap().write(&Value::Int(1)).unwrap();

        assert!(ptr.at(0).unwrap().assigned());
        assert!(!ptr.at(1).unwrap().assigned());
        assert!(matches!(
            ptr.at(1).unwrap().dereference().unwrap_err(),
            Error::Dereference { .. }
        ));
        ptr.free().unwrap();
    }

    #[test]
    fn test_free_through_any_chunk() {
        let ptr = calloc(2, 8).unwrap();
        let chunk = ptr.at(1).unwrap();
        chunk.free().unwrap();

        assert_eq!(ptr.free().unwrap_err(), Error::FreedMemory);
        assert_eq!(ptr.at(0).unwrap_err(), Error::FreedMemory);
    }

    #[test]
    fn test_value_too_large_for_chunk() {
        let ptr = calloc(2, 4).unwrap();
        let err = ptr.at(0).unwrap().write(&Value::Int(1)).unwrap_err();
        assert_eq!(
            err,
            Error::InvalidSize {
                needed: 8,
                available: 4,
            }
        );
        ptr.free().unwrap();
    }

    #[test]
    fn test_iter_remaining() {
        let ptr = calloc(4, 8).unwrap();
        let rest = ptr.at(2).unwrap().iter_remaining().unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].current_index(), 2);
        assert_eq!(rest[1].current_index(), 3);
        ptr.free().unwrap();
    }
}

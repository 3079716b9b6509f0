//! Error taxonomy for pointer and foreign-call operations
//!
//! Every fallible operation in the crate reports through [`Error`]. The
//! taxonomy is closed: validation errors (null/size/type/binding) are raised
//! synchronously and are always caller-recoverable, freed/invalid-state
//! errors are terminal for that allocation, and native faults are convertible
//! to errors only beneath a fault barrier.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Operation needs a non-null address
    #[error("cannot perform operation when pointing to null")]
    NullPointer,

    /// Address cannot be resolved to a live value
    #[error("cannot dereference: {reason}")]
    Dereference { reason: String },

    /// Operation on an allocation after free()
    #[error("memory has been freed")]
    FreedMemory,

    /// Byte-size mismatch on a move or realloc without the unsafe override
    #[error("value is of size {needed}, while target is of size {available}")]
    InvalidSize { needed: usize, available: usize },

    /// Allocator returned no memory
    #[error("failed to allocate memory")]
    Allocation,

    /// Chunk index at or above the chunk count
    #[error("chunk index is {index}, while allocation is {chunks}")]
    NotEnoughChunks { index: usize, chunks: usize },

    /// Chunk index below zero
    #[error("chunk index is below zero")]
    IndexBelowZero { index: isize },

    /// Argument incompatible with its declared foreign parameter type.
    /// `index` is 1-based, matching C diagnostics.
    #[error("argument {index} got invalid type: expected {expected}, got {got}")]
    InvalidBindingParameter {
        index: usize,
        expected: String,
        got: String,
    },

    /// Wrong number of positional arguments
    #[error("expected {expected} arguments, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    /// Assign or move between incompatible pointer types
    #[error("pointer looks at {expected}, target is {got}")]
    TypeMismatch { expected: String, got: String },

    /// Integer does not fit the declared C type
    #[error("number {value} out of range for {target}")]
    NumberOutOfRange { value: i64, target: String },

    /// String cannot be represented as a C string
    #[error("invalid string: {reason}")]
    InvalidString { reason: String },

    /// Library file not found in the search paths
    #[error("library not found: {name}")]
    LibraryNotFound { name: String },

    /// Symbol not found in a loaded library
    #[error("symbol '{symbol}' not found in library '{library}'")]
    SymbolNotFound { library: String, symbol: String },

    /// Failed to load a library
    #[error("failed to load library: {reason}")]
    LoadFailed { reason: String },

    /// Struct name used in a signature without a registered layout
    #[error("struct '{name}' is not registered")]
    UnknownStruct { name: String },

    /// Field name not present in a struct layout
    #[error("struct {name} has no field '{field}'")]
    UnknownField { name: String, field: String },

    /// Declared struct return does not match the symbol's raw return type
    #[error("expected return of struct {expected}, symbol returns {got}")]
    ReturnTypeMismatch { expected: String, got: String },

    /// Signature the marshaller cannot express
    #[error("unsupported signature: {reason}")]
    UnsupportedSignature { reason: String },

    /// Segmentation violation trapped inside a guarded call
    #[error("segmentation fault occurred during guarded call")]
    SegmentViolation,

    /// Abort signal trapped inside a guarded call
    #[error("abort occurred during guarded call")]
    Aborted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_parameter_message_names_index() {
        let err = Error::InvalidBindingParameter {
            index: 2,
            expected: "c_int".into(),
            got: "str".into(),
        };
        assert_eq!(
            err.to_string(),
            "argument 2 got invalid type: expected c_int, got str"
        );
    }

    #[test]
    fn test_chunk_errors_carry_bounds() {
        let err = Error::NotEnoughChunks {
            index: 4,
            chunks: 4,
        };
        assert_eq!(err.to_string(), "chunk index is 4, while allocation is 4");
    }

    #[test]
    fn test_invalid_size_message() {
        let err = Error::InvalidSize {
            needed: 16,
            available: 8,
        };
        assert_eq!(
            err.to_string(),
            "value is of size 16, while target is of size 8"
        );
    }
}

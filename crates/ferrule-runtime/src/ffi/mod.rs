//! Foreign function interface
//!
//! The marshalling layer for calling C functions with dynamic values:
//! - Dynamic library loading ([`loader`])
//! - Argument validation and conversion ([`marshal`])
//! - Call construction, invocation and result decoding ([`invoke`])
//! - Callbacks from C back into dynamic closures ([`callback`])
//!
//! All unsafe code at the call boundary is isolated in this module; the
//! invoke step runs beneath the fault barrier so native faults surface as
//! errors rather than terminating the process.

pub mod callback;
pub mod invoke;
pub mod loader;
pub mod marshal;

pub use callback::{CallbackHandle, CallbackSpec};
pub use invoke::{bind, bind_with_struct_return, Binding};
pub use loader::LibraryLoader;
pub use marshal::MarshalContext;

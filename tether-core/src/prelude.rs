//! Prelude for convenient imports.
//!
//! ```
//! use tether_core::prelude::*;
//! ```

// Errors
pub use crate::error::{BridgeError, Result};

// Values
pub use crate::value::{Extern, HostValue};

// Memory
pub use crate::memory::{Heap, LinearBuffer, PAGE_SIZE, VecBuffer};

// Reference table
pub use crate::table::{ExternRefTable, SlotState};

// Closures
pub use crate::closure::{
    AbiType, Closure, ClosureBridge, ClosureRecord, ClosureTarget, HostCallback, Signature,
    TrampolineId,
};

// Exceptions
pub use crate::exception::ExceptionChannel;

// Configuration
pub use crate::config::{BridgeConfig, MemoryConfig, TableConfig};

//! Tether Core Library
//!
//! Engine-independent building blocks of the host/module boundary: the
//! linear memory heap, the external reference table, closure records, the
//! exception channel and the errors they raise.
//!
//! # Key Components
//!
//! - **Memory**: first-fit heap over a growable page buffer
//! - **Table**: handle-indexed slots with sentinels and a free list
//! - **Closure**: wrapped callbacks with explicit destroy
//! - **Exception**: the single pending-exception slot
//!
//! # Example
//!
//! ```
//! use tether_core::prelude::*;
//!
//! let mut buf = VecBuffer::new(1);
//! let mut heap = Heap::new(MemoryConfig::default());
//! heap.initialize(1024);
//! let offset = heap.allocate(&mut buf, 16, 8)?;
//! assert_eq!(offset % 8, 0);
//!
//! let mut table: ExternRefTable<HostValue> = ExternRefTable::new(TableConfig::default());
//! let handle = table.insert(HostValue::string("hello"))?;
//! assert_eq!(table.get(handle)?.as_str(), Some("hello"));
//! # Ok::<(), tether_core::BridgeError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod closure;
pub mod config;
pub mod error;
pub mod exception;
pub mod memory;
pub mod prelude;
pub mod table;
pub mod value;

pub use closure::{AbiType, Closure, ClosureBridge, HostCallback, Signature, TrampolineId};
pub use config::{BridgeConfig, MemoryConfig, TableConfig};
pub use error::{BridgeError, Result};
pub use exception::ExceptionChannel;
pub use memory::{Heap, LinearBuffer, VecBuffer};
pub use table::{ExternRefTable, Releasable};
pub use value::{Extern, HostValue};

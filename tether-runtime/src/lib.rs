//! Tether Runtime - wasmtime host for bridge-compiled modules.
//!
//! This crate turns module bytes into a live [`ModuleHandle`]:
//! - Engine setup and a compiled-module cache
//! - The instantiation protocol, sync and async
//! - Host imports backing the heap, reference table, closures and exceptions
//! - Module handles exposing exports, memory and bridge state
//! - Logging setup for embedding hosts
//!
//! # Example
//!
//! ```no_run
//! use tether_runtime::prelude::*;
//!
//! # async fn run() -> tether_core::Result<()> {
//! let instantiator = Instantiator::with_config(RuntimeConfig::from_env())?;
//! let mut module = instantiator.instantiate(InitInput::locator("pkg/app.wasm")).await?;
//! let code = module.main(0, 0)?;
//! # let _ = code;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
mod convert;
pub mod engine;
pub mod fetch;
pub mod host;
pub mod instance;
pub mod memory;
pub mod observability;
pub mod protocol;

pub use config::{RuntimeConfig, Trampoline};
pub use engine::{CompiledModule, WasmRuntime};
pub use fetch::Locator;
pub use host::HostState;
pub use instance::{ModuleHandle, SharedModule};
pub use protocol::{InitInput, Instantiator, Phase, PhaseLog, SyncInitInput};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{RuntimeConfig, Trampoline};
    pub use crate::engine::{CompiledModule, WasmRuntime};
    pub use crate::fetch::Locator;
    pub use crate::instance::{ModuleHandle, SharedModule};
    pub use crate::observability::{init_tracing, LogFormat, TracingConfig};
    pub use crate::protocol::{InitInput, Instantiator, Phase, PhaseLog, SyncInitInput};
    pub use tether_core::prelude::*;
}

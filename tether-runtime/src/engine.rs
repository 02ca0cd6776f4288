//! Engine management using Wasmtime.
//!
//! Provides engine configuration, module compilation, and caching
//! of compiled modules by content hash.

use crate::config::RuntimeConfig;
use dashmap::DashMap;
use std::sync::Arc;
use tether_core::{BridgeError, Result};
use wasmtime::{Config, Engine, Module};

/// A compiled module ready for instantiation.
#[derive(Clone)]
pub struct CompiledModule {
    name: String,
    module: Module,
    hash: u64,
}

impl CompiledModule {
    /// Name or locator the module was compiled from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the underlying Wasmtime module.
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Get the hash of the original bytes.
    pub fn hash(&self) -> u64 {
        self.hash
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("name", &self.name)
            .field("hash", &format_args!("{:016x}", self.hash))
            .finish()
    }
}

/// Runtime owning the Wasmtime engine and the compiled-module cache.
pub struct WasmRuntime {
    /// The Wasmtime engine (thread-safe, can be shared).
    engine: Engine,
    config: RuntimeConfig,
    /// Compiled modules by content hash.
    module_cache: DashMap<u64, Arc<CompiledModule>>,
}

impl WasmRuntime {
    /// Create a runtime with the given configuration.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let engine = Engine::new(&wasmtime_config(&config)).map_err(|e| BridgeError::Config {
            field: "engine".to_string(),
            cause: e.to_string(),
        })?;

        Ok(Self {
            engine,
            config,
            module_cache: DashMap::new(),
        })
    }

    /// Create a runtime with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(RuntimeConfig::default())
    }

    /// Get the Wasmtime engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Get the runtime configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Compile module bytes, reusing a cached compilation when enabled.
    pub fn compile(&self, name: &str, bytes: &[u8]) -> Result<Arc<CompiledModule>> {
        let hash = hash_bytes(bytes);

        if self.config.cache_modules {
            if let Some(cached) = self.module_cache.get(&hash) {
                tracing::debug!(module = name, hash, "compiled module cache hit");
                return Ok(Arc::clone(&cached));
            }
        }

        let module = Module::new(&self.engine, bytes).map_err(|e| BridgeError::Compile {
            module: name.to_string(),
            cause: format!("{e:#}"),
        })?;
        tracing::debug!(module = name, hash, size = bytes.len(), "module compiled");

        let compiled = Arc::new(CompiledModule {
            name: name.to_string(),
            module,
            hash,
        });

        if self.config.cache_modules {
            self.module_cache.insert(hash, Arc::clone(&compiled));
        }

        Ok(compiled)
    }

    /// Validate module bytes without compiling.
    pub fn validate(&self, bytes: &[u8]) -> Result<()> {
        Module::validate(&self.engine, bytes).map_err(|e| BridgeError::Compile {
            module: "validation".to_string(),
            cause: e.to_string(),
        })
    }

    /// Clear the module cache.
    pub fn clear_cache(&self) {
        self.module_cache.clear();
    }

    /// Get the number of cached modules.
    pub fn cache_size(&self) -> usize {
        self.module_cache.len()
    }
}

fn wasmtime_config(config: &RuntimeConfig) -> Config {
    let mut engine_config = Config::new();
    engine_config.epoch_interruption(config.epoch_deadline.is_some());
    engine_config.consume_fuel(config.fuel.is_some());
    engine_config.debug_info(config.debug_info);
    engine_config.strategy(wasmtime::Strategy::Cranelift);
    engine_config
}

/// Compute a hash of bytes (for cache key).
fn hash_bytes(bytes: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

//! Runtime configuration: engine knobs, entry-point names and the
//! trampoline table.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tether_core::config::env_parse;
use tether_core::{AbiType, BridgeConfig, BridgeError, Result, Signature, TrampolineId};

/// Default fuel amount for execution limiting.
const DEFAULT_FUEL: u64 = 10_000_000;

/// Default timeout for fetching a module by URL.
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 30_000;

/// A closure trampoline declaration.
///
/// For each declared trampoline the host provides the imports
/// `__wbg_invoke_<id>` and `__wbg_destroy_<id>`. Closures the module wraps
/// itself are invoked through `invoke_export` and destroyed through
/// `destroy_export`, both of which receive the closure's `(data, vtable)`
/// pair ahead of the signature's parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trampoline {
    /// Trampoline identifier.
    pub id: TrampolineId,
    /// Parameter and result types after the closure handle.
    pub signature: Signature,
    /// Module export that invokes a module closure with this signature.
    #[serde(default)]
    pub invoke_export: Option<String>,
    /// Module export that destroys a module closure with this signature.
    #[serde(default)]
    pub destroy_export: Option<String>,
}

impl Trampoline {
    /// Declare a trampoline with no module-side exports.
    pub fn new(id: u32, signature: Signature) -> Self {
        Self {
            id: TrampolineId(id),
            signature,
            invoke_export: None,
            destroy_export: None,
        }
    }

    /// Bind module exports for module-owned closures.
    pub fn with_exports(mut self, invoke: impl Into<String>, destroy: impl Into<String>) -> Self {
        self.invoke_export = Some(invoke.into());
        self.destroy_export = Some(destroy.into());
        self
    }

    /// Name of the host invoke import.
    pub fn invoke_import(&self) -> String {
        format!("__wbg_invoke_{}", self.id)
    }

    /// Name of the host destroy import.
    pub fn destroy_import(&self) -> String {
        format!("__wbg_destroy_{}", self.id)
    }

    /// The four shapes generated for typical closure exports: one reference
    /// argument, no arguments, two integers, and one float.
    pub fn standard_set() -> Vec<Self> {
        vec![
            Self::new(0, Signature::new([AbiType::Ref], None)),
            Self::new(1, Signature::new([], None)),
            Self::new(2, Signature::new([AbiType::I32, AbiType::I32], None)),
            Self::new(3, Signature::new([AbiType::F64], None)),
        ]
    }
}

/// Configuration for the runtime and every module it instantiates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Heap and reference-table limits.
    pub bridge: BridgeConfig,
    /// Fuel granted to each store. Disabled when unset.
    pub fuel: Option<u64>,
    /// Epoch deadline in ticks. Epoch interruption is off when unset.
    pub epoch_deadline: Option<u64>,
    /// Whether to cache compiled modules by content hash.
    pub cache_modules: bool,
    /// Enable debug info in compiled modules.
    pub debug_info: bool,
    /// Import namespace for host functions.
    pub namespace: String,
    /// Start routine export, called once before the handle is returned.
    pub start_export: String,
    /// Entry point export.
    pub main_export: String,
    /// Declared closure trampolines.
    pub trampolines: Vec<Trampoline>,
    /// Timeout for URL locators, in milliseconds.
    pub fetch_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            fuel: None,
            epoch_deadline: None,
            cache_modules: true,
            debug_info: false,
            namespace: "wbg".to_string(),
            start_export: "__wbindgen_start".to_string(),
            main_export: "main".to_string(),
            trampolines: Trampoline::standard_set(),
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration for testing with stricter limits.
    pub fn testing() -> Self {
        let mut config = Self {
            fuel: Some(DEFAULT_FUEL),
            cache_modules: false,
            debug_info: true,
            fetch_timeout_ms: 5_000,
            ..Self::default()
        };
        config.bridge.memory.max_pages = 256; // 16 MB
        config
    }

    /// Create configuration from environment variables.
    ///
    /// Reads everything [`BridgeConfig::from_env`] reads, plus:
    /// - `TETHER_FUEL`: fuel per store
    /// - `TETHER_CACHE_MODULES`: "true"/"1" or "false"/"0"
    /// - `TETHER_FETCH_TIMEOUT_MS`: URL fetch timeout
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bridge: BridgeConfig::from_env(),
            fuel: env_parse("TETHER_FUEL"),
            cache_modules: std::env::var("TETHER_CACHE_MODULES")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.cache_modules),
            fetch_timeout_ms: env_parse("TETHER_FETCH_TIMEOUT_MS")
                .unwrap_or(defaults.fetch_timeout_ms),
            ..defaults
        }
    }

    /// Set the memory ceiling in pages.
    pub fn with_max_memory_pages(mut self, pages: u32) -> Self {
        self.bridge.memory.max_pages = pages;
        self
    }

    /// Enable fuel-based limiting.
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = Some(fuel);
        self
    }

    /// Enable epoch interruption with a deadline in ticks.
    pub fn with_epoch_deadline(mut self, ticks: u64) -> Self {
        self.epoch_deadline = Some(ticks);
        self
    }

    /// Enable or disable module caching.
    pub fn with_cache(mut self, enabled: bool) -> Self {
        self.cache_modules = enabled;
        self
    }

    /// Set the import namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Add or replace a trampoline declaration.
    pub fn with_trampoline(mut self, trampoline: Trampoline) -> Self {
        self.trampolines.retain(|t| t.id != trampoline.id);
        self.trampolines.push(trampoline);
        self
    }

    /// Fetch timeout as a duration.
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Find a trampoline by id.
    pub fn trampoline(&self, id: TrampolineId) -> Option<&Trampoline> {
        self.trampolines.iter().find(|t| t.id == id)
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        self.bridge.validate()?;
        if self.namespace.is_empty() {
            return Err(config_error("namespace", "must not be empty"));
        }
        let mut seen = BTreeSet::new();
        for t in &self.trampolines {
            if !seen.insert(t.id) {
                return Err(config_error(
                    "trampolines",
                    format!("trampoline {} declared twice", t.id),
                ));
            }
        }
        Ok(())
    }
}

fn config_error(field: &str, cause: impl Into<String>) -> BridgeError {
    BridgeError::Config {
        field: field.to_string(),
        cause: cause.into(),
    }
}

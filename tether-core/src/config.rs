//! Configuration for the bridge primitives.
//!
//! The memory ceiling and the table growth policy are deliberately not
//! hard-coded: both have documented defaults and can be set through
//! builders, serde, or environment variables.

use crate::error::{BridgeError, Result};
use crate::memory::MAX_PAGES;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Default memory ceiling in pages (64 KiB per page).
pub const DEFAULT_MAX_MEMORY_PAGES: u32 = 1024; // 64 MB

/// Default initial reference-table capacity.
pub const DEFAULT_TABLE_CAPACITY: u32 = 128;

/// Default reference-table growth factor.
pub const DEFAULT_TABLE_GROWTH: u32 = 2;

/// Limits for the linear memory heap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Hard ceiling for memory growth, in pages.
    pub max_pages: u32,
    /// Fixed heap base. When unset, the module's `__heap_base` export or the
    /// initial memory size is used.
    pub heap_base: Option<u32>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_pages: DEFAULT_MAX_MEMORY_PAGES,
            heap_base: None,
        }
    }
}

impl MemoryConfig {
    /// Set the memory ceiling.
    pub fn with_max_pages(mut self, pages: u32) -> Self {
        self.max_pages = pages;
        self
    }

    /// Pin the heap base.
    pub fn with_heap_base(mut self, base: u32) -> Self {
        self.heap_base = Some(base);
        self
    }

    /// Check the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_pages == 0 || self.max_pages > MAX_PAGES {
            return Err(BridgeError::Config {
                field: "memory.max_pages".to_string(),
                cause: format!("must be within 1..={}, got {}", MAX_PAGES, self.max_pages),
            });
        }
        Ok(())
    }
}

/// Growth policy for the external reference table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    /// Capacity reserved up front, sentinels included.
    pub initial_capacity: u32,
    /// Multiplier applied when the table is exhausted.
    pub growth_factor: u32,
    /// Upper bound on capacity. Unbounded when unset.
    pub max_capacity: Option<u32>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_TABLE_CAPACITY,
            growth_factor: DEFAULT_TABLE_GROWTH,
            max_capacity: None,
        }
    }
}

impl TableConfig {
    /// Set the initial capacity.
    pub fn with_initial_capacity(mut self, capacity: u32) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Set the growth factor.
    pub fn with_growth_factor(mut self, factor: u32) -> Self {
        self.growth_factor = factor;
        self
    }

    /// Bound the capacity.
    pub fn with_max_capacity(mut self, capacity: u32) -> Self {
        self.max_capacity = Some(capacity);
        self
    }

    /// Check the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.growth_factor < 2 {
            return Err(BridgeError::Config {
                field: "table.growth_factor".to_string(),
                cause: format!("must be at least 2, got {}", self.growth_factor),
            });
        }
        if let Some(max) = self.max_capacity {
            if max < self.initial_capacity {
                return Err(BridgeError::Config {
                    field: "table.max_capacity".to_string(),
                    cause: format!(
                        "{} is below the initial capacity {}",
                        max, self.initial_capacity
                    ),
                });
            }
        }
        Ok(())
    }
}

/// Combined configuration for one module's bridge state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Heap limits.
    pub memory: MemoryConfig,
    /// Reference-table growth.
    pub table: TableConfig,
}

impl BridgeConfig {
    /// Create configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    ///
    /// Environment variables:
    /// - `TETHER_MAX_MEMORY_PAGES`: memory ceiling in pages
    /// - `TETHER_HEAP_BASE`: fixed heap base offset
    /// - `TETHER_TABLE_INITIAL`: initial table capacity
    /// - `TETHER_TABLE_GROWTH`: table growth factor
    /// - `TETHER_TABLE_MAX`: maximum table capacity
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            memory: MemoryConfig {
                max_pages: env_parse("TETHER_MAX_MEMORY_PAGES")
                    .unwrap_or(defaults.memory.max_pages),
                heap_base: env_parse("TETHER_HEAP_BASE"),
            },
            table: TableConfig {
                initial_capacity: env_parse("TETHER_TABLE_INITIAL")
                    .unwrap_or(defaults.table.initial_capacity),
                growth_factor: env_parse("TETHER_TABLE_GROWTH")
                    .unwrap_or(defaults.table.growth_factor),
                max_capacity: env_parse("TETHER_TABLE_MAX"),
            },
        }
    }

    /// Validate both sections.
    pub fn validate(&self) -> Result<()> {
        self.memory.validate()?;
        self.table.validate()
    }
}

/// Read and parse an environment variable.
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.memory.max_pages, DEFAULT_MAX_MEMORY_PAGES);
        assert_eq!(config.memory.heap_base, None);
        assert_eq!(config.table.initial_capacity, 128);
        assert_eq!(config.table.growth_factor, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(MemoryConfig::default().with_max_pages(0).validate().is_err());
        assert!(
            MemoryConfig::default()
                .with_max_pages(MAX_PAGES + 1)
                .validate()
                .is_err()
        );
        assert!(TableConfig::default().with_growth_factor(1).validate().is_err());
        assert!(
            TableConfig::default()
                .with_initial_capacity(64)
                .with_max_capacity(8)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{ "memory": { "max_pages": 16 } }"#).unwrap();
        assert_eq!(config.memory.max_pages, 16);
        assert_eq!(config.table, TableConfig::default());
    }
}

//! Error types for Tether.
//!
//! Every failure that can cross the host/module boundary is a variant of
//! [`BridgeError`]. Variants carry a stable code (`E101`, `E401`, ...) so
//! hosts can match on them in logs without parsing messages.

use crate::value::HostValue;
use thiserror::Error;

/// The main error type for bridge operations.
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    // =========================================================================
    // Instantiation Errors (E100-E399)
    // =========================================================================
    /// Module bytes could not be fetched, decoded or compiled.
    #[error("E101: Failed to compile module '{module}': {cause}")]
    Compile {
        /// Name or locator of the module.
        module: String,
        /// Reason for the failure.
        cause: String,
    },

    /// Host imports do not match what the module declares.
    #[error("E201: Failed to link module '{module}': {cause}")]
    Link {
        /// Name or locator of the module.
        module: String,
        /// Reason for the failure.
        cause: String,
    },

    /// The module's start routine failed.
    #[error("E301: Start routine of module '{module}' failed: {cause}")]
    Init {
        /// Name or locator of the module.
        module: String,
        /// Reason for the failure.
        cause: String,
    },

    // =========================================================================
    // Memory Errors (E400-E499)
    // =========================================================================
    /// Growing linear memory would exceed the configured ceiling.
    #[error("E401: Out of memory: requested {requested} bytes, limit is {limit_pages} pages")]
    OutOfMemory {
        /// Number of bytes requested by the failing call.
        requested: u64,
        /// Configured ceiling in 64 KiB pages.
        limit_pages: u32,
    },

    /// Size/alignment pair is not a valid layout.
    #[error("E402: Invalid layout: size {size}, align {align}")]
    InvalidLayout {
        /// Requested size.
        size: u32,
        /// Requested alignment.
        align: u32,
    },

    /// Host access outside the current memory bounds.
    #[error("E403: Memory access out of bounds: offset {offset}, len {len}, memory size {size}")]
    MemoryAccess {
        /// Start offset of the access.
        offset: u64,
        /// Length of the access.
        len: u64,
        /// Memory size at the time of the access.
        size: u64,
    },

    // =========================================================================
    // Reference Table Errors (E500-E599)
    // =========================================================================
    /// Handle is not allocated, not set, or out of range.
    #[error("E501: Invalid handle {handle}: {cause}")]
    InvalidHandle {
        /// The offending handle.
        handle: u32,
        /// Why the handle was rejected.
        cause: String,
    },

    /// Attempt to modify or release a reserved sentinel slot.
    #[error("E502: Handle {handle} is a reserved sentinel")]
    ReservedHandle {
        /// The sentinel handle.
        handle: u32,
    },

    /// The table reached its maximum capacity.
    #[error("E503: Reference table full at capacity {capacity}")]
    TableFull {
        /// The capacity that could not be exceeded.
        capacity: u32,
    },

    // =========================================================================
    // Closure Errors (E600-E699)
    // =========================================================================
    /// Closure invoked or destroyed after it was destroyed.
    #[error("E601: Closure {handle} used after destroy")]
    UseAfterDestroy {
        /// Table handle of the destroyed closure.
        handle: u32,
    },

    /// Arguments or trampoline do not match the closure's signature.
    #[error("E602: Signature mismatch for closure {handle}: expected {expected}, got {actual}")]
    SignatureMismatch {
        /// Table handle of the closure.
        handle: u32,
        /// Expected signature or arity.
        expected: String,
        /// What was supplied.
        actual: String,
    },

    // =========================================================================
    // Call Errors (E700-E799)
    // =========================================================================
    /// A value was thrown across the boundary.
    #[error("E701: '{export}' threw {value}")]
    Thrown {
        /// Entry point that observed the exception.
        export: String,
        /// The thrown value.
        value: HostValue,
    },

    /// Module fault without an associated stored exception.
    #[error("E702: '{export}' trapped: {cause}")]
    UnknownTrap {
        /// Entry point that trapped.
        export: String,
        /// Trap description from the engine.
        cause: String,
    },

    /// Export is missing or has an unexpected type.
    #[error("E703: Export '{export}' unavailable: {cause}")]
    MissingExport {
        /// Export name.
        export: String,
        /// Reason.
        cause: String,
    },

    // =========================================================================
    // Configuration Errors (E800-E899)
    // =========================================================================
    /// Invalid configuration value.
    #[error("E801: Invalid configuration for '{field}': {cause}")]
    Config {
        /// Configuration field.
        field: String,
        /// Reason the value was rejected.
        cause: String,
    },
}

impl BridgeError {
    /// Get the error code (e.g., "E401").
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Compile { .. } => "E101",
            Self::Link { .. } => "E201",
            Self::Init { .. } => "E301",
            Self::OutOfMemory { .. } => "E401",
            Self::InvalidLayout { .. } => "E402",
            Self::MemoryAccess { .. } => "E403",
            Self::InvalidHandle { .. } => "E501",
            Self::ReservedHandle { .. } => "E502",
            Self::TableFull { .. } => "E503",
            Self::UseAfterDestroy { .. } => "E601",
            Self::SignatureMismatch { .. } => "E602",
            Self::Thrown { .. } => "E701",
            Self::UnknownTrap { .. } => "E702",
            Self::MissingExport { .. } => "E703",
            Self::Config { .. } => "E801",
        }
    }

    /// Check if this error aborted an instantiation.
    ///
    /// Only these leave the host without a module handle; the host decides
    /// whether to re-fetch and try again.
    #[must_use]
    pub fn is_instantiation_error(&self) -> bool {
        matches!(
            self,
            Self::Compile { .. } | Self::Link { .. } | Self::Init { .. }
        )
    }

    /// Check if this error was raised by a reference-table operation.
    #[must_use]
    pub fn is_handle_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidHandle { .. } | Self::ReservedHandle { .. } | Self::TableFull { .. }
        )
    }

    pub(crate) fn invalid_handle(handle: u32, cause: impl Into<String>) -> Self {
        Self::InvalidHandle {
            handle,
            cause: cause.into(),
        }
    }
}

/// Result type alias using `BridgeError`.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_correct() {
        let err = BridgeError::Compile {
            module: "app.wasm".to_string(),
            cause: "bad magic".to_string(),
        };
        assert_eq!(err.code(), "E101");

        let err = BridgeError::UseAfterDestroy { handle: 130 };
        assert_eq!(err.code(), "E601");
    }

    #[test]
    fn error_display() {
        let err = BridgeError::OutOfMemory {
            requested: 4096,
            limit_pages: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("E401"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("2 pages"));
    }

    #[test]
    fn thrown_display_includes_value() {
        let err = BridgeError::Thrown {
            export: "main".to_string(),
            value: HostValue::string("boom"),
        };
        assert!(err.to_string().contains("\"boom\""));
    }

    #[test]
    fn instantiation_errors() {
        assert!(
            BridgeError::Init {
                module: "m".to_string(),
                cause: "trap".to_string()
            }
            .is_instantiation_error()
        );
        assert!(!BridgeError::TableFull { capacity: 8 }.is_instantiation_error());
        assert!(BridgeError::TableFull { capacity: 8 }.is_handle_error());
    }
}

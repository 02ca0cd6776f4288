//! Single-slot channel for values thrown across the boundary.

use crate::error::BridgeError;
use crate::value::HostValue;

/// Holds at most one pending exception per call chain.
#[derive(Debug, Default)]
pub struct ExceptionChannel {
    pending: Option<HostValue>,
}

impl ExceptionChannel {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a thrown value, returning any unread value it replaces.
    pub fn store(&mut self, value: HostValue) -> Option<HostValue> {
        let previous = self.pending.replace(value);
        if let Some(prev) = &previous {
            tracing::warn!(previous = %prev, "pending exception overwritten before it was read");
        }
        previous
    }

    /// Clear the slot and return what it held.
    pub fn take(&mut self) -> Option<HostValue> {
        self.pending.take()
    }

    /// Check if a value is waiting to be read.
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Error for a failed entry-point call: the pending value if there is
    /// one, otherwise an unknown trap.
    pub fn error_for(&mut self, export: &str, cause: impl Into<String>) -> BridgeError {
        match self.take() {
            Some(value) => BridgeError::Thrown {
                export: export.to_string(),
                value,
            },
            None => BridgeError::UnknownTrap {
                export: export.to_string(),
                cause: cause.into(),
            },
        }
    }

    /// Drain the slot after a successful call. A value stored during a call
    /// that returned normally is still reported.
    pub fn check(&mut self, export: &str) -> Result<(), BridgeError> {
        match self.take() {
            Some(value) => Err(BridgeError::Thrown {
                export: export.to_string(),
                value,
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_without_store_is_none() {
        let mut ch = ExceptionChannel::new();
        assert_eq!(ch.take(), None);
        assert!(!ch.is_pending());
    }

    #[test]
    fn store_then_take() {
        let mut ch = ExceptionChannel::new();
        assert_eq!(ch.store(HostValue::string("boom")), None);
        assert!(ch.is_pending());
        assert_eq!(ch.take(), Some(HostValue::string("boom")));
        assert_eq!(ch.take(), None);
    }

    #[test]
    fn store_overwrites() {
        let mut ch = ExceptionChannel::new();
        ch.store(HostValue::Number(1.0));
        assert_eq!(ch.store(HostValue::Number(2.0)), Some(HostValue::Number(1.0)));
        assert_eq!(ch.take(), Some(HostValue::Number(2.0)));
    }

    #[test]
    fn failure_without_store_is_unknown_trap() {
        let mut ch = ExceptionChannel::new();
        let err = ch.error_for("main", "unreachable");
        assert_eq!(err.code(), "E702");

        ch.store(HostValue::Null);
        assert_eq!(ch.error_for("main", "unreachable").code(), "E701");
        assert!(!ch.is_pending());
    }

    #[test]
    fn success_with_pending_value_reports_it() {
        let mut ch = ExceptionChannel::new();
        assert!(ch.check("main").is_ok());
        ch.store(HostValue::string("late"));
        assert!(matches!(ch.check("main"), Err(BridgeError::Thrown { .. })));
        assert!(ch.check("main").is_ok());
    }
}

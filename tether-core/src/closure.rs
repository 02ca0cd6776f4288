//! Closure records and the bridge that wraps, invokes and destroys them.
//!
//! A closure lives in a reference-table slot from the moment it is wrapped
//! until it is destroyed. Destroying retires the slot: the callback is
//! dropped and the slot comes back under a new generation, so a stale
//! handle always reports [`BridgeError::UseAfterDestroy`]. Closure slots
//! cannot be freed through a plain table release.

use crate::error::{BridgeError, Result};
use crate::table::{ExternRefTable, SlotState};
use crate::value::{Extern, HostValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Representation of a value at the module boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbiType {
    /// An opaque host value, passed as an `i32` table handle.
    Ref,
    /// A 32-bit integer.
    I32,
    /// A 64-bit float.
    F64,
}

impl fmt::Display for AbiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ref => "ref",
            Self::I32 => "i32",
            Self::F64 => "f64",
        })
    }
}

impl AbiType {
    /// Check if a host value can cross the boundary as this type.
    pub fn admits(self, value: &HostValue) -> bool {
        match self {
            Self::Ref => true,
            Self::I32 | Self::F64 => value.as_f64().is_some(),
        }
    }
}

/// Parameter and result types of a trampoline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Signature {
    /// Parameter types, excluding the closure handle itself.
    pub params: Vec<AbiType>,
    /// Result type, if the trampoline returns a value.
    pub result: Option<AbiType>,
}

impl Signature {
    /// Create a signature.
    pub fn new(params: impl Into<Vec<AbiType>>, result: Option<AbiType>) -> Self {
        Self {
            params: params.into(),
            result,
        }
    }

    /// Number of parameters.
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Check host arguments for closure `handle` against the parameters.
    pub fn check_args(&self, handle: u32, args: &[HostValue]) -> Result<()> {
        if args.len() != self.arity() {
            return Err(BridgeError::SignatureMismatch {
                handle,
                expected: self.to_string(),
                actual: format!("{} argument(s)", args.len()),
            });
        }
        for (i, (ty, arg)) in self.params.iter().zip(args).enumerate() {
            if !ty.admits(arg) {
                return Err(BridgeError::SignatureMismatch {
                    handle,
                    expected: format!("{} for argument {}", ty, i),
                    actual: arg.type_name().to_string(),
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", p)?;
        }
        f.write_str(")")?;
        if let Some(r) = self.result {
            write!(f, " -> {}", r)?;
        }
        Ok(())
    }
}

/// Identifier of a trampoline signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrampolineId(pub u32);

impl fmt::Display for TrampolineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A host callback. `Err` carries a thrown value.
pub type HostCallback =
    Arc<dyn Fn(&[HostValue]) -> std::result::Result<HostValue, HostValue> + Send + Sync>;

/// What a closure calls into.
#[derive(Clone)]
pub enum ClosureTarget {
    /// A host callback wrapped for module consumption.
    Host(HostCallback),
    /// A module closure, identified by its data and vtable pointers.
    Module {
        /// Closure environment pointer.
        data: u32,
        /// Vtable pointer.
        vtable: u32,
    },
}

impl fmt::Debug for ClosureTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host(_) => f.write_str("Host(..)"),
            Self::Module { data, vtable } => f
                .debug_struct("Module")
                .field("data", data)
                .field("vtable", vtable)
                .finish(),
        }
    }
}

/// A wrapped closure as stored in the reference table.
#[derive(Debug)]
pub struct ClosureRecord {
    trampoline: TrampolineId,
    signature: Signature,
    target: ClosureTarget,
    calls: u64,
}

impl ClosureRecord {
    /// Trampoline the closure is invoked through.
    pub fn trampoline(&self) -> TrampolineId {
        self.trampoline
    }

    /// Signature of that trampoline.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Call target.
    pub fn target(&self) -> &ClosureTarget {
        &self.target
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

/// Owned capability for a wrapped closure.
///
/// Not `Clone`: [`ClosureBridge::destroy`] consumes it, so a destroyed
/// closure cannot be reached through its token again. Dropping the token
/// without destroying leaves the closure alive in the table.
#[derive(Debug, PartialEq, Eq)]
pub struct Closure {
    handle: u32,
    trampoline: TrampolineId,
}

impl Closure {
    /// Table handle of the closure.
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// Trampoline the closure must be invoked through.
    pub fn trampoline(&self) -> TrampolineId {
        self.trampoline
    }
}

/// Registry of trampoline signatures plus the wrap/invoke/destroy operations.
#[derive(Debug, Clone, Default)]
pub struct ClosureBridge {
    trampolines: BTreeMap<TrampolineId, Signature>,
}

impl ClosureBridge {
    /// Create a bridge with no trampolines.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a trampoline signature.
    pub fn register(&mut self, id: TrampolineId, signature: Signature) {
        self.trampolines.insert(id, signature);
    }

    /// Signature declared for a trampoline.
    pub fn signature(&self, id: TrampolineId) -> Option<&Signature> {
        self.trampolines.get(&id)
    }

    /// Declared trampolines in id order.
    pub fn trampolines(&self) -> impl Iterator<Item = (TrampolineId, &Signature)> {
        self.trampolines.iter().map(|(id, sig)| (*id, sig))
    }

    /// Store a host callback behind a new handle.
    pub fn wrap(
        &self,
        table: &mut ExternRefTable<Extern>,
        trampoline: TrampolineId,
        callback: HostCallback,
    ) -> Result<Closure> {
        let handle = self.store(table, trampoline, ClosureTarget::Host(callback))?;
        Ok(Closure { handle, trampoline })
    }

    /// Store a module closure behind a new handle.
    pub fn wrap_module(
        &self,
        table: &mut ExternRefTable<Extern>,
        trampoline: TrampolineId,
        data: u32,
        vtable: u32,
    ) -> Result<u32> {
        self.store(table, trampoline, ClosureTarget::Module { data, vtable })
    }

    /// Take ownership of a closure handle produced elsewhere.
    pub fn claim(&self, table: &ExternRefTable<Extern>, handle: u32) -> Result<Closure> {
        let record = Self::resolve(table, handle)?;
        Ok(Closure {
            handle,
            trampoline: record.trampoline,
        })
    }

    /// Look up a live closure.
    pub fn resolve(table: &ExternRefTable<Extern>, handle: u32) -> Result<&ClosureRecord> {
        if table.state(handle) == SlotState::Retired {
            return Err(BridgeError::UseAfterDestroy { handle });
        }
        table
            .get(handle)?
            .as_closure()
            .ok_or_else(|| BridgeError::invalid_handle(handle, "not a closure"))
    }

    /// Prepare a call: check the trampoline and arity, count the call and
    /// return the target.
    ///
    /// `trampoline` is the trampoline the caller went through, if any.
    pub fn enter(
        table: &mut ExternRefTable<Extern>,
        handle: u32,
        trampoline: Option<TrampolineId>,
        argc: usize,
    ) -> Result<ClosureTarget> {
        Self::resolve(table, handle)?;
        let Extern::Closure(record) = table.get_mut(handle)? else {
            return Err(BridgeError::invalid_handle(handle, "not a closure"));
        };
        if let Some(via) = trampoline {
            if via != record.trampoline {
                return Err(BridgeError::SignatureMismatch {
                    handle,
                    expected: format!("trampoline {}", record.trampoline),
                    actual: format!("trampoline {}", via),
                });
            }
        }
        if argc != record.signature.arity() {
            return Err(BridgeError::SignatureMismatch {
                handle,
                expected: record.signature.to_string(),
                actual: format!("{} argument(s)", argc),
            });
        }
        record.calls += 1;
        tracing::trace!(handle, calls = record.calls, "closure entered");
        Ok(record.target.clone())
    }

    /// Invoke a host closure with host values.
    ///
    /// Arguments are checked against the signature before the callback
    /// runs. Module closures need a running instance and are dispatched by
    /// the runtime instead.
    pub fn invoke(
        table: &mut ExternRefTable<Extern>,
        handle: u32,
        args: &[HostValue],
    ) -> Result<HostValue> {
        Self::resolve(table, handle)?
            .signature()
            .check_args(handle, args)?;
        match Self::enter(table, handle, None, args.len())? {
            ClosureTarget::Host(callback) => {
                callback(args).map_err(|value| BridgeError::Thrown {
                    export: format!("closure {}", handle),
                    value,
                })
            }
            ClosureTarget::Module { .. } => Err(BridgeError::invalid_handle(
                handle,
                "module closure requires an instance",
            )),
        }
    }

    /// Destroy a closure through its owned token.
    pub fn destroy(table: &mut ExternRefTable<Extern>, closure: Closure) -> Result<ClosureRecord> {
        Self::destroy_handle(table, closure.handle)
    }

    /// Destroy a closure by raw handle. A second destroy fails with
    /// [`BridgeError::UseAfterDestroy`].
    pub fn destroy_handle(table: &mut ExternRefTable<Extern>, handle: u32) -> Result<ClosureRecord> {
        Self::resolve(table, handle)?;
        match table.retire(handle)? {
            Some(Extern::Closure(record)) => {
                tracing::debug!(handle, calls = record.calls, "closure destroyed");
                Ok(record)
            }
            _ => Err(BridgeError::invalid_handle(handle, "not a closure")),
        }
    }

    fn store(
        &self,
        table: &mut ExternRefTable<Extern>,
        trampoline: TrampolineId,
        target: ClosureTarget,
    ) -> Result<u32> {
        let signature = self
            .signature(trampoline)
            .cloned()
            .ok_or_else(|| BridgeError::MissingExport {
                export: format!("__wbg_invoke_{}", trampoline),
                cause: "trampoline not declared".to_string(),
            })?;
        let handle = table.insert(Extern::Closure(ClosureRecord {
            trampoline,
            signature,
            target,
            calls: 0,
        }))?;
        tracing::debug!(handle, %trampoline, "closure wrapped");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;

    fn setup() -> (ClosureBridge, ExternRefTable<Extern>) {
        let mut bridge = ClosureBridge::new();
        bridge.register(TrampolineId(0), Signature::new([AbiType::F64], Some(AbiType::F64)));
        bridge.register(TrampolineId(1), Signature::new([], None));
        (bridge, ExternRefTable::new(TableConfig::default()))
    }

    fn doubler() -> HostCallback {
        Arc::new(|args: &[HostValue]| -> std::result::Result<HostValue, HostValue> {
            let n = args[0].as_f64().ok_or_else(|| HostValue::string("not a number"))?;
            Ok(HostValue::Number(n * 2.0))
        })
    }

    #[test]
    fn wrap_invoke_destroy() {
        let (bridge, mut table) = setup();
        let closure = bridge.wrap(&mut table, TrampolineId(0), doubler()).unwrap();
        let handle = closure.handle();

        for _ in 0..2 {
            let out = ClosureBridge::invoke(&mut table, handle, &[HostValue::Number(21.0)]).unwrap();
            assert_eq!(out, HostValue::Number(42.0));
        }

        let record = ClosureBridge::destroy(&mut table, closure).unwrap();
        assert_eq!(record.calls(), 2);

        let err = ClosureBridge::invoke(&mut table, handle, &[HostValue::Number(1.0)]).unwrap_err();
        assert!(matches!(err, BridgeError::UseAfterDestroy { .. }));
        let err = ClosureBridge::destroy_handle(&mut table, handle).unwrap_err();
        assert!(matches!(err, BridgeError::UseAfterDestroy { .. }));
    }

    #[test]
    fn callback_errors_are_thrown_values() {
        let (bridge, mut table) = setup();
        let callback: HostCallback =
            Arc::new(|_: &[HostValue]| -> std::result::Result<HostValue, HostValue> {
                Err(HostValue::string("boom"))
            });
        let closure = bridge.wrap(&mut table, TrampolineId(0), callback).unwrap();
        let err =
            ClosureBridge::invoke(&mut table, closure.handle(), &[HostValue::Number(1.0)]).unwrap_err();
        match err {
            BridgeError::Thrown { value, .. } => assert_eq!(value, HostValue::string("boom")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn argument_types_are_checked_before_the_callback() {
        let (bridge, mut table) = setup();
        let closure = bridge.wrap(&mut table, TrampolineId(0), doubler()).unwrap();
        let err =
            ClosureBridge::invoke(&mut table, closure.handle(), &[HostValue::string("x")]).unwrap_err();
        assert_eq!(err.code(), "E602");
        assert!(err.to_string().contains("f64 for argument 0"));
        assert_eq!(ClosureBridge::resolve(&table, closure.handle()).unwrap().calls(), 0);

        assert!(AbiType::Ref.admits(&HostValue::string("x")));
        assert!(AbiType::I32.admits(&HostValue::Bool(true)));
        assert!(!AbiType::F64.admits(&HostValue::Null));
    }

    #[test]
    fn release_refuses_closures() {
        let (bridge, mut table) = setup();
        let closure = bridge.wrap(&mut table, TrampolineId(0), doubler()).unwrap();
        let handle = closure.handle();

        let err = table.release(handle).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidHandle { .. }));
        assert!(table.take(handle).is_err());

        let noop: HostCallback =
            Arc::new(|_: &[HostValue]| -> std::result::Result<HostValue, HostValue> {
                Ok(HostValue::Undefined)
            });
        let other = bridge.wrap(&mut table, TrampolineId(1), noop).unwrap();
        assert_ne!(other.handle(), handle);

        let out = ClosureBridge::invoke(&mut table, handle, &[HostValue::Number(4.0)]).unwrap();
        assert_eq!(out, HostValue::Number(8.0));
        assert_eq!(table.live_count(), 2);
    }

    #[test]
    fn destroy_churn_reuses_slots() {
        let mut bridge = ClosureBridge::new();
        bridge.register(TrampolineId(0), Signature::new([AbiType::F64], Some(AbiType::F64)));
        let mut table = ExternRefTable::new(
            TableConfig::default()
                .with_initial_capacity(8)
                .with_max_capacity(8),
        );
        let mut stale = Vec::new();
        for _ in 0..100 {
            let closure = bridge.wrap(&mut table, TrampolineId(0), doubler()).unwrap();
            stale.push(closure.handle());
            ClosureBridge::destroy(&mut table, closure).unwrap();
        }
        assert_eq!(table.live_count(), 0);
        for handle in stale {
            let err = ClosureBridge::invoke(&mut table, handle, &[HostValue::Number(1.0)]).unwrap_err();
            assert!(matches!(err, BridgeError::UseAfterDestroy { .. }));
        }
    }

    #[test]
    fn arity_is_checked() {
        let (bridge, mut table) = setup();
        let closure = bridge.wrap(&mut table, TrampolineId(0), doubler()).unwrap();
        let err = ClosureBridge::invoke(&mut table, closure.handle(), &[]).unwrap_err();
        assert_eq!(err.code(), "E602");
        assert_eq!(ClosureBridge::resolve(&table, closure.handle()).unwrap().calls(), 0);
    }

    #[test]
    fn wrong_trampoline_is_rejected() {
        let (bridge, mut table) = setup();
        let h = bridge.wrap_module(&mut table, TrampolineId(1), 16, 32).unwrap();
        let err = ClosureBridge::enter(&mut table, h, Some(TrampolineId(0)), 0).unwrap_err();
        assert!(matches!(err, BridgeError::SignatureMismatch { .. }));
        match ClosureBridge::enter(&mut table, h, Some(TrampolineId(1)), 0).unwrap() {
            ClosureTarget::Module { data, vtable } => assert_eq!((data, vtable), (16, 32)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn undeclared_trampoline() {
        let (bridge, mut table) = setup();
        let err = bridge.wrap(&mut table, TrampolineId(9), doubler()).unwrap_err();
        assert_eq!(err.code(), "E703");
    }

    #[test]
    fn values_are_not_closures() {
        let (_, mut table) = setup();
        let h = table.insert(Extern::Value(HostValue::Null)).unwrap();
        assert!(matches!(
            ClosureBridge::destroy_handle(&mut table, h),
            Err(BridgeError::InvalidHandle { .. })
        ));
        assert_eq!(table.state(h), SlotState::Live);
    }

    #[test]
    fn signature_display() {
        let sig = Signature::new([AbiType::Ref, AbiType::I32], Some(AbiType::F64));
        assert_eq!(sig.to_string(), "(ref, i32) -> f64");
        assert_eq!(Signature::default().to_string(), "()");
    }
}

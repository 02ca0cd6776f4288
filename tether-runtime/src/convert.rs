//! Translation between host values and wasm values at the boundary.
//!
//! Reference arguments flowing into the module get fresh table handles the
//! module then owns; the sentinels are passed by their fixed handles.
//! Reference arguments flowing out are borrowed, reference results are
//! taken out of the table.

use tether_core::table::{sentinel_handle, ExternRefTable, RESERVED_SLOTS};
use tether_core::{AbiType, BridgeError, Extern, HostValue, Result};
use wasmtime::{Val, ValType};

/// Wasm type carrying an ABI type.
pub(crate) fn val_type(ty: AbiType) -> ValType {
    match ty {
        AbiType::Ref | AbiType::I32 => ValType::I32,
        AbiType::F64 => ValType::F64,
    }
}

/// Check a wasm type against an ABI type.
pub(crate) fn accepts(ty: AbiType, val: &ValType) -> bool {
    match ty {
        AbiType::Ref | AbiType::I32 => matches!(val, ValType::I32),
        AbiType::F64 => matches!(val, ValType::F64),
    }
}

/// Zero value of an ABI type, used to pre-size result buffers.
pub(crate) fn zero(ty: AbiType) -> Val {
    match ty {
        AbiType::Ref | AbiType::I32 => Val::I32(0),
        AbiType::F64 => Val::F64(0f64.to_bits()),
    }
}

/// Lower a host value for the module.
///
/// On a type mismatch the error carries `handle` as the closure being
/// called.
pub(crate) fn lower(
    table: &mut ExternRefTable<Extern>,
    handle: u32,
    ty: AbiType,
    value: &HostValue,
) -> Result<Val> {
    let mismatch = || BridgeError::SignatureMismatch {
        handle,
        expected: ty.to_string(),
        actual: value.type_name().to_string(),
    };
    Ok(match ty {
        AbiType::Ref => {
            let h = match sentinel_handle(value) {
                Some(h) => h,
                None => table.insert(Extern::Value(value.clone()))?,
            };
            Val::I32(h as i32)
        }
        AbiType::I32 => Val::I32(value.as_f64().ok_or_else(mismatch)? as i32),
        AbiType::F64 => Val::F64(value.as_f64().ok_or_else(mismatch)?.to_bits()),
    })
}

/// Lift an argument the module passed to the host. References are cloned
/// out of the table and stay owned by the module.
pub(crate) fn lift_arg(table: &ExternRefTable<Extern>, ty: AbiType, val: &Val) -> Result<HostValue> {
    match ty {
        AbiType::Ref => {
            let h = as_handle(val)?;
            let slot = table.get(h)?;
            slot.as_value()
                .cloned()
                .ok_or_else(|| closure_by_value(h))
        }
        _ => lift_primitive(val),
    }
}

/// Lift a result the module returned. A reference result is released from
/// the table unless it is a sentinel.
pub(crate) fn lift_result(
    table: &mut ExternRefTable<Extern>,
    ty: AbiType,
    val: &Val,
) -> Result<HostValue> {
    match ty {
        AbiType::Ref => {
            let h = as_handle(val)?;
            if h < RESERVED_SLOTS {
                return Ok(table.get(h)?.as_value().cloned().unwrap_or_default());
            }
            if table.get(h)?.as_closure().is_some() {
                return Err(closure_by_value(h));
            }
            match table.take(h)? {
                Extern::Value(v) => Ok(v),
                Extern::Closure(_) => Err(closure_by_value(h)),
            }
        }
        _ => lift_primitive(val),
    }
}

fn lift_primitive(val: &Val) -> Result<HostValue> {
    match val {
        Val::I32(i) => Ok(HostValue::Number(*i as f64)),
        Val::I64(i) => Ok(HostValue::Number(*i as f64)),
        Val::F32(bits) => Ok(HostValue::Number(f32::from_bits(*bits) as f64)),
        Val::F64(bits) => Ok(HostValue::Number(f64::from_bits(*bits))),
        other => Err(BridgeError::SignatureMismatch {
            handle: 0,
            expected: "numeric value".to_string(),
            actual: format!("{other:?}"),
        }),
    }
}

fn as_handle(val: &Val) -> Result<u32> {
    match val {
        Val::I32(h) => Ok(*h as u32),
        other => Err(BridgeError::SignatureMismatch {
            handle: 0,
            expected: "i32 handle".to_string(),
            actual: format!("{other:?}"),
        }),
    }
}

fn closure_by_value(handle: u32) -> BridgeError {
    BridgeError::InvalidHandle {
        handle,
        cause: "closures cannot be passed by value".to_string(),
    }
}

//! Host-side values that cross the boundary by reference.
//!
//! The module never sees a [`HostValue`] directly; it only holds the integer
//! handle of the reference-table slot the value lives in.

use crate::closure::ClosureRecord;
use serde_json::Value as JsonValue;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An opaque host value reachable from module code through a handle.
#[derive(Clone, Default)]
pub enum HostValue {
    /// The `undefined` sentinel.
    #[default]
    Undefined,
    /// The `null` sentinel.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number. Every numeric primitive is widened to `f64`.
    Number(f64),
    /// A UTF-8 string.
    String(String),
    /// An owned byte buffer.
    Bytes(Vec<u8>),
    /// Any other host object. Compared by identity.
    Object(Arc<dyn Any + Send + Sync>),
}

impl HostValue {
    /// Create a string value.
    pub fn string(v: impl Into<String>) -> Self {
        Self::String(v.into())
    }

    /// Wrap an arbitrary host object.
    pub fn object<T: Any + Send + Sync>(v: T) -> Self {
        Self::Object(Arc::new(v))
    }

    /// Convert a JSON document. Arrays and objects become opaque objects
    /// holding the JSON value.
    pub fn from_json(v: JsonValue) -> Self {
        match v {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => n.as_f64().map_or(Self::Null, Self::Number),
            JsonValue::String(s) => Self::String(s),
            other => Self::Object(Arc::new(other)),
        }
    }

    /// Check for `undefined`.
    pub fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// Check for `null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view: numbers as-is, booleans as 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// String view.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Downcast an object value.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Object(obj) => obj.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Short type name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Object(_) => "object",
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("Undefined"),
            Self::Null => f.write_str("Null"),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Number(n) => f.debug_tuple("Number").field(n).finish(),
            Self::String(s) => f.debug_tuple("String").field(s).finish(),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Object(obj) => write!(f, "Object({:p})", Arc::as_ptr(obj)),
        }
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => f.write_str("undefined"),
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => write!(f, "{:?}", s),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Object(_) => f.write_str("[object]"),
        }
    }
}

impl From<bool> for HostValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<f64> for HostValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i32> for HostValue {
    fn from(v: i32) -> Self {
        Self::Number(v as f64)
    }
}

impl From<&str> for HostValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for HostValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// What a reference-table slot holds: a plain value or a closure record.
#[derive(Debug)]
pub enum Extern {
    /// A host value.
    Value(HostValue),
    /// A closure callable through a trampoline.
    Closure(ClosureRecord),
}

impl Extern {
    /// Borrow the value, if this slot is not a closure.
    pub fn as_value(&self) -> Option<&HostValue> {
        match self {
            Self::Value(v) => Some(v),
            Self::Closure(_) => None,
        }
    }

    /// Borrow the closure record, if this slot is a closure.
    pub fn as_closure(&self) -> Option<&ClosureRecord> {
        match self {
            Self::Closure(c) => Some(c),
            Self::Value(_) => None,
        }
    }
}

impl From<HostValue> for Extern {
    fn from(v: HostValue) -> Self {
        Self::Value(v)
    }
}

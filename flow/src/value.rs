//! Value - Dynamic Locals and Messages
//!
//! Frames save reference-like locals as `Value`s, and every resumption,
//! mailbox message and return travels as a `Value`.
//!
//! # Sharing
//! Cloning a `Value` duplicates plain data but shares `Opaque` handles, so a
//! copied frame chain still points at the same heap objects (locks, pickers,
//! requests) as the original.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A shared, type-erased heap object carried inside a [`Value`].
///
/// Opaque values cannot be serialized; a flow holding one in a live save
/// slot cannot be passivated.
#[derive(Clone)]
pub struct Opaque(Arc<dyn Any + Send + Sync>);

impl Opaque {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Opaque(Arc::new(value))
    }

    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Opaque(value)
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.0.clone().downcast::<T>().ok()
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Opaque) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opaque")
            .field("refs", &Arc::strong_count(&self.0))
            .finish()
    }
}

/// Dynamic value used for saved locals, messages and results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum Value {
    #[default]
    Unit,
    Bool(bool),
    Int(i64),
    /// Stored by bit pattern, so every `f64` (NaN and infinities included)
    /// survives a process image unchanged.
    Float(#[serde(with = "float_bits")] f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    List(Vec<Value>),
    #[serde(skip)]
    Opaque(Opaque),
}

mod float_bits {
    use super::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.to_bits())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        u64::deserialize(deserializer).map(f64::from_bits)
    }
}

/// The kind of a [`Value`], used to declare function result types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// Accepts every value.
    Any,
    Unit,
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    Json,
    List,
    Opaque,
}

impl ValueKind {
    /// Check whether `value` satisfies this declared kind.
    pub fn accepts(&self, value: &Value) -> bool {
        *self == ValueKind::Any || *self == value.kind()
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Any => "any",
            ValueKind::Unit => "unit",
            ValueKind::Bool => "bool",
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Text => "text",
            ValueKind::Bytes => "bytes",
            ValueKind::Json => "json",
            ValueKind::List => "list",
            ValueKind::Opaque => "opaque",
        };
        f.write_str(name)
    }
}

impl Value {
    /// Wrap a heap object so it can travel through frames and mailboxes.
    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        Value::Opaque(Opaque::new(value))
    }

    /// Wrap an already shared heap object.
    pub fn shared<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Value::Opaque(Opaque::from_arc(value))
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Unit => ValueKind::Unit,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Json(_) => ValueKind::Json,
            Value::List(_) => ValueKind::List,
            Value::Opaque(_) => ValueKind::Opaque,
        }
    }

    pub fn is_unit(&self) -> bool {
        matches!(self, Value::Unit)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Json(j) => Some(j),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Recover a shared heap object stored with [`Value::opaque`] or [`Value::shared`].
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Value::Opaque(o) => o.downcast::<T>(),
            _ => None,
        }
    }

    /// True when the value (recursively) holds no opaque handles.
    pub fn is_serializable(&self) -> bool {
        match self {
            Value::Opaque(_) => false,
            Value::List(items) => items.iter().all(Value::is_serializable),
            _ => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => f.write_str("()"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Json(j) => write!(f, "{j}"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Opaque(_) => f.write_str("<opaque>"),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<serde_json::Value> for Value {
    fn from(j: serde_json::Value) -> Self {
        Value::Json(j)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_accepts() {
        assert!(ValueKind::Any.accepts(&Value::from("x")));
        assert!(ValueKind::Int.accepts(&Value::from(3)));
        assert!(!ValueKind::Int.accepts(&Value::from("3")));
    }

    #[test]
    fn test_opaque_is_shared_by_clone() {
        let v = Value::opaque(vec![1u8, 2, 3]);
        let copy = v.clone();
        assert_eq!(v, copy);
        assert_eq!(copy.downcast::<Vec<u8>>().as_deref(), Some(&vec![1u8, 2, 3]));
        assert!(!copy.is_serializable());
    }

    #[test]
    fn test_opaque_variant_refuses_serialization() {
        let plain = Value::List(vec![Value::Int(1), Value::from("a")]);
        let json = serde_json::to_string(&plain).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plain);

        assert!(serde_json::to_string(&Value::opaque(5u8)).is_err());
    }

    #[test]
    fn test_floats_keep_their_bits() {
        let samples = [
            1.0715660391465826e-75,
            -1.603964615428183e143,
            0.1 + 0.2,
            f64::MIN_POSITIVE,
            -0.0,
            f64::INFINITY,
            f64::NEG_INFINITY,
            f64::NAN,
        ];
        for sample in samples {
            let json = serde_json::to_vec(&Value::Float(sample)).unwrap();
            let back: Value = serde_json::from_slice(&json).unwrap();
            assert_eq!(back.as_float().map(f64::to_bits), Some(sample.to_bits()), "{sample:e}");
        }
    }
}

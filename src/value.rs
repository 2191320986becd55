//! Typed scalar values and column types.
//!
//! Every table column declares a [`DataType`]; every cell holds a [`Value`].
//! Coercion is the only validation the ingest path performs: a value that
//! cannot be coerced to its column's declared type rejects the append, and
//! the replication source retries the batch.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sketch::QuantileSketch;

/// Column data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Bool,
    Int64,
    UInt64,
    Float64,
    String,
    /// Microseconds since the Unix epoch.
    Timestamp,
    /// Partial-aggregate quantile state (see [`QuantileSketch`]).
    Sketch,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Bool => "Bool",
            DataType::Int64 => "Int64",
            DataType::UInt64 => "UInt64",
            DataType::Float64 => "Float64",
            DataType::String => "String",
            DataType::Timestamp => "Timestamp",
            DataType::Sketch => "Sketch",
        };
        write!(f, "{s}")
    }
}

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    String(String),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
    Sketch(QuantileSketch),
}

impl DataType {
    /// Coerce a non-null value to this type.
    ///
    /// Lossless widenings are accepted (integer → float, non-negative
    /// integer ↔ unsigned, integer micros → timestamp); everything else is a
    /// mismatch. Returns `None` when the value cannot represent this type.
    pub fn coerce(&self, value: Value) -> Option<Value> {
        match (self, value) {
            (DataType::Bool, v @ Value::Bool(_)) => Some(v),

            (DataType::Int64, v @ Value::Int64(_)) => Some(v),
            (DataType::Int64, Value::UInt64(u)) => i64::try_from(u).ok().map(Value::Int64),

            (DataType::UInt64, v @ Value::UInt64(_)) => Some(v),
            (DataType::UInt64, Value::Int64(i)) => u64::try_from(i).ok().map(Value::UInt64),

            (DataType::Float64, v @ Value::Float64(_)) => Some(v),
            (DataType::Float64, Value::Int64(i)) => Some(Value::Float64(i as f64)),
            (DataType::Float64, Value::UInt64(u)) => Some(Value::Float64(u as f64)),

            (DataType::String, v @ Value::String(_)) => Some(v),

            (DataType::Timestamp, v @ Value::Timestamp(_)) => Some(v),
            (DataType::Timestamp, Value::Int64(micros)) => Some(Value::Timestamp(micros)),

            (DataType::Sketch, v @ Value::Sketch(_)) => Some(v),

            _ => None,
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The type this value inhabits, or `None` for NULL.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(DataType::Bool),
            Value::Int64(_) => Some(DataType::Int64),
            Value::UInt64(_) => Some(DataType::UInt64),
            Value::Float64(_) => Some(DataType::Float64),
            Value::String(_) => Some(DataType::String),
            Value::Timestamp(_) => Some(DataType::Timestamp),
            Value::Sketch(_) => Some(DataType::Sketch),
        }
    }

    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "Bool",
            Value::Int64(_) => "Int64",
            Value::UInt64(_) => "UInt64",
            Value::Float64(_) => "Float64",
            Value::String(_) => "String",
            Value::Timestamp(_) => "Timestamp",
            Value::Sketch(_) => "Sketch",
        }
    }

    /// Read as a signed integer where representable.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int64(i) => Some(*i),
            Value::UInt64(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    /// Read as a float; integers widen.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float64(f) => Some(*f),
            Value::Int64(i) => Some(*i as f64),
            Value::UInt64(u) => Some(*u as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp_micros(&self) -> Option<i64> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_sketch(&self) -> Option<&QuantileSketch> {
        match self {
            Value::Sketch(s) => Some(s),
            _ => None,
        }
    }

    /// Append a stable, self-delimiting binary encoding of this value.
    ///
    /// Used to build business-key group identifiers: equal values encode to
    /// equal bytes, and the leading tag byte keeps different types (and
    /// NULL) from colliding. Floats encode via their raw bit pattern.
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(0),
            Value::Bool(b) => {
                out.push(1);
                out.push(*b as u8);
            }
            Value::Int64(i) => {
                out.push(2);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Value::UInt64(u) => {
                out.push(3);
                out.extend_from_slice(&u.to_le_bytes());
            }
            Value::Float64(f) => {
                out.push(4);
                out.extend_from_slice(&f.to_bits().to_le_bytes());
            }
            Value::String(s) => {
                out.push(5);
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Timestamp(t) => {
                out.push(6);
                out.extend_from_slice(&t.to_le_bytes());
            }
            Value::Sketch(s) => {
                // Sketches are never sensible key material; encode the
                // observation count so the encoding stays total.
                out.push(7);
                out.extend_from_slice(&s.observed().to_le_bytes());
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int64(i) => write!(f, "{i}"),
            Value::UInt64(u) => write!(f, "{u}"),
            Value::Float64(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Timestamp(t) => write!(f, "ts:{t}"),
            Value::Sketch(s) => write!(f, "sketch[{}]", s.observed()),
        }
    }
}

//! Data types for the gateway.
//!
//! This module defines the protocol-agnostic value model: the [`Value`] read
//! from a point, the [`VariantType`] a controller declares for it, and the
//! [`WriteValue`] accepted from callers together with the coercion that turns
//! one into the other.

use serde::{Deserialize, Serialize};

use crate::core::error::{GatewayError, Result};

/// A protocol-agnostic value representation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Boolean value (common for digital I/O)
    Bool(bool),

    /// Integer value
    Integer(i64),

    /// Floating-point number (most common for analog values)
    Float(f64),

    /// String value
    String(String),

    /// Array value (e.g. a packed command word exposed as bits)
    Array(Vec<Value>),

    /// Null/missing value
    #[default]
    Null,
}

impl Value {
    /// Replace non-finite floats (NaN, ±Infinity) with `Null`, recursively.
    ///
    /// Wire frames must never carry NaN/Infinity tokens.
    #[must_use]
    pub fn sanitized(self) -> Self {
        match self {
            Self::Float(v) if !v.is_finite() => Self::Null,
            Self::Array(items) => Self::Array(items.into_iter().map(Value::sanitized).collect()),
            other => other,
        }
    }
}

/// Data type a controller reports for a point.
///
/// Mirrors the OPC UA builtin scalar types; anything else is carried as
/// `Other` and receives no coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VariantType {
    Boolean,
    SByte,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    String,
    /// Unmapped builtin or structured type id.
    Other(u32),
}

impl VariantType {
    /// Map an OPC UA namespace-0 builtin data type id.
    pub fn from_builtin_id(id: u32) -> Self {
        match id {
            1 => Self::Boolean,
            2 => Self::SByte,
            3 => Self::Byte,
            4 => Self::Int16,
            5 => Self::UInt16,
            6 => Self::Int32,
            7 => Self::UInt32,
            8 => Self::Int64,
            9 => Self::UInt64,
            10 => Self::Float,
            11 => Self::Double,
            12 => Self::String,
            other => Self::Other(other),
        }
    }

    /// Integer kinds.
    pub const fn is_integer(&self) -> bool {
        matches!(
            self,
            Self::SByte
                | Self::Byte
                | Self::Int16
                | Self::UInt16
                | Self::Int32
                | Self::UInt32
                | Self::Int64
                | Self::UInt64
        )
    }

    /// Floating kinds.
    pub const fn is_float(&self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    /// Inclusive range representable by an integer kind.
    fn integer_range(&self) -> Option<(i64, i64)> {
        let range = match self {
            Self::SByte => (i8::MIN as i64, i8::MAX as i64),
            Self::Byte => (0, u8::MAX as i64),
            Self::Int16 => (i16::MIN as i64, i16::MAX as i64),
            Self::UInt16 => (0, u16::MAX as i64),
            Self::Int32 => (i32::MIN as i64, i32::MAX as i64),
            Self::UInt32 => (0, u32::MAX as i64),
            Self::Int64 => (i64::MIN, i64::MAX),
            Self::UInt64 => (0, i64::MAX),
            _ => return None,
        };
        Some(range)
    }
}

impl std::fmt::Display for VariantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other(id) => write!(f, "Other({})", id),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Value supplied by a caller for a write.
///
/// Deserializes from plain JSON: `true`, `12`, `12.5`, `"text"`, or
/// `[true, false]` (bit sequence, only valid for the bit-array command point).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WriteValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Bits(Vec<bool>),
}

impl WriteValue {
    /// Short type label for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "string",
            Self::Bits(_) => "bit sequence",
        }
    }
}

/// Coerce a caller value to the representation required by `target`.
///
/// Boolean targets accept numbers (non-zero is `true`) and the strings
/// `true/false/1/0`. Integer targets truncate finite floats, parse strings and
/// are range-checked against the declared width. Floating targets accept any
/// number or numeric string. Other types pass the value through unchanged.
pub fn coerce(value: &WriteValue, target: VariantType) -> Result<Value> {
    if let WriteValue::Bits(_) = value {
        return Err(GatewayError::Unsupported(format!(
            "a {} cannot be written to a {} point",
            value.kind(),
            target
        )));
    }

    match target {
        VariantType::Boolean => coerce_bool(value).map(Value::Bool),
        t if t.is_integer() => {
            let v = coerce_integer(value)?;
            let (min, max) = t.integer_range().unwrap_or((i64::MIN, i64::MAX));
            if v < min || v > max {
                return Err(GatewayError::invalid(format!(
                    "{} is out of range for {} ({}..={})",
                    v, t, min, max
                )));
            }
            Ok(Value::Integer(v))
        }
        t if t.is_float() => {
            let v = coerce_float(value)?;
            if t == VariantType::Float && v.is_finite() && v.abs() > f32::MAX as f64 {
                return Err(GatewayError::invalid(format!("{} is out of range for Float", v)));
            }
            Ok(Value::Float(v))
        }
        _ => Ok(passthrough(value)),
    }
}

fn coerce_bool(value: &WriteValue) -> Result<bool> {
    match value {
        WriteValue::Bool(b) => Ok(*b),
        WriteValue::Integer(i) => Ok(*i != 0),
        WriteValue::Float(f) => Ok(*f != 0.0),
        WriteValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(GatewayError::invalid(format!("'{}' is not a boolean", s))),
        },
        other @ WriteValue::Bits(_) => Err(GatewayError::invalid(format!(
            "{} is not a boolean",
            other.kind()
        ))),
    }
}

fn coerce_integer(value: &WriteValue) -> Result<i64> {
    match value {
        WriteValue::Bool(b) => Ok(i64::from(*b)),
        WriteValue::Integer(i) => Ok(*i),
        WriteValue::Float(f) => {
            if !f.is_finite() || *f < i64::MIN as f64 || *f > i64::MAX as f64 {
                return Err(GatewayError::invalid(format!("{} is not a representable integer", f)));
            }
            Ok(f.trunc() as i64)
        }
        WriteValue::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| GatewayError::invalid(format!("'{}' is not an integer", s))),
        other @ WriteValue::Bits(_) => Err(GatewayError::invalid(format!(
            "{} is not an integer",
            other.kind()
        ))),
    }
}

fn coerce_float(value: &WriteValue) -> Result<f64> {
    match value {
        WriteValue::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        WriteValue::Integer(i) => Ok(*i as f64),
        WriteValue::Float(f) => Ok(*f),
        WriteValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| GatewayError::invalid(format!("'{}' is not a number", s))),
        other @ WriteValue::Bits(_) => Err(GatewayError::invalid(format!(
            "{} is not a number",
            other.kind()
        ))),
    }
}

fn passthrough(value: &WriteValue) -> Value {
    match value {
        WriteValue::Bool(b) => Value::Bool(*b),
        WriteValue::Integer(i) => Value::Integer(*i),
        WriteValue::Float(f) => Value::Float(*f),
        WriteValue::Text(s) => Value::String(s.clone()),
        WriteValue::Bits(bits) => Value::Array(bits.iter().copied().map(Value::Bool).collect()),
    }
}

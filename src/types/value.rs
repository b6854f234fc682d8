#![forbid(unsafe_code)]

//! Attribute values and their byte encoding.

use super::{EnumValue, Result, StrataError, Timestamp, ValueRepType};

/// Value stored on an assignment edge or a value node.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 text.
    Str(String),
    /// Point in time.
    Time(Timestamp),
    /// Enum token.
    Enum(EnumValue),
    /// Float quantity in the unit family given first.
    QuantityFloat(u32, f64),
    /// Integer quantity in the unit family given first.
    QuantityInt(u32, i64),
    /// Opaque bytes in a caller-defined encoding.
    Serialized(Vec<u8>),
}

impl Value {
    /// Representation type written next to the encoded buffer.
    pub fn rep_type(&self) -> ValueRepType {
        match self {
            Value::Bool(_) => ValueRepType::BOOL,
            Value::Int(_) => ValueRepType::INT,
            Value::Float(_) => ValueRepType::FLOAT,
            Value::Str(_) => ValueRepType::STRING,
            Value::Time(_) => ValueRepType::TIME,
            Value::Enum(ev) => ev.rep_type(),
            Value::QuantityFloat(unit, _) => ValueRepType::quantity_float(*unit),
            Value::QuantityInt(unit, _) => ValueRepType::quantity_int(*unit),
            Value::Serialized(_) => ValueRepType::SERIALIZED,
        }
    }

    /// Encodes the value body; fixed-width fields are big-endian.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Value::Bool(v) => vec![u8::from(*v)],
            Value::Int(v) | Value::QuantityInt(_, v) => v.to_be_bytes().to_vec(),
            Value::Float(v) | Value::QuantityFloat(_, v) => v.to_bits().to_be_bytes().to_vec(),
            Value::Str(s) => s.as_bytes().to_vec(),
            Value::Time(ts) => ts.0.to_be_bytes().to_vec(),
            Value::Enum(ev) => ev.0.to_be_bytes().to_vec(),
            Value::Serialized(raw) => raw.clone(),
        }
    }

    /// Decodes a buffer previously produced by [`Value::encode`].
    pub fn decode(rep: ValueRepType, bytes: &[u8]) -> Result<Value> {
        let value = match rep {
            ValueRepType::BOOL => match bytes {
                [b] => Value::Bool(*b != 0),
                _ => return Err(bad_width(rep, bytes)),
            },
            ValueRepType::INT => Value::Int(i64::from_be_bytes(fixed(rep, bytes)?)),
            ValueRepType::FLOAT => Value::Float(f64::from_bits(u64::from_be_bytes(fixed(rep, bytes)?))),
            ValueRepType::STRING => Value::Str(
                String::from_utf8(bytes.to_vec())
                    .map_err(|err| StrataError::Corruption(format!("string value: {err}")))?,
            ),
            ValueRepType::TIME => Value::Time(Timestamp(i64::from_be_bytes(fixed(rep, bytes)?))),
            ValueRepType::SERIALIZED => Value::Serialized(bytes.to_vec()),
            other => match other.kind() {
                1 => {
                    let ev = EnumValue(u32::from_be_bytes(fixed(rep, bytes)?));
                    if ev.rep_type() != other {
                        return Err(StrataError::Corruption(format!(
                            "enum value {} outside family {}",
                            ev.0, other.0
                        )));
                    }
                    Value::Enum(ev)
                }
                2 => Value::QuantityFloat(
                    other.0 >> 4,
                    f64::from_bits(u64::from_be_bytes(fixed(rep, bytes)?)),
                ),
                3 => Value::QuantityInt(other.0 >> 4, i64::from_be_bytes(fixed(rep, bytes)?)),
                _ => {
                    return Err(StrataError::Corruption(format!(
                        "unknown value representation {}",
                        other.0
                    )))
                }
            },
        };
        Ok(value)
    }
}

fn fixed<const N: usize>(rep: ValueRepType, bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| bad_width(rep, bytes))
}

fn bad_width(rep: ValueRepType, bytes: &[u8]) -> StrataError {
    StrataError::Corruption(format!(
        "value of representation {} has {} bytes",
        rep.0,
        bytes.len()
    ))
}

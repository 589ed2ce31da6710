use serde::Serialize;
use std::fmt;

use super::{Encoding, RegisterEntry};
use crate::error::MeterError;

/// Decoded register content
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Float(f32),
    Unsigned(u32),
    Bits(Vec<u16>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v as f64),
            Value::Unsigned(v) => Some(*v as f64),
            Value::Bits(_) => None,
        }
    }

    /// Integer view of a numeric value. Floats are truncated, the way the meters
    /// store small integers (addresses, baudrate codes) as float32.
    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::Unsigned(v) => Some(*v),
            Value::Float(v) => {
                if v.is_finite() && *v >= 0.0 && (*v as f64) <= u32::MAX as f64 {
                    Some(v.trunc() as u32)
                } else {
                    None
                }
            }
            Value::Bits(_) => None,
        }
    }

    pub fn scaled(self, scale: f32) -> Value {
        if scale == 1.0 {
            return self;
        }
        match self {
            Value::Float(v) => Value::Float(v * scale),
            Value::Unsigned(v) => Value::Float(v as f32 * scale),
            bits => bits,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{v}"),
            Value::Unsigned(v) => write!(f, "{v}"),
            Value::Bits(words) => {
                for w in words {
                    write!(f, "{w:016b}")?;
                }
                Ok(())
            }
        }
    }
}

/// IEEE 754 single precision from two big-endian words, high word first
pub fn words_to_f32(words: &[u16]) -> f32 {
    f32::from_bits(words_to_u32(words))
}

pub fn f32_to_words(value: f32) -> [u16; 2] {
    u32_to_words(value.to_bits())
}

pub fn words_to_u32(words: &[u16]) -> u32 {
    (u32::from(words[0]) << 16) | u32::from(words[1])
}

pub fn u32_to_words(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, value as u16]
}

/// Turns the raw register words of `entry` into a scaled value
pub fn decode(entry: &RegisterEntry, words: &[u16]) -> Result<Value, MeterError> {
    if words.len() != entry.count as usize {
        return Err(MeterError::UnexpectedValue {
            parameter: entry.parameter,
            value: format!("{} registers instead of {}", words.len(), entry.count),
        });
    }

    let value = match entry.encoding {
        Encoding::Float32 => Value::Float(words_to_f32(words)),
        Encoding::UInt32 => Value::Unsigned(words_to_u32(words)),
        Encoding::UInt16 => Value::Unsigned(u32::from(words[0])),
        Encoding::Bitfield => Value::Bits(words.to_vec()),
    };

    return Ok(value.scaled(entry.scale));
}

/// Inverse of [`decode`], produces the payload for a write-multiple-registers request
pub fn encode(entry: &RegisterEntry, value: f64) -> Result<Vec<u16>, MeterError> {
    let raw = if entry.scale == 1.0 { value } else { value / entry.scale as f64 };

    let invalid = |reason: String| MeterError::InvalidValue { parameter: entry.parameter, reason };

    if !raw.is_finite() {
        return Err(invalid(format!("{value} is not a finite number")));
    }

    match entry.encoding {
        Encoding::Float32 => Ok(f32_to_words(raw as f32).to_vec()),
        Encoding::UInt32 => {
            let v = integral(raw, u32::MAX as f64).ok_or_else(|| invalid(format!("{value} does not fit an unsigned 32 bit register")))?;
            Ok(u32_to_words(v as u32).to_vec())
        }
        Encoding::UInt16 | Encoding::Bitfield => {
            let v = integral(raw, u16::MAX as f64).ok_or_else(|| invalid(format!("{value} does not fit an unsigned 16 bit register")))?;
            Ok(vec![v as u16])
        }
    }
}

fn integral(v: f64, max: f64) -> Option<u64> {
    if v < 0.0 || v > max || v.fract() != 0.0 {
        return None;
    }
    Some(v as u64)
}

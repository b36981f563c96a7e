//! Converts raw 16-bit register words into calibrated values.
//!
//! Words are assembled big-endian into a byte sequence, reinterpreted as a
//! signed/unsigned integer or IEEE-754 single-precision float, widened to
//! `f64` and finally multiplied by a power-of-ten scale factor.

use std::str::FromStr;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Sint16,
    Sint32,
    Sint64,
    Uint16,
    Uint32,
    Uint64,
    Float32,
}

impl FromStr for Format {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sint16" => Ok(Format::Sint16),
            "sint32" => Ok(Format::Sint32),
            "sint64" => Ok(Format::Sint64),
            "uint16" => Ok(Format::Uint16),
            "uint32" => Ok(Format::Uint32),
            "uint64" => Ok(Format::Uint64),
            "float32" => Ok(Format::Float32),
            other => Err(AppError::Decode(format!("unknown register format: {other}"))),
        }
    }
}

impl Format {
    /// Number of 16-bit holding registers this format occupies.
    pub fn word_count(self) -> usize {
        match self {
            Format::Sint16 | Format::Uint16 => 1,
            Format::Sint32 | Format::Uint32 | Format::Float32 => 2,
            Format::Sint64 | Format::Uint64 => 4,
        }
    }
}

pub fn decode_registers(words: &[u16], format: Format) -> Result<f64, AppError> {
    let n = format.word_count();
    if words.len() < n {
        return Err(AppError::Decode(format!(
            "register payload too short: need {n} words, got {}",
            words.len()
        )));
    }

    let mut bytes = [0u8; 8];
    for (i, w) in words[..n].iter().enumerate() {
        bytes[i * 2..i * 2 + 2].copy_from_slice(&w.to_be_bytes());
    }

    let v = match format {
        Format::Sint16 => i16::from_be_bytes([bytes[0], bytes[1]]) as f64,
        Format::Sint32 => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        Format::Sint64 => i64::from_be_bytes(bytes) as f64,
        Format::Uint16 => u16::from_be_bytes([bytes[0], bytes[1]]) as f64,
        Format::Uint32 => u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
        Format::Uint64 => u64::from_be_bytes(bytes) as f64,
        Format::Float32 => f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64,
    };

    Ok(v)
}

/// Multiplies by `10^sf`; `sf` may be negative.
pub fn apply_scale_factor(v: f64, sf: i32) -> f64 {
    v * 10f64.powi(sf)
}

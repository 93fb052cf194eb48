//! Element types stored in GPU tensors
//!
//! Only the four encodings the compute shaders consume are supported. The
//! discriminants are stable because they travel inside weight-file headers.

use std::fmt;

use crate::error::{Error, Result};

// ============================================================================
// DType Enum
// ============================================================================

/// Data types supported by gpuml tensors
///
/// # Discriminant Values (Serialization Stability)
///
/// `F16 = 0`, `F32 = 1`, `U32 = 2`, `BF16 = 3`. Existing values are never changed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DType {
    /// 16-bit floating point (IEEE 754)
    F16 = 0,
    /// 32-bit floating point
    F32 = 1,
    /// 32-bit unsigned integer, also the storage type of compressed tensors
    U32 = 2,
    /// 16-bit brain floating point
    BF16 = 3,
}

impl DType {
    /// Size of one element in bytes
    #[inline]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::F32 | Self::U32 => 4,
            Self::F16 | Self::BF16 => 2,
        }
    }

    /// Returns true if this is a floating point type
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16 | Self::BF16)
    }

    /// Returns true for the 16-bit types accepted by the BCML1 codec
    #[inline]
    pub const fn is_half(self) -> bool {
        matches!(self, Self::F16 | Self::BF16)
    }

    /// Short name for display (e.g., "f32", "u32")
    pub const fn short_name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::U32 => "u32",
        }
    }

    /// Parse the stable discriminant
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::F16),
            1 => Ok(Self::F32),
            2 => Ok(Self::U32),
            3 => Ok(Self::BF16),
            other => Err(Error::UnexpectedState {
                reason: format!("unknown dtype discriminant {other}"),
            }),
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_sizes() {
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::U32.size_in_bytes(), 4);
    }

    #[test]
    fn test_discriminants_are_stable() {
        for dt in [DType::F16, DType::F32, DType::U32, DType::BF16] {
            assert_eq!(DType::from_u8(dt as u8).unwrap(), dt);
        }
        assert!(DType::from_u8(9).is_err());
    }

    #[test]
    fn test_dtype_display() {
        assert_eq!(format!("{}", DType::BF16), "bf16");
        assert!(DType::BF16.is_half());
        assert!(!DType::U32.is_float());
    }
}

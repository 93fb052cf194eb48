//! CPU capability probe for the codec and load transforms
//!
//! The probe runs once per process; the result is an immutable value that
//! callers thread through the codec entry points. Tests construct it
//! explicitly to pin behavior independent of the host.

use std::sync::OnceLock;

use crate::error::{Error, Result};

/// CPU capabilities the BCML1 codec and load transforms depend on
///
/// | Architecture | `wide_simd` | `f16_conversion`      |
/// |--------------|-------------|-----------------------|
/// | x86-64       | AVX2        | F16C                  |
/// | ARM64        | NEON        | always (ARMv8 `fcvt`) |
/// | other        | no          | no                    |
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CpuFeatures {
    /// 256-bit integer and float arithmetic (or the platform equivalent)
    pub wide_simd: bool,
    /// Hardware conversion between 16- and 32-bit floats
    pub f16_conversion: bool,
}

impl CpuFeatures {
    /// Every feature present
    pub const fn all() -> Self {
        Self {
            wide_simd: true,
            f16_conversion: true,
        }
    }

    /// No feature present
    pub const fn none() -> Self {
        Self {
            wide_simd: false,
            f16_conversion: false,
        }
    }

    /// Cached probe of the host CPU
    ///
    /// The first call performs detection, subsequent calls return the cached
    /// result.
    #[inline]
    pub fn detect() -> Self {
        *CPU_FEATURES.get_or_init(detect_uncached)
    }

    /// Fail with `UnsupportedHardware` unless both features are present
    pub fn require_codec(self) -> Result<()> {
        if self.wide_simd && self.f16_conversion {
            Ok(())
        } else {
            Err(Error::UnsupportedHardware {
                required: "AVX2 and F16C",
            })
        }
    }

    /// Fail with `UnsupportedHardware` unless 16-bit float conversion is present
    pub fn require_f16_conversion(self) -> Result<()> {
        if self.f16_conversion {
            Ok(())
        } else {
            Err(Error::UnsupportedHardware { required: "F16C" })
        }
    }
}

impl Default for CpuFeatures {
    fn default() -> Self {
        Self::detect()
    }
}

static CPU_FEATURES: OnceLock<CpuFeatures> = OnceLock::new();

/// Perform actual CPU feature detection (called once)
#[cold]
fn detect_uncached() -> CpuFeatures {
    #[cfg(target_arch = "x86_64")]
    {
        CpuFeatures {
            wide_simd: is_x86_feature_detected!("avx2"),
            f16_conversion: is_x86_feature_detected!("f16c"),
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        // NEON and half conversions are mandatory on AArch64
        CpuFeatures::all()
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        CpuFeatures::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_is_cached() {
        assert_eq!(CpuFeatures::detect(), CpuFeatures::detect());
    }

    #[test]
    fn test_requirements() {
        assert!(CpuFeatures::all().require_codec().is_ok());
        let f16_only = CpuFeatures {
            wide_simd: false,
            f16_conversion: true,
        };
        assert!(matches!(
            f16_only.require_codec(),
            Err(Error::UnsupportedHardware { .. })
        ));
        assert!(f16_only.require_f16_conversion().is_ok());
        assert!(CpuFeatures::none().require_f16_conversion().is_err());
    }
}

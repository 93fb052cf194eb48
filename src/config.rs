//! Device configuration

use crate::codec::CpuFeatures;
use crate::error::{Error, Result};

/// Options for opening a [`crate::Device`]
///
/// ```
/// use gpuml::config::DeviceConfig;
/// use gpuml::codec::CpuFeatures;
///
/// let config = DeviceConfig::default()
///     .with_cpu_features(CpuFeatures::all())
///     .with_log_dispatch(true);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    /// CPU capabilities used by the codec and load transforms
    ///
    /// `None` probes the host once per process.
    pub cpu_features: Option<CpuFeatures>,
    /// Worker threads of the compressor pool; must be 1
    pub compressor_threads: usize,
    /// Emit a `trace!` record for every dispatch
    pub log_dispatch: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            cpu_features: None,
            compressor_threads: 1,
            log_dispatch: false,
        }
    }
}

impl DeviceConfig {
    /// Pin the CPU capabilities instead of probing the host
    pub fn with_cpu_features(mut self, features: CpuFeatures) -> Self {
        self.cpu_features = Some(features);
        self
    }

    /// Set the compressor worker count
    pub fn with_compressor_threads(mut self, threads: usize) -> Self {
        self.compressor_threads = threads;
        self
    }

    /// Enable or disable per-dispatch trace records
    pub fn with_log_dispatch(mut self, enabled: bool) -> Self {
        self.log_dispatch = enabled;
        self
    }

    /// Capabilities in effect: the override, or the cached host probe
    pub fn features(&self) -> CpuFeatures {
        self.cpu_features.unwrap_or_else(CpuFeatures::detect)
    }

    /// Check the configuration for values the device can't honor
    pub fn validate(&self) -> Result<()> {
        if self.compressor_threads != 1 {
            return Err(Error::invalid_argument(
                "compressor_threads",
                format!(
                    "the compressor keeps one job in flight on one worker, got {}",
                    self.compressor_threads
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = DeviceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.features(), CpuFeatures::detect());
    }

    #[test]
    fn test_override_and_reject_threads() {
        let config = DeviceConfig::default().with_cpu_features(CpuFeatures::none());
        assert_eq!(config.features(), CpuFeatures::none());

        let bad = config.with_compressor_threads(4);
        assert!(matches!(
            bad.validate(),
            Err(Error::InvalidArgument {
                arg: "compressor_threads",
                ..
            })
        ));
    }
}

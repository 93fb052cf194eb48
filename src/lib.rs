//! # gpuml
//!
//! **GPU-resident tensor backend for ML inference with an asynchronous 4-bit weight compressor.**
//!
//! gpuml manages the device buffers behind tensors, binds them to compute
//! shaders, dispatches work and moves data between host and device. Weights
//! can be quantized on the fly with BCML1, a fixed-ratio 4-bit block codec
//! that runs on a background thread while the device thread keeps working.
//!
//! ## Components
//!
//! - **Tensors**: immutable, read-write, CPU-writable dynamic and staged
//!   downloadable tensors, with a fixed usage class per tensor
//! - **Device**: creates tensors, uploads and streams weights, owns the compressor
//! - **Context**: shader table, constant buffers, slot binding and dispatch
//! - **Codec**: BCML1 compression, panel reshape and load-time transforms
//!
//! ## Quick Start
//!
//! ```rust
//! use gpuml::prelude::*;
//!
//! let device = Device::<CpuRuntime>::open(&CpuRuntime::default_device(), DeviceConfig::default())?;
//! let desc = TensorDesc::new(TensorShape::vector(64), DType::F32, Usage::ReadWrite);
//! let (tensor, _) = device.create_tensor(&desc, None)?;
//!
//! let mut ctx = device.context();
//! ctx.download(&tensor, DownloadFlag::None, |bytes| {
//!     assert_eq!(bytes.len(), 256);
//!     Ok(())
//! })?;
//! # Ok::<(), gpuml::error::Error>(())
//! ```
//!
//! ## Feature Flags
//!
//! - `wgpu`: Cross-platform GPU via WebGPU
//!
//! The CPU backend is always available; it emulates the device contract in
//! host memory and backs the test suite.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

pub mod codec;
pub mod compress;
pub mod config;
pub mod context;
pub mod device;
pub mod dtype;
pub mod error;
pub mod runtime;
pub mod tensor;

pub use context::Context;
pub use device::{Allocation, Device, UploadSource};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::codec::{CpuFeatures, LoadTransform};
    pub use crate::config::DeviceConfig;
    pub use crate::context::Context;
    pub use crate::device::{Allocation, Device, UploadSource};
    pub use crate::dtype::DType;
    pub use crate::error::{Error, Result};
    pub use crate::runtime::{DeviceId, Runtime, RuntimeClient};
    pub use crate::tensor::{DownloadFlag, Layout, Tensor, TensorDesc, TensorShape, Usage};

    pub use crate::runtime::cpu::CpuRuntime;

    #[cfg(feature = "wgpu")]
    pub use crate::runtime::wgpu::WgpuRuntime;
}

/// Default runtime based on enabled features
///
/// - With `wgpu` feature: `WgpuRuntime`
/// - Otherwise: `CpuRuntime`
#[cfg(feature = "wgpu")]
pub type DefaultRuntime = runtime::wgpu::WgpuRuntime;

/// Default runtime based on enabled features
#[cfg(not(feature = "wgpu"))]
pub type DefaultRuntime = runtime::cpu::CpuRuntime;

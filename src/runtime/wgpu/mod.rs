//! WebGPU runtime implementation (requires `wgpu` feature)
//!
//! Drives a real adapter through wgpu: Vulkan, Metal, DX12 or GL depending
//! on the platform. Shaders are WGSL compute modules.
//!
//! # Example
//!
//! ```ignore
//! use gpuml::prelude::*;
//!
//! let device = Device::<WgpuRuntime>::open(&WgpuRuntime::default_device(), DeviceConfig::default())?;
//! println!("{}", device.device_info().name);
//! ```

mod cache;
mod client;
mod device;
pub mod pipeline;
mod resource;
mod runtime;

pub use client::WgpuClient;
pub use device::{WgpuDevice, WgpuError};
pub use resource::{WgpuBuffer, WgpuShader, WgpuView};
pub use runtime::WgpuRuntime;

/// Check if a WebGPU adapter is available on this machine
pub fn is_wgpu_available() -> bool {
    device::query_adapter_info_blocking(0).is_ok()
}

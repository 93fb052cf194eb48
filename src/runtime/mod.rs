//! Runtime backends for GPU tensor execution
//!
//! This module defines the `Runtime` trait, the compute-device contract the
//! rest of the crate is written against, and its implementations.
//!
//! # Architecture
//!
//! ```text
//! Runtime (backend identity)
//! ├── Device (identifies a specific GPU/CPU)
//! ├── Client (opened device, owns queue and bound slot tables)
//! ├── Buffer / View (reference-counted resources)
//! └── Shader (compiled compute program)
//! ```
//!
//! The CPU backend emulates the contract in host memory and is the reference
//! for tests; the WebGPU backend drives a real adapter.

pub mod cpu;

#[cfg(feature = "wgpu")]
pub mod wgpu;

mod traits;

pub use traits::{DeviceId, Runtime, RuntimeClient};

/// What a buffer is used for; fixes its CPU access rules
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// GPU read-only, contents supplied at creation
    Immutable,
    /// GPU read/write, updated from the host with [`WriteMode::Update`]
    ReadWrite,
    /// GPU read-only, overwritten from the host with [`WriteMode::Discard`]
    Dynamic,
    /// CPU-readable copy destination
    Readback,
    /// Shader constants, overwritten with [`WriteMode::Discard`]
    Constant,
}

/// How [`Runtime::write_buffer`] replaces buffer contents
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Previous contents are discarded; for `Dynamic` and `Constant` buffers
    Discard,
    /// Host update of a GPU-resident `ReadWrite` buffer
    Update,
}

/// Binding and dispatch limits of an opened device
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Number of writable view slots
    pub max_write_slots: u32,
    /// Number of readable view slots
    pub max_read_slots: u32,
    /// Largest thread-group count along any one dimension
    pub max_groups_per_dimension: u32,
    /// Largest single buffer
    pub max_buffer_bytes: u64,
}

impl Default for DeviceLimits {
    /// Limits of a D3D11-class device
    fn default() -> Self {
        Self {
            max_write_slots: 8,
            max_read_slots: 128,
            max_groups_per_dimension: 65535,
            max_buffer_bytes: crate::tensor::MAX_BUFFER_BYTES,
        }
    }
}

/// Static identity and capability data of a compute device
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Adapter name
    pub name: String,
    /// Dedicated video memory in bytes, 0 when unknown
    pub vram_bytes: u64,
    /// PCI vendor id, 0 when unknown
    pub vendor: u32,
    /// Backend name, e.g. "cpu" or "vulkan"
    pub backend: String,
    /// Largest thread-group count along any one dimension
    pub max_groups_per_dimension: u32,
}

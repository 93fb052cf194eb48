//! CPU runtime implementation
//!
//! A host-memory emulation of a compute device. Buffers are plain byte
//! vectors, views are typed handles to them, and shaders are either inert
//! (dispatch is recorded only) or backed by a registered Rust kernel.
//!
//! The binding tables and the dispatch log are observable, which makes this
//! backend the reference for the binding protocol in tests.

mod client;
mod device;
mod kernel;
mod resource;
mod runtime;

pub use client::{CpuClient, DispatchRecord};
pub use device::CpuDevice;
pub use kernel::{CpuKernel, KernelArgs};
pub use resource::{CpuBuffer, CpuShader, CpuView};
pub use runtime::CpuRuntime;

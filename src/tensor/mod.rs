//! Tensor types
//!
//! Value types describing tensor geometry ([`TensorShape`], [`TensorDesc`]),
//! the buffer layout planner, and the GPU-resident [`Tensor`] resource.

mod core;
mod desc;
mod id;
mod layout;
mod shape;

pub use core::{DownloadFlag, MemoryUsage, Resize, Tensor};
pub use desc::{Layout, TensorDesc, Usage};
pub use id::TensorId;
pub use layout::{BufferPlan, MAX_BUFFER_BYTES, ViewFormat, compressed_bytes, plan_dense};
pub(crate) use layout::{plan_compressed, plan_elements};
pub use shape::TensorShape;

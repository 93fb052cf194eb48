//! Host-side codecs
//!
//! - [`bcml1`]: the BCML1 block quantization codec and its panel reshape
//! - [`LoadTransform`]: element conversions applied while loading weights
//! - [`CpuFeatures`]: the CPU capability probe both of them consult

pub mod bcml1;
mod features;
mod transform;

pub use features::CpuFeatures;
pub use transform::LoadTransform;

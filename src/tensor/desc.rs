//! Tensor descriptors: geometry plus element encoding and usage class

use std::fmt;

use super::TensorShape;
use crate::dtype::DType;
use crate::error::{Error, Result};

/// How a tensor is used by the compute pipeline
///
/// The usage class is fixed for the lifetime of a tensor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Usage {
    /// Written once at construction, read-only afterwards
    Immutable = 0,
    /// Read and written by compute shaders
    ReadWrite = 1,
    /// Like `ReadWrite`, with a CPU-readable shadow buffer for downloads
    ReadWriteDownload = 2,
    /// Overwritten by the CPU, consumed read-only by compute shaders
    Dynamic = 3,
}

impl Usage {
    /// Parse the stable discriminant
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Immutable),
            1 => Ok(Self::ReadWrite),
            2 => Ok(Self::ReadWriteDownload),
            3 => Ok(Self::Dynamic),
            other => Err(Error::UnexpectedState {
                reason: format!("unknown tensor usage {other}"),
            }),
        }
    }

    /// True for every usage that can be resized in place
    #[inline]
    pub const fn is_mutable(self) -> bool {
        !matches!(self, Self::Immutable)
    }
}

/// Physical arrangement of the elements in the buffer
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Layout {
    /// Plain elements addressed through the strides
    #[default]
    Dense = 0,
    /// BCML1 4-bit block quantization, stored as `u32` words in 64-row panels
    Bcml1 = 1,
}

/// Everything needed to allocate and interpret a tensor
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct TensorDesc {
    /// Sizes and strides
    pub shape: TensorShape,
    /// Element type
    pub dtype: DType,
    /// Usage class
    pub usage: Usage,
    /// Memory layout
    pub layout: Layout,
}

impl TensorDesc {
    /// Dense descriptor
    pub fn new(shape: TensorShape, dtype: DType, usage: Usage) -> Self {
        Self {
            shape,
            dtype,
            usage,
            layout: Layout::Dense,
        }
    }

    /// Same descriptor with another layout
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Same descriptor with another usage
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Number of logical elements
    #[inline]
    pub fn element_count(&self) -> u64 {
        self.shape.element_count()
    }

    /// Number of logical elements, `Overflow` when it doesn't fit a `u64`
    pub fn checked_element_count(&self) -> Result<u64> {
        self.shape
            .checked_element_count()
            .ok_or(Error::Overflow { bytes: u64::MAX })
    }
}

impl fmt::Debug for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorDesc")
            .field("size", &self.shape.size)
            .field("stride", &self.shape.stride)
            .field("dtype", &self.dtype)
            .field("usage", &self.usage)
            .field("layout", &self.layout)
            .finish()
    }
}

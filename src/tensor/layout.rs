//! Buffer layout planner
//!
//! Turns a [`TensorDesc`] into the physical size and view format of the
//! buffer that backs it.

use super::{Layout, TensorDesc, Usage};
use crate::dtype::DType;
use crate::error::{Error, Result};

/// Hard ceiling on a single buffer, imposed by the 32-bit size fields
pub const MAX_BUFFER_BYTES: u64 = 1 << 31;

/// Element format of the shader-visible views over a buffer
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ViewFormat {
    /// IEEE half floats
    R16Float,
    /// 16-bit words the shader unpacks itself (BF16)
    R16Uint,
    /// 32-bit floats
    R32Float,
    /// 32-bit unsigned integers, also used for compressed payloads
    R32Uint,
}

impl ViewFormat {
    /// Native view format for an element type
    pub const fn for_dtype(dtype: DType) -> Self {
        match dtype {
            DType::F16 => Self::R16Float,
            DType::BF16 => Self::R16Uint,
            DType::F32 => Self::R32Float,
            DType::U32 => Self::R32Uint,
        }
    }
}

/// Physical buffer description produced by the planner
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferPlan {
    /// Usage class of the owning tensor
    pub usage: Usage,
    /// Bytes per element
    pub element_size: usize,
    /// Number of elements in the buffer
    pub element_count: usize,
    /// Shader view format
    pub format: ViewFormat,
}

impl BufferPlan {
    /// Total byte size
    #[inline]
    pub fn bytes(&self) -> usize {
        self.element_size * self.element_count
    }
}

/// Plan a dense buffer
///
/// Compressed layouts are rejected here; their geometry comes from the codec.
pub fn plan_dense(desc: &TensorDesc) -> Result<BufferPlan> {
    if desc.layout != Layout::Dense {
        return Err(Error::NotImplemented {
            feature: "buffer planning for compressed layouts",
        });
    }
    plan_elements(desc, desc.checked_element_count()?)
}

/// Plan a dense buffer with room for `count` elements of `desc.dtype`
pub(crate) fn plan_elements(desc: &TensorDesc, count: u64) -> Result<BufferPlan> {
    let element_size = desc.dtype.size_in_bytes();
    let bytes = count
        .checked_mul(element_size as u64)
        .ok_or(Error::Overflow { bytes: u64::MAX })?;
    check_buffer_bytes(bytes)?;
    Ok(BufferPlan {
        usage: desc.usage,
        element_size,
        element_count: count as usize,
        format: ViewFormat::for_dtype(desc.dtype),
    })
}

/// Plan the buffer of a BCML1 tensor whose descriptor came from the codec
pub(crate) fn plan_compressed(desc: &TensorDesc) -> Result<BufferPlan> {
    if desc.layout != Layout::Bcml1 || desc.dtype != DType::U32 {
        return Err(Error::invalid_argument(
            "desc",
            "compressed tensors must be BCML1 layout with u32 storage",
        ));
    }
    let bytes = compressed_bytes(desc);
    check_buffer_bytes(bytes)?;
    Ok(BufferPlan {
        usage: desc.usage,
        element_size: 4,
        element_count: (bytes / 4) as usize,
        format: ViewFormat::R32Uint,
    })
}

/// Payload size of a compressed descriptor: `stride[3] * size[3]`
#[inline]
pub fn compressed_bytes(desc: &TensorDesc) -> u64 {
    desc.shape.stride[3] as u64 * desc.shape.size[3] as u64
}

fn check_buffer_bytes(bytes: u64) -> Result<()> {
    if bytes > MAX_BUFFER_BYTES {
        return Err(Error::Overflow { bytes });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TensorShape;

    #[test]
    fn test_plan_dense() {
        let desc = TensorDesc::new(TensorShape::matrix(10, 3), DType::F16, Usage::ReadWrite);
        let plan = plan_dense(&desc).unwrap();
        assert_eq!(plan.element_size, 2);
        assert_eq!(plan.element_count, 30);
        assert_eq!(plan.bytes(), 60);
        assert_eq!(plan.format, ViewFormat::R16Float);
    }

    #[test]
    fn test_plan_rejects_compressed_layout() {
        let desc = TensorDesc::new(TensorShape::vector(32), DType::F16, Usage::Immutable)
            .with_layout(Layout::Bcml1);
        assert!(matches!(
            plan_dense(&desc),
            Err(Error::NotImplemented { .. })
        ));
    }

    #[test]
    fn test_plan_overflow() {
        // 2^29 f32 elements are exactly 2GB, one more row overflows
        let ok = TensorDesc::new(TensorShape::matrix(1 << 20, 512), DType::F32, Usage::Immutable);
        assert!(plan_dense(&ok).is_ok());
        let big = TensorDesc::new(TensorShape::matrix(1 << 20, 513), DType::F32, Usage::Immutable);
        assert!(matches!(plan_dense(&big), Err(Error::Overflow { .. })));
    }
}

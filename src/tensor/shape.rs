//! Four-dimensional tensor geometry

use std::fmt;

/// Size and stride of a tensor, 4 dimensions of 32-bit unsigned integers
///
/// `size[0]` is the innermost (row) dimension. Dense strides are
/// `[1, s0, s0*s1, s0*s1*s2]`, in elements.
///
/// Compressed tensors reuse `stride` to carry codec geometry in bytes; see
/// [`crate::codec::bcml1::make_desc`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct TensorShape {
    /// Number of elements along each dimension
    pub size: [u32; 4],
    /// Offsets between consecutive elements along each dimension
    pub stride: [u32; 4],
}

impl TensorShape {
    /// Create a dense shape from sizes
    pub fn dense(size: [u32; 4]) -> Self {
        let mut stride = [0u32; 4];
        let mut acc = 1u32;
        for (s, &n) in stride.iter_mut().zip(size.iter()) {
            *s = acc;
            acc = acc.wrapping_mul(n);
        }
        Self { size, stride }
    }

    /// Create a dense row vector of `n` elements
    pub fn vector(n: u32) -> Self {
        Self::dense([n, 1, 1, 1])
    }

    /// Create a dense matrix with `cols` elements per row
    pub fn matrix(cols: u32, rows: u32) -> Self {
        Self::dense([cols, rows, 1, 1])
    }

    /// Total number of elements, or `None` when the product overflows `u64`
    #[inline]
    pub fn checked_element_count(&self) -> Option<u64> {
        checked_product(&self.size)
    }

    /// Total number of elements: the product of the four sizes
    ///
    /// Saturates at `u64::MAX`; buffer planning goes through
    /// [`TensorShape::checked_element_count`].
    #[inline]
    pub fn element_count(&self) -> u64 {
        self.checked_element_count().unwrap_or(u64::MAX)
    }

    /// Number of rows, i.e. every dimension except the innermost
    #[inline]
    pub fn count_rows(&self) -> u64 {
        checked_product(&self.size[1..]).unwrap_or(u64::MAX)
    }

    /// Number of `size[0] x size[1]` layers
    #[inline]
    pub fn count_layers(&self) -> u64 {
        self.size[2] as u64 * self.size[3] as u64
    }

    /// True when all four sizes match, regardless of strides
    #[inline]
    pub fn is_same_shape(&self, other: &TensorShape) -> bool {
        self.size == other.size
    }

    /// True when the outermost stride spans the whole tensor without padding
    ///
    /// A shape whose element count overflows is never dense.
    #[inline]
    pub fn is_dense(&self) -> bool {
        self.checked_element_count()
            .is_some_and(|n| self.stride[3] as u64 * self.size[3] as u64 == n)
    }
}

fn checked_product(sizes: &[u32]) -> Option<u64> {
    sizes
        .iter()
        .try_fold(1u64, |acc, &s| acc.checked_mul(s as u64))
}

impl fmt::Debug for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TensorShape(size={:?}, stride={:?})", self.size, self.stride)
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.size;
        write!(f, "[{a}, {b}, {c}, {d}]")
    }
}

//! BCML1: fixed-ratio 4-bit block quantization
//!
//! Every row of a tensor is split into blocks of 32 elements. A block becomes
//! five `u32` words:
//!
//! ```text
//! word 0      : f16 scale (bits 0..16) | f16 offset (bits 16..32)
//! words 1..=4 : 32 four-bit indices, index i in word 1 + i/8 at bit 4*(i%8)
//! ```
//!
//! Decoding is `scale * q + offset`. A partial last block is padded by
//! repeating the last element of the row, so the padding never widens the
//! block's range.
//!
//! After compression the rows of each `size[0] x size[1]` layer are grouped
//! into panels of 64 rows, and each panel is transposed so that word `c` of
//! row `r` lands at `c * 64 + r`. Threads walking one block-column across the
//! 64 rows of a panel then read contiguous memory. An incomplete final panel
//! is zero-padded to 64 rows.

use half::{bf16, f16};

use super::CpuFeatures;
use crate::dtype::DType;
use crate::error::{Error, Result, try_zeroed_vec};
use crate::tensor::{Layout, MAX_BUFFER_BYTES, TensorDesc, TensorShape, Usage, compressed_bytes};

/// Source elements per block
pub const BLOCK_ELEMENTS: usize = 32;

/// Compressed `u32` words per block
pub const BLOCK_WORDS: usize = 5;

/// Rows per panel
pub const PANEL_HEIGHT: usize = 64;

/// Largest quantization index
const MAX_INDEX: f32 = 15.0;

// ============================================================================
// Geometry
// ============================================================================

/// Compressed layout of a tensor, in `u32` words
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Elements per source row (`size[0]`)
    pub width: usize,
    /// Rows per layer (`size[1]`)
    pub rows: usize,
    /// Number of layers (`size[2] * size[3]`)
    pub layers: usize,
    /// Words per compressed row
    pub row_words: usize,
    /// Panels per layer
    pub panels: usize,
}

impl Geometry {
    fn checked(size: [u32; 4]) -> Result<Self> {
        if size.contains(&0) {
            return Err(Error::invalid_argument(
                "desc.shape",
                format!("compressed tensors can't have empty dimensions: {size:?}"),
            ));
        }
        let width = size[0] as u64;
        let rows = size[1] as u64;
        let layers = size[2] as u64 * size[3] as u64;
        let row_words = width.div_ceil(BLOCK_ELEMENTS as u64) * BLOCK_WORDS as u64;
        let panels = rows.div_ceil(PANEL_HEIGHT as u64);

        let total_bytes = [4, PANEL_HEIGHT as u64, panels, layers]
            .into_iter()
            .try_fold(row_words, u64::checked_mul)
            .ok_or(Error::Overflow { bytes: u64::MAX })?;
        if total_bytes > MAX_BUFFER_BYTES {
            return Err(Error::Overflow { bytes: total_bytes });
        }
        Ok(Self {
            width: width as usize,
            rows: rows as usize,
            layers: layers as usize,
            row_words: row_words as usize,
            panels: panels as usize,
        })
    }

    /// Geometry of a descriptor produced by [`make_desc`]
    pub fn of(desc: &TensorDesc) -> Result<Self> {
        if desc.layout != Layout::Bcml1 || desc.dtype != DType::U32 {
            return Err(Error::invalid_argument(
                "desc",
                "expected a BCML1 descriptor with u32 storage",
            ));
        }
        let g = Self::checked(desc.shape.size)?;
        let expected = g.total_words() as u64 * 4;
        if desc.shape.stride[1] as usize != g.row_bytes() || compressed_bytes(desc) != expected {
            return Err(Error::invalid_argument(
                "desc.shape.stride",
                format!(
                    "strides {:?} don't match the BCML1 geometry of {:?}",
                    desc.shape.stride, desc.shape.size
                ),
            ));
        }
        Ok(g)
    }

    /// Bytes per compressed row
    #[inline]
    pub fn row_bytes(&self) -> usize {
        self.row_words * 4
    }

    /// Words per panel
    #[inline]
    pub fn panel_words(&self) -> usize {
        self.row_words * PANEL_HEIGHT
    }

    /// Words per layer
    #[inline]
    pub fn layer_words(&self) -> usize {
        self.panel_words() * self.panels
    }

    /// Words of the whole tensor
    #[inline]
    pub fn total_words(&self) -> usize {
        self.layer_words() * self.layers
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// Descriptor of the compressed tensor for a dense half-float `desc`
///
/// `desc` must be an immutable BCML1 descriptor with F16 or BF16 elements.
/// The result keeps the sizes and stores `u32` words; its strides are
///
/// ```text
/// stride[0] = 0
/// stride[1] = bytes per compressed row (a panel is 64 of them)
/// stride[2] = bytes per layer (panel bytes * panel count)
/// stride[3] = stride[2] * size[2]
/// ```
pub fn make_desc(desc: &TensorDesc, features: CpuFeatures) -> Result<TensorDesc> {
    if desc.layout != Layout::Bcml1 {
        return Err(Error::invalid_argument(
            "desc.layout",
            "make_desc expects a BCML1 layout",
        ));
    }
    if desc.usage != Usage::Immutable {
        return Err(Error::NotImplemented {
            feature: "BCML1 compression of mutable tensors",
        });
    }
    if !desc.dtype.is_half() {
        return Err(Error::NotImplemented {
            feature: "BCML1 compression of types other than f16 and bf16",
        });
    }
    let g = Geometry::checked(desc.shape.size)?;
    features.require_codec()?;

    let layer_bytes = (g.layer_words() * 4) as u32;
    let volume_bytes = layer_bytes
        .checked_mul(desc.shape.size[2])
        .ok_or(Error::Overflow { bytes: u64::MAX })?;
    let stride = [0, g.row_bytes() as u32, layer_bytes, volume_bytes];
    Ok(TensorDesc {
        shape: TensorShape {
            size: desc.shape.size,
            stride,
        },
        dtype: DType::U32,
        usage: Usage::Immutable,
        layout: Layout::Bcml1,
    })
}

// ============================================================================
// Blocks
// ============================================================================

/// Quantize 32 values into one block
pub fn compress_block(values: &[f32; BLOCK_ELEMENTS]) -> [u32; BLOCK_WORDS] {
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let dist = max - min;
    let mul = if dist > 0.0 { MAX_INDEX / dist } else { 0.0 };

    let scale = f16::from_f32(dist / MAX_INDEX).to_bits() as u32;
    let offset = f16::from_f32(min).to_bits() as u32;

    let mut block = [0u32; BLOCK_WORDS];
    block[0] = scale | (offset << 16);
    for (i, &v) in values.iter().enumerate() {
        let q = ((v - min) * mul).round_ties_even().min(MAX_INDEX) as u32;
        block[1 + i / 8] |= q << (4 * (i % 8));
    }
    block
}

/// Dequantize one block
pub fn decode_block(block: &[u32; BLOCK_WORDS]) -> [f32; BLOCK_ELEMENTS] {
    let scale = f16::from_bits(block[0] as u16).to_f32();
    let offset = f16::from_bits((block[0] >> 16) as u16).to_f32();
    std::array::from_fn(|i| {
        let q = (block[1 + i / 8] >> (4 * (i % 8))) & 0xF;
        scale * q as f32 + offset
    })
}

fn compress_row(src: &[u16], upcast: fn(u16) -> f32, dst: &mut [u32]) {
    for (chunk, out) in src
        .chunks(BLOCK_ELEMENTS)
        .zip(dst.chunks_exact_mut(BLOCK_WORDS))
    {
        let last = chunk.len() - 1;
        let values: [f32; BLOCK_ELEMENTS] = std::array::from_fn(|i| upcast(chunk[i.min(last)]));
        out.copy_from_slice(&compress_block(&values));
    }
}

// ============================================================================
// Panels
// ============================================================================

/// Transpose one panel from row-major to column-interleaved order
///
/// `src` holds 64 rows of `width_words` words; `dst[c * 64 + r] = src[r * width_words + c]`.
pub fn reshape_panel(dst: &mut [u32], src: &[u32], width_words: usize) {
    debug_assert_eq!(src.len(), width_words * PANEL_HEIGHT);
    debug_assert_eq!(dst.len(), src.len());
    for (r, row) in src.chunks_exact(width_words).enumerate() {
        for (c, &word) in row.iter().enumerate() {
            dst[c * PANEL_HEIGHT + r] = word;
        }
    }
}

/// Inverse of [`reshape_panel`]
pub fn unreshape_panel(dst: &mut [u32], src: &[u32], width_words: usize) {
    debug_assert_eq!(src.len(), width_words * PANEL_HEIGHT);
    debug_assert_eq!(dst.len(), src.len());
    for (r, row) in dst.chunks_exact_mut(width_words).enumerate() {
        for (c, word) in row.iter_mut().enumerate() {
            *word = src[c * PANEL_HEIGHT + r];
        }
    }
}

// ============================================================================
// Tensors
// ============================================================================

fn upcast_fn(source: DType) -> Result<fn(u16) -> f32> {
    match source {
        DType::F16 => Ok(|bits| f16::from_bits(bits).to_f32()),
        DType::BF16 => Ok(|bits| bf16::from_bits(bits).to_f32()),
        _ => Err(Error::NotImplemented {
            feature: "BCML1 compression of types other than f16 and bf16",
        }),
    }
}

/// Compress a dense half-float tensor
///
/// `desc` is the output of [`make_desc`], `input` holds the dense source
/// elements of type `source`. `out` is overwritten; pass a recycled vector
/// to avoid reallocating.
pub fn compress(
    desc: &TensorDesc,
    source: DType,
    input: &[u16],
    out: &mut Vec<u32>,
    features: CpuFeatures,
) -> Result<()> {
    features.require_codec()?;
    let upcast = upcast_fn(source)?;
    let g = Geometry::of(desc)?;
    let layer_elements = g.width * g.rows;
    if input.len() != layer_elements * g.layers {
        return Err(Error::invalid_argument(
            "input",
            format!(
                "expected {} elements, got {}",
                layer_elements * g.layers,
                input.len()
            ),
        ));
    }

    let total = g.total_words();
    out.clear();
    out.try_reserve_exact(total)
        .map_err(|_| Error::OutOfMemory { size: total * 4 })?;
    out.resize(total, 0);
    let mut panel = try_zeroed_vec::<u32>(g.panel_words())?;

    for (src_layer, dst_layer) in input
        .chunks_exact(layer_elements)
        .zip(out.chunks_exact_mut(g.layer_words()))
    {
        for (src_panel, dst_panel) in src_layer
            .chunks(g.width * PANEL_HEIGHT)
            .zip(dst_layer.chunks_exact_mut(g.panel_words()))
        {
            panel.fill(0);
            for (src_row, dst_row) in src_panel
                .chunks_exact(g.width)
                .zip(panel.chunks_exact_mut(g.row_words))
            {
                compress_row(src_row, upcast, dst_row);
            }
            reshape_panel(dst_panel, &panel, g.row_words);
        }
    }
    Ok(())
}

/// Decode a compressed tensor back to dense `f32` rows
///
/// Panel and block padding is dropped; the result has `size[0]` elements per
/// row in row-major order.
pub fn decompress(desc: &TensorDesc, words: &[u32]) -> Result<Vec<f32>> {
    let g = Geometry::of(desc)?;
    if words.len() != g.total_words() {
        return Err(Error::invalid_argument(
            "words",
            format!("expected {} words, got {}", g.total_words(), words.len()),
        ));
    }

    let mut out = try_zeroed_vec::<f32>(g.width * g.rows * g.layers)?;
    let mut panel = try_zeroed_vec::<u32>(g.panel_words())?;

    for (src_layer, dst_layer) in words
        .chunks_exact(g.layer_words())
        .zip(out.chunks_exact_mut(g.width * g.rows))
    {
        for (src_panel, dst_panel) in src_layer
            .chunks_exact(g.panel_words())
            .zip(dst_layer.chunks_mut(g.width * PANEL_HEIGHT))
        {
            unreshape_panel(&mut panel, src_panel, g.row_words);
            for (src_row, dst_row) in panel
                .chunks_exact(g.row_words)
                .zip(dst_panel.chunks_exact_mut(g.width))
            {
                for (block, dst) in src_row
                    .chunks_exact(BLOCK_WORDS)
                    .zip(dst_row.chunks_mut(BLOCK_ELEMENTS))
                {
                    let mut words = [0u32; BLOCK_WORDS];
                    words.copy_from_slice(block);
                    let values = decode_block(&words);
                    dst.copy_from_slice(&values[..dst.len()]);
                }
            }
        }
    }
    Ok(out)
}

//! Buffer, view and shader handles of the WebGPU backend

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::runtime::BufferKind;
use crate::tensor::ViewFormat;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SHADER_ID: AtomicU64 = AtomicU64::new(1);

/// WebGPU requires copy sizes and buffer sizes to be multiples of 4 bytes
pub(crate) const COPY_ALIGNMENT: usize = 4;

/// Round a byte count up to the copy alignment
#[inline]
pub(crate) fn aligned(bytes: usize) -> usize {
    bytes.div_ceil(COPY_ALIGNMENT) * COPY_ALIGNMENT
}

// ============================================================================
// WgpuBuffer
// ============================================================================

/// Reference-counted `wgpu::Buffer` with its kind and logical size
///
/// The allocation is rounded up to 4 bytes; [`WgpuBuffer::len`] reports the
/// size that was requested.
#[derive(Clone)]
pub struct WgpuBuffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    id: u64,
    kind: BufferKind,
    bytes: usize,
    raw: wgpu::Buffer,
}

impl WgpuBuffer {
    pub(super) fn new(kind: BufferKind, bytes: usize, raw: wgpu::Buffer) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                bytes,
                raw,
            }),
        }
    }

    /// Unique id of the allocation
    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Kind the buffer was created with
    #[inline]
    pub fn kind(&self) -> BufferKind {
        self.inner.kind
    }

    /// Requested size in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.bytes
    }

    /// True for a zero-sized buffer, which the backend never creates
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.bytes == 0
    }

    /// The underlying wgpu buffer
    #[inline]
    pub fn raw(&self) -> &wgpu::Buffer {
        &self.inner.raw
    }
}

impl fmt::Debug for WgpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuBuffer")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("bytes", &self.inner.bytes)
            .finish()
    }
}

// ============================================================================
// WgpuView
// ============================================================================

/// Storage-buffer binding of a buffer, read-only or read-write
#[derive(Clone, Debug)]
pub struct WgpuView {
    pub(super) buffer: WgpuBuffer,
    pub(super) format: ViewFormat,
    pub(super) writable: bool,
}

impl WgpuView {
    /// The viewed buffer
    pub fn buffer(&self) -> &WgpuBuffer {
        &self.buffer
    }

    /// Element format the shader sees
    pub fn format(&self) -> ViewFormat {
        self.format
    }
}

// ============================================================================
// WgpuShader
// ============================================================================

/// Compiled WGSL compute module with a `main` entry point
#[derive(Clone)]
pub struct WgpuShader {
    pub(super) id: u64,
    pub(super) module: Arc<wgpu::ShaderModule>,
}

impl WgpuShader {
    pub(super) fn new(module: wgpu::ShaderModule) -> Self {
        Self {
            id: NEXT_SHADER_ID.fetch_add(1, Ordering::Relaxed),
            module: Arc::new(module),
        }
    }

    /// Unique id of the shader
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Debug for WgpuShader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuShader").field("id", &self.id).finish()
    }
}

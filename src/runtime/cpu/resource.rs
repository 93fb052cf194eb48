//! Host-memory buffers, views and shaders of the CPU backend

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::kernel::CpuKernel;
use crate::runtime::BufferKind;
use crate::tensor::ViewFormat;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_SHADER_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// CpuBuffer
// ============================================================================

/// Reference-counted host allocation standing in for a GPU buffer
///
/// Memory is released when the last clone drops.
#[derive(Clone)]
pub struct CpuBuffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    id: u64,
    kind: BufferKind,
    data: Mutex<Vec<u8>>,
}

impl CpuBuffer {
    pub(super) fn new(kind: BufferKind, data: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                kind,
                data: Mutex::new(data),
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

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.inner.data.lock().len()
    }

    /// True for zero-sized buffers
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current contents, for inspection in tests
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.data.lock().clone()
    }

    pub(super) fn with_data<T>(&self, f: impl FnOnce(&mut Vec<u8>) -> T) -> T {
        let mut guard = self.inner.data.lock();
        f(&mut guard)
    }

    /// Number of live handles to this allocation
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl fmt::Debug for CpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuBuffer")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("len", &self.len())
            .finish()
    }
}

// ============================================================================
// CpuView
// ============================================================================

/// Read or write view over a [`CpuBuffer`]
#[derive(Clone, Debug)]
pub struct CpuView {
    pub(super) buffer: CpuBuffer,
    pub(super) format: ViewFormat,
    pub(super) writable: bool,
}

impl CpuView {
    /// Underlying buffer
    pub fn buffer(&self) -> &CpuBuffer {
        &self.buffer
    }

    /// Element format of the view
    pub fn format(&self) -> ViewFormat {
        self.format
    }

    /// True for write views
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

// ============================================================================
// CpuShader
// ============================================================================

/// Compiled CPU "shader": the bytecode plus an optional host kernel
#[derive(Clone)]
pub struct CpuShader {
    pub(super) id: u64,
    pub(super) bytecode: Arc<[u8]>,
    pub(super) kernel: Option<CpuKernel>,
}

impl CpuShader {
    pub(super) fn new(bytecode: &[u8], kernel: Option<CpuKernel>) -> Self {
        Self {
            id: NEXT_SHADER_ID.fetch_add(1, Ordering::Relaxed),
            bytecode: bytecode.into(),
            kernel,
        }
    }

    /// Unique id of the shader
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Bytecode the shader was created from
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }
}

impl fmt::Debug for CpuShader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuShader")
            .field("id", &self.id)
            .field("bytes", &self.bytecode.len())
            .field("has_kernel", &self.kernel.is_some())
            .finish()
    }
}

//! Execution context: shader table, resource binding and dispatch
//!
//! A context drives one device from the thread that owns it. Every call is
//! synchronous and strictly ordered; nothing here is shared across threads.
//!
//! Binding follows the slot model of the compute device: write views occupy
//! slots `0..writes.len()`, read views slots `0..reads.len()`, and constants
//! live in one constant buffer per dispatch. Rebinding fewer tensors than the
//! previous call clears the stale trailing slots, so a dispatch never sees a
//! tensor that wasn't bound for it.

use std::fmt;
use std::io::Write;
use std::ops::Range;
use tracing::{debug, trace, warn};

use crate::error::{Error, LogOnError, Result};
use crate::runtime::{BufferKind, DeviceLimits, Runtime, WriteMode};
use crate::tensor::{DownloadFlag, Tensor, TensorShape, Usage};

/// Granularity of constant buffer size classes, in bytes
pub const CONSTANT_CLASS_BYTES: usize = 16;

/// Number of reusable constant buffer size classes (16 to 128 bytes)
pub const CONSTANT_CLASSES: usize = 8;

// ============================================================================
// Constant buffer pool
// ============================================================================

/// One reusable constant buffer per 16-byte size class
///
/// The first use of a class allocates its buffer; later uses only rewrite
/// the contents.
struct ConstantPool<R: Runtime> {
    buffers: [Option<R::Buffer>; CONSTANT_CLASSES],
}

impl<R: Runtime> ConstantPool<R> {
    fn new() -> Self {
        Self {
            buffers: std::array::from_fn(|_| None),
        }
    }

    /// Size class of a constant block; 0 means no constants
    fn class_of(bytes: usize) -> usize {
        bytes.div_ceil(CONSTANT_CLASS_BYTES)
    }

    /// Buffer holding `data`, `None` for an empty block
    fn update(&mut self, client: &R::Client, data: &[u8]) -> Result<Option<R::Buffer>> {
        let class = Self::class_of(data.len());
        if class == 0 {
            return Ok(None);
        }
        let slot = self
            .buffers
            .get_mut(class - 1)
            .ok_or(Error::OutOfBounds {
                index: class - 1,
                size: CONSTANT_CLASSES,
            })?;

        if let Some(buffer) = slot {
            R::write_buffer(client, buffer, WriteMode::Discard, |dst| {
                dst[..data.len()].copy_from_slice(data);
                dst[data.len()..].fill(0);
                Ok(())
            })?;
            return Ok(Some(buffer.clone()));
        }

        let bytes = class * CONSTANT_CLASS_BYTES;
        let buffer = R::create_buffer(client, BufferKind::Constant, bytes, Some(data))?;
        debug!(bytes, "created constant buffer");
        *slot = Some(buffer.clone());
        Ok(Some(buffer))
    }
}

// ============================================================================
// Context
// ============================================================================

/// Binds tensors and shaders and dispatches compute work
///
/// Created by [`crate::Device::context`].
pub struct Context<R: Runtime> {
    client: R::Client,
    limits: DeviceLimits,
    log_dispatch: bool,
    shaders: Vec<R::Shader>,
    bound_shader: Option<usize>,
    constants: ConstantPool<R>,
    bound_writes: usize,
    bound_reads: usize,
}

impl<R: Runtime> Context<R> {
    pub(crate) fn new(client: R::Client, log_dispatch: bool) -> Self {
        let limits = R::limits(&client);
        Self {
            client,
            limits,
            log_dispatch,
            shaders: Vec::new(),
            bound_shader: None,
            constants: ConstantPool::new(),
            bound_writes: 0,
            bound_reads: 0,
        }
    }

    /// The runtime client this context drives
    pub fn client(&self) -> &R::Client {
        &self.client
    }

    /// Number of entries in the shader table
    pub fn shader_count(&self) -> usize {
        self.shaders.len()
    }

    /// Index of the bound shader
    pub fn bound_shader(&self) -> Option<usize> {
        self.bound_shader
    }

    /// Number of write and read slots currently bound
    pub fn bound_slots(&self) -> (usize, usize) {
        (self.bound_writes, self.bound_reads)
    }

    // ========================================================================
    // Shaders
    // ========================================================================

    /// Compile every `span` of `blob` into the shader table
    ///
    /// The table is replaced only when all shaders compile; on failure the
    /// previous table stays in place.
    pub fn create_compute_shaders(&mut self, spans: &[Range<usize>], blob: &[u8]) -> Result<()> {
        self.create_shaders_impl(spans, blob)
            .log_on_error("Context::create_compute_shaders")
    }

    fn create_shaders_impl(&mut self, spans: &[Range<usize>], blob: &[u8]) -> Result<()> {
        let mut shaders = Vec::new();
        shaders
            .try_reserve_exact(spans.len())
            .map_err(|_| Error::OutOfMemory {
                size: spans.len() * std::mem::size_of::<R::Shader>(),
            })?;
        for span in spans {
            let bytecode = blob.get(span.clone()).ok_or(Error::OutOfBounds {
                index: span.end,
                size: blob.len(),
            })?;
            shaders.push(R::create_shader(&self.client, bytecode)?);
        }
        debug!(count = shaders.len(), bytes = blob.len(), "created compute shaders");
        self.shaders = shaders;
        self.bound_shader = None;
        Ok(())
    }

    /// Make shader `id` current and upload its constants
    ///
    /// An empty `constants` block binds no constant buffer.
    pub fn bind_shader(&mut self, id: usize, constants: &[u8]) -> Result<()> {
        self.bind_shader_impl(id, constants)
            .log_on_error("Context::bind_shader")
    }

    fn bind_shader_impl(&mut self, id: usize, constants: &[u8]) -> Result<()> {
        let shader = self.shaders.get(id).ok_or(Error::OutOfBounds {
            index: id,
            size: self.shaders.len(),
        })?;
        let buffer = self.constants.update(&self.client, constants)?;
        R::bind_shader(&self.client, shader);
        R::bind_constants(&self.client, buffer.as_ref());
        self.bound_shader = Some(id);
        Ok(())
    }

    // ========================================================================
    // Tensor binding
    // ========================================================================

    /// Bind `writes` to the write slots and `reads` to the read slots
    ///
    /// Needs between 1 and `max_write_slots` writable tensors and at most
    /// `max_read_slots` readable ones. Slots left over from a previous call
    /// are cleared.
    pub fn bind_tensors(&mut self, writes: &[&Tensor<R>], reads: &[&Tensor<R>]) -> Result<()> {
        self.bind_tensors_impl(writes, reads)
            .log_on_error("Context::bind_tensors")
    }

    fn bind_tensors_impl(&mut self, writes: &[&Tensor<R>], reads: &[&Tensor<R>]) -> Result<()> {
        let max_writes = self.limits.max_write_slots as usize;
        let max_reads = self.limits.max_read_slots as usize;
        if writes.is_empty() || writes.len() > max_writes {
            return Err(Error::invalid_argument(
                "writes",
                format!("{} writable tensors, expected 1..={max_writes}", writes.len()),
            ));
        }
        if reads.len() > max_reads {
            return Err(Error::invalid_argument(
                "reads",
                format!("{} readable tensors, expected at most {max_reads}", reads.len()),
            ));
        }

        let mut write_views = Vec::with_capacity(writes.len().max(self.bound_writes));
        for tensor in writes {
            let view = tensor.write_view().ok_or_else(|| {
                Error::invalid_argument(
                    "writes",
                    format!("{:?} tensor {} has no write view", tensor.usage(), tensor.id()),
                )
            })?;
            write_views.push(Some(view));
        }
        let mut read_views = Vec::with_capacity(reads.len().max(self.bound_reads));
        for tensor in reads {
            let view = tensor.read_view().ok_or(Error::UninitializedResource)?;
            read_views.push(Some(view));
        }

        // Stale trailing slots from the previous call
        write_views.resize(writes.len().max(self.bound_writes), None);
        read_views.resize(reads.len().max(self.bound_reads), None);

        R::bind_write_views(&self.client, &write_views);
        R::bind_read_views(&self.client, &read_views);
        self.bound_writes = writes.len();
        self.bound_reads = reads.len();
        Ok(())
    }

    /// Clear every read slot; a no-op when none is bound
    pub fn unbind_inputs(&mut self) {
        if self.bound_reads == 0 {
            return;
        }
        R::bind_read_views(&self.client, &vec![None; self.bound_reads]);
        self.bound_reads = 0;
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Run the bound shader over a `x * y * z` grid of thread groups
    ///
    /// Each dimension must be in `1..=max_groups_per_dimension`.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.dispatch_impl([x, y, z]).log_on_error("Context::dispatch")
    }

    fn dispatch_impl(&mut self, groups: [u32; 3]) -> Result<()> {
        let max = self.limits.max_groups_per_dimension;
        if let Some(bad) = groups.iter().position(|&g| g == 0 || g > max) {
            return Err(Error::invalid_argument(
                "groups",
                format!(
                    "dimension {bad} of {groups:?} is outside 1..={max}"
                ),
            ));
        }
        let shader = self.bound_shader.ok_or(Error::NullReference {
            what: "dispatch without a bound shader",
        })?;
        if self.log_dispatch {
            trace!(shader, ?groups, "dispatch");
        }
        R::dispatch(&self.client, groups)
    }

    // ========================================================================
    // Transfers
    // ========================================================================

    /// Copy `src` into `dst` on the device
    ///
    /// Sizes, types and layouts aren't checked: the copy covers the smaller
    /// of the two buffers, with a warning when they differ.
    pub fn copy(&mut self, dst: &Tensor<R>, src: &Tensor<R>) -> Result<()> {
        self.copy_impl(dst, src).log_on_error("Context::copy")
    }

    fn copy_impl(&mut self, dst: &Tensor<R>, src: &Tensor<R>) -> Result<()> {
        if dst.usage() == Usage::Immutable {
            return Err(Error::invalid_argument(
                "dst",
                "immutable tensors can't be copy destinations",
            ));
        }
        let (Some(dst_buffer), Some(src_buffer)) = (dst.buffer(), src.buffer()) else {
            return Err(Error::UninitializedResource);
        };
        let dst_bytes = R::buffer_bytes(&dst_buffer);
        let src_bytes = R::buffer_bytes(&src_buffer);
        if dst_bytes != src_bytes {
            warn!(
                dst = %dst.id(),
                src = %src.id(),
                dst_bytes,
                src_bytes,
                "copy between tensors of different sizes"
            );
        }
        R::copy_region(&self.client, &dst_buffer, &src_buffer, dst_bytes.min(src_bytes))
    }

    /// Resize a mutable tensor to `shape` and let `fill` write its contents
    ///
    /// `fill` receives exactly `shape.element_count()` elements worth of
    /// bytes. Its error is returned after the mapping has been released.
    pub fn write_dynamic(
        &mut self,
        tensor: &Tensor<R>,
        shape: TensorShape,
        fill: impl FnOnce(&mut [u8]) -> Result<()>,
    ) -> Result<()> {
        self.write_dynamic_impl(tensor, shape, fill)
            .log_on_error("Context::write_dynamic")
    }

    fn write_dynamic_impl(
        &mut self,
        tensor: &Tensor<R>,
        shape: TensorShape,
        fill: impl FnOnce(&mut [u8]) -> Result<()>,
    ) -> Result<()> {
        if !tensor.usage().is_mutable() {
            return Err(Error::invalid_argument(
                "tensor",
                "write_dynamic needs a mutable tensor",
            ));
        }
        let mut desc = tensor.desc();
        desc.shape = shape;
        tensor.resize(&self.client, &desc)?;
        tensor.replace_data(&self.client, fill)
    }

    /// Read a tensor back to the host, or run one phase of a staged download
    ///
    /// With [`DownloadFlag::None`] the whole tensor is copied and passed to
    /// `read`. `ReadWriteDownload` tensors also accept the two phases
    /// separately: `CopyToStaging` queues the device-side copy, a later
    /// `ReadStaging` maps the staging buffer.
    pub fn download(
        &mut self,
        tensor: &Tensor<R>,
        flag: DownloadFlag,
        read: impl FnOnce(&[u8]) -> Result<()>,
    ) -> Result<()> {
        tensor
            .download(&self.client, flag, read)
            .log_on_error("Context::download")
    }

    /// Stream the full buffer of an immutable tensor into `sink`
    pub fn write_tensor_data(&mut self, tensor: &Tensor<R>, mut sink: impl Write) -> Result<()> {
        tensor
            .read_immutable(&self.client, |data| {
                sink.write_all(data)?;
                Ok(())
            })
            .log_on_error("Context::write_tensor_data")
    }
}

impl<R: Runtime> fmt::Debug for Context<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("shaders", &self.shaders.len())
            .field("bound_shader", &self.bound_shader)
            .field("bound_writes", &self.bound_writes)
            .field("bound_reads", &self.bound_reads)
            .finish()
    }
}

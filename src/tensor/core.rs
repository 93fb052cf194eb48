//! GPU-resident tensor resource

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::layout::{BufferPlan, plan_compressed, plan_elements};
use super::{Layout, TensorDesc, TensorId, TensorShape, Usage};
use crate::error::{Error, Result};
use crate::runtime::{BufferKind, Runtime, WriteMode};

/// Phase selector for [`crate::Context::download`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum DownloadFlag {
    /// Synchronous copy and read
    #[default]
    None,
    /// Staging tensors only: copy into the staging buffer, don't read
    CopyToStaging,
    /// Staging tensors only: read what an earlier copy left in the staging buffer
    ReadStaging,
}

/// What [`Tensor`] resize did to the underlying buffers
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resize {
    /// The new element count fit the capacity; only the descriptor changed
    InPlace,
    /// New buffers were allocated
    Reallocated,
}

/// Memory held by one tensor, in bytes
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    /// Device-resident buffer
    pub vram: u64,
    /// CPU-readable shadow buffer of staging tensors
    pub staging: u64,
}

// ============================================================================
// Tensor
// ============================================================================

/// A GPU buffer with a descriptor and a fixed usage class
///
/// Handles are cheap to clone and share one resource; the buffers are
/// released when the last handle drops. Tensors are created by
/// [`crate::Device`] only.
///
/// The usage class picks the variant:
///
/// | Usage               | Write view | Resizable | Extra                      |
/// |---------------------|------------|-----------|----------------------------|
/// | `Immutable`         | no         | no        | may start uninitialized    |
/// | `ReadWrite`         | yes        | yes       |                            |
/// | `Dynamic`           | no         | yes       | CPU discard-writes         |
/// | `ReadWriteDownload` | yes        | yes       | CPU-readable staging copy  |
pub struct Tensor<R: Runtime> {
    inner: Arc<Inner<R>>,
}

struct Inner<R: Runtime> {
    id: TensorId,
    state: RwLock<State<R>>,
}

struct State<R: Runtime> {
    desc: TensorDesc,
    /// Largest element count the current buffers hold
    capacity: u64,
    variant: Variant<R>,
}

struct Resource<R: Runtime> {
    buffer: R::Buffer,
    read: R::View,
}

enum Variant<R: Runtime> {
    Immutable {
        resource: Option<Resource<R>>,
    },
    ReadWrite {
        resource: Resource<R>,
        write: R::View,
    },
    Dynamic {
        resource: Resource<R>,
    },
    Staging {
        resource: Resource<R>,
        write: R::View,
        staging: R::Buffer,
    },
}

impl<R: Runtime> Variant<R> {
    fn resource(&self) -> Option<&Resource<R>> {
        match self {
            Self::Immutable { resource } => resource.as_ref(),
            Self::ReadWrite { resource, .. }
            | Self::Dynamic { resource }
            | Self::Staging { resource, .. } => Some(resource),
        }
    }
}

impl<R: Runtime> Clone for Tensor<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Runtime> Tensor<R> {
    fn from_state(state: State<R>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: TensorId::new(),
                state: RwLock::new(state),
            }),
        }
    }

    /// Allocate a mutable tensor
    pub(crate) fn create(client: &R::Client, desc: &TensorDesc) -> Result<Self> {
        if !desc.usage.is_mutable() {
            return Err(Error::invalid_argument(
                "desc.usage",
                "immutable tensors need initial data",
            ));
        }
        if desc.layout != Layout::Dense {
            return Err(Error::NotImplemented {
                feature: "mutable tensors with a compressed layout",
            });
        }
        let count = desc.checked_element_count()?;
        let plan = plan_elements(desc, count)?;
        let variant = allocate::<R>(client, &plan)?;
        let tensor = Self::from_state(State {
            desc: *desc,
            capacity: count,
            variant,
        });
        debug!(
            tensor = %tensor.id(),
            usage = ?desc.usage,
            bytes = plan.bytes(),
            "created tensor"
        );
        Ok(tensor)
    }

    /// Create an immutable tensor from its full payload
    pub(crate) fn immutable(client: &R::Client, desc: &TensorDesc, data: &[u8]) -> Result<Self> {
        let tensor = Self::uninitialized(desc)?;
        tensor.create_immutable_raw(client, data)?;
        Ok(tensor)
    }

    /// Create an immutable tensor with no buffer yet
    pub(crate) fn uninitialized(desc: &TensorDesc) -> Result<Self> {
        if desc.usage != Usage::Immutable {
            return Err(Error::invalid_argument(
                "desc.usage",
                "only immutable tensors can be created uninitialized",
            ));
        }
        Ok(Self::from_state(State {
            desc: *desc,
            capacity: desc.element_count(),
            variant: Variant::Immutable { resource: None },
        }))
    }

    /// Initialize an immutable tensor with its payload
    ///
    /// Fails with `AlreadyInitialized` when the tensor already has a buffer.
    pub(crate) fn create_immutable_raw(&self, client: &R::Client, data: &[u8]) -> Result<()> {
        let mut state = self.inner.state.write();
        let plan = match state.desc.layout {
            Layout::Dense => {
                let count = state.desc.checked_element_count()?;
                plan_elements(&state.desc, count)?
            }
            Layout::Bcml1 => plan_compressed(&state.desc)?,
        };
        let Variant::Immutable { resource } = &mut state.variant else {
            return Err(Error::invalid_argument(
                "tensor",
                "raw initialization is only valid for immutable tensors",
            ));
        };
        if resource.is_some() {
            return Err(Error::AlreadyInitialized);
        }
        if data.len() != plan.bytes() {
            return Err(Error::invalid_argument(
                "data",
                format!("expected {} bytes, got {}", plan.bytes(), data.len()),
            ));
        }
        let buffer = R::create_buffer(client, BufferKind::Immutable, plan.bytes(), Some(data))?;
        let read = R::create_read_view(client, &buffer, plan.format)?;
        *resource = Some(Resource { buffer, read });
        debug!(tensor = %self.id(), bytes = plan.bytes(), "initialized immutable tensor");
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Unique id of this tensor
    #[inline]
    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    /// Current descriptor
    pub fn desc(&self) -> TensorDesc {
        self.inner.state.read().desc
    }

    /// Current shape
    pub fn shape(&self) -> TensorShape {
        self.inner.state.read().desc.shape
    }

    /// Usage class, fixed for the lifetime of the tensor
    pub fn usage(&self) -> Usage {
        self.inner.state.read().desc.usage
    }

    /// Largest element count the current buffers can hold
    pub fn capacity(&self) -> u64 {
        self.inner.state.read().capacity
    }

    /// True once the tensor has a backing buffer
    pub fn is_initialized(&self) -> bool {
        self.inner.state.read().variant.resource().is_some()
    }

    /// Shader-readable view, `None` while uninitialized
    pub fn read_view(&self) -> Option<R::View> {
        let state = self.inner.state.read();
        state.variant.resource().map(|r| r.read.clone())
    }

    /// Shader-writable view, `None` for immutable and dynamic tensors
    pub fn write_view(&self) -> Option<R::View> {
        match &self.inner.state.read().variant {
            Variant::ReadWrite { write, .. } | Variant::Staging { write, .. } => {
                Some(write.clone())
            }
            Variant::Immutable { .. } | Variant::Dynamic { .. } => None,
        }
    }

    /// Device buffer, `None` while uninitialized
    pub fn buffer(&self) -> Option<R::Buffer> {
        let state = self.inner.state.read();
        state.variant.resource().map(|r| r.buffer.clone())
    }

    /// Bytes held by this tensor's buffers
    pub fn memory_footprint(&self) -> MemoryUsage {
        let state = self.inner.state.read();
        let vram = state
            .variant
            .resource()
            .map_or(0, |r| R::buffer_bytes(&r.buffer) as u64);
        let staging = match &state.variant {
            Variant::Staging { staging, .. } => R::buffer_bytes(staging) as u64,
            _ => 0,
        };
        MemoryUsage { vram, staging }
    }

    // ========================================================================
    // Shape changes
    // ========================================================================

    /// Reinterpret the tensor with another shape of the same element count
    pub fn view(&self, shape: TensorShape) -> Result<()> {
        let mut state = self.inner.state.write();
        if state.desc.layout != Layout::Dense {
            return Err(Error::NotImplemented {
                feature: "views of compressed tensors",
            });
        }
        if shape.element_count() != state.desc.element_count() {
            return Err(Error::invalid_argument(
                "shape",
                format!(
                    "view of {} elements over a tensor of {}",
                    shape.element_count(),
                    state.desc.element_count()
                ),
            ));
        }
        state.desc.shape = shape;
        Ok(())
    }

    /// Change the logical shape without touching the buffers
    ///
    /// The new element count must fit the capacity.
    pub fn reshape(&self, shape: TensorShape) -> Result<()> {
        let mut state = self.inner.state.write();
        if state.desc.layout != Layout::Dense {
            return Err(Error::NotImplemented {
                feature: "reshaping compressed tensors",
            });
        }
        if shape.element_count() > state.capacity {
            return Err(Error::invalid_argument(
                "shape",
                format!(
                    "{} elements exceed the capacity of {}",
                    shape.element_count(),
                    state.capacity
                ),
            ));
        }
        state.desc.shape = shape;
        Ok(())
    }

    /// Resize a mutable tensor to `desc`
    ///
    /// Reallocates only when the element count exceeds the capacity; the
    /// capacity never shrinks.
    pub(crate) fn resize(&self, client: &R::Client, desc: &TensorDesc) -> Result<Resize> {
        let mut state = self.inner.state.write();
        if !state.desc.usage.is_mutable() {
            return Err(Error::invalid_argument(
                "tensor",
                "immutable tensors can't be resized",
            ));
        }
        if desc.usage != state.desc.usage {
            return Err(Error::invalid_argument(
                "desc.usage",
                format!(
                    "can't change usage from {:?} to {:?}",
                    state.desc.usage, desc.usage
                ),
            ));
        }
        if desc.dtype != state.desc.dtype {
            return Err(Error::invalid_argument(
                "desc.dtype",
                format!(
                    "can't change dtype from {} to {}",
                    state.desc.dtype, desc.dtype
                ),
            ));
        }
        if desc.layout != Layout::Dense {
            return Err(Error::NotImplemented {
                feature: "resizing to a compressed layout",
            });
        }

        let count = desc.checked_element_count()?;
        if count <= state.capacity {
            state.desc = *desc;
            return Ok(Resize::InPlace);
        }

        let plan = plan_elements(desc, count)?;
        state.variant = allocate::<R>(client, &plan)?;
        state.capacity = count;
        state.desc = *desc;
        debug!(tensor = %self.id(), bytes = plan.bytes(), "reallocated tensor");
        Ok(Resize::Reallocated)
    }

    // ========================================================================
    // Host transfers
    // ========================================================================

    /// Let `fill` write the logical contents of a mutable tensor
    pub(crate) fn replace_data(
        &self,
        client: &R::Client,
        fill: impl FnOnce(&mut [u8]) -> Result<()>,
    ) -> Result<()> {
        let state = self.inner.state.read();
        let bytes = logical_bytes(&state.desc);
        let (buffer, mode) = match &state.variant {
            Variant::Dynamic { resource } => (&resource.buffer, WriteMode::Discard),
            Variant::ReadWrite { resource, .. } | Variant::Staging { resource, .. } => {
                (&resource.buffer, WriteMode::Update)
            }
            Variant::Immutable { .. } => {
                return Err(Error::invalid_argument(
                    "tensor",
                    "immutable tensors can't be overwritten",
                ));
            }
        };
        R::write_buffer(client, buffer, mode, |data| fill(&mut data[..bytes]))
    }

    /// Read back the logical contents, or run one phase of a staged download
    pub(crate) fn download(
        &self,
        client: &R::Client,
        flag: DownloadFlag,
        read: impl FnOnce(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let state = self.inner.state.read();
        let resource = state
            .variant
            .resource()
            .ok_or(Error::UninitializedResource)?;
        if state.desc.layout != Layout::Dense {
            return Err(Error::NotImplemented {
                feature: "downloading compressed tensors",
            });
        }
        let bytes = logical_bytes(&state.desc);

        if let Variant::Staging { staging, .. } = &state.variant {
            if flag != DownloadFlag::ReadStaging {
                R::copy_region(client, staging, &resource.buffer, bytes)?;
            }
            if flag != DownloadFlag::CopyToStaging {
                R::map_read(client, staging, |data| read(&data[..bytes]))?;
            }
            return Ok(());
        }

        if flag != DownloadFlag::None {
            return Err(Error::invalid_argument(
                "flag",
                "staged download phases need a ReadWriteDownload tensor",
            ));
        }
        read_through_temporary::<R>(client, &resource.buffer, bytes, read)
    }

    /// Read the whole buffer of an immutable tensor
    pub(crate) fn read_immutable(
        &self,
        client: &R::Client,
        read: impl FnOnce(&[u8]) -> Result<()>,
    ) -> Result<()> {
        let state = self.inner.state.read();
        let Variant::Immutable { resource } = &state.variant else {
            return Err(Error::NotImplemented {
                feature: "serializing tensors other than immutable ones",
            });
        };
        let resource = resource.as_ref().ok_or(Error::UninitializedResource)?;
        let bytes = R::buffer_bytes(&resource.buffer);
        read_through_temporary::<R>(client, &resource.buffer, bytes, read)
    }
}

fn logical_bytes(desc: &TensorDesc) -> usize {
    desc.element_count() as usize * desc.dtype.size_in_bytes()
}

fn read_through_temporary<R: Runtime>(
    client: &R::Client,
    buffer: &R::Buffer,
    bytes: usize,
    read: impl FnOnce(&[u8]) -> Result<()>,
) -> Result<()> {
    let temp = R::create_buffer(client, BufferKind::Readback, bytes, None)?;
    R::copy_region(client, &temp, buffer, bytes)?;
    R::map_read(client, &temp, |data| read(&data[..bytes]))
}

fn allocate<R: Runtime>(client: &R::Client, plan: &BufferPlan) -> Result<Variant<R>> {
    let bytes = plan.bytes();
    Ok(match plan.usage {
        Usage::ReadWrite => {
            let buffer = R::create_buffer(client, BufferKind::ReadWrite, bytes, None)?;
            let read = R::create_read_view(client, &buffer, plan.format)?;
            let write = R::create_write_view(client, &buffer, plan.format)?;
            Variant::ReadWrite {
                resource: Resource { buffer, read },
                write,
            }
        }
        Usage::ReadWriteDownload => {
            let buffer = R::create_buffer(client, BufferKind::ReadWrite, bytes, None)?;
            let read = R::create_read_view(client, &buffer, plan.format)?;
            let write = R::create_write_view(client, &buffer, plan.format)?;
            let staging = R::create_buffer(client, BufferKind::Readback, bytes, None)?;
            Variant::Staging {
                resource: Resource { buffer, read },
                write,
                staging,
            }
        }
        Usage::Dynamic => {
            let buffer = R::create_buffer(client, BufferKind::Dynamic, bytes, None)?;
            let read = R::create_read_view(client, &buffer, plan.format)?;
            Variant::Dynamic {
                resource: Resource { buffer, read },
            }
        }
        Usage::Immutable => {
            return Err(Error::UnexpectedState {
                reason: "immutable tensors are not allocated empty".into(),
            });
        }
    })
}

impl<R: Runtime> fmt::Debug for Tensor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("Tensor")
            .field("id", &self.inner.id)
            .field("desc", &state.desc)
            .field("capacity", &state.capacity)
            .field("initialized", &state.variant.resource().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::runtime::cpu::{CpuClient, CpuRuntime};

    fn client() -> CpuClient {
        CpuRuntime::client(&CpuRuntime::default_device()).unwrap()
    }

    fn rw(n: u32) -> TensorDesc {
        TensorDesc::new(TensorShape::vector(n), DType::F32, Usage::ReadWrite)
    }

    #[test]
    fn test_variant_views() {
        let c = client();
        let t = Tensor::<CpuRuntime>::create(&c, &rw(16)).unwrap();
        assert!(t.read_view().is_some());
        assert!(t.write_view().is_some());

        let d = Tensor::<CpuRuntime>::create(&c, &rw(16).with_usage(Usage::Dynamic)).unwrap();
        assert!(d.read_view().is_some());
        assert!(d.write_view().is_none());

        let s = Tensor::<CpuRuntime>::create(&c, &rw(16).with_usage(Usage::ReadWriteDownload))
            .unwrap();
        assert_eq!(s.memory_footprint(), MemoryUsage { vram: 64, staging: 64 });
    }

    #[test]
    fn test_resize_keeps_buffer_within_capacity() {
        let c = client();
        let t = Tensor::<CpuRuntime>::create(&c, &rw(64)).unwrap();
        let id = t.buffer().unwrap().id();

        assert_eq!(t.resize(&c, &rw(10)).unwrap(), Resize::InPlace);
        assert_eq!(t.buffer().unwrap().id(), id);
        assert_eq!(t.capacity(), 64);
        assert_eq!(t.shape().size[0], 10);

        assert_eq!(t.resize(&c, &rw(65)).unwrap(), Resize::Reallocated);
        assert_ne!(t.buffer().unwrap().id(), id);
        assert_eq!(t.capacity(), 65);
    }

    #[test]
    fn test_resize_rejects_usage_and_dtype_change() {
        let c = client();
        let t = Tensor::<CpuRuntime>::create(&c, &rw(8)).unwrap();
        assert!(matches!(
            t.resize(&c, &rw(8).with_usage(Usage::Dynamic)),
            Err(Error::InvalidArgument { .. })
        ));
        let mut f16 = rw(8);
        f16.dtype = DType::F16;
        assert!(matches!(
            t.resize(&c, &f16),
            Err(Error::InvalidArgument { .. })
        ));
        assert!(matches!(
            t.resize(&c, &rw(8).with_layout(Layout::Bcml1)),
            Err(Error::NotImplemented { .. })
        ));
    }

    #[test]
    fn test_immutable_initializes_once() {
        let c = client();
        let desc = TensorDesc::new(TensorShape::vector(2), DType::F32, Usage::Immutable);
        let t = Tensor::<CpuRuntime>::uninitialized(&desc).unwrap();
        assert!(!t.is_initialized());
        assert!(t.read_view().is_none());

        t.create_immutable_raw(&c, &[0u8; 8]).unwrap();
        assert!(t.is_initialized());
        assert!(matches!(
            t.create_immutable_raw(&c, &[0u8; 8]),
            Err(Error::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_view_and_reshape() {
        let c = client();
        let t = Tensor::<CpuRuntime>::create(&c, &rw(12)).unwrap();
        t.view(TensorShape::matrix(3, 4)).unwrap();
        assert!(t.view(TensorShape::matrix(3, 5)).is_err());

        t.reshape(TensorShape::vector(5)).unwrap();
        assert_eq!(t.desc().element_count(), 5);
        assert!(t.reshape(TensorShape::vector(13)).is_err());
    }

    #[test]
    fn test_staged_download_phases() {
        let c = client();
        let t = Tensor::<CpuRuntime>::create(&c, &rw(4).with_usage(Usage::ReadWriteDownload))
            .unwrap();
        t.replace_data(&c, |d| {
            d.copy_from_slice(bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]));
            Ok(())
        })
        .unwrap();

        t.download(&c, DownloadFlag::CopyToStaging, |_| {
            panic!("copy phase must not read")
        })
        .unwrap();
        let mut out = Vec::new();
        t.download(&c, DownloadFlag::ReadStaging, |d| {
            out = d
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect();
            Ok(())
        })
        .unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }
}

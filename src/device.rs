//! Tensor factory and owner of the compression pipeline

use parking_lot::Mutex;
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use tracing::debug;

use crate::codec::{CpuFeatures, LoadTransform, bcml1};
use crate::compress::Compressor;
use crate::config::DeviceConfig;
use crate::context::Context;
use crate::error::{Error, LogOnError, Result, try_zeroed_vec};
use crate::runtime::{DeviceInfo, Runtime};
use crate::tensor::{Layout, Tensor, TensorDesc, Usage, compressed_bytes, plan_dense};

/// How `Device::create_tensor` satisfied the request
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Allocation {
    /// A new tensor was allocated
    Created,
    /// The tensor passed for reuse was resized and returned
    Reused,
}

/// What an immutable upload payload contains
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UploadSource {
    /// Dense elements of `desc.dtype`, uploaded as-is
    Dense,
    /// Dense half floats to be BCML1-compressed on the worker
    Compress,
    /// Words produced earlier by the BCML1 codec, uploaded verbatim
    Precompressed,
}

impl UploadSource {
    /// Derive the payload kind from a descriptor
    ///
    /// Dense layouts are uploaded as-is. A BCML1 descriptor with half-float
    /// elements and `stride[0] == 0` asks for compression; any other BCML1
    /// descriptor describes an already compressed payload.
    pub fn infer(desc: &TensorDesc) -> Self {
        match desc.layout {
            Layout::Dense => Self::Dense,
            Layout::Bcml1 if desc.dtype.is_half() && desc.shape.stride[0] == 0 => Self::Compress,
            Layout::Bcml1 => Self::Precompressed,
        }
    }
}

// ============================================================================
// Device
// ============================================================================

/// An opened compute device
///
/// Creates every tensor and owns the lazily created [`Compressor`]. All
/// methods must be called from the thread that owns the device.
///
/// # Example
///
/// ```
/// use gpuml::prelude::*;
///
/// let device = Device::<CpuRuntime>::open(&CpuRuntime::default_device(), DeviceConfig::default())?;
/// let desc = TensorDesc::new(TensorShape::vector(4), DType::F32, Usage::Immutable);
/// let data: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0].iter().flat_map(|v| v.to_le_bytes()).collect();
/// let tensor = device.upload_immutable(&desc, &data)?;
/// assert!(tensor.is_initialized());
/// # Ok::<(), gpuml::error::Error>(())
/// ```
pub struct Device<R: Runtime> {
    client: R::Client,
    config: DeviceConfig,
    features: CpuFeatures,
    compressor: Mutex<Option<Arc<Compressor<R>>>>,
}

impl<R: Runtime> Device<R> {
    /// Open `device` with `config`
    pub fn open(device: &R::Device, config: DeviceConfig) -> Result<Self> {
        config.validate().log_on_error("Device::open")?;
        let client = R::client(device).log_on_error("Device::open")?;
        Self::from_client(client, config)
    }

    /// Wrap an already opened client
    pub fn from_client(client: R::Client, config: DeviceConfig) -> Result<Self> {
        config.validate().log_on_error("Device::from_client")?;
        let features = config.features();
        debug!(runtime = R::name(), ?features, "opened device");
        Ok(Self {
            client,
            config,
            features,
            compressor: Mutex::new(None),
        })
    }

    /// The opened runtime client
    pub fn client(&self) -> &R::Client {
        &self.client
    }

    /// Configuration the device was opened with
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// CPU capabilities used by the codec and load transforms
    pub fn cpu_features(&self) -> CpuFeatures {
        self.features
    }

    /// Identity and capability data of the compute device
    pub fn device_info(&self) -> DeviceInfo {
        R::device_info(&self.client)
    }

    /// Create an execution context on this device
    pub fn context(&self) -> Context<R> {
        Context::new(self.client.clone(), self.config.log_dispatch)
    }

    // ========================================================================
    // Mutable tensors
    // ========================================================================

    /// Create a `ReadWrite`, `ReadWriteDownload` or `Dynamic` tensor
    ///
    /// With `reuse`, the given tensor is resized to `desc` and returned; it
    /// only reallocates when `desc` holds more elements than its capacity.
    pub fn create_tensor(
        &self,
        desc: &TensorDesc,
        reuse: Option<&Tensor<R>>,
    ) -> Result<(Tensor<R>, Allocation)> {
        self.create_tensor_impl(desc, reuse)
            .log_on_error("Device::create_tensor")
    }

    fn create_tensor_impl(
        &self,
        desc: &TensorDesc,
        reuse: Option<&Tensor<R>>,
    ) -> Result<(Tensor<R>, Allocation)> {
        if desc.usage == Usage::Immutable {
            return Err(Error::invalid_argument(
                "desc.usage",
                "create_tensor can't create immutable tensors, they require initial data",
            ));
        }
        plan_dense(desc)?;

        if let Some(old) = reuse {
            if old.usage() == Usage::Immutable {
                return Err(Error::invalid_argument(
                    "reuse",
                    "immutable tensors can't be resized",
                ));
            }
            let resize = old.resize(&self.client, desc)?;
            debug!(tensor = %old.id(), ?resize, "reused tensor");
            return Ok((old.clone(), Allocation::Reused));
        }

        match desc.usage {
            Usage::ReadWrite | Usage::ReadWriteDownload | Usage::Dynamic => {
                Ok((Tensor::create(&self.client, desc)?, Allocation::Created))
            }
            Usage::Immutable => Err(Error::UnexpectedState {
                reason: format!("no tensor variant for usage {:?}", desc.usage),
            }),
        }
    }

    // ========================================================================
    // Immutable tensors
    // ========================================================================

    /// Create an immutable tensor from host memory
    ///
    /// The payload kind is derived with [`UploadSource::infer`].
    pub fn upload_immutable(&self, desc: &TensorDesc, data: &[u8]) -> Result<Tensor<R>> {
        self.upload_immutable_with(desc, UploadSource::infer(desc), data)
    }

    /// Create an immutable tensor from host memory with an explicit payload kind
    ///
    /// Compressed uploads return a tensor that becomes initialized once the
    /// compressor has finished the job and the device has drained it, at the
    /// latest in [`Device::wait_for_compressor`].
    pub fn upload_immutable_with(
        &self,
        desc: &TensorDesc,
        source: UploadSource,
        data: &[u8],
    ) -> Result<Tensor<R>> {
        self.upload_impl(desc, source, data)
            .log_on_error("Device::upload_immutable")
    }

    fn upload_impl(&self, desc: &TensorDesc, source: UploadSource, data: &[u8]) -> Result<Tensor<R>> {
        if desc.usage != Usage::Immutable {
            return Err(Error::invalid_argument(
                "desc.usage",
                "immutable uploads need Usage::Immutable",
            ));
        }
        match source {
            UploadSource::Dense => {
                check_dense(desc)?;
                let plan = plan_dense(desc)?;
                check_length(data.len(), plan.bytes())?;
                Tensor::immutable(&self.client, desc, data)
            }
            UploadSource::Compress => {
                check_compress_input(desc)?;
                let bytes = desc
                    .checked_element_count()?
                    .checked_mul(desc.dtype.size_in_bytes() as u64)
                    .ok_or(Error::Overflow { bytes: u64::MAX })?;
                check_length(data.len(), bytes as usize)?;
                let compressor = self.compressor()?;
                let mut buffer = compressor.get_buffer(data.len())?;
                bytemuck::cast_slice_mut::<u16, u8>(&mut buffer).copy_from_slice(data);
                compressor.bcml(desc, buffer)
            }
            UploadSource::Precompressed => {
                bcml1::Geometry::of(desc)?;
                check_length(data.len(), compressed_bytes(desc) as usize)?;
                Tensor::immutable(&self.client, desc, data)
            }
        }
    }

    /// Create an immutable tensor from `length` bytes of a stream
    ///
    /// `transform` runs on dense payloads before validation and upload; it may
    /// change the element type and the payload size.
    pub fn load_immutable(
        &self,
        desc: &TensorDesc,
        reader: impl Read,
        length: usize,
        transform: LoadTransform,
    ) -> Result<Tensor<R>> {
        self.load_impl(desc, reader, length, transform)
            .log_on_error("Device::load_immutable")
    }

    fn load_impl(
        &self,
        desc: &TensorDesc,
        mut reader: impl Read,
        length: usize,
        transform: LoadTransform,
    ) -> Result<Tensor<R>> {
        let source = UploadSource::infer(desc);
        let mut data = try_zeroed_vec::<u8>(length)?;
        reader.read_exact(&mut data)?;

        let mut desc = *desc;
        if source != UploadSource::Precompressed {
            transform.apply(&mut desc.dtype, &mut data, self.features)?;
        }
        self.upload_impl(&desc, source, &data)
    }

    /// Create an immutable tensor without a buffer
    ///
    /// The tensor has no read view until [`Device::load_tensor`] fills it.
    pub fn create_uninitialized(&self, desc: &TensorDesc) -> Result<Tensor<R>> {
        if desc.usage != Usage::Immutable {
            return Err(Error::NotImplemented {
                feature: "uninitialized tensors other than immutable ones",
            })
            .log_on_error("Device::create_uninitialized");
        }
        Tensor::uninitialized(desc).log_on_error("Device::create_uninitialized")
    }

    /// Fill an uninitialized immutable tensor with `length` bytes of a stream
    pub fn load_tensor(&self, tensor: &Tensor<R>, reader: impl Read, length: usize) -> Result<()> {
        self.load_tensor_impl(tensor, reader, length)
            .log_on_error("Device::load_tensor")
    }

    fn load_tensor_impl(&self, tensor: &Tensor<R>, mut reader: impl Read, length: usize) -> Result<()> {
        if tensor.is_initialized() {
            return Err(Error::AlreadyInitialized);
        }
        let mut data = try_zeroed_vec::<u8>(length)?;
        reader.read_exact(&mut data)?;
        tensor.create_immutable_raw(&self.client, &data)
    }

    // ========================================================================
    // Compressor
    // ========================================================================

    fn compressor(&self) -> Result<Arc<Compressor<R>>> {
        let mut slot = self.compressor.lock();
        if let Some(compressor) = slot.as_ref() {
            return Ok(compressor.clone());
        }
        let compressor = Arc::new(Compressor::new(
            self.client.clone(),
            self.features,
            self.config.compressor_threads,
        )?);
        *slot = Some(compressor.clone());
        Ok(compressor)
    }

    /// Block until every compression job is finished and finalized
    ///
    /// Reports the first error any job raised, then releases the compressor;
    /// the next compressed upload creates a fresh one.
    pub fn wait_for_compressor(&self) -> Result<()> {
        let Some(compressor) = self.compressor.lock().take() else {
            return Ok(());
        };
        compressor.join().log_on_error("Device::wait_for_compressor")
    }
}

fn check_dense(desc: &TensorDesc) -> Result<()> {
    desc.checked_element_count()?;
    if !desc.shape.is_dense() {
        return Err(Error::invalid_argument(
            "desc.shape",
            "the input data is expected to be dense, without padding",
        ));
    }
    Ok(())
}

fn check_compress_input(desc: &TensorDesc) -> Result<()> {
    check_dense(desc)?;
    if !desc.dtype.is_half() {
        return Err(Error::NotImplemented {
            feature: "BCML1 compression of types other than f16 and bf16",
        });
    }
    Ok(())
}

fn check_length(actual: usize, expected: usize) -> Result<()> {
    if actual != expected {
        return Err(Error::invalid_argument(
            "data",
            format!("unexpected payload length: expected {expected} bytes, got {actual}"),
        ));
    }
    Ok(())
}

impl<R: Runtime> fmt::Debug for Device<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("runtime", &R::name())
            .field("client", &self.client)
            .field("config", &self.config)
            .field("compressor", &self.compressor.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::runtime::cpu::CpuRuntime;
    use crate::tensor::TensorShape;

    fn device() -> Device<CpuRuntime> {
        let config = DeviceConfig::default().with_cpu_features(CpuFeatures::all());
        Device::open(&CpuRuntime::default_device(), config).unwrap()
    }

    #[test]
    fn test_infer_upload_source() {
        let dense = TensorDesc::new(TensorShape::vector(40), DType::F16, Usage::Immutable);
        assert_eq!(UploadSource::infer(&dense), UploadSource::Dense);

        let mut input = dense.with_layout(Layout::Bcml1);
        assert_eq!(UploadSource::infer(&input), UploadSource::Precompressed);
        input.shape.stride[0] = 0;
        assert_eq!(UploadSource::infer(&input), UploadSource::Compress);

        let compressed = bcml1::make_desc(&input, CpuFeatures::all()).unwrap();
        assert_eq!(compressed.shape.stride[0], 0);
        assert_eq!(UploadSource::infer(&compressed), UploadSource::Precompressed);
    }

    #[test]
    fn test_reuse_rejects_immutable() {
        let d = device();
        let imm = d
            .upload_immutable(
                &TensorDesc::new(TensorShape::vector(1), DType::F32, Usage::Immutable),
                &[0; 4],
            )
            .unwrap();
        let desc = TensorDesc::new(TensorShape::vector(1), DType::F32, Usage::ReadWrite);
        assert!(matches!(
            d.create_tensor(&desc, Some(&imm)),
            Err(Error::InvalidArgument { arg: "reuse", .. })
        ));
    }

    #[test]
    fn test_rejects_padded_dense_upload() {
        let d = device();
        let mut desc = TensorDesc::new(TensorShape::vector(4), DType::F32, Usage::Immutable);
        desc.shape.stride[3] = 8;
        assert!(matches!(
            d.upload_immutable(&desc, &[0; 16]),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_compressor_is_recreated_after_wait() {
        let d = device();
        assert!(d.wait_for_compressor().is_ok());

        let mut desc = TensorDesc::new(TensorShape::vector(32), DType::F16, Usage::Immutable)
            .with_layout(Layout::Bcml1);
        desc.shape.stride[0] = 0;
        let t = d.upload_immutable(&desc, &[0; 64]).unwrap();
        assert!(d.compressor.lock().is_some());
        d.wait_for_compressor().unwrap();
        assert!(d.compressor.lock().is_none());
        assert!(t.is_initialized());

        let again = d.upload_immutable(&desc, &[0; 64]).unwrap();
        d.wait_for_compressor().unwrap();
        assert!(again.is_initialized());
    }
}

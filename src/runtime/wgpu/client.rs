//! WebGPU Client implementation.
//!
//! `WgpuClient` owns the WebGPU device and queue plus the immediate binding
//! state a dispatch picks up.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use wgpu::{Buffer, Device, Queue};

use super::WgpuRuntime;
use super::device::{AdapterInfo, WgpuDevice, WgpuError, query_adapter_info_blocking};
use super::pipeline::PipelineCache;
use super::resource::{WgpuBuffer, WgpuShader, WgpuView};
use crate::error::{Error, Result};
use crate::runtime::{DeviceLimits, RuntimeClient};
use crate::tensor::MAX_BUFFER_BYTES;

/// How long a blocking poll may take before the device is considered hung
pub(crate) const POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Write slots exposed even on adapters with room for more
const MAX_WRITE_SLOTS: u32 = 8;

/// Read slots exposed even on adapters with room for more
const MAX_READ_SLOTS: u32 = 128;

pub(super) struct BindingState {
    pub(super) shader: Option<WgpuShader>,
    pub(super) constants: Option<WgpuBuffer>,
    pub(super) writes: Vec<Option<WgpuView>>,
    pub(super) reads: Vec<Option<WgpuView>>,
}

// ============================================================================
// WgpuClient
// ============================================================================

/// WebGPU Runtime Client.
///
/// Clones share the device, queue, pipeline cache and binding state.
#[derive(Clone)]
pub struct WgpuClient {
    /// GPU device identifier, carrying the adapter info once opened
    pub(crate) device_id: WgpuDevice,

    /// WebGPU device handle
    pub(crate) wgpu_device: Arc<Device>,

    /// WebGPU queue for command submission
    pub(crate) queue: Arc<Queue>,

    pub(crate) info: Arc<AdapterInfo>,
    pub(crate) limits: DeviceLimits,
    pub(super) state: Arc<Mutex<BindingState>>,

    /// Pipeline cache for compute shaders
    pub(crate) pipelines: Arc<PipelineCache>,
}

impl fmt::Debug for WgpuClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WgpuClient")
            .field("device", &self.device_id)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl WgpuClient {
    /// Open the adapter behind `device` without consulting the client cache.
    ///
    /// The device is requested with the adapter's full limits so that large
    /// weight buffers and wide read-slot tables fit.
    pub(super) fn new_uncached(device: WgpuDevice) -> std::result::Result<Self, WgpuError> {
        let (adapter, info) = query_adapter_info_blocking(device.index)?;

        let (wgpu_device, queue) = pollster::block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("gpuml WebGPU Device"),
                required_features: wgpu::Features::empty(),
                required_limits: info.limits.clone(),
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
                experimental_features: wgpu::ExperimentalFeatures::default(),
            },
        ))
        .map_err(|e| WgpuError::DeviceError(format!("{:?}", e)))?;

        let wgpu_device = Arc::new(wgpu_device);
        let queue = Arc::new(queue);
        let limits = device_limits(&info.limits);

        let state = BindingState {
            shader: None,
            constants: None,
            writes: vec![None; limits.max_write_slots as usize],
            reads: vec![None; limits.max_read_slots as usize],
        };

        Ok(Self {
            device_id: WgpuDevice::with_info(device.index, info.clone()),
            pipelines: Arc::new(PipelineCache::new(wgpu_device.clone())),
            wgpu_device,
            queue,
            info,
            limits,
            state: Arc::new(Mutex::new(state)),
        })
    }

    /// Get reference to the WebGPU device.
    #[inline]
    pub fn wgpu_device(&self) -> &Device {
        &self.wgpu_device
    }

    /// Get reference to the WebGPU queue.
    #[inline]
    pub fn wgpu_queue(&self) -> &Queue {
        &self.queue
    }

    /// Get reference to the pipeline cache.
    #[inline]
    pub fn pipeline_cache(&self) -> &PipelineCache {
        &self.pipelines
    }

    /// Submit commands and wait for completion.
    pub(crate) fn submit_and_wait(&self, encoder: wgpu::CommandEncoder) -> Result<()> {
        let submission = self.queue.submit(std::iter::once(encoder.finish()));
        self.wgpu_device
            .poll(wgpu::PollType::Wait {
                submission_index: Some(submission),
                timeout: Some(POLL_TIMEOUT),
            })
            .map_err(|e| Error::Backend(format!("GPU poll failed after submit: {e}")))?;
        Ok(())
    }

    /// Map a `MAP_READ` buffer, hand its first `bytes` bytes to `f`, unmap.
    pub(crate) fn read_mapped<T>(
        &self,
        buffer: &Buffer,
        bytes: usize,
        f: impl FnOnce(&[u8]) -> Result<T>,
    ) -> Result<T> {
        let slice = buffer.slice(..);

        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });

        self.wgpu_device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: Some(POLL_TIMEOUT),
            })
            .map_err(|e| Error::Backend(format!("GPU poll failed during buffer read: {e}")))?;

        let map_result = receiver.recv().map_err(|_| {
            Error::Backend("map_async callback was not invoked during buffer read".into())
        })?;
        map_result.map_err(|e| Error::Backend(format!("map_async failed during buffer read: {e}")))?;

        let result = {
            let data = slice.get_mapped_range();
            f(&data[..bytes])
        };

        buffer.unmap();
        result
    }
}

/// Slot and size limits exposed for a set of adapter limits
pub(crate) fn device_limits(limits: &wgpu::Limits) -> DeviceLimits {
    let storage = limits.max_storage_buffers_per_shader_stage.max(2);
    let max_write_slots = MAX_WRITE_SLOTS.min(storage / 2).max(1);
    let max_read_slots = MAX_READ_SLOTS.min(storage - max_write_slots);
    let max_buffer_bytes = MAX_BUFFER_BYTES
        .min(limits.max_storage_buffer_binding_size as u64)
        .min(limits.max_buffer_size);

    DeviceLimits {
        max_write_slots,
        max_read_slots,
        max_groups_per_dimension: limits.max_compute_workgroups_per_dimension,
        max_buffer_bytes,
    }
}

impl RuntimeClient<WgpuRuntime> for WgpuClient {
    fn device(&self) -> &WgpuDevice {
        &self.device_id
    }

    fn synchronize(&self) {
        let _ = self.wgpu_device.poll(wgpu::PollType::Wait {
            submission_index: None,
            timeout: Some(POLL_TIMEOUT),
        });
    }
}

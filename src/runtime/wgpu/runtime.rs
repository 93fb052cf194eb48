//! WebGPU runtime implementation

use std::borrow::Cow;
use wgpu::util::DeviceExt;
use wgpu::{BufferDescriptor, BufferUsages};

use super::cache::get_or_create_client;
use super::client::WgpuClient;
use super::device::WgpuDevice;
use super::pipeline::{CONSTANTS_BINDING, FIRST_READ_BINDING, FIRST_WRITE_BINDING, LayoutKey};
use super::resource::{WgpuBuffer, WgpuShader, WgpuView, aligned};
use crate::error::{Error, Result, try_zeroed_vec};
use crate::runtime::{BufferKind, DeviceInfo, DeviceLimits, Runtime, WriteMode};
use crate::tensor::ViewFormat;

/// WebGPU Runtime adapter
///
/// Implements the generic Runtime trait for the WebGPU backend. Shaders are
/// WGSL source with a `main` entry point; see [`super::pipeline`] for the
/// binding scheme they must follow.
#[derive(Clone, Debug, Default)]
pub struct WgpuRuntime;

fn usages(kind: BufferKind) -> BufferUsages {
    match kind {
        BufferKind::Immutable => BufferUsages::STORAGE | BufferUsages::COPY_SRC,
        BufferKind::ReadWrite | BufferKind::Dynamic => {
            BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST
        }
        BufferKind::Readback => BufferUsages::MAP_READ | BufferUsages::COPY_DST,
        BufferKind::Constant => BufferUsages::UNIFORM | BufferUsages::COPY_DST,
    }
}

fn slot_mask<T: Default + Copy + std::ops::BitOr<Output = T> + std::ops::Shl<usize, Output = T>>(
    slots: &[Option<WgpuView>],
    one: T,
) -> T {
    slots
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_some())
        .fold(T::default(), |mask, (i, _)| mask | (one << i))
}

impl Runtime for WgpuRuntime {
    type Device = WgpuDevice;
    type Client = WgpuClient;
    type Buffer = WgpuBuffer;
    type View = WgpuView;
    type Shader = WgpuShader;

    fn name() -> &'static str {
        "wgpu"
    }

    fn default_device() -> Self::Device {
        WgpuDevice::new(0)
    }

    fn client(device: &Self::Device) -> Result<Self::Client> {
        Ok(get_or_create_client(device)?)
    }

    fn limits(client: &Self::Client) -> DeviceLimits {
        client.limits
    }

    fn device_info(client: &Self::Client) -> DeviceInfo {
        DeviceInfo {
            name: client.info.name.clone(),
            // WebGPU does not report memory sizes
            vram_bytes: 0,
            vendor: client.info.vendor,
            backend: format!("{:?}", client.info.backend).to_lowercase(),
            max_groups_per_dimension: client.limits.max_groups_per_dimension,
        }
    }

    fn create_buffer(
        client: &Self::Client,
        kind: BufferKind,
        bytes: usize,
        initial: Option<&[u8]>,
    ) -> Result<Self::Buffer> {
        if bytes == 0 {
            return Err(Error::invalid_argument("bytes", "zero-sized buffer"));
        }
        if bytes as u64 > client.limits.max_buffer_bytes {
            return Err(Error::Overflow {
                bytes: bytes as u64,
            });
        }
        let size = aligned(bytes);

        let raw = match (kind, initial) {
            (BufferKind::Immutable, None) => {
                return Err(Error::invalid_argument(
                    "initial",
                    "immutable buffers need their contents at creation",
                ));
            }
            (BufferKind::Immutable, Some(data)) if data.len() != bytes => {
                return Err(Error::invalid_argument(
                    "initial",
                    format!("expected {bytes} bytes, got {}", data.len()),
                ));
            }
            (_, Some(data)) if data.len() > bytes => {
                return Err(Error::invalid_argument(
                    "initial",
                    format!("{} bytes don't fit a {bytes} byte buffer", data.len()),
                ));
            }
            (_, Some(data)) => {
                let contents: Cow<'_, [u8]> = if data.len() == size {
                    Cow::Borrowed(data)
                } else {
                    let mut padded = try_zeroed_vec::<u8>(size)?;
                    padded[..data.len()].copy_from_slice(data);
                    Cow::Owned(padded)
                };
                client
                    .wgpu_device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("gpuml buffer"),
                        contents: &contents,
                        usage: usages(kind),
                    })
            }
            (_, None) => client.wgpu_device.create_buffer(&BufferDescriptor {
                label: Some("gpuml buffer"),
                size: size as u64,
                usage: usages(kind),
                mapped_at_creation: false,
            }),
        };

        Ok(WgpuBuffer::new(kind, bytes, raw))
    }

    fn buffer_bytes(buffer: &Self::Buffer) -> usize {
        buffer.len()
    }

    fn buffer_id(buffer: &Self::Buffer) -> u64 {
        buffer.id()
    }

    fn create_read_view(
        _client: &Self::Client,
        buffer: &Self::Buffer,
        format: ViewFormat,
    ) -> Result<Self::View> {
        match buffer.kind() {
            BufferKind::Immutable | BufferKind::ReadWrite | BufferKind::Dynamic => Ok(WgpuView {
                buffer: buffer.clone(),
                format,
                writable: false,
            }),
            other => Err(Error::invalid_argument(
                "buffer",
                format!("{other:?} buffers can't be bound to shaders"),
            )),
        }
    }

    fn create_write_view(
        _client: &Self::Client,
        buffer: &Self::Buffer,
        format: ViewFormat,
    ) -> Result<Self::View> {
        if buffer.kind() != BufferKind::ReadWrite {
            return Err(Error::invalid_argument(
                "buffer",
                format!("{:?} buffers have no write view", buffer.kind()),
            ));
        }
        Ok(WgpuView {
            buffer: buffer.clone(),
            format,
            writable: true,
        })
    }

    fn map_read<T>(
        client: &Self::Client,
        buffer: &Self::Buffer,
        f: impl FnOnce(&[u8]) -> Result<T>,
    ) -> Result<T> {
        if buffer.kind() != BufferKind::Readback {
            return Err(Error::invalid_argument(
                "buffer",
                "only readback buffers can be mapped for reading",
            ));
        }
        client.read_mapped(buffer.raw(), buffer.len(), f)
    }

    /// Host writes go through `Queue::write_buffer`, so `f` always starts from
    /// zeroed memory and the whole buffer is replaced, for both write modes.
    fn write_buffer<T>(
        client: &Self::Client,
        buffer: &Self::Buffer,
        mode: WriteMode,
        f: impl FnOnce(&mut [u8]) -> Result<T>,
    ) -> Result<T> {
        let legal = match mode {
            WriteMode::Discard => {
                matches!(buffer.kind(), BufferKind::Dynamic | BufferKind::Constant)
            }
            WriteMode::Update => buffer.kind() == BufferKind::ReadWrite,
        };
        if !legal {
            return Err(Error::invalid_argument(
                "mode",
                format!("{mode:?} is not allowed on {:?} buffers", buffer.kind()),
            ));
        }

        let mut data = try_zeroed_vec::<u8>(aligned(buffer.len()))?;
        let result = f(&mut data[..buffer.len()])?;
        client.queue.write_buffer(buffer.raw(), 0, &data);
        Ok(result)
    }

    fn copy_region(
        client: &Self::Client,
        dst: &Self::Buffer,
        src: &Self::Buffer,
        bytes: usize,
    ) -> Result<()> {
        if !matches!(dst.kind(), BufferKind::ReadWrite | BufferKind::Readback) {
            return Err(Error::invalid_argument(
                "dst",
                format!("{:?} buffers can't be copy destinations", dst.kind()),
            ));
        }
        if !matches!(
            src.kind(),
            BufferKind::Immutable | BufferKind::ReadWrite | BufferKind::Dynamic
        ) {
            return Err(Error::invalid_argument(
                "src",
                format!("{:?} buffers can't be copy sources", src.kind()),
            ));
        }
        if bytes > dst.len() || bytes > src.len() {
            return Err(Error::invalid_argument(
                "bytes",
                format!(
                    "copy of {bytes} bytes from {} into {} bytes",
                    src.len(),
                    dst.len()
                ),
            ));
        }
        if dst.id() == src.id() || bytes == 0 {
            return Ok(());
        }

        let mut encoder =
            client
                .wgpu_device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("gpuml_copy"),
                });
        // Both allocations are 4-byte aligned, so the rounded size still fits
        encoder.copy_buffer_to_buffer(src.raw(), 0, dst.raw(), 0, aligned(bytes) as u64);
        client.submit_and_wait(encoder)
    }

    fn create_shader(client: &Self::Client, bytecode: &[u8]) -> Result<Self::Shader> {
        if bytecode.is_empty() {
            return Err(Error::invalid_argument("bytecode", "empty shader"));
        }
        let source = std::str::from_utf8(bytecode)
            .map_err(|e| Error::invalid_argument("bytecode", format!("WGSL must be UTF-8: {e}")))?;

        let module = client
            .wgpu_device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("gpuml_shader"),
                source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(source)),
            });
        Ok(WgpuShader::new(module))
    }

    fn bind_shader(client: &Self::Client, shader: &Self::Shader) {
        client.state.lock().shader = Some(shader.clone());
    }

    fn bind_constants(client: &Self::Client, buffer: Option<&Self::Buffer>) {
        client.state.lock().constants = buffer.cloned();
    }

    fn bind_write_views(client: &Self::Client, views: &[Option<Self::View>]) {
        let mut state = client.state.lock();
        for (slot, view) in state.writes.iter_mut().zip(views) {
            *slot = view.clone();
        }
    }

    fn bind_read_views(client: &Self::Client, views: &[Option<Self::View>]) {
        let mut state = client.state.lock();
        for (slot, view) in state.reads.iter_mut().zip(views) {
            *slot = view.clone();
        }
    }

    fn dispatch(client: &Self::Client, groups: [u32; 3]) -> Result<()> {
        let max = client.limits.max_groups_per_dimension;
        if groups.iter().any(|&g| g == 0 || g > max) {
            return Err(Error::Backend(format!(
                "dispatch grid {groups:?} outside 1..={max}"
            )));
        }

        let (shader, constants, writes, reads) = {
            let state = client.state.lock();
            let shader = state.shader.clone().ok_or(Error::NullReference {
                what: "no shader is bound",
            })?;
            (
                shader,
                state.constants.clone(),
                state.writes.clone(),
                state.reads.clone(),
            )
        };

        let key = LayoutKey {
            constants: constants.is_some(),
            writes: slot_mask(&writes, 1u32),
            reads: slot_mask(&reads, 1u128),
        };
        let cache = client.pipeline_cache();
        let layout = cache.get_or_create_layout(key);
        let pipeline = cache.get_or_create_pipeline(&shader, key, &layout);

        let mut entries = Vec::new();
        if let Some(buffer) = &constants {
            entries.push(wgpu::BindGroupEntry {
                binding: CONSTANTS_BINDING,
                resource: buffer.raw().as_entire_binding(),
            });
        }
        for (slot, view) in writes.iter().enumerate() {
            if let Some(view) = view {
                entries.push(wgpu::BindGroupEntry {
                    binding: FIRST_WRITE_BINDING + slot as u32,
                    resource: view.buffer.raw().as_entire_binding(),
                });
            }
        }
        for (slot, view) in reads.iter().enumerate() {
            if let Some(view) = view {
                entries.push(wgpu::BindGroupEntry {
                    binding: FIRST_READ_BINDING + slot as u32,
                    resource: view.buffer.raw().as_entire_binding(),
                });
            }
        }

        let bind_group = client
            .wgpu_device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("gpuml_dispatch"),
                layout: &layout,
                entries: &entries,
            });

        let mut encoder =
            client
                .wgpu_device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("gpuml_dispatch"),
                });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("gpuml_dispatch"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, Some(&bind_group), &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        client.submit_and_wait(encoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_usages_per_kind() {
        assert!(usages(BufferKind::Readback).contains(BufferUsages::MAP_READ));
        assert!(!usages(BufferKind::Immutable).contains(BufferUsages::COPY_DST));
        assert!(usages(BufferKind::Constant).contains(BufferUsages::UNIFORM));
        assert!(usages(BufferKind::Dynamic).contains(BufferUsages::COPY_SRC));
    }

    #[test]
    fn test_slot_mask_skips_empty_slots() {
        let slots: Vec<Option<WgpuView>> = vec![None, None, None];
        assert_eq!(slot_mask(&slots, 1u32), 0);
    }
}

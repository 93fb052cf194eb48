//! CPU runtime implementation

use super::client::{CpuClient, DispatchRecord, slot_ids};
use super::device::CpuDevice;
use super::kernel::KernelArgs;
use super::resource::{CpuBuffer, CpuShader, CpuView};
use crate::error::{Error, Result, try_zeroed_vec};
use crate::runtime::{BufferKind, DeviceInfo, DeviceLimits, Runtime, WriteMode};
use crate::tensor::ViewFormat;

/// CPU compute runtime
///
/// Buffers live in host memory. The access rules of each [`BufferKind`] are
/// enforced the way a D3D11-class driver would enforce them, so code that
/// works here issues only legal calls against a GPU backend.
#[derive(Clone, Debug, Default)]
pub struct CpuRuntime;

impl Runtime for CpuRuntime {
    type Device = CpuDevice;
    type Client = CpuClient;
    type Buffer = CpuBuffer;
    type View = CpuView;
    type Shader = CpuShader;

    fn name() -> &'static str {
        "cpu"
    }

    fn default_device() -> Self::Device {
        CpuDevice::new()
    }

    fn client(device: &Self::Device) -> Result<Self::Client> {
        Ok(CpuClient::new(device.clone()))
    }

    fn limits(client: &Self::Client) -> DeviceLimits {
        client.limits
    }

    fn device_info(client: &Self::Client) -> DeviceInfo {
        DeviceInfo {
            name: "cpu".to_string(),
            vram_bytes: 0,
            vendor: 0,
            backend: Self::name().to_string(),
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
        match (kind, initial) {
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
            _ => {}
        }

        let mut data = try_zeroed_vec::<u8>(bytes)?;
        if let Some(init) = initial {
            data[..init.len()].copy_from_slice(init);
        }
        Ok(CpuBuffer::new(kind, data))
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
            BufferKind::Immutable | BufferKind::ReadWrite | BufferKind::Dynamic => Ok(CpuView {
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
        Ok(CpuView {
            buffer: buffer.clone(),
            format,
            writable: true,
        })
    }

    fn map_read<T>(
        _client: &Self::Client,
        buffer: &Self::Buffer,
        f: impl FnOnce(&[u8]) -> Result<T>,
    ) -> Result<T> {
        if buffer.kind() != BufferKind::Readback {
            return Err(Error::invalid_argument(
                "buffer",
                "only readback buffers can be mapped for reading",
            ));
        }
        buffer.with_data(|data| f(data))
    }

    fn write_buffer<T>(
        _client: &Self::Client,
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
        buffer.with_data(|data| {
            if mode == WriteMode::Discard {
                data.fill(0);
            }
            f(data)
        })
    }

    fn copy_region(
        _client: &Self::Client,
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
        if dst.id() == src.id() {
            return Ok(());
        }
        let data = src.with_data(|s| s[..bytes].to_vec());
        dst.with_data(|d| d[..bytes].copy_from_slice(&data));
        Ok(())
    }

    fn create_shader(client: &Self::Client, bytecode: &[u8]) -> Result<Self::Shader> {
        if bytecode.is_empty() {
            return Err(Error::invalid_argument("bytecode", "empty shader"));
        }
        Ok(CpuShader::new(bytecode, client.kernel_for(bytecode)))
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

        // Snapshot under the lock, run the kernel without it
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

        client.record(DispatchRecord {
            shader: shader.id(),
            groups,
            writes: slot_ids(&writes),
            reads: slot_ids(&reads),
            constant_bytes: constants.as_ref().map_or(0, CpuBuffer::len),
        });

        let Some(kernel) = shader.kernel.as_ref() else {
            return Ok(());
        };

        let mut args = KernelArgs {
            groups,
            constants: constants.as_ref().map(CpuBuffer::snapshot).unwrap_or_default(),
            reads: reads
                .iter()
                .map(|v| v.as_ref().map(|v| v.buffer.snapshot()))
                .collect(),
            writes: writes
                .iter()
                .map(|v| v.as_ref().map(|v| v.buffer.snapshot()))
                .collect(),
        };
        kernel(&mut args)?;

        for (view, data) in writes.iter().zip(args.writes) {
            if let (Some(view), Some(data)) = (view, data) {
                view.buffer.with_data(|d| d.copy_from_slice(&data));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> CpuClient {
        CpuRuntime::client(&CpuRuntime::default_device()).unwrap()
    }

    #[test]
    fn test_immutable_needs_exact_contents() {
        let c = client();
        assert!(CpuRuntime::create_buffer(&c, BufferKind::Immutable, 8, None).is_err());
        assert!(CpuRuntime::create_buffer(&c, BufferKind::Immutable, 8, Some(&[0; 4])).is_err());
        let b = CpuRuntime::create_buffer(&c, BufferKind::Immutable, 4, Some(&[1, 2, 3, 4])).unwrap();
        assert_eq!(b.snapshot(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_map_rules() {
        let c = client();
        let rw = CpuRuntime::create_buffer(&c, BufferKind::ReadWrite, 16, None).unwrap();
        let dynamic = CpuRuntime::create_buffer(&c, BufferKind::Dynamic, 16, None).unwrap();
        let readback = CpuRuntime::create_buffer(&c, BufferKind::Readback, 16, None).unwrap();

        assert!(CpuRuntime::map_read(&c, &rw, |_| Ok(())).is_err());
        assert!(CpuRuntime::write_buffer(&c, &rw, WriteMode::Discard, |_| Ok(())).is_err());
        assert!(CpuRuntime::write_buffer(&c, &dynamic, WriteMode::Update, |_| Ok(())).is_err());

        CpuRuntime::write_buffer(&c, &rw, WriteMode::Update, |d| {
            d.fill(7);
            Ok(())
        })
        .unwrap();
        CpuRuntime::copy_region(&c, &readback, &rw, 16).unwrap();
        let sum = CpuRuntime::map_read(&c, &readback, |d| Ok(d.iter().map(|&b| b as u32).sum::<u32>()))
            .unwrap();
        assert_eq!(sum, 7 * 16);
    }

    #[test]
    fn test_write_view_only_on_read_write() {
        let c = client();
        let dynamic = CpuRuntime::create_buffer(&c, BufferKind::Dynamic, 16, None).unwrap();
        assert!(CpuRuntime::create_write_view(&c, &dynamic, ViewFormat::R32Float).is_err());
        assert!(CpuRuntime::create_read_view(&c, &dynamic, ViewFormat::R32Float).is_ok());
    }

    #[test]
    fn test_dispatch_runs_registered_kernel() {
        let c = client();
        c.register_kernel(b"double", |args| {
            let input: Vec<u8> = args.read(0)?.to_vec();
            let out = args.write(0)?;
            for (o, i) in out.iter_mut().zip(input) {
                *o = i * 2;
            }
            Ok(())
        });
        let shader = CpuRuntime::create_shader(&c, b"double").unwrap();
        let src = CpuRuntime::create_buffer(&c, BufferKind::Immutable, 4, Some(&[1, 2, 3, 4])).unwrap();
        let dst = CpuRuntime::create_buffer(&c, BufferKind::ReadWrite, 4, None).unwrap();
        let rv = CpuRuntime::create_read_view(&c, &src, ViewFormat::R32Uint).unwrap();
        let wv = CpuRuntime::create_write_view(&c, &dst, ViewFormat::R32Uint).unwrap();

        CpuRuntime::bind_shader(&c, &shader);
        CpuRuntime::bind_read_views(&c, &[Some(rv)]);
        CpuRuntime::bind_write_views(&c, &[Some(wv)]);
        CpuRuntime::dispatch(&c, [1, 1, 1]).unwrap();

        assert_eq!(dst.snapshot(), vec![2, 4, 6, 8]);
        assert_eq!(c.dispatch_log().len(), 1);
    }

    #[test]
    fn test_buffer_released_on_last_drop() {
        let c = client();
        let b = CpuRuntime::create_buffer(&c, BufferKind::ReadWrite, 8, None).unwrap();
        let view = CpuRuntime::create_read_view(&c, &b, ViewFormat::R32Float).unwrap();
        assert_eq!(b.handle_count(), 2);
        drop(view);
        assert_eq!(b.handle_count(), 1);
    }
}

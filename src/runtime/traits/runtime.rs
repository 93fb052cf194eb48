//! Core trait for compute backends

use std::fmt::Debug;

use crate::error::Result;
use crate::runtime::{BufferKind, DeviceInfo, DeviceLimits, WriteMode};
use crate::tensor::ViewFormat;

/// Core trait for compute backends
///
/// `Runtime` is the compute-device contract consumed by tensors, the device
/// factory and the execution context. It uses static dispatch via generics;
/// every operation is synchronous from the calling thread's perspective.
///
/// # Associated Types
///
/// - `Device`: Identifies a specific compute unit (e.g., GPU 0, GPU 1)
/// - `Client`: Opened device, owns the queue and the bound slot tables
/// - `Buffer`: Reference-counted buffer handle, released on last drop
/// - `View`: Shader-visible view over a buffer
/// - `Shader`: Compiled compute program
///
/// # Example
///
/// ```ignore
/// let client = CpuRuntime::client(&CpuRuntime::default_device())?;
/// let buf = CpuRuntime::create_buffer(&client, BufferKind::ReadWrite, 1024, None)?;
/// let view = CpuRuntime::create_write_view(&client, &buf, ViewFormat::R32Float)?;
/// ```
pub trait Runtime: Clone + Send + Sync + Debug + 'static {
    /// Device identifier type
    type Device: super::DeviceId;

    /// Opened device
    type Client: super::RuntimeClient<Self> + Debug;

    /// Buffer handle
    type Buffer: Clone + Send + Sync + Debug;

    /// Read or write view handle
    type View: Clone + Send + Sync + Debug;

    /// Compute shader handle
    type Shader: Clone + Send + Sync + Debug;

    /// Human-readable name of this runtime
    fn name() -> &'static str;

    /// Get the default device
    fn default_device() -> Self::Device;

    /// Open a device
    fn client(device: &Self::Device) -> Result<Self::Client>;

    /// Slot and dispatch limits of the opened device
    fn limits(client: &Self::Client) -> DeviceLimits;

    /// Identity and capability data of the opened device
    fn device_info(client: &Self::Client) -> DeviceInfo;

    /// Create a buffer of `bytes` bytes
    ///
    /// `BufferKind::Immutable` requires `initial` covering the whole buffer.
    /// Other kinds are zero-filled past the end of `initial`.
    fn create_buffer(
        client: &Self::Client,
        kind: BufferKind,
        bytes: usize,
        initial: Option<&[u8]>,
    ) -> Result<Self::Buffer>;

    /// Size of a buffer in bytes
    fn buffer_bytes(buffer: &Self::Buffer) -> usize;

    /// Process-unique identity of the underlying allocation
    fn buffer_id(buffer: &Self::Buffer) -> u64;

    /// Create a shader-readable view
    fn create_read_view(
        client: &Self::Client,
        buffer: &Self::Buffer,
        format: ViewFormat,
    ) -> Result<Self::View>;

    /// Create a shader-writable view
    fn create_write_view(
        client: &Self::Client,
        buffer: &Self::Buffer,
        format: ViewFormat,
    ) -> Result<Self::View>;

    /// Map a readback buffer and pass its bytes to `f`
    ///
    /// The buffer is unmapped before the result of `f` is returned, including
    /// when `f` fails.
    fn map_read<T>(
        client: &Self::Client,
        buffer: &Self::Buffer,
        f: impl FnOnce(&[u8]) -> Result<T>,
    ) -> Result<T>;

    /// Let `f` fill host memory that replaces the contents of `buffer`
    ///
    /// When `f` fails the buffer contents are unspecified and the error is
    /// returned after the mapping has been released.
    fn write_buffer<T>(
        client: &Self::Client,
        buffer: &Self::Buffer,
        mode: WriteMode,
        f: impl FnOnce(&mut [u8]) -> Result<T>,
    ) -> Result<T>;

    /// Copy the first `bytes` bytes of `src` into `dst`
    fn copy_region(
        client: &Self::Client,
        dst: &Self::Buffer,
        src: &Self::Buffer,
        bytes: usize,
    ) -> Result<()>;

    /// Compile a compute shader from backend-specific bytecode
    fn create_shader(client: &Self::Client, bytecode: &[u8]) -> Result<Self::Shader>;

    /// Make `shader` the current compute program
    fn bind_shader(client: &Self::Client, shader: &Self::Shader);

    /// Bind or clear the constant buffer slot
    fn bind_constants(client: &Self::Client, buffer: Option<&Self::Buffer>);

    /// Set write slots `0..views.len()`; `None` clears a slot
    fn bind_write_views(client: &Self::Client, views: &[Option<Self::View>]);

    /// Set read slots `0..views.len()`; `None` clears a slot
    fn bind_read_views(client: &Self::Client, views: &[Option<Self::View>]);

    /// Run the bound shader over a grid of thread groups
    fn dispatch(client: &Self::Client, groups: [u32; 3]) -> Result<()>;
}

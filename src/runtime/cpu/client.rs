//! CPU client: binding tables, kernel registry and dispatch log

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::device::CpuDevice;
use super::kernel::{CpuKernel, KernelArgs};
use super::resource::{CpuBuffer, CpuShader, CpuView};
use super::runtime::CpuRuntime;
use crate::error::Result;
use crate::runtime::{DeviceLimits, RuntimeClient};

/// One executed dispatch, as recorded by the CPU client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchRecord {
    /// Id of the bound shader
    pub shader: u64,
    /// Thread-group grid
    pub groups: [u32; 3],
    /// Buffer id bound to each write slot, `None` when the slot is empty
    pub writes: Vec<Option<u64>>,
    /// Buffer id bound to each read slot, `None` when the slot is empty
    pub reads: Vec<Option<u64>>,
    /// Size of the bound constant buffer in bytes, 0 when none
    pub constant_bytes: usize,
}

pub(super) struct BindingState {
    pub(super) shader: Option<CpuShader>,
    pub(super) constants: Option<CpuBuffer>,
    pub(super) writes: Vec<Option<CpuView>>,
    pub(super) reads: Vec<Option<CpuView>>,
}

/// CPU client
///
/// Emulates the immediate context of a GPU in host memory. Clones share the
/// same binding tables, kernel registry and dispatch log.
#[derive(Clone)]
pub struct CpuClient {
    pub(crate) device: CpuDevice,
    pub(super) limits: DeviceLimits,
    pub(super) state: Arc<Mutex<BindingState>>,
    kernels: Arc<Mutex<HashMap<Vec<u8>, CpuKernel>>>,
    log: Arc<Mutex<Vec<DispatchRecord>>>,
}

impl CpuClient {
    /// Create a new CPU client with default limits
    pub fn new(device: CpuDevice) -> Self {
        Self::with_limits(device, DeviceLimits::default())
    }

    /// Create a CPU client with custom limits
    pub fn with_limits(device: CpuDevice, limits: DeviceLimits) -> Self {
        let state = BindingState {
            shader: None,
            constants: None,
            writes: vec![None; limits.max_write_slots as usize],
            reads: vec![None; limits.max_read_slots as usize],
        };
        Self {
            device,
            limits,
            state: Arc::new(Mutex::new(state)),
            kernels: Arc::new(Mutex::new(HashMap::new())),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a host kernel for shaders created from `bytecode`
    ///
    /// Only shaders created after registration pick the kernel up.
    pub fn register_kernel<F>(&self, bytecode: &[u8], kernel: F)
    where
        F: Fn(&mut KernelArgs) -> Result<()> + Send + Sync + 'static,
    {
        self.kernels
            .lock()
            .insert(bytecode.to_vec(), Arc::new(kernel));
    }

    pub(super) fn kernel_for(&self, bytecode: &[u8]) -> Option<CpuKernel> {
        self.kernels.lock().get(bytecode).cloned()
    }

    /// Buffer id bound to each write slot
    pub fn bound_write_slots(&self) -> Vec<Option<u64>> {
        slot_ids(&self.state.lock().writes)
    }

    /// Buffer id bound to each read slot
    pub fn bound_read_slots(&self) -> Vec<Option<u64>> {
        slot_ids(&self.state.lock().reads)
    }

    /// Id of the bound shader
    pub fn bound_shader(&self) -> Option<u64> {
        self.state.lock().shader.as_ref().map(CpuShader::id)
    }

    /// Contents of the bound constant buffer
    pub fn bound_constants(&self) -> Option<Vec<u8>> {
        self.state.lock().constants.as_ref().map(CpuBuffer::snapshot)
    }

    /// Every dispatch executed so far
    pub fn dispatch_log(&self) -> Vec<DispatchRecord> {
        self.log.lock().clone()
    }

    pub(super) fn record(&self, record: DispatchRecord) {
        self.log.lock().push(record);
    }
}

pub(super) fn slot_ids(slots: &[Option<CpuView>]) -> Vec<Option<u64>> {
    slots
        .iter()
        .map(|v| v.as_ref().map(|v| v.buffer.id()))
        .collect()
}

impl fmt::Debug for CpuClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuClient")
            .field("device", &self.device)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl RuntimeClient<CpuRuntime> for CpuClient {
    fn device(&self) -> &CpuDevice {
        &self.device
    }

    fn synchronize(&self) {
        // CPU operations are synchronous, nothing to do
    }
}

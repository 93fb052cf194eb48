//! Host kernels executed by the CPU backend on dispatch

use std::sync::Arc;

use crate::error::{Error, Result};

/// Host implementation of a compute shader
pub type CpuKernel = Arc<dyn Fn(&mut KernelArgs) -> Result<()> + Send + Sync>;

/// Snapshot of the bound state handed to a [`CpuKernel`]
///
/// Write slots are copied out before the call and stored back afterwards, so
/// a kernel never holds a buffer lock.
pub struct KernelArgs {
    /// Thread-group grid of the dispatch
    pub groups: [u32; 3],
    pub(super) constants: Vec<u8>,
    pub(super) reads: Vec<Option<Vec<u8>>>,
    pub(super) writes: Vec<Option<Vec<u8>>>,
}

impl KernelArgs {
    /// Bytes of the bound constant buffer, empty when none is bound
    pub fn constants(&self) -> &[u8] {
        &self.constants
    }

    /// Contents of read slot `slot`
    pub fn read(&self, slot: usize) -> Result<&[u8]> {
        match self.reads.get(slot) {
            Some(Some(data)) => Ok(data),
            Some(None) => Err(Error::NullReference {
                what: "read slot is not bound",
            }),
            None => Err(Error::OutOfBounds {
                index: slot,
                size: self.reads.len(),
            }),
        }
    }

    /// Contents of write slot `slot`
    pub fn write(&mut self, slot: usize) -> Result<&mut [u8]> {
        let size = self.writes.len();
        match self.writes.get_mut(slot) {
            Some(Some(data)) => Ok(data),
            Some(None) => Err(Error::NullReference {
                what: "write slot is not bound",
            }),
            None => Err(Error::OutOfBounds { index: slot, size }),
        }
    }
}

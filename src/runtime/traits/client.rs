//! Trait for opened devices

use super::Runtime;

/// An opened device: owns the queue and the immediate binding state
///
/// Clones share the same underlying device. Binding and dispatch are only
/// valid from the thread that owns the [`crate::Device`].
pub trait RuntimeClient<R: Runtime>: Clone + Send + Sync {
    /// Get the device this client operates on
    fn device(&self) -> &R::Device;

    /// Synchronize: wait for all submitted work to complete
    fn synchronize(&self);
}

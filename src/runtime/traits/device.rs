//! Trait for device identification

/// Identifies one physical compute device
pub trait DeviceId: Clone + Send + Sync + std::fmt::Debug + 'static {
    /// Unique identifier for this device
    fn id(&self) -> usize;

    /// Check if two devices are the same
    fn is_same(&self, other: &Self) -> bool {
        self.id() == other.id()
    }

    /// Human-readable name
    fn name(&self) -> String {
        format!("Device({})", self.id())
    }
}

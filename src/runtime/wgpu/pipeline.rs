//! WGSL compute pipeline infrastructure
//!
//! Every shader uses bind group 0 with a fixed binding scheme:
//!
//! ```text
//! binding 0        : uniform constants
//! binding 1 + i    : write slot i   (storage, read_write)
//! binding 16 + i   : read slot i    (storage, read)
//! ```
//!
//! Layouts depend on which slots are bound, so pipelines are cached per
//! (shader, layout key).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use wgpu::{
    BindGroupLayout, BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindingType,
    BufferBindingType, ComputePipeline, ComputePipelineDescriptor, Device,
    PipelineLayoutDescriptor, ShaderStages,
};

use super::resource::WgpuShader;

/// Binding of the constant buffer
pub const CONSTANTS_BINDING: u32 = 0;

/// Binding of write slot 0
pub const FIRST_WRITE_BINDING: u32 = 1;

/// Binding of read slot 0
pub const FIRST_READ_BINDING: u32 = 16;

/// Entry point every compute shader must export
pub const ENTRY_POINT: &str = "main";

// ============================================================================
// Pipeline Cache
// ============================================================================

/// Which slots a dispatch binds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayoutKey {
    /// A constant buffer is bound
    pub constants: bool,
    /// Bit `i` set when write slot `i` is bound
    pub writes: u32,
    /// Bit `i` set when read slot `i` is bound
    pub reads: u128,
}

impl LayoutKey {
    fn entries(&self) -> Vec<BindGroupLayoutEntry> {
        let storage = |binding, read_only| BindGroupLayoutEntry {
            binding,
            visibility: ShaderStages::COMPUTE,
            ty: BindingType::Buffer {
                ty: BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let mut entries = Vec::new();
        if self.constants {
            entries.push(BindGroupLayoutEntry {
                binding: CONSTANTS_BINDING,
                visibility: ShaderStages::COMPUTE,
                ty: BindingType::Buffer {
                    ty: BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            });
        }
        for slot in 0..u32::BITS {
            if self.writes & (1 << slot) != 0 {
                entries.push(storage(FIRST_WRITE_BINDING + slot, false));
            }
        }
        for slot in 0..u128::BITS {
            if self.reads & (1 << slot) != 0 {
                entries.push(storage(FIRST_READ_BINDING + slot, true));
            }
        }
        entries
    }
}

/// Cache for bind group layouts and compute pipelines
pub struct PipelineCache {
    device: Arc<Device>,
    /// Cached pipelines by (shader id, layout key)
    pipelines: Mutex<HashMap<(u64, LayoutKey), Arc<ComputePipeline>>>,
    /// Cached bind group layouts by layout key
    layouts: Mutex<HashMap<LayoutKey, Arc<BindGroupLayout>>>,
}

impl PipelineCache {
    /// Create a new pipeline cache
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            pipelines: Mutex::new(HashMap::new()),
            layouts: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the bind group layout for a slot set
    pub fn get_or_create_layout(&self, key: LayoutKey) -> Arc<BindGroupLayout> {
        let mut layouts = self.layouts.lock();
        if let Some(layout) = layouts.get(&key) {
            return layout.clone();
        }

        let layout = self
            .device
            .create_bind_group_layout(&BindGroupLayoutDescriptor {
                label: Some("gpuml_dispatch_layout"),
                entries: &key.entries(),
            });

        let layout = Arc::new(layout);
        layouts.insert(key, layout.clone());
        layout
    }

    /// Get or create the pipeline running `shader` with a slot set
    pub fn get_or_create_pipeline(
        &self,
        shader: &WgpuShader,
        key: LayoutKey,
        layout: &BindGroupLayout,
    ) -> Arc<ComputePipeline> {
        let mut pipelines = self.pipelines.lock();
        if let Some(pipeline) = pipelines.get(&(shader.id, key)) {
            return pipeline.clone();
        }

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&PipelineLayoutDescriptor {
                label: Some(&format!("shader_{}_layout", shader.id)),
                bind_group_layouts: &[layout],
                immediate_size: 0,
            });

        let pipeline = self
            .device
            .create_compute_pipeline(&ComputePipelineDescriptor {
                label: Some(&format!("shader_{}", shader.id)),
                layout: Some(&pipeline_layout),
                module: &shader.module,
                entry_point: Some(ENTRY_POINT),
                compilation_options: Default::default(),
                cache: None,
            });

        let pipeline = Arc::new(pipeline);
        pipelines.insert((shader.id, key), pipeline.clone());
        pipeline
    }

    /// Number of cached pipelines
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_entries_follow_binding_scheme() {
        let key = LayoutKey {
            constants: true,
            writes: 0b11,
            reads: 0b101,
        };
        let bindings: Vec<u32> = key.entries().iter().map(|e| e.binding).collect();
        assert_eq!(bindings, vec![0, 1, 2, 16, 18]);
    }
}

//! Common test utilities
#![allow(dead_code)]

use gpuml::prelude::*;
use gpuml::runtime::cpu::{CpuClient, CpuDevice};
use gpuml::runtime::DeviceLimits;
use half::f16;

/// Open a CPU device with every codec feature enabled
pub fn cpu_device() -> Device<CpuRuntime> {
    let config = DeviceConfig::default().with_cpu_features(CpuFeatures::all());
    Device::open(&CpuDevice::new(), config).unwrap()
}

/// Open a CPU device with custom binding and dispatch limits
pub fn cpu_device_with_limits(limits: DeviceLimits) -> Device<CpuRuntime> {
    let client = CpuClient::with_limits(CpuDevice::new(), limits);
    let config = DeviceConfig::default().with_cpu_features(CpuFeatures::all());
    Device::from_client(client, config).unwrap()
}

/// Little-endian bytes of a slice of f32
pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode little-endian f32 bytes
pub fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Little-endian bytes of `values` rounded to f16
pub fn f16_bytes(values: &[f32]) -> Vec<u8> {
    values
        .iter()
        .flat_map(|&v| f16::from_f32(v).to_le_bytes())
        .collect()
}

/// Decode little-endian u32 words
pub fn u32_words(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Immutable BCML1 descriptor asking for compression of dense f16 input
pub fn compress_input_desc(size: [u32; 4]) -> TensorDesc {
    let mut desc = TensorDesc::new(TensorShape::dense(size), DType::F16, Usage::Immutable)
        .with_layout(Layout::Bcml1);
    desc.shape.stride[0] = 0;
    desc
}

/// Assert two f32 slices are close within tolerance
///
/// Uses the formula: |a - b| <= atol + rtol * |b|
pub fn assert_allclose_f32(a: &[f32], b: &[f32], rtol: f32, atol: f32, msg: &str) {
    assert_eq!(a.len(), b.len(), "{}: length mismatch", msg);
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        assert!(
            diff <= tol,
            "{}: element {} differs: {} vs {} (diff={}, tol={})",
            msg,
            i,
            x,
            y,
            diff,
            tol
        );
    }
}

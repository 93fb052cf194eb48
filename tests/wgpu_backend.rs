//! WebGPU backend tests. Every test returns early when no adapter exists.
//!
//! Devices opened for the same adapter index must share one `wgpu::Device`:
//! buffers from one device can't be used in bind groups on another, and
//! wgpu-core panics when they are.

#![cfg(feature = "wgpu")]

mod common;

use common::{compress_input_desc, f16_bytes, f32_bytes, f32_values, u32_words};
use gpuml::codec::bcml1;
use gpuml::prelude::*;
use gpuml::runtime::wgpu::{WgpuDevice, WgpuRuntime, is_wgpu_available};

const DOUBLE: &str = r#"
@group(0) @binding(1) var<storage, read_write> out: array<f32>;
@group(0) @binding(16) var<storage, read> input: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i < arrayLength(&out)) {
        out[i] = input[i] * 2.0;
    }
}
"#;

fn setup() -> Option<Device<WgpuRuntime>> {
    if !is_wgpu_available() {
        return None;
    }
    let config = DeviceConfig::default().with_cpu_features(CpuFeatures::all());
    Device::open(&WgpuDevice::new(0), config).ok()
}

fn read_f32(ctx: &mut Context<WgpuRuntime>, tensor: &Tensor<WgpuRuntime>) -> Vec<f32> {
    let mut out = Vec::new();
    ctx.download(tensor, DownloadFlag::None, |bytes| {
        out = f32_values(bytes);
        Ok(())
    })
    .unwrap();
    out
}

#[test]
fn test_upload_download_round_trip() {
    let Some(device) = setup() else {
        return;
    };
    let values: Vec<f32> = (0..64).map(|i| i as f32).collect();
    let desc = TensorDesc::new(TensorShape::vector(64), DType::F32, Usage::Immutable);
    let tensor = device.upload_immutable(&desc, &f32_bytes(&values)).unwrap();

    let mut ctx = device.context();
    assert_eq!(read_f32(&mut ctx, &tensor), values);
}

#[test]
fn test_odd_sized_tensor_round_trip() {
    let Some(device) = setup() else {
        return;
    };
    // 3 halves = 6 bytes, padded to 8 on the device
    let desc = TensorDesc::new(TensorShape::vector(3), DType::F16, Usage::Immutable);
    let payload = f16_bytes(&[1.0, 2.0, 3.0]);
    let tensor = device.upload_immutable(&desc, &payload).unwrap();

    let mut sink = Vec::new();
    device.context().write_tensor_data(&tensor, &mut sink).unwrap();
    assert_eq!(sink, payload);
}

#[test]
fn test_dispatch_doubles_input() {
    let Some(device) = setup() else {
        return;
    };
    let input = device
        .upload_immutable(
            &TensorDesc::new(TensorShape::vector(100), DType::F32, Usage::Immutable),
            &f32_bytes(&vec![1.5; 100]),
        )
        .unwrap();
    let (out, _) = device
        .create_tensor(
            &TensorDesc::new(TensorShape::vector(100), DType::F32, Usage::ReadWrite),
            None,
        )
        .unwrap();

    let mut ctx = device.context();
    ctx.create_compute_shaders(&[0..DOUBLE.len()], DOUBLE.as_bytes())
        .unwrap();
    ctx.bind_shader(0, &[]).unwrap();
    ctx.bind_tensors(&[&out], &[&input]).unwrap();
    ctx.dispatch(2, 1, 1).unwrap();

    assert_eq!(read_f32(&mut ctx, &out), vec![3.0; 100]);
}

#[test]
fn test_devices_share_one_adapter_client() {
    let Some(first) = setup() else {
        return;
    };
    let Some(second) = setup() else {
        return;
    };
    let desc = TensorDesc::new(TensorShape::vector(4), DType::F32, Usage::Immutable);
    let tensor = first
        .upload_immutable(&desc, &f32_bytes(&[1.0, 2.0, 3.0, 4.0]))
        .unwrap();

    let mut ctx = second.context();
    assert_eq!(read_f32(&mut ctx, &tensor), vec![1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_staged_download() {
    let Some(device) = setup() else {
        return;
    };
    let desc = TensorDesc::new(TensorShape::vector(5), DType::F32, Usage::ReadWriteDownload);
    let (tensor, _) = device.create_tensor(&desc, None).unwrap();
    let mut ctx = device.context();
    ctx.write_dynamic(&tensor, TensorShape::vector(5), |bytes| {
        bytes.copy_from_slice(&f32_bytes(&[5.0, 4.0, 3.0, 2.0, 1.0]));
        Ok(())
    })
    .unwrap();

    ctx.download(&tensor, DownloadFlag::CopyToStaging, |_| Ok(()))
        .unwrap();
    let mut out = Vec::new();
    ctx.download(&tensor, DownloadFlag::ReadStaging, |bytes| {
        out = f32_values(bytes);
        Ok(())
    })
    .unwrap();
    assert_eq!(out, vec![5.0, 4.0, 3.0, 2.0, 1.0]);
}

#[test]
fn test_compressed_upload() {
    let Some(device) = setup() else {
        return;
    };
    let values: Vec<f32> = (0..64).map(|i| (i % 16) as f32).collect();
    let tensor = device
        .upload_immutable(&compress_input_desc([32, 2, 1, 1]), &f16_bytes(&values))
        .unwrap();
    device.wait_for_compressor().unwrap();

    let mut sink = Vec::new();
    device.context().write_tensor_data(&tensor, &mut sink).unwrap();
    let decoded = bcml1::decompress(&tensor.desc(), &u32_words(&sink)).unwrap();
    assert_eq!(decoded, values);
}

//! Shader table, slot binding, dispatch and device-side copies

mod common;

use common::{cpu_device, cpu_device_with_limits, f32_bytes, f32_values};
use gpuml::prelude::*;
use gpuml::runtime::DeviceLimits;
use gpuml::runtime::cpu::CpuRuntime;

fn rw(device: &Device<CpuRuntime>, n: u32) -> Tensor<CpuRuntime> {
    let desc = TensorDesc::new(TensorShape::vector(n), DType::F32, Usage::ReadWrite);
    device.create_tensor(&desc, None).unwrap().0
}

fn weights(device: &Device<CpuRuntime>, values: &[f32]) -> Tensor<CpuRuntime> {
    let desc = TensorDesc::new(
        TensorShape::vector(values.len() as u32),
        DType::F32,
        Usage::Immutable,
    );
    device.upload_immutable(&desc, &f32_bytes(values)).unwrap()
}

#[test]
fn test_write_slot_count_limits() {
    let device = cpu_device();
    let limit = device.client().bound_write_slots().len();
    let tensors: Vec<_> = (0..=limit).map(|_| rw(&device, 4)).collect();
    let refs: Vec<&Tensor<CpuRuntime>> = tensors.iter().collect();
    let mut ctx = device.context();

    assert!(matches!(
        ctx.bind_tensors(&[], &[]),
        Err(Error::InvalidArgument { arg: "writes", .. })
    ));
    assert!(matches!(
        ctx.bind_tensors(&refs, &[]),
        Err(Error::InvalidArgument { arg: "writes", .. })
    ));
    assert_eq!(ctx.bound_slots(), (0, 0));

    ctx.bind_tensors(&refs[..limit], &[]).unwrap();
    assert_eq!(ctx.bound_slots(), (limit, 0));
}

#[test]
fn test_read_slot_count_limit() {
    let device = cpu_device_with_limits(DeviceLimits {
        max_read_slots: 2,
        ..DeviceLimits::default()
    });
    let out = rw(&device, 4);
    let inputs: Vec<_> = (0..3).map(|_| weights(&device, &[0.0])).collect();
    let mut ctx = device.context();

    let reads: Vec<&Tensor<CpuRuntime>> = inputs.iter().collect();
    assert!(matches!(
        ctx.bind_tensors(&[&out], &reads),
        Err(Error::InvalidArgument { arg: "reads", .. })
    ));
    ctx.bind_tensors(&[&out], &reads[..2]).unwrap();
}

#[test]
fn test_stale_slots_are_cleared() {
    let device = cpu_device();
    let a = rw(&device, 4);
    let b = rw(&device, 4);
    let c = rw(&device, 4);
    let x = weights(&device, &[1.0]);
    let y = weights(&device, &[2.0]);
    let mut ctx = device.context();

    ctx.bind_tensors(&[&a, &b, &c], &[&x, &y]).unwrap();
    let writes = ctx.client().bound_write_slots();
    assert!(writes[..3].iter().all(Option::is_some));

    ctx.bind_tensors(&[&c], &[&y]).unwrap();
    let writes = ctx.client().bound_write_slots();
    assert_eq!(writes[0], Some(c.buffer().unwrap().id()));
    assert!(writes[1..].iter().all(Option::is_none));
    let reads = ctx.client().bound_read_slots();
    assert_eq!(reads[0], Some(y.buffer().unwrap().id()));
    assert!(reads[1..].iter().all(Option::is_none));
}

#[test]
fn test_binding_needs_views() {
    let device = cpu_device();
    let out = rw(&device, 4);
    let weights = weights(&device, &[1.0]);
    let pending = device
        .create_uninitialized(&TensorDesc::new(
            TensorShape::vector(1),
            DType::F32,
            Usage::Immutable,
        ))
        .unwrap();
    let mut ctx = device.context();

    assert!(matches!(
        ctx.bind_tensors(&[&weights], &[]),
        Err(Error::InvalidArgument { arg: "writes", .. })
    ));
    assert!(matches!(
        ctx.bind_tensors(&[&out], &[&pending]),
        Err(Error::UninitializedResource)
    ));
}

#[test]
fn test_unbind_inputs_is_idempotent() {
    let device = cpu_device();
    let out = rw(&device, 4);
    let x = weights(&device, &[1.0]);
    let mut ctx = device.context();

    ctx.unbind_inputs();
    ctx.bind_tensors(&[&out], &[&x, &x]).unwrap();
    ctx.unbind_inputs();
    assert_eq!(ctx.bound_slots(), (1, 0));
    assert!(ctx.client().bound_read_slots().iter().all(Option::is_none));
    assert!(ctx.client().bound_write_slots()[0].is_some());
    ctx.unbind_inputs();
}

#[test]
fn test_dispatch_checks() {
    let device = cpu_device_with_limits(DeviceLimits {
        max_groups_per_dimension: 4,
        ..DeviceLimits::default()
    });
    let mut ctx = device.context();

    assert!(matches!(
        ctx.dispatch(1, 1, 1),
        Err(Error::NullReference { .. })
    ));

    ctx.create_compute_shaders(&[0..4], b"noop").unwrap();
    ctx.bind_shader(0, &[]).unwrap();
    assert!(matches!(
        ctx.dispatch(0, 1, 1),
        Err(Error::InvalidArgument { arg: "groups", .. })
    ));
    assert!(matches!(
        ctx.dispatch(1, 5, 1),
        Err(Error::InvalidArgument { arg: "groups", .. })
    ));
    ctx.dispatch(4, 4, 4).unwrap();

    let log = ctx.client().dispatch_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].groups, [4, 4, 4]);
}

#[test]
fn test_replacing_shaders_unbinds_current() {
    let device = cpu_device();
    let mut ctx = device.context();
    ctx.create_compute_shaders(&[0..1], b"a").unwrap();
    ctx.bind_shader(0, &[]).unwrap();
    assert_eq!(ctx.bound_shader(), Some(0));

    ctx.create_compute_shaders(&[0..1, 1..2], b"bc").unwrap();
    assert_eq!(ctx.bound_shader(), None);
    assert!(matches!(
        ctx.dispatch(1, 1, 1),
        Err(Error::NullReference { .. })
    ));
}

#[test]
fn test_registered_kernel_sees_bindings_and_constants() {
    let device = cpu_device();
    device.client().register_kernel(b"scale", |args| {
        let factor = f32::from_le_bytes(args.constants()[..4].try_into().unwrap());
        let input = f32_values(args.read(0)?);
        let out = args.write(0)?;
        for (dst, v) in out.chunks_exact_mut(4).zip(input) {
            dst.copy_from_slice(&(v * factor).to_le_bytes());
        }
        Ok(())
    });

    let x = weights(&device, &[1.0, 2.0, 3.0]);
    let out = rw(&device, 3);
    let mut ctx = device.context();
    ctx.create_compute_shaders(&[0..5], b"scale").unwrap();
    ctx.bind_shader(0, &2.5f32.to_le_bytes()).unwrap();
    ctx.bind_tensors(&[&out], &[&x]).unwrap();
    ctx.dispatch(1, 1, 1).unwrap();

    let mut result = Vec::new();
    ctx.download(&out, DownloadFlag::None, |bytes| {
        result = f32_values(bytes);
        Ok(())
    })
    .unwrap();
    assert_eq!(result, vec![2.5, 5.0, 7.5]);

    let record = &ctx.client().dispatch_log()[0];
    assert_eq!(record.constant_bytes, 16);
    assert_eq!(record.reads[0], Some(x.buffer().unwrap().id()));
}

#[test]
fn test_copy_between_tensors() {
    let device = cpu_device();
    let src = weights(&device, &[4.0, 5.0, 6.0, 7.0]);
    let dst = rw(&device, 4);
    let short = rw(&device, 2);
    let mut ctx = device.context();

    ctx.copy(&dst, &src).unwrap();
    ctx.copy(&short, &src).unwrap();

    let mut full = Vec::new();
    ctx.download(&dst, DownloadFlag::None, |bytes| {
        full = f32_values(bytes);
        Ok(())
    })
    .unwrap();
    assert_eq!(full, vec![4.0, 5.0, 6.0, 7.0]);

    let mut head = Vec::new();
    ctx.download(&short, DownloadFlag::None, |bytes| {
        head = f32_values(bytes);
        Ok(())
    })
    .unwrap();
    assert_eq!(head, vec![4.0, 5.0]);

    assert!(matches!(
        ctx.copy(&src, &dst),
        Err(Error::InvalidArgument { arg: "dst", .. })
    ));
}

#[test]
fn test_write_tensor_data_streams_immutable_payload() {
    let device = cpu_device();
    let payload = f32_bytes(&[0.5, -1.0]);
    let desc = TensorDesc::new(TensorShape::vector(2), DType::F32, Usage::Immutable);
    let tensor = device.upload_immutable(&desc, &payload).unwrap();
    let mut ctx = device.context();

    let mut sink = Vec::new();
    ctx.write_tensor_data(&tensor, &mut sink).unwrap();
    assert_eq!(sink, payload);

    let out = rw(&device, 2);
    assert!(matches!(
        ctx.write_tensor_data(&out, &mut sink),
        Err(Error::NotImplemented { .. })
    ));
}

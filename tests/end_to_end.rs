use dynplan::{
    CompiledPlan, Device, DimRange, EngineState, ErrorClass, GraphError, HostTensor,
    InferenceSession, PlanCompiler, Precision, RegionSpec, Runtime, define_region_graph,
    negotiate,
};

fn small_region() -> RegionSpec {
    RegionSpec {
        height: 16,
        width: 12,
        ..RegionSpec::default()
    }
}

fn compile(spec: &RegionSpec, precision: Precision) -> CompiledPlan {
    let graph = define_region_graph(spec).unwrap();
    let profile = negotiate(&graph, DimRange::default()).unwrap();
    PlanCompiler::default()
        .compile(&graph, &profile, precision)
        .unwrap()
}

fn session(plan: &CompiledPlan, device: &Device) -> InferenceSession {
    let engine = Runtime::new(device.clone()).load_plan(plan).unwrap();
    InferenceSession::bind(engine, "input", "output").unwrap()
}

/// Values that differ per element and are not exact in binary16.
fn ramp(shape: &[usize]) -> HostTensor {
    let count: usize = shape.iter().product();
    let data = (0..count).map(|i| 0.1 + i as f32 / 7.0).collect();
    HostTensor::from_data(data, shape.to_vec(), dynplan::DataType::Float32)
}

#[test]
fn every_batch_in_range_yields_half_extents() {
    let spec = small_region();
    let plan = compile(&spec, Precision::Fp32);
    let device = Device::with_capacity(1 << 26);
    let mut session = session(&plan, &device);

    for batch in 1..=16u32 {
        let input = ramp(&[batch as usize, 3, 16, 12]);
        let output = session.infer(&input).unwrap();
        assert_eq!(output.shape, vec![batch as usize, 3, 8, 6]);
        assert_eq!(
            spec.output_dims(batch).map(|d| d as usize).to_vec(),
            output.shape
        );

        // Spot-check the strided gather on the last plane.
        let (n, c) = (batch as usize - 1, 2);
        let src = |h: usize, w: usize| input.data[((n * 3 + c) * 16 + h) * 12 + w];
        let dst = |h: usize, w: usize| output.data[((n * 3 + c) * 8 + h) * 6 + w];
        assert_eq!(dst(0, 0), src(0, 0));
        assert_eq!(dst(7, 5), src(14, 10));
        assert_eq!(dst(3, 2), src(6, 4));
    }
    assert_eq!(session.state(), EngineState::Synchronized);
}

#[test]
fn out_of_range_batches_are_rejected_before_any_stream_work() {
    let plan = compile(&small_region(), Precision::Fp32);
    let device = Device::with_capacity(1 << 26);
    let mut session = session(&plan, &device);
    let used = device.memory_used();

    for batch in [0usize, 17, 64] {
        let err = session
            .infer(&HostTensor::filled(vec![batch, 3, 16, 12], 0.5))
            .unwrap_err();
        assert!(
            matches!(err, GraphError::ShapeOutOfRange { axis: 0, min: 1, max: 16, .. }),
            "{err}"
        );
        assert_eq!(err.class(), ErrorClass::Invocation);
    }
    assert_eq!(session.stream_submitted(), 0);
    assert_eq!(device.memory_used(), used);

    // Still usable afterwards.
    let output = session
        .infer(&HostTensor::filled(vec![4, 3, 16, 12], 0.5))
        .unwrap();
    assert_eq!(output.shape, vec![4, 3, 8, 6]);
}

#[test]
fn repeated_runs_are_byte_identical() {
    let plan = compile(&small_region(), Precision::Fp32);
    let input = ramp(&[5, 3, 16, 12]);

    let device = Device::with_capacity(1 << 26);
    let first = session(&plan, &device).infer(&input).unwrap();
    let second = session(&plan, &device).infer(&input).unwrap();
    let as_bits = |t: &HostTensor| t.data.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(as_bits(&first), as_bits(&second));
}

#[test]
fn half_precision_stays_within_tolerance() {
    let spec = small_region();
    let full = compile(&spec, Precision::Fp32);
    let half = compile(&spec, Precision::Fp16);
    assert_eq!(full.program().tensors, half.program().tensors);

    let input = ramp(&[3, 3, 16, 12]);
    let device = Device::with_capacity(1 << 26);
    let exact = session(&full, &device).infer(&input).unwrap();
    let reduced = session(&half, &device).infer(&input).unwrap();

    assert_eq!(exact.shape, reduced.shape);
    let tolerance = Precision::Fp16.relative_tolerance();
    let mut differs = false;
    for (a, b) in exact.data.iter().zip(&reduced.data) {
        assert!(((a - b) / a).abs() <= tolerance, "{a} vs {b}");
        differs |= a != b;
    }
    assert!(differs);
}

#[test]
fn persisted_plan_runs_like_the_original() {
    let plan = compile(&small_region(), Precision::Fp16);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights").join("test.engine");
    plan.save(&path).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let device = Device::with_capacity(1 << 26);
    let runtime = Runtime::new(device.clone());
    let reloaded = runtime.deserialize_plan(&bytes).unwrap();
    assert_eq!(reloaded.io_tensor_names(), vec!["input", "output"]);

    let input = ramp(&[7, 3, 16, 12]);
    let original = session(&plan, &device).infer(&input).unwrap();
    let mut restored = InferenceSession::bind(reloaded, "input", "output").unwrap();
    assert_eq!(restored.infer(&input).unwrap(), original);
}

#[test]
fn corrupted_plans_fail_clearly() {
    let plan = compile(&small_region(), Precision::Fp32);
    let runtime = Runtime::new(Device::with_capacity(1 << 20));

    let mut wrong_magic = plan.as_bytes().to_vec();
    wrong_magic[0] = b'X';
    let mut flipped = plan.as_bytes().to_vec();
    let last = flipped.len() - 1;
    flipped[last] ^= 0x55;
    let truncated = plan.as_bytes()[..plan.as_bytes().len() / 2].to_vec();

    for bytes in [wrong_magic, flipped, truncated] {
        let err = runtime.deserialize_plan(&bytes).unwrap_err();
        assert!(matches!(err, GraphError::IncompatiblePlan { .. }), "{err}");
        assert_eq!(err.class(), ErrorClass::Plan);
    }
}

#[test]
fn role_mismatch_is_fatal_at_bind() {
    let plan = compile(&small_region(), Precision::Fp32);
    let engine = Runtime::new(Device::with_capacity(1 << 26))
        .load_plan(&plan)
        .unwrap();
    let err = InferenceSession::bind(engine, "input", "input").err().unwrap();
    assert!(err.to_string().contains("should be an output tensor"));
    assert_eq!(err.class(), ErrorClass::Binding);
}

#[test]
fn full_resolution_scenario() {
    let plan = compile(&RegionSpec::default(), Precision::Fp16);
    let device = Device::with_capacity(1 << 30);
    let mut session = session(&plan, &device);

    let output = session
        .infer(&HostTensor::filled(vec![4, 3, 960, 960], 0.5))
        .unwrap();
    assert_eq!(output.shape, vec![4, 3, 480, 480]);
    assert_eq!(output.data.len(), 4 * 3 * 480 * 480);
    assert!(output.data.iter().all(|&v| v == 0.5));

    session.release().unwrap();
    assert_eq!(device.memory_used(), 0);
}

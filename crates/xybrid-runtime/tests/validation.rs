//! Argument validation on every run path, and error reporting.

use ndarray::{Array, IxDyn};
use xybrid_runtime::prelude::*;
use xybrid_runtime::testing::MockBackend;

fn setup() -> (MockBackend, CompiledModel<MockBackend>) {
    let backend = MockBackend::builder()
        .input_shape([1, 3, 2, 2])
        .output_shape([1, 5])
        .build();
    let model = CompiledModel::create_with_gate(
        backend.clone(),
        MockBackend::MAGIC,
        &InferenceConfig::default(),
        ComputeGate::new(),
    )
    .unwrap();
    (backend, model)
}

fn assert_invalid(result: Result<()>) {
    match result {
        Err(err) => {
            assert!(matches!(err, RuntimeError::InvalidParameter(_)), "{}", err);
            assert_eq!(err.code(), ErrorCode::InvalidParameter);
        }
        Ok(()) => panic!("expected InvalidParameter"),
    }
}

#[test]
fn size_mismatches_never_reach_the_backend() {
    let (backend, model) = setup();
    let pool = SessionPool::create(&model, 2, &InferenceConfig::default()).unwrap();
    let mut context = UnmanagedContext::create(&model, &InferenceConfig::default()).unwrap();

    let good_in = vec![0.0f32; 12];
    let short_in = vec![0.0f32; 11];
    let mut good_out = vec![0.0f32; 5];
    let mut long_out = vec![0.0f32; 6];

    assert_invalid(model.run(&short_in, &mut good_out));
    assert_invalid(model.run(&good_in, &mut long_out));
    assert_invalid(model.run(&[], &mut good_out));
    assert_invalid(pool.acquire_and_run(&short_in, &mut good_out));
    assert_invalid(pool.acquire_and_run(&good_in, &mut long_out));
    assert_invalid(context.run(&short_in, &mut good_out));
    assert_invalid(context.run(&good_in, &mut long_out));
    assert_invalid(model.run_dynamic(&short_in, &[1, 3, 2, 2]).map(|_| ()));

    let wrong = Array::<f32, _>::zeros(IxDyn(&[1, 12]));
    assert_invalid(model.run_array(wrong.view()).map(|_| ()));
    assert_invalid(pool.run_array(wrong.view()).map(|_| ()));

    assert_eq!(backend.stats().runs, 0);
    assert_eq!(backend.stats().resizes, 0);
    assert_eq!(pool.available_count(), 2);
}

#[test]
fn last_error_is_per_resource() {
    let (_backend, model) = setup();
    let pool = SessionPool::create(&model, 1, &InferenceConfig::default()).unwrap();
    let mut output = vec![0.0f32; 5];

    assert!(model.last_error().is_empty());
    let _ = pool.acquire_and_run(&[1.0; 3], &mut output);

    assert!(pool.last_error().contains("input size mismatch"));
    assert!(model.last_error().is_empty());

    let _ = model.run(&[1.0; 12], &mut [0.0; 2]);
    assert_eq!(
        model.last_error(),
        "Invalid parameter: output size mismatch: expected 5 elements, got 2"
    );
}

#[test]
fn identical_inputs_give_identical_outputs() {
    let (_backend, model) = setup();
    let pool = SessionPool::create(&model, 2, &InferenceConfig::default()).unwrap();
    let input: Vec<f32> = (0..12).map(|i| i as f32 * 0.1).collect();

    let mut direct = vec![0.0f32; 5];
    model.run(&input, &mut direct).unwrap();

    for _ in 0..4 {
        let mut pooled = vec![0.0f32; 5];
        pool.acquire_and_run(&input, &mut pooled).unwrap();
        assert_eq!(pooled, direct);
    }
}

#[test]
fn multiple_tensors_are_unsupported() {
    let backend = MockBackend::builder().input_count(2).build();
    let err = CompiledModel::create(backend, MockBackend::MAGIC, &InferenceConfig::default())
        .err()
        .unwrap();
    assert_eq!(err.code(), ErrorCode::Unsupported);
    assert!(err.to_string().contains("input_0, input_1"), "{}", err);
}

#[test]
fn model_construction_leaves_nothing_behind_on_failure() {
    let backend = MockBackend::builder().output_count(0).build();
    let result = CompiledModel::create(backend.clone(), MockBackend::MAGIC, &InferenceConfig::default());
    assert!(matches!(result, Err(RuntimeError::Runtime(_))));

    let stats = backend.stats();
    assert_eq!(stats.sessions_created, 1);
    assert_eq!(stats.sessions_live, 0);
}

#[test]
fn rank_above_eight_is_unsupported() {
    let (backend, model) = setup();
    let err = model.run_dynamic(&[1.0], &[1; 9]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::Unsupported);
    assert_eq!(backend.stats().runs, 0);
}

#[test]
fn config_file_drives_the_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runtime.json");
    std::fs::write(&path, r#"{"thread_count": 0, "precision_mode": "low"}"#).unwrap();

    let config = InferenceConfig::from_file(&path).unwrap();
    let backend = MockBackend::default();
    let _model = CompiledModel::create(backend.clone(), MockBackend::MAGIC, &config).unwrap();

    let schedule = backend.last_schedule().unwrap();
    assert_eq!(schedule.threads, 4);
    assert_eq!(schedule.precision, PrecisionMode::Low);
}

#[test]
fn large_flattened_outputs_run_on_every_path() {
    let backend = MockBackend::builder()
        .input_shape([1, 3, 224, 224])
        .output_shape([1, 150_528])
        .bias(1.0)
        .build();
    let model = CompiledModel::create_with_gate(
        backend.clone(),
        MockBackend::MAGIC,
        &InferenceConfig::default(),
        ComputeGate::new(),
    )
    .unwrap();
    assert!(!model.has_dynamic_shape());
    assert_eq!(model.output_shape().dims(), &[1, 150_528]);

    let input = vec![0.5f32; 150_528];
    let mut output = vec![0.0f32; 150_528];

    model.run(&input, &mut output).unwrap();
    assert!(output.iter().all(|&v| v == 1.5));

    let pool = SessionPool::create(&model, 2, &InferenceConfig::default()).unwrap();
    output.fill(0.0);
    pool.acquire_and_run(&input, &mut output).unwrap();
    assert!(output.iter().all(|&v| v == 1.5));

    let mut context = UnmanagedContext::create(&model, &InferenceConfig::default()).unwrap();
    output.fill(0.0);
    context.run(&input, &mut output).unwrap();
    assert!(output.iter().all(|&v| v == 1.5));

    let dynamic = model.run_dynamic(&input, &[1, 3, 224, 224]).unwrap();
    assert_eq!(dynamic.shape().dims(), &[1, 150_528]);
    assert_eq!(dynamic.len(), 150_528);

    assert_eq!(backend.stats().runs, 4);
    assert!(model.last_error().is_empty());
}

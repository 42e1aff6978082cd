//! Session pool behavior under contention and construction failure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use xybrid_runtime::prelude::*;
use xybrid_runtime::testing::{CountingObserver, MockBackend};

fn observed_model(backend: &MockBackend) -> (CompiledModel<MockBackend>, Arc<CountingObserver>) {
    let observer = Arc::new(CountingObserver::new());
    let gate = ComputeGate::with_observer(observer.clone());
    let model = CompiledModel::create_with_gate(
        backend.clone(),
        MockBackend::MAGIC,
        &InferenceConfig::default(),
        gate,
    )
    .unwrap();
    (model, observer)
}

#[test]
fn fifty_callers_share_four_slots_with_serialized_compute() {
    let backend = MockBackend::builder()
        .input_shape([1, 16])
        .output_shape([1, 16])
        .scale(2.0)
        .latency(Duration::from_micros(300))
        .build();
    let (model, observer) = observed_model(&backend);
    let pool = Arc::new(SessionPool::create(&model, 4, &InferenceConfig::default()).unwrap());

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let input = vec![i as f32; 16];
                let mut output = vec![0.0f32; 16];
                pool.acquire_and_run(&input, &mut output).unwrap();
                assert!(output.iter().all(|&v| v == 2.0 * i as f32));
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(observer.max_concurrent(), 1);
    assert_eq!(observer.current(), 0);
    assert_eq!(observer.entries(), 50);
    assert_eq!(backend.stats().max_in_flight, 1);
    assert_eq!(backend.stats().runs, 50);

    let stats = pool.stats();
    assert_eq!(stats.completed, 50);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.available, 4);
}

#[test]
fn available_count_stays_within_bounds() {
    let backend = MockBackend::builder()
        .latency(Duration::from_micros(200))
        .build();
    let (model, _observer) = observed_model(&backend);
    let pool = Arc::new(SessionPool::create(&model, 3, &InferenceConfig::default()).unwrap());
    let done = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut output = [0.0f32; 4];
                for _ in 0..10 {
                    pool.acquire_and_run(&[1.0; 4], &mut output).unwrap();
                }
                done.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    while done.load(Ordering::SeqCst) < 8 {
        let available = pool.available_count();
        assert!(available <= pool.size(), "available {} > size", available);
        thread::yield_now();
    }
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(pool.available_count(), 3);
}

#[test]
fn failed_construction_releases_partial_contexts() {
    let backend = MockBackend::default();
    let (model, _observer) = observed_model(&backend);
    assert_eq!(backend.stats().sessions_live, 1);

    backend.fail_session_at(3);
    let err = SessionPool::create(&model, 4, &InferenceConfig::default())
        .err()
        .unwrap();

    assert_eq!(err.code(), ErrorCode::RuntimeError);
    assert!(err.to_string().contains("context 3 of 4"), "{}", err);
    let stats = backend.stats();
    assert_eq!(stats.sessions_created, 3);
    assert_eq!(stats.sessions_live, 1);
    assert_eq!(model.live_contexts(), 1);
}

#[test]
fn failed_runs_never_leak_slots() {
    let backend = MockBackend::default();
    let (model, _observer) = observed_model(&backend);
    let pool = SessionPool::create(&model, 2, &InferenceConfig::default()).unwrap();

    backend.fail_runs(5);
    let mut output = [0.0f32; 4];
    for _ in 0..5 {
        assert!(pool.acquire_and_run(&[1.0; 4], &mut output).is_err());
        assert_eq!(pool.available_count(), 2);
    }

    pool.acquire_and_run(&[3.0; 4], &mut output).unwrap();
    assert_eq!(output, [3.0; 4]);
    assert_eq!(pool.stats().failed, 5);
    assert_eq!(pool.stats().completed, 1);
}

#[test]
fn pools_and_contexts_outlive_the_model_handle() {
    let backend = MockBackend::builder().input_shape([1, 2]).output_shape([1, 2]).build();
    let (model, _observer) = observed_model(&backend);
    let pool = SessionPool::create(&model, 2, &InferenceConfig::default()).unwrap();
    let mut context = UnmanagedContext::create(&model, &InferenceConfig::default()).unwrap();
    drop(model);

    let mut output = [0.0f32; 2];
    pool.acquire_and_run(&[1.0, 2.0], &mut output).unwrap();
    context.run(&[3.0, 4.0], &mut output).unwrap();
    assert_eq!(output, [3.0, 4.0]);
    assert_eq!(backend.stats().sessions_live, 3);

    drop(pool);
    context.destroy();
    assert_eq!(backend.stats().sessions_live, 0);
}

#[test]
fn pools_on_different_models_share_the_gate() {
    let observer = Arc::new(CountingObserver::new());
    let gate = ComputeGate::with_observer(observer.clone());
    let backends: Vec<_> = (0..3)
        .map(|_| MockBackend::builder().latency(Duration::from_micros(200)).build())
        .collect();
    let pools: Vec<_> = backends
        .iter()
        .map(|backend| {
            let model = CompiledModel::create_with_gate(
                backend.clone(),
                MockBackend::MAGIC,
                &InferenceConfig::default(),
                gate.clone(),
            )
            .unwrap();
            Arc::new(SessionPool::create(&model, 2, &InferenceConfig::default()).unwrap())
        })
        .collect();

    let handles: Vec<_> = (0..12)
        .map(|i| {
            let pool = Arc::clone(&pools[i % pools.len()]);
            thread::spawn(move || {
                let mut output = [0.0f32; 4];
                for _ in 0..5 {
                    pool.acquire_and_run(&[0.5; 4], &mut output).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(observer.max_concurrent(), 1);
    assert_eq!(gate.entries(), 60);
}

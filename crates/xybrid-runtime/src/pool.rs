//! Session pool - bounded set of reusable execution contexts.
//!
//! A pool eagerly creates `size` contexts from one model and hands them out
//! one caller at a time. Callers beyond `size` block until a slot is released;
//! there is no "pool full" error. Each run goes through four steps:
//!
//! 1. **acquire** - pop an idle slot index, waiting on a condvar if none is idle
//! 2. **stage** - copy the input into the slot's staging buffer, outside the gate
//! 3. **compute** - bind, run and copy out while holding the compute gate
//! 4. **release** - the slot guard pushes the index back and wakes one waiter
//!
//! Staging for one caller overlaps with another caller's compute. The order in
//! which blocked callers are served is unspecified.
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//! use xybrid_runtime::prelude::*;
//! use xybrid_runtime::testing::MockBackend;
//!
//! let backend = MockBackend::builder().input_shape([1, 2]).output_shape([1, 2]).build();
//! let model = CompiledModel::create(backend, MockBackend::MAGIC, &InferenceConfig::default())?;
//! let pool = Arc::new(SessionPool::create(&model, 2, &InferenceConfig::default())?);
//!
//! let handles: Vec<_> = (0..4)
//!     .map(|i| {
//!         let pool = Arc::clone(&pool);
//!         thread::spawn(move || {
//!             let mut output = [0.0f32; 2];
//!             pool.acquire_and_run(&[i as f32, 1.0], &mut output).map(|_| output)
//!         })
//!     })
//!     .collect();
//! for handle in handles {
//!     handle.join().unwrap()?;
//! }
//! assert_eq!(pool.available_count(), 2);
//! # Ok::<(), RuntimeError>(())
//! ```

use crate::backend::InferenceBackend;
use crate::config::{InferenceConfig, ScheduleConfig};
use crate::context::ExecutionContext;
use crate::error::{LastError, Result, RuntimeError};
use crate::model::CompiledModel;
use crate::shape::{ensure_len, TensorShape};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

/// Snapshot of a pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub completed: u64,
    pub failed: u64,
}

/// Fixed-size pool of execution contexts drawn from one model.
pub struct SessionPool<B: InferenceBackend> {
    slots: Vec<Mutex<ExecutionContext<B>>>,
    /// Indices of idle slots. Never holds duplicates or more than `slots.len()` entries.
    idle: Mutex<VecDeque<usize>>,
    released: Condvar,
    input_shape: TensorShape,
    output_shape: TensorShape,
    input_len: usize,
    output_len: usize,
    last_error: LastError,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl<B: InferenceBackend> SessionPool<B> {
    /// Creates `size` contexts from `model`.
    ///
    /// Construction is atomic: if any context fails, every context created so
    /// far is released and a `Runtime` error is returned.
    pub fn create(model: &CompiledModel<B>, size: usize, config: &InferenceConfig) -> Result<Self> {
        if size == 0 {
            return Err(RuntimeError::invalid("pool size must be at least 1"));
        }

        let input_shape = model.input_shape().clone();
        let output_shape = model.output_shape().clone();
        let input_len = input_shape.fixed_len("input")?;
        let output_len = output_shape.fixed_len("output")?;

        let schedule = ScheduleConfig::from(config);
        let mut contexts = Vec::with_capacity(size);
        for index in 0..size {
            match ExecutionContext::create(model.core(), &schedule) {
                Ok(context) => contexts.push(context),
                Err(err) => {
                    log::warn!(
                        "Pool construction failed at context {} of {}, releasing {} created: {}",
                        index + 1,
                        size,
                        contexts.len(),
                        err
                    );
                    drop(contexts);
                    return Err(match err {
                        RuntimeError::OutOfMemory => RuntimeError::OutOfMemory,
                        other => RuntimeError::runtime(format!(
                            "Failed to create pool context {} of {}: {}",
                            index + 1,
                            size,
                            other
                        )),
                    });
                }
            }
        }

        log::info!(
            "Created session pool: {} contexts, input {}, output {}, {} threads each",
            size,
            input_shape,
            output_shape,
            schedule.threads
        );

        Ok(Self {
            slots: contexts.into_iter().map(Mutex::new).collect(),
            idle: Mutex::new((0..size).collect()),
            released: Condvar::new(),
            input_shape,
            output_shape,
            input_len,
            output_len,
            last_error: LastError::new(),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Acquires a slot, runs one inference and releases the slot.
    ///
    /// Blocks while every slot is in use. Sizes are validated before a slot is
    /// acquired. A failed run still returns its slot to the pool.
    pub fn acquire_and_run(&self, input: &[f32], output: &mut [f32]) -> Result<()> {
        let result = self.run_slot(input, output);
        match &result {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Pool inference failed: {}", err);
            }
        }
        self.last_error.record(result)
    }

    fn run_slot(&self, input: &[f32], output: &mut [f32]) -> Result<()> {
        ensure_len("input", input.len(), self.input_len)?;
        ensure_len("output", output.len(), self.output_len)?;

        let slot = self.acquire()?;
        let mut context = self.slots[slot.index]
            .lock()
            .map_err(|e| RuntimeError::lock_failed("pool slot", e))?;
        context.stage(input);
        context.compute_into(output)
    }

    fn acquire(&self) -> Result<SlotGuard<'_, B>> {
        let idle = self
            .idle
            .lock()
            .map_err(|e| RuntimeError::lock_failed("pool queue", e))?;
        let mut idle = self
            .released
            .wait_while(idle, |idle| idle.is_empty())
            .map_err(|e| RuntimeError::lock_failed("pool queue", e))?;
        let index = idle
            .pop_front()
            .ok_or_else(|| RuntimeError::runtime("pool queue empty after wakeup"))?;
        Ok(SlotGuard { pool: self, index })
    }

    /// Runs one inference on an `ndarray` view shaped like the model input.
    pub fn run_array(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
        if input.shape() != self.input_shape.dims() {
            let err = RuntimeError::invalid(format!(
                "input shape mismatch: expected {}, got {:?}",
                self.input_shape,
                input.shape()
            ));
            return self.last_error.record(Err(err));
        }

        let input = input.as_standard_layout();
        let data = input.as_slice().ok_or_else(|| {
            RuntimeError::runtime("input array is not contiguous after conversion")
        })?;
        let mut output = ArrayD::<f32>::zeros(IxDyn(self.output_shape.dims()));
        let out = output
            .as_slice_mut()
            .ok_or_else(|| RuntimeError::runtime("output array is not contiguous"))?;
        self.acquire_and_run(data, out)?;
        Ok(output)
    }

    /// Number of idle slots right now. A diagnostic snapshot; it may be stale on return.
    pub fn available_count(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn input_shape(&self) -> &TensorShape {
        &self.input_shape
    }

    pub fn output_shape(&self) -> &TensorShape {
        &self.output_shape
    }

    /// Message of the most recent failed run on this pool.
    pub fn last_error(&self) -> String {
        self.last_error.get()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size(),
            available: self.available_count(),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl<B: InferenceBackend> Drop for SessionPool<B> {
    fn drop(&mut self) {
        log::debug!("Releasing session pool of {} contexts", self.slots.len());
    }
}

/// Holds one slot index; returns it to the idle queue on drop.
struct SlotGuard<'a, B: InferenceBackend> {
    pool: &'a SessionPool<B>,
    index: usize,
}

impl<B: InferenceBackend> Drop for SlotGuard<'_, B> {
    fn drop(&mut self) {
        // The queue only holds indices, so a poisoned lock is still consistent.
        let mut idle = self
            .pool
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        debug_assert!(!idle.contains(&self.index), "slot {} released twice", self.index);
        idle.push_back(self.index);
        drop(idle);
        self.pool.released.notify_one();
    }
}

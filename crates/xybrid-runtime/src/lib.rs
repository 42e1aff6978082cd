//! Xybrid Runtime - bounded-concurrency session pooling over native inference backends.
//!
//! Native inference backends are not safe to call into from several
//! application threads at once. This crate puts a safe facade in front of
//! them:
//!
//! - a [`CompiledModel`] owns a parsed model and a default context; its runs
//!   are fully serialized
//! - a [`SessionPool`] hands out a fixed number of reusable contexts so
//!   independent callers can stage data concurrently
//! - an [`UnmanagedContext`] leaves lifecycle and concurrency to the caller
//! - [`CompiledModel::run_dynamic`] resizes the input per call
//!
//! Every backend compute call, from any model, pool or context, happens
//! inside a [`ComputeGate`]. With the default global gate only one compute
//! call executes in the process at any instant.
//!
//! ## Quick Start
//!
//! ```rust
//! use xybrid_runtime::prelude::*;
//! use xybrid_runtime::testing::MockBackend;
//!
//! let backend = MockBackend::builder().input_shape([1, 4]).output_shape([1, 4]).build();
//! let config = InferenceConfig::default();
//! let model = CompiledModel::create(backend, MockBackend::MAGIC, &config)?;
//! let pool = SessionPool::create(&model, 4, &config)?;
//!
//! let mut output = vec![0.0f32; 4];
//! pool.acquire_and_run(&[0.1, 0.2, 0.3, 0.4], &mut output)?;
//! # Ok::<(), RuntimeError>(())
//! ```
//!
//! ## Module Organization
//!
//! ### Core
//! - [`model`] - Compiled models and fixed-shape runs
//! - [`pool`] - Session pool
//! - [`context`] - Unmanaged execution contexts
//! - [`dynamic`] - Dynamic-shape runs
//! - [`gate`] - Compute serialization gate
//!
//! ### Plumbing
//! - [`backend`] - Backend trait (and the ONNX backend with feature `onnx`)
//! - [`config`] - Inference configuration
//! - [`runtime`] - Shared runtime
//! - [`shape`] - Tensor shapes
//! - [`error`] - Error types and codes
//!
//! ### Testing
//! - [`testing`] - Mock backend and gate observer

pub mod backend;
pub mod config;
pub mod context;
pub mod dynamic;
pub mod error;
pub mod gate;
pub mod model;
pub mod pool;
pub mod prelude;
pub mod runtime;
pub mod shape;

/// Mocks for exercising the runtime without a native backend.
pub mod testing;

pub use backend::{BoundBuffers, InferenceBackend};
pub use config::{BackendTarget, DataFormat, InferenceConfig, PrecisionMode, ScheduleConfig};
pub use context::UnmanagedContext;
pub use dynamic::DynamicOutput;
pub use error::{BackendError, BackendResult, ErrorCode, Result, RuntimeError};
pub use gate::{ComputeGate, GateObserver};
pub use model::CompiledModel;
pub use pool::{PoolStats, SessionPool};
pub use runtime::SharedRuntime;
pub use shape::{TensorShape, UNRESOLVED_DIM};

//! Testing utilities for xybrid-runtime.
//!
//! Provides a deterministic in-memory backend and a gate observer so pools,
//! gates and dynamic shapes can be exercised without a native library.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use xybrid_runtime::gate::ComputeGate;
//! use xybrid_runtime::testing::{CountingObserver, MockBackend};
//!
//! let backend = MockBackend::builder().input_shape([1, 8]).output_shape([1, 2]).build();
//! let observer = Arc::new(CountingObserver::new());
//! let gate = ComputeGate::with_observer(observer.clone());
//! # let _ = (backend, gate);
//! ```

pub mod mocks;

pub use mocks::*;

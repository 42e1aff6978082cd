//! Inference backend contract.
//!
//! The runtime never performs numerical inference itself. It drives a native
//! backend through [`InferenceBackend`], which mirrors the operations such
//! backends expose:
//!
//! - load a model from bytes
//! - create/release sessions (isolated execution contexts) from a schedule
//! - look up the input/output buffers bound to a session
//! - resize an input buffer and then the session, for dynamic shapes
//! - run a forward pass
//! - bulk-copy `f32` data between host memory and bound buffers
//!
//! Buffer handles are *not* stable identities. A resize (and, for models whose
//! output extent depends on the data, a run following a resize) may replace
//! them, so callers re-fetch handles via [`InferenceBackend::bound_buffers`]
//! after every resize instead of caching them.
//!
//! # Module Organization
//!
//! - `onnx` - ONNX Runtime backend (feature `onnx`)
//! - [`crate::testing::MockBackend`] - deterministic in-memory backend for tests

use crate::config::ScheduleConfig;
use crate::error::{BackendResult, Result, RuntimeError};
use std::fmt;

#[cfg(feature = "onnx")]
pub mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::OnnxBackend;

/// Named buffers bound to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundBuffers<H> {
    pub inputs: Vec<(String, H)>,
    pub outputs: Vec<(String, H)>,
}

impl<H> BoundBuffers<H> {
    /// Extracts the single input and single output handle.
    ///
    /// No inputs or outputs is a runtime fault of the model; more than one of
    /// either is a configuration this runtime does not handle.
    pub(crate) fn into_single(self) -> Result<(H, H)> {
        let input = single("input", self.inputs)?;
        let output = single("output", self.outputs)?;
        Ok((input, output))
    }
}

fn single<H>(role: &str, mut buffers: Vec<(String, H)>) -> Result<H> {
    match buffers.len() {
        0 => Err(RuntimeError::runtime(format!("No {} tensors found", role))),
        1 => Ok(buffers.remove(0).1),
        n => {
            let names: Vec<&str> = buffers.iter().map(|(name, _)| name.as_str()).collect();
            Err(RuntimeError::Unsupported(format!(
                "model has {} {} tensors ({}); exactly one is supported",
                n,
                role,
                names.join(", ")
            )))
        }
    }
}

/// Low-level inference backend.
///
/// Implementations are shared across threads. The runtime guarantees that a
/// given `Session` is only touched by one thread at a time, and that `run`
/// is only called while the compute gate is held; implementations do not need
/// their own locking for either.
pub trait InferenceBackend: Send + Sync + 'static {
    /// Parsed model representation.
    type Model: Send + Sync + 'static;

    /// One execution context created from a model.
    type Session: Send + 'static;

    /// Handle to a buffer bound to a session.
    type Buffer: Clone + Send + Sync + fmt::Debug + 'static;

    /// Short backend name used in logs (e.g. "onnx", "mnn").
    fn name(&self) -> &str;

    /// Backend library version.
    fn version(&self) -> String {
        "unknown".to_string()
    }

    /// Parses a model buffer.
    fn load_model(&self, bytes: &[u8]) -> BackendResult<Self::Model>;

    /// Creates an isolated session scheduled according to `schedule`.
    fn create_session(
        &self,
        model: &Self::Model,
        schedule: &ScheduleConfig,
    ) -> BackendResult<Self::Session>;

    /// Releases a session created from `model`.
    fn release_session(&self, model: &Self::Model, session: Self::Session);

    /// Buffers currently bound to the session.
    fn bound_buffers(
        &self,
        model: &Self::Model,
        session: &Self::Session,
    ) -> BoundBuffers<Self::Buffer>;

    /// Current shape of a bound buffer. Unresolved dimensions are reported as
    /// [`UNRESOLVED_DIM`](crate::shape::UNRESOLVED_DIM); any other value is a real extent.
    fn buffer_shape(&self, session: &Self::Session, buffer: &Self::Buffer)
        -> BackendResult<Vec<usize>>;

    /// Requests a new shape for an input buffer. Takes effect on `resize_session`.
    fn resize_buffer(
        &self,
        model: &Self::Model,
        session: &mut Self::Session,
        buffer: &Self::Buffer,
        shape: &[usize],
    ) -> BackendResult<()>;

    /// Re-plans the session after `resize_buffer`. May replace buffer handles.
    fn resize_session(&self, model: &Self::Model, session: &mut Self::Session)
        -> BackendResult<()>;

    /// Runs one forward pass.
    fn run(&self, model: &Self::Model, session: &mut Self::Session) -> BackendResult<()>;

    /// Copies host data into a bound buffer; `data.len()` must equal its element count.
    fn copy_host_to_buffer(
        &self,
        session: &mut Self::Session,
        buffer: &Self::Buffer,
        data: &[f32],
    ) -> BackendResult<()>;

    /// Copies a bound buffer to host memory; `out.len()` must equal its element count.
    fn copy_buffer_to_host(
        &self,
        session: &Self::Session,
        buffer: &Self::Buffer,
        out: &mut [f32],
    ) -> BackendResult<()>;
}

//! Execution contexts.
//!
//! An execution context wraps one backend session plus the handles of its
//! bound input/output buffers and a host staging buffer. It is owned by
//! exactly one place: a model (its default context), one pool slot, or an
//! [`UnmanagedContext`]. The session is released when the context drops.
//!
//! A run is split in two phases:
//! - **stage** - copy caller input into the host staging buffer (no gate)
//! - **compute** - bind the staged data, run, copy the output out (inside the gate)

use crate::backend::InferenceBackend;
use crate::config::{InferenceConfig, ScheduleConfig};
use crate::dynamic::DynamicOutput;
use crate::error::{LastError, Result, RuntimeError};
use crate::model::{CompiledModel, ModelCore};
use crate::shape::{ensure_len, TensorShape};
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub(crate) struct ExecutionContext<B: InferenceBackend> {
    core: Arc<ModelCore<B>>,
    /// `None` only while dropping.
    session: Option<B::Session>,
    input: B::Buffer,
    output: B::Buffer,
    input_shape: TensorShape,
    output_shape: TensorShape,
    staging: Vec<f32>,
    /// Set by a resize; handles stay provisional until the next run re-fetches them.
    resized: bool,
}

impl<B: InferenceBackend> ExecutionContext<B> {
    /// Creates a session and resolves its bound buffers.
    ///
    /// If buffer discovery fails the session is released before returning.
    pub(crate) fn create(core: &Arc<ModelCore<B>>, schedule: &ScheduleConfig) -> Result<Self> {
        let session = core.backend.create_session(&core.model, schedule)?;

        let (input, output, input_shape, output_shape) = match resolve_buffers(core, &session) {
            Ok(resolved) => resolved,
            Err(err) => {
                core.backend.release_session(&core.model, session);
                return Err(err);
            }
        };

        let live = core.live_contexts.fetch_add(1, Ordering::AcqRel) + 1;
        log::debug!(
            "Created {} session (input {}, output {}, {} live)",
            core.backend.name(),
            input_shape,
            output_shape,
            live
        );

        Ok(Self {
            core: Arc::clone(core),
            session: Some(session),
            input,
            output,
            input_shape,
            output_shape,
            staging: Vec::new(),
            resized: false,
        })
    }

    pub(crate) fn input_shape(&self) -> &TensorShape {
        &self.input_shape
    }

    pub(crate) fn output_shape(&self) -> &TensorShape {
        &self.output_shape
    }

    /// Copies caller input into the host staging buffer.
    pub(crate) fn stage(&mut self, input: &[f32]) {
        self.staging.clear();
        self.staging.extend_from_slice(input);
    }

    /// Binds the staged input, runs the session and copies the result into `output`.
    ///
    /// The whole sequence runs inside the compute gate. A failed run leaves the
    /// session reusable.
    pub(crate) fn compute_into(&mut self, output: &mut [f32]) -> Result<()> {
        let core = Arc::clone(&self.core);
        core.gate.enter(|| -> Result<()> {
            let session = self.session.as_mut().ok_or_else(session_released)?;
            core.backend
                .copy_host_to_buffer(session, &self.input, &self.staging)?;
            core.backend.run(&core.model, session)?;

            if self.resized {
                self.refresh_handles()?;
                ensure_output_len(&self.output_shape, output.len())?;
                self.resized = false;
            }

            let session = self.session.as_ref().ok_or_else(session_released)?;
            core.backend
                .copy_buffer_to_host(session, &self.output, output)?;
            Ok(())
        })
    }

    /// Resizes the input buffer and the session, then re-fetches both handles.
    ///
    /// Must be called with the compute gate held.
    pub(crate) fn resize_input(&mut self, shape: &TensorShape) -> Result<()> {
        let core = &self.core;
        let session = self.session.as_mut().ok_or_else(session_released)?;

        core.backend
            .resize_buffer(&core.model, session, &self.input, shape.dims())
            .map_err(|e| RuntimeError::runtime(format!("Failed to resize input to {}: {}", shape, e)))?;
        core.backend
            .resize_session(&core.model, session)
            .map_err(|e| RuntimeError::runtime(format!("Failed to resize session: {}", e)))?;

        self.resized = true;
        log::debug!("Resized {} session input to {}", core.backend.name(), shape);
        self.refresh_handles()
    }

    /// Re-fetches the bound buffer handles and their shapes from the backend.
    pub(crate) fn refresh_handles(&mut self) -> Result<()> {
        let session = self.session.as_ref().ok_or_else(session_released)?;
        let (input, output, input_shape, output_shape) = resolve_buffers(&self.core, session)?;
        self.input = input;
        self.output = output;
        self.input_shape = input_shape;
        self.output_shape = output_shape;
        Ok(())
    }

    /// Resizes to `shape`, runs once and returns a freshly allocated output.
    ///
    /// Both handles are re-fetched after the resize, and the output handle
    /// again after the run: the output's post-run shape is authoritative.
    /// Nothing is allocated unless every step succeeds.
    pub(crate) fn run_resized(&mut self, input: &[f32], shape: &TensorShape) -> Result<DynamicOutput> {
        let core = Arc::clone(&self.core);
        core.gate.enter(|| -> Result<DynamicOutput> {
            self.resize_input(shape)?;

            let session = self.session.as_mut().ok_or_else(session_released)?;
            core.backend.copy_host_to_buffer(session, &self.input, input)?;
            core.backend.run(&core.model, session)?;

            self.refresh_handles()?;
            self.resized = false;

            let output_shape = self.output_shape.clone();
            let len = match output_shape.element_count() {
                Some(len) if !output_shape.is_dynamic() => len,
                _ => {
                    return Err(RuntimeError::runtime(format!(
                        "backend left output shape {} unresolved after run",
                        output_shape
                    )))
                }
            };

            let mut data = Vec::new();
            data.try_reserve_exact(len)
                .map_err(|_| RuntimeError::OutOfMemory)?;
            data.resize(len, 0.0);

            let session = self.session.as_ref().ok_or_else(session_released)?;
            core.backend.copy_buffer_to_host(session, &self.output, &mut data)?;
            Ok(DynamicOutput::new(data, output_shape))
        })
    }
}

impl<B: InferenceBackend> Drop for ExecutionContext<B> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.core.backend.release_session(&self.core.model, session);
            let live = self.core.live_contexts.fetch_sub(1, Ordering::AcqRel) - 1;
            log::debug!("Released {} session ({} live)", self.core.backend.name(), live);
        }
    }
}

fn session_released() -> RuntimeError {
    RuntimeError::runtime("session already released")
}

fn ensure_output_len(shape: &TensorShape, len: usize) -> Result<()> {
    match shape.element_count() {
        Some(count) if count == len && !shape.is_dynamic() => Ok(()),
        _ => Err(RuntimeError::runtime(format!(
            "output shape {} does not match the {} element output buffer",
            shape, len
        ))),
    }
}

fn resolve_buffers<B: InferenceBackend>(
    core: &ModelCore<B>,
    session: &B::Session,
) -> Result<(B::Buffer, B::Buffer, TensorShape, TensorShape)> {
    let (input, output) = core.backend.bound_buffers(&core.model, session).into_single()?;
    let input_shape = TensorShape::from_backend(core.backend.buffer_shape(session, &input)?)?;
    let output_shape = TensorShape::from_backend(core.backend.buffer_shape(session, &output)?)?;
    Ok((input, output, input_shape, output_shape))
}

/// An execution context whose lifecycle the caller manages directly.
///
/// Runs use the same stage/compute/copy-out sequence as
/// [`CompiledModel::run`], serialized only by the compute gate. There is no
/// per-context lock: [`UnmanagedContext::run`] takes `&mut self`, so one
/// context is used by one caller at a time. Drop the context to destroy it.
///
/// ```rust
/// use xybrid_runtime::prelude::*;
/// use xybrid_runtime::testing::MockBackend;
///
/// let backend = MockBackend::builder().input_shape([1, 4]).output_shape([1, 2]).build();
/// let model = CompiledModel::create(backend, MockBackend::MAGIC, &InferenceConfig::default())?;
///
/// let mut context = UnmanagedContext::create(&model, &InferenceConfig::default())?;
/// let mut output = [0.0f32; 2];
/// context.run(&[1.0, 2.0, 3.0, 4.0], &mut output)?;
/// # Ok::<(), RuntimeError>(())
/// ```
pub struct UnmanagedContext<B: InferenceBackend> {
    context: ExecutionContext<B>,
    input_len: usize,
    output_len: usize,
    last_error: LastError,
}

impl<B: InferenceBackend> UnmanagedContext<B> {
    /// Creates a new session from `model`, scheduled with `config`.
    pub fn create(model: &CompiledModel<B>, config: &InferenceConfig) -> Result<Self> {
        let context = ExecutionContext::create(model.core(), &ScheduleConfig::from(config))?;
        let input_len = context.input_shape().fixed_len("input")?;
        let output_len = context.output_shape().fixed_len("output")?;
        Ok(Self {
            context,
            input_len,
            output_len,
            last_error: LastError::new(),
        })
    }

    /// Runs one fixed-shape inference. Sizes are validated before the backend is touched.
    pub fn run(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        let result = self.run_fixed(input, output);
        if let Err(err) = &result {
            log::warn!("Unmanaged context inference failed: {}", err);
        }
        self.last_error.record(result)
    }

    fn run_fixed(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        ensure_len("input", input.len(), self.input_len)?;
        ensure_len("output", output.len(), self.output_len)?;
        self.context.stage(input);
        self.context.compute_into(output)
    }

    pub fn input_shape(&self) -> &TensorShape {
        self.context.input_shape()
    }

    pub fn output_shape(&self) -> &TensorShape {
        self.context.output_shape()
    }

    /// Message of the most recent failed run on this context.
    pub fn last_error(&self) -> String {
        self.last_error.get()
    }

    /// Destroys the context, releasing its session.
    pub fn destroy(self) {}
}

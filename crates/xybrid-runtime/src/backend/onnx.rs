//! ONNX Runtime backend.
//!
//! Each session is an independent `ort` session built from the model bytes
//! with the schedule's thread count. Bound buffers are host-side `f32`
//! vectors owned by the session; a run wraps the input in an `ort` value and
//! copies the first output back.
//!
//! ONNX graph metadata does not reliably expose tensor shapes, so declared
//! shapes come from the backend configuration. An output shape left
//! undeclared stays unresolved until the first run.
//!
//! ```rust,no_run
//! use xybrid_runtime::backend::OnnxBackend;
//! use xybrid_runtime::prelude::*;
//!
//! let backend = OnnxBackend::new()
//!     .with_input_shape([1, 3, 224, 224])
//!     .with_output_shape([1, 1000]);
//! let model = CompiledModel::from_file(backend, "mobilenet.onnx", &InferenceConfig::default())?;
//! # Ok::<(), RuntimeError>(())
//! ```

use super::{BoundBuffers, InferenceBackend};
use crate::config::{BackendTarget, DataFormat, PrecisionMode, ScheduleConfig};
use crate::error::{BackendError, BackendResult};
use crate::shape::UNRESOLVED_DIM;
use ndarray::{ArrayD, IxDyn};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::{Session, SessionInputValue, SessionInputs};
use ort::value::Value;
use std::borrow::Cow;
use std::fmt;

/// Backend driving ONNX Runtime through `ort`.
#[derive(Debug, Clone, Default)]
pub struct OnnxBackend {
    input_shape: Option<Vec<usize>>,
    output_shape: Option<Vec<usize>>,
}

impl OnnxBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input_shape(mut self, shape: impl Into<Vec<usize>>) -> Self {
        self.input_shape = Some(shape.into());
        self
    }

    pub fn with_output_shape(mut self, shape: impl Into<Vec<usize>>) -> Self {
        self.output_shape = Some(shape.into());
        self
    }

    fn build_session(bytes: &[u8], threads: usize) -> Result<Session, String> {
        // Environment init is idempotent.
        let _ = ort::init().commit();

        Session::builder()
            .map_err(|e| format!("Failed to create session builder: {}", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| format!("Failed to set optimization level: {}", e))?
            .with_intra_threads(threads)
            .map_err(|e| format!("Failed to set threads: {}", e))?
            .commit_from_memory(bytes)
            .map_err(|e| format!("Failed to load ONNX model: {}", e))
    }
}

/// Model bytes plus the tensor names read at load time.
pub struct OnnxModel {
    bytes: Vec<u8>,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

pub struct OnnxSession {
    session: Session,
    generation: u64,
    input_shape: Vec<usize>,
    pending_shape: Option<Vec<usize>>,
    output_shape: Option<Vec<usize>>,
    input: Vec<f32>,
    output: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Input,
    Output,
}

/// Handle to a host-side buffer of an [`OnnxSession`], valid for one generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnnxBuffer {
    role: Role,
    generation: u64,
}

/// Schedule settings this backend has no way to apply, as `name=value` pairs.
fn ignored_settings(schedule: &ScheduleConfig) -> Vec<String> {
    let mut ignored = Vec::new();
    if schedule.precision != PrecisionMode::Normal {
        ignored.push(format!("precision={:?}", schedule.precision));
    }
    if schedule.use_cache {
        ignored.push("use_cache=true".to_string());
    }
    if schedule.data_format != DataFormat::Nchw {
        ignored.push(format!("data_format={:?}", schedule.data_format));
    }
    ignored
}

fn extract_failed(output_name: &str, err: impl fmt::Display) -> BackendError {
    BackendError::ComputeFailed(format!(
        "failed to read output '{}' as f32: {}",
        output_name, err
    ))
}

fn resolved_len(shape: &[usize]) -> usize {
    if shape.contains(&UNRESOLVED_DIM) {
        0
    } else {
        shape.iter().product()
    }
}

fn check(session: &OnnxSession, buffer: &OnnxBuffer, role: Role) -> BackendResult<()> {
    if buffer.generation != session.generation || buffer.role != role {
        return Err(BackendError::InvalidBuffer(format!(
            "{:?} buffer from generation {} used on generation {}",
            buffer.role, buffer.generation, session.generation
        )));
    }
    Ok(())
}

impl InferenceBackend for OnnxBackend {
    type Model = OnnxModel;
    type Session = OnnxSession;
    type Buffer = OnnxBuffer;

    fn name(&self) -> &str {
        "onnx"
    }

    fn load_model(&self, bytes: &[u8]) -> BackendResult<OnnxModel> {
        let session = Self::build_session(bytes, 1).map_err(BackendError::LoadFailed)?;
        let input_names = session.inputs().iter().map(|i| i.name().to_string()).collect();
        let output_names = session.outputs().iter().map(|o| o.name().to_string()).collect();
        Ok(OnnxModel {
            bytes: bytes.to_vec(),
            input_names,
            output_names,
        })
    }

    fn create_session(
        &self,
        model: &OnnxModel,
        schedule: &ScheduleConfig,
    ) -> BackendResult<OnnxSession> {
        if schedule.target != BackendTarget::Cpu {
            log::warn!(
                "ONNX backend runs on CPU; requested target {} ignored",
                schedule.target
            );
        }
        let ignored = ignored_settings(schedule);
        if !ignored.is_empty() {
            log::debug!("ONNX backend ignores schedule settings: {}", ignored.join(", "));
        }
        let session =
            Self::build_session(&model.bytes, schedule.threads).map_err(BackendError::SessionFailed)?;

        let input_shape = self.input_shape.clone().unwrap_or_else(|| vec![UNRESOLVED_DIM]);
        let output_shape = self.output_shape.clone();
        Ok(OnnxSession {
            session,
            generation: 0,
            input: vec![0.0; resolved_len(&input_shape)],
            output: vec![0.0; output_shape.as_deref().map(resolved_len).unwrap_or(0)],
            input_shape,
            pending_shape: None,
            output_shape,
        })
    }

    fn release_session(&self, _model: &OnnxModel, session: OnnxSession) {
        drop(session);
    }

    fn bound_buffers(&self, model: &OnnxModel, session: &OnnxSession) -> BoundBuffers<OnnxBuffer> {
        let bind = |names: &[String], role: Role| -> Vec<(String, OnnxBuffer)> {
            names
                .iter()
                .map(|name| {
                    (
                        name.clone(),
                        OnnxBuffer {
                            role,
                            generation: session.generation,
                        },
                    )
                })
                .collect()
        };
        BoundBuffers {
            inputs: bind(&model.input_names, Role::Input),
            outputs: bind(&model.output_names, Role::Output),
        }
    }

    fn buffer_shape(&self, session: &OnnxSession, buffer: &OnnxBuffer) -> BackendResult<Vec<usize>> {
        check(session, buffer, buffer.role)?;
        Ok(match buffer.role {
            Role::Input => session.input_shape.clone(),
            Role::Output => session.output_shape.clone().unwrap_or_else(|| vec![UNRESOLVED_DIM]),
        })
    }

    fn resize_buffer(
        &self,
        _model: &OnnxModel,
        session: &mut OnnxSession,
        buffer: &OnnxBuffer,
        shape: &[usize],
    ) -> BackendResult<()> {
        check(session, buffer, Role::Input)
            .map_err(|e| BackendError::ResizeFailed(e.to_string()))?;
        session.pending_shape = Some(shape.to_vec());
        Ok(())
    }

    fn resize_session(&self, _model: &OnnxModel, session: &mut OnnxSession) -> BackendResult<()> {
        if let Some(shape) = session.pending_shape.take() {
            session.input = vec![0.0; resolved_len(&shape)];
            session.input_shape = shape;
            // The output extent is only known after the next run.
            session.output_shape = None;
            session.output.clear();
            session.generation += 1;
        }
        Ok(())
    }

    fn run(&self, model: &OnnxModel, session: &mut OnnxSession) -> BackendResult<()> {
        let input_name = model
            .input_names
            .first()
            .ok_or_else(|| BackendError::ComputeFailed("model has no inputs".to_string()))?;
        let output_name = model
            .output_names
            .first()
            .ok_or_else(|| BackendError::ComputeFailed("model has no outputs".to_string()))?;

        let array = ArrayD::from_shape_vec(IxDyn(&session.input_shape), session.input.clone())
            .map_err(|e| BackendError::ComputeFailed(format!("Failed to shape input: {}", e)))?;
        let value: Value = Value::from_array(array)
            .map_err(|e| BackendError::ComputeFailed(format!("Failed to convert tensor: {}", e)))?
            .into();
        let inputs: Vec<(Cow<'_, str>, SessionInputValue<'_>)> =
            vec![(Cow::Borrowed(input_name.as_str()), value.into())];

        let (shape, data) = {
            let outputs = session
                .session
                .run(SessionInputs::from(inputs))
                .map_err(|e| BackendError::ComputeFailed(format!("ONNX Runtime inference failed: {}", e)))?;
            let view = outputs[output_name.as_str()]
                .try_extract_array::<f32>()
                .map_err(|e| extract_failed(output_name, e))?;
            (view.shape().to_vec(), view.iter().copied().collect::<Vec<f32>>())
        };

        if session.output_shape.as_deref() != Some(shape.as_slice()) {
            // Output extent changed; previously fetched handles are stale.
            session.output_shape = Some(shape);
            session.generation += 1;
        }
        session.output = data;
        Ok(())
    }

    fn copy_host_to_buffer(
        &self,
        session: &mut OnnxSession,
        buffer: &OnnxBuffer,
        data: &[f32],
    ) -> BackendResult<()> {
        check(session, buffer, Role::Input)?;
        if data.len() != session.input.len() {
            return Err(BackendError::InvalidBuffer(format!(
                "input holds {} elements, got {}",
                session.input.len(),
                data.len()
            )));
        }
        session.input.copy_from_slice(data);
        Ok(())
    }

    fn copy_buffer_to_host(
        &self,
        session: &OnnxSession,
        buffer: &OnnxBuffer,
        out: &mut [f32],
    ) -> BackendResult<()> {
        check(session, buffer, Role::Output)?;
        if out.len() != session.output.len() {
            return Err(BackendError::InvalidBuffer(format!(
                "output holds {} elements, got {}",
                session.output.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&session.output);
        Ok(())
    }
}

//! Compiled models.
//!
//! A [`CompiledModel`] owns a parsed model, the backend that parsed it, and a
//! default execution context. Every other context (pool slots, unmanaged
//! contexts) holds a reference-counted [`ModelCore`], so the parsed model
//! outlives all contexts created from it regardless of drop order.

use crate::backend::InferenceBackend;
use crate::config::{InferenceConfig, ScheduleConfig};
use crate::context::ExecutionContext;
use crate::error::{LastError, Result, RuntimeError};
use crate::gate::ComputeGate;
use crate::runtime::SharedRuntime;
use crate::shape::{ensure_len, TensorShape};
use ndarray::{ArrayD, ArrayViewD, IxDyn};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// State shared by a model and every context created from it.
pub(crate) struct ModelCore<B: InferenceBackend> {
    pub(crate) backend: B,
    pub(crate) model: B::Model,
    pub(crate) gate: ComputeGate,
    pub(crate) live_contexts: AtomicUsize,
}

/// A parsed model with a default execution context.
///
/// Calls to [`CompiledModel::run`] and [`CompiledModel::run_dynamic`] on the
/// same model are serialized by the model's own lock. Compute across all
/// models sharing a gate is serialized by that gate.
///
/// ```rust
/// use xybrid_runtime::prelude::*;
/// use xybrid_runtime::testing::MockBackend;
///
/// let backend = MockBackend::builder().input_shape([1, 3]).output_shape([1, 3]).scale(2.0).build();
/// let model = CompiledModel::create(backend, MockBackend::MAGIC, &InferenceConfig::default())?;
///
/// let mut output = [0.0f32; 3];
/// model.run(&[1.0, 2.0, 3.0], &mut output)?;
/// assert_eq!(output, [2.0, 4.0, 6.0]);
/// # Ok::<(), RuntimeError>(())
/// ```
pub struct CompiledModel<B: InferenceBackend> {
    core: Arc<ModelCore<B>>,
    default_context: Mutex<ExecutionContext<B>>,
    input_shape: TensorShape,
    output_shape: TensorShape,
    runtime: Option<SharedRuntime>,
    last_error: LastError,
}

impl<B: InferenceBackend> CompiledModel<B> {
    /// Loads a model and creates its default context, using the process-wide gate.
    pub fn create(backend: B, bytes: &[u8], config: &InferenceConfig) -> Result<Self> {
        Self::build(backend, bytes, ScheduleConfig::from(config), ComputeGate::global(), None)
    }

    /// Like [`CompiledModel::create`], serializing compute through `gate`.
    pub fn create_with_gate(
        backend: B,
        bytes: &[u8],
        config: &InferenceConfig,
        gate: ComputeGate,
    ) -> Result<Self> {
        Self::build(backend, bytes, ScheduleConfig::from(config), gate, None)
    }

    /// Loads a model scheduled by a shared runtime.
    ///
    /// The model keeps a clone of the runtime and uses its gate.
    pub fn create_with_shared_runtime(
        backend: B,
        bytes: &[u8],
        runtime: &SharedRuntime,
    ) -> Result<Self> {
        Self::build(
            backend,
            bytes,
            runtime.schedule().clone(),
            runtime.gate().clone(),
            Some(runtime.clone()),
        )
    }

    /// Reads a model file and loads it.
    pub fn from_file(backend: B, path: impl AsRef<Path>, config: &InferenceConfig) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            RuntimeError::ModelLoadFailed(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::create(backend, &bytes, config)
    }

    fn build(
        backend: B,
        bytes: &[u8],
        schedule: ScheduleConfig,
        gate: ComputeGate,
        runtime: Option<SharedRuntime>,
    ) -> Result<Self> {
        if bytes.is_empty() {
            return Err(RuntimeError::invalid("model buffer is empty"));
        }

        let model = backend.load_model(bytes).map_err(|e| {
            log::error!("Failed to load model with {}: {}", backend.name(), e);
            RuntimeError::ModelLoadFailed(e.to_string())
        })?;

        let core = Arc::new(ModelCore {
            backend,
            model,
            gate,
            live_contexts: AtomicUsize::new(0),
        });

        let context = ExecutionContext::create(&core, &schedule)?;
        let input_shape = context.input_shape().clone();
        let output_shape = context.output_shape().clone();

        log::info!(
            "Loaded model ({} bytes) with {} {}: input {}, output {}, {} threads",
            bytes.len(),
            core.backend.name(),
            core.backend.version(),
            input_shape,
            output_shape,
            schedule.threads
        );

        Ok(Self {
            core,
            default_context: Mutex::new(context),
            input_shape,
            output_shape,
            runtime,
            last_error: LastError::new(),
        })
    }

    /// Input shape declared by the model.
    pub fn input_shape(&self) -> &TensorShape {
        &self.input_shape
    }

    /// Output shape declared by the model.
    pub fn output_shape(&self) -> &TensorShape {
        &self.output_shape
    }

    /// Whether the declared input or output shape has unresolved dimensions.
    pub fn has_dynamic_shape(&self) -> bool {
        self.input_shape.is_dynamic() || self.output_shape.is_dynamic()
    }

    /// Runs one fixed-shape inference on the default context.
    ///
    /// `input` and `output` must hold exactly as many elements as the declared
    /// shapes. If a previous dynamic run left the default context resized, the
    /// declared input shape is restored first.
    pub fn run(&self, input: &[f32], output: &mut [f32]) -> Result<()> {
        let result = self.run_fixed(input, output);
        if let Err(err) = &result {
            log::warn!("Model inference failed: {}", err);
        }
        self.last_error.record(result)
    }

    fn run_fixed(&self, input: &[f32], output: &mut [f32]) -> Result<()> {
        ensure_len("input", input.len(), self.input_shape.fixed_len("input")?)?;
        ensure_len("output", output.len(), self.output_shape.fixed_len("output")?)?;

        let mut context = self.lock_default()?;
        if context.input_shape() != &self.input_shape {
            let declared = &self.input_shape;
            self.core.gate.enter(|| context.resize_input(declared))?;
        }
        context.stage(input);
        context.compute_into(output)
    }

    /// Runs one fixed-shape inference on an `ndarray` view.
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
        let out = output.as_slice_mut().ok_or_else(|| {
            RuntimeError::runtime("output array is not contiguous")
        })?;
        self.run(data, out)?;
        Ok(output)
    }

    /// Message of the most recent failed call on this model.
    pub fn last_error(&self) -> String {
        self.last_error.get()
    }

    pub(crate) fn record_error<T>(&self, result: Result<T>) -> Result<T> {
        self.last_error.record(result)
    }

    /// Number of sessions currently alive for this model, default context included.
    pub fn live_contexts(&self) -> usize {
        self.core.live_contexts.load(Ordering::Acquire)
    }

    pub fn backend(&self) -> &B {
        &self.core.backend
    }

    /// Gate serializing this model's compute.
    pub fn gate(&self) -> &ComputeGate {
        &self.core.gate
    }

    /// Runtime the model was created with, if any.
    pub fn shared_runtime(&self) -> Option<&SharedRuntime> {
        self.runtime.as_ref()
    }

    pub(crate) fn core(&self) -> &Arc<ModelCore<B>> {
        &self.core
    }

    pub(crate) fn lock_default(&self) -> Result<MutexGuard<'_, ExecutionContext<B>>> {
        self.default_context
            .lock()
            .map_err(|e| RuntimeError::lock_failed("default context", e))
    }
}

impl<B: InferenceBackend> Drop for CompiledModel<B> {
    fn drop(&mut self) {
        log::debug!(
            "Dropping model ({} contexts alive)",
            self.core.live_contexts.load(Ordering::Acquire)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;
    use ndarray::Array;

    fn model(backend: &MockBackend) -> CompiledModel<MockBackend> {
        CompiledModel::create_with_gate(
            backend.clone(),
            MockBackend::MAGIC,
            &InferenceConfig::default(),
            ComputeGate::new(),
        )
        .unwrap()
    }

    #[test]
    fn create_reports_declared_shapes() {
        let backend = MockBackend::builder()
            .input_shape([1, 3, 8, 8])
            .output_shape([1, 10])
            .build();
        let model = model(&backend);

        assert_eq!(model.input_shape().dims(), &[1, 3, 8, 8]);
        assert_eq!(model.output_shape().dims(), &[1, 10]);
        assert!(!model.has_dynamic_shape());
        assert_eq!(model.live_contexts(), 1);
        assert_eq!(backend.stats().sessions_live, 1);
    }

    #[test]
    fn empty_bytes_are_invalid() {
        let err = CompiledModel::create(MockBackend::default(), &[], &InferenceConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::InvalidParameter(_)));
    }

    #[test]
    fn unparseable_bytes_fail_to_load() {
        let err = CompiledModel::create(
            MockBackend::default(),
            b"not a model",
            &InferenceConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, RuntimeError::ModelLoadFailed(_)));
    }

    #[test]
    fn run_applies_the_kernel() {
        let backend = MockBackend::builder()
            .input_shape([1, 4])
            .output_shape([1, 4])
            .scale(3.0)
            .bias(1.0)
            .build();
        let model = model(&backend);

        let mut output = [0.0f32; 4];
        model.run(&[1.0, 2.0, 3.0, 4.0], &mut output).unwrap();
        assert_eq!(output, [4.0, 7.0, 10.0, 13.0]);
        assert_eq!(model.gate().entries(), 1);
    }

    #[test]
    fn size_mismatch_is_rejected_before_the_backend() {
        let backend = MockBackend::builder().input_shape([1, 4]).output_shape([1, 2]).build();
        let model = model(&backend);

        let mut output = [0.0f32; 2];
        let err = model.run(&[1.0, 2.0, 3.0], &mut output).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidParameter(_)));
        assert!(model.last_error().contains("input size mismatch"));
        assert_eq!(backend.stats().runs, 0);
    }

    #[test]
    fn run_array_checks_the_shape() {
        let backend = MockBackend::builder().input_shape([2, 2]).output_shape([2, 2]).build();
        let model = model(&backend);

        let input = Array::from_shape_vec(IxDyn(&[2, 2]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let output = model.run_array(input.view()).unwrap();
        assert_eq!(output.shape(), &[2, 2]);
        assert_eq!(output.as_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0]);

        let wrong = Array::<f32, _>::zeros(IxDyn(&[4]));
        assert!(matches!(
            model.run_array(wrong.view()),
            Err(RuntimeError::InvalidParameter(_))
        ));
    }

    #[test]
    fn run_array_accepts_transposed_views() {
        let backend = MockBackend::builder().input_shape([2, 3]).output_shape([2, 3]).build();
        let model = model(&backend);

        let source = Array::from_shape_vec(IxDyn(&[3, 2]), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0])
            .unwrap();
        let output = model.run_array(source.t()).unwrap();
        assert_eq!(output.as_slice().unwrap(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn shared_runtime_provides_the_gate() {
        let gate = ComputeGate::new();
        let runtime = SharedRuntime::with_gate(&InferenceConfig::default(), gate.clone());
        let model =
            CompiledModel::create_with_shared_runtime(MockBackend::default(), MockBackend::MAGIC, &runtime)
                .unwrap();

        assert!(model.gate().same_gate(&gate));
        assert!(model.shared_runtime().unwrap().ptr_eq(&runtime));
    }

    #[test]
    fn from_file_reads_the_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        std::fs::write(&path, MockBackend::MAGIC).unwrap();

        let model =
            CompiledModel::from_file(MockBackend::default(), &path, &InferenceConfig::default())
                .unwrap();
        assert_eq!(model.live_contexts(), 1);

        let missing = CompiledModel::from_file(
            MockBackend::default(),
            dir.path().join("missing.bin"),
            &InferenceConfig::default(),
        );
        assert!(matches!(missing, Err(RuntimeError::ModelLoadFailed(_))));
    }
}

//! Dynamic-shape inference.
//!
//! [`CompiledModel::run_dynamic`] resizes the default context's input to a
//! caller-chosen shape, runs once, and returns an output sized by whatever
//! shape the backend reports after the run.

use crate::backend::InferenceBackend;
use crate::error::{Result, RuntimeError};
use crate::model::CompiledModel;
use crate::shape::{ensure_len, TensorShape};
use ndarray::{ArrayD, ArrayViewD, IxDyn};

/// Output of a dynamic-shape run. The caller owns both the data and the shape.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicOutput {
    data: Vec<f32>,
    shape: TensorShape,
}

impl DynamicOutput {
    pub(crate) fn new(data: Vec<f32>, shape: TensorShape) -> Self {
        Self { data, shape }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn shape(&self) -> &TensorShape {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_parts(self) -> (Vec<f32>, TensorShape) {
        (self.data, self.shape)
    }

    pub fn into_array(self) -> Result<ArrayD<f32>> {
        ArrayD::from_shape_vec(IxDyn(self.shape.dims()), self.data)
            .map_err(|e| RuntimeError::runtime(format!("output does not match its shape: {}", e)))
    }

    /// Frees the output. Equivalent to dropping it.
    pub fn release(self) {}
}

impl<B: InferenceBackend> CompiledModel<B> {
    /// Runs the default context with `input` interpreted as `input_shape`.
    ///
    /// `input.len()` must equal the product of `input_shape`. Both are checked
    /// before the backend is touched. The default context stays resized
    /// afterwards; the next fixed-shape [`CompiledModel::run`] restores the
    /// declared shape.
    ///
    /// ```rust
    /// use xybrid_runtime::prelude::*;
    /// use xybrid_runtime::testing::MockBackend;
    ///
    /// let backend = MockBackend::builder()
    ///     .input_shape([1, 3, 4, 4])
    ///     .output_rule(|input| vec![input[0], 2])
    ///     .build();
    /// let model = CompiledModel::create(backend, MockBackend::MAGIC, &InferenceConfig::default())?;
    ///
    /// let output = model.run_dynamic(&vec![0.5; 2 * 3 * 2 * 2], &[2, 3, 2, 2])?;
    /// assert_eq!(output.shape().dims(), &[2, 2]);
    /// assert_eq!(output.len(), 4);
    /// # Ok::<(), RuntimeError>(())
    /// ```
    pub fn run_dynamic(&self, input: &[f32], input_shape: &[usize]) -> Result<DynamicOutput> {
        let result = self.run_resized(input, input_shape);
        if let Err(err) = &result {
            log::warn!("Dynamic inference with shape {:?} failed: {}", input_shape, err);
        }
        self.record_error(result)
    }

    fn run_resized(&self, input: &[f32], input_shape: &[usize]) -> Result<DynamicOutput> {
        if input.is_empty() {
            return Err(RuntimeError::invalid("input is empty"));
        }
        if input_shape.is_empty() {
            return Err(RuntimeError::invalid("input shape is empty"));
        }
        let shape = TensorShape::new(input_shape)?;
        let expected = shape.element_count().ok_or_else(|| {
            RuntimeError::invalid(format!("input shape {} overflows usize", shape))
        })?;
        ensure_len("input", input.len(), expected)?;

        let mut context = self.lock_default()?;
        let output = context.run_resized(input, &shape)?;
        log::debug!("Dynamic run: input {} -> output {}", shape, output.shape());
        Ok(output)
    }

    /// Runs [`CompiledModel::run_dynamic`] using the view's own shape.
    pub fn run_dynamic_array(&self, input: ArrayViewD<'_, f32>) -> Result<ArrayD<f32>> {
        let shape = input.shape().to_vec();
        let input = input.as_standard_layout();
        let data = input
            .as_slice()
            .ok_or_else(|| RuntimeError::runtime("input array is not contiguous after conversion"))?;
        self.run_dynamic(data, &shape)?.into_array()
    }
}

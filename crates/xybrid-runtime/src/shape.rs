//! Tensor shapes.

use crate::error::{Result, RuntimeError};
use serde::Serialize;
use std::fmt;

/// Highest tensor rank the runtime accepts.
pub const MAX_RANK: usize = 8;

/// Marker for a dimension the backend has not resolved yet.
///
/// Backends translate their own unknown-dimension encoding (`-1`, symbolic
/// names) to this value in [`buffer_shape`](crate::backend::InferenceBackend::buffer_shape).
/// Every other value, however large, is a real extent.
pub const UNRESOLVED_DIM: usize = usize::MAX;

/// Ordered list of tensor dimensions, rank 1 to [`MAX_RANK`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TensorShape {
    dims: Vec<usize>,
}

impl TensorShape {
    /// Build a shape from caller-provided dimensions.
    ///
    /// Fails with `Unsupported` above rank 8 and `InvalidParameter` for rank 0 or a zero dimension.
    pub fn new(dims: impl Into<Vec<usize>>) -> Result<Self> {
        let dims = dims.into();
        if dims.is_empty() {
            return Err(RuntimeError::invalid("shape has no dimensions"));
        }
        if dims.len() > MAX_RANK {
            return Err(RuntimeError::Unsupported(format!(
                "rank {} exceeds the maximum of {}",
                dims.len(),
                MAX_RANK
            )));
        }
        if let Some(axis) = dims.iter().position(|&d| d == 0) {
            return Err(RuntimeError::invalid(format!(
                "dimension {} of {:?} is zero",
                axis, dims
            )));
        }
        Ok(Self { dims })
    }

    /// Build a shape reported by the backend. A zero dimension there is a backend fault.
    pub(crate) fn from_backend(dims: Vec<usize>) -> Result<Self> {
        Self::new(dims).map_err(|e| match e {
            RuntimeError::InvalidParameter(msg) => {
                RuntimeError::runtime(format!("backend reported an invalid shape: {}", msg))
            }
            other => other,
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Product of all dimensions, `None` on overflow.
    pub fn element_count(&self) -> Option<usize> {
        self.dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Whether any dimension is left unresolved by the backend.
    pub fn is_dynamic(&self) -> bool {
        self.dims.contains(&UNRESOLVED_DIM)
    }

    /// Element count of a shape used on a fixed-shape path.
    pub(crate) fn fixed_len(&self, what: &str) -> Result<usize> {
        if self.is_dynamic() {
            return Err(RuntimeError::Unsupported(format!(
                "{} shape {} is dynamic; use run_dynamic",
                what, self
            )));
        }
        self.element_count().ok_or_else(|| {
            RuntimeError::Unsupported(format!("{} shape {} overflows usize", what, self))
        })
    }
}

impl AsRef<[usize]> for TensorShape {
    fn as_ref(&self) -> &[usize] {
        &self.dims
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

/// Fails with `InvalidParameter` when a caller buffer has the wrong length.
pub(crate) fn ensure_len(what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(RuntimeError::invalid(format!(
            "{} size mismatch: expected {} elements, got {}",
            what, expected, got
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn element_count_is_the_product() {
        let shape = TensorShape::new(vec![1, 3, 224, 224]).unwrap();
        assert_eq!(shape.element_count(), Some(150_528));
        assert_eq!(shape.rank(), 4);
        assert_eq!(shape.to_string(), "[1, 3, 224, 224]");
        assert!(!shape.is_dynamic());
    }

    #[test]
    fn rank_above_eight_is_unsupported() {
        let err = TensorShape::new(vec![1; 9]).unwrap_err();
        assert!(matches!(err, RuntimeError::Unsupported(_)));
        assert!(TensorShape::new(vec![1; 8]).is_ok());
    }

    #[test]
    fn zero_dimension_is_invalid() {
        let err = TensorShape::new(vec![1, 0, 4]).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidParameter(_)));

        let err = TensorShape::from_backend(vec![1, 0, 4]).unwrap_err();
        assert!(matches!(err, RuntimeError::Runtime(_)));

        let err = TensorShape::new(Vec::new()).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidParameter(_)));
    }

    #[test]
    fn dynamic_dimensions_are_detected() {
        let shape = TensorShape::from_backend(vec![1, 3, UNRESOLVED_DIM, UNRESOLVED_DIM]).unwrap();
        assert!(shape.is_dynamic());
        assert_eq!(shape.element_count(), None);
        assert!(matches!(
            shape.fixed_len("input"),
            Err(RuntimeError::Unsupported(_))
        ));
    }

    #[test]
    fn large_extents_are_not_dynamic() {
        let features = TensorShape::new(vec![1, 150_528]).unwrap();
        assert!(!features.is_dynamic());
        assert_eq!(features.fixed_len("output").unwrap(), 150_528);

        let logits = TensorShape::new(vec![1, 250_002]).unwrap();
        assert!(!logits.is_dynamic());
        assert_eq!(logits.fixed_len("output").unwrap(), 250_002);
    }

    #[test]
    fn ensure_len_reports_both_sizes() {
        assert!(ensure_len("input", 12, 12).is_ok());
        let err = ensure_len("output", 10, 12).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid parameter: output size mismatch: expected 12 elements, got 10"
        );
    }
}

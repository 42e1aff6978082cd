//! Common imports for working with compiled models and session pools.

pub use crate::backend::InferenceBackend;
pub use crate::config::{InferenceConfig, PrecisionMode};
pub use crate::context::UnmanagedContext;
pub use crate::dynamic::DynamicOutput;
pub use crate::error::{ErrorCode, Result, RuntimeError};
pub use crate::gate::ComputeGate;
pub use crate::model::CompiledModel;
pub use crate::pool::SessionPool;
pub use crate::runtime::SharedRuntime;
pub use crate::shape::TensorShape;

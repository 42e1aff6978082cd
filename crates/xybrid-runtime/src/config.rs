//! Inference configuration.
//!
//! [`InferenceConfig`] is the caller-facing configuration. It is resolved into an
//! immutable [`ScheduleConfig`] before it reaches the backend's session creation.
//!
//! # Example
//!
//! ```rust
//! use xybrid_runtime::config::{InferenceConfig, PrecisionMode};
//!
//! let config = InferenceConfig::new()
//!     .with_threads(2)
//!     .with_precision(PrecisionMode::Low);
//!
//! let from_json = InferenceConfig::from_json(r#"{"thread_count": 2, "precision_mode": "low"}"#)?;
//! assert_eq!(config, from_json);
//! # Ok::<(), xybrid_runtime::RuntimeError>(())
//! ```

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Worker thread count used when the configuration asks for "auto" (0).
pub const DEFAULT_THREAD_COUNT: usize = 4;

/// Numerical precision tier requested from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecisionMode {
    #[default]
    Normal,
    /// Faster, less accurate
    Low,
    /// Slower, more accurate
    High,
}

/// Memory layout of input/output tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    /// [batch, channels, height, width] (Caffe/PyTorch/ONNX)
    #[default]
    Nchw,
    /// [batch, height, width, channels] (TensorFlow)
    Nhwc,
    /// Taken from the model
    Auto,
}

/// Device target the backend should schedule sessions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendTarget {
    #[default]
    Cpu,
    Metal,
    OpenCl,
    OpenGl,
    Vulkan,
    Cuda,
    CoreMl,
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cpu => "cpu",
            Self::Metal => "metal",
            Self::OpenCl => "opencl",
            Self::OpenGl => "opengl",
            Self::Vulkan => "vulkan",
            Self::Cuda => "cuda",
            Self::CoreMl => "coreml",
        };
        f.write_str(name)
    }
}

/// Caller-facing inference configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Worker threads per session (0 = auto).
    pub thread_count: usize,
    pub precision_mode: PrecisionMode,
    /// Persist compiled artifacts between runs.
    pub use_cache: bool,
    pub data_format: DataFormat,
    pub backend: BackendTarget,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            thread_count: DEFAULT_THREAD_COUNT,
            precision_mode: PrecisionMode::Normal,
            use_cache: false,
            data_format: DataFormat::Nchw,
            backend: BackendTarget::Cpu,
        }
    }
}

impl InferenceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker thread count (0 = auto).
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.thread_count = threads;
        self
    }

    pub fn with_precision(mut self, precision: PrecisionMode) -> Self {
        self.precision_mode = precision;
        self
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_data_format(mut self, format: DataFormat) -> Self {
        self.data_format = format;
        self
    }

    pub fn with_backend(mut self, backend: BackendTarget) -> Self {
        self.backend = backend;
        self
    }

    /// Parse a configuration from JSON. Missing keys take their default value.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| RuntimeError::Config(format!("Invalid inference config: {}", e)))
    }

    /// Load a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents).map_err(|e| match e {
            RuntimeError::Config(msg) => RuntimeError::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Resolve this configuration into the schedule handed to the backend.
    pub fn schedule(&self) -> ScheduleConfig {
        ScheduleConfig::from(self)
    }
}

/// Resolved, immutable session schedule passed to `InferenceBackend::create_session`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ScheduleConfig {
    /// Worker threads, always >= 1.
    pub threads: usize,
    pub precision: PrecisionMode,
    pub target: BackendTarget,
    pub use_cache: bool,
    pub data_format: DataFormat,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self::from(&InferenceConfig::default())
    }
}

impl From<&InferenceConfig> for ScheduleConfig {
    fn from(config: &InferenceConfig) -> Self {
        let threads = match config.thread_count {
            0 => DEFAULT_THREAD_COUNT,
            n => n,
        };
        Self {
            threads,
            precision: config.precision_mode,
            target: config.backend,
            use_cache: config.use_cache,
            data_format: config.data_format,
        }
    }
}

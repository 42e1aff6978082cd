//! Shared runtime - one schedule shared by several compiled models.

use crate::config::{InferenceConfig, ScheduleConfig};
use crate::gate::ComputeGate;
use std::sync::Arc;

/// Immutable configuration bundle shared by reference across compiled models.
///
/// Models created with [`CompiledModel::create_with_shared_runtime`] schedule
/// their default context with this runtime's [`ScheduleConfig`] and serialize
/// compute through its gate. Cloning is cheap and yields the same runtime.
///
/// [`CompiledModel::create_with_shared_runtime`]: crate::model::CompiledModel::create_with_shared_runtime
#[derive(Debug, Clone)]
pub struct SharedRuntime {
    inner: Arc<RuntimeInner>,
}

#[derive(Debug)]
struct RuntimeInner {
    schedule: ScheduleConfig,
    gate: ComputeGate,
}

impl SharedRuntime {
    /// Creates a runtime using the process-wide compute gate.
    pub fn new(config: &InferenceConfig) -> Self {
        Self::with_gate(config, ComputeGate::global())
    }

    pub fn with_gate(config: &InferenceConfig, gate: ComputeGate) -> Self {
        let schedule = ScheduleConfig::from(config);
        log::debug!(
            "Created shared runtime: {} threads, {:?} precision, {} target",
            schedule.threads,
            schedule.precision,
            schedule.target
        );
        Self {
            inner: Arc::new(RuntimeInner { schedule, gate }),
        }
    }

    pub fn schedule(&self) -> &ScheduleConfig {
        &self.inner.schedule
    }

    pub fn gate(&self) -> &ComputeGate {
        &self.inner.gate
    }

    /// Whether both handles refer to the same runtime.
    pub fn ptr_eq(&self, other: &SharedRuntime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

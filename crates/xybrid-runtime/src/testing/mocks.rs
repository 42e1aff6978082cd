//! Mock implementations for testing.

use crate::backend::{BoundBuffers, InferenceBackend};
use crate::config::ScheduleConfig;
use crate::error::{BackendError, BackendResult};
use crate::gate::GateObserver;
use crate::shape::UNRESOLVED_DIM;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

type OutputRule = Arc<dyn Fn(&[usize]) -> Vec<usize> + Send + Sync>;

/// Deterministic in-memory backend.
///
/// Every output element is `scale * input[j % input_len] + bias`. Buffer
/// handles carry the generation of the session they were fetched from; a
/// resize bumps the generation, so a handle cached across a resize is
/// rejected with [`BackendError::InvalidBuffer`].
///
/// Clones share counters and failure knobs.
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<MockState>,
}

struct MockState {
    input_shape: Vec<usize>,
    output_rule: OutputRule,
    defer_output_shape: bool,
    scale: f32,
    bias: f32,
    latency: Option<Duration>,
    input_count: usize,
    output_count: usize,

    loads: AtomicU64,
    session_attempts: AtomicUsize,
    sessions_created: AtomicUsize,
    sessions_released: AtomicUsize,
    sessions_live: AtomicUsize,
    next_session_id: AtomicU64,
    runs: AtomicU64,
    resizes: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    stale_rejections: AtomicU64,

    fail_session_at: AtomicUsize,
    fail_runs: AtomicUsize,
    last_schedule: Mutex<Option<ScheduleConfig>>,
}

/// Counters observed on a [`MockBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MockStats {
    pub loads: u64,
    pub sessions_created: usize,
    pub sessions_released: usize,
    pub sessions_live: usize,
    pub runs: u64,
    pub resizes: u64,
    /// Highest number of `run` calls observed executing at once.
    pub max_in_flight: usize,
    /// Calls rejected because they used a handle from before a resize.
    pub stale_rejections: u64,
}

/// Builder for [`MockBackend`].
pub struct MockBackendBuilder {
    input_shape: Vec<usize>,
    output_rule: Option<OutputRule>,
    defer_output_shape: bool,
    scale: f32,
    bias: f32,
    latency: Option<Duration>,
    input_count: usize,
    output_count: usize,
}

impl Default for MockBackendBuilder {
    fn default() -> Self {
        Self {
            input_shape: vec![1, 4],
            output_rule: None,
            defer_output_shape: false,
            scale: 1.0,
            bias: 0.0,
            latency: None,
            input_count: 1,
            output_count: 1,
        }
    }
}

impl MockBackendBuilder {
    pub fn input_shape(mut self, shape: impl Into<Vec<usize>>) -> Self {
        self.input_shape = shape.into();
        self
    }

    /// Fixed output shape, independent of the input shape.
    pub fn output_shape(mut self, shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        self.output_rule = Some(Arc::new(move |_: &[usize]| shape.clone()));
        self
    }

    /// Output shape derived from the current input shape.
    pub fn output_rule(
        mut self,
        rule: impl Fn(&[usize]) -> Vec<usize> + Send + Sync + 'static,
    ) -> Self {
        self.output_rule = Some(Arc::new(rule));
        self
    }

    /// After a resize, report the output shape as unresolved until the next run,
    /// and replace the buffer handles when that run resolves it.
    pub fn defer_output_shape(mut self) -> Self {
        self.defer_output_shape = true;
        self
    }

    pub fn scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn bias(mut self, bias: f32) -> Self {
        self.bias = bias;
        self
    }

    /// Time each `run` spends inside the backend.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn input_count(mut self, count: usize) -> Self {
        self.input_count = count;
        self
    }

    pub fn output_count(mut self, count: usize) -> Self {
        self.output_count = count;
        self
    }

    pub fn build(self) -> MockBackend {
        let input_shape = self.input_shape;
        let output_rule = self.output_rule.unwrap_or_else(|| {
            let shape = input_shape.clone();
            let rule: OutputRule = Arc::new(move |_: &[usize]| shape.clone());
            rule
        });
        MockBackend {
            state: Arc::new(MockState {
                input_shape,
                output_rule,
                defer_output_shape: self.defer_output_shape,
                scale: self.scale,
                bias: self.bias,
                latency: self.latency,
                input_count: self.input_count,
                output_count: self.output_count,
                loads: AtomicU64::new(0),
                session_attempts: AtomicUsize::new(0),
                sessions_created: AtomicUsize::new(0),
                sessions_released: AtomicUsize::new(0),
                sessions_live: AtomicUsize::new(0),
                next_session_id: AtomicU64::new(1),
                runs: AtomicU64::new(0),
                resizes: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                stale_rejections: AtomicU64::new(0),
                fail_session_at: AtomicUsize::new(0),
                fail_runs: AtomicUsize::new(0),
                last_schedule: Mutex::new(None),
            }),
        }
    }
}

impl MockBackend {
    /// Bytes a mock model buffer must start with.
    pub const MAGIC: &'static [u8] = b"XYMOCK01";

    pub fn builder() -> MockBackendBuilder {
        MockBackendBuilder::default()
    }

    pub fn stats(&self) -> MockStats {
        let s = &self.state;
        MockStats {
            loads: s.loads.load(Ordering::SeqCst),
            sessions_created: s.sessions_created.load(Ordering::SeqCst),
            sessions_released: s.sessions_released.load(Ordering::SeqCst),
            sessions_live: s.sessions_live.load(Ordering::SeqCst),
            runs: s.runs.load(Ordering::SeqCst),
            resizes: s.resizes.load(Ordering::SeqCst),
            max_in_flight: s.max_in_flight.load(Ordering::SeqCst),
            stale_rejections: s.stale_rejections.load(Ordering::SeqCst),
        }
    }

    /// The `n`-th session creation from now on fails (1-based).
    pub fn fail_session_at(&self, n: usize) {
        let attempts = self.state.session_attempts.load(Ordering::SeqCst);
        self.state.fail_session_at.store(attempts + n, Ordering::SeqCst);
    }

    pub fn fail_next_run(&self) {
        self.fail_runs(1);
    }

    /// The next `n` runs fail with `ComputeFailed`.
    pub fn fail_runs(&self, n: usize) {
        self.state.fail_runs.store(n, Ordering::SeqCst);
    }

    /// Schedule passed to the most recent session creation.
    pub fn last_schedule(&self) -> Option<ScheduleConfig> {
        self.state
            .last_schedule
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check(&self, session: &MockSession, buffer: &MockBuffer) -> BackendResult<()> {
        if buffer.session != session.id || buffer.generation != session.generation {
            self.state.stale_rejections.fetch_add(1, Ordering::SeqCst);
            return Err(BackendError::InvalidBuffer(format!(
                "{:?} is not bound to session {} generation {}",
                buffer, session.id, session.generation
            )));
        }
        Ok(())
    }

    fn take_run_failure(&self) -> bool {
        self.state
            .fail_runs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockBackend")
            .field("input_shape", &self.state.input_shape)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Parsed mock model.
#[derive(Debug)]
pub struct MockModel {
    size: usize,
}

impl MockModel {
    pub fn size(&self) -> usize {
        self.size
    }
}

#[derive(Debug)]
pub struct MockSession {
    id: u64,
    generation: u64,
    input_shape: Vec<usize>,
    pending_shape: Option<Vec<usize>>,
    output_shape: Vec<usize>,
    output_resolved: bool,
    input: Vec<f32>,
    output: Vec<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockRole {
    Input,
    Output,
}

/// Handle to a mock buffer, valid for one session generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockBuffer {
    session: u64,
    generation: u64,
    role: MockRole,
}

fn product(shape: &[usize]) -> usize {
    shape.iter().product()
}

impl InferenceBackend for MockBackend {
    type Model = MockModel;
    type Session = MockSession;
    type Buffer = MockBuffer;

    fn name(&self) -> &str {
        "mock"
    }

    fn version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn load_model(&self, bytes: &[u8]) -> BackendResult<MockModel> {
        if !bytes.starts_with(Self::MAGIC) {
            return Err(BackendError::LoadFailed("missing mock model magic".to_string()));
        }
        self.state.loads.fetch_add(1, Ordering::SeqCst);
        Ok(MockModel { size: bytes.len() })
    }

    fn create_session(
        &self,
        _model: &MockModel,
        schedule: &ScheduleConfig,
    ) -> BackendResult<MockSession> {
        let s = &self.state;
        let attempt = s.session_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if s.fail_session_at.load(Ordering::SeqCst) == attempt {
            return Err(BackendError::SessionFailed(format!(
                "injected failure on session {}",
                attempt
            )));
        }
        *s.last_schedule.lock().unwrap_or_else(PoisonError::into_inner) = Some(schedule.clone());

        let input_shape = s.input_shape.clone();
        let output_shape = (s.output_rule)(&input_shape);
        s.sessions_created.fetch_add(1, Ordering::SeqCst);
        s.sessions_live.fetch_add(1, Ordering::SeqCst);
        Ok(MockSession {
            id: s.next_session_id.fetch_add(1, Ordering::SeqCst),
            generation: 0,
            input: vec![0.0; product(&input_shape)],
            output: vec![0.0; product(&output_shape)],
            input_shape,
            pending_shape: None,
            output_shape,
            output_resolved: true,
        })
    }

    fn release_session(&self, _model: &MockModel, _session: MockSession) {
        self.state.sessions_live.fetch_sub(1, Ordering::SeqCst);
        self.state.sessions_released.fetch_add(1, Ordering::SeqCst);
    }

    fn bound_buffers(&self, _model: &MockModel, session: &MockSession) -> BoundBuffers<MockBuffer> {
        let handle = |role: MockRole| MockBuffer {
            session: session.id,
            generation: session.generation,
            role,
        };
        let named = |prefix: &str, count: usize, role: MockRole| -> Vec<(String, MockBuffer)> {
            (0..count)
                .map(|i| {
                    let name = if count == 1 {
                        prefix.to_string()
                    } else {
                        format!("{}_{}", prefix, i)
                    };
                    (name, handle(role))
                })
                .collect()
        };
        BoundBuffers {
            inputs: named("input", self.state.input_count, MockRole::Input),
            outputs: named("output", self.state.output_count, MockRole::Output),
        }
    }

    fn buffer_shape(&self, session: &MockSession, buffer: &MockBuffer) -> BackendResult<Vec<usize>> {
        self.check(session, buffer)?;
        Ok(match buffer.role {
            MockRole::Input => session.input_shape.clone(),
            MockRole::Output if session.output_resolved => session.output_shape.clone(),
            MockRole::Output => vec![UNRESOLVED_DIM; session.output_shape.len()],
        })
    }

    fn resize_buffer(
        &self,
        _model: &MockModel,
        session: &mut MockSession,
        buffer: &MockBuffer,
        shape: &[usize],
    ) -> BackendResult<()> {
        self.check(session, buffer)?;
        if buffer.role != MockRole::Input {
            return Err(BackendError::ResizeFailed("only inputs can be resized".to_string()));
        }
        self.state.resizes.fetch_add(1, Ordering::SeqCst);
        session.pending_shape = Some(shape.to_vec());
        Ok(())
    }

    fn resize_session(&self, _model: &MockModel, session: &mut MockSession) -> BackendResult<()> {
        let Some(shape) = session.pending_shape.take() else {
            return Ok(());
        };
        session.output_shape = (self.state.output_rule)(&shape);
        session.input = vec![0.0; product(&shape)];
        session.output = vec![0.0; product(&session.output_shape)];
        session.input_shape = shape;
        session.output_resolved = !self.state.defer_output_shape;
        session.generation += 1;
        Ok(())
    }

    fn run(&self, _model: &MockModel, session: &mut MockSession) -> BackendResult<()> {
        let s = &self.state;
        let in_flight = s.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        s.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if let Some(latency) = s.latency {
            thread::sleep(latency);
        }

        let result = if self.take_run_failure() {
            Err(BackendError::ComputeFailed("injected run failure".to_string()))
        } else {
            let len = session.input.len().max(1);
            for (j, out) in session.output.iter_mut().enumerate() {
                let x = session.input.get(j % len).copied().unwrap_or(0.0);
                *out = s.scale * x + s.bias;
            }
            if !session.output_resolved {
                session.output_resolved = true;
                session.generation += 1;
            }
            Ok(())
        };

        s.runs.fetch_add(1, Ordering::SeqCst);
        s.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn copy_host_to_buffer(
        &self,
        session: &mut MockSession,
        buffer: &MockBuffer,
        data: &[f32],
    ) -> BackendResult<()> {
        self.check(session, buffer)?;
        if buffer.role != MockRole::Input || data.len() != session.input.len() {
            return Err(BackendError::InvalidBuffer(format!(
                "cannot copy {} elements into {:?} of {} elements",
                data.len(),
                buffer.role,
                session.input.len()
            )));
        }
        session.input.copy_from_slice(data);
        Ok(())
    }

    fn copy_buffer_to_host(
        &self,
        session: &MockSession,
        buffer: &MockBuffer,
        out: &mut [f32],
    ) -> BackendResult<()> {
        self.check(session, buffer)?;
        if buffer.role != MockRole::Output
            || !session.output_resolved
            || out.len() != session.output.len()
        {
            return Err(BackendError::InvalidBuffer(format!(
                "cannot copy {:?} of {} elements into {} elements",
                buffer.role,
                session.output.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&session.output);
        Ok(())
    }
}

/// Gate observer tracking how many holders are inside a gate at once.
#[derive(Debug, Default)]
pub struct CountingObserver {
    current: AtomicUsize,
    max: AtomicUsize,
    entries: AtomicU64,
}

impl CountingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }

    pub fn entries(&self) -> u64 {
        self.entries.load(Ordering::SeqCst)
    }
}

impl GateObserver for CountingObserver {
    fn on_enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn on_exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.entries.fetch_add(1, Ordering::SeqCst);
    }
}

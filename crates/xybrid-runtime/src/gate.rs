//! Compute gate - process-wide serialization of backend compute calls.
//!
//! Backends with a small internal worker pool (a fixed number of task slots)
//! corrupt or deadlock their scheduler when several application threads call
//! into compute at once. Every backend `run` issued by this crate therefore
//! happens inside [`ComputeGate::enter`], and only one closure holds a given
//! gate at a time.
//!
//! The gate is an explicit capability rather than ambient state: models,
//! pools and contexts hold a clone of the gate they were created with.
//! [`ComputeGate::global`] is the default; tests build isolated gates with an
//! attached [`GateObserver`].
//!
//! ```rust
//! use xybrid_runtime::gate::ComputeGate;
//!
//! let gate = ComputeGate::new();
//! let answer = gate.enter(|| 6 * 7);
//! assert_eq!(answer, 42);
//! assert_eq!(gate.entries(), 1);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

static GLOBAL_GATE: OnceLock<ComputeGate> = OnceLock::new();

/// Hook invoked while a gate is held.
///
/// `on_enter` runs right after the gate is acquired, `on_exit` right before it
/// is released (also when the closure panics).
pub trait GateObserver: Send + Sync {
    fn on_enter(&self);
    fn on_exit(&self);
}

/// Clonable handle to a compute serialization gate.
#[derive(Clone)]
pub struct ComputeGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    // The mutex guards no data: holding it is the capability.
    lock: Mutex<()>,
    entries: AtomicU64,
    observer: Option<Arc<dyn GateObserver>>,
}

impl ComputeGate {
    /// The process-wide gate shared by every model that does not inject its own.
    pub fn global() -> Self {
        GLOBAL_GATE.get_or_init(ComputeGate::new).clone()
    }

    /// Creates an isolated gate.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates an isolated gate reporting occupancy to `observer`.
    pub fn with_observer(observer: Arc<dyn GateObserver>) -> Self {
        Self::build(Some(observer))
    }

    fn build(observer: Option<Arc<dyn GateObserver>>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                lock: Mutex::new(()),
                entries: AtomicU64::new(0),
                observer,
            }),
        }
    }

    /// Runs `f` while holding the gate.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        // A panic inside a previous holder cannot leave `()` inconsistent.
        let _held = self.inner.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _occupancy = Occupancy::begin(self.inner.observer.as_deref());
        let out = f();
        self.inner.entries.fetch_add(1, Ordering::Relaxed);
        out
    }

    /// Number of completed gate entries.
    pub fn entries(&self) -> u64 {
        self.inner.entries.load(Ordering::Relaxed)
    }

    /// Whether both handles refer to the same gate.
    pub fn same_gate(&self, other: &ComputeGate) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for ComputeGate {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ComputeGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeGate")
            .field("entries", &self.entries())
            .field("observed", &self.inner.observer.is_some())
            .finish()
    }
}

/// Notifies the observer on drop, before the gate's lock guard is released.
struct Occupancy<'a>(Option<&'a dyn GateObserver>);

impl<'a> Occupancy<'a> {
    fn begin(observer: Option<&'a dyn GateObserver>) -> Self {
        if let Some(observer) = observer {
            observer.on_enter();
        }
        Self(observer)
    }
}

impl Drop for Occupancy<'_> {
    fn drop(&mut self) {
        if let Some(observer) = self.0 {
            observer.on_exit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingObserver;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn global_gate_is_shared() {
        let a = ComputeGate::global();
        let b = ComputeGate::global();
        assert!(a.same_gate(&b));
        assert!(!a.same_gate(&ComputeGate::new()));
    }

    #[test]
    fn enter_counts_entries() {
        let gate = ComputeGate::new();
        for i in 0..5 {
            assert_eq!(gate.enter(|| i * 2), i * 2);
        }
        assert_eq!(gate.entries(), 5);
    }

    #[test]
    fn only_one_holder_at_a_time() {
        let observer = Arc::new(CountingObserver::new());
        let gate = ComputeGate::with_observer(observer.clone());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        gate.enter(|| thread::sleep(Duration::from_micros(200)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(observer.max_concurrent(), 1);
        assert_eq!(observer.entries(), 80);
        assert_eq!(observer.current(), 0);
        assert_eq!(gate.entries(), 80);
    }

    #[test]
    fn gate_survives_a_panicking_holder() {
        let observer = Arc::new(CountingObserver::new());
        let gate = ComputeGate::with_observer(observer.clone());

        let panicking = gate.clone();
        let result = thread::spawn(move || panicking.enter(|| panic!("backend crashed"))).join();
        assert!(result.is_err());
        assert_eq!(observer.current(), 0);

        assert_eq!(gate.enter(|| "still usable"), "still usable");
    }
}

//! Optional observability hooks (low-cardinality counters and spans).
//!
//! By default these are no-ops. A host application may register a global
//! observer once to wire metrics/traces into whatever backend it uses
//! (carried forward unchanged from the teacher's `blob_store` crate, widened
//! from put/get-only counters to the full operation set this crate exposes).

use std::any::Any;
use std::sync::OnceLock;

/// Counters and spans a caller may wire up to an observability backend.
pub trait Observer: Send + Sync {
    /// Plaintext bytes accepted by a write-shaped operation.
    fn bytes_written(&self, _n: u64) {}
    /// Plaintext bytes returned by a read-shaped operation.
    fn bytes_read(&self, _n: u64) {}
    /// A CAS write or delete was rejected due to a token mismatch.
    fn conflict(&self, _id: &str) {}
    /// An advisory lock wait on the Files backend.
    fn lock_wait(&self, _name: &str) {}
    /// Start an optional span; dropping the returned guard ends it.
    fn span(&self, _name: &'static str) -> Span {
        Span::noop()
    }
}

/// Guard object for optional spans; holds a type-erased guard that exits on drop.
pub struct Span {
    _guard: Option<Box<dyn Any + 'static>>,
}

impl Span {
    /// A no-op span guard.
    pub fn noop() -> Self {
        Self { _guard: None }
    }

    /// Wrap an arbitrary guard object; dropping this drops it.
    pub fn from_guard<G: 'static>(guard: G) -> Self {
        Self { _guard: Some(Box::new(guard)) }
    }
}

struct NoopObserver;
impl Observer for NoopObserver {}

static NOOP: NoopObserver = NoopObserver;
static OBSERVER: OnceLock<&'static dyn Observer> = OnceLock::new();

/// Register a process-global observer. Safe to call at most once;
/// subsequent calls are ignored (first writer wins).
pub fn set_observer(observer: &'static dyn Observer) {
    let _ = OBSERVER.set(observer);
}

/// The currently-installed observer, or a no-op if none was registered.
pub fn observer() -> &'static dyn Observer {
    match OBSERVER.get() {
        Some(o) => *o,
        None => &NOOP,
    }
}

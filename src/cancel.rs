//! Cooperative cancellation handle threaded through every backend operation.
//!
//! There is no async runtime here: operations are synchronous and check
//! cancellation at natural boundaries — chunk reads during streaming,
//! lock-wait retries, before/after key derivation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::Error;

/// A cheaply-cloneable cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    /// Create a fresh, not-yet-cancelled handle.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Signal cancellation. Observable by every clone of this handle.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once `cancel` has been called on any clone.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Returns `Err(Error::Cancelled)` iff this handle has been cancelled.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// A handle that can never be cancelled, for call sites that don't need one.
    pub fn never() -> Self {
        Self::new()
    }
}

//! Cooperative cancellation shared between the session, its long-running
//! waits and the receive loop.

use {
    crate::error::{Error, Result},
    std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

/// Clonable stop flag. All clones observe the same state.
///
/// Embedding applications create one per session, hand a clone to their
/// Ctrl-C handler and pass another to
/// [`SerialTransport::start`](crate::SerialTransport::start).
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Create a token that has not been cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that every holder stops.
    pub fn cancel(&self) {
        self.flag
            .store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag
            .load(Ordering::SeqCst)
    }

    /// Fail with [`Error::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

//! A minimal cancellation signal threaded through the pipeline.
//!
//! Rather than pull in `tokio_util` just for a `CancellationToken`, this models
//! the same "cancelled" flag on top of a plain `tokio::sync::watch<bool>`, the
//! way small health-check primitives get built on `tokio::sync::mpsc` rather
//! than reaching for a heavier actor framework.

use tokio::sync::watch;

/// Held by the code that may need to cancel an in-flight transition.
pub struct CancellationSource(watch::Sender<bool>);

/// Held by the pipeline; cheap to clone, observes cancellation without blocking.
#[derive(Clone)]
pub struct CancellationToken(watch::Receiver<bool>);

impl CancellationSource {
    pub fn new() -> (Self, CancellationToken) {
        let (tx, rx) = watch::channel(false);
        (Self(tx), CancellationToken(rx))
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new().0
    }
}

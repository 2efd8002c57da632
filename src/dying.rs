//! The "dying signal" supervision primitive (§5, §9).
//!
//! Every worker in `mup` is supervised by a cheap, clonable handle that its
//! children select over alongside their own work. When a supervisor decides
//! to unwind — on request, or because a descendant hit a fatal error — it
//! kills the signal once and every holder of a [`Dying`] observes it.

use tokio::sync::watch;

/// Owned by a supervisor; killing it wakes every clone of the matching
/// [`Dying`] handle.
#[derive(Clone)]
pub struct DyingSignal {
    tx: watch::Sender<bool>,
}

/// Held by a worker; `recv` resolves once the owning supervisor calls
/// [`DyingSignal::kill`].
#[derive(Clone)]
pub struct Dying {
    rx: watch::Receiver<bool>,
}

impl DyingSignal {
    /// Create a fresh signal and its first observer handle.
    pub fn new() -> (Self, Dying) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, Dying { rx })
    }

    /// Mint another observer handle for a new child.
    pub fn child(&self) -> Dying {
        Dying {
            rx: self.tx.subscribe(),
        }
    }

    /// Kill the signal. Idempotent — calling this more than once is a no-op
    /// after the first.
    pub fn kill(&self) {
        let _ = self.tx.send(true);
    }

    /// True if this signal has already been killed.
    pub fn is_dead(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Dying {
    /// Resolve once the owning [`DyingSignal`] is killed. Safe to `select!`
    /// against repeatedly; once killed, every future call resolves
    /// immediately.
    pub async fn recv(&mut self) {
        // `changed()` only errors if every sender was dropped, which would
        // mean the supervisor itself died without killing us explicitly —
        // treat that the same as a kill.
        let _ = self.rx.changed().await;
    }

    /// True if the owning supervisor has killed this signal.
    pub fn is_dying(&self) -> bool {
        *self.rx.borrow()
    }
}

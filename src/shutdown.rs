//! Cooperative shutdown plumbing.
//!
//! One [`Shutdown`] value lives in the supervisor (the subprocess pool keeps
//! a private one for its reaper). Anything that must stop on demand — the
//! dispatch loop, the idle reaper — holds a [`ShutdownSignal`] subscription.
//! Triggering is sticky: a subscriber that only starts waiting after the
//! trigger still observes it, so teardown ordering never races the signal.

use tokio::sync::watch;

/// Shutdown coordinator. Hand out subscriptions with
/// [`subscribe`](Self::subscribe), then [`trigger`](Self::trigger) once to
/// stop them all.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// A new subscription. Independent of every other subscriber, and valid
    /// even if created after the trigger fired.
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    /// Flip the flag for every subscriber, current and future. Idempotent;
    /// takes effect even while no subscription exists.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// One subsystem's view of the shutdown flag.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Wait until shutdown has been triggered. Resolves immediately when the
    /// flag is already set.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|&stop| stop).await;
    }
}

/// Block until `SIGINT` (Ctrl-C) or `SIGTERM` (container stop) arrives.
/// The supervisor calls this once, then begins ordered teardown.
pub async fn wait_for_os_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");

    tokio::select! {
        _ = sigint.recv()  => tracing::info!("🔔 SIGINT received"),
        _ = sigterm.recv() => tracing::info!("🔔 SIGTERM received"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_every_subscriber() {
        let shutdown = Shutdown::new();
        let mut a = shutdown.subscribe();
        let mut b = shutdown.subscribe();
        shutdown.trigger();
        a.wait().await;
        b.wait().await;
    }

    #[tokio::test]
    async fn late_subscribers_observe_an_earlier_trigger() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let mut late = shutdown.subscribe();
        late.wait().await;
    }

    #[tokio::test]
    async fn trigger_is_idempotent() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.subscribe();
        shutdown.trigger();
        shutdown.trigger();
        signal.wait().await;
    }
}

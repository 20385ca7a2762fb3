//! Background eviction of idle lists that outlived the retention window.
//!
//! The task only holds a weak reference to its target, so it ends on its own
//! once the pool is gone. [`Sweeper::stop`] ends it earlier.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;

/// Something with idle entries to reclaim. Returns how many were removed.
pub(crate) trait Sweep: Send + Sync + 'static {
    fn sweep(&self) -> usize;
}

pub struct Sweeper {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub(crate) fn spawn(target: Weak<dyn Sweep>, period: Duration) -> Result<Self, ConfigError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let cancel = CancellationToken::new();
        let handle = runtime.spawn(run(target, period, cancel.clone()));
        tracing::debug!(period = ?period, "Sweeper started");
        Ok(Self { cancel, handle })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(target: Weak<dyn Sweep>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(target) = target.upgrade() else {
            break;
        };
        let removed = target.sweep();
        if removed > 0 {
            tracing::debug!(removed, "Sweep pass finished");
        }
    }

    tracing::debug!("Sweeper stopped");
}

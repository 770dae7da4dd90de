//! Restart gate.
//!
//! One instance owns many independent tasks; when any of them hits a
//! session-fatal fault the whole graph is torn down and rebuilt through a
//! single chokepoint: `Running -> Draining (grace sleep) -> Reinit ->
//! Running`. Concurrent faults collapse into one restart.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Grace period between cancelling a generation and rebuilding it, giving
/// in-flight tasks time to observe cancellation and release their sockets.
pub const RESTART_GRACE: Duration = Duration::from_secs(2);

/// Serializes teardown-and-rebuild for one server or client instance.
pub struct Supervisor {
    gate: Mutex<()>,
    scope: Mutex<CancellationToken>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(()),
            scope: Mutex::new(CancellationToken::new()),
        }
    }

    /// Cancellation token of the current generation.
    pub async fn scope(&self) -> CancellationToken {
        self.scope.lock().await.clone()
    }

    /// Cancels the current generation without rebuilding.
    pub async fn shutdown(&self) {
        self.scope.lock().await.cancel();
    }

    /// Tears the current generation down, waits out the drain grace, then
    /// hands a fresh scope to `rebuild`. Returns immediately when another
    /// restart already holds the gate.
    pub async fn restart<F>(&self, rebuild: F)
    where
        F: FnOnce(CancellationToken),
    {
        let Ok(_guard) = self.gate.try_lock() else {
            warn!("restart already in progress, skipping restart attempt");
            return;
        };

        info!("restarting instance");
        self.scope.lock().await.cancel();
        tokio::time::sleep(RESTART_GRACE).await;

        let fresh = CancellationToken::new();
        *self.scope.lock().await = fresh.clone();
        rebuild(fresh);
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn restart_cancels_the_old_scope() {
        let supervisor = Supervisor::new();
        let old = supervisor.scope().await;
        supervisor.restart(|_fresh| {}).await;
        assert!(old.is_cancelled());
        assert!(!supervisor.scope().await.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_restarts_collapse_into_one() {
        let supervisor = Arc::new(Supervisor::new());
        let rebuilds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let supervisor = supervisor.clone();
            let rebuilds = rebuilds.clone();
            handles.push(tokio::spawn(async move {
                supervisor
                    .restart(|_| {
                        rebuilds.fetch_add(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // the gate is held across the drain sleep, so the latecomers all
        // observe a restart in progress and bail out
        assert_eq!(rebuilds.load(Ordering::SeqCst), 1);
    }
}

//! # Background Tasks
//!
//! Detached fire-and-forget work and the long-running timers owned by the service.
//!
//! ## Graceful Shutdown
//!
//! Every timer loop selects on a shared `CancellationToken`; cancelling it on shutdown
//! lets each loop finish its current iteration and exit, leaving no dangling timers.

use crate::hub::SharedHub;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

/// Run `fut` on its own task without the caller waiting for it.
///
/// The future is expected to log its own failures; a panic inside it is reported
/// here instead of being silently dropped with the handle.
pub fn spawn_detached<F>(what: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let inner = tokio::spawn(fut.instrument(tracing::debug_span!("detached", task = what)));
    tokio::spawn(async move {
        if let Err(e) = inner.await {
            tracing::error!(task = what, error = %e, "Detached task failed");
        }
    })
}

/// Handles to the service's timer tasks.
pub struct BackgroundTasks {
    cancel_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self {
            cancel_token,
            handles: Vec::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    /// Cancel every timer and wait for the loops to exit.
    pub async fn shutdown(self) {
        self.cancel_token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Background tasks stopped");
    }
}

/// Periodically clear the rejected-code cache once it has grown large.
pub async fn run_rejected_code_sweeper(hub: SharedHub, interval: Duration, cancel_token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; there is nothing to sweep at startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let dropped = hub.lock().sweep_rejected_codes();
                if dropped > 0 {
                    debug!(dropped, "Rejected-code cache cleared");
                }
            }
            _ = cancel_token.cancelled() => {
                info!("Rejected-code sweeper received shutdown signal, exiting");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::tests::test_hub;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_spawn_detached_runs_to_completion() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        spawn_detached("test", async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_spawn_detached_survives_panics() {
        let handle = spawn_detached("panicking", async {
            panic!("boom");
        });
        assert!(handle.await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_clears_large_cache_and_stops_on_cancel() {
        let hub = test_hub();
        {
            let mut guard = hub.lock();
            for n in 0..600 {
                guard.reject_code(&format!("{}", 20_000 + n));
            }
        }

        let mut tasks = BackgroundTasks::new(CancellationToken::new());
        tasks.track(tokio::spawn(run_rejected_code_sweeper(
            hub.clone(),
            Duration::from_secs(10),
            tasks.token(),
        )));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(hub.lock().stats().rejected_codes, 0);

        tasks.shutdown().await;
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::service::Orchestrator;

const PURGE_INTERVAL: Duration = Duration::from_secs(300);

impl Orchestrator {
    /// Worker pool loop. Claims pending runs in FIFO order while slots are
    /// free, until `shutdown` fires; in-flight runs are then cancelled and
    /// drained.
    pub async fn run_scheduler(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Scheduler started with {} slot(s)",
            self.settings.max_concurrent_runs
        );
        let mut workers = JoinSet::new();
        let mut tick = tokio::time::interval(self.settings.scheduler_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_purge: Option<Instant> = None;

        loop {
            self.dispatch_pending(&mut workers, &shutdown).await;

            if last_purge.is_none_or(|at| at.elapsed() >= PURGE_INTERVAL) {
                match self.store.purge_expired_idempotency(Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => info!("Purged {} expired idempotency key(s)", n),
                    Err(e) => warn!("Idempotency purge failed: {}", e.detail()),
                }
                last_purge = Some(Instant::now());
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tick.tick() => {}
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    if let Err(e) = joined {
                        error!("Run worker panicked: {}", e);
                    }
                }
            }
        }

        if !workers.is_empty() {
            info!("Scheduler stopping, waiting for {} run(s)", workers.len());
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Run worker panicked: {}", e);
            }
        }
        info!("Scheduler stopped");
    }

    async fn dispatch_pending(self: &Arc<Self>, workers: &mut JoinSet<()>, shutdown: &CancellationToken) {
        let free = self.slots.available_permits();
        if free == 0 || shutdown.is_cancelled() {
            return;
        }
        let busy = self.active.lock().await.len();
        let pending = match self.store.next_pending_runs((free + busy) as i64).await {
            Ok(runs) => runs,
            Err(e) => {
                warn!("Could not load pending runs: {}", e.detail());
                return;
            }
        };

        for run in pending {
            let mut active = self.active.lock().await;
            if active.contains_key(&run.id) {
                continue;
            }
            let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                break;
            };
            let token = shutdown.child_token();
            active.insert(run.id, token.clone());
            drop(active);

            debug!("Dispatching run {}", run.id);
            let orchestrator = Arc::clone(self);
            workers.spawn(async move {
                let _permit = permit;
                let run_id = run.id;
                Arc::clone(&orchestrator).drive(run, token).await;
                orchestrator.active.lock().await.remove(&run_id);
                orchestrator.wake.notify_one();
            });
        }
    }
}

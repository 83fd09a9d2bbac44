use super::{JobLockService, LockError, LockToken};
use crate::task::spawn_named;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Read side of a heartbeat: whether the lock is still ours.
#[derive(Debug, Clone)]
pub struct LockStatus {
    active: watch::Receiver<bool>,
}

impl LockStatus {
    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }
}

pub struct RefreshHandle {
    service: Arc<JobLockService>,
    token: LockToken,
    active: watch::Receiver<bool>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RefreshHandle {
    pub fn is_active(&self) -> bool {
        *self.active.borrow()
    }

    pub fn status(&self) -> LockStatus {
        LockStatus {
            active: self.active.clone(),
        }
    }

    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Stop refreshing. The lock then lapses at its current expiry.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop refreshing and give the lock up.
    pub async fn release(self) -> Result<(), LockError> {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Heartbeat for job lock {} ended badly: {}", self.token.lock_name(), e);
        }
        self.service.release(&self.token).await
    }
}

impl JobLockService {
    /// Refresh `token` every `ttl / 2` on a background task. When the lock
    /// is lost the status flips to inactive and `lock_released` runs once.
    /// Store errors are retried until a whole `ttl` has passed without a
    /// successful refresh, since the record has expired by then.
    pub fn refresh_periodically<F>(
        self: &Arc<Self>,
        token: LockToken,
        ttl: Duration,
        lock_released: F,
    ) -> Result<RefreshHandle, LockError>
    where
        F: FnOnce() + Send + 'static,
    {
        let (active_tx, active_rx) = watch::channel(true);
        let cancel = CancellationToken::new();
        let period = (ttl / 2).max(Duration::from_millis(1));

        let service = self.clone();
        let task_token = token.clone();
        let task_cancel = cancel.clone();
        let task = spawn_named(
            &format!("joblock-heartbeat-{}", token.lock_name()),
            async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // the first tick completes immediately
                ticker.tick().await;
                let mut renewed_at = Instant::now();

                loop {
                    tokio::select! {
                        _ = task_cancel.cancelled() => {
                            debug!("Heartbeat for job lock {} cancelled", task_token.lock_name());
                            break;
                        }
                        _ = ticker.tick() => {
                            let attempt = Instant::now();
                            let lost = match service.refresh(&task_token, ttl).await {
                                Ok(()) => {
                                    renewed_at = attempt;
                                    None
                                }
                                Err(e @ LockError::LockLost(_)) => Some(e.to_string()),
                                Err(e) if renewed_at.elapsed() >= ttl => {
                                    Some(format!("no refresh for {:?}, last error: {}", ttl, e))
                                }
                                Err(e) => {
                                    warn!(
                                        "Failed to refresh job lock {}, will retry: {}",
                                        task_token.lock_name(),
                                        e
                                    );
                                    None
                                }
                            };
                            if let Some(reason) = lost {
                                warn!("Lost job lock {}: {}", task_token.lock_name(), reason);
                                let _ = active_tx.send(false);
                                lock_released();
                                break;
                            }
                        }
                    }
                }
            },
        )?;

        Ok(RefreshHandle {
            service: self.clone(),
            token,
            active: active_rx,
            cancel,
            task,
        })
    }
}

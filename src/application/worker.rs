use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::application::reviewer::Reviewer;
use crate::domain::ports::{NackOutcome, TaskBroker};

const LEASE_TIMEOUT: Duration = Duration::from_secs(5);
const SCHEDULER_INTERVAL: Duration = Duration::from_secs(1);

/// Drains the broker with `concurrency` parallel workers until the token is
/// cancelled. One scheduler task promotes delayed retries back to pending;
/// tasks stranded by a previous crash are re-queued once at startup.
pub async fn run_worker_pool(
    broker: Arc<dyn TaskBroker>,
    reviewer: Arc<Reviewer>,
    concurrency: usize,
    cancel: CancellationToken,
) -> Result<()> {
    match broker.requeue_orphans().await {
        Ok(0) => {}
        Ok(n) => info!(requeued = n, "recovered tasks from a previous run"),
        Err(err) => warn!(error = %err, "failed to requeue orphaned tasks"),
    }

    let scheduler = {
        let broker = broker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCHEDULER_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = broker.schedule_due().await {
                            warn!(error = %err, "failed to promote delayed tasks");
                        }
                    }
                }
            }
        })
    };

    let concurrency = concurrency.max(1);
    info!(concurrency, "worker pool starting");

    let workers: Vec<_> = (0..concurrency)
        .map(|worker_id| {
            let broker = broker.clone();
            let reviewer = reviewer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, broker, reviewer, cancel).await;
            })
        })
        .collect();

    join_all(workers).await;
    scheduler.abort();
    info!("worker pool stopped");
    Ok(())
}

async fn worker_loop(
    worker_id: usize,
    broker: Arc<dyn TaskBroker>,
    reviewer: Arc<Reviewer>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            return;
        }

        let lease = tokio::select! {
            _ = cancel.cancelled() => return,
            lease = broker.lease(LEASE_TIMEOUT) => lease,
        };

        let lease = match lease {
            Ok(Some(lease)) => lease,
            Ok(None) => continue,
            Err(err) => {
                warn!(worker_id, error = %err, "lease failed, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                }
            }
        };

        let final_attempt = lease.retry_count >= lease.max_retries;
        info!(
            worker_id,
            task_id = %lease.task_id,
            retry_count = lease.retry_count,
            "task leased"
        );

        match reviewer.process(&cancel, &lease.task, final_attempt).await {
            Ok(()) => {
                if let Err(err) = broker.ack(&lease).await {
                    error!(task_id = %lease.task_id, error = %err, "failed to ack task");
                }
            }
            Err(err) => {
                warn!(task_id = %lease.task_id, error = %err, "task failed, returning to broker");
                match broker.nack(&lease).await {
                    Ok(NackOutcome::Retried { delay }) => {
                        info!(
                            task_id = %lease.task_id,
                            delay_ms = delay.as_millis() as u64,
                            "task scheduled for retry"
                        );
                    }
                    Ok(NackOutcome::DeadLettered) => {
                        error!(task_id = %lease.task_id, "task dead-lettered after exhausting retries");
                    }
                    Err(nack_err) => {
                        error!(task_id = %lease.task_id, error = %nack_err, "failed to nack task");
                    }
                }
            }
        }
    }
}

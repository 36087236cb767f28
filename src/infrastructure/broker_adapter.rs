use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::entities::ReviewTask;
use crate::domain::ports::{LeasedTask, NackOutcome, QueueStats, SubmitOutcome, TaskBroker};

/// How long a task-id uniqueness guard survives if a crash prevents normal
/// cleanup. Well past any realistic review duration.
const ID_GUARD_TTL_SECS: u64 = 24 * 60 * 60;
const SCHEDULE_BATCH: usize = 100;

const RETRY_BASE: Duration = Duration::from_secs(10);
const RETRY_CAP: Duration = Duration::from_secs(10 * 60);

/// Broker-level backoff for delivery attempt `retry_count` (1-based),
/// exponential and capped. This is the slow outer loop; the in-call retry
/// engine handles short bursts.
pub fn broker_backoff(retry_count: u32) -> Duration {
    let shift = retry_count.saturating_sub(1).min(16);
    let delay = RETRY_BASE.saturating_mul(1u32 << shift);
    delay.min(RETRY_CAP)
}

#[derive(Debug, Serialize, Deserialize)]
struct TaskEnvelope {
    task_id: String,
    task: ReviewTask,
    retry_count: u32,
    max_retries: u32,
}

/// Redis-backed task queue. Layout per queue name `q`:
///   `q:pending` (list)  - submitted tasks, consumed right-to-left (FIFO)
///   `q:active`  (list)  - tasks leased to a worker
///   `q:delayed` (zset)  - failed tasks awaiting their backoff, scored by due time
///   `q:dead`    (list)  - tasks that exhausted their retries
///   `q:id:<task_id>`    - uniqueness guard making duplicate submits a no-op
pub struct RedisBroker {
    manager: ConnectionManager,
    queue: String,
}

impl RedisBroker {
    pub async fn connect(url: &str, queue: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;
        Ok(Self {
            manager,
            queue: queue.to_string(),
        })
    }

    fn key_pending(&self) -> String {
        format!("{}:pending", self.queue)
    }

    fn key_active(&self) -> String {
        format!("{}:active", self.queue)
    }

    fn key_delayed(&self) -> String {
        format!("{}:delayed", self.queue)
    }

    fn key_dead(&self) -> String {
        format!("{}:dead", self.queue)
    }

    fn key_id(&self, task_id: &str) -> String {
        format!("{}:id:{}", self.queue, task_id)
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn decode_lease(raw: String) -> Result<LeasedTask> {
    let envelope: TaskEnvelope =
        serde_json::from_str(&raw).context("malformed task envelope")?;
    Ok(LeasedTask {
        task_id: envelope.task_id,
        task: envelope.task,
        retry_count: envelope.retry_count,
        max_retries: envelope.max_retries,
        raw,
    })
}

#[async_trait]
impl TaskBroker for RedisBroker {
    async fn submit(
        &self,
        task: &ReviewTask,
        task_id: &str,
        max_retries: u32,
    ) -> Result<SubmitOutcome> {
        let mut conn = self.conn();

        let claimed: Option<String> = redis::cmd("SET")
            .arg(self.key_id(task_id))
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(ID_GUARD_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        if claimed.is_none() {
            debug!(task_id, "duplicate task id, submission skipped");
            return Ok(SubmitOutcome::Duplicate);
        }

        let envelope = TaskEnvelope {
            task_id: task_id.to_string(),
            task: task.clone(),
            retry_count: 0,
            max_retries,
        };
        let raw = serde_json::to_string(&envelope).context("failed to encode task")?;
        let _: i64 = redis::cmd("LPUSH")
            .arg(self.key_pending())
            .arg(raw)
            .query_async(&mut conn)
            .await?;

        debug!(task_id, "task enqueued");
        Ok(SubmitOutcome::Enqueued)
    }

    async fn lease(&self, timeout: Duration) -> Result<Option<LeasedTask>> {
        let mut conn = self.conn();
        let raw: Option<String> = redis::cmd("BLMOVE")
            .arg(self.key_pending())
            .arg(self.key_active())
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };

        match decode_lease(raw.clone()) {
            Ok(lease) => Ok(Some(lease)),
            Err(err) => {
                // An undecodable envelope would wedge the active list; move
                // it straight to the dead letter.
                warn!(error = %err, "dead-lettering malformed task");
                let _: i64 = redis::cmd("LREM")
                    .arg(self.key_active())
                    .arg(1)
                    .arg(&raw)
                    .query_async(&mut conn)
                    .await?;
                let _: i64 = redis::cmd("LPUSH")
                    .arg(self.key_dead())
                    .arg(&raw)
                    .query_async(&mut conn)
                    .await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, lease: &LeasedTask) -> Result<()> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("LREM")
            .arg(self.key_active())
            .arg(1)
            .arg(&lease.raw)
            .query_async(&mut conn)
            .await?;
        let _: i64 = redis::cmd("DEL")
            .arg(self.key_id(&lease.task_id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, lease: &LeasedTask) -> Result<NackOutcome> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("LREM")
            .arg(self.key_active())
            .arg(1)
            .arg(&lease.raw)
            .query_async(&mut conn)
            .await?;

        let retry_count = lease.retry_count + 1;
        if retry_count > lease.max_retries {
            let _: i64 = redis::cmd("LPUSH")
                .arg(self.key_dead())
                .arg(&lease.raw)
                .query_async(&mut conn)
                .await?;
            let _: i64 = redis::cmd("DEL")
                .arg(self.key_id(&lease.task_id))
                .query_async(&mut conn)
                .await?;
            return Ok(NackOutcome::DeadLettered);
        }

        let delay = broker_backoff(retry_count);
        let envelope = TaskEnvelope {
            task_id: lease.task_id.clone(),
            task: lease.task.clone(),
            retry_count,
            max_retries: lease.max_retries,
        };
        let raw = serde_json::to_string(&envelope).context("failed to encode task")?;
        let due = now_epoch_secs() + delay.as_secs();
        let _: i64 = redis::cmd("ZADD")
            .arg(self.key_delayed())
            .arg(due)
            .arg(raw)
            .query_async(&mut conn)
            .await?;

        Ok(NackOutcome::Retried { delay })
    }

    async fn schedule_due(&self) -> Result<u64> {
        let mut conn = self.conn();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.key_delayed())
            .arg("-inf")
            .arg(now_epoch_secs())
            .arg("LIMIT")
            .arg(0)
            .arg(SCHEDULE_BATCH)
            .query_async(&mut conn)
            .await?;

        let mut moved = 0u64;
        for raw in due {
            // ZREM doubles as the claim; only the remover re-queues.
            let removed: i64 = redis::cmd("ZREM")
                .arg(self.key_delayed())
                .arg(&raw)
                .query_async(&mut conn)
                .await?;
            if removed == 1 {
                let _: i64 = redis::cmd("LPUSH")
                    .arg(self.key_pending())
                    .arg(&raw)
                    .query_async(&mut conn)
                    .await?;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn requeue_orphans(&self) -> Result<u64> {
        let mut conn = self.conn();
        let mut moved = 0u64;
        loop {
            let raw: Option<String> = redis::cmd("LMOVE")
                .arg(self.key_active())
                .arg(self.key_pending())
                .arg("RIGHT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if raw.is_none() {
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn();
        let pending: u64 = redis::cmd("LLEN")
            .arg(self.key_pending())
            .query_async(&mut conn)
            .await?;
        let active: u64 = redis::cmd("LLEN")
            .arg(self.key_active())
            .query_async(&mut conn)
            .await?;
        let delayed: u64 = redis::cmd("ZCARD")
            .arg(self.key_delayed())
            .query_async(&mut conn)
            .await?;
        let dead: u64 = redis::cmd("LLEN")
            .arg(self.key_dead())
            .query_async(&mut conn)
            .await?;
        Ok(QueueStats {
            pending,
            active,
            delayed,
            dead,
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

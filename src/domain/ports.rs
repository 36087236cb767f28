use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::entities::{
    CommentInfo, InlineComment, NewReview, PullRequestDetails, PullRequestFile, PullReviewInfo,
    RepositoryRecord, ReviewCommentRecord, ReviewTask, ReviewUpdate, WebhookEventRecord,
};

/// Narrow client over the source forge. Implementations own authentication
/// (installation tokens) and request-level concurrency.
#[async_trait]
pub trait ForgeRepository: Send + Sync {
    async fn get_pull_request(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<PullRequestDetails>;
    async fn get_pull_request_diff(&self, owner: &str, repo: &str, pr_number: u64)
        -> Result<String>;
    async fn list_pull_request_files(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<Vec<PullRequestFile>>;
    async fn create_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        issue_number: u64,
        body: &str,
    ) -> Result<()>;
    async fn add_reaction(
        &self,
        owner: &str,
        repo: &str,
        comment_id: u64,
        reaction: &str,
    ) -> Result<()>;
    /// One atomic review submission: a summary body plus inline comments,
    /// all tied to the given head commit.
    async fn submit_inline_review(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
        commit_sha: &str,
        body: &str,
        comments: &[InlineComment],
    ) -> Result<()>;
    async fn list_review_comments(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<Vec<CommentInfo>>;
    async fn list_reviews(
        &self,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<Vec<PullReviewInfo>>;
    async fn list_labels(&self, owner: &str, repo: &str, issue_number: u64) -> Result<Vec<String>>;
}

/// Text-in/text-out review engine. Failures carry classification hints in
/// their message (rate-limit, server error) for the retry layer.
#[async_trait]
pub trait ReviewEngine: Send + Sync {
    async fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<String>;
}

/// Persistence hooks for the review lifecycle. Callers treat writes as
/// best-effort; the posted PR comment is the ground truth.
pub trait ReviewStore: Send + Sync {
    fn upsert_repository(&self, repo: &RepositoryRecord) -> Result<()>;
    fn create_webhook_event(&self, event: &WebhookEventRecord) -> Result<i64>;
    fn create_review(&self, review: &NewReview) -> Result<i64>;
    fn update_review(&self, id: i64, update: ReviewUpdate) -> Result<()>;
    fn create_review_comment(&self, comment: &ReviewCommentRecord) -> Result<()>;
    fn count_reviews_by_status(&self) -> Result<Vec<(String, i64)>>;
    fn ping(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Enqueued,
    /// The task id is already pending or in flight; nothing was scheduled.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Retried { delay: Duration },
    DeadLettered,
}

/// A task leased to one worker. The raw form is what the broker needs to
/// release the lease.
#[derive(Debug, Clone)]
pub struct LeasedTask {
    pub task_id: String,
    pub task: ReviewTask,
    pub retry_count: u32,
    pub max_retries: u32,
    pub raw: String,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub active: u64,
    pub delayed: u64,
    pub dead: u64,
}

/// Durable at-least-once task queue shared by the ingress and worker
/// processes. Task ids are deterministic and duplicate submission is a no-op.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    async fn submit(
        &self,
        task: &ReviewTask,
        task_id: &str,
        max_retries: u32,
    ) -> Result<SubmitOutcome>;
    /// Blocks up to `timeout` for the next pending task and leases it.
    async fn lease(&self, timeout: Duration) -> Result<Option<LeasedTask>>;
    async fn ack(&self, lease: &LeasedTask) -> Result<()>;
    async fn nack(&self, lease: &LeasedTask) -> Result<NackOutcome>;
    /// Moves delayed tasks whose backoff has elapsed back to pending.
    async fn schedule_due(&self) -> Result<u64>;
    /// Returns tasks stranded in the active list by a crashed worker to
    /// pending. Called once at pool start.
    async fn requeue_orphans(&self) -> Result<u64>;
    async fn queue_stats(&self) -> Result<QueueStats>;
    async fn ping(&self) -> Result<()>;
}

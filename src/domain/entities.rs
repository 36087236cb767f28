use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewMode {
    Review,
    Hunt,
    Security,
    Performance,
    Analyze,
}

impl ReviewMode {
    /// Parses a mode string; unknown modes fall back to `Review`.
    pub fn parse_or_default(input: &str) -> Self {
        match input.to_ascii_lowercase().as_str() {
            "review" => Self::Review,
            "hunt" => Self::Hunt,
            "security" => Self::Security,
            "performance" => Self::Performance,
            "analyze" => Self::Analyze,
            _ => Self::Review,
        }
    }

    pub fn is_known(input: &str) -> bool {
        matches!(
            input.to_ascii_lowercase().as_str(),
            "review" | "hunt" | "security" | "performance" | "analyze"
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Review => "review",
            Self::Hunt => "hunt",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Analyze => "analyze",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Review => "Code Review",
            Self::Hunt => "Bug Hunt",
            Self::Security => "Security Audit",
            Self::Performance => "Performance Analysis",
            Self::Analyze => "Deep Analysis",
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Self::Review => "📝",
            Self::Hunt => "🐛",
            Self::Security => "🔒",
            Self::Performance => "⚡",
            Self::Analyze => "🔬",
        }
    }
}

/// A parsed `@magpie <mode> [verbose]` directive. Immutable once parsed.
#[derive(Debug, Clone)]
pub struct Command {
    pub mode: ReviewMode,
    pub verbose: bool,
    pub raw: String,
}

/// The broker payload for one queued review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewTask {
    pub event_type: String,
    pub action: String,
    pub owner: String,
    pub repo: String,
    pub pr_number: u64,
    pub comment_id: u64,
    pub comment_body: String,
    pub sender_login: String,
    pub mode: ReviewMode,
    pub verbose: bool,
    pub commit_sha: String,
    pub review_id: i64,
}

impl ReviewTask {
    /// Deterministic broker task id; the commit SHA makes a superseding push
    /// produce a distinct task instead of colliding with the in-flight one.
    pub fn task_id(&self) -> String {
        if self.commit_sha.is_empty() {
            format!("review:{}/{}/{}", self.owner, self.repo, self.pr_number)
        } else {
            format!(
                "review:{}/{}/{}:{}",
                self.owner, self.repo, self.pr_number, self.commit_sha
            )
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A new review lifecycle row, created at ingress in state `queued`.
#[derive(Debug, Clone)]
pub struct NewReview {
    pub owner: String,
    pub repo: String,
    pub pr_number: u64,
    pub pr_title: String,
    pub commit_sha: String,
    pub mode: ReviewMode,
    pub requested_by: String,
    pub queued_at: DateTime<Utc>,
}

/// Partial update applied to a review row; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct ReviewUpdate {
    pub status: Option<ReviewStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub diff_size: Option<i64>,
    pub files_changed: Option<i64>,
    pub bugs_found: Option<i64>,
    pub comments_posted: Option<i64>,
    pub review_body: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: Option<i64>,
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReviewCommentRecord {
    pub review_id: i64,
    pub file_path: String,
    pub line: u32,
    pub severity: String,
    pub category: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct RepositoryRecord {
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub is_private: bool,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct WebhookEventRecord {
    pub event_type: String,
    pub owner: String,
    pub repo: String,
    pub pr_number: u64,
    pub action: String,
    pub processed_at: DateTime<Utc>,
    pub review_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct PullRequestDetails {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub state: String,
    pub head_sha: String,
}

#[derive(Debug, Clone)]
pub struct PullRequestFile {
    pub path: String,
    pub status: String,
    pub additions: u64,
    pub deletions: u64,
    pub patch: Option<String>,
}

/// An inline finding tied to a new-side line, parsed from engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineComment {
    pub path: String,
    pub line: u32,
    pub body: String,
}

/// A raw inline review comment fetched for context gathering.
#[derive(Debug, Clone)]
pub struct CommentInfo {
    pub author: String,
    pub author_type: String,
    pub path: String,
    pub line: u32,
    pub body: String,
}

/// A prior review fetched for context gathering.
#[derive(Debug, Clone)]
pub struct PullReviewInfo {
    pub author: String,
    pub state: String,
    pub body: String,
}

/// Process configuration, resolved from the environment at boot.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bot_username: String,
    pub engine_path: String,
    pub engine_model: Option<String>,
    pub max_diff_size: usize,
    pub http_addr: String,
    pub webhook_secret: String,
    pub github_app_id: u64,
    pub github_private_key_path: String,
    pub database_path: String,
    pub redis_url: String,
    pub queue_name: String,
    pub concurrency: usize,
    pub task_max_retries: u32,
    pub rate_limit_max_tokens: usize,
    pub rate_limit_refill_sec: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub cache_enabled: bool,
    pub cache_max_size: usize,
    pub cache_ttl_min: u64,
    pub dedup_enabled: bool,
    pub dedup_ttl_min: u64,
}

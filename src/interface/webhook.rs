use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;
use hmac::{Hmac, Mac};
use regex::Regex;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, error, info, warn};

use crate::application::dedup::{request_key, Deduplicator, DUPLICATE_WAIT};
use crate::domain::entities::{
    Command, NewReview, RepositoryRecord, ReviewMode, ReviewStatus, ReviewTask, ReviewUpdate,
    WebhookEventRecord,
};
use crate::domain::ports::{ForgeRepository, ReviewStore, SubmitOutcome, TaskBroker};

const REACTION_TIMEOUT: Duration = Duration::from_secs(5);
const PR_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

type HmacSha256 = Hmac<Sha256>;

pub struct WebhookState {
    pub secret: String,
    pub bot_username: String,
    pub command_re: Regex,
    pub forge: Arc<dyn ForgeRepository>,
    pub store: Arc<dyn ReviewStore>,
    pub broker: Arc<dyn TaskBroker>,
    pub dedup: Option<Arc<Deduplicator>>,
    pub task_max_retries: u32,
}

impl WebhookState {
    /// The command grammar: `@<bot> <mode> [verbose]`, case-insensitive.
    pub fn command_regex(bot_username: &str) -> Regex {
        Regex::new(&format!(
            r"(?i)@{}\s+(\w+)(?:\s+(verbose))?",
            regex::escape(bot_username)
        ))
        .expect("command regex")
    }
}

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    action: Option<String>,
    repository: Option<RepositoryDto>,
    issue: Option<IssueDto>,
    pull_request: Option<PullRequestDto>,
    comment: Option<CommentDto>,
    sender: Option<UserDto>,
}

#[derive(Debug, Deserialize)]
struct RepositoryDto {
    name: String,
    full_name: String,
    owner: Option<UserDto>,
    #[serde(default)]
    private: bool,
}

#[derive(Debug, Deserialize)]
struct IssueDto {
    number: u64,
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PullRequestDto {
    number: u64,
    title: Option<String>,
    head: Option<BranchDto>,
}

#[derive(Debug, Deserialize)]
struct BranchDto {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct CommentDto {
    id: u64,
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserDto {
    login: String,
}

/// Forge event ingress. Verifies, parses the command, records a queued
/// Review and enqueues exactly one task; the review itself runs in the
/// worker process.
pub async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> (StatusCode, &'static str) {
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(&state.secret, &body, signature) {
        warn!("invalid webhook signature");
        return (StatusCode::UNAUTHORIZED, "invalid signature");
    }

    let event_type = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    debug!(event = %event_type, "received webhook event");

    if event_type != "issue_comment" && event_type != "pull_request_review_comment" {
        return (StatusCode::OK, "ignored");
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(err) => {
            error!(error = %err, "failed to parse webhook payload");
            return (StatusCode::BAD_REQUEST, "failed to parse event");
        }
    };

    if payload.action.as_deref() != Some("created") {
        return (StatusCode::OK, "ignored");
    }
    let (Some(repository), Some(comment)) = (&payload.repository, &payload.comment) else {
        return (StatusCode::OK, "ignored");
    };
    let comment_body = comment.body.clone().unwrap_or_default();
    let Some(command) = parse_command(&state.command_re, &comment_body) else {
        return (StatusCode::OK, "ignored");
    };

    // PR identity: issue comments only count when the issue is a PR.
    let (pr_number, mut commit_sha, pr_title) = match event_type.as_str() {
        "issue_comment" => match &payload.issue {
            Some(issue) if issue.pull_request.is_some() => {
                (issue.number, String::new(), String::new())
            }
            _ => return (StatusCode::OK, "ignored"),
        },
        _ => match &payload.pull_request {
            Some(pr) => (
                pr.number,
                pr.head.as_ref().map(|h| h.sha.clone()).unwrap_or_default(),
                pr.title.clone().unwrap_or_default(),
            ),
            None => return (StatusCode::OK, "ignored"),
        },
    };

    let owner = repository
        .owner
        .as_ref()
        .map(|o| o.login.clone())
        .unwrap_or_default();
    let repo = repository.name.clone();
    let sender_login = payload
        .sender
        .as_ref()
        .map(|s| s.login.clone())
        .unwrap_or_default();

    info!(
        repo = %repository.full_name,
        pr = pr_number,
        bot = %state.bot_username,
        command = %command.raw,
        mode = command.mode.as_str(),
        verbose = command.verbose,
        "parsed command from comment"
    );

    // Instant feedback on the triggering comment; failures are non-fatal.
    let reaction = tokio::time::timeout(
        REACTION_TIMEOUT,
        state.forge.add_reaction(&owner, &repo, comment.id, "eyes"),
    )
    .await;
    match reaction {
        Ok(Err(err)) => warn!(error = %err, "failed to add eyes reaction"),
        Err(_) => warn!("timed out adding eyes reaction"),
        Ok(Ok(())) => {}
    }

    if commit_sha.is_empty() {
        let lookup = tokio::time::timeout(
            PR_LOOKUP_TIMEOUT,
            state.forge.get_pull_request(&owner, &repo, pr_number),
        )
        .await;
        if let Ok(Ok(pr)) = lookup {
            commit_sha = pr.head_sha;
        }
    }

    // Fast in-process gate; the broker's task-id uniqueness is the durable
    // cross-process one.
    let dedup_key = request_key(&owner, &repo, pr_number, &commit_sha, command.mode);
    if let Some(dedup) = &state.dedup {
        let (is_duplicate, handle) = dedup.check_and_mark(&dedup_key);
        if is_duplicate {
            info!(key = %dedup_key, "duplicate request detected, skipping");
            if let Some(handle) = handle {
                handle.wait(DUPLICATE_WAIT).await;
            }
            return (StatusCode::ACCEPTED, "duplicate");
        }
    }

    if let Err(err) = state.store.upsert_repository(&RepositoryRecord {
        owner: owner.clone(),
        name: repo.clone(),
        full_name: repository.full_name.clone(),
        is_private: repository.private,
        is_active: true,
    }) {
        warn!(error = %err, "failed to upsert repository record");
    }

    let review_id = match state.store.create_review(&NewReview {
        owner: owner.clone(),
        repo: repo.clone(),
        pr_number,
        pr_title,
        commit_sha: commit_sha.clone(),
        mode: command.mode,
        requested_by: sender_login.clone(),
        queued_at: Utc::now(),
    }) {
        Ok(id) => {
            if let Err(err) = state.store.create_webhook_event(&WebhookEventRecord {
                event_type: event_type.clone(),
                owner: owner.clone(),
                repo: repo.clone(),
                pr_number,
                action: "created".to_string(),
                processed_at: Utc::now(),
                review_id: Some(id),
            }) {
                warn!(error = %err, "failed to record webhook event");
            }
            id
        }
        Err(err) => {
            warn!(error = %err, "failed to create review record");
            0
        }
    };

    let task = ReviewTask {
        event_type,
        action: "created".to_string(),
        owner,
        repo,
        pr_number,
        comment_id: comment.id,
        comment_body,
        sender_login,
        mode: command.mode,
        verbose: command.verbose,
        commit_sha,
        review_id,
    };
    let task_id = task.task_id();

    let submitted = state
        .broker
        .submit(&task, &task_id, state.task_max_retries)
        .await;
    let response = match submitted {
        Ok(SubmitOutcome::Enqueued) => {
            info!(task_id = %task_id, "review task enqueued");
            (StatusCode::ACCEPTED, "accepted")
        }
        Ok(SubmitOutcome::Duplicate) => {
            info!(task_id = %task_id, "duplicate review task ignored");
            finish_review(&state, review_id, ReviewStatus::Cancelled, "duplicate task");
            (StatusCode::ACCEPTED, "duplicate task")
        }
        Err(err) => {
            error!(error = %err, "failed to enqueue review task");
            finish_review(&state, review_id, ReviewStatus::Failed, &format!("{err:#}"));
            (StatusCode::ACCEPTED, "enqueue failed")
        }
    };

    if let Some(dedup) = &state.dedup {
        match response.1 {
            "enqueue failed" => dedup.fail(&dedup_key),
            _ => dedup.complete(&dedup_key),
        }
    }

    response
}

fn finish_review(state: &WebhookState, review_id: i64, status: ReviewStatus, message: &str) {
    if review_id <= 0 {
        return;
    }
    if let Err(err) = state.store.update_review(
        review_id,
        ReviewUpdate {
            status: Some(status),
            error_message: Some(message.to_string()),
            completed_at: Some(Utc::now()),
            duration_ms: Some(0),
            ..ReviewUpdate::default()
        },
    ) {
        warn!(error = %err, "failed to update review record");
    }
}

/// Constant-time HMAC-SHA256 check of `X-Hub-Signature-256: sha256=<hex>`.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Extracts an `@<bot> <mode> [verbose]` command from a comment body.
/// Unknown modes are logged and fall back to `review`.
pub fn parse_command(re: &Regex, body: &str) -> Option<Command> {
    let caps = re.captures(body)?;
    let mode_str = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    if !ReviewMode::is_known(mode_str) {
        warn!(mode = mode_str, "unknown review mode, defaulting to review");
    }
    let verbose = caps
        .get(2)
        .map(|m| m.as_str().eq_ignore_ascii_case("verbose"))
        .unwrap_or(false);
    Some(Command {
        mode: ReviewMode::parse_or_default(mode_str),
        verbose,
        raw: caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
    })
}

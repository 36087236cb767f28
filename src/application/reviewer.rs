use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::application::diff::{changed_line_numbers, parse_diff, truncate_diff};
use crate::application::formatter::{
    format_error_comment, format_review, parse_structured_review, truncate_for_github,
    GITHUB_COMMENT_LIMIT,
};
use crate::application::limiter::Limiter;
use crate::application::pr_context::ContextCollector;
use crate::application::prompts::{compose_prompt, PromptInput};
use crate::application::response_cache::ResponseCache;
use crate::application::retry::Retrier;
use crate::domain::entities::{
    InlineComment, PullRequestFile, ReviewCommentRecord, ReviewStatus, ReviewTask, ReviewUpdate,
};
use crate::domain::errors::{classify_error, is_cancelled, ErrorClass};
use crate::domain::ports::{ForgeRepository, ReviewEngine, ReviewStore};

/// Executes one dequeued review end to end: staleness check, PR data and
/// context gathering, rate-limited engine invocation under retry, structured
/// output parsing, inline posting with fallback, and lifecycle bookkeeping.
///
/// The return value is the broker contract: `Ok` for completed, stale,
/// cancelled and surfaced-fatal outcomes; `Err` only for retryable failures
/// the broker should re-deliver.
pub struct Reviewer {
    forge: Arc<dyn ForgeRepository>,
    engine: Arc<dyn ReviewEngine>,
    store: Arc<dyn ReviewStore>,
    limiter: Arc<Limiter>,
    cache: Option<Arc<ResponseCache>>,
    retrier: Retrier,
    max_diff_size: usize,
    bot_username: String,
}

impl Reviewer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        forge: Arc<dyn ForgeRepository>,
        engine: Arc<dyn ReviewEngine>,
        store: Arc<dyn ReviewStore>,
        limiter: Arc<Limiter>,
        cache: Option<Arc<ResponseCache>>,
        retrier: Retrier,
        max_diff_size: usize,
        bot_username: String,
    ) -> Self {
        Self {
            forge,
            engine,
            store,
            limiter,
            cache,
            retrier,
            max_diff_size,
            bot_username,
        }
    }

    pub async fn process(
        &self,
        cancel: &CancellationToken,
        task: &ReviewTask,
        final_attempt: bool,
    ) -> Result<()> {
        let process_start = Instant::now();
        info!(
            repo = %format!("{}/{}", task.owner, task.repo),
            pr = task.pr_number,
            mode = task.mode.as_str(),
            "processing review request"
        );

        self.update_review_warn(
            task.review_id,
            ReviewUpdate {
                status: Some(ReviewStatus::Processing),
                started_at: Some(Utc::now()),
                ..ReviewUpdate::default()
            },
        );

        if cancel.is_cancelled() {
            self.finish_cancelled(task, process_start, "cancelled before start");
            return Ok(());
        }

        let pr = match self
            .forge
            .get_pull_request(&task.owner, &task.repo, task.pr_number)
            .await
        {
            Ok(v) => v,
            Err(err) => {
                return self
                    .handle_failure(task, process_start, "Failed to fetch PR details", err, final_attempt)
                    .await;
            }
        };

        tracing::debug!(pr = pr.number, state = %pr.state, "fetched pull request");

        // A superseding push enqueues its own task; this one just steps aside.
        if !task.commit_sha.is_empty() && pr.head_sha != task.commit_sha {
            info!(
                expected_sha = %task.commit_sha,
                current_sha = %pr.head_sha,
                "skipping stale review task"
            );
            self.finish_cancelled(
                task,
                process_start,
                &format!(
                    "stale commit: expected {}, got {}",
                    task.commit_sha, pr.head_sha
                ),
            );
            return Ok(());
        }

        let diff = match self
            .forge
            .get_pull_request_diff(&task.owner, &task.repo, task.pr_number)
            .await
        {
            Ok(v) => v,
            Err(err) => {
                return self
                    .handle_failure(task, process_start, "Failed to fetch PR diff", err, final_attempt)
                    .await;
            }
        };
        let diff = if diff.len() > self.max_diff_size {
            warn!(
                original_size = diff.len(),
                max_size = self.max_diff_size,
                "diff exceeds max size, truncating"
            );
            truncate_diff(&diff, self.max_diff_size)
        } else {
            diff
        };

        // The diff itself already fetched fine, so a files-API failure can
        // degrade to deriving the file list from the diff instead.
        let files = match self
            .forge
            .list_pull_request_files(&task.owner, &task.repo, task.pr_number)
            .await
        {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "failed to list PR files, deriving from diff");
                parse_diff(&diff)
                    .into_iter()
                    .map(|f| PullRequestFile {
                        path: f.path,
                        status: f.status.as_str().to_string(),
                        additions: f.additions as u64,
                        deletions: f.deletions as u64,
                        patch: if f.patch.is_empty() { None } else { Some(f.patch) },
                    })
                    .collect()
            }
        };

        // Context failures are non-fatal: review without it.
        let context_block = match ContextCollector::gather(
            self.forge.as_ref(),
            &task.owner,
            &task.repo,
            task.pr_number,
        )
        .await
        {
            Ok(context) => context.build_context_block(),
            Err(err) => {
                warn!(error = %err, "failed to gather PR context, continuing without it");
                String::new()
            }
        };

        let prompt = compose_prompt(
            task.mode,
            &context_block,
            &PromptInput {
                owner: &task.owner,
                repo: &task.repo,
                pr_number: task.pr_number,
                pr_title: &pr.title,
                pr_body: &pr.body,
                diff: &diff,
                files: &files,
                verbose: task.verbose,
            },
        );

        let cached = self.cache.as_ref().and_then(|c| c.get(&prompt));
        let (review_text, retry_count) = match cached {
            Some(text) => {
                info!(
                    repo = %format!("{}/{}", task.owner, task.repo),
                    pr = task.pr_number,
                    "returning cached review response"
                );
                (text, 0)
            }
            None => {
                if let Err(err) = self.limiter.acquire(cancel).await {
                    return self
                        .handle_failure(task, process_start, "Rate limit wait cancelled", err, final_attempt)
                        .await;
                }
                let result = self
                    .retrier
                    .run(cancel, || self.engine.generate(&prompt, cancel))
                    .await;
                self.limiter.release();

                match result {
                    Ok((text, retries)) => {
                        if let Some(cache) = &self.cache {
                            cache.set(&prompt, &text);
                        }
                        (text, retries)
                    }
                    Err(err) => {
                        return self
                            .handle_failure(
                                task,
                                process_start,
                                "Failed to get review from engine",
                                err,
                                final_attempt,
                            )
                            .await;
                    }
                }
            }
        };

        let (summary, inline_comments) = parse_structured_review(&review_text);
        let inline_comments = anchor_comments_to_diff(inline_comments, &files);
        let bugs_found = inline_comments.len() as i64;
        let comments_posted;
        let mut inline_submitted = false;

        if inline_comments.is_empty() {
            let formatted = truncate_for_github(
                &format_review(&review_text, task.mode, &self.bot_username),
                GITHUB_COMMENT_LIMIT,
            );
            if let Err(err) = self
                .forge
                .create_issue_comment(&task.owner, &task.repo, task.pr_number, &formatted)
                .await
            {
                return self
                    .handle_failure(task, process_start, "Failed to post review", err, final_attempt)
                    .await;
            }
            comments_posted = 1;
        } else {
            let review_body = format_review(&summary, task.mode, &self.bot_username);
            match self
                .forge
                .submit_inline_review(
                    &task.owner,
                    &task.repo,
                    task.pr_number,
                    &pr.head_sha,
                    &review_body,
                    &inline_comments,
                )
                .await
            {
                Ok(()) => {
                    inline_submitted = true;
                    comments_posted = inline_comments.len() as i64;
                }
                Err(err) => {
                    warn!(error = %err, "failed to post inline review, falling back to regular comment");
                    let formatted = truncate_for_github(
                        &format_review(&review_text, task.mode, &self.bot_username),
                        GITHUB_COMMENT_LIMIT,
                    );
                    if let Err(err) = self
                        .forge
                        .create_issue_comment(&task.owner, &task.repo, task.pr_number, &formatted)
                        .await
                    {
                        return self
                            .handle_failure(task, process_start, "Failed to post review", err, final_attempt)
                            .await;
                    }
                    comments_posted = 1;
                }
            }
        }

        if inline_submitted && task.review_id > 0 {
            for comment in &inline_comments {
                let record = ReviewCommentRecord {
                    review_id: task.review_id,
                    file_path: comment.path.clone(),
                    line: comment.line,
                    severity: "info".to_string(),
                    category: task.mode.as_str().to_string(),
                    body: comment.body.clone(),
                };
                if let Err(err) = self.store.create_review_comment(&record) {
                    warn!(error = %err, "failed to persist review comment");
                }
            }
        }

        if let Err(err) = self
            .forge
            .add_reaction(&task.owner, &task.repo, task.comment_id, "rocket")
            .await
        {
            warn!(error = %err, "failed to add rocket reaction");
        }

        info!(
            repo = %format!("{}/{}", task.owner, task.repo),
            pr = task.pr_number,
            bugs_found,
            comments_posted,
            "review posted successfully"
        );

        self.update_review_warn(
            task.review_id,
            ReviewUpdate {
                status: Some(ReviewStatus::Completed),
                completed_at: Some(Utc::now()),
                duration_ms: Some(process_start.elapsed().as_millis() as i64),
                diff_size: Some(diff.len() as i64),
                files_changed: Some(files.len() as i64),
                bugs_found: Some(bugs_found),
                comments_posted: Some(comments_posted),
                review_body: Some(review_text),
                retry_count: Some(retry_count as i64),
                commit_sha: Some(pr.head_sha),
                ..ReviewUpdate::default()
            },
        );

        Ok(())
    }

    /// Failure disposition: cancellation is recorded silently; retryable
    /// errors go back to the broker unless this is the final delivery;
    /// everything else is surfaced on the PR and recorded as failed.
    async fn handle_failure(
        &self,
        task: &ReviewTask,
        process_start: Instant,
        message: &str,
        err: anyhow::Error,
        final_attempt: bool,
    ) -> Result<()> {
        if is_cancelled(&err) {
            self.finish_cancelled(task, process_start, &format!("{message}: cancelled"));
            return Ok(());
        }

        if classify_error(&err) == ErrorClass::Retryable && !final_attempt {
            return Err(err.context(message.to_string()));
        }

        error!(error = %err, message, "review processing failed");

        if let Err(reaction_err) = self
            .forge
            .add_reaction(&task.owner, &task.repo, task.comment_id, "confused")
            .await
        {
            warn!(error = %reaction_err, "failed to add confused reaction");
        }

        let comment = format_error_comment(message, &format!("{err:#}"));
        if let Err(post_err) = self
            .forge
            .create_issue_comment(&task.owner, &task.repo, task.pr_number, &comment)
            .await
        {
            error!(error = %post_err, "failed to post error comment");
        }

        self.update_review_warn(
            task.review_id,
            ReviewUpdate {
                status: Some(ReviewStatus::Failed),
                error_message: Some(format!("{message}: {err:#}")),
                completed_at: Some(Utc::now()),
                duration_ms: Some(process_start.elapsed().as_millis() as i64),
                ..ReviewUpdate::default()
            },
        );

        Ok(())
    }

    fn finish_cancelled(&self, task: &ReviewTask, process_start: Instant, message: &str) {
        self.update_review_warn(
            task.review_id,
            ReviewUpdate {
                status: Some(ReviewStatus::Cancelled),
                error_message: Some(message.to_string()),
                completed_at: Some(Utc::now()),
                duration_ms: Some(process_start.elapsed().as_millis() as i64),
                ..ReviewUpdate::default()
            },
        );
    }

    fn update_review_warn(&self, review_id: i64, update: ReviewUpdate) {
        if review_id <= 0 {
            return;
        }
        if let Err(err) = self.store.update_review(review_id, update) {
            warn!(review_id, error = %err, "failed to update review record");
        }
    }
}

/// Drops findings the forge would reject: comments on files outside the
/// diff, and comments on lines a file's patch never touched. Files whose
/// patch is unavailable (binary, oversized) are left unchecked.
fn anchor_comments_to_diff(
    comments: Vec<InlineComment>,
    files: &[PullRequestFile],
) -> Vec<InlineComment> {
    if comments.is_empty() || files.is_empty() {
        return comments;
    }

    let before = comments.len();
    let kept: Vec<InlineComment> = comments
        .into_iter()
        .filter(|comment| {
            let Some(file) = files.iter().find(|f| f.path == comment.path) else {
                return false;
            };
            match &file.patch {
                Some(patch) => changed_line_numbers(patch).contains(&comment.line),
                None => true,
            }
        })
        .collect();

    if kept.len() < before {
        warn!(
            dropped = before - kept.len(),
            "dropped inline findings not anchored to the diff"
        );
    }
    kept
}

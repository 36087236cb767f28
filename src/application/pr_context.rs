use anyhow::Result;
use tracing::{info, warn};

use crate::domain::entities::{CommentInfo, PullReviewInfo};
use crate::domain::ports::ForgeRepository;

const RECENT_COMMENTS_SHOWN: usize = 5;
const COMMENT_PREVIEW_LEN: usize = 100;

/// Contextual information about a PR gathered before reviewing, so the
/// engine can avoid repeating feedback that is already on the thread.
#[derive(Debug, Clone, Default)]
pub struct PrContext {
    pub existing_comments: Vec<ExistingComment>,
    pub previous_reviews: Vec<PreviousReview>,
    pub description: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExistingComment {
    pub author: String,
    pub path: String,
    pub line: u32,
    pub body: String,
    pub is_bot: bool,
}

#[derive(Debug, Clone)]
pub struct PreviousReview {
    pub author: String,
    pub state: String,
    pub bug_count: usize,
}

pub struct ContextCollector;

impl ContextCollector {
    /// Gathers PR description, labels, inline comments and prior reviews.
    /// Individual fetch failures degrade to an emptier context rather than
    /// failing the review.
    pub async fn gather(
        forge: &dyn ForgeRepository,
        owner: &str,
        repo: &str,
        pr_number: u64,
    ) -> Result<PrContext> {
        let mut context = PrContext::default();

        match forge.get_pull_request(owner, repo, pr_number).await {
            Ok(pr) => context.description = pr.body,
            Err(err) => warn!(error = %err, "failed to get PR details for context"),
        }

        match forge.list_labels(owner, repo, pr_number).await {
            Ok(labels) => context.labels = labels,
            Err(err) => warn!(error = %err, "failed to get labels for context"),
        }

        match forge.list_review_comments(owner, repo, pr_number).await {
            Ok(comments) => {
                context.existing_comments = comments.into_iter().map(classify_comment).collect();
            }
            Err(err) => warn!(error = %err, "failed to get review comments for context"),
        }

        match forge.list_reviews(owner, repo, pr_number).await {
            Ok(reviews) => {
                context.previous_reviews = reviews.into_iter().map(summarize_review).collect();
            }
            Err(err) => warn!(error = %err, "failed to get reviews for context"),
        }

        info!(
            existing_comments = context.existing_comments.len(),
            previous_reviews = context.previous_reviews.len(),
            labels = context.labels.len(),
            "gathered PR context for review"
        );

        Ok(context)
    }
}

fn classify_comment(comment: CommentInfo) -> ExistingComment {
    let is_bot =
        comment.author_type == "Bot" || comment.author.to_ascii_lowercase().contains("bot");
    ExistingComment {
        author: comment.author,
        path: comment.path,
        line: comment.line,
        body: comment.body,
        is_bot,
    }
}

fn summarize_review(review: PullReviewInfo) -> PreviousReview {
    let lower = review.body.to_ascii_lowercase();
    let bug_count =
        lower.matches("bug").count() + lower.matches("issue").count() + lower.matches("🐛").count();
    PreviousReview {
        author: review.author,
        state: review.state,
        bug_count,
    }
}

impl PrContext {
    /// Renders the context block slotted between system prompt and user
    /// message. Deterministic for a given context.
    pub fn build_context_block(&self) -> String {
        let mut out = String::new();

        out.push_str("\n\n## PR CONTEXT (Read this to avoid duplicates)\n\n");

        if !self.existing_comments.is_empty() {
            out.push_str("### Existing Comments\n");
            out.push_str(&format!(
                "There are {} existing comments on this PR. **DO NOT** repeat issues already mentioned:\n\n",
                self.existing_comments.len()
            ));

            let bot_comments = self.existing_comments.iter().filter(|c| c.is_bot).count();
            let human_comments = self.existing_comments.len() - bot_comments;
            out.push_str(&format!("- Bot comments: {bot_comments}\n"));
            out.push_str(&format!("- Human comments: {human_comments}\n\n"));

            out.push_str("Recent comments to be aware of:\n");
            for comment in self.existing_comments.iter().rev().take(RECENT_COMMENTS_SHOWN) {
                out.push_str(&format!(
                    "- [{}] {}:{} - {}\n",
                    comment.author,
                    comment.path,
                    comment.line,
                    truncate(&comment.body, COMMENT_PREVIEW_LEN)
                ));
            }
            out.push('\n');
        }

        if !self.previous_reviews.is_empty() {
            out.push_str("### Previous Reviews\n");
            let approvals = self
                .previous_reviews
                .iter()
                .filter(|r| r.state == "APPROVED")
                .count();
            let changes_requested = self
                .previous_reviews
                .iter()
                .filter(|r| r.state == "CHANGES_REQUESTED")
                .count();
            let total_bugs: usize = self.previous_reviews.iter().map(|r| r.bug_count).sum();

            out.push_str(&format!("- Approvals: {approvals}\n"));
            out.push_str(&format!("- Changes requested: {changes_requested}\n"));
            out.push_str(&format!(
                "- Estimated bugs mentioned in previous reviews: {total_bugs}\n\n"
            ));
        }

        if !self.labels.is_empty() {
            out.push_str("### PR Labels\n");
            out.push_str(&self.labels.join(", "));
            out.push_str("\n\n");
        }

        if !self.description.is_empty() {
            out.push_str("### PR Description (as stated by the author)\n");
            out.push_str(&truncate(&self.description, 500));
            out.push_str("\n\n");
        }

        out.push_str(
            "**IMPORTANT**: Focus on NEW issues not already mentioned in existing comments. Be context-aware!\n",
        );

        out
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{kept}...")
}

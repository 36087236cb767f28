use crate::domain::entities::{InlineComment, ReviewMode};

pub const GITHUB_COMMENT_LIMIT: usize = 65536;

/// Parses engine output into a leading summary and a list of inline
/// findings. The engine is instructed to emit blocks of:
///
/// ```text
/// FILE: path/to/file.rs:123
/// COMMENT: feedback body
/// ```
///
/// Text before the first `FILE:` marker is the summary. Paths containing
/// colons are tolerated by splitting on the last `:`. A `FILE:` line whose
/// line part is not an integer aborts the current block.
pub fn parse_structured_review(review: &str) -> (String, Vec<InlineComment>) {
    let mut summary = String::new();
    let mut comments = Vec::new();

    let mut current: Option<(String, u32)> = None;
    let mut body = String::new();
    let mut in_comment = false;

    let mut flush = |current: &mut Option<(String, u32)>, body: &mut String| {
        if let Some((path, line)) = current.take() {
            let trimmed = body.trim();
            if !trimmed.is_empty() {
                comments.push(InlineComment {
                    path,
                    line,
                    body: trimmed.to_string(),
                });
            }
        }
        body.clear();
    };

    for line in review.lines() {
        let trimmed = line.trim();

        if let Some(rest) = trimmed.strip_prefix("FILE:") {
            flush(&mut current, &mut body);
            current = parse_file_reference(rest);
            in_comment = false;
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("COMMENT:") {
            in_comment = true;
            let text = rest.trim();
            if !text.is_empty() {
                body.push_str(text);
                body.push('\n');
            }
            continue;
        }

        if in_comment && current.is_some() {
            body.push_str(line);
            body.push('\n');
        } else if !in_comment {
            summary.push_str(line);
            summary.push('\n');
        }
    }
    flush(&mut current, &mut body);

    (summary.trim().to_string(), comments)
}

/// Extracts `(path, line)` from the suffix of a `FILE:` marker, splitting on
/// the last colon so paths with colons survive.
fn parse_file_reference(rest: &str) -> Option<(String, u32)> {
    let rest = rest.trim();
    let colon = rest.rfind(':')?;
    let path = rest[..colon].trim();
    let line = rest[colon + 1..].trim().parse::<u32>().ok()?;
    if path.is_empty() {
        return None;
    }
    Some((path.to_string(), line))
}

/// Wraps raw engine output in the bot's comment frame for a given mode.
pub fn format_review(review: &str, mode: ReviewMode, bot_username: &str) -> String {
    format!(
        "## {} Magpie {}\n\n{}\n\n---\n<sub>🤖 Powered by Magpie | Triggered by `@{} {}`</sub>",
        mode.emoji(),
        mode.description(),
        review,
        bot_username,
        mode.as_str()
    )
}

pub fn format_error_comment(message: &str, err: &str) -> String {
    format!(
        "❌ **Magpie Error**\n\n{message}: {err}\n\nPlease try again or check the bot logs."
    )
}

/// Truncates a comment body to GitHub's size limit, breaking at a line
/// boundary near the cut when one is close enough.
pub fn truncate_for_github(content: &str, max_length: usize) -> String {
    let max_length = if max_length == 0 {
        GITHUB_COMMENT_LIMIT
    } else {
        max_length
    };
    if content.len() <= max_length {
        return content.to_string();
    }

    let mut cut = max_length.saturating_sub(100);
    while cut > 0 && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let window_floor = cut.saturating_sub(500);
    if let Some(pos) = content[..cut].rfind('\n') {
        if pos > window_floor {
            cut = pos;
        }
    }

    format!(
        "{}\n\n---\n⚠️ *Review truncated due to length. Some findings may not be shown.*",
        &content[..cut]
    )
}

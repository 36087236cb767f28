use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::errors::DomainError;
use crate::domain::ports::ReviewEngine;

/// Runs the review engine as a one-shot CLI subprocess: prompt in as the
/// final argument, review text out on stdout. stderr from failed runs is
/// classified so the retry layer can tell transient saturation from real
/// errors.
pub struct CliReviewEngine {
    program: String,
    base_args: Vec<String>,
}

impl CliReviewEngine {
    pub fn new(program: impl Into<String>, model: Option<String>) -> Self {
        let program = program.into();
        let mut base_args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "text".to_string(),
        ];
        if let Some(model) = model {
            base_args.push("--model".to_string());
            base_args.push(model);
        }
        Self {
            program: if program.is_empty() {
                "claude".to_string()
            } else {
                program
            },
            base_args,
        }
    }

    #[cfg(test)]
    fn with_base_args(program: &str, base_args: Vec<String>) -> Self {
        Self {
            program: program.to_string(),
            base_args,
        }
    }
}

#[async_trait]
impl ReviewEngine for CliReviewEngine {
    async fn generate(&self, prompt: &str, cancel: &CancellationToken) -> Result<String> {
        debug!(
            program = %self.program,
            prompt_len = prompt.len(),
            "executing review engine"
        );

        let mut child = Command::new(&self.program)
            .args(&self.base_args)
            .arg(prompt)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to execute review engine: {}", self.program))?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(DomainError::Cancelled.into());
            }
        };

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        if let Some(ref mut out) = stdout {
            let _ = out.read_to_end(&mut stdout_buf).await;
        }
        if let Some(ref mut err) = stderr {
            let _ = err.read_to_end(&mut stderr_buf).await;
        }

        if !status.success() {
            let stderr_text = String::from_utf8_lossy(&stderr_buf).to_string();
            return Err(classify_engine_failure(&stderr_text));
        }

        let response = String::from_utf8_lossy(&stdout_buf).trim().to_string();
        debug!(response_len = response.len(), "received engine response");
        Ok(response)
    }
}

/// Maps a failed run's stderr onto the retry taxonomy: rate-limit and 5xx
/// indicators become typed retryable errors, everything else surfaces as-is.
fn classify_engine_failure(stderr: &str) -> anyhow::Error {
    let lower = stderr.to_ascii_lowercase();

    if ["429", "rate limit", "too many requests", "overloaded"]
        .iter()
        .any(|h| lower.contains(h))
    {
        return DomainError::RateLimited(stderr.trim().to_string()).into();
    }

    if ["500", "502", "503", "504"].iter().any(|h| lower.contains(h)) {
        return DomainError::ServerError(stderr.trim().to_string()).into();
    }

    anyhow::anyhow!("review engine error: {}", stderr.trim())
}

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::domain::entities::{
    NewReview, RepositoryRecord, ReviewCommentRecord, ReviewUpdate, WebhookEventRecord,
};
use crate::domain::ports::ReviewStore;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS repositories (
    id          INTEGER PRIMARY KEY,
    owner       TEXT NOT NULL,
    name        TEXT NOT NULL,
    full_name   TEXT NOT NULL,
    is_private  INTEGER NOT NULL DEFAULT 0,
    is_active   INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    UNIQUE(owner, name)
);

CREATE TABLE IF NOT EXISTS reviews (
    id              INTEGER PRIMARY KEY,
    owner           TEXT NOT NULL,
    repo            TEXT NOT NULL,
    pr_number       INTEGER NOT NULL,
    pr_title        TEXT NOT NULL DEFAULT '',
    commit_sha      TEXT NOT NULL DEFAULT '',
    mode            TEXT NOT NULL,
    status          TEXT NOT NULL,
    bugs_found      INTEGER NOT NULL DEFAULT 0,
    comments_posted INTEGER NOT NULL DEFAULT 0,
    review_body     TEXT,
    queued_at       TEXT NOT NULL,
    started_at      TEXT,
    completed_at    TEXT,
    duration_ms     INTEGER NOT NULL DEFAULT 0,
    diff_size       INTEGER NOT NULL DEFAULT 0,
    files_changed   INTEGER NOT NULL DEFAULT 0,
    error_message   TEXT,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    requested_by    TEXT NOT NULL DEFAULT '',
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_reviews_repo_pr ON reviews(owner, repo, pr_number);
CREATE INDEX IF NOT EXISTS idx_reviews_status ON reviews(status);
CREATE INDEX IF NOT EXISTS idx_reviews_mode ON reviews(mode);

CREATE TABLE IF NOT EXISTS review_comments (
    id          INTEGER PRIMARY KEY,
    review_id   INTEGER NOT NULL,
    file_path   TEXT NOT NULL,
    line        INTEGER NOT NULL,
    severity    TEXT NOT NULL DEFAULT '',
    category    TEXT NOT NULL DEFAULT '',
    body        TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_review_comments_review ON review_comments(review_id);

CREATE TABLE IF NOT EXISTS webhook_events (
    id           INTEGER PRIMARY KEY,
    event_type   TEXT NOT NULL,
    owner        TEXT NOT NULL,
    repo         TEXT NOT NULL,
    pr_number    INTEGER NOT NULL,
    action       TEXT NOT NULL,
    processed_at TEXT,
    review_id    INTEGER,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_webhook_events_review ON webhook_events(review_id);
"#;

/// Review lifecycle store over SQLite. The connection is serialized behind a
/// mutex; individual statements are short enough that callers treat the
/// store as non-blocking.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .with_context(|| format!("failed to open database at {}", path.as_ref().display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("failed to apply schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn now() -> String {
        Utc::now().to_rfc3339()
    }

    fn fmt(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339()
    }
}

impl ReviewStore for SqliteStore {
    fn upsert_repository(&self, repo: &RepositoryRecord) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "INSERT INTO repositories (owner, name, full_name, is_private, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(owner, name) DO UPDATE SET
                 full_name = excluded.full_name,
                 is_private = excluded.is_private,
                 is_active = excluded.is_active,
                 updated_at = excluded.updated_at",
            params![
                repo.owner,
                repo.name,
                repo.full_name,
                repo.is_private,
                repo.is_active,
                Self::now(),
            ],
        )?;
        Ok(())
    }

    fn create_webhook_event(&self, event: &WebhookEventRecord) -> Result<i64> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "INSERT INTO webhook_events (event_type, owner, repo, pr_number, action, processed_at, review_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.event_type,
                event.owner,
                event.repo,
                event.pr_number as i64,
                event.action,
                Self::fmt(event.processed_at),
                event.review_id,
                Self::now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn create_review(&self, review: &NewReview) -> Result<i64> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "INSERT INTO reviews (owner, repo, pr_number, pr_title, commit_sha, mode, status, queued_at, requested_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, ?8, ?9, ?9)",
            params![
                review.owner,
                review.repo,
                review.pr_number as i64,
                review.pr_title,
                review.commit_sha,
                review.mode.as_str(),
                Self::fmt(review.queued_at),
                review.requested_by,
                Self::now(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn update_review(&self, id: i64, update: ReviewUpdate) -> Result<()> {
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        let mut push = |column: &str, value: Box<dyn rusqlite::ToSql>, sets: &mut Vec<String>| {
            values.push(value);
            sets.push(format!("{column} = ?{}", values.len()));
        };

        if let Some(status) = update.status {
            push("status", Box::new(status.as_str().to_string()), &mut sets);
        }
        if let Some(ts) = update.started_at {
            push("started_at", Box::new(Self::fmt(ts)), &mut sets);
        }
        if let Some(ts) = update.completed_at {
            push("completed_at", Box::new(Self::fmt(ts)), &mut sets);
        }
        if let Some(v) = update.duration_ms {
            push("duration_ms", Box::new(v), &mut sets);
        }
        if let Some(v) = update.diff_size {
            push("diff_size", Box::new(v), &mut sets);
        }
        if let Some(v) = update.files_changed {
            push("files_changed", Box::new(v), &mut sets);
        }
        if let Some(v) = update.bugs_found {
            push("bugs_found", Box::new(v), &mut sets);
        }
        if let Some(v) = update.comments_posted {
            push("comments_posted", Box::new(v), &mut sets);
        }
        if let Some(v) = update.review_body {
            push("review_body", Box::new(v), &mut sets);
        }
        if let Some(v) = update.error_message {
            push("error_message", Box::new(v), &mut sets);
        }
        if let Some(v) = update.retry_count {
            push("retry_count", Box::new(v), &mut sets);
        }
        if let Some(v) = update.commit_sha {
            push("commit_sha", Box::new(v), &mut sets);
        }

        if sets.is_empty() {
            return Ok(());
        }

        values.push(Box::new(Self::now()));
        sets.push(format!("updated_at = ?{}", values.len()));
        values.push(Box::new(id));

        let sql = format!(
            "UPDATE reviews SET {} WHERE id = ?{}",
            sets.join(", "),
            values.len()
        );
        let conn = self.conn.lock().expect("store connection poisoned");
        let params = rusqlite::params_from_iter(values.iter().map(|v| v.as_ref()));
        conn.execute(&sql, params)?;
        Ok(())
    }

    fn create_review_comment(&self, comment: &ReviewCommentRecord) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.execute(
            "INSERT INTO review_comments (review_id, file_path, line, severity, category, body, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                comment.review_id,
                comment.file_path,
                comment.line,
                comment.severity,
                comment.category,
                comment.body,
                Self::now(),
            ],
        )?;
        Ok(())
    }

    fn count_reviews_by_status(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().expect("store connection poisoned");
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM reviews GROUP BY status ORDER BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn ping(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store connection poisoned");
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

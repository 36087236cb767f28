use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::application::dedup::Deduplicator;
use crate::application::limiter::Limiter;
use crate::application::response_cache::ResponseCache;
use crate::domain::ports::{ReviewStore, TaskBroker};
use crate::interface::webhook::{handle_webhook, WebhookState};

/// Shared state for the ingress process's HTTP surface.
pub struct AppState {
    pub bot_username: String,
    pub model: String,
    pub store: Arc<dyn ReviewStore>,
    pub broker: Arc<dyn TaskBroker>,
    pub limiter: Arc<Limiter>,
    pub cache: Option<Arc<ResponseCache>>,
    pub dedup: Option<Arc<Deduplicator>>,
}

pub fn build_router(state: Arc<AppState>, webhook: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/", get(info_handler))
        .route("/webhook", post(handle_webhook).with_state(webhook))
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

pub async fn run_web_server(
    addr: &str,
    state: Arc<AppState>,
    webhook: Arc<WebhookState>,
    cancel: CancellationToken,
) -> Result<()> {
    let app = build_router(state, webhook);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("http server failed")?;
    Ok(())
}

async fn info_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let bot = &state.bot_username;
    Json(json!({
        "name": "Magpie",
        "description": "AI-powered code review bot",
        "commands": [
            format!("@{bot} review - Standard code review"),
            format!("@{bot} hunt - Quick bug detection"),
            format!("@{bot} security - Security-focused analysis"),
            format!("@{bot} performance - Performance optimization"),
            format!("@{bot} analyze - Deep technical analysis"),
        ],
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "bot": state.bot_username,
        "model": state.model,
        "time": Utc::now(),
    }))
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    checks.insert(
        "database",
        match state.store.ping() {
            Ok(()) => "ok".to_string(),
            Err(err) => format!("error: {err:#}"),
        },
    );
    checks.insert(
        "redis",
        match state.broker.ping().await {
            Ok(()) => "ok".to_string(),
            Err(err) => format!("error: {err:#}"),
        },
    );

    let all_ok = checks.values().all(|v| v == "ok");
    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = Json(json!({
        "status": if all_ok { "ready" } else { "unavailable" },
        "checks": checks,
    }));
    (status, body)
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let queue = state.broker.queue_stats().await.ok();
    let reviews: BTreeMap<String, i64> = state
        .store
        .count_reviews_by_status()
        .unwrap_or_default()
        .into_iter()
        .collect();

    Json(json!({
        "queue": queue,
        "limiter": state.limiter.stats(),
        "cache": state.cache.as_ref().map(|c| c.stats()),
        "dedup": state.dedup.as_ref().map(|d| d.stats()),
        "reviews": reviews,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::{
        NewReview, RepositoryRecord, ReviewCommentRecord, ReviewTask, ReviewUpdate,
        WebhookEventRecord,
    };
    use crate::domain::ports::{LeasedTask, NackOutcome, QueueStats, SubmitOutcome};
    use async_trait::async_trait;
    use std::time::Duration;

    struct StubStore {
        healthy: bool,
    }

    impl ReviewStore for StubStore {
        fn upsert_repository(&self, _: &RepositoryRecord) -> Result<()> {
            Ok(())
        }
        fn create_webhook_event(&self, _: &WebhookEventRecord) -> Result<i64> {
            Ok(1)
        }
        fn create_review(&self, _: &NewReview) -> Result<i64> {
            Ok(1)
        }
        fn update_review(&self, _: i64, _: ReviewUpdate) -> Result<()> {
            Ok(())
        }
        fn create_review_comment(&self, _: &ReviewCommentRecord) -> Result<()> {
            Ok(())
        }
        fn count_reviews_by_status(&self) -> Result<Vec<(String, i64)>> {
            Ok(vec![("completed".to_string(), 3), ("queued".to_string(), 1)])
        }
        fn ping(&self) -> Result<()> {
            if self.healthy {
                Ok(())
            } else {
                anyhow::bail!("database unreachable")
            }
        }
    }

    struct StubBroker {
        healthy: bool,
    }

    #[async_trait]
    impl TaskBroker for StubBroker {
        async fn submit(&self, _: &ReviewTask, _: &str, _: u32) -> Result<SubmitOutcome> {
            Ok(SubmitOutcome::Enqueued)
        }
        async fn lease(&self, _: Duration) -> Result<Option<LeasedTask>> {
            Ok(None)
        }
        async fn ack(&self, _: &LeasedTask) -> Result<()> {
            Ok(())
        }
        async fn nack(&self, _: &LeasedTask) -> Result<NackOutcome> {
            Ok(NackOutcome::DeadLettered)
        }
        async fn schedule_due(&self) -> Result<u64> {
            Ok(0)
        }
        async fn requeue_orphans(&self) -> Result<u64> {
            Ok(0)
        }
        async fn queue_stats(&self) -> Result<QueueStats> {
            Ok(QueueStats {
                pending: 2,
                active: 1,
                delayed: 0,
                dead: 0,
            })
        }
        async fn ping(&self) -> Result<()> {
            if self.healthy {
                Ok(())
            } else {
                anyhow::bail!("redis unreachable")
            }
        }
    }

    fn state(store_healthy: bool, broker_healthy: bool) -> Arc<AppState> {
        Arc::new(AppState {
            bot_username: "magpie".to_string(),
            model: "default".to_string(),
            store: Arc::new(StubStore {
                healthy: store_healthy,
            }),
            broker: Arc::new(StubBroker {
                healthy: broker_healthy,
            }),
            limiter: Arc::new(Limiter::new(2, Duration::from_secs(30))),
            cache: Some(Arc::new(ResponseCache::new(10, Duration::from_secs(60)))),
            dedup: Some(Arc::new(Deduplicator::new(Duration::from_secs(60)))),
        })
    }

    #[tokio::test]
    async fn ready_reports_ok_when_dependencies_are_up() {
        let response = ready_handler(State(state(true, true))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_reports_unavailable_when_redis_is_down() {
        let response = ready_handler(State(state(true, false)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn ready_reports_unavailable_when_database_is_down() {
        let response = ready_handler(State(state(false, true)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn health_is_always_ok() {
        let response = health_handler(State(state(false, false)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn stats_aggregates_all_counters() {
        let response = stats_handler(State(state(true, true))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(value["queue"]["pending"], 2);
        assert_eq!(value["limiter"]["max_tokens"], 2);
        assert_eq!(value["reviews"]["completed"], 3);
        assert!(value["cache"].is_object());
        assert!(value["dedup"].is_object());
    }
}

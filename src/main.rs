mod application;
mod domain;
mod infrastructure;
mod interface;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use application::dedup::Deduplicator;
use application::limiter::Limiter;
use application::response_cache::ResponseCache;
use application::retry::{Retrier, RetryPolicy};
use application::reviewer::Reviewer;
use application::worker::run_worker_pool;
use domain::entities::AppConfig;
use domain::ports::{ForgeRepository, ReviewStore, TaskBroker};
use infrastructure::broker_adapter::RedisBroker;
use infrastructure::engine_adapter::CliReviewEngine;
use infrastructure::env_config;
use infrastructure::github_adapter::OctocrabForge;
use infrastructure::store_adapter::SqliteStore;
use interface::cli::{Cli, Commands};
use interface::web::{run_web_server, AppState};
use interface::webhook::WebhookState;

const FORGE_API_CONCURRENCY: usize = 8;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = env_config::load()?;

    match cli.command {
        Commands::Serve { addr } => run_serve(config, addr).await,
        Commands::Work { concurrency } => run_work(config, concurrency).await,
        Commands::Check => run_check(config).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn shutdown_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            trigger.cancel();
        }
    });
    cancel
}

fn build_forge(config: &AppConfig) -> Result<Arc<dyn ForgeRepository>> {
    let private_key = std::fs::read_to_string(&config.github_private_key_path)
        .with_context(|| {
            format!(
                "failed to read GitHub private key from {}",
                config.github_private_key_path
            )
        })?;
    Ok(Arc::new(OctocrabForge::new(
        config.github_app_id,
        &private_key,
        FORGE_API_CONCURRENCY,
    )?))
}

fn build_cache(config: &AppConfig) -> Option<Arc<ResponseCache>> {
    if !config.cache_enabled {
        return None;
    }
    let cache = Arc::new(ResponseCache::new(
        config.cache_max_size,
        Duration::from_secs(config.cache_ttl_min * 60),
    ));
    let _sweeper = cache.spawn_sweeper();
    Some(cache)
}

async fn run_serve(config: AppConfig, addr_override: Option<String>) -> Result<()> {
    let forge = build_forge(&config)?;
    let store: Arc<dyn ReviewStore> = Arc::new(SqliteStore::open(&config.database_path)?);
    let broker: Arc<dyn TaskBroker> =
        Arc::new(RedisBroker::connect(&config.redis_url, &config.queue_name).await?);

    let dedup = if config.dedup_enabled {
        let dedup = Arc::new(Deduplicator::new(Duration::from_secs(
            config.dedup_ttl_min * 60,
        )));
        let _sweeper = dedup.spawn_sweeper();
        Some(dedup)
    } else {
        None
    };

    let limiter = Arc::new(Limiter::new(
        config.rate_limit_max_tokens,
        Duration::from_secs(config.rate_limit_refill_sec),
    ));
    let cache = build_cache(&config);

    let webhook = Arc::new(WebhookState {
        secret: config.webhook_secret.clone(),
        bot_username: config.bot_username.clone(),
        command_re: WebhookState::command_regex(&config.bot_username),
        forge,
        store: store.clone(),
        broker: broker.clone(),
        dedup: dedup.clone(),
        task_max_retries: config.task_max_retries,
    });
    let state = Arc::new(AppState {
        bot_username: config.bot_username.clone(),
        model: config
            .engine_model
            .clone()
            .unwrap_or_else(|| "default".to_string()),
        store,
        broker,
        limiter,
        cache,
        dedup,
    });

    let addr = addr_override.unwrap_or_else(|| config.http_addr.clone());
    info!(
        addr = %addr,
        bot_username = %config.bot_username,
        queue = %config.queue_name,
        dedup_enabled = config.dedup_enabled,
        cache_enabled = config.cache_enabled,
        "magpie ingress starting"
    );

    run_web_server(&addr, state, webhook, shutdown_token()).await
}

async fn run_work(config: AppConfig, concurrency_override: Option<usize>) -> Result<()> {
    let forge = build_forge(&config)?;
    let store: Arc<dyn ReviewStore> = Arc::new(SqliteStore::open(&config.database_path)?);
    let broker: Arc<dyn TaskBroker> =
        Arc::new(RedisBroker::connect(&config.redis_url, &config.queue_name).await?);
    let engine = Arc::new(CliReviewEngine::new(
        config.engine_path.clone(),
        config.engine_model.clone(),
    ));

    let limiter = Arc::new(Limiter::new(
        config.rate_limit_max_tokens,
        Duration::from_secs(config.rate_limit_refill_sec),
    ));
    let cache = build_cache(&config);
    let retrier = Retrier::new(RetryPolicy {
        max_retries: config.retry_max_attempts,
        initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
        max_delay: Duration::from_millis(config.retry_max_delay_ms),
        multiplier: 2.0,
        jitter_fraction: 0.3,
    });

    let reviewer = Arc::new(Reviewer::new(
        forge,
        engine,
        store,
        limiter,
        cache,
        retrier,
        config.max_diff_size,
        config.bot_username.clone(),
    ));

    let concurrency = concurrency_override.unwrap_or(config.concurrency);
    info!(
        concurrency,
        queue = %config.queue_name,
        rate_limit_tokens = config.rate_limit_max_tokens,
        rate_limit_refill_sec = config.rate_limit_refill_sec,
        cache_enabled = config.cache_enabled,
        retry_max_attempts = config.retry_max_attempts,
        "magpie worker starting"
    );

    run_worker_pool(broker, reviewer, concurrency, shutdown_token()).await
}

async fn run_check(config: AppConfig) -> Result<()> {
    println!("bot username:      {}", config.bot_username);
    println!("engine:            {}", config.engine_path);
    println!(
        "model:             {}",
        config.engine_model.as_deref().unwrap_or("(default)")
    );
    println!("queue:             {}", config.queue_name);
    println!("database:          {}", config.database_path);
    println!("redis:             {}", config.redis_url);
    println!("max diff size:     {}", config.max_diff_size);
    println!("concurrency:       {}", config.concurrency);

    let store = SqliteStore::open(&config.database_path)?;
    match store.ping() {
        Ok(()) => println!("database check:    ok"),
        Err(err) => println!("database check:    failed ({err:#})"),
    }

    match RedisBroker::connect(&config.redis_url, &config.queue_name).await {
        Ok(broker) => match broker.ping().await {
            Ok(()) => {
                let stats = broker.queue_stats().await?;
                println!(
                    "redis check:       ok (pending={}, active={}, delayed={}, dead={})",
                    stats.pending, stats.active, stats.delayed, stats.dead
                );
            }
            Err(err) => println!("redis check:       failed ({err:#})"),
        },
        Err(err) => println!("redis check:       failed ({err:#})"),
    }

    Ok(())
}

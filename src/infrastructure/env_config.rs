use std::env;

use anyhow::{bail, Context, Result};

use crate::domain::entities::AppConfig;

/// Loads configuration from `MAGPIE_*` environment variables. Only the
/// webhook secret and GitHub App credentials are required; everything else
/// has serviceable defaults.
pub fn load() -> Result<AppConfig> {
    load_from(|key| env::var(key).ok())
}

pub fn load_from(get: impl Fn(&str) -> Option<String>) -> Result<AppConfig> {
    let webhook_secret = match get("MAGPIE_WEBHOOK_SECRET") {
        Some(v) if !v.is_empty() => v,
        _ => bail!("MAGPIE_WEBHOOK_SECRET is required"),
    };
    let github_app_id = match get("MAGPIE_GITHUB_APP_ID") {
        Some(v) => v
            .parse::<u64>()
            .context("invalid MAGPIE_GITHUB_APP_ID")?,
        None => bail!("MAGPIE_GITHUB_APP_ID is required"),
    };
    let github_private_key_path = match get("MAGPIE_GITHUB_PRIVATE_KEY_PATH") {
        Some(v) if !v.is_empty() => v,
        _ => bail!("MAGPIE_GITHUB_PRIVATE_KEY_PATH is required"),
    };

    Ok(AppConfig {
        bot_username: str_or(&get, "MAGPIE_BOT_USERNAME", "magpie"),
        engine_path: str_or(&get, "MAGPIE_ENGINE_PATH", "claude"),
        engine_model: get("MAGPIE_MODEL").filter(|v| !v.is_empty()),
        max_diff_size: num_or(&get, "MAGPIE_MAX_DIFF_SIZE", 100_000)?,
        http_addr: str_or(&get, "MAGPIE_HTTP_ADDR", "0.0.0.0:8080"),
        webhook_secret,
        github_app_id,
        github_private_key_path,
        database_path: str_or(&get, "MAGPIE_DATABASE_PATH", "magpie.db"),
        redis_url: str_or(&get, "MAGPIE_REDIS_URL", "redis://127.0.0.1:6379"),
        queue_name: str_or(&get, "MAGPIE_QUEUE", "reviews"),
        concurrency: num_or(&get, "MAGPIE_CONCURRENCY", 4)?,
        task_max_retries: num_or(&get, "MAGPIE_TASK_MAX_RETRIES", 3)?,
        rate_limit_max_tokens: num_or(&get, "MAGPIE_RATE_LIMIT_MAX_TOKENS", 2)?,
        rate_limit_refill_sec: num_or(&get, "MAGPIE_RATE_LIMIT_REFILL_SEC", 30)?,
        retry_max_attempts: num_or(&get, "MAGPIE_RETRY_MAX_ATTEMPTS", 5)?,
        retry_initial_delay_ms: num_or(&get, "MAGPIE_RETRY_INITIAL_DELAY_MS", 1000)?,
        retry_max_delay_ms: num_or(&get, "MAGPIE_RETRY_MAX_DELAY_MS", 60_000)?,
        cache_enabled: bool_or(&get, "MAGPIE_CACHE_ENABLED", true)?,
        cache_max_size: num_or(&get, "MAGPIE_CACHE_MAX_SIZE", 1000)?,
        cache_ttl_min: num_or(&get, "MAGPIE_CACHE_TTL_MIN", 30)?,
        dedup_enabled: bool_or(&get, "MAGPIE_DEDUP_ENABLED", true)?,
        dedup_ttl_min: num_or(&get, "MAGPIE_DEDUP_TTL_MIN", 5)?,
    })
}

fn str_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    match get(key) {
        Some(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn num_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match get(key) {
        Some(v) if !v.is_empty() => v.parse::<T>().with_context(|| format!("invalid {key}")),
        _ => Ok(default),
    }
}

fn bool_or(get: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match get(key).as_deref() {
        None | Some("") => Ok(default),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some("false") | Some("0") | Some("no") => Ok(false),
        Some(other) => bail!("invalid {key}: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<String, String> {
        HashMap::from([
            ("MAGPIE_WEBHOOK_SECRET".to_string(), "s3cret".to_string()),
            ("MAGPIE_GITHUB_APP_ID".to_string(), "12345".to_string()),
            (
                "MAGPIE_GITHUB_PRIVATE_KEY_PATH".to_string(),
                "/app/key.pem".to_string(),
            ),
        ])
    }

    fn load_map(map: &HashMap<String, String>) -> Result<AppConfig> {
        load_from(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_fill_in_around_required_keys() {
        let cfg = load_map(&base_env()).expect("load");
        assert_eq!(cfg.bot_username, "magpie");
        assert_eq!(cfg.max_diff_size, 100_000);
        assert_eq!(cfg.queue_name, "reviews");
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.rate_limit_max_tokens, 2);
        assert!(cfg.cache_enabled);
        assert!(cfg.dedup_enabled);
        assert!(cfg.engine_model.is_none());
    }

    #[test]
    fn missing_secret_is_a_hard_error() {
        let mut env = base_env();
        env.remove("MAGPIE_WEBHOOK_SECRET");
        let err = load_map(&env).err().expect("error");
        assert!(err.to_string().contains("MAGPIE_WEBHOOK_SECRET"));
    }

    #[test]
    fn invalid_app_id_is_rejected() {
        let mut env = base_env();
        env.insert("MAGPIE_GITHUB_APP_ID".to_string(), "not-a-number".to_string());
        assert!(load_map(&env).is_err());
    }

    #[test]
    fn overrides_are_honored() {
        let mut env = base_env();
        env.insert("MAGPIE_BOT_USERNAME".to_string(), "reviewbot".to_string());
        env.insert("MAGPIE_CONCURRENCY".to_string(), "8".to_string());
        env.insert("MAGPIE_CACHE_ENABLED".to_string(), "false".to_string());
        env.insert("MAGPIE_MODEL".to_string(), "sonnet".to_string());
        let cfg = load_map(&env).expect("load");
        assert_eq!(cfg.bot_username, "reviewbot");
        assert_eq!(cfg.concurrency, 8);
        assert!(!cfg.cache_enabled);
        assert_eq!(cfg.engine_model.as_deref(), Some("sonnet"));
    }

    #[test]
    fn garbage_bool_is_rejected() {
        let mut env = base_env();
        env.insert("MAGPIE_DEDUP_ENABLED".to_string(), "maybe".to_string());
        assert!(load_map(&env).is_err());
    }
}

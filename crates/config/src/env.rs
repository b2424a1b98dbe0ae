use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use paysync_common::error::{PaysyncError, PaysyncResult};
use paysync_common::EntityKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Bearer,
    Basic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Linear,
    Exponential,
}

/// Connection settings for the payment platform API.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    pub api_token: String,
    pub api_user: String,
    pub auth_mode: AuthMode,
    pub page_size: u32,
    pub sort: SortOrder,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    pub rate_limit_cooldown: Duration,
    pub max_rate_limit_waits: u32,
    pub consecutive_error_threshold: u32,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub source: SourceConfig,
    pub retry: RetryConfig,
    pub entities: Vec<EntityKind>,
    pub write_batch_size: usize,
    pub batch_pause: Duration,
    pub page_pause: Duration,
    pub checkpoint_path: PathBuf,
    pub checkpoint_interval_pages: u32,
    pub max_pages_per_window: u32,
    pub pagination_ceiling: u64,
    /// Raw backfill bounds; resolved to instants by the ingest service.
    pub backfill_start: Option<String>,
    pub backfill_end: Option<String>,
}

impl SyncConfig {
    /// Load configuration from environment variables.
    /// Loads `.env` file if present, then reads required vars.
    pub fn from_env() -> PaysyncResult<Self> {
        // Best-effort .env load; ignore if missing
        let _ = dotenvy::dotenv();

        let auth_mode = match get_var_or("PAYSYNC_AUTH_MODE", "bearer").to_lowercase().as_str() {
            "bearer" => AuthMode::Bearer,
            "basic" => AuthMode::Basic,
            other => {
                return Err(PaysyncError::Config(format!(
                    "invalid PAYSYNC_AUTH_MODE: {other} (expected bearer or basic)"
                )))
            }
        };
        let sort = match get_var_or("PAYSYNC_SORT", "asc").to_lowercase().as_str() {
            "asc" => SortOrder::Asc,
            "desc" => SortOrder::Desc,
            other => {
                return Err(PaysyncError::Config(format!(
                    "invalid PAYSYNC_SORT: {other} (expected asc or desc)"
                )))
            }
        };
        let backoff = match get_var_or("PAYSYNC_BACKOFF", "exponential").to_lowercase().as_str() {
            "linear" => Backoff::Linear,
            "exponential" => Backoff::Exponential,
            other => {
                return Err(PaysyncError::Config(format!(
                    "invalid PAYSYNC_BACKOFF: {other} (expected linear or exponential)"
                )))
            }
        };

        let source = SourceConfig {
            base_url: get_var("PAYSYNC_API_BASE_URL")?
                .trim_end_matches('/')
                .to_owned(),
            api_token: get_var("PAYSYNC_API_TOKEN")?,
            api_user: get_var_or("PAYSYNC_API_USER", ""),
            auth_mode,
            page_size: parse_var("PAYSYNC_PAGE_SIZE", 100)?,
            sort,
            timeout_secs: parse_var("PAYSYNC_TIMEOUT_SECS", 30)?,
        };
        if source.page_size == 0 {
            return Err(PaysyncError::Config(
                "PAYSYNC_PAGE_SIZE must be greater than zero".to_owned(),
            ));
        }

        let retry = RetryConfig {
            max_attempts: parse_var("PAYSYNC_MAX_RETRIES", 3)?,
            base_delay: Duration::from_millis(parse_var("PAYSYNC_RETRY_BASE_MS", 1000)?),
            max_delay: Duration::from_millis(parse_var("PAYSYNC_RETRY_MAX_MS", 30_000)?),
            backoff,
            rate_limit_cooldown: Duration::from_secs(parse_var(
                "PAYSYNC_RATE_LIMIT_COOLDOWN_SECS",
                60,
            )?),
            max_rate_limit_waits: parse_var("PAYSYNC_MAX_RATE_LIMIT_WAITS", 10)?,
            consecutive_error_threshold: parse_var("PAYSYNC_CONSECUTIVE_ERROR_THRESHOLD", 10)?,
        };

        let entities = match env::var("PAYSYNC_ENTITIES").ok() {
            Some(raw) => parse_entity_list(&raw)?,
            None => EntityKind::ALL.to_vec(),
        };

        Ok(Self {
            database_url: get_var("DATABASE_URL")?,
            source,
            retry,
            entities,
            write_batch_size: parse_var("PAYSYNC_WRITE_BATCH_SIZE", 50)?,
            batch_pause: Duration::from_millis(parse_var("PAYSYNC_BATCH_PAUSE_MS", 500)?),
            page_pause: Duration::from_millis(parse_var("PAYSYNC_PAGE_PAUSE_MS", 1000)?),
            checkpoint_path: PathBuf::from(get_var_or(
                "PAYSYNC_CHECKPOINT_PATH",
                ".paysync/checkpoint.json",
            )),
            checkpoint_interval_pages: parse_var("PAYSYNC_CHECKPOINT_INTERVAL_PAGES", 5)?,
            max_pages_per_window: parse_var("PAYSYNC_MAX_PAGES_PER_WINDOW", 1000)?,
            pagination_ceiling: parse_var("PAYSYNC_PAGINATION_CEILING", 10_000)?,
            backfill_start: env::var("PAYSYNC_BACKFILL_START").ok(),
            backfill_end: env::var("PAYSYNC_BACKFILL_END").ok(),
        })
    }

    pub fn is_backfill(&self) -> bool {
        self.backfill_start.is_some()
    }
}

/// Parse a comma-separated list of entity kinds.
/// Returns `Err` on unknown names or when every entry is blank.
pub fn parse_entity_list(raw: &str) -> PaysyncResult<Vec<EntityKind>> {
    let mut kinds = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let kind: EntityKind = part.parse()?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }

    if kinds.is_empty() {
        return Err(PaysyncError::Config(
            "PAYSYNC_ENTITIES is set but contains no entity kinds".to_owned(),
        ));
    }
    Ok(kinds)
}

fn get_var(key: &str) -> PaysyncResult<String> {
    env::var(key).map_err(|_| PaysyncError::Config(format!("{key} is required but not set")))
}

fn get_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_var<T>(key: &str, default: T) -> PaysyncResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| PaysyncError::Config(format!("invalid {key}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "DATABASE_URL",
        "PAYSYNC_API_BASE_URL",
        "PAYSYNC_API_TOKEN",
        "PAYSYNC_ENTITIES",
        "PAYSYNC_PAGE_SIZE",
        "PAYSYNC_BACKOFF",
        "PAYSYNC_AUTH_MODE",
        "PAYSYNC_BACKFILL_START",
    ];

    fn clear_env() {
        for key in VARS {
            env::remove_var(key);
        }
    }

    fn set_required() {
        env::set_var("DATABASE_URL", "postgres://localhost/paysync_test");
        env::set_var("PAYSYNC_API_BASE_URL", "https://api.example.com/v1/");
        env::set_var("PAYSYNC_API_TOKEN", "secret");
    }

    #[test]
    fn config_from_env_applies_defaults() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        clear_env();
        set_required();

        let cfg = SyncConfig::from_env().expect("should parse config");
        assert_eq!(cfg.source.base_url, "https://api.example.com/v1");
        assert_eq!(cfg.source.page_size, 100);
        assert_eq!(cfg.source.auth_mode, AuthMode::Bearer);
        assert_eq!(cfg.retry.backoff, Backoff::Exponential);
        assert_eq!(cfg.retry.rate_limit_cooldown, Duration::from_secs(60));
        assert_eq!(cfg.entities.len(), 7);
        assert_eq!(cfg.pagination_ceiling, 10_000);
        assert!(!cfg.is_backfill());

        clear_env();
    }

    #[test]
    fn config_from_env_fails_without_token() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        clear_env();
        set_required();
        env::remove_var("PAYSYNC_API_TOKEN");

        let err = SyncConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("PAYSYNC_API_TOKEN"), "got: {err}");

        clear_env();
    }

    #[test]
    fn config_rejects_bad_numbers_and_modes() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        clear_env();
        set_required();

        env::set_var("PAYSYNC_PAGE_SIZE", "lots");
        let err = SyncConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("PAYSYNC_PAGE_SIZE"), "got: {err}");

        env::set_var("PAYSYNC_PAGE_SIZE", "0");
        assert!(SyncConfig::from_env().is_err());

        env::set_var("PAYSYNC_PAGE_SIZE", "25");
        env::set_var("PAYSYNC_BACKOFF", "fibonacci");
        let err = SyncConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("PAYSYNC_BACKOFF"), "got: {err}");

        clear_env();
    }

    #[test]
    fn config_reads_entities_and_backfill() {
        let _guard = ENV_LOCK.lock().expect("env lock poisoned");
        clear_env();
        set_required();
        env::set_var("PAYSYNC_ENTITIES", "invoices, plans");
        env::set_var("PAYSYNC_AUTH_MODE", "BASIC");
        env::set_var("PAYSYNC_BACKFILL_START", "2025-08-01");

        let cfg = SyncConfig::from_env().expect("should parse config");
        assert_eq!(cfg.entities, vec![EntityKind::Invoice, EntityKind::Plan]);
        assert_eq!(cfg.source.auth_mode, AuthMode::Basic);
        assert_eq!(cfg.backfill_start.as_deref(), Some("2025-08-01"));
        assert!(cfg.is_backfill());

        clear_env();
    }

    #[test]
    fn entity_list_dedups_and_rejects_blank() {
        let kinds = parse_entity_list("customer, Customer ,plan").unwrap();
        assert_eq!(kinds, vec![EntityKind::Customer, EntityKind::Plan]);

        let err = parse_entity_list(" , ,").unwrap_err();
        assert!(err.to_string().contains("no entity kinds"), "got: {err}");

        assert!(parse_entity_list("customer,refund").is_err());
    }
}

//! Runtime configuration.
//!
//! Every component reads its knobs from environment variables with
//! conservative defaults, so a bare `previewd` invocation works against a
//! local substrate. Invalid values fall back to the default rather than
//! aborting startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Naming constraints supplied by the substrate.
#[derive(Debug, Clone)]
pub struct NamingConfig {
    /// Maximum length of each sanitized component before joining.
    pub max_component_len: usize,

    /// Maximum length of the composed canonical identity.
    pub max_name_len: usize,
}

impl Default for NamingConfig {
    fn default() -> Self {
        NamingConfig {
            max_component_len: 24,
            // DNS-label limit, the common denominator across substrates.
            max_name_len: 63,
        }
    }
}

impl NamingConfig {
    pub fn from_env() -> Self {
        let default = NamingConfig::default();
        NamingConfig {
            max_component_len: env_parse("PREVIEWD_MAX_COMPONENT_LEN", default.max_component_len),
            max_name_len: env_parse("PREVIEWD_MAX_NAME_LEN", default.max_name_len),
        }
    }
}

/// Routing-key space.
#[derive(Debug, Clone)]
pub struct RoutingConfig {
    /// Lowest key handed out.
    pub first_key: u32,

    /// Number of keys in the pool.
    pub pool_size: u32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        RoutingConfig {
            first_key: 100,
            pool_size: 400,
        }
    }
}

impl RoutingConfig {
    pub fn from_env() -> Self {
        let default = RoutingConfig::default();
        RoutingConfig {
            first_key: env_parse("PREVIEWD_ROUTING_FIRST_KEY", default.first_key),
            pool_size: env_parse("PREVIEWD_ROUTING_POOL_SIZE", default.pool_size),
        }
    }
}

/// Reconciler execution limits.
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// Attempts per step before the environment fails (includes the
    /// initial attempt).
    pub max_attempts: u32,

    /// Initial backoff delay after a transient outcome.
    pub initial_backoff: Duration,

    /// Cap for exponential backoff growth.
    pub max_backoff: Duration,

    /// Upper bound on driver calls per step (network timeout); a timeout
    /// counts as a transient outcome.
    pub driver_timeout: Duration,

    /// Maximum number of identities reconciling concurrently. Chosen to
    /// stay under the substrate's rate limits.
    pub worker_budget: usize,

    /// Automatic retries from `Failed` before operator intervention.
    pub max_failed_retries: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            driver_timeout: Duration::from_secs(60),
            worker_budget: 8,
            max_failed_retries: 3,
        }
    }
}

impl ReconcileConfig {
    pub fn from_env() -> Self {
        let default = ReconcileConfig::default();
        ReconcileConfig {
            max_attempts: env_parse("PREVIEWD_MAX_ATTEMPTS", default.max_attempts),
            initial_backoff: Duration::from_millis(env_parse(
                "PREVIEWD_BACKOFF_INITIAL_MS",
                default.initial_backoff.as_millis() as u64,
            )),
            max_backoff: Duration::from_secs(env_parse(
                "PREVIEWD_BACKOFF_MAX_SECS",
                default.max_backoff.as_secs(),
            )),
            driver_timeout: Duration::from_secs(env_parse(
                "PREVIEWD_DRIVER_TIMEOUT_SECS",
                default.driver_timeout.as_secs(),
            )),
            worker_budget: env_parse("PREVIEWD_WORKER_BUDGET", default.worker_budget),
            max_failed_retries: env_parse("PREVIEWD_MAX_FAILED_RETRIES", default.max_failed_retries),
        }
    }
}

/// Garbage-collector policy.
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// How often the sweep runs.
    pub interval: Duration,

    /// Environments idle longer than this are reclaimed.
    pub idle_threshold: Duration,

    /// Report-only mode for safe rollout.
    pub dry_run: bool,

    /// Tag key whose presence exempts an environment from reclamation.
    pub exclusion_tag: String,

    /// Keep log sinks after teardown for audit.
    pub retain_log_sinks: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            interval: Duration::from_secs(300),
            idle_threshold: Duration::from_secs(48 * 3600),
            dry_run: false,
            exclusion_tag: "previewd/keep".to_string(),
            retain_log_sinks: true,
        }
    }
}

impl GcConfig {
    pub fn from_env() -> Self {
        let default = GcConfig::default();
        GcConfig {
            interval: Duration::from_secs(env_parse(
                "PREVIEWD_GC_INTERVAL_SECS",
                default.interval.as_secs(),
            )),
            idle_threshold: Duration::from_secs(env_parse(
                "PREVIEWD_GC_IDLE_SECS",
                default.idle_threshold.as_secs(),
            )),
            dry_run: env_parse("PREVIEWD_GC_DRY_RUN", default.dry_run),
            exclusion_tag: std::env::var("PREVIEWD_GC_EXCLUSION_TAG")
                .unwrap_or(default.exclusion_tag),
            retain_log_sinks: env_parse("PREVIEWD_RETAIN_LOG_SINKS", default.retain_log_sinks),
        }
    }
}

/// Promotion queue limits.
#[derive(Debug, Clone)]
pub struct PromotionConfig {
    /// Requests queued per target beyond the in-flight one.
    pub max_queue_depth: usize,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        PromotionConfig { max_queue_depth: 4 }
    }
}

impl PromotionConfig {
    pub fn from_env() -> Self {
        let default = PromotionConfig::default();
        PromotionConfig {
            max_queue_depth: env_parse("PREVIEWD_PROMOTION_QUEUE_DEPTH", default.max_queue_depth),
        }
    }
}

/// State persistence.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory holding the state snapshot.
    pub state_dir: PathBuf,

    /// How long destroyed environments are kept for audit before pruning.
    pub destroyed_retention: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            state_dir: PathBuf::from("./previewd-state"),
            destroyed_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let default = StoreConfig::default();
        StoreConfig {
            state_dir: std::env::var("PREVIEWD_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.state_dir),
            destroyed_retention: Duration::from_secs(env_parse(
                "PREVIEWD_DESTROYED_RETENTION_SECS",
                default.destroyed_retention.as_secs(),
            )),
        }
    }
}

/// HTTP intake.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,

    /// Shared secret for event signature verification; unsigned intake is
    /// accepted when unset.
    pub event_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            event_secret: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let default = ServerConfig::default();
        ServerConfig {
            bind_addr: env_parse("PREVIEWD_BIND_ADDR", default.bind_addr),
            event_secret: std::env::var("PREVIEWD_EVENT_SECRET").ok(),
        }
    }
}

/// Everything main needs to wire the daemon.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub naming: NamingConfig,
    pub routing: RoutingConfig,
    pub reconcile: ReconcileConfig,
    pub gc: GcConfig,
    pub promotion: PromotionConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            naming: NamingConfig::from_env(),
            routing: RoutingConfig::from_env(),
            reconcile: ReconcileConfig::from_env(),
            gc: GcConfig::from_env(),
            promotion: PromotionConfig::from_env(),
            store: StoreConfig::from_env(),
            server: ServerConfig::from_env(),
        }
    }
}

/// Parses an env var, falling back to the default on absence or parse
/// failure.
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    parse_or(std::env::var(key).ok(), default)
}

fn parse_or<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
    raw.and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.naming.max_name_len >= config.naming.max_component_len);
        assert!(config.routing.pool_size > 0);
        assert!(config.reconcile.max_attempts > 0);
        assert!(config.reconcile.worker_budget > 0);
        assert!(config.gc.idle_threshold > config.gc.interval);
        assert!(config.promotion.max_queue_depth > 0);
    }

    #[test]
    fn parse_falls_back_on_garbage_and_absence() {
        assert_eq!(parse_or(Some("not-a-number".into()), 42u32), 42);
        assert_eq!(parse_or(None, 42u32), 42);
        assert_eq!(parse_or(Some("13".into()), 42u32), 13);
    }
}

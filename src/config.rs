//! Environment-driven configuration
//!
//! Every operational knob of the pool manager comes from the environment.
//! `Config::default()` carries the documented defaults; `Config::from_env()`
//! overlays whatever is set in the process environment.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the pool manager
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port for the control plane
    pub port: u16,
    /// Shared secret for authenticated control-plane endpoints
    pub bearer_token: String,
    /// Environment tag; selects the provider environment and service names
    pub environment: String,
    /// Base URL of the provider control API
    pub provider_url: String,
    /// Credentials for the provider API
    pub provider_token: String,
    /// Model API key injected into each instance's dotenv
    pub model_api_key: String,
    /// Service id of the pool manager itself, excluded from reconciliation
    pub self_service_id: Option<String>,
    /// Directory for claim metadata documents
    pub data_dir: PathBuf,
    /// Target number of idle instances the reconciler maintains
    pub min_idle: usize,
    /// Hard cap on total instances (starting + idle + claimed)
    pub max_total: usize,
    /// Reconciler cadence
    pub tick_interval: Duration,
    /// Heartbeat cadence; zero disables the heartbeat task
    pub heartbeat_interval: Duration,
    /// Age beyond which an unreachable instance is considered dead
    pub stuck_timeout: Duration,
    /// Age before a metadata-less orphan is eligible for provider delete
    pub orphan_grace: Duration,
    /// Consecutive creation failures that open the circuit breaker
    pub create_failure_threshold: u32,
    /// How long creation stays suppressed once the breaker opens
    pub create_cooldown: Duration,
    /// How long a fresh instance may take to report ready
    pub create_timeout: Duration,
    /// How long a recycled instance may take to report ready
    pub recycle_ready_timeout: Duration,
    /// Timeout for a single gateway /status probe
    pub probe_timeout: Duration,
    /// Delay between readiness polls during provisioning
    pub ready_poll_interval: Duration,
    /// Name prefix of services this pool manages
    pub pool_prefix: String,
    /// Consecutive probe failures before the heartbeat intervenes
    pub heartbeat_failure_threshold: u32,
    /// Wake attempts on a claimed instance before it is cleaned up
    pub heartbeat_recovery_cap: u32,
    /// Port the agent gateway listens on inside each instance
    pub gateway_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bearer_token: String::new(),
            environment: "dev".to_string(),
            provider_url: "https://api.provider.invalid".to_string(),
            provider_token: String::new(),
            model_api_key: String::new(),
            self_service_id: None,
            data_dir: PathBuf::from("./data"),
            min_idle: 2,
            max_total: 10,
            tick_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(20),
            stuck_timeout: Duration::from_secs(15 * 60),
            orphan_grace: Duration::from_secs(5 * 60),
            create_failure_threshold: 3,
            create_cooldown: Duration::from_secs(5 * 60),
            create_timeout: Duration::from_secs(2 * 60),
            recycle_ready_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
            ready_poll_interval: Duration::from_secs(3),
            pool_prefix: "convos-agent-".to_string(),
            heartbeat_failure_threshold: 3,
            heartbeat_recovery_cap: 3,
            gateway_port: 8317,
        }
    }
}

/// Error raised when an environment variable fails validation
#[derive(Debug)]
pub struct ConfigError {
    pub variable: String,
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.variable, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Load configuration from the process environment
    ///
    /// Unset variables fall back to the defaults; set variables that fail to
    /// parse are an error rather than a silent fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(port) = parse_var::<u16>("CONVOPOOL_PORT")? {
            config.port = port;
        }
        if let Ok(token) = std::env::var("CONVOPOOL_TOKEN") {
            config.bearer_token = token;
        }
        if let Ok(env) = std::env::var("CONVOPOOL_ENVIRONMENT") {
            config.environment = env;
        }
        if let Ok(url) = std::env::var("PROVIDER_API_URL") {
            config.provider_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(token) = std::env::var("PROVIDER_TOKEN") {
            config.provider_token = token;
        }
        if let Ok(key) = std::env::var("MODEL_API_KEY") {
            config.model_api_key = key;
        }
        if let Ok(id) = std::env::var("CONVOPOOL_SELF_SERVICE_ID") {
            if !id.is_empty() {
                config.self_service_id = Some(id);
            }
        }
        if let Ok(dir) = std::env::var("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(n) = parse_var::<usize>("MIN_IDLE")? {
            config.min_idle = n;
        }
        if let Some(n) = parse_var::<usize>("MAX_TOTAL")? {
            config.max_total = n;
        }
        if let Some(secs) = parse_var::<u64>("TICK_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(ConfigError {
                    variable: "TICK_INTERVAL_SECS".to_string(),
                    message: "must be at least 1".to_string(),
                });
            }
            config.tick_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("HEARTBEAT_INTERVAL_SECS")? {
            // zero disables the heartbeat entirely
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("STUCK_TIMEOUT_SECS")? {
            config.stuck_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("ORPHAN_GRACE_SECS")? {
            config.orphan_grace = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u32>("CREATE_FAILURE_THRESHOLD")? {
            config.create_failure_threshold = n;
        }
        if let Some(secs) = parse_var::<u64>("CREATE_COOLDOWN_SECS")? {
            config.create_cooldown = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("CREATE_TIMEOUT_SECS")? {
            config.create_timeout = Duration::from_secs(secs);
        }

        if config.min_idle > config.max_total {
            return Err(ConfigError {
                variable: "MIN_IDLE".to_string(),
                message: format!(
                    "must not exceed MAX_TOTAL ({} > {})",
                    config.min_idle, config.max_total
                ),
            });
        }

        Ok(config)
    }

    /// Whether the heartbeat task should run
    pub fn heartbeat_enabled(&self) -> bool {
        !self.heartbeat_interval.is_zero()
    }

    /// Provider-facing name for a pool service with the given instance id
    pub fn service_name(&self, instance_id: &str) -> String {
        format!("{}{}-{}", self.pool_prefix, self.environment, instance_id)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse::<T>().map(Some).map_err(|e| ConfigError {
            variable: name.to_string(),
            message: e.to_string(),
        }),
        Err(_) => Ok(None),
    }
}

//! Configuration loading
//!
//! Unlike a TOML-file-backed config, the daemon's configuration is assembled
//! once at startup from CLI flags with `WATCHTOWER_`-prefixed environment
//! variable fallbacks (via clap's `env` feature), then handed out as an
//! `Arc<Config>` for the life of the process. It is never reloaded.

use std::time::Duration;

use clap::{Parser, Subcommand};
use thiserror::Error;

/// Subcommands live here (rather than in the binary's `cmd` module) so
/// `Cli` can reference them without a crate-boundary forward reference.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Display system and container-runtime diagnostics, then exit.
    Diagnostics,
}

/// Errors raised while assembling or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid cron schedule {0:?}: {1}")]
    InvalidSchedule(String, String),

    #[error("--schedule and --interval are mutually exclusive")]
    ConflictingTrigger,

    #[error("http api token must not be empty when an http api flag is enabled")]
    EmptyApiToken,

    #[error("invalid bind address {0:?}: {1}")]
    InvalidBindAddress(String, String),

    #[error("{0}")]
    Other(String),
}

/// CLI surface. Every flag accepts an equivalent `WATCHTOWER_*` environment
/// variable fallback via clap's `env` attribute.
#[derive(Parser, Debug, Clone)]
#[command(name = "containerwatch")]
#[command(about = "Keeps running containers synchronized with the latest registry images")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Poll interval, e.g. "5m", "30s". Mutually exclusive with --schedule.
    #[arg(long, env = "WATCHTOWER_POLL_INTERVAL")]
    pub interval: Option<String>,

    /// Cron expression (5 or 6 field) driving update sessions. Mutually
    /// exclusive with --interval.
    #[arg(long, env = "WATCHTOWER_SCHEDULE")]
    pub schedule: Option<String>,

    /// Remove the previously used image after a successful recreate.
    #[arg(long, env = "WATCHTOWER_CLEANUP")]
    pub cleanup: bool,

    /// Remove anonymous volumes attached to a removed container.
    #[arg(long, env = "WATCHTOWER_REMOVE_VOLUMES")]
    pub remove_volumes: bool,

    /// Only consider containers that carry `com.centurylinklabs.watchtower.enable`.
    #[arg(long, env = "WATCHTOWER_LABEL_ENABLE")]
    pub label_enable: bool,

    /// Restrict management to containers carrying this scope label.
    #[arg(long, env = "WATCHTOWER_SCOPE")]
    pub scope: Option<String>,

    /// Detect staleness and report, but never recreate.
    #[arg(long, env = "WATCHTOWER_MONITOR_ONLY")]
    pub monitor_only: bool,

    /// Never pull; judge staleness from local images only.
    #[arg(long, env = "WATCHTOWER_NO_PULL")]
    pub no_pull: bool,

    /// Include stopped containers in the scan.
    #[arg(long, env = "WATCHTOWER_INCLUDE_STOPPED")]
    pub include_stopped: bool,

    /// Include restarting containers in the scan.
    #[arg(long, env = "WATCHTOWER_INCLUDE_RESTARTING")]
    pub include_restarting: bool,

    /// Start a stopped container back up if its image was updated.
    #[arg(long, env = "WATCHTOWER_REVIVE_STOPPED")]
    pub revive_stopped: bool,

    /// Restart dependents even when only stopped to permit a parent recreate.
    #[arg(long, env = "WATCHTOWER_ROLLING_RESTART")]
    pub rolling_restart: bool,

    /// Run exactly one session then exit.
    #[arg(long, env = "WATCHTOWER_RUN_ONCE")]
    pub run_once: bool,

    /// Seconds to wait for a container to stop before it is killed.
    #[arg(long, env = "WATCHTOWER_TIMEOUT", default_value = "10")]
    pub stop_timeout_secs: u64,

    /// Enable the POST /v1/update endpoint.
    #[arg(long, env = "WATCHTOWER_HTTP_API_UPDATE")]
    pub http_api_update: bool,

    /// Enable the GET /v1/metrics endpoint.
    #[arg(long, env = "WATCHTOWER_HTTP_API_METRICS")]
    pub http_api_metrics: bool,

    /// When the HTTP API is enabled, also keep the periodic schedule/interval running.
    #[arg(long, env = "WATCHTOWER_HTTP_API_PERIODIC_POLLS")]
    pub http_api_periodic_polls: bool,

    /// Bearer token required by HTTP API endpoints.
    #[arg(long, env = "WATCHTOWER_HTTP_API_TOKEN")]
    pub http_api_token: Option<String>,

    /// HTTP API bind host.
    #[arg(long, env = "WATCHTOWER_HTTP_API_HOST", default_value = "0.0.0.0")]
    pub http_api_host: String,

    /// HTTP API bind port.
    #[arg(long, env = "WATCHTOWER_HTTP_API_PORT", default_value_t = 8080)]
    pub http_api_port: u16,

    /// Comma-separated notifier transport URLs (slack://..., gotify://...).
    #[arg(long, env = "WATCHTOWER_NOTIFICATIONS", value_delimiter = ',')]
    pub notifications: Vec<String>,

    /// Minimum tracing level buffered for notification delivery.
    #[arg(long, env = "WATCHTOWER_NOTIFICATIONS_LEVEL", default_value = "info")]
    pub notifications_level: String,

    /// Enable verbose (debug) logging.
    #[arg(short, long, env = "WATCHTOWER_DEBUG")]
    pub debug: bool,
}

/// Immutable, fully validated configuration shared via `Arc` across the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub trigger: Trigger,
    pub cleanup: bool,
    pub remove_volumes: bool,
    pub label_enable: bool,
    pub scope: Option<String>,
    pub monitor_only: bool,
    pub no_pull: bool,
    pub include_stopped: bool,
    pub include_restarting: bool,
    pub revive_stopped: bool,
    pub rolling_restart: bool,
    pub run_once: bool,
    pub stop_timeout: Duration,
    pub http: HttpApiConfig,
    pub notifications: Vec<String>,
    pub notifications_level: String,
    pub debug: bool,
}

/// What triggers an update session.
#[derive(Debug, Clone)]
pub enum Trigger {
    Interval(Duration),
    Schedule(String),
    /// No periodic trigger; only HTTP-API-triggered or one-shot sessions run.
    None,
}

#[derive(Debug, Clone, Default)]
pub struct HttpApiConfig {
    pub update_enabled: bool,
    pub metrics_enabled: bool,
    pub periodic_polls: bool,
    pub token: String,
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let trigger = match (&cli.interval, &cli.schedule) {
            (Some(_), Some(_)) => return Err(ConfigError::ConflictingTrigger),
            (Some(raw), None) => Trigger::Interval(parse_duration(raw)?),
            (None, Some(expr)) => {
                validate_cron(expr)?;
                Trigger::Schedule(expr.clone())
            }
            (None, None) if cli.run_once => Trigger::None,
            (None, None) => Trigger::Interval(Duration::from_secs(300)),
        };

        let http_enabled = cli.http_api_update || cli.http_api_metrics;
        if http_enabled && cli.http_api_token.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::EmptyApiToken);
        }

        if http_enabled {
            // Parsed here only for validation; the server binds the raw strings.
            format!("{}:{}", cli.http_api_host, cli.http_api_port)
                .parse::<std::net::SocketAddr>()
                .map_err(|e| ConfigError::InvalidBindAddress(cli.http_api_host.clone(), e.to_string()))?;
        }

        Ok(Self {
            trigger,
            cleanup: cli.cleanup,
            remove_volumes: cli.remove_volumes,
            label_enable: cli.label_enable,
            scope: cli.scope.clone(),
            monitor_only: cli.monitor_only,
            no_pull: cli.no_pull,
            include_stopped: cli.include_stopped,
            include_restarting: cli.include_restarting,
            revive_stopped: cli.revive_stopped,
            rolling_restart: cli.rolling_restart,
            run_once: cli.run_once,
            stop_timeout: Duration::from_secs(cli.stop_timeout_secs),
            http: HttpApiConfig {
                update_enabled: cli.http_api_update,
                metrics_enabled: cli.http_api_metrics,
                periodic_polls: cli.http_api_periodic_polls,
                token: cli.http_api_token.clone().unwrap_or_default(),
                host: cli.http_api_host.clone(),
                port: cli.http_api_port,
            },
            notifications: cli.notifications.clone(),
            notifications_level: cli.notifications_level.clone(),
            debug: cli.debug,
        })
    }
}

fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let raw = raw.trim();
    let (digits, suffix) = raw.split_at(
        raw.find(|c: char| !c.is_ascii_digit())
            .unwrap_or(raw.len()),
    );
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::Other(format!("invalid duration {:?}", raw)))?;
    let secs = match suffix {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => {
            return Err(ConfigError::Other(format!(
                "unknown duration suffix {:?} in {:?}",
                other, raw
            )))
        }
    };
    Ok(Duration::from_secs(secs))
}

/// Accepts standard 5-field cron as well as the 6-field (seconds-first) form
/// `tokio_cron_scheduler` understands.
fn validate_cron(expr: &str) -> Result<(), ConfigError> {
    let fields = expr.split_whitespace().count();
    if !(5..=7).contains(&fields) {
        return Err(ConfigError::InvalidSchedule(
            expr.to_string(),
            format!("expected 5-7 whitespace-separated fields, found {}", fields),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_interval_suffixes() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn rejects_conflicting_triggers() {
        let cli = Cli {
            command: None,
            interval: Some("5m".into()),
            schedule: Some("0 0 * * * *".into()),
            cleanup: false,
            remove_volumes: false,
            label_enable: false,
            scope: None,
            monitor_only: false,
            no_pull: false,
            include_stopped: false,
            include_restarting: false,
            revive_stopped: false,
            rolling_restart: false,
            run_once: false,
            stop_timeout_secs: 10,
            http_api_update: false,
            http_api_metrics: false,
            http_api_periodic_polls: false,
            http_api_token: None,
            http_api_host: "0.0.0.0".into(),
            http_api_port: 8080,
            notifications: vec![],
            notifications_level: "info".into(),
            debug: false,
        };

        assert!(matches!(
            Config::from_cli(&cli),
            Err(ConfigError::ConflictingTrigger)
        ));
    }

    #[test]
    fn rejects_empty_api_token_when_enabled() {
        let mut cli_base = Cli {
            command: None,
            interval: None,
            schedule: None,
            cleanup: false,
            remove_volumes: false,
            label_enable: false,
            scope: None,
            monitor_only: false,
            no_pull: false,
            include_stopped: false,
            include_restarting: false,
            revive_stopped: false,
            rolling_restart: false,
            run_once: false,
            stop_timeout_secs: 10,
            http_api_update: true,
            http_api_metrics: false,
            http_api_periodic_polls: false,
            http_api_token: None,
            http_api_host: "0.0.0.0".into(),
            http_api_port: 8080,
            notifications: vec![],
            notifications_level: "info".into(),
            debug: false,
        };
        assert!(matches!(
            Config::from_cli(&cli_base),
            Err(ConfigError::EmptyApiToken)
        ));

        cli_base.http_api_token = Some("secret".into());
        assert!(Config::from_cli(&cli_base).is_ok());
    }
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::broker::BrokerConfig;
use crate::housekeeping::HousekeepingConfig;
use crate::scheduler::SchedulerConfig;
use crate::store::DbConfig;
use crate::worker::WorkerConfig;

/// Service configuration, read from `CONVOY_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    /// Set when `DATABASE_URL` is present; otherwise state lives in memory.
    pub database: Option<DbConfig>,
    pub workers: WorkerConfig,
    pub broker: BrokerConfig,
    pub scheduler: SchedulerConfig,
    pub housekeeping: HousekeepingConfig,
    pub nodes_file: Option<PathBuf>,
    pub ignore_node_source_errors: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        Ok(Self {
            database: config.database.as_ref().map(|_| DbConfig::from_env()),
            ..config
        })
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(&lookup);

        let listen_addr = vars.parse("CONVOY_LISTEN_ADDR", "127.0.0.1:8080".parse()?)?;
        let log_level = lookup("CONVOY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());
        let dev_mode = vars.flag("CONVOY_DEV");

        let database = lookup("DATABASE_URL").map(|database_url| DbConfig {
            database_url,
            ..DbConfig::default()
        });

        let worker_defaults = WorkerConfig::default();
        let workers = WorkerConfig {
            count: vars.parse("CONVOY_WORKER_COUNT", worker_defaults.count)?,
            dequeue_timeout: vars.millis("CONVOY_DEQUEUE_TIMEOUT_MS", worker_defaults.dequeue_timeout)?,
            conflict_backoff: vars.millis("CONVOY_CONFLICT_BACKOFF_MS", worker_defaults.conflict_backoff)?,
            backoff: worker_defaults.backoff,
        };

        let broker_defaults = BrokerConfig::default();
        let broker = BrokerConfig {
            visibility_timeout: vars.secs(
                "CONVOY_BROKER_VISIBILITY_TIMEOUT_SECS",
                broker_defaults.visibility_timeout,
            )?,
            max_retry_count: vars.parse(
                "CONVOY_BROKER_MAX_RETRY_COUNT",
                broker_defaults.max_retry_count,
            )?,
            initial_retry_delay: vars.millis(
                "CONVOY_BROKER_INITIAL_RETRY_DELAY_MS",
                broker_defaults.initial_retry_delay,
            )?,
            subsequent_retry_delay: vars.millis(
                "CONVOY_BROKER_SUBSEQUENT_RETRY_DELAY_MS",
                broker_defaults.subsequent_retry_delay,
            )?,
            max_retry_delay: vars.secs(
                "CONVOY_BROKER_MAX_RETRY_DELAY_SECS",
                broker_defaults.max_retry_delay,
            )?,
        };

        let scheduler_defaults = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            queue_backoff: vars.secs("CONVOY_QUEUE_BACKOFF_SECS", scheduler_defaults.queue_backoff)?,
            default_max_retries: vars.parse(
                "CONVOY_DEFAULT_MAX_RETRIES",
                scheduler_defaults.default_max_retries,
            )?,
            oversubscription_factor: vars.parse(
                "CONVOY_OVERSUBSCRIPTION_FACTOR",
                scheduler_defaults.oversubscription_factor,
            )?,
        };
        if scheduler.oversubscription_factor < 1.0 {
            anyhow::bail!(
                "CONVOY_OVERSUBSCRIPTION_FACTOR must be at least 1.0, got {}",
                scheduler.oversubscription_factor
            );
        }

        let housekeeping_defaults = HousekeepingConfig::default();
        let housekeeping = HousekeepingConfig {
            interval: vars.secs(
                "CONVOY_HOUSEKEEPING_INTERVAL_SECS",
                housekeeping_defaults.interval,
            )?,
            timeout: vars.secs("CONVOY_HOUSEKEEPING_TIMEOUT_SECS", housekeeping_defaults.timeout)?,
            execution_timeout_buffer: vars.secs(
                "CONVOY_EXECUTION_TIMEOUT_BUFFER_SECS",
                housekeeping_defaults.execution_timeout_buffer,
            )?,
            workers: vars.parse("CONVOY_HOUSEKEEPING_WORKERS", housekeeping_defaults.workers)?,
            node_heartbeat_timeout: vars.secs(
                "CONVOY_NODE_HEARTBEAT_TIMEOUT_SECS",
                housekeeping_defaults.node_heartbeat_timeout,
            )?,
        };
        if housekeeping.interval.is_zero() {
            anyhow::bail!("CONVOY_HOUSEKEEPING_INTERVAL_SECS must be greater than zero");
        }

        let nodes_file = lookup("CONVOY_NODES_FILE").map(PathBuf::from);
        let ignore_node_source_errors = vars.flag("CONVOY_IGNORE_NODE_SOURCE_ERRORS");

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database,
            workers,
            broker,
            scheduler,
            housekeeping,
            nodes_file,
            ignore_node_source_errors,
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn parse<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match (self.0)(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("invalid value for {key}: {raw:?}")),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: Duration) -> Result<Duration> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default).map(Duration::from_millis)
    }

    fn flag(&self, key: &str) -> bool {
        (self.0)(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.log_level, "info");
        assert!(config.database.is_none());
        assert_eq!(config.broker, BrokerConfig::default());
        assert_eq!(config.scheduler, SchedulerConfig::default());
        assert_eq!(config.housekeeping, HousekeepingConfig::default());
        assert!(config.workers.count >= 1);
        assert!(!config.ignore_node_source_errors);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("CONVOY_LISTEN_ADDR", "0.0.0.0:9000"),
            ("DATABASE_URL", "postgres://db/convoy"),
            ("CONVOY_WORKER_COUNT", "8"),
            ("CONVOY_CONFLICT_BACKOFF_MS", "10"),
            ("CONVOY_BROKER_MAX_RETRY_COUNT", "2"),
            ("CONVOY_QUEUE_BACKOFF_SECS", "5"),
            ("CONVOY_OVERSUBSCRIPTION_FACTOR", "1.5"),
            ("CONVOY_NODES_FILE", "/etc/convoy/nodes.json"),
            ("CONVOY_IGNORE_NODE_SOURCE_ERRORS", "true"),
        ])
        .unwrap();

        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(
            config.database.map(|d| d.database_url),
            Some("postgres://db/convoy".to_string())
        );
        assert_eq!(config.workers.count, 8);
        assert_eq!(config.workers.conflict_backoff, Duration::from_millis(10));
        assert_eq!(config.broker.max_retry_count, 2);
        assert_eq!(config.scheduler.queue_backoff, Duration::from_secs(5));
        assert_eq!(config.scheduler.oversubscription_factor, 1.5);
        assert_eq!(config.nodes_file, Some(PathBuf::from("/etc/convoy/nodes.json")));
        assert!(config.ignore_node_source_errors);
    }

    #[test]
    fn test_rejects_malformed_values() {
        let err = load(&[("CONVOY_WORKER_COUNT", "many")]).unwrap_err();
        assert!(err.to_string().contains("CONVOY_WORKER_COUNT"));

        assert!(load(&[("CONVOY_OVERSUBSCRIPTION_FACTOR", "0.5")]).is_err());
        assert!(load(&[("CONVOY_HOUSEKEEPING_INTERVAL_SECS", "0")]).is_err());
    }
}

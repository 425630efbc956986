//! Application configuration.
//!
//! Layered: built-in defaults, then an optional TOML file (path in
//! `COURIER_CONFIG`, or `courier.toml` in the working directory), then
//! environment overrides with the `COURIER_` prefix and section_key naming
//! (e.g. `COURIER_SCHEDULER_HIGH_PRIORITY_INTERVAL=2s`). Durations accept
//! suffixed strings such as `30s`, `5m` or `1h30m`.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Deserializer};

const ENV_PREFIX: &str = "COURIER";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub scheduler: SchedulerSection,
    pub worker: WorkerSection,
    pub callback: CallbackSection,
    pub log: LogSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    #[serde(deserialize_with = "de_duration")]
    pub conn_max_lifetime: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub conn_max_idle_time: Duration,
    pub timezone: String,
    pub auto_migrate: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_open_conns: 10,
            max_idle_conns: 5,
            conn_max_lifetime: Duration::from_secs(30 * 60),
            conn_max_idle_time: Duration::from_secs(10 * 60),
            timezone: "UTC".to_string(),
            auto_migrate: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    #[serde(deserialize_with = "de_duration")]
    pub high_priority_interval: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub normal_priority_interval: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub cleanup_interval: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub stale_recovery_after: Duration,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            high_priority_interval: Duration::from_secs(2),
            normal_priority_interval: Duration::from_secs(3),
            cleanup_interval: Duration::from_secs(30),
            stale_recovery_after: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub pool_size: usize,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self { pool_size: 20 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallbackSection {
    /// HMAC signing secret; empty disables signing.
    pub secret: String,
    #[serde(deserialize_with = "de_duration")]
    pub default_timeout: Duration,
    pub default_max_retries: i32,
}

impl CallbackSection {
    pub fn secret(&self) -> Option<String> {
        if self.secret.is_empty() {
            None
        } else {
            Some(self.secret.clone())
        }
    }
}

impl Default for CallbackSection {
    fn default() -> Self {
        Self {
            secret: String::new(),
            default_timeout: Duration::from_secs(30),
            default_max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl Config {
    /// Load defaults, the optional config file, and environment overrides,
    /// in that order.
    pub fn load() -> Result<Self> {
        let _ = dotenv();

        let mut config = match env::var(format!("{ENV_PREFIX}_CONFIG")) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) if Path::new("courier.toml").exists() => Self::from_file("courier.toml")?,
            Err(_) => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path))?;
        toml::from_str(&raw).with_context(|| format!("failed to parse config file {}", path))
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_var("SERVER_HOST") {
            self.server.host = v;
        }
        set_parsed(&mut self.server.port, "SERVER_PORT")?;

        if let Some(v) = env_var("DATABASE_URL").or_else(|| env::var("DATABASE_URL").ok()) {
            self.database.url = v;
        }
        set_parsed(&mut self.database.max_open_conns, "DATABASE_MAX_OPEN_CONNS")?;
        set_parsed(&mut self.database.max_idle_conns, "DATABASE_MAX_IDLE_CONNS")?;
        set_duration(&mut self.database.conn_max_lifetime, "DATABASE_CONN_MAX_LIFETIME")?;
        set_duration(&mut self.database.conn_max_idle_time, "DATABASE_CONN_MAX_IDLE_TIME")?;
        if let Some(v) = env_var("DATABASE_TIMEZONE") {
            self.database.timezone = v;
        }
        set_parsed(&mut self.database.auto_migrate, "DATABASE_AUTO_MIGRATE")?;

        set_duration(
            &mut self.scheduler.high_priority_interval,
            "SCHEDULER_HIGH_PRIORITY_INTERVAL",
        )?;
        set_duration(
            &mut self.scheduler.normal_priority_interval,
            "SCHEDULER_NORMAL_PRIORITY_INTERVAL",
        )?;
        set_duration(&mut self.scheduler.cleanup_interval, "SCHEDULER_CLEANUP_INTERVAL")?;
        set_duration(
            &mut self.scheduler.stale_recovery_after,
            "SCHEDULER_STALE_RECOVERY_AFTER",
        )?;

        set_parsed(&mut self.worker.pool_size, "WORKER_POOL_SIZE")?;

        if let Some(v) = env_var("CALLBACK_SECRET") {
            self.callback.secret = v;
        }
        set_duration(&mut self.callback.default_timeout, "CALLBACK_DEFAULT_TIMEOUT")?;
        set_parsed(
            &mut self.callback.default_max_retries,
            "CALLBACK_DEFAULT_MAX_RETRIES",
        )?;

        if let Some(v) = env_var("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = env_var("LOG_FORMAT") {
            self.log.format = v;
        }

        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{key}"))
        .ok()
        .filter(|v| !v.is_empty())
}

fn set_parsed<T: std::str::FromStr>(target: &mut T, key: &str) -> Result<()>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(v) = env_var(key) {
        *target = v
            .parse()
            .with_context(|| format!("invalid value for {ENV_PREFIX}_{key}: {v}"))?;
    }
    Ok(())
}

fn set_duration(target: &mut Duration, key: &str) -> Result<()> {
    if let Some(v) = env_var(key) {
        *target = parse_duration(&v)
            .with_context(|| format!("invalid duration for {ENV_PREFIX}_{key}: {v}"))?;
    }
    Ok(())
}

/// Parse `90`, `150ms`, `30s`, `5m`, `2h`, `1d` or compounds like `1h30m`.
/// A bare number is seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value.is_empty() {
        bail!("empty duration");
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            bail!("malformed duration '{value}'");
        }
        let mut unit = String::from(c);
        while chars.peek().is_some_and(|c| c.is_ascii_alphabetic()) {
            unit.push(chars.next().unwrap());
        }
        let amount: u64 = digits.parse().with_context(|| format!("malformed duration '{value}'"))?;
        digits.clear();
        total += match unit.as_str() {
            "ms" => Duration::from_millis(amount),
            "s" => Duration::from_secs(amount),
            "m" => Duration::from_secs(amount * 60),
            "h" => Duration::from_secs(amount * 3600),
            "d" => Duration::from_secs(amount * 86_400),
            other => bail!("unknown duration unit '{other}' in '{value}'"),
        };
    }
    if !digits.is_empty() {
        bail!("duration '{value}' is missing a unit");
    }
    Ok(total)
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    struct DurationVisitor;

    impl serde::de::Visitor<'_> for DurationVisitor {
        type Value = Duration;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("a duration string like \"30s\" or a number of seconds")
        }

        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Duration, E> {
            parse_duration(v).map_err(E::custom)
        }

        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Duration, E> {
            Ok(Duration::from_secs(v))
        }

        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Duration, E> {
            u64::try_from(v)
                .map(Duration::from_secs)
                .map_err(|_| E::custom("duration must be non-negative"))
        }
    }

    deserializer.deserialize_any(DurationVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.scheduler.high_priority_interval, Duration::from_secs(2));
        assert_eq!(config.scheduler.normal_priority_interval, Duration::from_secs(3));
        assert_eq!(config.scheduler.cleanup_interval, Duration::from_secs(30));
        assert_eq!(config.worker.pool_size, 20);
        assert_eq!(config.callback.default_timeout, Duration::from_secs(30));
        assert_eq!(config.callback.default_max_retries, 5);
        assert!(config.callback.secret().is_none());
        assert!(config.database.auto_migrate);
    }

    #[test]
    fn parses_simple_durations() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("1h30").is_err());
    }

    #[test]
    fn file_values_override_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9090

            [scheduler]
            high_priority_interval = "1s"
            cleanup_interval = "2m"

            [callback]
            secret = "hunter2"
            default_timeout = "45s"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.scheduler.high_priority_interval, Duration::from_secs(1));
        assert_eq!(config.scheduler.cleanup_interval, Duration::from_secs(120));
        assert_eq!(config.scheduler.normal_priority_interval, Duration::from_secs(3));
        assert_eq!(config.callback.secret().as_deref(), Some("hunter2"));
        assert_eq!(config.callback.default_timeout, Duration::from_secs(45));
    }

    // Environment mutation is process-global, so every env-override
    // assertion lives in this single test.
    #[test]
    fn environment_overrides_and_rejects_bad_values() {
        env::set_var("COURIER_SERVER_PORT", "7070");
        env::set_var("COURIER_SCHEDULER_HIGH_PRIORITY_INTERVAL", "500ms");
        env::set_var("COURIER_WORKER_POOL_SIZE", "4");
        env::set_var("COURIER_CALLBACK_SECRET", "from-env");

        let mut config = Config::default();
        config.apply_env().unwrap();

        assert_eq!(config.server.port, 7070);
        assert_eq!(
            config.scheduler.high_priority_interval,
            Duration::from_millis(500)
        );
        assert_eq!(config.worker.pool_size, 4);
        assert_eq!(config.callback.secret().as_deref(), Some("from-env"));

        env::set_var("COURIER_DATABASE_MAX_IDLE_CONNS", "lots");
        let err = config.apply_env().unwrap_err();
        assert!(err.to_string().contains("COURIER_DATABASE_MAX_IDLE_CONNS"));

        env::remove_var("COURIER_SERVER_PORT");
        env::remove_var("COURIER_SCHEDULER_HIGH_PRIORITY_INTERVAL");
        env::remove_var("COURIER_WORKER_POOL_SIZE");
        env::remove_var("COURIER_CALLBACK_SECRET");
        env::remove_var("COURIER_DATABASE_MAX_IDLE_CONNS");
    }
}

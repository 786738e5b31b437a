use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};

use parley_gateway::connection::ConnectionConfig;
use parley_gateway::registry::RegistryConfig;
use parley_gateway::state::GatewayConfig;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub scheduler_interval: Duration,
    pub scheduler_batch: usize,
    pub queue_capacity: usize,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = lookup("PARLEY_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("PARLEY_JWT_SECRET is unset or still a placeholder; set it in your .env file");
        }

        Ok(Self {
            host: lookup("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "PARLEY_PORT", 3000)?,
            db_path: lookup("PARLEY_DB_PATH")
                .unwrap_or_else(|| "parley.db".into())
                .into(),
            jwt_secret,
            scheduler_interval: secs_or(&lookup, "PARLEY_SCHEDULER_INTERVAL_SECS", 30)?,
            scheduler_batch: parse_or(&lookup, "PARLEY_SCHEDULER_BATCH", 256)?,
            queue_capacity: parse_or(&lookup, "PARLEY_QUEUE_CAPACITY", 256)?,
            heartbeat_interval: secs_or(&lookup, "PARLEY_HEARTBEAT_SECS", 15)?,
            idle_timeout: secs_or(&lookup, "PARLEY_IDLE_TIMEOUT_SECS", 60)?,
            handshake_timeout: secs_or(&lookup, "PARLEY_HANDSHAKE_TIMEOUT_SECS", 10)?,
            max_frame_bytes: parse_or(&lookup, "PARLEY_MAX_FRAME_BYTES", 128 * 1024)?,
        })
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }

    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            registry: RegistryConfig {
                queue_capacity: self.queue_capacity,
            },
            connection: ConnectionConfig {
                heartbeat_interval: self.heartbeat_interval,
                idle_timeout: self.idle_timeout,
                handshake_timeout: self.handshake_timeout,
            },
            scheduler_batch: self.scheduler_batch,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{}={:?} is not valid: {}", key, raw, e)),
    }
}

// Timers panic on a zero period, so zero is refused here.
fn secs_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> anyhow::Result<Duration> {
    match parse_or(lookup, key, default)? {
        0 => bail!("{} must be at least 1", key),
        secs => Ok(Duration::from_secs(secs)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> anyhow::Result<ServerConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_secret_is_set() {
        let config = load(&[("PARLEY_JWT_SECRET", "hunter2-but-longer")]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, PathBuf::from("parley.db"));
        assert_eq!(config.scheduler_interval, Duration::from_secs(30));
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.max_frame_bytes, 131072);
        assert_eq!(config.addr().unwrap().to_string(), "0.0.0.0:3000");
    }

    #[test]
    fn missing_or_placeholder_secret_is_refused() {
        assert!(load(&[]).is_err());
        assert!(load(&[("PARLEY_JWT_SECRET", "")]).is_err());
        assert!(load(&[("PARLEY_JWT_SECRET", "dev-secret-change-me")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("PARLEY_JWT_SECRET", "s"),
            ("PARLEY_PORT", "8080"),
            ("PARLEY_SCHEDULER_INTERVAL_SECS", "5"),
            ("PARLEY_QUEUE_CAPACITY", " 32 "),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.scheduler_interval, Duration::from_secs(5));

        let gateway = config.gateway();
        assert_eq!(gateway.registry.queue_capacity, 32);
        assert_eq!(gateway.connection.heartbeat_interval, Duration::from_secs(15));
    }

    #[test]
    fn bad_numbers_are_startup_errors() {
        let err = load(&[("PARLEY_JWT_SECRET", "s"), ("PARLEY_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("PARLEY_PORT"));
        assert!(load(&[("PARLEY_JWT_SECRET", "s"), ("PARLEY_HEARTBEAT_SECS", "0")]).is_err());
    }
}

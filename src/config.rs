//! Server and client configuration (strict JSON parsing)
//!
//! Every field has a default, so `{}` is a valid config. Unknown fields are
//! rejected so that typos do not silently fall back to defaults.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

/// Rendezvous server settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// UDP address to listen on
    #[serde(default = "default_listen")]
    pub listen: String,

    /// How often the liveness sweep runs
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Idle time after which a peer is pinged
    #[serde(default = "default_ping_after_ms")]
    pub ping_after_ms: u64,

    /// Idle time after which a peer is evicted
    #[serde(default = "default_evict_after_ms")]
    pub evict_after_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            sweep_interval_ms: default_sweep_interval_ms(),
            ping_after_ms: default_ping_after_ms(),
            evict_after_ms: default_evict_after_ms(),
        }
    }
}

impl Validate for ServerConfig {
    fn validate(&self) -> Result<(), AppError> {
        parse_addr("listen", &self.listen)?;
        if self.sweep_interval_ms == 0 || self.ping_after_ms == 0 {
            return Err(AppError::Config(
                "sweep_interval_ms and ping_after_ms must be greater than 0".into(),
            ));
        }
        if self.evict_after_ms <= self.ping_after_ms {
            return Err(AppError::Config(
                "evict_after_ms must be greater than ping_after_ms".into(),
            ));
        }
        if self.sweep_interval_ms > self.ping_after_ms {
            return Err(AppError::Config(
                "sweep_interval_ms must not exceed ping_after_ms".into(),
            ));
        }
        Ok(())
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, AppError> {
        parse_addr("listen", &self.listen)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn ping_after(&self) -> Duration {
        Duration::from_millis(self.ping_after_ms)
    }

    pub fn evict_after(&self) -> Duration {
        Duration::from_millis(self.evict_after_ms)
    }
}

/// Mesh client settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// Local UDP address to bind
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Rendezvous server endpoint
    #[serde(default = "default_rendezvous")]
    pub rendezvous: String,

    /// Name announced in JOIN_ROOM (may be empty)
    #[serde(default)]
    pub display_name: String,

    /// Capacity of the inbound event queue
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Resend JOIN_ROOM this often until a roster arrives
    #[serde(default = "default_join_retry_ms")]
    pub join_retry_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            rendezvous: default_rendezvous(),
            display_name: String::new(),
            event_capacity: default_event_capacity(),
            join_retry_ms: default_join_retry_ms(),
        }
    }
}

impl Validate for ClientConfig {
    fn validate(&self) -> Result<(), AppError> {
        parse_addr("bind", &self.bind)?;
        parse_addr("rendezvous", &self.rendezvous)?;
        if self.event_capacity == 0 {
            return Err(AppError::Config(
                "event_capacity must be at least 1".into(),
            ));
        }
        if self.join_retry_ms == 0 {
            return Err(AppError::Config(
                "join_retry_ms must be greater than 0".into(),
            ));
        }
        if self.display_name.len() > u16::MAX as usize {
            return Err(AppError::Config("display_name is too long".into()));
        }
        Ok(())
    }
}

impl ClientConfig {
    pub fn bind_addr(&self) -> Result<SocketAddr, AppError> {
        parse_addr("bind", &self.bind)
    }

    pub fn rendezvous_addr(&self) -> Result<SocketAddr, AppError> {
        parse_addr("rendezvous", &self.rendezvous)
    }

    pub fn join_retry(&self) -> Duration {
        Duration::from_millis(self.join_retry_ms)
    }
}

/// Read and validate a JSON config file
pub fn load_from_file<T: Validate>(path: impl AsRef<Path>) -> Result<T, AppError> {
    let path = path.as_ref();
    let s = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("read {} failed: {e}", path.display())))?;
    load_from_str(&s)
}

/// Parse and validate a JSON config string
pub fn load_from_str<T: Validate>(s: &str) -> Result<T, AppError> {
    let cfg: T =
        serde_json::from_str(s).map_err(|e| AppError::Config(format!("invalid json: {e}")))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Config types checked after parsing
pub trait Validate: for<'de> Deserialize<'de> {
    fn validate(&self) -> Result<(), AppError>;
}

fn parse_addr(field: &str, value: &str) -> Result<SocketAddr, AppError> {
    value
        .parse()
        .map_err(|e| AppError::Config(format!("{field}: invalid address '{value}': {e}")))
}

fn default_listen() -> String {
    "0.0.0.0:9000".into()
}
fn default_sweep_interval_ms() -> u64 {
    2000
}
fn default_ping_after_ms() -> u64 {
    5000
}
fn default_evict_after_ms() -> u64 {
    15000
}
fn default_bind() -> String {
    "0.0.0.0:0".into()
}
fn default_rendezvous() -> String {
    "127.0.0.1:9000".into()
}
fn default_event_capacity() -> usize {
    256
}
fn default_join_retry_ms() -> u64 {
    3000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let cfg: ServerConfig = load_from_str("{}").unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:9000");
        assert_eq!(cfg.ping_after(), Duration::from_secs(5));
        assert_eq!(cfg.evict_after(), Duration::from_secs(15));

        let cfg: ClientConfig = load_from_str("{}").unwrap();
        assert_eq!(cfg.event_capacity, 256);
        assert!(cfg.display_name.is_empty());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = load_from_str::<ServerConfig>(r#"{"listne": "0.0.0.0:1"}"#).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_evict_must_exceed_ping() {
        let err = load_from_str::<ServerConfig>(
            r#"{"ping_after_ms": 5000, "evict_after_ms": 5000}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("evict_after_ms"));
    }

    #[test]
    fn test_sweep_not_slower_than_ping() {
        assert!(load_from_str::<ServerConfig>(r#"{"sweep_interval_ms": 6000}"#).is_err());
    }

    #[test]
    fn test_client_addresses_validated() {
        assert!(load_from_str::<ClientConfig>(r#"{"rendezvous": "nowhere"}"#).is_err());
        assert!(load_from_str::<ClientConfig>(r#"{"event_capacity": 0}"#).is_err());

        let cfg: ClientConfig =
            load_from_str(r#"{"rendezvous": "10.0.0.1:7000", "display_name": "alice"}"#).unwrap();
        assert_eq!(cfg.rendezvous_addr().unwrap(), "10.0.0.1:7000".parse().unwrap());
    }
}

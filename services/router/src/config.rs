//! Router configuration.
//!
//! Two layers:
//! - the routing file (JSON): listen port, services, fallback, TLS files
//! - process settings from the environment: timeouts, caps, logging

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::proxy::{
    Endpoint, ExtractConfig, ListenerConfig, PipelineConfig, RoutingTable,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_EXTRACT_TIMEOUT, DEFAULT_HALF_CLOSE_TIMEOUT,
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_PREFIX_BYTES,
};

/// Smallest accepted prefix cap.
pub const MIN_PREFIX_BYTES: usize = 1024;

/// Certificate and key locations.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TlsFiles {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Routing file as written on disk.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    pub listen_port: i64,
    pub mode: String,
    /// Entries in file order; duplicates are kept so they can be rejected.
    #[serde(default, deserialize_with = "ordered_entries")]
    pub services: Vec<(String, Endpoint)>,
    pub default_fallback: Option<Endpoint>,
    pub tls: TlsFiles,
}

/// Routing file after validation.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    pub listen_port: u16,
    pub routing_table: RoutingTable,
    pub tls: TlsFiles,
}

impl RouterConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a routing file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    /// Check mode and ports and build the routing table.
    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        if self.mode != "tls" {
            return Err(ConfigError::UnsupportedMode(self.mode));
        }

        let listen_port = u16::try_from(self.listen_port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or(ConfigError::InvalidPort {
                context: "listen_port".to_string(),
                port: self.listen_port,
            })?;

        let routing_table = RoutingTable::new(self.services, self.default_fallback)?;

        Ok(ValidatedConfig {
            listen_port,
            routing_table,
            tls: self.tls,
        })
    }
}

/// Collect a JSON object into ordered pairs instead of a map.
fn ordered_entries<'de, D>(deserializer: D) -> Result<Vec<(String, Endpoint)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct EntriesVisitor;

    impl<'de> Visitor<'de> for EntriesVisitor {
        type Value = Vec<(String, Endpoint)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of service identifiers to backends")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((identifier, endpoint)) = map.next_entry::<String, Endpoint>()? {
                entries.push((identifier, endpoint));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(EntriesVisitor)
}

/// Process settings (env-driven).
#[derive(Debug, Clone)]
pub struct Settings {
    /// Path to the routing file.
    pub config_path: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Address to bind the listener on.
    pub bind_host: IpAddr,

    /// Time budget for identifying the service.
    pub extract_timeout: Duration,

    /// Byte cap while identifying the service.
    pub max_prefix_bytes: usize,

    /// TLS handshake timeout.
    pub handshake_timeout: Duration,

    /// Backend connect timeout.
    pub connect_timeout: Duration,

    /// Idle timeout across both directions; none means relays never time out.
    pub idle_timeout: Option<Duration>,

    /// Quiet period allowed once one direction has closed.
    pub half_close_timeout: Duration,

    /// Maximum concurrent sessions.
    pub max_connections: usize,

    /// Send a protocol-level error to clients whose backend is down.
    pub reject_unreachable: bool,
}

impl Settings {
    /// Load settings from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_path = lookup("ROUTER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config.json"));

        let log_level = lookup("ROUTER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let bind_host: IpAddr = parse_var(&lookup, "ROUTER_BIND_HOST", "an IP address")?
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));

        let extract_timeout =
            parse_millis(&lookup, "ROUTER_EXTRACT_TIMEOUT_MS")?.unwrap_or(DEFAULT_EXTRACT_TIMEOUT);

        let max_prefix_bytes: usize = parse_var(&lookup, "ROUTER_MAX_PREFIX_BYTES", "an integer (bytes)")?
            .unwrap_or(DEFAULT_MAX_PREFIX_BYTES)
            .max(MIN_PREFIX_BYTES);

        let handshake_timeout = parse_millis(&lookup, "ROUTER_HANDSHAKE_TIMEOUT_MS")?
            .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT);

        let connect_timeout =
            parse_millis(&lookup, "ROUTER_CONNECT_TIMEOUT_MS")?.unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        let idle_timeout =
            parse_millis(&lookup, "ROUTER_IDLE_TIMEOUT_MS")?.filter(|d| !d.is_zero());

        let half_close_timeout = parse_millis(&lookup, "ROUTER_HALF_CLOSE_TIMEOUT_MS")?
            .unwrap_or(DEFAULT_HALF_CLOSE_TIMEOUT);

        let max_connections: usize = parse_var(&lookup, "ROUTER_MAX_CONNECTIONS", "an integer")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let reject_unreachable = lookup("ROUTER_REJECT_UNREACHABLE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        Ok(Self {
            config_path,
            log_level,
            bind_host,
            extract_timeout,
            max_prefix_bytes,
            handshake_timeout,
            connect_timeout,
            idle_timeout,
            half_close_timeout,
            max_connections,
            reject_unreachable,
        })
    }

    /// Listener configuration for the given port.
    pub fn listener_config(&self, listen_port: u16) -> ListenerConfig {
        let mut config = ListenerConfig::new(SocketAddr::new(self.bind_host, listen_port));
        config.max_connections = self.max_connections;
        config.handshake_timeout = self.handshake_timeout;
        config.connect_timeout = self.connect_timeout;
        config.extract = ExtractConfig {
            timeout: self.extract_timeout,
            max_bytes: self.max_prefix_bytes,
        };
        config.pipeline = PipelineConfig {
            idle_timeout: self.idle_timeout,
            half_close_timeout: self.half_close_timeout,
            reject_unreachable: self.reject_unreachable,
        };
        config
    }
}

fn parse_var<T, F>(lookup: &F, name: &str, expected: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{} must be {}.", name, expected))
}

fn parse_millis<F>(lookup: &F, name: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_var::<u64, F>(lookup, name, "an integer (milliseconds)")?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const EXAMPLE: &str = r#"{
      "listen_port": 443,
      "mode": "tls",
      "services": {
        "YunService": { "host": "127.0.0.1", "port": 3443 },
        "example.ProductService": { "host": "127.0.0.1", "port": 50052 },
        "greet.Greeter": { "host": "127.0.0.1", "port": 50053 }
      },
      "default_fallback": { "host": "127.0.0.1", "port": 50051 },
      "tls": { "cert_file": "/etc/V2bX/fullchain.cer", "key_file": "/etc/V2bX/cert.key" }
    }"#;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_parse_example_config() {
        let config = RouterConfig::from_json(EXAMPLE).unwrap();
        assert_eq!(config.services.len(), 3);
        assert_eq!(config.services[0].0, "YunService");

        let validated = config.validate().unwrap();
        assert_eq!(validated.listen_port, 443);
        assert_eq!(validated.routing_table.resolve("greet.Greeter").port, 50053);
        assert_eq!(validated.routing_table.resolve("unknown.Service").port, 50051);
        assert_eq!(validated.tls.cert_file, PathBuf::from("/etc/V2bX/fullchain.cer"));
    }

    #[test]
    fn test_duplicate_service_key_rejected() {
        let json = r#"{
          "listen_port": 443,
          "mode": "tls",
          "services": {
            "greet.Greeter": { "host": "127.0.0.1", "port": 50053 },
            "greet.Greeter": { "host": "127.0.0.1", "port": 50054 }
          },
          "default_fallback": { "host": "127.0.0.1", "port": 50051 },
          "tls": { "cert_file": "c", "key_file": "k" }
        }"#;

        let err = RouterConfig::from_json(json).unwrap().validate().unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateIdentifier(ref id) if id == "greet.Greeter"));
    }

    #[test]
    fn test_missing_fallback_rejected() {
        let json = r#"{
          "listen_port": 443,
          "mode": "tls",
          "services": {},
          "tls": { "cert_file": "c", "key_file": "k" }
        }"#;

        let err = RouterConfig::from_json(json).unwrap().validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingFallback));
    }

    #[test]
    fn test_mode_and_listen_port_validated() {
        let json = EXAMPLE.replace(r#""mode": "tls""#, r#""mode": "tcp""#);
        let err = RouterConfig::from_json(&json).unwrap().validate().unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedMode(ref m) if m == "tcp"));

        let json = EXAMPLE.replace("\"listen_port\": 443", "\"listen_port\": 0");
        let err = RouterConfig::from_json(&json).unwrap().validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort { port: 0, .. }));
    }

    #[test]
    fn test_malformed_json() {
        let err = RouterConfig::from_json("{ not json").unwrap_err();
        assert_eq!(err.reason_code(), "config_parse_failed");

        let err = RouterConfig::from_json(r#"{"listen_port": 443, "mode": "tls", "services": [], "tls": {"cert_file": "c", "key_file": "k"}}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::from_lookup(lookup(&[])).unwrap();
        assert_eq!(settings.config_path, PathBuf::from("config.json"));
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.extract_timeout, DEFAULT_EXTRACT_TIMEOUT);
        assert_eq!(settings.max_prefix_bytes, DEFAULT_MAX_PREFIX_BYTES);
        assert_eq!(settings.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert!(settings.idle_timeout.is_none());
        assert_eq!(settings.half_close_timeout, DEFAULT_HALF_CLOSE_TIMEOUT);
        assert!(settings.reject_unreachable);

        let listener = settings.listener_config(8443);
        assert_eq!(listener.bind_addr, "0.0.0.0:8443".parse::<SocketAddr>().unwrap());
        assert_eq!(listener.max_connections, DEFAULT_MAX_CONNECTIONS);
    }

    #[test]
    fn test_settings_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            ("ROUTER_CONFIG", "/etc/switchyard/routes.json"),
            ("ROUTER_BIND_HOST", "::"),
            ("ROUTER_EXTRACT_TIMEOUT_MS", "250"),
            ("ROUTER_MAX_PREFIX_BYTES", "10"),
            ("ROUTER_IDLE_TIMEOUT_MS", "30000"),
            ("ROUTER_HALF_CLOSE_TIMEOUT_MS", "1500"),
            ("ROUTER_REJECT_UNREACHABLE", "false"),
        ]))
        .unwrap();

        assert_eq!(settings.config_path, PathBuf::from("/etc/switchyard/routes.json"));
        assert_eq!(settings.extract_timeout, Duration::from_millis(250));
        assert_eq!(settings.max_prefix_bytes, MIN_PREFIX_BYTES);
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(30)));
        assert!(!settings.reject_unreachable);

        let listener = settings.listener_config(443);
        assert_eq!(listener.bind_addr, "[::]:443".parse::<SocketAddr>().unwrap());
        assert_eq!(listener.extract.timeout, Duration::from_millis(250));
        assert_eq!(listener.pipeline.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(listener.pipeline.half_close_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_settings_idle_zero_means_unset() {
        let settings = Settings::from_lookup(lookup(&[("ROUTER_IDLE_TIMEOUT_MS", "0")])).unwrap();
        assert!(settings.idle_timeout.is_none());
    }

    #[test]
    fn test_settings_invalid_integer() {
        let err = Settings::from_lookup(lookup(&[("ROUTER_CONNECT_TIMEOUT_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("ROUTER_CONNECT_TIMEOUT_MS"));
    }
}

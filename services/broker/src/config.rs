//! Broker configuration.
//!
//! [`BrokerOptions`] is what the library needs to build a binder. [`Config`]
//! wraps it with the process-group settings the `portshare` binary reads
//! from the environment.

use std::str::FromStr;
use std::time::Duration;

use portshare_networking::{PortRange, DEFAULT_MAX_ATTEMPTS};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::proxy::ProxyVersion;

/// Default host the physical proxy socket binds to.
pub const DEFAULT_PROXY_HOST: &str = "0.0.0.0";

/// Default time allowed for a PROXY header to arrive.
pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(1);

/// Default number of worker processes spawned by the binary.
pub const DEFAULT_WORKERS: usize = 2;

/// Options shared by every binder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    /// Physical port to multiplex over. `None` selects direct binding.
    pub proxy_port: Option<u16>,
    /// Host of the physical proxy socket.
    pub proxy_host: String,
    /// Range ephemeral and explicit ports are drawn from.
    pub port_range: Option<PortRange>,
    /// PROXY protocol version expected on the physical socket.
    pub proxy_version: ProxyVersion,
    /// Candidates tried per ephemeral allocation.
    pub max_attempts: usize,
    /// Worker-side bound on waiting for an acknowledgement.
    pub request_timeout: Option<Duration>,
    /// Bound on receiving a PROXY header.
    pub header_timeout: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            proxy_port: None,
            proxy_host: DEFAULT_PROXY_HOST.to_string(),
            port_range: None,
            proxy_version: ProxyVersion::V1,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout: None,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
        }
    }
}

/// JSON form of the options object.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawOptions {
    proxy_port: Option<u16>,
    proxy_host: Option<String>,
    port_range: Option<RawRange>,
    proxy_version: Option<String>,
    max_attempts: Option<usize>,
    request_timeout_ms: Option<u64>,
    header_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRange {
    low: u16,
    high: u16,
}

impl BrokerOptions {
    /// Whether connections are multiplexed over one physical port.
    pub fn is_proxy(&self) -> bool {
        self.proxy_port.is_some()
    }

    /// Reject inconsistent options before anything is bound.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if let Some(range) = &self.port_range {
            // Re-check in case the struct was built field by field.
            PortRange::new(range.low(), range.high())?;
        }
        if self.header_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "header_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse an options object such as
    /// `{ "proxyPort": 9000, "portRange": { "low": 5000, "high": 5010 } }`.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: RawOptions =
            serde_json::from_str(json).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut options = BrokerOptions {
            proxy_port: raw.proxy_port,
            ..Default::default()
        };
        if let Some(host) = raw.proxy_host {
            options.proxy_host = host;
        }
        if let Some(range) = raw.port_range {
            options.port_range = Some(PortRange::new(range.low, range.high)?);
        }
        if let Some(version) = raw.proxy_version {
            options.proxy_version = version.parse()?;
        }
        if let Some(max_attempts) = raw.max_attempts {
            options.max_attempts = max_attempts;
        }
        options.request_timeout = raw.request_timeout_ms.map(Duration::from_millis);
        if let Some(ms) = raw.header_timeout_ms {
            options.header_timeout = Duration::from_millis(ms);
        }

        options.validate()?;
        Ok(options)
    }
}

/// Role of the current process within the group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Worker,
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Role::Primary),
            "worker" => Ok(Role::Worker),
            _ => Err(ConfigError::Role(s.to_string())),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

/// Binary configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Role of this process (`PORTSHARE_ROLE`).
    pub role: Role,

    /// Binder options.
    pub options: BrokerOptions,

    /// Number of workers the primary spawns.
    pub workers: usize,

    /// Ports each worker requests; `0` asks for an ephemeral port.
    pub worker_ports: Vec<u16>,

    /// Host each worker requests.
    pub worker_host: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let role = lookup("PORTSHARE_ROLE")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(Role::Primary);

        let mut options = BrokerOptions {
            proxy_port: parse_opt(&lookup, "PORTSHARE_PROXY_PORT")?,
            ..Default::default()
        };
        if let Some(host) = lookup("PORTSHARE_PROXY_HOST") {
            options.proxy_host = host;
        }
        options.port_range = lookup("PORTSHARE_PORT_RANGE")
            .map(|v| v.parse::<PortRange>())
            .transpose()?;
        if let Some(version) = lookup("PORTSHARE_PROXY_VERSION") {
            options.proxy_version = version.parse()?;
        }
        if let Some(max_attempts) = parse_opt(&lookup, "PORTSHARE_MAX_ATTEMPTS")? {
            options.max_attempts = max_attempts;
        }
        options.request_timeout =
            parse_opt::<u64>(&lookup, "PORTSHARE_REQUEST_TIMEOUT_MS")?.map(Duration::from_millis);
        if let Some(ms) = parse_opt::<u64>(&lookup, "PORTSHARE_HEADER_TIMEOUT_MS")? {
            options.header_timeout = Duration::from_millis(ms);
        }
        options.validate()?;

        let workers = parse_opt(&lookup, "PORTSHARE_WORKERS")?.unwrap_or(DEFAULT_WORKERS);

        let worker_ports = match lookup("PORTSHARE_WORKER_PORTS") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| parse_value("PORTSHARE_WORKER_PORTS", p))
                .collect::<Result<Vec<u16>, _>>()?,
            None => vec![0],
        };

        let worker_host =
            lookup("PORTSHARE_WORKER_HOST").unwrap_or_else(|| DEFAULT_PROXY_HOST.to_string());

        let log_level = lookup("PORTSHARE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            role,
            options,
            workers,
            worker_ports,
            worker_host,
            log_level,
        })
    }
}

fn parse_value<T: FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::NotNumeric {
        name,
        value: value.to_string(),
    })
}

fn parse_opt<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(name).map(|v| parse_value(name, &v)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use portshare_networking::NetworkError;
    use rstest::rstest;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_from_json_recognised_options() {
        let options = BrokerOptions::from_json(
            r#"{"proxyPort": 9000, "portRange": {"low": 5000, "high": 5010}}"#,
        )
        .unwrap();
        assert_eq!(options.proxy_port, Some(9000));
        assert_eq!(options.port_range, Some(PortRange::new(5000, 5010).unwrap()));
        assert_eq!(options.proxy_host, DEFAULT_PROXY_HOST);
        assert_eq!(options.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(options.is_proxy());
    }

    #[test]
    fn test_from_json_empty_is_direct() {
        let options = BrokerOptions::from_json("{}").unwrap();
        assert_eq!(options, BrokerOptions::default());
        assert!(!options.is_proxy());
    }

    #[rstest]
    #[case::string_port(r#"{"proxyPort": "9000"}"#)]
    #[case::string_low(r#"{"portRange": {"low": "5000", "high": 5010}}"#)]
    #[case::port_overflow(r#"{"proxyPort": 70000}"#)]
    #[case::negative(r#"{"portRange": {"low": -1, "high": 5010}}"#)]
    #[case::unknown_field(r#"{"proxy_port": 9000}"#)]
    fn test_from_json_rejects_non_numeric(#[case] json: &str) {
        assert!(matches!(
            BrokerOptions::from_json(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_from_json_rejects_inverted_range() {
        let err =
            BrokerOptions::from_json(r#"{"portRange": {"low": 5010, "high": 5000}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::PortRange(_)));
    }

    #[rstest]
    #[case::single(r#"{"portRange": {"low": 0, "high": 0}}"#)]
    #[case::from_zero(r#"{"portRange": {"low": 0, "high": 10}}"#)]
    fn test_from_json_rejects_range_with_port_zero(#[case] json: &str) {
        assert!(matches!(
            BrokerOptions::from_json(json),
            Err(ConfigError::PortRange(NetworkError::ZeroPort { low: 0, .. }))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let options = BrokerOptions {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.role, Role::Primary);
        assert_eq!(config.workers, DEFAULT_WORKERS);
        assert_eq!(config.worker_ports, vec![0]);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.options, BrokerOptions::default());
    }

    #[test]
    fn test_env_full() {
        let config = Config::from_lookup(lookup_from(&[
            ("PORTSHARE_ROLE", "worker"),
            ("PORTSHARE_PROXY_PORT", "9000"),
            ("PORTSHARE_PROXY_HOST", "127.0.0.1"),
            ("PORTSHARE_PORT_RANGE", "5000-5010"),
            ("PORTSHARE_PROXY_VERSION", "v2"),
            ("PORTSHARE_MAX_ATTEMPTS", "16"),
            ("PORTSHARE_REQUEST_TIMEOUT_MS", "2500"),
            ("PORTSHARE_WORKERS", "4"),
            ("PORTSHARE_WORKER_PORTS", "5001, 0,5003"),
            ("PORTSHARE_LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(config.role, Role::Worker);
        assert_eq!(config.options.proxy_port, Some(9000));
        assert_eq!(config.options.proxy_host, "127.0.0.1");
        assert_eq!(config.options.proxy_version, ProxyVersion::V2);
        assert_eq!(config.options.max_attempts, 16);
        assert_eq!(
            config.options.request_timeout,
            Some(Duration::from_millis(2500))
        );
        assert_eq!(config.workers, 4);
        assert_eq!(config.worker_ports, vec![5001, 0, 5003]);
        assert_eq!(config.log_level, "debug");
    }

    #[rstest]
    #[case("PORTSHARE_PROXY_PORT", "nine")]
    #[case("PORTSHARE_MAX_ATTEMPTS", "-3")]
    #[case("PORTSHARE_WORKERS", "many")]
    #[case("PORTSHARE_WORKER_PORTS", "5001,x")]
    #[case("PORTSHARE_REQUEST_TIMEOUT_MS", "1s")]
    fn test_env_non_numeric(#[case] name: &str, #[case] value: &str) {
        let err = Config::from_lookup(lookup_from(&[(name, value)])).unwrap_err();
        assert!(matches!(err, ConfigError::NotNumeric { .. }), "{err}");
    }

    #[rstest]
    #[case("PORTSHARE_PORT_RANGE", "5010-5000")]
    #[case("PORTSHARE_PORT_RANGE", "5000")]
    #[case("PORTSHARE_PORT_RANGE", "0-0")]
    #[case("PORTSHARE_PORT_RANGE", "0-10")]
    fn test_env_bad_range(#[case] name: &str, #[case] value: &str) {
        let err = Config::from_lookup(lookup_from(&[(name, value)])).unwrap_err();
        assert!(matches!(err, ConfigError::PortRange(_)));
    }

    #[test]
    fn test_env_bad_version_and_role() {
        assert!(matches!(
            Config::from_lookup(lookup_from(&[("PORTSHARE_PROXY_VERSION", "v3")])),
            Err(ConfigError::ProxyVersion(_))
        ));
        assert!(matches!(
            Config::from_lookup(lookup_from(&[("PORTSHARE_ROLE", "leader")])),
            Err(ConfigError::Role(_))
        ));
    }
}

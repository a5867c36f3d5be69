//! This module controls configuration parsing from the end user. Every field
//! has a default so that the tool runs against the local node with no
//! configuration file at all.
use std::{
    env, fs,
    net::Ipv6Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use tracing::debug;

use crate::scrape::parser::DEFAULT_PREFIXES;

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<std::io::Error>,
    },
    /// The sampling interval must be positive
    #[error("interval_seconds must be greater than zero")]
    ZeroInterval,
    /// At least one metric prefix is required
    #[error("No metric prefixes configured")]
    NoPrefixes,
    /// Metric prefixes must be non-empty
    #[error("Empty metric prefix configured")]
    EmptyPrefix,
}

fn default_interval_seconds() -> u64 {
    60
}

fn default_prefixes() -> Vec<String> {
    DEFAULT_PREFIXES.iter().map(ToString::to_string).collect()
}

fn default_port() -> u16 {
    9000
}

fn default_path() -> String {
    "/prometheus-metrics".to_string()
}

fn default_timeout_seconds() -> u64 {
    10
}

fn default_accept_invalid_certs() -> bool {
    true
}

/// Main configuration struct for this program
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Seconds to wait between the two samples
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Where to scrape
    #[serde(default)]
    pub endpoint: Endpoint,
    /// Metric family stems to consider, each must be a `_sum` / `_count`
    /// histogram family
    #[serde(default = "default_prefixes")]
    pub prefixes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            endpoint: Endpoint::default(),
            prefixes: default_prefixes(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// URI scheme of the metrics endpoint
pub enum Scheme {
    /// Plain HTTP
    #[default]
    Http,
    /// HTTP over TLS
    Https,
}

impl Scheme {
    /// The scheme as it appears in a URI
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Configuration of the scraped endpoint
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Endpoint {
    /// URI scheme
    #[serde(default)]
    pub scheme: Scheme,
    /// Host to scrape. When unset the local hostname is resolved to an IPv4
    /// address.
    pub host: Option<String>,
    /// Port to scrape
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path of the metrics page
    #[serde(default = "default_path")]
    pub path: String,
    /// Per-request timeout
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// TLS settings, only used with [`Scheme::Https`]
    #[serde(default)]
    pub tls: Tls,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            scheme: Scheme::default(),
            host: None,
            port: default_port(),
            path: default_path(),
            timeout_seconds: default_timeout_seconds(),
            tls: Tls::default(),
        }
    }
}

impl Endpoint {
    /// The request timeout
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// The URI of the metrics page on `host`. IPv6 literals are bracketed.
    #[must_use]
    pub fn uri(&self, host: &str) -> String {
        let path = self.path.trim_start_matches('/');
        let scheme = self.scheme.as_str();
        let port = self.port;
        if host.parse::<Ipv6Addr>().is_ok() {
            format!("{scheme}://[{host}]:{port}/{path}")
        } else {
            format!("{scheme}://{host}:{port}/{path}")
        }
    }
}

/// TLS client settings
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Tls {
    /// Directory holding `node.<host>.crt` and `node.<host>.key`. Defaults to
    /// `~/yugabyte-tls-config`.
    pub directory: Option<PathBuf>,
    /// Skip server certificate verification
    #[serde(default = "default_accept_invalid_certs")]
    pub accept_invalid_certs: bool,
}

impl Default for Tls {
    fn default() -> Self {
        Self {
            directory: None,
            accept_invalid_certs: default_accept_invalid_certs(),
        }
    }
}

impl Tls {
    /// The configured certificate directory or the default under `$HOME`
    #[must_use]
    pub fn directory(&self) -> PathBuf {
        if let Some(dir) = &self.directory {
            return dir.clone();
        }
        let home = env::var_os("HOME").map_or_else(|| PathBuf::from("."), PathBuf::from);
        home.join("yugabyte-tls-config")
    }

    /// Certificate and key paths for `host`
    #[must_use]
    pub fn identity_paths(&self, host: &str) -> (PathBuf, PathBuf) {
        let dir = self.directory();
        (
            dir.join(format!("node.{host}.crt")),
            dir.join(format!("node.{host}.key")),
        )
    }
}

impl Config {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid YAML for
    /// [`Config`], or fails validation.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ReadFile {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        debug!("Loading configuration from {path:?}");
        contents.parse()
    }

    /// The interval between the two samples
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Check the invariants serde cannot express
    ///
    /// # Errors
    ///
    /// Returns an error if the interval is zero or the prefix list is empty
    /// or contains an empty prefix.
    pub fn validate(&self) -> Result<(), Error> {
        if self.interval_seconds == 0 {
            return Err(Error::ZeroInterval);
        }
        if self.prefixes.is_empty() {
            return Err(Error::NoPrefixes);
        }
        if self.prefixes.iter().any(String::is_empty) {
            return Err(Error::EmptyPrefix);
        }
        Ok(())
    }
}

impl std::str::FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn config_deserializes_defaults() {
        let config: Config = "{}".parse().expect("empty config is valid");
        assert_eq!(config, Config::default());
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(config.endpoint.port, 9000);
        assert_eq!(config.endpoint.scheme, Scheme::Http);
        assert_eq!(
            config.prefixes,
            vec![
                "log_append_latency",
                "log_group_commit_latency",
                "log_sync_latency"
            ]
        );
    }

    #[test]
    fn config_deserializes() {
        let contents = r#"
interval_seconds: 5
endpoint:
  scheme: https
  host: 10.0.0.7
  port: 9100
  path: metrics
  timeout_seconds: 2
  tls:
    directory: /etc/certs
    accept_invalid_certs: false
prefixes:
  - rpc_latency
"#;
        let config: Config = contents.parse().expect("config should parse");
        assert_eq!(config.interval(), Duration::from_secs(5));
        assert_eq!(config.prefixes, vec!["rpc_latency"]);
        assert_eq!(
            config.endpoint,
            Endpoint {
                scheme: Scheme::Https,
                host: Some("10.0.0.7".to_string()),
                port: 9100,
                path: "metrics".to_string(),
                timeout_seconds: 2,
                tls: Tls {
                    directory: Some(PathBuf::from("/etc/certs")),
                    accept_invalid_certs: false,
                },
            }
        );
        assert_eq!(config.endpoint.uri("10.0.0.7"), "https://10.0.0.7:9100/metrics");
        assert_eq!(
            config.endpoint.tls.identity_paths("10.0.0.7"),
            (
                PathBuf::from("/etc/certs/node.10.0.0.7.crt"),
                PathBuf::from("/etc/certs/node.10.0.0.7.key")
            )
        );
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let result: Result<Config, _> = "interval: 5".parse();
        assert!(matches!(result, Err(Error::SerdeYaml(_))));
    }

    #[test]
    fn config_validation() {
        assert!(matches!(
            "interval_seconds: 0".parse::<Config>(),
            Err(Error::ZeroInterval)
        ));
        assert!(matches!(
            "prefixes: []".parse::<Config>(),
            Err(Error::NoPrefixes)
        ));
        assert!(matches!(
            "prefixes: ['']".parse::<Config>(),
            Err(Error::EmptyPrefix)
        ));
    }

    #[test]
    fn default_uri() {
        assert_eq!(
            Endpoint::default().uri("127.0.0.1"),
            "http://127.0.0.1:9000/prometheus-metrics"
        );
    }

    #[test]
    fn ipv6_host_is_bracketed() {
        let endpoint = Endpoint::default();
        assert_eq!(endpoint.uri("::1"), "http://[::1]:9000/prometheus-metrics");
        assert_eq!(
            endpoint.uri("fe80::1:2"),
            "http://[fe80::1:2]:9000/prometheus-metrics"
        );
        assert_eq!(
            endpoint.uri("db-1.internal"),
            "http://db-1.internal:9000/prometheus-metrics"
        );
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        writeln!(file, "interval_seconds: 15").expect("write temp file");

        let config = Config::load(file.path()).expect("config should load");
        assert_eq!(config.interval_seconds, 15);

        let missing = Config::load(&file.path().with_extension("missing"));
        assert!(matches!(missing, Err(Error::ReadFile { .. })));
    }
}

//! Server settings, read once from `SLOTBOOK_*` environment variables.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::limits::DEFAULT_MAX_SPAN_MS;
use crate::model::{HOUR_MS, Ms};

#[derive(Debug)]
pub enum ConfigError {
    /// Variable present but unparseable.
    Invalid { var: &'static str, value: String },
    /// Malformed `user:password` entry in `SLOTBOOK_ACCOUNTS`.
    Account(String),
    /// Only one of cert/key was given.
    TlsPair,
    Tls(io::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
            ConfigError::Account(entry) => {
                write!(f, "invalid SLOTBOOK_ACCOUNTS entry {entry:?}, expected user:password")
            }
            ConfigError::TlsPair => write!(
                f,
                "both SLOTBOOK_TLS_CERT and SLOTBOOK_TLS_KEY must be set, or neither"
            ),
            ConfigError::Tls(e) => write!(f, "TLS setup failed: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Password of the shared `anonymous` login.
    pub anonymous_password: String,
    pub accounts: HashMap<String, String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub max_span: Ms,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let max_span_hours: i64 = parse_or(&lookup, "SLOTBOOK_MAX_SPAN_HOURS", DEFAULT_MAX_SPAN_MS / HOUR_MS)?;
        let max_span = max_span_hours
            .checked_mul(HOUR_MS)
            .filter(|ms| *ms > 0)
            .ok_or_else(|| ConfigError::Invalid {
                var: "SLOTBOOK_MAX_SPAN_HOURS",
                value: max_span_hours.to_string(),
            })?;
        let metrics_port = match lookup("SLOTBOOK_METRICS_PORT") {
            Some(v) => Some(parse_value("SLOTBOOK_METRICS_PORT", &v)?),
            None => None,
        };
        let tls_cert = lookup("SLOTBOOK_TLS_CERT");
        let tls_key = lookup("SLOTBOOK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }

        Ok(Self {
            port: parse_or(&lookup, "SLOTBOOK_PORT", 5433)?,
            bind: lookup("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: PathBuf::from(lookup("SLOTBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            anonymous_password: lookup("SLOTBOOK_PASSWORD").unwrap_or_else(|| "anonymous".into()),
            accounts: parse_accounts(&lookup("SLOTBOOK_ACCOUNTS").unwrap_or_default())?,
            max_connections: parse_or(&lookup, "SLOTBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "SLOTBOOK_COMPACT_THRESHOLD", 1000)?,
            max_span,
            metrics_port,
            tls_cert,
            tls_key,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => load_tls_acceptor(cert, key).map(Some).map_err(ConfigError::Tls),
            (None, None) => Ok(None),
            _ => Err(ConfigError::TlsPair),
        }
    }
}

fn parse_value<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(v) => parse_value(var, &v),
        None => Ok(default),
    }
}

/// `alice:secret,bob:hunter2`. Blank entries are skipped.
pub fn parse_accounts(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut accounts = HashMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((user, password)) = entry.split_once(':') else {
            return Err(ConfigError::Account(entry.to_string()));
        };
        let user = user.trim();
        if user.is_empty() || user == crate::auth::ANONYMOUS_USER {
            return Err(ConfigError::Account(entry.to_string()));
        }
        accounts.insert(user.to_string(), password.to_string());
    }
    Ok(accounts)
}

fn load_tls_acceptor(cert_path: &str, key_path: &str) -> io::Result<TlsAcceptor> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no private key in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.anonymous_password, "anonymous");
        assert!(config.accounts.is_empty());
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.max_span, DEFAULT_MAX_SPAN_MS);
        assert_eq!(config.metrics_port, None);
        assert!(config.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn overrides() {
        let config = config_from(&[
            ("SLOTBOOK_PORT", "6000"),
            ("SLOTBOOK_BIND", "127.0.0.1"),
            ("SLOTBOOK_MAX_SPAN_HOURS", "8"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
            ("SLOTBOOK_ACCOUNTS", "alice:wonder, bob:builder"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.max_span, 8 * HOUR_MS);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.accounts.get("bob").map(String::as_str), Some("builder"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            config_from(&[("SLOTBOOK_PORT", "http")]),
            Err(ConfigError::Invalid { var: "SLOTBOOK_PORT", .. })
        ));
        assert!(config_from(&[("SLOTBOOK_MAX_SPAN_HOURS", "0")]).is_err());
    }

    #[test]
    fn max_span_hours_overflow_is_invalid() {
        let huge = (i64::MAX / HOUR_MS + 1).to_string();
        assert!(matches!(
            config_from(&[("SLOTBOOK_MAX_SPAN_HOURS", huge.as_str())]),
            Err(ConfigError::Invalid { var: "SLOTBOOK_MAX_SPAN_HOURS", .. })
        ));
        assert!(matches!(
            config_from(&[("SLOTBOOK_MAX_SPAN_HOURS", "-3")]),
            Err(ConfigError::Invalid { var: "SLOTBOOK_MAX_SPAN_HOURS", .. })
        ));
    }

    #[test]
    fn rejects_tls_half_pair() {
        assert!(matches!(
            config_from(&[("SLOTBOOK_TLS_CERT", "cert.pem")]),
            Err(ConfigError::TlsPair)
        ));
    }

    #[test]
    fn account_parsing() {
        let accounts = parse_accounts("alice:a:b,,carol:").unwrap();
        assert_eq!(accounts.get("alice").map(String::as_str), Some("a:b"));
        assert_eq!(accounts.get("carol").map(String::as_str), Some(""));
        assert!(matches!(parse_accounts("nocolon"), Err(ConfigError::Account(_))));
        assert!(parse_accounts("anonymous:x").is_err());
        assert!(parse_accounts(":pw").is_err());
    }
}

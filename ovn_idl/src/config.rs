//! Connection configuration types.

use std::{
    fmt::{Display, Formatter},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    engine::SessionOptions,
    error::{IdlError, IdlResult},
    nb::{NB_SCHEMA, NB_TABLES},
    retry::RetryPolicy,
    sb::{SB_SCHEMA, SB_TABLES},
};

const DEFAULT_OVSDB_PORT: u16 = 6640;

/// An OVSDB remote: `tcp:HOST[:PORT]`, `ssl:HOST[:PORT]` or `unix:PATH`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Tcp { host: String, port: u16 },
    Ssl { host: String, port: u16 },
    Unix { path: String },
}

impl Endpoint {
    pub fn parse(raw: &str) -> IdlResult<Self> {
        let raw = raw.trim();
        let (scheme, rest) = raw
            .split_once(':')
            .ok_or_else(|| IdlError::Config(format!("invalid OVSDB remote '{raw}'")))?;
        match scheme {
            "tcp" => {
                let (host, port) = parse_host_port(raw, rest)?;
                Ok(Endpoint::Tcp { host, port })
            }
            "ssl" => {
                let (host, port) = parse_host_port(raw, rest)?;
                Ok(Endpoint::Ssl { host, port })
            }
            "unix" if !rest.is_empty() => Ok(Endpoint::Unix {
                path: rest.to_string(),
            }),
            _ => Err(IdlError::Config(format!(
                "unsupported OVSDB remote '{raw}'"
            ))),
        }
    }

    /// Comma-separated remote list, tried in order.
    pub fn parse_list(raw: &str) -> IdlResult<Vec<Self>> {
        let remotes = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect::<IdlResult<Vec<_>>>()?;
        if remotes.is_empty() {
            return Err(IdlError::Config("OVSDB connection should not be empty".to_string()));
        }
        Ok(remotes)
    }

    pub fn is_ssl(&self) -> bool {
        matches!(self, Endpoint::Ssl { .. })
    }
}

fn parse_host_port(raw: &str, rest: &str) -> IdlResult<(String, u16)> {
    let invalid = || IdlError::Config(format!("invalid OVSDB remote '{raw}'"));

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
        match tail {
            "" => (host, None),
            _ => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
        }
    } else {
        match rest.split_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (rest, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = match port {
        Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
        None => DEFAULT_OVSDB_PORT,
    };
    Ok((host.to_string(), port))
}

fn write_host_port(
    f: &mut Formatter<'_>,
    scheme: &str,
    host: &str,
    port: u16,
) -> std::fmt::Result {
    if host.contains(':') {
        write!(f, "{scheme}:[{host}]:{port}")
    } else {
        write!(f, "{scheme}:{host}:{port}")
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write_host_port(f, "tcp", host, *port),
            Endpoint::Ssl { host, port } => write_host_port(f, "ssl", host, *port),
            Endpoint::Unix { path } => write!(f, "unix:{path}"),
        }
    }
}

/// TLS material for `ssl:` remotes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SslConfig {
    pub private_key: String,
    pub certificate: String,
    pub ca_cert: String,
}

impl SslConfig {
    pub fn validate(&self) -> Result<(), String> {
        for (name, path) in [
            ("private_key", &self.private_key),
            ("certificate", &self.certificate),
            ("ca_cert", &self.ca_cert),
        ] {
            if path.trim().is_empty() {
                return Err(format!("{name} should not be empty"));
            }
        }
        Ok(())
    }
}

/// Process-level OVN connection options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OvnConfig {
    #[serde(default = "default_nb_connection")]
    pub ovn_nb_connection: String,
    #[serde(default = "default_sb_connection")]
    pub ovn_sb_connection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovn_nb_ssl: Option<SslConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovn_sb_ssl: Option<SslConfig>,
    /// Transaction and shutdown timeout
    #[serde(default = "default_ovsdb_connection_timeout_secs")]
    pub ovsdb_connection_timeout_secs: u64,
    /// Inactivity probe; 0 disables it
    #[serde(default = "default_ovsdb_probe_interval_ms")]
    pub ovsdb_probe_interval_ms: u64,
    #[serde(default = "RetryPolicy::bootstrap")]
    pub bootstrap_retry: RetryPolicy,
    #[serde(default = "RetryPolicy::row_visibility")]
    pub row_retry: RetryPolicy,
}

fn default_nb_connection() -> String {
    "tcp:127.0.0.1:6641".to_string()
}

fn default_sb_connection() -> String {
    "tcp:127.0.0.1:6642".to_string()
}

fn default_ovsdb_connection_timeout_secs() -> u64 {
    180
}

fn default_ovsdb_probe_interval_ms() -> u64 {
    60_000
}

impl Default for OvnConfig {
    fn default() -> Self {
        Self {
            ovn_nb_connection: default_nb_connection(),
            ovn_sb_connection: default_sb_connection(),
            ovn_nb_ssl: None,
            ovn_sb_ssl: None,
            ovsdb_connection_timeout_secs: default_ovsdb_connection_timeout_secs(),
            ovsdb_probe_interval_ms: default_ovsdb_probe_interval_ms(),
            bootstrap_retry: RetryPolicy::bootstrap(),
            row_retry: RetryPolicy::row_visibility(),
        }
    }
}

impl OvnConfig {
    pub fn validate(&self) -> Result<(), String> {
        check_remotes("ovn_nb_connection", &self.ovn_nb_connection, &self.ovn_nb_ssl)?;
        check_remotes("ovn_sb_connection", &self.ovn_sb_connection, &self.ovn_sb_ssl)?;

        if self.ovsdb_connection_timeout_secs == 0 {
            return Err("ovsdb_connection_timeout_secs must be greater than 0".to_string());
        }
        if self.ovsdb_probe_interval_ms != 0 && self.ovsdb_probe_interval_ms < 1_000 {
            return Err("ovsdb_probe_interval_ms must be 0 or at least 1000".to_string());
        }

        self.bootstrap_retry
            .validate()
            .map_err(|e| format!("bootstrap_retry: {e}"))?;
        self.row_retry
            .validate()
            .map_err(|e| format!("row_retry: {e}"))?;
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.ovsdb_connection_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.ovsdb_probe_interval_ms)
    }

    pub fn nb_settings(&self, lock_name: Option<&str>) -> IdlResult<ConnectionSettings> {
        let mut settings = ConnectionSettings::new(
            Endpoint::parse_list(&self.ovn_nb_connection)?,
            NB_SCHEMA,
            NB_TABLES.iter().copied(),
        );
        settings.ssl = self.ovn_nb_ssl.clone();
        Ok(self.apply_common(settings, lock_name))
    }

    pub fn sb_settings(&self, lock_name: Option<&str>) -> IdlResult<ConnectionSettings> {
        let mut settings = ConnectionSettings::new(
            Endpoint::parse_list(&self.ovn_sb_connection)?,
            SB_SCHEMA,
            SB_TABLES.iter().copied(),
        );
        settings.ssl = self.ovn_sb_ssl.clone();
        Ok(self.apply_common(settings, lock_name))
    }

    fn apply_common(
        &self,
        mut settings: ConnectionSettings,
        lock_name: Option<&str>,
    ) -> ConnectionSettings {
        settings.timeout = self.connection_timeout();
        settings.probe_interval = self.probe_interval();
        settings.lock_name = lock_name.map(str::to_string);
        settings.bootstrap_retry = self.bootstrap_retry.clone();
        settings.row_retry = self.row_retry.clone();
        settings
    }
}

fn check_remotes(field: &str, raw: &str, ssl: &Option<SslConfig>) -> Result<(), String> {
    let remotes = Endpoint::parse_list(raw).map_err(|e| format!("{field}: {e}"))?;
    if remotes.iter().any(Endpoint::is_ssl) {
        match ssl {
            Some(ssl) => ssl.validate().map_err(|e| format!("{field}: {e}"))?,
            None => return Err(format!("{field}: ssl remote requires TLS files")),
        }
    }
    Ok(())
}

/// Everything needed to bootstrap and run one mirrored connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionSettings {
    pub remotes: Vec<Endpoint>,
    pub schema_name: String,
    pub tables: Vec<String>,
    pub timeout: Duration,
    pub probe_interval: Duration,
    pub lock_name: Option<String>,
    pub ssl: Option<SslConfig>,
    pub bootstrap_retry: RetryPolicy,
    pub row_retry: RetryPolicy,
}

impl ConnectionSettings {
    pub fn new<I, S>(remotes: Vec<Endpoint>, schema_name: &str, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            remotes,
            schema_name: schema_name.to_string(),
            tables: tables.into_iter().map(Into::into).collect(),
            timeout: Duration::from_secs(default_ovsdb_connection_timeout_secs()),
            probe_interval: Duration::from_millis(default_ovsdb_probe_interval_ms()),
            lock_name: None,
            ssl: None,
            bootstrap_retry: RetryPolicy::bootstrap(),
            row_retry: RetryPolicy::row_visibility(),
        }
    }

    pub fn with_lock(mut self, name: impl Into<String>) -> Self {
        self.lock_name = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_bootstrap_retry(mut self, policy: RetryPolicy) -> Self {
        self.bootstrap_retry = policy;
        self
    }

    pub fn with_row_retry(mut self, policy: RetryPolicy) -> Self {
        self.row_retry = policy;
        self
    }

    pub fn with_ssl(mut self, ssl: SslConfig) -> Self {
        self.ssl = Some(ssl);
        self
    }

    /// TLS files must be configured before any `ssl:` remote is dialled.
    pub fn check_ssl(&self) -> IdlResult<()> {
        if !self.remotes.iter().any(Endpoint::is_ssl) {
            return Ok(());
        }
        match &self.ssl {
            Some(ssl) => ssl.validate().map_err(IdlError::Config),
            None => Err(IdlError::Config(format!(
                "{}: ssl remote requires private key, certificate and CA certificate",
                self.schema_name
            ))),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            timeout: self.timeout,
            probe_interval: self.probe_interval,
            ssl: self.ssl.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoints() {
        assert_eq!(
            Endpoint::parse("tcp:127.0.0.1:6641").unwrap(),
            Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: 6641
            }
        );
        assert_eq!(
            Endpoint::parse("ssl:[2001:db8::10]:6642").unwrap(),
            Endpoint::Ssl {
                host: "2001:db8::10".to_string(),
                port: 6642
            }
        );
        assert_eq!(
            Endpoint::parse("tcp:ovn-central").unwrap(),
            Endpoint::Tcp {
                host: "ovn-central".to_string(),
                port: 6640
            }
        );
        assert_eq!(
            Endpoint::parse("unix:/var/run/ovn/ovnnb_db.sock").unwrap(),
            Endpoint::Unix {
                path: "/var/run/ovn/ovnnb_db.sock".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_remotes() {
        for raw in [
            "",
            "tcp",
            "ptcp:6641",
            "tcp::6641",
            "tcp:host:notaport",
            "ssl:[::1",
            "ssl:[::1]6641",
            "unix:",
        ] {
            assert!(Endpoint::parse(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn test_display_round_trips() {
        for raw in [
            "tcp:10.0.0.1:6641",
            "ssl:[2001:db8::10]:6642",
            "unix:/run/ovn/ovnsb_db.sock",
        ] {
            assert_eq!(Endpoint::parse(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn test_parse_list() {
        let remotes = Endpoint::parse_list("tcp:10.0.0.1:6641, tcp:10.0.0.2:6641,").unwrap();
        assert_eq!(remotes.len(), 2);
        assert!(Endpoint::parse_list(" , ").is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = OvnConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.connection_timeout(), Duration::from_secs(180));
        assert_eq!(config.probe_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: OvnConfig =
            serde_json::from_str(r#"{"ovn_nb_connection": "tcp:192.0.2.1:6641"}"#).unwrap();
        assert_eq!(config.ovn_nb_connection, "tcp:192.0.2.1:6641");
        assert_eq!(config.ovn_sb_connection, "tcp:127.0.0.1:6642");
        assert_eq!(config.row_retry, RetryPolicy::row_visibility());
    }

    #[test]
    fn test_ssl_remote_requires_files() {
        let mut config = OvnConfig {
            ovn_nb_connection: "ssl:10.0.0.1:6641".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.ovn_nb_ssl = Some(SslConfig {
            private_key: "/etc/ovn/key.pem".to_string(),
            certificate: "/etc/ovn/cert.pem".to_string(),
            ca_cert: "/etc/ovn/ca.pem".to_string(),
        });
        assert!(config.validate().is_ok());
        assert!(config.nb_settings(None).unwrap().check_ssl().is_ok());
    }

    #[test]
    fn test_probe_interval_bounds() {
        let config = OvnConfig {
            ovsdb_probe_interval_ms: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = OvnConfig {
            ovsdb_probe_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_settings_from_config() {
        let config = OvnConfig {
            ovsdb_connection_timeout_secs: 30,
            ..Default::default()
        };
        let nb = config.nb_settings(Some("ovn_provider_driver_event_lock")).unwrap();
        assert_eq!(nb.schema_name, NB_SCHEMA);
        assert!(nb.tables.iter().any(|t| t == "Load_Balancer"));
        assert_eq!(nb.timeout, Duration::from_secs(30));
        assert_eq!(nb.lock_name.as_deref(), Some("ovn_provider_driver_event_lock"));
        assert_eq!(nb.session_options().timeout, Duration::from_secs(30));

        let sb = config.sb_settings(None).unwrap();
        assert_eq!(sb.schema_name, SB_SCHEMA);
        assert!(sb.tables.iter().any(|t| t == "Service_Monitor"));
        assert!(sb.lock_name.is_none());
    }
}

//! Config file loading and validation (spec §10.2). Grounded on
//! `main.go`'s `Config`/`loadConfig`/`checkConfig` (original source).

use std::path::Path;

use serde::{Deserialize, Serialize};
use warren_core::error::ProxyError;

fn default_log_level() -> String {
    "info".to_owned()
}

/// The on-disk JSON shape, one field per original config key. Every field
/// a subcommand doesn't need is simply left at its default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub listen: Option<String>,
    pub key: Option<String>,
    pub endpoint: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub server_preset: Option<String>,
    pub speedtest_endpoint: Option<String>,
    pub client_pool: Option<usize>,
    pub client_resolver: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("cannot open config file `{}`: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| ProxyError::Config(format!("cannot parse config file `{}`: {e}", path.display())))
    }

    /// Flag values win over file values; `self` supplies whatever the
    /// flags left unset.
    pub fn merge_over(mut self, flags: Self) -> Self {
        self.listen = flags.listen.or(self.listen);
        self.key = flags.key.or(self.key);
        self.endpoint = flags.endpoint.or(self.endpoint);
        self.insecure = flags.insecure || self.insecure;
        self.tls_cert = flags.tls_cert.or(self.tls_cert);
        self.tls_key = flags.tls_key.or(self.tls_key);
        if flags.log_level != default_log_level() {
            self.log_level = flags.log_level;
        }
        self.server_preset = flags.server_preset.or(self.server_preset);
        self.speedtest_endpoint = flags.speedtest_endpoint.or(self.speedtest_endpoint);
        self.client_pool = flags.client_pool.or(self.client_pool);
        self.client_resolver = flags.client_resolver.or(self.client_resolver);
        self
    }
}

/// Validated server-mode configuration.
pub struct ServerConfig {
    pub listen: String,
    pub path: String,
    pub key: String,
    pub insecure: bool,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub server_preset: Option<String>,
    pub speedtest_endpoint: Option<String>,
    pub log_level: String,
}

impl ServerConfig {
    pub fn from_file(cfg: FileConfig) -> Result<Self, ProxyError> {
        let key = cfg.key.unwrap_or_default();
        if key.is_empty() {
            return Err(ProxyError::Config("empty key".into()));
        }
        let listen = cfg
            .listen
            .ok_or_else(|| ProxyError::Config("missing `listen`".into()))?;
        let path = cfg
            .endpoint
            .ok_or_else(|| ProxyError::Config("missing `endpoint` (mount path)".into()))?;
        if !cfg.insecure && (cfg.tls_cert.is_none() || cfg.tls_key.is_none()) {
            return Err(ProxyError::Config(
                "`tls_cert` and `tls_key` are required unless `insecure` is set".into(),
            ));
        }
        Ok(Self {
            listen,
            path,
            key,
            insecure: cfg.insecure,
            tls_cert: cfg.tls_cert,
            tls_key: cfg.tls_key,
            server_preset: cfg.server_preset,
            speedtest_endpoint: cfg.speedtest_endpoint,
            log_level: cfg.log_level,
        })
    }
}

/// Validated client-mode (HTTP or NAT ingress) configuration.
pub struct ClientConfig {
    pub listen: String,
    pub endpoint: String,
    pub key: String,
    pub insecure: bool,
    pub client_pool: usize,
    pub client_resolver: Option<String>,
    pub log_level: String,
}

impl ClientConfig {
    pub fn from_file(cfg: FileConfig) -> Result<Self, ProxyError> {
        let key = cfg.key.unwrap_or_default();
        if key.is_empty() {
            return Err(ProxyError::Config("empty key".into()));
        }
        let listen = cfg
            .listen
            .ok_or_else(|| ProxyError::Config("missing `listen`".into()))?;
        let endpoint = cfg
            .endpoint
            .ok_or_else(|| ProxyError::Config("missing `endpoint`".into()))?;

        let scheme = endpoint.split_once("://").map(|(scheme, _)| scheme);
        match scheme {
            Some("wss") => {}
            Some("ws") => {
                if !cfg.insecure {
                    return Err(ProxyError::Config("do not use `ws` unless `insecure` is set".into()));
                }
            }
            _ => {
                return Err(ProxyError::Config(format!(
                    "invalid endpoint `{endpoint}`: scheme must be ws or wss"
                )));
            }
        }

        Ok(Self {
            listen,
            endpoint,
            key,
            insecure: cfg.insecure,
            client_pool: cfg.client_pool.unwrap_or(4),
            client_resolver: cfg.client_resolver,
            log_level: cfg.log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> FileConfig {
        FileConfig {
            listen: Some("127.0.0.1:8080".into()),
            key: Some("secret".into()),
            endpoint: Some("wss://example.com/proxy".into()),
            ..Default::default()
        }
    }

    #[test]
    fn rejects_empty_key() {
        let mut cfg = base();
        cfg.key = Some(String::new());
        assert!(ClientConfig::from_file(cfg).is_err());
    }

    #[test]
    fn rejects_ws_without_insecure() {
        let mut cfg = base();
        cfg.endpoint = Some("ws://example.com/proxy".into());
        assert!(ClientConfig::from_file(cfg).is_err());
    }

    #[test]
    fn accepts_ws_with_insecure() {
        let mut cfg = base();
        cfg.endpoint = Some("ws://example.com/proxy".into());
        cfg.insecure = true;
        assert!(ClientConfig::from_file(cfg).is_ok());
    }

    #[test]
    fn accepts_wss_without_insecure() {
        assert!(ClientConfig::from_file(base()).is_ok());
    }

    #[test]
    fn flags_override_file_values() {
        let file = base();
        let flags = FileConfig {
            listen: Some("0.0.0.0:9090".into()),
            ..Default::default()
        };
        let merged = file.merge_over(flags);
        assert_eq!(merged.listen.as_deref(), Some("0.0.0.0:9090"));
        assert_eq!(merged.key.as_deref(), Some("secret"));
    }
}

//! CLI subcommands (spec §10.2): `server`, `client-http`, `client-nat`.

pub mod client_http;
pub mod client_nat;
pub mod server;

use std::{path::PathBuf, sync::Arc};

use clap::Args;

use warren_core::{dial::Resolve, error::BoxError};

use crate::config::FileConfig;

/// Flags common to every subcommand; a config file takes priority... no,
/// a flag takes priority over the config file when both are given (see
/// `FileConfig::merge_over`).
#[derive(Debug, Args)]
pub struct CommonArgs {
    /// Path to a JSON config file (spec §10.2).
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub listen: Option<String>,
    #[arg(long)]
    pub key: Option<String>,
    #[arg(long)]
    pub endpoint: Option<String>,
    #[arg(long)]
    pub insecure: bool,
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl CommonArgs {
    fn as_flags(&self) -> FileConfig {
        FileConfig {
            listen: self.listen.clone(),
            key: self.key.clone(),
            endpoint: self.endpoint.clone(),
            insecure: self.insecure,
            log_level: self.log_level.clone(),
            ..Default::default()
        }
    }

    /// Loads the config file named by `--config`, if any, then overlays
    /// these flags on top of it.
    pub fn resolve(&self) -> Result<FileConfig, warren_core::error::ProxyError> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Ok(file.merge_over(self.as_flags()))
    }
}

/// Builds a TLS connector for a `wss://` endpoint, using the system's
/// webpki-backed trust store; `None` for `ws://` endpoints.
pub fn tls_connector_if_needed(
    endpoint: &warren_core::dial::Endpoint,
) -> Result<Option<tokio_rustls::TlsConnector>, BoxError> {
    if !endpoint.tls {
        return Ok(None);
    }
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Some(tokio_rustls::TlsConnector::from(Arc::new(config))))
}

/// Overrides outbound DNS resolution at a specific resolver address
/// (spec §4.2, grounded on `client_misc.go`'s `getClientResolverDialer`):
/// `udp://host:port` or `tcp://host:port`. `None` if `raw` is unset.
pub fn build_resolver(raw: Option<&str>) -> Result<Option<Arc<dyn Resolve>>, BoxError> {
    let Some(raw) = raw else { return Ok(None) };
    if raw.is_empty() {
        return Ok(None);
    }

    let uri: http::Uri = raw.parse().map_err(|e| format!("cannot parse value of client_resolver: {e}"))?;
    let protocol = match uri.scheme_str() {
        Some("udp") => hickory_resolver::config::Protocol::Udp,
        Some("tcp") => hickory_resolver::config::Protocol::Tcp,
        other => {
            return Err(format!(
                "Supported schemes of client_resolver: udp, tcp. Got {}",
                other.unwrap_or("<none>")
            )
            .into());
        }
    };
    let authority = uri.authority().ok_or("client_resolver value has no host:port")?;
    let socket_addr: std::net::SocketAddr = authority
        .as_str()
        .parse()
        .map_err(|e| format!("client_resolver value must be host:port: {e}"))?;

    Ok(Some(Arc::new(HickoryResolverOverride::new(socket_addr, protocol))))
}

struct HickoryResolverOverride {
    resolver: hickory_resolver::TokioResolver,
}

impl HickoryResolverOverride {
    fn new(socket_addr: std::net::SocketAddr, protocol: hickory_resolver::config::Protocol) -> Self {
        let mut nameserver = hickory_resolver::config::NameServerConfig::new(socket_addr, protocol);
        nameserver.trust_negative_responses = false;
        let mut resolver_config = hickory_resolver::config::ResolverConfig::new();
        resolver_config.add_name_server(nameserver);
        let mut builder = hickory_resolver::Resolver::builder_with_config(
            resolver_config,
            hickory_resolver::name_server::TokioConnectionProvider::default(),
        );
        builder.options_mut().use_hosts_file = false;
        Self { resolver: builder.build() }
    }
}

impl Resolve for HickoryResolverOverride {
    fn resolve(
        &self,
        host: &str,
        port: u16,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<std::net::SocketAddr>> + Send + '_>>
    {
        let host = host.to_owned();
        Box::pin(async move {
            let response = self
                .resolver
                .lookup_ip(host.as_str())
                .await
                .map_err(std::io::Error::other)?;
            let ip = response
                .iter()
                .next()
                .ok_or_else(|| std::io::Error::other("no addresses returned"))?;
            Ok(std::net::SocketAddr::new(ip, port))
        })
    }
}

//! `warren server`: runs the inbound upgrade handler plus the real-IP
//! and speed-test helpers behind a TLS or plain TCP listener. Grounded
//! on `server.go`'s `runServer`/`serverPreset` (original source).

use std::{sync::Arc, time::Duration};

use clap::Args;
use tokio::net::TcpListener;
use tokio_graceful::Shutdown;

use warren_core::error::BoxError;
use warren_server::Handler;
use warren_serverhelper::{AuthKey, AwsCloudfrontRealIp, CloudflareRealIp, DefaultRealIp, RealIp, StaticKeyAuthenticator};

use crate::{cmd::CommonArgs, config::ServerConfig};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Args)]
pub struct ServerArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Path to the TLS certificate chain (PEM); required unless `--insecure`.
    #[arg(long)]
    pub tls_cert: Option<String>,
    /// Path to the TLS private key (PEM); required unless `--insecure`.
    #[arg(long)]
    pub tls_key: Option<String>,
    /// Real-IP extraction preset: `cloudflare` or `aws_cloudfront`.
    #[arg(long)]
    pub server_preset: Option<String>,
    /// Path to mount the speed-test route at; omit to disable it.
    #[arg(long)]
    pub speedtest_endpoint: Option<String>,
}

pub async fn run(args: ServerArgs) -> Result<(), BoxError> {
    let mut cfg = args.common.resolve()?;
    cfg.tls_cert = args.tls_cert.or(cfg.tls_cert);
    cfg.tls_key = args.tls_key.or(cfg.tls_key);
    cfg.server_preset = args.server_preset.or(cfg.server_preset);
    cfg.speedtest_endpoint = args.speedtest_endpoint.or(cfg.speedtest_endpoint);
    let cfg = ServerConfig::from_file(cfg)?;

    let real_ip: Arc<dyn RealIp> = match cfg.server_preset.as_deref() {
        None => Arc::new(DefaultRealIp),
        Some("cloudflare") => Arc::new(CloudflareRealIp::new()),
        Some("aws_cloudfront") => Arc::new(AwsCloudfrontRealIp::new()),
        Some(other) => return Err(format!("unexpected server preset: {other}").into()),
    };

    let auth = StaticKeyAuthenticator::new(AuthKey::new(cfg.key.clone()));
    let authenticator: warren_server::handler::Authenticator =
        Arc::new(move |ip, presented| auth.authenticate(ip, presented));

    let mut handler = Handler::new(cfg.path.clone(), authenticator, real_ip);
    if let Some(path) = &cfg.speedtest_endpoint {
        handler = handler.with_speedtest_path(path.clone());
    }
    let handler = Arc::new(handler);

    let acceptor = if cfg.insecure {
        None
    } else {
        let (cert, key) = (
            cfg.tls_cert.as_deref().ok_or("missing tls_cert")?,
            cfg.tls_key.as_deref().ok_or("missing tls_key")?,
        );
        Some(warren_server::tls::load_acceptor(cert, key)?)
    };

    let listener = TcpListener::bind(&cfg.listen).await?;
    tracing::info!(listen = %cfg.listen, path = %cfg.path, "server listening");

    let shutdown = Shutdown::default();
    shutdown.spawn_task_fn(async move |guard| {
        loop {
            let accept = tokio::select! {
                accept = listener.accept() => accept,
                () = guard.cancelled() => break,
            };
            let Ok((sock, peer)) = accept else { continue };
            let handler = Arc::clone(&handler);
            let acceptor = acceptor.clone();
            let conn_guard = guard.clone();
            tokio::spawn(async move {
                let _conn_guard = conn_guard;
                match acceptor {
                    Some(acceptor) => match acceptor.accept(sock).await {
                        Ok(tls) => handler.serve_connection(tls, peer).await,
                        Err(err) => tracing::warn!(%err, %peer, "tls accept failure"),
                    },
                    None => handler.serve_connection(sock, peer).await,
                }
            });
        }
    });

    shutdown.shutdown_with_limit(SHUTDOWN_GRACE).await?;
    Ok(())
}

//! `warren client-nat`: Linux-only transparent-redirect ingress atop the
//! idle-session pool (spec §10.4). Grounded on `client_nat.go`'s
//! `NatServer`/`getTcpConnOrigDst` (original source), extended to cover
//! the IPv6 `SO_ORIGINAL_DST` path the original only documents as a gap.

use clap::Args;
use warren_core::error::BoxError;

use crate::cmd::CommonArgs;

#[derive(Debug, Args)]
pub struct ClientNatArgs {
    #[command(flatten)]
    pub common: CommonArgs,
    /// Number of pre-handshaken idle sessions to keep pooled.
    #[arg(long)]
    pub client_pool: Option<usize>,
    /// Custom DNS resolver for outbound endpoint resolution, as
    /// `udp://host:port` or `tcp://host:port`.
    #[arg(long)]
    pub client_resolver: Option<String>,
}

#[cfg(not(target_os = "linux"))]
pub async fn run(_args: ClientNatArgs) -> Result<(), BoxError> {
    Err("client-nat is only supported on Linux: SO_ORIGINAL_DST is a Linux netfilter primitive with no portable equivalent".into())
}

#[cfg(target_os = "linux")]
pub async fn run(args: ClientNatArgs) -> Result<(), BoxError> {
    use std::sync::Arc;

    use tokio::net::TcpListener;
    use warren_core::{
        dial::{Dialer, Endpoint},
        stream::TunnelIo,
    };
    use warren_pool::Pool;

    use crate::config::ClientConfig;

    let mut cfg = args.common.resolve()?;
    cfg.client_pool = args.client_pool.or(cfg.client_pool);
    cfg.client_resolver = args.client_resolver.or(cfg.client_resolver);
    let cfg = ClientConfig::from_file(cfg)?;

    let endpoint = Endpoint::parse(&cfg.endpoint)?;
    let mut dialer = Dialer::new(super::tls_connector_if_needed(&endpoint)?);
    if let Some(resolver) = super::build_resolver(cfg.client_resolver.as_deref())? {
        dialer = dialer.with_resolver(resolver);
    }
    let pool = Pool::new(endpoint, cfg.key.clone(), cfg.client_pool, dialer);

    let listener = TcpListener::bind(&cfg.listen).await?;
    tracing::info!(listen = %cfg.listen, "client-nat listening");

    loop {
        let (sock, peer) = listener.accept().await?;
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            let target = match linux::original_dst(&sock) {
                Ok(addr) => addr,
                Err(err) => {
                    tracing::warn!(%peer, %err, "failed to get orig dst addr");
                    return;
                }
            };
            tracing::info!(%peer, %target, "incoming");

            let conn = match pool.dial("tcp", &target.to_string()).await {
                Ok(conn) => conn,
                Err(err) => {
                    tracing::error!(%peer, %target, %err, "request err");
                    return;
                }
            };
            tracing::info!(%peer, %target, "connected");

            let stats = warren_core::bridge::bridge(conn.as_ref(), &sock).await;
            tracing::info!(%peer, %target, sent = stats.a_to_b, received = stats.b_to_a, "disconnect");
            let _ = sock;
        });
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::{
        net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
        os::fd::AsRawFd,
    };

    use tokio::net::TcpStream;

    /// `SO_ORIGINAL_DST`, shared by the IPv4 and IPv6 netfilter REDIRECT
    /// targets (`linux/netfilter_ipv4.h`, `linux/netfilter_ipv6/ip6_tables.h`).
    const SO_ORIGINAL_DST: libc::c_int = 80;

    /// Recovers the pre-NAT destination of a socket accepted off a
    /// `REDIRECT`-target `iptables`/`nft` rule, via `getsockopt(SO_ORIGINAL_DST)`.
    pub fn original_dst(sock: &TcpStream) -> std::io::Result<SocketAddr> {
        let fd = sock.as_raw_fd();
        if sock.local_addr()?.is_ipv4() {
            original_dst_v4(fd)
        } else {
            original_dst_v6(fd)
        }
    }

    fn original_dst_v4(fd: std::os::fd::RawFd) -> std::io::Result<SocketAddr> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_IP,
                SO_ORIGINAL_DST,
                std::ptr::addr_of_mut!(addr).cast(),
                &mut len,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
        let port = u16::from_be(addr.sin_port);
        Ok(SocketAddr::new(IpAddr::V4(ip), port))
    }

    fn original_dst_v6(fd: std::os::fd::RawFd) -> std::io::Result<SocketAddr> {
        let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::IPPROTO_IPV6,
                SO_ORIGINAL_DST,
                std::ptr::addr_of_mut!(addr).cast(),
                &mut len,
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
        let port = u16::from_be(addr.sin6_port);
        Ok(SocketAddr::new(IpAddr::V6(ip), port))
    }
}

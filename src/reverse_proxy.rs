//! Fixed-target TCP reverse proxy: accept -> optional accept hook ->
//! dial the configured upstream -> relay. No protocol parsing of its
//! own; the only session that doesn't negotiate anything with the
//! client first.

use std::io;
use std::net::SocketAddr;

use log::{debug, info, trace, warn};
use tokio::net::{TcpListener, TcpStream};

use crate::error::ProxyError;
use crate::policy::PolicyHooks;
use crate::relay::relay_stream;

/// Listens for clients and relays each accepted connection to a single
/// fixed `(target_host, target_port)`, mirroring kitty_proxy's
/// `HttpProxy`/`SocksProxy` wrapper shape but with no handshake of its
/// own.
pub struct ReverseProxy {
    listener: TcpListener,
    target_host: String,
    target_port: u16,
    hooks: PolicyHooks,
}

impl ReverseProxy {
    pub async fn new(
        ip: &str,
        port: u16,
        target_host: impl Into<String>,
        target_port: u16,
        hooks: PolicyHooks,
    ) -> io::Result<Self> {
        let target_host = target_host.into();
        info!("Reverse proxy listening on {ip}:{port}, forwarding to {target_host}:{target_port}");
        Ok(Self {
            listener: TcpListener::bind((ip, port)).await?,
            target_host,
            target_port,
            hooks,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(&self) {
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("reverse proxy accept failed: {e}");
                    continue;
                }
            };
            let hooks = self.hooks.clone();
            let target = (self.target_host.clone(), self.target_port);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, target, hooks).await {
                    debug!("reverse proxy session with {peer_addr} ended: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    (target_host, target_port): (String, u16),
    hooks: PolicyHooks,
) -> Result<(), ProxyError> {
    if !hooks.check_accept(peer_addr) {
        trace!("reverse proxy accept hook denied {peer_addr}");
        return Ok(());
    }

    let target = format!("{target_host}:{target_port}");
    let upstream = TcpStream::connect(&target)
        .await
        .map_err(ProxyError::UpstreamDial)?;

    trace!("reverse proxy relaying {peer_addr} to {target}");
    relay_stream(&mut client, upstream).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener as TokioListener;

    #[tokio::test]
    async fn relays_to_fixed_target() {
        let upstream_listener = TokioListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = upstream_listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
        });

        let proxy = ReverseProxy::new(
            "127.0.0.1",
            0,
            upstream_addr.ip().to_string(),
            upstream_addr.port(),
            PolicyHooks::new(),
        )
        .await
        .unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(async move {
            proxy.serve().await;
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut resp = [0u8; 4];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(&resp, b"pong");
    }

    #[tokio::test]
    async fn accept_hook_rejection_closes_without_dialing() {
        let proxy = ReverseProxy::new(
            "127.0.0.1",
            0,
            "127.0.0.1".to_string(),
            1, // nothing listens here; if dialed, the test would hang/err
            PolicyHooks::new().with_accept(|_| false),
        )
        .await
        .unwrap();
        let proxy_addr = proxy.local_addr().unwrap();
        tokio::spawn(async move {
            proxy.serve().await;
        });

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "connection should be closed, not relayed");
    }
}

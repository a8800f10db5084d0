//! Per-connection SOCKS5 state machine: negotiation -> optional
//! USERNAME/PASSWORD sub-negotiation -> request -> CONNECT (dial, reply,
//! relay) or UDP_ASSOCIATE (bind relay, reply, hold TCP open).

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::error::{ProxyError, ResponseCode};
use crate::policy::PolicyHooks;
use crate::relay::relay_stream;
use crate::socks5::codec::{self, AuthMethod, Command, Socks5Address, SOCKS5_VERSION};
use crate::socks5::udp::UdpAssociation;

/// How long the TCP hold loop during an active UDP association waits
/// for a read before rechecking whether the client closed the control
/// connection.
const UDP_HOLD_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Listens for SOCKS5 clients and spawns one [`Socks5Session`] per
/// accepted connection, mirroring kitty_proxy's `SocksProxy`.
pub struct Socks5Proxy {
    listener: TcpListener,
    allowed_method: AuthMethod,
    hooks: PolicyHooks,
}

impl Socks5Proxy {
    pub async fn new(
        ip: &str,
        port: u16,
        allowed_method: AuthMethod,
        hooks: PolicyHooks,
    ) -> io::Result<Self> {
        info!("SOCKS5 proxy listening on {ip}:{port}");
        Ok(Self {
            listener: TcpListener::bind((ip, port)).await?,
            allowed_method,
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
                    warn!("SOCKS5 accept failed: {e}");
                    continue;
                }
            };
            let hooks = self.hooks.clone();
            let allowed_method = self.allowed_method;
            tokio::spawn(async move {
                let mut session = Socks5Session::new(stream, allowed_method, hooks);
                if let Err(e) = session.run(peer_addr).await {
                    debug!("SOCKS5 session with {peer_addr} ended: {e}");
                }
            });
        }
    }
}

pub struct Socks5Session<T> {
    stream: T,
    allowed_method: AuthMethod,
    hooks: PolicyHooks,
}

impl<T> Socks5Session<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: T, allowed_method: AuthMethod, hooks: PolicyHooks) -> Self {
        Self {
            stream,
            allowed_method,
            hooks,
        }
    }

    pub async fn run(&mut self, peer_addr: SocketAddr) -> Result<(), ProxyError> {
        if !self.hooks.check_accept(peer_addr) {
            trace!("SOCKS5 accept hook denied {peer_addr}");
            return Ok(());
        }

        if !self.negotiate_method().await? {
            return Ok(());
        }

        if self.allowed_method == AuthMethod::UsernamePassword && !self.authenticate().await? {
            return Ok(());
        }

        let (version, cmd_byte) = {
            let mut header = [0u8; 3];
            tokio::io::AsyncReadExt::read_exact(&mut self.stream, &mut header).await?;
            (header[0], header[1])
        };
        if version != SOCKS5_VERSION {
            return Err(ProxyError::Parse(format!(
                "unsupported SOCKS version in request: {version}"
            )));
        }

        let (dst_addr, dst_port) = match codec::unpack_address_port(&mut self.stream).await {
            Ok(pair) => pair,
            Err(e) => {
                self.reply(
                    ResponseCode::AddrTypeNotSupported,
                    &Socks5Address::V4(std::net::Ipv4Addr::UNSPECIFIED),
                    0,
                )
                .await?;
                return Err(e);
            }
        };

        let command = match Command::from_u8(cmd_byte) {
            Some(c) => c,
            None => {
                self.reply(ResponseCode::CommandNotSupported, &dst_addr, dst_port)
                    .await?;
                return Ok(());
            }
        };

        match command {
            Command::Connect => self.handle_connect(dst_addr, dst_port).await,
            Command::UdpAssociate => self.handle_udp_associate(dst_addr, dst_port).await,
            Command::Bind => {
                self.reply(ResponseCode::CommandNotSupported, &dst_addr, dst_port)
                    .await?;
                Ok(())
            }
        }
    }

    async fn negotiate_method(&mut self) -> Result<bool, ProxyError> {
        let methods = codec::unpack_method_negotiation(&mut self.stream).await?;
        let allowed = self.allowed_method as u8;
        if methods.contains(&allowed) {
            codec::write_method_reply(&mut self.stream, allowed).await?;
            Ok(true)
        } else {
            codec::write_method_reply(&mut self.stream, AuthMethod::NoAcceptableMethods as u8)
                .await?;
            self.stream.shutdown().await?;
            Ok(false)
        }
    }

    async fn authenticate(&mut self) -> Result<bool, ProxyError> {
        let (username, password) = codec::unpack_userpass_auth(&mut self.stream).await?;
        let ok = self.hooks.check_auth(&username, &password);
        codec::write_userpass_reply(&mut self.stream, ok).await?;
        if !ok {
            self.stream.shutdown().await?;
        }
        Ok(ok)
    }

    async fn reply(
        &mut self,
        code: ResponseCode,
        bnd_addr: &Socks5Address,
        bnd_port: u16,
    ) -> Result<(), ProxyError> {
        let frame = codec::generate_reply(code, bnd_addr, bnd_port);
        tokio::io::AsyncWriteExt::write_all(&mut self.stream, &frame).await?;
        Ok(())
    }

    async fn handle_connect(
        &mut self,
        dst_addr: Socks5Address,
        dst_port: u16,
    ) -> Result<(), ProxyError> {
        if !self.hooks.check_connect(&dst_addr.to_string(), dst_port) {
            self.reply(
                ResponseCode::ConnectionNotAllowed,
                &Socks5Address::V4(std::net::Ipv4Addr::UNSPECIFIED),
                0,
            )
            .await?;
            return Ok(());
        }

        let target = format!("{dst_addr}:{dst_port}");
        match TcpStream::connect(&target).await {
            Ok(upstream) => {
                self.reply(
                    ResponseCode::Success,
                    &Socks5Address::V4(std::net::Ipv4Addr::UNSPECIFIED),
                    0,
                )
                .await?;
                trace!("SOCKS5 CONNECT relaying to {target}");
                relay_stream(&mut self.stream, upstream).await;
                Ok(())
            }
            Err(e) => {
                warn!("SOCKS5 CONNECT dial to {target} failed: {e}");
                self.reply(
                    ResponseCode::GeneralFailure,
                    &Socks5Address::V4(std::net::Ipv4Addr::UNSPECIFIED),
                    0,
                )
                .await?;
                Err(ProxyError::UpstreamDial(e))
            }
        }
    }

    async fn handle_udp_associate(
        &mut self,
        dst_addr: Socks5Address,
        dst_port: u16,
    ) -> Result<(), ProxyError> {
        let bind_result = timeout(Duration::from_secs(5), UdpAssociation::bind(dst_addr, dst_port)).await;

        let association = match bind_result {
            Ok(Ok(assoc)) => assoc,
            Ok(Err(e)) => {
                error!("UDP associate bind failed: {e}");
                self.reply(
                    ResponseCode::GeneralFailure,
                    &Socks5Address::V4(std::net::Ipv4Addr::UNSPECIFIED),
                    0,
                )
                .await?;
                return Err(ProxyError::Transport(e));
            }
            Err(_) => {
                error!("UDP associate bind timed out");
                self.reply(
                    ResponseCode::GeneralFailure,
                    &Socks5Address::V4(std::net::Ipv4Addr::UNSPECIFIED),
                    0,
                )
                .await?;
                return Err(ProxyError::Timeout);
            }
        };

        let bind_addr = association.bind_addr();
        self.reply(
            ResponseCode::Success,
            &Socks5Address::from(bind_addr.ip()),
            bind_addr.port(),
        )
        .await?;

        // Hold the control connection open and drain client reads with
        // a 1s timeout loop; zero-byte read tears down the association.
        let mut probe = [0u8; 1];
        loop {
            match timeout(
                UDP_HOLD_READ_TIMEOUT,
                tokio::io::AsyncReadExt::read(&mut self.stream, &mut probe),
            )
            .await
            {
                Ok(Ok(0)) => break,
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => break,
                Err(_) => continue, // recheck loop condition
            }
        }

        drop(association);
        Ok(())
    }
}

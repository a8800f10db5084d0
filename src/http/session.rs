//! Per-connection HTTP forward proxy state machine: parse -> optional
//! auth -> optional policy callback -> dial upstream -> (CONNECT: reply
//! 200 and relay) or (plain: rewrite request line/headers, forward,
//! relay).

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use base64::Engine;
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::error::ProxyError;
use crate::http::parser::{read_http_head, HttpRequest};
use crate::policy::PolicyHooks;
use crate::relay::relay_stream;

/// Overall wall-clock budget for the forward phase (dial + reply/relay
/// setup), measured from first byte after policy checks.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(30);

/// Listens for HTTP forward-proxy clients and spawns one
/// [`HttpSession`] per accepted connection, mirroring kitty_proxy's
/// `HttpProxy`.
pub struct HttpProxy {
    listener: TcpListener,
    hooks: PolicyHooks,
}

impl HttpProxy {
    pub async fn new(ip: &str, port: u16, hooks: PolicyHooks) -> io::Result<Self> {
        info!("HTTP proxy listening on {ip}:{port}");
        Ok(Self {
            listener: TcpListener::bind((ip, port)).await?,
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
                    warn!("HTTP accept failed: {e}");
                    continue;
                }
            };
            let hooks = self.hooks.clone();
            tokio::spawn(async move {
                let mut session = HttpSession::new(stream, hooks);
                if let Err(e) = session.run(peer_addr).await {
                    debug!("HTTP session with {peer_addr} ended: {e}");
                }
            });
        }
    }
}

pub struct HttpSession<T> {
    stream: T,
    hooks: PolicyHooks,
}

impl<T> HttpSession<T>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(stream: T, hooks: PolicyHooks) -> Self {
        Self { stream, hooks }
    }

    pub async fn run(&mut self, peer_addr: SocketAddr) -> Result<(), ProxyError> {
        if !self.hooks.check_accept(peer_addr) {
            trace!("HTTP accept hook denied {peer_addr}");
            return Ok(());
        }

        let head = read_http_head(&mut self.stream).await?;
        let request = HttpRequest::parse(&head)?;
        debug!(
            "HTTP {} {}:{} from {peer_addr}",
            request.method, request.host, request.port
        );

        if self.hooks.auth.is_some() {
            let credentials = request.header("Proxy-Authorization").unwrap_or("");
            let (username, password) = match extract_basic_credentials(credentials) {
                Some(pair) => pair,
                None => return Ok(()),
            };
            if !self.hooks.check_auth(&username, &password) {
                return Ok(());
            }
        }

        if !self.hooks.check_connect(&request.host, request.port) {
            return Ok(());
        }

        match timeout(FORWARD_TIMEOUT, self.forward(&request)).await {
            Ok(result) => result,
            Err(_) => Ok(()), // timeout: end the session without a response
        }
    }

    async fn forward(&mut self, request: &HttpRequest) -> Result<(), ProxyError> {
        if request.method == "CONNECT" {
            self.forward_connect(request).await
        } else {
            self.forward_plain(request).await
        }
    }

    async fn forward_connect(&mut self, request: &HttpRequest) -> Result<(), ProxyError> {
        let target = format!("{}:{}", request.host, request.port);
        let upstream = TcpStream::connect(&target)
            .await
            .map_err(ProxyError::UpstreamDial)?;

        self.stream
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;

        trace!("HTTP CONNECT relaying to {target}");
        relay_stream(&mut self.stream, upstream).await;
        Ok(())
    }

    async fn forward_plain(&mut self, request: &HttpRequest) -> Result<(), ProxyError> {
        let target = format!("{}:{}", request.host, request.port);
        let mut upstream = TcpStream::connect(&target)
            .await
            .map_err(ProxyError::UpstreamDial)?;

        let rewritten = rewrite_request(request);
        upstream.write_all(&rewritten).await?;

        trace!("HTTP plain request relaying to {target}");
        relay_stream(&mut self.stream, upstream).await;
        Ok(())
    }
}

/// Rewrites the absolute-form request into origin-form:
/// `<METHOD> <path> <proto>\r\n` followed by the kept headers and a
/// blank line. No request body is forwarded (see SPEC_FULL.md §9).
fn rewrite_request(request: &HttpRequest) -> Vec<u8> {
    let mut out = format!("{} {} {}\r\n", request.method, request.path, request.proto).into_bytes();
    for (name, value) in request.headers_to_send() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

/// Parses a `Proxy-Authorization` header value, requiring scheme
/// `Basic`, base64-decoding the credentials and splitting on the first
/// `:` into username/password. Returns `None` on any malformed input,
/// which the caller treats the same as an auth hook rejection.
fn extract_basic_credentials(header_value: &str) -> Option<(String, String)> {
    let trimmed = header_value.trim();
    let (scheme, encoded) = trimmed.split_once(' ')?;
    if scheme != "Basic" {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener as TokioListener;

    #[tokio::test]
    async fn connect_tunnel_sends_200_and_relays() {
        let upstream_listener = TokioListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = upstream_listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
        });

        let listener = TokioListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut session = HttpSession::new(stream, PolicyHooks::new());
            session.run(peer).await.unwrap();
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let req = format!(
            "CONNECT 127.0.0.1:{} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\n\r\n",
            upstream_addr.port(),
            upstream_addr.port()
        );
        client.write_all(req.as_bytes()).await.unwrap();

        let mut reply = vec![0u8; b"HTTP/1.1 200 Connection Established\r\n\r\n".len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, b"HTTP/1.1 200 Connection Established\r\n\r\n");

        client.write_all(b"ping").await.unwrap();
        let mut resp = [0u8; 4];
        client.read_exact(&mut resp).await.unwrap();
        assert_eq!(&resp, b"pong");

        drop(client);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn plain_get_is_rewritten_to_origin_form() {
        let upstream_listener = TokioListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        let upstream = tokio::spawn(async move {
            let (mut stream, _) = upstream_listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 256];
            loop {
                let n = stream.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if buf.ends_with(b"\r\n\r\n") || n == 0 {
                    break;
                }
            }
            buf
        });

        let listener = TokioListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut session = HttpSession::new(stream, PolicyHooks::new());
            let _ = session.run(peer).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let req = format!(
            "GET http://127.0.0.1:{}/ HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nUser-Agent: test\r\nAccept-Encoding: gzip, deflate\r\nAccept: */*\r\nProxy-Connection: keep-alive\r\n\r\n",
            upstream_addr.port(),
            upstream_addr.port(),
        );
        client.write_all(req.as_bytes()).await.unwrap();
        drop(client);

        let received = upstream.await.unwrap();
        let expected = format!(
            "GET / HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nUser-Agent: test\r\nAccept-Encoding: gzip, deflate\r\nAccept: */*\r\n\r\n",
            upstream_addr.port(),
        );
        assert_eq!(String::from_utf8(received).unwrap(), expected);
        server.await.unwrap();
    }

    #[test]
    fn extracts_basic_credentials() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("alice:wonderland");
        let header = format!("Basic {encoded}");
        let (user, pass) = extract_basic_credentials(&header).unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "wonderland");
    }

    #[test]
    fn rejects_non_basic_scheme() {
        assert!(extract_basic_credentials("Digest abc").is_none());
    }
}

//! UDP ASSOCIATE relay: a pair of datagram endpoints (client-facing and
//! origin-facing) whose lifetime is coupled to the owning TCP session.
//!
//! Where the reference implementation models each endpoint as a
//! `DatagramProtocol` object whose `connection_made`/`datagram_received`
//! methods are invoked by the event loop, this crate runs each endpoint
//! as an owned `tokio::net::UdpSocket` driven by a dedicated task that
//! `recv_from`s in a loop against a shared stop signal. Both are
//! explicitly sanctioned by the source re-architecture notes.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{trace, warn};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::socks5::codec::{self, Socks5Address};

/// Maximum SOCKS5 UDP datagram this relay will shuttle in one read.
const UDP_BUF_SIZE: usize = 65536;

/// Returns true if `filter` (the DST fields the client supplied in its
/// UDP ASSOCIATE request) matches `actual` (the observed source of a
/// datagram), applying the permissive wildcard relaxations the
/// reference implementation allows: `0.0.0.0`/`::`/port `0` in the
/// filter match any address/port in that coordinate.
fn matches_client_filter(filter: &SocketAddr, actual: &SocketAddr) -> bool {
    let addr_matches = match filter.ip() {
        std::net::IpAddr::V4(v4) if v4.is_unspecified() => true,
        std::net::IpAddr::V6(v6) if v6.is_unspecified() => true,
        ip => ip == actual.ip(),
    };
    let port_matches = filter.port() == 0 || filter.port() == actual.port();
    addr_matches && port_matches
}

/// Owns the client-facing and (lazily created) origin-facing UDP
/// sockets for one SOCKS5 UDP ASSOCIATE. Dropping it stops both
/// forwarding tasks and closes both sockets.
pub struct UdpAssociation {
    bind_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    client_task: JoinHandle<()>,
}

impl UdpAssociation {
    /// Binds the client-facing endpoint on `0.0.0.0:0` and starts the
    /// forwarding loop. `client_filter_addr`/`client_filter_port` are
    /// the DST fields from the client's UDP ASSOCIATE request.
    pub async fn bind(
        client_filter_addr: Socks5Address,
        client_filter_port: u16,
    ) -> std::io::Result<Self> {
        let client_socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let bind_addr = client_socket.local_addr()?;

        let filter = socket_addr_for_filter(&client_filter_addr, client_filter_port);

        let stop = Arc::new(AtomicBool::new(false));
        let client_socket = Arc::new(client_socket);
        let origin_socket: Arc<Mutex<Option<Arc<UdpSocket>>>> = Arc::new(Mutex::new(None));
        let client_endpoint: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));

        let task_stop = stop.clone();
        let task_client_socket = client_socket.clone();
        let task_origin_socket = origin_socket.clone();
        let task_client_endpoint = client_endpoint.clone();

        let client_task = tokio::spawn(async move {
            client_forward_loop(
                task_client_socket,
                task_origin_socket,
                task_client_endpoint,
                filter,
                task_stop,
            )
            .await;
        });

        Ok(Self {
            bind_addr,
            stop,
            client_task,
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }
}

impl Drop for UdpAssociation {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.client_task.abort();
    }
}

fn socket_addr_for_filter(addr: &Socks5Address, port: u16) -> SocketAddr {
    match addr {
        Socks5Address::V4(ip) => SocketAddr::new(std::net::IpAddr::V4(*ip), port),
        Socks5Address::V6(ip) => SocketAddr::new(std::net::IpAddr::V6(*ip), port),
        // A domain name filter never matches a raw datagram source; treat
        // it as "any", matching the permissive semantics of §4.6 step 2.
        Socks5Address::Domain(_) => {
            SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0)
        }
    }
}

/// Client-facing loop: decapsulates inbound SOCKS5 UDP headers, lazily
/// creates the origin-facing socket on first use, and forwards the
/// payload to the stated destination. Also owns the origin-facing
/// receive loop, spawned lazily alongside the origin socket.
async fn client_forward_loop(
    client_socket: Arc<UdpSocket>,
    origin_socket: Arc<Mutex<Option<Arc<UdpSocket>>>>,
    client_endpoint: Arc<Mutex<Option<SocketAddr>>>,
    filter: SocketAddr,
    stop: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; UDP_BUF_SIZE];
    while !stop.load(Ordering::Relaxed) {
        let (n, src) = match client_socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("udp associate: client-facing recv failed: {e}");
                break;
            }
        };

        if !matches_client_filter(&filter, &src) {
            trace!("udp associate: dropping datagram from unexpected source {src}");
            continue;
        }

        let (dst_addr, dst_port, payload) = match codec::unpack_udp_header(&buf[..n]) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("udp associate: malformed client datagram: {e}");
                continue;
            }
        };

        {
            let mut ep = client_endpoint.lock().unwrap();
            *ep = Some(src);
        }

        let origin = {
            let mut guard = origin_socket.lock().unwrap();
            if guard.is_none() {
                match UdpSocket::bind(("0.0.0.0", 0)).await {
                    Ok(sock) => {
                        let sock = Arc::new(sock);
                        *guard = Some(sock.clone());
                        spawn_origin_recv_loop(
                            sock.clone(),
                            client_socket.clone(),
                            client_endpoint.clone(),
                            stop.clone(),
                        );
                    }
                    Err(e) => {
                        warn!("udp associate: failed to bind origin-facing socket: {e}");
                        continue;
                    }
                }
            }
            guard.clone()
        };

        if let Some(origin) = origin {
            let dst = match resolve_socket_addr(&dst_addr, dst_port) {
                Some(addr) => addr,
                None => continue,
            };
            if let Err(e) = origin.send_to(payload, dst).await {
                warn!("udp associate: forward to {dst} failed: {e}");
            }
        }
    }
}

fn resolve_socket_addr(addr: &Socks5Address, port: u16) -> Option<SocketAddr> {
    match addr {
        Socks5Address::V4(ip) => Some(SocketAddr::new(std::net::IpAddr::V4(*ip), port)),
        Socks5Address::V6(ip) => Some(SocketAddr::new(std::net::IpAddr::V6(*ip), port)),
        Socks5Address::Domain(_) => None,
    }
}

/// Origin-facing loop: re-encapsulates replies from the origin with a
/// SOCKS5 UDP header and sends them back to the remembered client
/// endpoint.
fn spawn_origin_recv_loop(
    origin_socket: Arc<UdpSocket>,
    client_socket: Arc<UdpSocket>,
    client_endpoint: Arc<Mutex<Option<SocketAddr>>>,
    stop: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        while !stop.load(Ordering::Relaxed) {
            let (n, src) = match origin_socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(_) => break,
            };

            let client = {
                let ep = client_endpoint.lock().unwrap();
                *ep
            };
            let Some(client) = client else { continue };

            let dst_addr = Socks5Address::from(src.ip());
            let mut out = codec::pack_udp_header(&dst_addr, src.port());
            out.extend_from_slice(&buf[..n]);

            if let Err(e) = client_socket.send_to(&out, client).await {
                warn!("udp associate: reply to client {client} failed: {e}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn wildcard_filter_matches_any_source() {
        let filter: SocketAddr = "0.0.0.0:0".parse().unwrap();
        let actual: SocketAddr = "203.0.113.4:51000".parse().unwrap();
        assert!(matches_client_filter(&filter, &actual));
    }

    #[test]
    fn exact_filter_rejects_mismatched_source() {
        let filter: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let actual: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        assert!(!matches_client_filter(&filter, &actual));
    }

    #[tokio::test]
    async fn relays_datagram_round_trip_through_origin() {
        let origin = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin.local_addr().unwrap();

        let association = UdpAssociation::bind(Socks5Address::V4(Ipv4Addr::UNSPECIFIED), 0)
            .await
            .unwrap();
        let relay_addr = association.bind_addr();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dst = Socks5Address::from(origin_addr.ip());
        let mut datagram = codec::pack_udp_header(&dst, origin_addr.port());
        datagram.extend_from_slice(b"query");
        client.send_to(&datagram, relay_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, from) = tokio::time::timeout(std::time::Duration::from_secs(2), origin.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], b"query");

        origin.send_to(b"answer", from).await.unwrap();

        let mut reply_buf = [0u8; 64];
        let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(2), client.recv_from(&mut reply_buf))
            .await
            .unwrap()
            .unwrap();
        let (reply_addr, reply_port, payload) = codec::unpack_udp_header(&reply_buf[..n]).unwrap();
        assert_eq!(reply_addr, Socks5Address::from(origin_addr.ip()));
        assert_eq!(reply_port, origin_addr.port());
        assert_eq!(payload, b"answer");
    }
}

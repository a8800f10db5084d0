//! Pure pack/unpack functions for SOCKS5 wire frames (RFC 1928/1929).
//!
//! No I/O happens here beyond reading already-buffered bytes off an
//! `AsyncRead`; there is no backtracking or look-ahead required by the
//! wire format, so reading field-by-field off the live stream (as the
//! reference `unpack_address_port` does) is equivalent to buffering
//! first and is kept for symmetry with how the session drives the
//! handshake.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, ResponseCode};

pub const SOCKS5_VERSION: u8 = 0x05;
const RESERVED: u8 = 0x00;
pub const AUTH_SUB_VERSION: u8 = 0x01;

/// DST/BND address type tag (ATYP).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddrType {
    V4 = 0x01,
    Domain = 0x03,
    V6 = 0x04,
}

impl AddrType {
    pub fn from_u8(n: u8) -> Option<AddrType> {
        match n {
            0x01 => Some(AddrType::V4),
            0x03 => Some(AddrType::Domain),
            0x04 => Some(AddrType::V6),
            _ => None,
        }
    }
}

/// SOCKS5 CMD values (RFC 1928 S4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl Command {
    pub fn from_u8(n: u8) -> Option<Command> {
        match n {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

/// SOCKS5 authentication methods this crate understands (RFC 1928 S3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuthRequired = 0x00,
    UsernamePassword = 0x02,
    NoAcceptableMethods = 0xFF,
}

/// A decoded DST/BND address: IPv4, IPv6 literal, or a domain name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Socks5Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

impl std::fmt::Display for Socks5Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Socks5Address::V4(ip) => write!(f, "{ip}"),
            Socks5Address::V6(ip) => write!(f, "{ip}"),
            Socks5Address::Domain(d) => write!(f, "{d}"),
        }
    }
}

impl Socks5Address {
    /// Infers the ATYP by attempting a numeric IPv4 parse, then IPv6,
    /// falling back to domain, matching the reference `guess_type`.
    pub fn infer(addr: &str) -> Socks5Address {
        if let Ok(v4) = addr.parse::<Ipv4Addr>() {
            return Socks5Address::V4(v4);
        }
        if let Ok(v6) = addr.parse::<Ipv6Addr>() {
            return Socks5Address::V6(v6);
        }
        Socks5Address::Domain(addr.to_string())
    }

    fn addr_type(&self) -> AddrType {
        match self {
            Socks5Address::V4(_) => AddrType::V4,
            Socks5Address::V6(_) => AddrType::V6,
            Socks5Address::Domain(_) => AddrType::Domain,
        }
    }
}

impl From<IpAddr> for Socks5Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Socks5Address::V4(v4),
            IpAddr::V6(v6) => Socks5Address::V6(v6),
        }
    }
}

/// Reads `[ATYP][ADDR][PORT]` off `stream`. Fails with
/// `ProxyError::Parse` (to be replied as `AddrTypeNotSupported`) on an
/// unrecognized ATYP.
pub async fn unpack_address_port<T>(stream: &mut T) -> Result<(Socks5Address, u16), ProxyError>
where
    T: AsyncRead + Unpin,
{
    let atyp = stream.read_u8().await?;
    let addr = match AddrType::from_u8(atyp) {
        Some(AddrType::V4) => {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await?;
            Socks5Address::V4(Ipv4Addr::from(buf))
        }
        Some(AddrType::V6) => {
            let mut buf = [0u8; 16];
            stream.read_exact(&mut buf).await?;
            Socks5Address::V6(Ipv6Addr::from(buf))
        }
        Some(AddrType::Domain) => {
            let len = stream.read_u8().await? as usize;
            if len == 0 {
                return Err(ProxyError::Parse("zero-length domain".into()));
            }
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;
            let domain = String::from_utf8(buf)
                .map_err(|_| ProxyError::Parse("domain is not valid utf-8".into()))?;
            Socks5Address::Domain(domain)
        }
        None => return Err(ProxyError::Parse(format!("invalid address type: {atyp}"))),
    };
    let port = stream.read_u16().await?;
    Ok((addr, port))
}

/// Packs `addr`/`port` as `[ATYP][ADDR][PORT]`. When `atyp` is `None`,
/// infers the type the way `Socks5Address::infer` does.
///
/// Domain names are always length-prefixed by a single octet. (The
/// original Python `pack_address_port` used a 2-byte length prefix for
/// domains while its own `unpack_address_port` read only 1 byte — an
/// internal inconsistency this crate does not reproduce; see
/// DESIGN.md.)
pub fn pack_address_port(addr: &Socks5Address, port: u16) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(addr.addr_type() as u8);
    match addr {
        Socks5Address::V4(ip) => out.extend_from_slice(&ip.octets()),
        Socks5Address::V6(ip) => out.extend_from_slice(&ip.octets()),
        Socks5Address::Domain(d) => {
            out.push(d.len() as u8);
            out.extend_from_slice(d.as_bytes());
        }
    }
    out.extend_from_slice(&port.to_be_bytes());
    out
}

/// Emits `[VER][REP][RSV][ATYP][BND.ADDR][BND.PORT]`.
pub fn generate_reply(code: ResponseCode, bnd_addr: &Socks5Address, bnd_port: u16) -> Vec<u8> {
    let mut out = vec![SOCKS5_VERSION, code as u8, RESERVED];
    out.extend_from_slice(&pack_address_port(bnd_addr, bnd_port));
    out
}

/// Reads the client's method-negotiation frame `[VER][NMETHODS][METHODS..]`.
pub async fn unpack_method_negotiation<T>(stream: &mut T) -> Result<Vec<u8>, ProxyError>
where
    T: AsyncRead + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS5_VERSION {
        return Err(ProxyError::Parse(format!(
            "unsupported SOCKS version: {version}"
        )));
    }
    let nmethods = stream.read_u8().await?;
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;
    Ok(methods)
}

/// Writes the server's method-negotiation reply `[VER][METHOD]`.
pub async fn write_method_reply<T>(stream: &mut T, method: u8) -> Result<(), ProxyError>
where
    T: AsyncWrite + Unpin,
{
    stream.write_all(&[SOCKS5_VERSION, method]).await?;
    Ok(())
}

/// Reads the RFC 1929 username/password sub-negotiation frame
/// `[SUBVER][ULEN][UNAME][PLEN][PASSWD]`.
pub async fn unpack_userpass_auth<T>(stream: &mut T) -> Result<(String, String), ProxyError>
where
    T: AsyncRead + Unpin,
{
    let subver = stream.read_u8().await?;
    if subver != AUTH_SUB_VERSION {
        return Err(ProxyError::Parse(format!(
            "unsupported auth sub-negotiation version: {subver}"
        )));
    }
    let ulen = stream.read_u8().await? as usize;
    let mut uname = vec![0u8; ulen];
    stream.read_exact(&mut uname).await?;
    let plen = stream.read_u8().await? as usize;
    let mut passwd = vec![0u8; plen];
    stream.read_exact(&mut passwd).await?;
    let username = String::from_utf8(uname)
        .map_err(|_| ProxyError::Parse("username is not valid utf-8".into()))?;
    let password = String::from_utf8(passwd)
        .map_err(|_| ProxyError::Parse("password is not valid utf-8".into()))?;
    Ok((username, password))
}

/// Writes the RFC 1929 auth status reply `[VER][STATUS]`.
pub async fn write_userpass_reply<T>(stream: &mut T, success: bool) -> Result<(), ProxyError>
where
    T: AsyncWrite + Unpin,
{
    let status = if success { 0x00 } else { 0x01 };
    stream.write_all(&[AUTH_SUB_VERSION, status]).await?;
    Ok(())
}

/// Emits the SOCKS5 UDP request header `[RSV=0x0000][FRAG=0x00][ATYP][ADDR][PORT]`.
pub fn pack_udp_header(dst_addr: &Socks5Address, dst_port: u16) -> Vec<u8> {
    let mut out = vec![0x00, 0x00, 0x00];
    out.extend_from_slice(&pack_address_port(dst_addr, dst_port));
    out
}

/// Parses the inverse of [`pack_udp_header`], returning
/// `(dst_addr, dst_port, payload)`. Fails if FRAG != 0.
pub fn unpack_udp_header(bytes: &[u8]) -> Result<(Socks5Address, u16, &[u8]), ProxyError> {
    if bytes.len() < 4 {
        return Err(ProxyError::Parse("udp header too short".into()));
    }
    let frag = bytes[2];
    if frag != 0x00 {
        return Err(ProxyError::Parse(format!(
            "unsupported fragmentation value: {frag}"
        )));
    }
    let (addr, port, addr_len) = parse_address_port_sync(&bytes[3..])?;
    let consumed = 3 + addr_len;
    Ok((addr, port, &bytes[consumed..]))
}

/// Synchronous address/port parse over an in-memory buffer, used by
/// [`unpack_udp_header`] since a full datagram is always available at
/// once (no streaming needed for UDP).
fn parse_address_port_sync(buf: &[u8]) -> Result<(Socks5Address, u16, usize), ProxyError> {
    if buf.is_empty() {
        return Err(ProxyError::Parse("empty address/port buffer".into()));
    }
    let atyp = buf[0];
    let mut offset = 1;
    let addr = match AddrType::from_u8(atyp) {
        Some(AddrType::V4) => {
            if buf.len() < offset + 4 {
                return Err(ProxyError::Parse("truncated ipv4 address".into()));
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[offset..offset + 4]);
            offset += 4;
            Socks5Address::V4(Ipv4Addr::from(octets))
        }
        Some(AddrType::V6) => {
            if buf.len() < offset + 16 {
                return Err(ProxyError::Parse("truncated ipv6 address".into()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[offset..offset + 16]);
            offset += 16;
            Socks5Address::V6(Ipv6Addr::from(octets))
        }
        Some(AddrType::Domain) => {
            if buf.is_empty() || offset >= buf.len() {
                return Err(ProxyError::Parse("truncated domain length".into()));
            }
            let len = buf[offset] as usize;
            offset += 1;
            if len == 0 {
                return Err(ProxyError::Parse("zero-length domain".into()));
            }
            if buf.len() < offset + len {
                return Err(ProxyError::Parse("truncated domain".into()));
            }
            let domain = String::from_utf8(buf[offset..offset + len].to_vec())
                .map_err(|_| ProxyError::Parse("domain is not valid utf-8".into()))?;
            offset += len;
            Socks5Address::Domain(domain)
        }
        None => return Err(ProxyError::Parse(format!("invalid address type: {atyp}"))),
    };
    if buf.len() < offset + 2 {
        return Err(ProxyError::Parse("truncated port".into()));
    }
    let port = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
    offset += 2;
    Ok((addr, port, offset))
}

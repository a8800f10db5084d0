//! Parses the proxy's inbound HTTP request line and header block;
//! classifies CONNECT vs. absolute-form; strips hop-by-hop and
//! `Proxy-*` headers.

use tokio::io::{AsyncRead, AsyncReadExt};
use url::Url;

use crate::error::ProxyError;

/// Maximum length of a single header line, in octets.
const MAX_LINE_LEN: usize = 65536;
/// Maximum number of headers a request may carry.
const MAX_HEADERS: usize = 100;

/// Headers whose semantics are scoped to a single transport hop and
/// must not be forwarded upstream (RFC 7230 S6.1).
///
/// Matching against this set is case-sensitive on the wire form
/// received, preserving an observed quirk of the reference
/// implementation rather than RFC 7230's case-insensitive rule (see
/// SPEC_FULL.md §9 and DESIGN.md).
const HOP_BY_HOP: &[&str] = &[
    "Connection",
    "Keep-Alive",
    "Proxy-Authenticate",
    "Proxy-Authorization",
    "Te",
    "Trailers",
    "Transfer-Encoding",
    "Upgrade",
];

/// A parsed proxy request. Header insertion order is preserved (see
/// SPEC_FULL.md §9, "Header mapping order").
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub proto: String,
    pub host: String,
    pub port: u16,
    /// Origin-form path; meaningless for CONNECT.
    pub path: String,
    headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// Parses the raw bytes of a request up to and including the
    /// trailing blank line.
    pub fn parse(raw: &[u8]) -> Result<Self, ProxyError> {
        let lines = split_lines(raw)?;
        if lines.is_empty() {
            return Err(ProxyError::Parse("empty request".into()));
        }

        let first_line = std::str::from_utf8(&lines[0])
            .map_err(|_| ProxyError::Parse("request line is not valid utf-8".into()))?;
        let parts: Vec<&str> = first_line.split_whitespace().collect();
        if parts.len() != 3 {
            return Err(ProxyError::Parse(format!(
                "malformed request line: {first_line:?}"
            )));
        }
        let method = parts[0].to_string();
        let target = parts[1].to_string();
        let proto = parts[2].to_string();

        let headers = parse_headers(&lines[1..])?;

        let (host, port, path) = if method == "CONNECT" {
            let (host, port) = target
                .rsplit_once(':')
                .ok_or_else(|| ProxyError::Parse(format!("malformed CONNECT target: {target:?}")))?;
            let port: u16 = port
                .parse()
                .map_err(|_| ProxyError::Parse(format!("malformed CONNECT port: {port:?}")))?;
            (host.to_string(), port, String::new())
        } else {
            let url = Url::parse(&target)?;
            let host = url.host_str().unwrap_or("").to_string();
            let port = url.port().unwrap_or(80);
            let path = if url.path().is_empty() {
                "/".to_string()
            } else {
                let mut p = url.path().to_string();
                if let Some(q) = url.query() {
                    p.push('?');
                    p.push_str(q);
                }
                p
            };
            (host, port, path)
        };

        if host.is_empty() {
            return Err(ProxyError::Parse("request has no host".into()));
        }
        if port == 0 {
            return Err(ProxyError::Parse("request has zero port".into()));
        }

        Ok(HttpRequest {
            method,
            target,
            proto,
            host,
            port,
            path,
            headers,
        })
    }

    /// All parsed headers, in original order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// The subset of headers that must be forwarded upstream: every
    /// header whose name neither starts with `Proxy-` nor appears in
    /// the hop-by-hop set.
    pub fn headers_to_send(&self) -> Vec<(&str, &str)> {
        self.headers
            .iter()
            .filter(|(k, _)| !is_stripped(k))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect()
    }
}

fn is_stripped(name: &str) -> bool {
    name.starts_with("Proxy-") || HOP_BY_HOP.contains(&name)
}

/// Splits `raw` on `\r\n`, dropping the final empty segment produced by
/// the trailing blank line, and enforces the per-line length cap as it
/// goes (so a hostile client cannot force unbounded buffering before
/// the cap is noticed).
fn split_lines(raw: &[u8]) -> Result<Vec<Vec<u8>>, ProxyError> {
    let mut lines = Vec::new();
    for segment in raw.split(|&b| b == b'\n') {
        let line = if segment.last() == Some(&b'\r') {
            &segment[..segment.len() - 1]
        } else {
            segment
        };
        if line.len() > MAX_LINE_LEN {
            return Err(ProxyError::Parse("header line too long".into()));
        }
        lines.push(line.to_vec());
    }
    // Drop trailing empty lines produced by the CRLFCRLF terminator.
    while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
        lines.pop();
    }
    Ok(lines)
}

fn parse_headers(lines: &[Vec<u8>]) -> Result<Vec<(String, String)>, ProxyError> {
    let mut headers = Vec::new();
    for line in lines {
        if let Some(pos) = line.iter().position(|&b| b == b':') {
            let name = String::from_utf8_lossy(line[..pos].trim_ascii_ws()).to_string();
            let value = String::from_utf8_lossy(line[pos + 1..].trim_ascii_ws()).to_string();
            headers.push((name, value));
        }
        if headers.len() > MAX_HEADERS {
            return Err(ProxyError::Parse(format!(
                "got more than {MAX_HEADERS} headers"
            )));
        }
    }
    Ok(headers)
}

trait TrimAscii {
    fn trim_ascii_ws(&self) -> &[u8];
}

impl TrimAscii for [u8] {
    fn trim_ascii_ws(&self) -> &[u8] {
        let start = self.iter().position(|b| !b.is_ascii_whitespace());
        let Some(start) = start else { return &[] };
        let end = self.iter().rposition(|b| !b.is_ascii_whitespace()).unwrap();
        &self[start..=end]
    }
}

/// Reads off `reader` until the `\r\n\r\n` head terminator is seen,
/// returning the buffered bytes (terminator included). Mirrors the
/// reference's `readuntil(b"\r\n\r\n")` — the whole head is buffered
/// before any parsing happens.
pub async fn read_http_head<T>(reader: &mut T) -> Result<Vec<u8>, ProxyError>
where
    T: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            return Err(ProxyError::Parse(
                "connection closed before request head completed".into(),
            ));
        }
        buf.push(byte[0]);
        if buf.len() > MAX_LINE_LEN * MAX_HEADERS {
            return Err(ProxyError::Parse("request head too large".into()));
        }
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_target() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let req = HttpRequest::parse(raw).unwrap();
        assert_eq!(req.method, "CONNECT");
        assert_eq!(req.host, "example.com");
        assert_eq!(req.port, 443);
    }

    #[test]
    fn parses_plain_get_and_rewrites_path() {
        let raw = b"GET http://127.0.0.1/ HTTP/1.1\r\nHost: 127.0.0.1\r\nUser-Agent: test\r\nAccept-Encoding: gzip, deflate\r\nAccept: */*\r\nProxy-Connection: keep-alive\r\n\r\n";
        let req = HttpRequest::parse(raw).unwrap();
        assert_eq!(req.host, "127.0.0.1");
        assert_eq!(req.port, 80);
        assert_eq!(req.path, "/");

        let forwarded = req.headers_to_send();
        assert_eq!(
            forwarded,
            vec![
                ("Host", "127.0.0.1"),
                ("User-Agent", "test"),
                ("Accept-Encoding", "gzip, deflate"),
                ("Accept", "*/*"),
            ]
        );
    }

    #[test]
    fn strips_proxy_and_hop_by_hop_headers() {
        let raw = b"GET http://example.com/a HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\nProxy-Authorization: Basic abc\r\nX-Custom: 1\r\n\r\n";
        let req = HttpRequest::parse(raw).unwrap();
        let forwarded: Vec<&str> = req.headers_to_send().iter().map(|(k, _)| *k).collect();
        assert_eq!(forwarded, vec!["Host", "X-Custom"]);
    }

    #[test]
    fn rejects_malformed_request_line() {
        let raw = b"GET\r\nHost: a\r\n\r\n";
        assert!(HttpRequest::parse(raw).is_err());
    }

    #[test]
    fn rejects_too_many_headers() {
        let mut raw = b"GET http://example.com/ HTTP/1.1\r\n".to_vec();
        for i in 0..101 {
            raw.extend_from_slice(format!("X-Header-{i}: v\r\n").as_bytes());
        }
        raw.extend_from_slice(b"\r\n");
        assert!(HttpRequest::parse(&raw).is_err());
    }

    #[test]
    fn rejects_empty_host() {
        let raw = b"GET / HTTP/1.1\r\nHost: \r\n\r\n";
        assert!(HttpRequest::parse(raw).is_err());
    }

    #[tokio::test]
    async fn reads_head_until_terminator() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nBODY-NOT-INCLUDED";
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let head = read_http_head(&mut cursor).await.unwrap();
        assert_eq!(head, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n");
    }
}

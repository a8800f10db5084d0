use thiserror::Error;

/// SOCKS5 REP byte, RFC 1928 S6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Success = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeNotSupported = 0x08,
}

/// Unified error currency for the whole crate.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("policy denied the connection")]
    PolicyDenied,

    #[error("authentication failed")]
    AuthFailed,

    #[error("upstream dial failed: {0}")]
    UpstreamDial(#[source] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,
}

impl From<url::ParseError> for ProxyError {
    fn from(e: url::ParseError) -> Self {
        ProxyError::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for ProxyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProxyError::Timeout
    }
}

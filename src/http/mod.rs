//! HTTP forward proxy: request parser (RFC 7230-ish request line and
//! headers) and the per-connection session state machine, including
//! CONNECT tunnelling.

pub mod parser;
pub mod session;

pub use parser::HttpRequest;
pub use session::{HttpProxy, HttpSession};

#![forbid(unsafe_code)]

//! Core protocol state machines for a multi-protocol proxy server: an
//! HTTP forward proxy (with CONNECT tunnelling), a SOCKS5 proxy (TCP
//! CONNECT and UDP ASSOCIATE), and a fixed-target TCP reverse proxy,
//! bound together by a single bidirectional byte-relay engine.
//!
//! Process bootstrap, configuration loading, logging initialization,
//! and TLS termination are deliberately left to the embedding binary;
//! this crate exposes the `*Proxy` listener wrappers and per-connection
//! `*Session` state machines as library building blocks.

pub mod error;
pub mod http;
pub mod policy;
pub mod relay;
pub mod reverse_proxy;
pub mod socks5;

pub use error::{ProxyError, ResponseCode};
pub use http::{HttpProxy, HttpSession};
pub use policy::PolicyHooks;
pub use relay::relay_stream;
pub use reverse_proxy::ReverseProxy;
pub use socks5::{Socks5Proxy, Socks5Session};

//! SOCKS5 proxy: wire codec (RFC 1928/1929), the TCP session state
//! machine, and the UDP ASSOCIATE relay.

pub mod codec;
pub mod session;
pub mod udp;

pub use codec::{AuthMethod, Command, Socks5Address};
pub use session::{Socks5Proxy, Socks5Session};
pub use udp::UdpAssociation;

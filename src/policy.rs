use std::net::SocketAddr;
use std::sync::Arc;

/// An injected predicate: `accept(peer)`.
pub type AcceptHook = Arc<dyn Fn(SocketAddr) -> bool + Send + Sync>;
/// An injected predicate: `auth(username, password)`.
pub type AuthHook = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;
/// An injected predicate: `connect(host, port)`.
pub type ConnectHook = Arc<dyn Fn(&str, u16) -> bool + Send + Sync>;

/// The only extension point of the core: three optional capability
/// predicates shared by the HTTP and SOCKS5 sessions.
///
/// Absence of a hook means the corresponding check is skipped entirely,
/// matching the `if self.on_auth:` / `if self.on_accept:` guards of the
/// reference implementation.
#[derive(Clone, Default)]
pub struct PolicyHooks {
    pub accept: Option<AcceptHook>,
    pub auth: Option<AuthHook>,
    pub connect: Option<ConnectHook>,
}

impl PolicyHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accept<F>(mut self, f: F) -> Self
    where
        F: Fn(SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.accept = Some(Arc::new(f));
        self
    }

    pub fn with_auth<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + Sync + 'static,
    {
        self.auth = Some(Arc::new(f));
        self
    }

    pub fn with_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, u16) -> bool + Send + Sync + 'static,
    {
        self.connect = Some(Arc::new(f));
        self
    }

    pub fn check_accept(&self, peer: SocketAddr) -> bool {
        match &self.accept {
            Some(hook) => hook(peer),
            None => true,
        }
    }

    pub fn check_auth(&self, username: &str, password: &str) -> bool {
        match &self.auth {
            Some(hook) => hook(username, password),
            None => true,
        }
    }

    pub fn check_connect(&self, host: &str, port: u16) -> bool {
        match &self.connect {
            Some(hook) => hook(host, port),
            None => true,
        }
    }
}

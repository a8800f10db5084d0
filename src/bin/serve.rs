//! Minimal demo bootstrap: binds the three reference listeners
//! (SPEC_FULL.md §6) and serves them concurrently. Process bootstrap,
//! configuration loading, and logging *configuration* are out of scope
//! for the library core (see SPEC_FULL.md §1); this binary is the thin
//! external collaborator that exercises it, the same role kitty_proxy's
//! own `main` plays relative to its `HttpProxy`/`SocksProxy` structs.

use anyhow::Result;
use relaymux::{HttpProxy, PolicyHooks, ReverseProxy, Socks5Proxy};
use relaymux::socks5::AuthMethod;

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let http = HttpProxy::new("127.0.0.1", 8080, PolicyHooks::new()).await?;
    let socks5 = Socks5Proxy::new(
        "127.0.0.1",
        1080,
        AuthMethod::NoAuthRequired,
        PolicyHooks::new(),
    )
    .await?;
    let reverse = ReverseProxy::new("127.0.0.1", 8000, "1.1.1.1", 80, PolicyHooks::new()).await?;

    log::info!("relaymux demo listeners bound: http=8080 socks5=1080 reverse=8000");

    tokio::join!(http.serve(), socks5.serve(), reverse.serve());
    Ok(())
}

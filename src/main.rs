use std::sync::Arc;

use keyrelay::config::Config;
use keyrelay::proxy::{CredentialRegistry, ProxyHandler, Resolver};
use keyrelay::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let cfg = Config::load()?;

    let configured = cfg.routes.len();
    let registry = CredentialRegistry::build(cfg.routes, cfg.server.rotation_start);
    tracing::info!(
        routes = registry.len(),
        configured,
        rotation_start = ?cfg.server.rotation_start,
        "Credential registry ready"
    );

    let resolver = Resolver::new(Arc::new(registry));
    let proxy = Arc::new(ProxyHandler::new(
        cfg.server.connect_timeout,
        cfg.server.response_timeout,
    ));

    tokio::select! {
        res = server::listener::run(&cfg.server.listen_addr, resolver, proxy) => {
            res?;
        }

        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    Ok(())
}

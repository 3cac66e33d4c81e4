use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::http::connection::Connection;
use crate::proxy::{ProxyHandler, Resolver};

pub async fn run(listen_addr: &str, resolver: Resolver, proxy: Arc<ProxyHandler>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Proxy server listening on {}", listen_addr);

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!("Failed to accept connection: {}", e);
                continue;
            }
        };
        tracing::debug!("Accepted connection from {}", peer);

        let resolver = resolver.clone();
        let proxy = proxy.clone();
        tokio::spawn(async move {
            let mut conn = Connection::new(socket, resolver, proxy);
            if let Err(e) = conn.run().await {
                tracing::error!("Connection error from {}: {}", peer, e);
            }
        });
    }
}

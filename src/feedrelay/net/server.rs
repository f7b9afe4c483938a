use std::future::Future;
use std::sync::Arc;

use log::{info, warn};
use tokio::net::TcpListener;

use crate::feedrelay::net::connection::Connection;
use crate::feedrelay::FeedRelay;

/// Binds `addr` and serves until `stop` resolves or the listener fails
pub async fn run_stream_server<F>(addr: &str, relay: Arc<FeedRelay>, stop: F) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    let listener = TcpListener::bind(addr).await?;
    info!("Stream server running on {}", addr);
    serve_until(listener, relay, stop).await
}

/// Serves connections until `stop` resolves, then closes every upstream subscription
pub async fn serve_until<F>(listener: TcpListener, relay: Arc<FeedRelay>, stop: F) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    let result = tokio::select! {
        result = serve(listener, relay.clone()) => result,
        _ = stop => Ok(()),
    };
    if let Err(e) = &result {
        warn!("Stream server stopped: {}", e);
    }
    relay.hub().shutdown().await;
    result
}

pub async fn serve(listener: TcpListener, relay: Arc<FeedRelay>) -> std::io::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        // Set TCP_NODELAY so heartbeat and update frames go out immediately
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for connection from {}: {}", addr, e);
        }
        info!("New connection from {}", addr);

        let relay = relay.clone();
        tokio::spawn(async move {
            let connection = Connection::new(addr);
            let (reader, writer) = stream.into_split();
            if let Err(e) = connection.serve(relay, reader, writer).await {
                warn!("Connection {} from {} ended with error: {}", connection.id(), addr, e);
            }
        });
    }
}

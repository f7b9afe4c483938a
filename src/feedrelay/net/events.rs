use std::sync::Arc;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{FeedError, Result};
use crate::feedrelay::session::SessionEvent;
use crate::feedrelay::FeedRelay;

/// Streams session events to `writer` until the session ends or `disconnected` fires
pub async fn handle_stream<W>(
    relay: Arc<FeedRelay>,
    topics: Vec<String>,
    mut writer: W,
    disconnected: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let names: Vec<&str> = topics.iter().map(String::as_str).collect();
    let (session, mut events) = match relay.open_session(&names).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!("Rejected stream for {:?}: {}", topics, e);
            let frame = SessionEvent::error(&e).to_frame();
            writer.write_all(frame.as_bytes()).await?;
            writer.flush().await?;
            return Ok(());
        }
    };

    writer.write_all(format!(": session {}\n\n", session.id()).as_bytes()).await?;
    writer.flush().await?;

    loop {
        tokio::select! {
            biased;
            _ = disconnected.cancelled() => {
                debug!("Viewer of session {} hung up", session.id());
                session.close();
                break;
            }
            event = events.recv() => match event {
                Some(event) => {
                    let frame = event.to_frame();
                    if let Err(e) = write_frame(&mut writer, frame.as_bytes()).await {
                        debug!("Write to session {} failed: {}", session.id(), e);
                        session.close();
                        break;
                    }
                }
                None => break,
            },
        }
    }

    info!("Stream for session {} ended", session.id());
    Ok(())
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Writes one status line followed by the JSON body
pub async fn handle_fetch<W>(relay: Arc<FeedRelay>, topic: &str, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = relay.fetch(topic).await;
    debug!("Fetch of {} answered with {}", topic, response.status);
    writer.write_all(format!("{}\n", response.status).as_bytes()).await?;
    writer.write_all(&response.body).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Applies the write+notify contract for one topic on behalf of a writer
pub async fn handle_publish<W>(relay: Arc<FeedRelay>, topic: &str, payload: Bytes, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let outcome: Result<usize> = async {
        let config = relay.topic(topic)?;
        relay.publisher().publish_snapshot(&config.key, payload, config.ttl()).await
    }
    .await;

    let line = match outcome {
        Ok(receivers) => {
            info!("Writer refreshed {} ({} upstream subscribers)", topic, receivers);
            format!("OK {}\n", receivers)
        }
        Err(e) => error_line(&e),
    };
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Refreshes every backfilled topic from the durable store and writes the report
pub async fn handle_refresh<W>(relay: Arc<FeedRelay>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let report = relay.publisher().refresh_all().await;
    let body = serde_json::to_string(&report)?;
    writer.write_all(format!("200\n{}\n", body).as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub fn error_line(error: &FeedError) -> String {
    format!("{} {}\n", error.http_status(), serde_json::json!({ "error": error.message() }))
}

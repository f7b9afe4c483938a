use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ErrorCode, FeedError, Result};
use crate::feedrelay::net::events::{error_line, handle_fetch, handle_publish, handle_refresh, handle_stream};
use crate::feedrelay::net::request::Request;
use crate::feedrelay::FeedRelay;

/// One accepted viewer or writer connection
pub struct Connection {
    id: Uuid,
    peer: SocketAddr,
    cancel_token: CancellationToken,
}

impl Connection {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Reads the request line and dispatches it; returns when the exchange is over
    pub async fn serve<R, W>(&self, relay: Arc<FeedRelay>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(relay.max_request_bytes()));
        let mut writer = BufWriter::new(writer);

        let parsed = match lines.next().await {
            Some(Ok(line)) => Request::parse(&line),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Err(FeedError::new(
                ErrorCode::MalformedMessage,
                format!("Request line exceeds {} bytes", relay.max_request_bytes()),
            )),
            Some(Err(LinesCodecError::Io(e))) => return Err(e.into()),
            None => {
                debug!("Connection {} from {} closed before sending a request", self.id, self.peer);
                return Ok(());
            }
        };

        let request = match parsed {
            Ok(request) => request,
            Err(e) => {
                warn!("Bad request from {}: {}", self.peer, e);
                writer.write_all(error_line(&e).as_bytes()).await?;
                writer.flush().await?;
                return Ok(());
            }
        };
        info!("Connection {} from {}: {:?}", self.id, self.peer, request);

        match request {
            Request::Stream(topics) => {
                // Anything further from the viewer is ignored; EOF or a read error means it hung up
                let disconnected = self.cancel_token.clone();
                let read_task = tokio::spawn(async move {
                    while let Some(Ok(_)) = lines.next().await {}
                    disconnected.cancel();
                });
                let result = handle_stream(relay, topics, writer, self.cancel_token.clone()).await;
                read_task.abort();
                result
            }
            Request::Fetch(topic) => handle_fetch(relay, &topic, writer).await,
            Request::Publish { topic, payload } => handle_publish(relay, &topic, payload, writer).await,
            Request::Refresh => handle_refresh(relay, writer).await,
        }
    }

    pub fn close(&self) {
        debug!("Closing connection {}", self.id);
        self.cancel_token.cancel();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

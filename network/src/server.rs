use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;

use crate::codec;
use crate::{Envelope, ErrorKind, Message, NodeId, Result, DEFAULT_RPC_TIMEOUT, PROTOCOL_VERSION};

/// Answers one decoded request. Every request gets exactly one reply, so
/// failures are expressed as `Message::Error` rather than a `Result`.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    async fn handle(&self, origin: NodeId, message: Message) -> Message;
}

pub struct RpcServer {
    local_id: NodeId,
    listener: TcpListener,
    read_timeout: Duration,
}

impl RpcServer {
    pub async fn bind(local_id: NodeId, addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            local_id,
            listener,
            read_timeout: DEFAULT_RPC_TIMEOUT,
        })
    }

    /// How long an accepted connection may take to deliver its request.
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` flips to true (or its sender is
    /// dropped). Each connection is served on its own task.
    pub async fn serve<H: EnvelopeHandler>(self, handler: Arc<H>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        tracing::info!("Node {} listening on {}", self.local_id, self.local_addr()?);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = handler.clone();
                        let local_id = self.local_id;
                        let read_timeout = self.read_timeout;
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(local_id, stream, handler, read_timeout).await {
                                tracing::debug!("Connection from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed on node {}: {}", self.local_id, e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }

        tracing::info!("Node {} stopped accepting connections", self.local_id);
        Ok(())
    }
}

async fn serve_connection<H: EnvelopeHandler>(
    local_id: NodeId,
    stream: TcpStream,
    handler: Arc<H>,
    read_timeout: Duration,
) -> Result<()> {
    let mut framed = codec::framed(stream);

    let frame = match tokio::time::timeout(read_timeout, framed.next()).await {
        Ok(Some(Ok(frame))) => frame,
        Ok(Some(Err(e))) => {
            // Oversized or corrupt length prefix. The stream cannot be
            // resynchronised, so answer once and close.
            tracing::warn!("Node {} could not read a frame: {}", local_id, e);
            let reply = Message::error(ErrorKind::Protocol, format!("unreadable frame: {}", e));
            if let Err(e) = framed.send(codec::encode(&Envelope::new(local_id, reply))?).await {
                tracing::debug!("Protocol error reply on node {} was not delivered: {}", local_id, e);
            }
            return Ok(());
        }
        Ok(None) => return Ok(()),
        Err(_) => {
            tracing::debug!("Dropping idle connection on node {}", local_id);
            return Ok(());
        }
    };

    let reply = match codec::decode(&frame) {
        Ok(envelope) if envelope.version != PROTOCOL_VERSION => Message::error(
            ErrorKind::Protocol,
            format!(
                "unsupported protocol version {} (expected {})",
                envelope.version, PROTOCOL_VERSION
            ),
        ),
        Ok(envelope) => {
            tracing::trace!("Node {} received {} from node {}", local_id, envelope.message.tag(), envelope.origin);
            handler.handle(envelope.origin, envelope.message).await
        }
        Err(e) => {
            tracing::warn!("Node {} received a malformed envelope: {}", local_id, e);
            Message::error(ErrorKind::Protocol, format!("malformed envelope: {}", e))
        }
    };

    framed.send(codec::encode(&Envelope::new(local_id, reply))?).await?;
    Ok(())
}

use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

use crate::codec;
use crate::{Directory, Envelope, Message, NetworkError, NodeId, PeerAddress, Result, PROTOCOL_VERSION};

/// Outbound request/response RPC. One connection per call; the whole exchange
/// (connect, write, read) is bounded by the configured timeout.
#[derive(Debug, Clone)]
pub struct Transport {
    local_id: NodeId,
    directory: Arc<Directory>,
    timeout: Duration,
}

impl Transport {
    pub fn new(local_id: NodeId, directory: Arc<Directory>, timeout: Duration) -> Self {
        Self {
            local_id,
            directory,
            timeout,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Sends `message` to `target` and waits for its reply.
    ///
    /// Returns `None` when the target is unknown, unreachable, slower than the
    /// timeout, or answers with something that does not decode. Callers treat
    /// `None` as "peer unavailable".
    pub async fn send(&self, target: NodeId, message: Message) -> Option<Message> {
        let tag = message.tag();
        match self.call(target, message).await {
            Ok(reply) => Some(reply),
            Err(NetworkError::UnknownPeer(id)) => {
                tracing::error!("Cannot send {} to unknown node {}", tag, id);
                None
            }
            Err(e) => {
                tracing::debug!("{} to node {} failed: {}", tag, target, e);
                None
            }
        }
    }

    /// Like [`send`](Self::send) but keeps the failure reason.
    pub async fn call(&self, target: NodeId, message: Message) -> Result<Message> {
        let address = self
            .directory
            .address(target)
            .ok_or(NetworkError::UnknownPeer(target))?
            .clone();
        let envelope = Envelope::new(self.local_id, message);

        tokio::time::timeout(self.timeout, exchange(&address, &envelope))
            .await
            .map_err(|_| NetworkError::Timeout(format!("no reply from {} within {:?}", address, self.timeout)))?
    }

    /// Sends `message` to every other member concurrently and collects what
    /// came back. Unreachable peers appear with `None`.
    pub async fn broadcast(&self, message: Message) -> Vec<(NodeId, Option<Message>)> {
        let peers = self.directory.peers_of(self.local_id);
        let calls = peers.into_iter().map(|peer| {
            let message = message.clone();
            async move { (peer, self.send(peer, message).await) }
        });
        join_all(calls).await
    }

    /// Pings `target`; true on any `pong`.
    pub async fn ping(&self, target: NodeId) -> bool {
        matches!(self.send(target, Message::Ping).await, Some(Message::Pong(_)))
    }
}

async fn exchange(address: &PeerAddress, envelope: &Envelope) -> Result<Message> {
    let stream = TcpStream::connect((address.host.as_str(), address.port)).await?;
    let mut framed = codec::framed(stream);

    framed.send(codec::encode(envelope)?).await?;

    let frame = framed.next().await.ok_or(NetworkError::ConnectionClosed)??;
    let reply = codec::decode(&frame)?;

    if reply.version != PROTOCOL_VERSION {
        return Err(NetworkError::Protocol(format!(
            "peer answered with protocol version {}",
            reply.version
        )));
    }
    if reply.message == Message::Unknown {
        return Err(NetworkError::Protocol("peer answered with an unknown message type".to_string()));
    }

    Ok(reply.message)
}

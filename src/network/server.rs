//! TCP server and connection handling
//!
//! Accepts inbound peers, dials outbound ones and pumps frames between the
//! sockets and the node task.

use crate::network::codec::MessageCodec;
use crate::network::message::{Message, NodeId};
use crate::network::peer::{PeerError, PeerManager, PEER_QUEUE_LEN};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// How long an inbound peer has to identify itself
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection task needs to reach the node
#[derive(Clone)]
pub struct ConnectionContext {
    pub local_id: NodeId,
    pub peers: Arc<PeerManager>,
    /// Application messages, tagged with the sending peer
    pub inbound: mpsc::Sender<(NodeId, Message)>,
}

/// TCP server for accepting peer connections
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind to `host:port`
    pub async fn bind(host: &str, port: u16) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind((host, port)).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Server listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections forever, one task per connection
    pub async fn run(self, ctx: ConnectionContext) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_inbound(stream, addr, ctx).await {
                            log::debug!("Inbound connection from {} closed: {}", addr, e);
                        }
                    });
                }
                Err(e) => log::warn!("Accept failed: {}", e),
            }
        }
    }
}

/// Connect to a peer
pub async fn connect_to_peer(addr: &str) -> Result<(TcpStream, SocketAddr), PeerError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| PeerError::ConnectionFailed(format!("{}: {}", addr, e)))?;

    let peer_addr = stream
        .peer_addr()
        .map_err(|e| PeerError::ConnectionFailed(e.to_string()))?;

    Ok((stream, peer_addr))
}

/// Dial `remote_id` at `addr`, announce ourselves and serve the connection
/// in a background task.
pub async fn dial(addr: &str, remote_id: NodeId, ctx: ConnectionContext) -> Result<(), PeerError> {
    let (stream, peer_addr) = connect_to_peer(addr).await?;
    let mut framed = Framed::new(stream, MessageCodec::new());
    framed.send(Message::Connection(ctx.local_id)).await?;

    tokio::spawn(async move {
        if let Err(e) = serve(framed, remote_id, peer_addr, true, ctx).await {
            log::debug!("Outbound connection to {} closed: {}", remote_id, e);
        }
    });
    Ok(())
}

/// Wait for the `Connection` frame, then serve the connection
async fn handle_inbound(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: ConnectionContext,
) -> Result<(), PeerError> {
    let mut framed = Framed::new(stream, MessageCodec::new());

    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
        .await
        .map_err(|_| PeerError::InvalidHandshake)?;
    let remote_id = match first {
        Some(Ok(Message::Connection(id))) => id,
        Some(Ok(other)) => {
            log::debug!("{} sent {} before identifying", addr, other.type_name());
            return Err(PeerError::InvalidHandshake);
        }
        Some(Err(e)) => return Err(e.into()),
        None => return Err(PeerError::Disconnected),
    };

    serve(framed, remote_id, addr, false, ctx).await
}

/// Register the peer and pump frames until either side goes away
async fn serve(
    framed: Framed<TcpStream, MessageCodec>,
    remote_id: NodeId,
    addr: SocketAddr,
    outbound: bool,
    ctx: ConnectionContext,
) -> Result<(), PeerError> {
    let (mut writer, mut reader) = framed.split();

    // Create channel for sending to this peer
    let (tx, mut rx) = mpsc::channel::<Message>(PEER_QUEUE_LEN);
    let conn_id = ctx.peers.add_peer(remote_id, addr, tx, outbound).await?;

    // Spawn writer task
    let write_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = writer.send(msg).await {
                log::warn!("Write to {} failed: {}", remote_id, e);
                break;
            }
        }
    });

    // Read messages
    let result = loop {
        match reader.next().await {
            Some(Ok(Message::Connection(id))) => {
                log::debug!("Ignoring repeated Connection({}) from {}", id, remote_id);
            }
            Some(Ok(msg)) => {
                // Forward message to node
                if ctx.inbound.send((remote_id, msg)).await.is_err() {
                    break Ok(());
                }
            }
            Some(Err(e)) => {
                log::warn!("Dropping peer {}: {}", remote_id, e);
                break Err(PeerError::IoError(e));
            }
            None => {
                log::info!("Peer {} disconnected", remote_id);
                break Ok(());
            }
        }
    };

    // Cleanup
    write_handle.abort();
    ctx.peers.remove_peer(remote_id, conn_id).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::peer::MAX_PEERS;
    use tokio::io::AsyncWriteExt;

    fn context(id: NodeId) -> (ConnectionContext, mpsc::Receiver<(NodeId, Message)>) {
        let (tx, rx) = mpsc::channel(16);
        let ctx = ConnectionContext {
            local_id: id,
            peers: Arc::new(PeerManager::new(id, MAX_PEERS)),
            inbound: tx,
        };
        (ctx, rx)
    }

    async fn wait_for_peer(peers: &PeerManager, id: NodeId) {
        for _ in 0..100 {
            if peers.is_connected(id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("peer {} never connected", id);
    }

    #[tokio::test]
    async fn test_handshake_and_delivery() {
        let server = Server::bind("127.0.0.1", 0).await.unwrap();
        let addr = server.local_addr().to_string();
        let (server_ctx, mut server_rx) = context(1);
        let server_peers = server_ctx.peers.clone();
        tokio::spawn(server.run(server_ctx));

        let (client_ctx, mut client_rx) = context(2);
        let client_peers = client_ctx.peers.clone();
        dial(&addr, 1, client_ctx).await.unwrap();

        wait_for_peer(&server_peers, 2).await;
        wait_for_peer(&client_peers, 1).await;

        client_peers.send_to(1, Message::Connection(2)).await.unwrap();
        client_peers
            .broadcast(Message::PrePrepare(serde_json::json!({"x": 1})))
            .await;
        let (from, msg) = server_rx.recv().await.unwrap();
        assert_eq!(from, 2);
        assert!(matches!(msg, Message::PrePrepare(_)));

        server_peers.send_to(2, Message::PrePrepare(serde_json::Value::Null)).await.unwrap();
        let (from, _) = client_rx.recv().await.unwrap();
        assert_eq!(from, 1);
    }

    #[tokio::test]
    async fn test_frames_before_identification_are_refused() {
        let server = Server::bind("127.0.0.1", 0).await.unwrap();
        let addr = server.local_addr();
        let (server_ctx, _rx) = context(1);
        let server_peers = server_ctx.peers.clone();
        tokio::spawn(server.run(server_ctx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"{\"type\":6,\"data\":{\"id\":5}}\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server_peers.peer_count().await, 0);
    }
}

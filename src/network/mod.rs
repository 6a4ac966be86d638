//! P2P Networking module
//!
//! Raw TCP gossip between a fixed set of numbered nodes.
//!
//! # Features
//! - `\r\n` delimited JSON envelopes
//! - Identification handshake (`Connection` frame first)
//! - Broadcast and point-to-point sends

pub mod codec;
pub mod message;
pub mod peer;
pub mod server;

pub use codec::{MessageCodec, DELIMITER, MAX_FRAME_LEN};
pub use message::{Message, MessageError, NodeId, SyncBlock, SyncPayload, SyncRequest, Vote};
pub use peer::{PeerError, PeerHandle, PeerInfo, PeerManager, MAX_PEERS};
pub use server::{connect_to_peer, dial, ConnectionContext, Server};

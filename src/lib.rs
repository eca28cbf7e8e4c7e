//! Peer-to-peer UDP Chat Rooms Library
//!
//! Peers behind NAT meet through a public rendezvous server, which learns
//! each peer's public UDP endpoint from the packets it sends and pushes the
//! room's member list (roster) to everyone in the room. From then on peers
//! send chat text directly to each other; the server never relays chat.
//!
//! # Features
//! - Versioned binary envelope with typed payloads
//! - Concurrent room registry with per-room serialization
//! - Liveness sweep: ping idle peers, evict silent ones, re-push rosters
//! - Mesh client: join, best-effort fan-out, keepalive replies
//! - Bounded event queue between network intake and the UI
//!
//! # Architecture
//! - `RendezvousServer` runs one receive loop plus a sweep task over a
//!   shared `Registry`; roster pushes run on their own tasks
//! - `MeshClient` runs one receive loop that owns the cached rosters and
//!   answers pings inline; sends go straight out on the shared socket
//! - Every per-datagram error drops that datagram; only a dead socket ends
//!   a loop
//!
//! # Example
//! ```ignore
//! use hole_chat::{ClientConfig, ClientEvent, MeshClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), hole_chat::AppError> {
//!     let config = ClientConfig {
//!         rendezvous: "203.0.113.7:9000".into(),
//!         ..ClientConfig::default()
//!     };
//!     let (client, mut events) = MeshClient::connect(config).await?;
//!     client.join_room("lobby").await?;
//!
//!     while let Some(event) = events.recv().await {
//!         if let ClientEvent::Chat(chat) = event {
//!             println!("{} says {}", chat.sender, chat.text);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod registry;
pub mod room;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use client::{ChatEvent, ClientEvent, MeshClient, RoomState, SendReport};
pub use config::{ClientConfig, ServerConfig};
pub use error::{AppError, DecodeError, EncodeError, ProtocolViolation};
pub use message::{Chat, Envelope, JoinRoom, Message, MessageKind, Payload, Roster};
pub use registry::{Registry, RosterSnapshot};
pub use room::Room;
pub use server::RendezvousServer;
pub use types::{Peer, RoomName};

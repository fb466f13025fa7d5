//! # Tile World Client Library
//!
//! Async client for the tile world server. A [`network::GameClient`] speaks
//! the request/response half of the protocol (accounts, chunks, tile edits,
//! player update streams). Opening a session consumes the connection and
//! yields a [`network::Session`] that receives pushed snapshots.
//!
//! [`world::WorldView`] folds those snapshots into a local picture of the
//! players and loaded chunks.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::GameClient;
//! use shared::ChunkCoord;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut requests = GameClient::connect("127.0.0.1:8080").await?;
//!     let creds = requests.login("alice", "secret").await?;
//!     let chunk = requests.load_chunk(ChunkCoord::new(0, 0)).await?;
//!     println!("chunk has {} tiles", chunk.tiles().len());
//!
//!     let mut session = GameClient::connect("127.0.0.1:8080")
//!         .await?
//!         .open_session(&creds.token)
//!         .await?;
//!     while let Some(snapshot) = session.next_snapshot().await? {
//!         println!("{} player events", snapshot.players.len());
//!     }
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod world;

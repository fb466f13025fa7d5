//! # Tile World Server Library
//!
//! Authoritative server for a shared, persistent tile world. It keeps the
//! canonical list of connected players, applies and persists world edits, and
//! pushes one coalesced snapshot per tick to every live session.
//!
//! ## Module Organization
//!
//! ### Connection Registry (`client_manager`)
//! Maps each player to the outbound half of its session:
//! - Registration and removal, one session per identity
//! - Per-session keep-alive probes that end dead sessions
//! - Broadcast that isolates failures to the failing session
//!
//! ### Player Tracking (`players`)
//! Live position and velocity per player, plus recency buffers recording who
//! connected, disconnected or moved since the last tick.
//!
//! ### World (`world`, `tile_queue`)
//! Chunks are loaded or generated on first use and written to disk on every
//! tile change. Accepted edits wait in the tile queue for the next broadcast.
//!
//! ### Broadcast (`game`)
//! Fixed-rate scheduler that drains the recency buffers and the tile queue,
//! builds a snapshot with at most one event per player, and broadcasts it.
//!
//! ### Accounts and Auth (`accounts`, `auth`)
//! bcrypt password hashes stored per user; HMAC-signed JWTs as bearer tokens.
//!
//! ### Network (`network`)
//! TCP listener speaking length-delimited bincode frames. Each connection is
//! served by its own task.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::{Server, Services};
//! use server::storage::FjallDatabase;
//! use server::world::SeededGenerator;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         secret: "change-me".to_string(),
//!         ..ServerConfig::default()
//!     };
//!     let db = Arc::new(FjallDatabase::open(&config.data_dir)?);
//!     let services = Arc::new(Services::new(&config, db, Box::new(SeededGenerator::new(7))));
//!
//!     let shutdown = CancellationToken::new();
//!     tokio::spawn(services.scheduler(config.tick_rate).run(shutdown.clone()));
//!
//!     let server = Server::bind(&config.listen_addr(), services).await?;
//!     server.run(shutdown).await;
//!     Ok(())
//! }
//! ```

pub mod accounts;
pub mod auth;
pub mod client_manager;
pub mod config;
pub mod error;
pub mod game;
pub mod network;
pub mod players;
pub mod storage;
pub mod tile_queue;
pub mod utils;
pub mod world;

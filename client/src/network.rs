use log::{debug, info};
use shared::wire::{self, recv_packet, send_packet, PacketStream, WireError};
use shared::{
    ChunkCoord, ChunkData, ClientPacket, GameState, PlayerState, RpcError, ServerPacket, Tile,
    TileCoord, TileUpdate,
};
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("server rejected the request: {0}")]
    Rejected(RpcError),
    #[error("server closed the connection")]
    Closed,
    #[error("unexpected reply: {0}")]
    Unexpected(String),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

impl ClientError {
    /// The server-side error, if the server answered with one.
    pub fn rpc(&self) -> Option<&RpcError> {
        match self {
            ClientError::Rejected(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub token: String,
}

/// Request/response connection to the server.
pub struct GameClient {
    framed: PacketStream<TcpStream>,
}

impl GameClient {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(WireError::Io)?;
        stream.set_nodelay(true).map_err(WireError::Io)?;
        Ok(Self {
            framed: wire::framed(stream),
        })
    }

    async fn call(&mut self, packet: &ClientPacket) -> Result<ServerPacket> {
        send_packet(&mut self.framed, packet).await?;
        self.reply().await
    }

    async fn reply(&mut self) -> Result<ServerPacket> {
        match recv_packet(&mut self.framed).await? {
            Some(ServerPacket::Error(e)) => Err(ClientError::Rejected(e)),
            Some(packet) => Ok(packet),
            None => Err(ClientError::Closed),
        }
    }

    fn credentials(reply: ServerPacket) -> Result<Credentials> {
        match reply {
            ServerPacket::LoginResponse { username, token } => Ok(Credentials { username, token }),
            other => Err(ClientError::Unexpected(format!("{:?}", other))),
        }
    }

    pub async fn register(
        &mut self,
        username: &str,
        password: &str,
        email: &str,
    ) -> Result<Credentials> {
        let reply = self
            .call(&ClientPacket::Register {
                username: username.to_string(),
                password: password.to_string(),
                email: email.to_string(),
            })
            .await?;
        Self::credentials(reply)
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<Credentials> {
        let reply = self
            .call(&ClientPacket::Login {
                username: username.to_string(),
                password: password.to_string(),
            })
            .await?;
        Self::credentials(reply)
    }

    pub async fn load_chunk(&mut self, coord: ChunkCoord) -> Result<ChunkData> {
        match self.call(&ClientPacket::LoadChunk { coord }).await? {
            ServerPacket::Chunk { chunk_data, .. } => Ok(ChunkData::decode(&chunk_data)?),
            other => Err(ClientError::Unexpected(format!("{:?}", other))),
        }
    }

    pub async fn update_tile(
        &mut self,
        chunk: ChunkCoord,
        at: TileCoord,
        tile: Tile,
    ) -> Result<()> {
        let update = TileUpdate {
            chunk,
            tile: at,
            tile_data: tile.to_bytes()?,
        };
        self.expect_ack(&ClientPacket::UpdateTile(update)).await
    }

    /// Streams `states` for the token's player and waits for the verdict.
    pub async fn send_player_updates<I>(&mut self, token: &str, states: I) -> Result<()>
    where
        I: IntoIterator<Item = PlayerState>,
    {
        send_packet(
            &mut self.framed,
            &ClientPacket::OpenPlayerUpdates {
                token: token.to_string(),
            },
        )
        .await?;

        let mut sent = 0;
        for state in states {
            send_packet(&mut self.framed, &ClientPacket::PlayerUpdate { state }).await?;
            sent += 1;
        }

        self.expect_ack(&ClientPacket::ClosePlayerUpdates).await?;
        debug!("Server accepted {} player updates", sent);
        Ok(())
    }

    async fn expect_ack(&mut self, packet: &ClientPacket) -> Result<()> {
        match self.call(packet).await? {
            ServerPacket::Ack => Ok(()),
            other => Err(ClientError::Unexpected(format!("{:?}", other))),
        }
    }

    /// Turns this connection into the player's session.
    pub async fn open_session(mut self, token: &str) -> Result<Session> {
        let reply = self
            .call(&ClientPacket::Connect {
                token: token.to_string(),
            })
            .await?;

        match reply {
            ServerPacket::GameState(roster) => {
                info!("Session open, {} players online", roster.players.len());
                Ok(Session {
                    framed: self.framed,
                    roster,
                })
            }
            other => Err(ClientError::Unexpected(format!("{:?}", other))),
        }
    }
}

/// Server-pushed stream of snapshots for one player.
pub struct Session {
    framed: PacketStream<TcpStream>,
    roster: GameState,
}

impl Session {
    /// Players online when the session opened.
    pub fn roster(&self) -> &GameState {
        &self.roster
    }

    /// Waits for the next snapshot with content. Keep-alive probes are
    /// skipped. `Ok(None)` means the server ended the session.
    pub async fn next_snapshot(&mut self) -> Result<Option<GameState>> {
        loop {
            match recv_packet(&mut self.framed).await? {
                Some(ServerPacket::GameState(state)) if state.is_empty() => continue,
                Some(ServerPacket::GameState(state)) => return Ok(Some(state)),
                Some(ServerPacket::Error(e)) => return Err(ClientError::Rejected(e)),
                Some(other) => return Err(ClientError::Unexpected(format!("{:?}", other))),
                None => return Ok(None),
            }
        }
    }
}

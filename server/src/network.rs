//! TCP front end: accepts connections and dispatches framed requests
//!
//! Every connection starts in request/response mode. Three requests change
//! that:
//! - `Connect` turns the connection into a session. The server pushes a
//!   roster of current players, then every snapshot, until the session ends.
//! - `OpenPlayerUpdates` starts a client stream of `PlayerUpdate` frames
//!   closed by `ClosePlayerUpdates`. One reply (Ack or the first error)
//!   follows the close.
//! - End of stream closes the connection.
//!
//! Storage and bcrypt work is moved to the blocking pool.

use crate::accounts::AccountStore;
use crate::auth::AuthGateway;
use crate::client_manager::{ClientManager, SessionHandle};
use crate::config::ServerConfig;
use crate::error::{AuthError, Result, ServerError};
use crate::game::BroadcastScheduler;
use crate::players::PlayerTracker;
use crate::storage::GameDatabase;
use crate::tile_queue::TileUpdateQueue;
use crate::world::{ChunkStore, WorldGenerator};
use log::{debug, error, info, warn};
use shared::wire::{self, recv_packet, send_frame, send_packet, PacketStream};
use shared::{
    ChunkCoord, ClientPacket, GameState, PlayerEvent, PlayerEventType, PlayerState, RpcError,
    ServerPacket, Tile, TileUpdate, TOKEN_TTL_SECS,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;

/// Everything a request handler needs, shared by all connections.
pub struct Services {
    pub auth: Arc<AuthGateway>,
    pub accounts: Arc<AccountStore>,
    pub players: Arc<PlayerTracker>,
    pub clients: Arc<ClientManager>,
    pub tiles: Arc<TileUpdateQueue>,
    pub world: Arc<ChunkStore>,
    pub channel_capacity: usize,
}

impl Services {
    pub fn new(
        config: &ServerConfig,
        db: Arc<dyn GameDatabase>,
        generator: Box<dyn WorldGenerator>,
    ) -> Self {
        let auth = Arc::new(AuthGateway::new(
            config.secret.as_bytes(),
            Duration::from_secs(TOKEN_TTL_SECS),
            config.bcrypt_cost,
        ));
        let players = Arc::new(PlayerTracker::new());

        Self {
            accounts: Arc::new(AccountStore::new(Arc::clone(&db), Arc::clone(&auth))),
            clients: Arc::new(ClientManager::new(
                Arc::clone(&players),
                config.heartbeat_interval,
            )),
            tiles: Arc::new(TileUpdateQueue::new()),
            world: Arc::new(ChunkStore::new(db, generator, config.chunk_size)),
            auth,
            players,
            channel_capacity: config.channel_capacity,
        }
    }

    pub fn scheduler(&self, tick_rate: u32) -> BroadcastScheduler {
        BroadcastScheduler::new(
            Arc::clone(&self.players),
            Arc::clone(&self.tiles),
            Arc::clone(&self.clients),
            tick_rate,
        )
    }

    async fn register(
        &self,
        username: String,
        password: String,
        email: String,
    ) -> Result<ServerPacket> {
        let accounts = Arc::clone(&self.accounts);
        let auth = Arc::clone(&self.auth);

        spawn_blocking(move || -> Result<ServerPacket> {
            let account = accounts.register(&username, &password, &email)?;
            login_response(&auth, account.username)
        })
        .await?
    }

    async fn login(&self, username: String, password: String) -> Result<ServerPacket> {
        let accounts = Arc::clone(&self.accounts);
        let auth = Arc::clone(&self.auth);

        spawn_blocking(move || -> Result<ServerPacket> {
            let account = accounts.login(&username, &password)?;
            login_response(&auth, account.username)
        })
        .await?
    }

    /// Resolves a token to an identity with a stored account.
    async fn authenticate(&self, token: &str) -> Result<String> {
        let username = self.auth.verify_token(token)?;

        let accounts = Arc::clone(&self.accounts);
        let name = username.clone();
        match spawn_blocking(move || accounts.get(&name)).await?? {
            Some(_) => Ok(username),
            None => Err(AuthError::UnknownUser(username).into()),
        }
    }

    async fn load_chunk(&self, coord: ChunkCoord) -> Result<ServerPacket> {
        let world = Arc::clone(&self.world);

        let chunk_data = spawn_blocking(move || -> Result<Vec<u8>> {
            let chunk = world.load_or_create_chunk(coord)?;
            chunk.encode().map_err(|e| {
                ServerError::Internal(format!("failed to encode chunk {}: {}", coord, e))
            })
        })
        .await??;

        Ok(ServerPacket::Chunk { coord, chunk_data })
    }

    /// Applies and persists the tile, then queues it for the next broadcast.
    async fn update_tile(&self, update: TileUpdate) -> Result<ServerPacket> {
        let tile = Tile::from_bytes(&update.tile_data)
            .map_err(|e| ServerError::Validation(format!("malformed tile payload: {}", e)))?;

        let world = Arc::clone(&self.world);
        let (chunk, at) = (update.chunk, update.tile);
        spawn_blocking(move || world.replace_tile(chunk, at, tile)).await??;

        debug!("Tile ({},{}) of chunk {} set to {:?}", at.x, at.y, chunk, tile.kind);
        self.tiles.push(update);
        Ok(ServerPacket::Ack)
    }

    /// Every player currently present, as CONNECT events.
    async fn roster(&self) -> GameState {
        let mut players: Vec<PlayerEvent> = self
            .players
            .snapshot()
            .await
            .into_iter()
            .map(|(username, state)| PlayerEvent {
                username,
                event_type: PlayerEventType::Connect,
                state: Some(state),
            })
            .collect();
        players.sort_by(|a, b| a.username.cmp(&b.username));

        GameState {
            players,
            tile_updates: Vec::new(),
        }
    }
}

fn login_response(auth: &AuthGateway, username: String) -> Result<ServerPacket> {
    let token = auth.issue_token(&username)?;
    Ok(ServerPacket::LoginResponse { username, token })
}

fn error_packet(err: &ServerError) -> ServerPacket {
    match err {
        ServerError::Storage(_) | ServerError::Internal(_) => error!("Request failed: {}", err),
        _ => debug!("Request rejected: {}", err),
    }
    ServerPacket::Error(RpcError::from(err))
}

fn reply(result: Result<ServerPacket>) -> ServerPacket {
    result.unwrap_or_else(|e| error_packet(&e))
}

pub struct Server {
    listener: TcpListener,
    services: Arc<Services>,
}

impl Server {
    pub async fn bind(addr: &str, services: Arc<Services>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Server listening on {}", listener.local_addr()?);
        Ok(Self { listener, services })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` fires, then ends every session.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!("Could not disable Nagle for {}: {}", peer, e);
                        }
                        debug!("Accepted connection from {}", peer);
                        tokio::spawn(handle_connection(
                            Arc::clone(&self.services),
                            stream,
                            peer.to_string(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        info!("No longer accepting connections, ending {} sessions", self.services.clients.len());
        self.services.clients.shutdown().await;
    }
}

/// Serves one connection until the peer hangs up, a send fails, or the
/// server shuts down.
pub async fn handle_connection<T>(
    services: Arc<Services>,
    io: T,
    peer: String,
    shutdown: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut framed = wire::framed(io);

    loop {
        let inbound = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            inbound = recv_packet::<_, ClientPacket>(&mut framed) => inbound,
        };

        let packet = match inbound {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!("{} closed the connection", peer);
                break;
            }
            Err(e) => {
                warn!("Dropping {}: {}", peer, e);
                break;
            }
        };

        let response = match packet {
            ClientPacket::Register {
                username,
                password,
                email,
            } => reply(services.register(username, password, email).await),
            ClientPacket::Login { username, password } => {
                reply(services.login(username, password).await)
            }
            ClientPacket::LoadChunk { coord } => reply(services.load_chunk(coord).await),
            ClientPacket::UpdateTile(update) => reply(services.update_tile(update).await),
            ClientPacket::OpenPlayerUpdates { token } => {
                match receive_player_updates(&services, &mut framed, &token, &shutdown).await {
                    Some(response) => response,
                    None => break,
                }
            }
            ClientPacket::PlayerUpdate { .. } | ClientPacket::ClosePlayerUpdates => {
                error_packet(&ServerError::Validation(
                    "no player update stream is open".to_string(),
                ))
            }
            ClientPacket::Connect { token } => {
                run_session(&services, framed, &token, &peer, &shutdown).await;
                return;
            }
        };

        if let Err(e) = send_packet(&mut framed, &response).await {
            warn!("Failed to reply to {}: {}", peer, e);
            break;
        }
    }
}

/// Consumes a player update stream. Returns the reply to send after the
/// close, or `None` if the connection ended mid-stream.
async fn receive_player_updates<T>(
    services: &Services,
    framed: &mut PacketStream<T>,
    token: &str,
    shutdown: &CancellationToken,
) -> Option<ServerPacket>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    // After the first failure the rest of the stream is read and discarded
    let mut outcome = services.authenticate(token).await;
    let mut applied = 0usize;

    loop {
        let inbound = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return None,
            inbound = recv_packet::<_, ClientPacket>(framed) => inbound,
        };
        let packet = match inbound {
            Ok(Some(packet)) => packet,
            Ok(None) => {
                debug!("Player update stream ended without a close after {} updates", applied);
                return None;
            }
            Err(e) => {
                warn!("Player update stream broke: {}", e);
                return None;
            }
        };

        match packet {
            ClientPacket::PlayerUpdate { state } => {
                if let Ok(username) = &outcome {
                    match services.players.update_player(username, state).await {
                        Ok(()) => applied += 1,
                        Err(e) => outcome = Err(e),
                    }
                }
            }
            ClientPacket::ClosePlayerUpdates => break,
            other => {
                outcome = Err(ServerError::Validation(format!(
                    "unexpected {:?} inside a player update stream",
                    other
                )));
                break;
            }
        }
    }

    Some(reply(outcome.map(|_| ServerPacket::Ack)))
}

/// Sends a rejection in place of a session.
async fn reject<T>(framed: &mut PacketStream<T>, err: &ServerError, peer: &str)
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    if let Err(e) = send_packet(framed, &error_packet(err)).await {
        debug!("Failed to tell {} why it was refused: {}", peer, e);
    }
}

/// Turns the connection into the player's session and pumps it until the
/// session ends. Cleanup always goes through the registry.
///
/// Writes to the peer are raced against the session's cancellation and the
/// server shutdown, so a stalled client cannot keep the task alive.
async fn run_session<T>(
    services: &Services,
    mut framed: PacketStream<T>,
    token: &str,
    peer: &str,
    shutdown: &CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let username = match services.authenticate(token).await {
        Ok(username) => username,
        Err(e) => {
            warn!("Connect from {} rejected: {}", peer, e);
            reject(&mut framed, &e, peer).await;
            return;
        }
    };

    if shutdown.is_cancelled() {
        info!("Refusing session for {}, server is shutting down", username);
        return;
    }

    if let Err(e) = services.players.add_player(&username, PlayerState::default()).await {
        let err = match e {
            ServerError::AlreadyExists(name) => ServerError::AlreadyConnected(name),
            other => other,
        };
        reject(&mut framed, &err, peer).await;
        return;
    }

    let (handle, mut outbound) = SessionHandle::channel(services.channel_capacity);
    let ticket = match services.clients.register(&username, handle) {
        Ok(ticket) => ticket,
        Err(e) => {
            services.players.remove_player(&username).await;
            reject(&mut framed, &e, peer).await;
            return;
        }
    };

    info!("{} connected from {}", username, peer);

    let roster = ServerPacket::GameState(services.roster().await);
    let greeted = tokio::select! {
        biased;
        _ = ticket.cancel.cancelled() => false,
        _ = shutdown.cancelled() => false,
        sent = send_packet(&mut framed, &roster) => match sent {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to greet {}: {}", username, e);
                false
            }
        },
    };

    while greeted {
        tokio::select! {
            biased;
            _ = ticket.cancel.cancelled() => break,
            _ = shutdown.cancelled() => break,
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                tokio::select! {
                    biased;
                    _ = ticket.cancel.cancelled() => break,
                    _ = shutdown.cancelled() => break,
                    sent = send_frame(&mut framed, frame) => {
                        if let Err(e) = sent {
                            warn!("Send to {} failed: {}", username, e);
                            break;
                        }
                    }
                }
            }
            inbound = recv_packet::<_, ClientPacket>(&mut framed) => match inbound {
                Ok(None) => {
                    info!("{} closed the session", username);
                    break;
                }
                Ok(Some(packet)) => debug!("Ignoring {:?} on the session of {}", packet, username),
                Err(e) => {
                    warn!("Session of {} broke: {}", username, e);
                    break;
                }
            },
        }
    }

    services.clients.end_session(&username, ticket.id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryDatabase;
    use crate::world::SeededGenerator;
    use shared::{ChunkData, ErrorKind, TileCoord, TileKind, Vector2};
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    fn services() -> Arc<Services> {
        services_with_capacity(ServerConfig::default().channel_capacity)
    }

    fn services_with_capacity(channel_capacity: usize) -> Arc<Services> {
        let config = ServerConfig {
            secret: "test-secret".to_string(),
            chunk_size: 4,
            bcrypt_cost: 4,
            heartbeat_interval: Duration::from_secs(3600),
            channel_capacity,
            ..ServerConfig::default()
        };
        Arc::new(Services::new(
            &config,
            Arc::new(MemoryDatabase::new()),
            Box::new(SeededGenerator::new(5)),
        ))
    }

    fn pipe(services: &Arc<Services>) -> PacketStream<DuplexStream> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_connection(
            Arc::clone(services),
            server,
            "test".to_string(),
            CancellationToken::new(),
        ));
        wire::framed(client)
    }

    /// Like `pipe`, but with a small buffer and the task handle exposed.
    fn spawn_connection(
        services: &Arc<Services>,
        buffer: usize,
        shutdown: &CancellationToken,
    ) -> (PacketStream<DuplexStream>, tokio::task::JoinHandle<()>) {
        let (client, server) = tokio::io::duplex(buffer);
        let task = tokio::spawn(handle_connection(
            Arc::clone(services),
            server,
            "test".to_string(),
            shutdown.clone(),
        ));
        (wire::framed(client), task)
    }

    fn crowded_snapshot(players: usize) -> GameState {
        GameState {
            players: (0..players)
                .map(|i| PlayerEvent {
                    username: format!("player-{:02}", i),
                    event_type: PlayerEventType::Update,
                    state: Some(PlayerState::new(Vector2::new(i as f32, 0.0), Vector2::default())),
                })
                .collect(),
            tile_updates: Vec::new(),
        }
    }

    async fn call(conn: &mut PacketStream<DuplexStream>, packet: ClientPacket) -> ServerPacket {
        send_packet(conn, &packet).await.unwrap();
        next(conn).await
    }

    async fn next(conn: &mut PacketStream<DuplexStream>) -> ServerPacket {
        timeout(Duration::from_secs(5), recv_packet(conn))
            .await
            .expect("no reply")
            .unwrap()
            .expect("connection closed")
    }

    fn error_kind(packet: ServerPacket) -> ErrorKind {
        match packet {
            ServerPacket::Error(e) => e.kind,
            other => panic!("expected an error, got {:?}", other),
        }
    }

    async fn register(conn: &mut PacketStream<DuplexStream>, username: &str) -> String {
        let packet = ClientPacket::Register {
            username: username.to_string(),
            password: "pw".to_string(),
            email: format!("{}@example.com", username),
        };
        match call(conn, packet).await {
            ServerPacket::LoginResponse { token, .. } => token,
            other => panic!("registration failed: {:?}", other),
        }
    }

    fn tile_update(chunk: ChunkCoord, x: u32, y: u32, kind: TileKind) -> TileUpdate {
        TileUpdate {
            chunk,
            tile: TileCoord::new(x, y),
            tile_data: Tile::new(kind).to_bytes().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let services = services();
        let mut conn = pipe(&services);

        let token = register(&mut conn, "alice").await;
        assert_eq!(services.auth.verify_token(&token).unwrap(), "alice");

        let login = ClientPacket::Login {
            username: "alice".into(),
            password: "pw".into(),
        };
        match call(&mut conn, login).await {
            ServerPacket::LoginResponse { username, .. } => assert_eq!(username, "alice"),
            other => panic!("login failed: {:?}", other),
        }

        let taken = ClientPacket::Register {
            username: "alice".into(),
            password: "x".into(),
            email: "x@example.com".into(),
        };
        assert_eq!(error_kind(call(&mut conn, taken).await), ErrorKind::UsernameTaken);

        let wrong = ClientPacket::Login {
            username: "alice".into(),
            password: "nope".into(),
        };
        assert_eq!(error_kind(call(&mut conn, wrong).await), ErrorKind::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_update_tile_then_load_chunk() {
        let services = services();
        let mut conn = pipe(&services);
        let origin = ChunkCoord::new(0, 0);

        let update = tile_update(origin, 2, 3, TileKind::Stone);
        assert!(matches!(
            call(&mut conn, ClientPacket::UpdateTile(update.clone())).await,
            ServerPacket::Ack
        ));
        assert_eq!(services.tiles.drain_all(), vec![update]);

        match call(&mut conn, ClientPacket::LoadChunk { coord: origin }).await {
            ServerPacket::Chunk { coord, chunk_data } => {
                assert_eq!(coord, origin);
                let chunk = ChunkData::decode(&chunk_data).unwrap();
                assert_eq!(chunk.size, 4);
                assert_eq!(chunk.tile(TileCoord::new(2, 3)).unwrap().kind, TileKind::Stone);
            }
            other => panic!("expected a chunk, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bad_tile_updates_are_rejected() {
        let services = services();
        let mut conn = pipe(&services);

        let outside = tile_update(ChunkCoord::new(1, 1), 4, 0, TileKind::Sand);
        assert_eq!(
            error_kind(call(&mut conn, ClientPacket::UpdateTile(outside)).await),
            ErrorKind::ValidationFailed
        );

        let garbage = TileUpdate {
            chunk: ChunkCoord::new(1, 1),
            tile: TileCoord::new(0, 0),
            tile_data: vec![0xff; 9],
        };
        assert_eq!(
            error_kind(call(&mut conn, ClientPacket::UpdateTile(garbage)).await),
            ErrorKind::ValidationFailed
        );
        assert!(services.tiles.is_empty());
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_tokens() {
        let services = services();
        let mut conn = pipe(&services);
        let bad = ClientPacket::Connect {
            token: "not-a-token".into(),
        };
        assert_eq!(error_kind(call(&mut conn, bad).await), ErrorKind::Unauthenticated);

        // Valid signature, but no such account
        let token = services.auth.issue_token("ghost").unwrap();
        let mut conn = pipe(&services);
        assert_eq!(
            error_kind(call(&mut conn, ClientPacket::Connect { token }).await),
            ErrorKind::Unauthenticated
        );
        assert!(services.clients.is_empty());
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let services = services();
        let mut conn = pipe(&services);
        let token = register(&mut conn, "alice").await;

        match call(&mut conn, ClientPacket::Connect { token: token.clone() }).await {
            ServerPacket::GameState(roster) => {
                assert_eq!(roster.players.len(), 1);
                assert_eq!(roster.players[0].username, "alice");
            }
            other => panic!("expected the roster, got {:?}", other),
        }
        assert_eq!(services.clients.connected_players(), vec!["alice"]);

        let mut second = pipe(&services);
        assert_eq!(
            error_kind(call(&mut second, ClientPacket::Connect { token }).await),
            ErrorKind::AlreadyConnected
        );
        assert_eq!(services.clients.len(), 1);

        // Snapshots reach the open session
        let mut scheduler = services.scheduler(60);
        assert_eq!(scheduler.tick().await, Some(1));
        match next(&mut conn).await {
            ServerPacket::GameState(state) => {
                assert_eq!(state.players[0].event_type, PlayerEventType::Connect)
            }
            other => panic!("expected a snapshot, got {:?}", other),
        }

        drop(conn);
        timeout(Duration::from_secs(5), async {
            while !services.clients.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(services.players.is_empty().await);
    }

    #[tokio::test]
    async fn test_player_update_stream() {
        let services = services();
        let mut session = pipe(&services);
        let token = register(&mut session, "alice").await;
        call(&mut session, ClientPacket::Connect { token: token.clone() }).await;

        let mut updates = pipe(&services);
        send_packet(&mut updates, &ClientPacket::OpenPlayerUpdates { token })
            .await
            .unwrap();
        for x in 1..=3 {
            let state = PlayerState::new(Vector2::new(x as f32, 0.0), Vector2::new(1.0, 0.0));
            send_packet(&mut updates, &ClientPacket::PlayerUpdate { state })
                .await
                .unwrap();
        }
        assert!(matches!(
            call(&mut updates, ClientPacket::ClosePlayerUpdates).await,
            ServerPacket::Ack
        ));

        let state = services.players.get("alice").await.unwrap();
        assert_eq!(state.position, Vector2::new(3.0, 0.0));
    }

    #[tokio::test]
    async fn test_player_updates_need_a_session() {
        let services = services();
        let mut conn = pipe(&services);
        let token = register(&mut conn, "bob").await;

        send_packet(&mut conn, &ClientPacket::OpenPlayerUpdates { token })
            .await
            .unwrap();
        send_packet(
            &mut conn,
            &ClientPacket::PlayerUpdate {
                state: PlayerState::default(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            error_kind(call(&mut conn, ClientPacket::ClosePlayerUpdates).await),
            ErrorKind::NotFound
        );

        // Updates outside a stream are refused
        let stray = ClientPacket::PlayerUpdate {
            state: PlayerState::default(),
        };
        assert_eq!(error_kind(call(&mut conn, stray).await), ErrorKind::ValidationFailed);
    }

    #[tokio::test]
    async fn test_stalled_session_ends_when_dropped_from_registry() {
        let services = services_with_capacity(4);
        let mut requests = pipe(&services);
        let token = register(&mut requests, "alice").await;

        let shutdown = CancellationToken::new();
        let (mut conn, task) = spawn_connection(&services, 256, &shutdown);
        match call(&mut conn, ClientPacket::Connect { token }).await {
            ServerPacket::GameState(_) => {}
            other => panic!("expected the roster, got {:?}", other),
        }

        // The client stops reading; the first snapshot wedges the writer
        services.clients.broadcast(crowded_snapshot(20)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        for _ in 0..20 {
            services.clients.broadcast(crowded_snapshot(20)).await;
        }
        assert!(services.clients.is_empty());
        assert!(services.players.is_empty().await);

        timeout(Duration::from_secs(2), task)
            .await
            .expect("session task still blocked on the write")
            .unwrap();
        drop(conn);
    }

    #[tokio::test]
    async fn test_shutdown_ends_sessions_and_streams() {
        let services = services();
        let mut requests = pipe(&services);
        let token = register(&mut requests, "alice").await;

        let shutdown = CancellationToken::new();
        let (mut session, session_task) = spawn_connection(&services, 64 * 1024, &shutdown);
        call(&mut session, ClientPacket::Connect { token: token.clone() }).await;
        assert_eq!(services.clients.len(), 1);

        let (mut updates, updates_task) = spawn_connection(&services, 64 * 1024, &shutdown);
        send_packet(&mut updates, &ClientPacket::OpenPlayerUpdates { token })
            .await
            .unwrap();

        shutdown.cancel();
        timeout(Duration::from_secs(2), session_task).await.unwrap().unwrap();
        timeout(Duration::from_secs(2), updates_task).await.unwrap().unwrap();
        assert!(services.clients.is_empty());
        assert!(services.players.is_empty().await);

        // Both connections were closed by the server
        assert!(recv_packet::<_, ServerPacket>(&mut session).await.unwrap().is_none());
        assert!(recv_packet::<_, ServerPacket>(&mut updates).await.unwrap().is_none());
    }
}

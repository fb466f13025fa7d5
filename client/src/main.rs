use clap::Parser;
use client::network::{ClientError, GameClient};
use client::world::WorldView;
use log::{info, warn};
use rand::Rng;
use shared::{ChunkCoord, ErrorKind, PlayerState, Tile, TileCoord, TileKind, Vector2};
use std::time::Duration;

const PAINTS: [TileKind; 5] = [
    TileKind::Grass,
    TileKind::Dirt,
    TileKind::Sand,
    TileKind::Water,
    TileKind::Stone,
];

#[derive(Parser, Debug)]
#[command(author, version, about = "Wandering bot for the tile world server", long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    #[arg(short = 'u', long, default_value = "bot")]
    username: String,

    #[arg(short = 'p', long, default_value = "bot-password")]
    password: String,

    /// Used only if the account has to be created
    #[arg(short = 'e', long, default_value = "bot@example.com")]
    email: String,

    /// Player updates sent per batch
    #[arg(short = 'b', long, default_value = "10")]
    batch: usize,

    /// Milliseconds between batches
    #[arg(short = 'i', long, default_value = "500")]
    interval: u64,

    /// Chance per batch of repainting a random tile, from 0 to 1
    #[arg(long, default_value = "0.2")]
    paint_chance: f64,
}

/// Logs in, creating the account on first use.
async fn sign_in(client: &mut GameClient, args: &Args) -> Result<String, ClientError> {
    match client.login(&args.username, &args.password).await {
        Ok(creds) => Ok(creds.token),
        Err(e) if e.rpc().map(|r| r.kind) == Some(ErrorKind::InvalidCredentials) => {
            info!("No account for {}, registering", args.username);
            let creds = client
                .register(&args.username, &args.password, &args.email)
                .await?;
            Ok(creds.token)
        }
        Err(e) => Err(e),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    info!("Connecting to: {}", args.server);

    let mut requests = GameClient::connect(&args.server).await?;
    let token = sign_in(&mut requests, &args).await?;

    let home = ChunkCoord::new(0, 0);
    let mut view = WorldView::new();
    let chunk = requests.load_chunk(home).await?;
    let size = chunk.size as u32;
    view.insert_chunk(chunk);

    let mut session = GameClient::connect(&args.server)
        .await?
        .open_session(&token)
        .await?;
    view.apply(session.roster());
    info!("{} players online", view.player_count());

    let mut updates = GameClient::connect(&args.server).await?;
    let mut ticker = tokio::time::interval(Duration::from_millis(args.interval.max(1)));
    let mut position = Vector2::default();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, leaving");
                break;
            }
            snapshot = session.next_snapshot() => match snapshot? {
                Some(snapshot) => {
                    view.apply(&snapshot);
                    info!(
                        "Snapshot: {} player events, {} tile updates, {} players online",
                        snapshot.players.len(),
                        snapshot.tile_updates.len(),
                        view.player_count()
                    );
                }
                None => {
                    warn!("Server ended the session");
                    break;
                }
            },
            _ = ticker.tick() => {
                let mut rng = rand::thread_rng();
                let velocity = Vector2::new(rng.gen_range(-1.0..=1.0), rng.gen_range(-1.0..=1.0));
                let steps: Vec<PlayerState> = (0..args.batch)
                    .map(|_| {
                        position = Vector2::new(position.x + velocity.x, position.y + velocity.y);
                        PlayerState::new(position, velocity)
                    })
                    .collect();

                let paint = size > 0 && rng.gen_bool(args.paint_chance.clamp(0.0, 1.0));
                let target = TileCoord::new(
                    rng.gen_range(0..size.max(1)),
                    rng.gen_range(0..size.max(1)),
                );
                let kind = PAINTS[rng.gen_range(0..PAINTS.len())];
                drop(rng);

                updates.send_player_updates(&token, steps).await?;
                if paint {
                    updates.update_tile(home, target, Tile::new(kind)).await?;
                    info!("Painted tile ({},{}) {:?}", target.x, target.y, kind);
                }
            }
        }
    }

    Ok(())
}

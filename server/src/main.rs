use clap::Parser;
use log::{error, info};
use server::config::{Args, ServerConfig};
use server::network::{Server, Services};
use server::storage::{FjallDatabase, GameDatabase};
use server::world::{resolve_world_seed, SeededGenerator};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Loads the configuration, opens the world database and serves until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::load(Args::parse())?;

    // Without storage there is nothing to serve
    let db: Arc<dyn GameDatabase> = Arc::new(FjallDatabase::open(&config.data_dir)?);
    let seed = resolve_world_seed(db.as_ref(), config.seed)?;
    info!("World seed {}, chunk size {}", seed, config.chunk_size);

    let services = Arc::new(Services::new(
        &config,
        Arc::clone(&db),
        Box::new(SeededGenerator::new(seed)),
    ));
    let shutdown = CancellationToken::new();

    let scheduler_handle = tokio::spawn(services.scheduler(config.tick_rate).run(shutdown.clone()));

    let server = Server::bind(&config.listen_addr(), Arc::clone(&services)).await?;
    let server_handle = tokio::spawn(server.run(shutdown.clone()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Received Ctrl+C, shutting down gracefully...");
    shutdown.cancel();

    if let Err(e) = server_handle.await {
        error!("Network task panicked: {}", e);
    }
    if let Err(e) = scheduler_handle.await {
        error!("Broadcast task panicked: {}", e);
    }

    info!("Loaded {} chunks this run", services.world.loaded_chunks());
    db.flush()?;
    info!("World saved");
    Ok(())
}

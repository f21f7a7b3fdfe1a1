//! Lattice Game Server
//!
//! A tick-driven tile world server: chunked maps, scheduled events, monster
//! pathfinding and a framed TCP protocol for clients.

use anyhow::Result;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use lattice_server::config::ServerConfig;
use lattice_server::game::{GameLoop, World};
use lattice_server::net::Listener;
use lattice_server::VERSION;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = ServerConfig::load().await?;

    // Initialize logging
    init_logging(&config);

    info!(version = VERSION, name = %config.server_name, "Lattice game server starting");
    info!(
        "Configuration loaded from: {}",
        config.config_path.display()
    );

    // Create shutdown channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Build the world
    let (connections_tx, connections_rx) = mpsc::unbounded_channel();
    let mut world = World::new(config.world_settings()).with_connections(connections_rx);
    if config.dev_mode {
        world.generate_dev_map();
        info!(
            chunks = world.lattice().chunk_count(),
            "Development mode: generated flat map"
        );
    }

    // Start TCP listener for game connections
    let listener = Listener::bind(config.game_address()?).await?;
    let mut acceptor_shutdown_rx = shutdown_tx.subscribe();
    let acceptor = tokio::spawn(async move {
        listener.run(connections_tx, &mut acceptor_shutdown_rx).await;
    });

    // Signal handling runs beside the game loop
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        wait_for_shutdown(signal_tx).await;
    });

    info!("Server startup complete!");

    // The world stays on this task; the loop returns on shutdown
    let stats_interval = config.log_interval_ticks;
    let mut game_loop = GameLoop::new(config.tick_interval(), config.log_interval_ticks);
    let mut loop_shutdown_rx = shutdown_tx.subscribe();
    game_loop
        .run(&mut loop_shutdown_rx, |tick| {
            world.tick(tick);

            if stats_interval != 0 && tick % stats_interval == 0 {
                let stats = world.stats();
                info!(
                    tick = stats.tick,
                    creatures = stats.creatures,
                    players = stats.players,
                    pending_events = stats.pending_events,
                    events_handled = stats.events_handled,
                    path_requests = stats.path.requests,
                    path_iterations = stats.path.iterations,
                    "World statistics"
                );
            }
        })
        .await;

    info!("Shutting down server...");

    if let Err(e) = acceptor.await {
        error!(error = %e, "Connection acceptor failed");
    }

    info!("Server shutdown complete. Goodbye!");
    Ok(())
}

/// Initialize the logging/tracing system
fn init_logging(config: &ServerConfig) {
    let default_filter = if config.debug {
        "debug,lattice_server=trace"
    } else {
        "info,lattice_server=debug"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if config.log_format == "json" {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_current_span(false)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_level(true)
            .init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    // Signal all tasks to shut down
    let _ = shutdown_tx.send(());
}

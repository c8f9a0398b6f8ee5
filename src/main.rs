use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use bastion::config::AppConfig;
use bastion::directory::StaticDirectory;
use bastion::hostkeys::FileHostKeyStore;
use bastion::server::AppState;

#[derive(Parser, Debug)]
#[command(name = "bastion", about = "Web SSH gateway with live host metrics")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "bastion.toml")]
    config: PathBuf,

    /// Listen address, overriding the configuration file
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    let addr = config.listen_addr()?;

    // The guard must stay alive for file logging to flush.
    let _guard = bastion::logging::init_logging(config.server.log_dir.clone());

    tracing::info!("Starting Bastion SSH gateway");
    if let Some(dir) = &config.server.log_dir {
        tracing::info!("Logging to {}", dir.display());
    }

    let store = Arc::new(FileHostKeyStore::open(config.hostkeys_path())?);
    let directory = Arc::new(StaticDirectory::new(config.servers.clone()));
    tracing::info!("Directory contains {} server entries", config.servers.len());

    let state = AppState::new(&config, store, directory);
    state
        .registry
        .spawn_sweeper(config.session_max_age(), config.sweep_interval());

    let app = bastion::server::router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

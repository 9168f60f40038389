//! API server binary: HTTP surface plus an embedded extraction worker

use the_archive::api::AppState;
use the_archive::ArchiveConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ArchiveConfig::from_file(&path)?,
        None => ArchiveConfig::default(),
    };

    info!("Starting archive server v{}", the_archive::VERSION);

    let bind = config.server.bind.clone();
    let (state, worker) = AppState::from_config(config).await?;

    tokio::spawn(worker.run());

    the_archive::api::serve(state, &bind).await?;
    Ok(())
}

// Pelorus plugin runtime
// Main entry point for the pelorus binary

use clap::Parser;
use pelorus_engine::cli::{Cli, Command};
use pelorus_engine::config::Settings;
use pelorus_engine::daemon::Daemon;
use pelorus_engine::registry::discovery;
use pelorus_engine::telemetry::{init_telemetry, init_telemetry_with_level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Basic telemetry first, before settings are loaded
    init_telemetry();

    let settings = if let Some(path) = &cli.config {
        Settings::load_from_path(path)?
    } else {
        Settings::load_or_default()?
    };

    // Re-initialize with the configured level (RUST_LOG still wins)
    let level = cli.log.as_deref().unwrap_or(&settings.core.log_level);
    init_telemetry_with_level(level);

    tracing::info!("Pelorus v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Start => run(settings).await,
        Command::Plugins => {
            for descriptor in discovery::list_packages(&settings.core.package_dir) {
                println!("{} {}", descriptor.name, descriptor.version);
            }
            Ok(())
        }
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let http_addr = settings.core.http_addr.clone();
    let daemon = Daemon::boot(settings).await?;
    let app = pelorus_engine::http::router(daemon.registry());

    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    tracing::info!("Plugin API listening on http://{}", http_addr);

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
    });
    server.await?;

    daemon.shutdown().await;
    tracing::info!("Pelorus stopped");
    Ok(())
}

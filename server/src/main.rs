use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use push_hub_server::config::{generate_config_template, Config};
use push_hub_server::routes;
use push_hub_server::state::{AppState, Backends};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("push_hub_server=info,tower_http=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
    }

    tracing::info!("Push hub server v{} starting", env!("CARGO_PKG_VERSION"));

    let shutdown = CancellationToken::new();
    let addr = format!("{}:{}", config.bind_address, config.port);
    let (app_state, tasks) = AppState::start(config, Backends::default(), shutdown.clone()).await?;
    let app = routes::build_router(app_state);

    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let signal = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        }
        tracing::info!("Shutdown requested");
        signal.cancel();
    })
    .await?;

    // Let the hub close its clients and record their departures.
    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }
    tracing::info!("Push hub server stopped");

    Ok(())
}

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prism_gateway::config::AppConfig;
use prism_gateway::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Default to INFO; DEBUG=true or RUST_LOG raises verbosity.
    let default_filter = if std::env::var("DEBUG")
        .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
    {
        "prism_gateway=debug,tower_http=debug,sqlx=info"
    } else {
        "prism_gateway=info,tower_http=info,sqlx=warn"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env().await?;
    let port = config.server_port;

    tracing::info!("🚀 Initializing Prism Gateway services...");
    let state = AppState::initialize(config).await?;

    tracing::info!(
        "⏰ Starting scheduler with jobs: {:?}",
        state.scheduler.job_names()
    );
    state.scheduler.start();

    let app = prism_gateway::create_app(state.clone());
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));

    tracing::info!("✅ Prism Gateway listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(state))
    .await?;

    Ok(())
}

/// Ctrl-C / SIGTERM: stop background jobs and drain the accounting channel
/// before the process exits, so no usage record in flight is lost.
async fn shutdown_signal(state: AppState) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("🛑 Shutdown signal received - draining...");
    state.shutdown().await;
}

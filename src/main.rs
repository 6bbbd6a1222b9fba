use std::future::IntoFuture;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use foundry_chat::config::{Cli, Command, Config};
use foundry_chat::runtime::foundry::FoundryManager;
use foundry_chat::server::api::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "foundry_chat=debug,tower_http=debug"
    } else {
        "foundry_chat=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("foundry-chat v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);
    let config = Arc::new(config);

    info!(
        alias = %config.model.alias,
        init_timeout_secs = config.model.initialization_timeout_secs,
        streaming_delay_ms = config.model.streaming_delay().map(|d| d.as_millis() as u64).unwrap_or(0),
        endpoint = ?config.runtime.endpoint,
        "Configuration loaded"
    );

    let manager = Arc::new(FoundryManager::new(config.runtime.clone()));
    let state = Arc::new(AppState::new(config.clone(), manager));

    let result = match cli.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(state.clone()).await,
        Command::Ask { prompt, no_stream } => ask(&state, &prompt, no_stream).await,
    };

    state.client().shutdown().await;
    result
}

async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let listen_addr = state.config.server.listen.clone();
    let grace = Duration::from_secs(state.config.server.shutdown_grace_secs);

    // Build the HTTP router.
    let app = build_router(state);

    info!(addr = %listen_addr, "Starting server");
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    let shutdown = CancellationToken::new();
    let server = axum::serve(listener, app).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    });

    let mut server = std::pin::pin!(server.into_future());
    tokio::select! {
        result = &mut server => return Ok(result?),
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    }

    // Open SSE streams would otherwise hold the server forever.
    match tokio::time::timeout(grace, server).await {
        Ok(result) => result?,
        Err(_) => warn!(grace_secs = grace.as_secs(), "In-flight requests did not finish in time"),
    }
    Ok(())
}

async fn ask(state: &AppState, prompt: &str, no_stream: bool) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "[ASSISTANT]: ")?;
    stdout.flush()?;

    if no_stream {
        let answer = state.gateway.chat(prompt).await?;
        writeln!(stdout, "{answer}")?;
        return Ok(());
    }

    let mut chunks = state
        .gateway
        .chat_stream(prompt, CancellationToken::new())
        .await?;
    while let Some(chunk) = chunks.next().await {
        write!(stdout, "{}", chunk?)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

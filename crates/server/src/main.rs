//! claude-relay daemon binary.
//!
//! Startup order matters: config first (fatal if unreadable), then the
//! session index, then multiplexer reconciliation so tabs surviving a
//! previous daemon life show up as detached, and only then the listener.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use claude_relay_core::{paths, IndexConfig, MultiplexerStatus, SessionIndex};
use claude_relay_server::bridge::{BridgeSettings, TerminalBridges};
use claude_relay_server::{build_state, create_app, probe_cli_version, Config};

#[tokio::main]
async fn main() -> ExitCode {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("claude-relay: failed to install tracing subscriber");
        return ExitCode::FAILURE;
    }

    let config_path = match paths::config_file() {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "Cannot resolve the config file location");
            return ExitCode::FAILURE;
        }
    };
    let config = match Config::load_or_create(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(path = %config_path.display(), error = %format!("{e:#}"), "Configuration is unusable");
            return ExitCode::FAILURE;
        }
    };
    let cache_path = match paths::cache_file() {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "Cannot resolve the session cache location");
            return ExitCode::FAILURE;
        }
    };

    let cli_version = probe_cli_version(&config.claude.binary).await;
    if cli_version.is_empty() {
        info!(binary = %config.claude.binary, "CLI version probe failed; status will omit it");
    }

    let index = SessionIndex::new(IndexConfig::new(
        config.claude.session_dir.clone(),
        cache_path,
    ));
    let bridges = TerminalBridges::new(BridgeSettings::from_config(&config));
    let bind = (config.host.clone(), config.port);
    let state = build_state(config, index.clone(), bridges.clone(), cli_version);

    if let Err(e) = index.start().await {
        // Degraded but functional: the periodic rescan is already running.
        warn!(error = %e, "Session log watcher unavailable; relying on periodic rescans");
    }
    for id in state.tmux.reconcile().await {
        index
            .set_multiplexer_status(&id, MultiplexerStatus::Detached)
            .await;
    }
    bridges.start();

    let addr = match format!("{}:{}", bind.0, bind.1).parse::<SocketAddr>() {
        Ok(a) => a,
        Err(e) => {
            error!(host = %bind.0, port = bind.1, error = %e, "Invalid host/port in config");
            return ExitCode::FAILURE;
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %addr, error = %e, "Cannot bind listen address");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %addr, version = env!("CARGO_PKG_VERSION"), "claude-relay listening");

    let app = create_app(Arc::clone(&state));
    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    let result = serve.await;

    // All bridges are torn down before the process exits; stop() blocks
    // until every PTY teardown has been initiated and the cache is flushed.
    bridges.stop();
    index.stop().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server terminated abnormally");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

//! `swdl`: validate, plan and run workflow definitions from the command line,
//! or serve the same operations over HTTP.

mod cli;
mod http;
mod state;
#[cfg(test)]
mod testing;

use std::time::Duration;

use clap::Parser;
use clap_complete::generate;

use cli::{Cli, Commands};
use state::AppState;

/// How often `serve` applies gate timeouts.
const GATE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    swdl_observe::init_tracing(log_filter(cli.quiet, cli.verbose), swdl_observe::otel_requested())
        .map_err(|e| anyhow::anyhow!("tracing setup failed: {e}"))?;

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(shell, &mut cmd, "swdl", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init(cli.ephemeral).await?;
    let outcome = dispatch(cli, state).await;
    swdl_observe::shutdown_tracing();
    outcome
}

/// Default log filter for the verbosity flags; `RUST_LOG` takes precedence.
fn log_filter(quiet: bool, verbose: u8) -> &'static str {
    match (quiet, verbose) {
        (_, 2..) => "trace",
        (_, 1) => "info,swdl=debug",
        (true, 0) => "error",
        (false, 0) => "warn",
    }
}

async fn dispatch(cli: Cli, state: AppState) -> anyhow::Result<()> {
    let Cli {
        json,
        quiet,
        ephemeral,
        command,
        ..
    } = cli;

    match command {
        Commands::Workflow { action } => {
            cli::workflow::handle_workflow_command(action, &state, json).await
        }
        Commands::Run {
            target,
            params,
            timeout,
        } => cli::execution::handle_run(&target, &params, timeout, &state, json, quiet).await,
        Commands::Execution { action } => {
            cli::execution::handle_execution_command(action, &state, json, quiet).await
        }
        Commands::Serve { port, host } => {
            let host = host.unwrap_or_else(|| state.config.server.host.clone());
            let port = port.unwrap_or(state.config.server.port);
            serve(state, &format!("{host}:{port}"), ephemeral).await
        }
        // Answered before state is built.
        Commands::Completions { .. } => Ok(()),
    }
}

async fn serve(state: AppState, addr: &str, ephemeral: bool) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;

    println!(
        "  {} {}",
        console::style("swdl serve").bold(),
        console::style(format!("http://{addr}/api/v1")).cyan()
    );
    let storage = if ephemeral {
        console::style("storage: in-memory (lost on exit)".to_string()).yellow()
    } else {
        console::style(format!("storage: {}", state.data_dir.display())).dim()
    };
    println!("  {storage}");

    let sweeper = tokio::spawn(sweep_gates(state.clone()));
    axum::serve(listener, http::router::build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    sweeper.abort();

    tracing::info!("server stopped");
    Ok(())
}

/// Periodically apply `on_timeout` to gates past their deadline.
async fn sweep_gates(state: AppState) {
    let mut ticker = tokio::time::interval(GATE_SWEEP_INTERVAL);
    loop {
        ticker.tick().await;
        match state.execution_service.expire_gates(chrono::Utc::now()).await {
            Ok(touched) if !touched.is_empty() => {
                tracing::info!(executions = touched.len(), "expired gates");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "gate sweep failed"),
        }
    }
}

/// Resolves on Ctrl+C, or SIGTERM on unix. A signal that cannot be watched
/// is logged and never fires.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "cannot watch for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot watch for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => tracing::info!("interrupted, shutting down"),
        () = terminate => tracing::info!("terminated, shutting down"),
    }
}

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use claude_bridge::cli::{Cli, Command};
use claude_bridge::config::BridgeConfig;
use claude_bridge::domains::sessions::{Session, SessionDbManager, SessionManager};
use claude_bridge::infrastructure::database::Database;

fn setup_logging(config: &BridgeConfig) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .format_timestamp_millis()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config =
        BridgeConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    setup_logging(&config);

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Sessions { user, json } => list_sessions(&config, user, json),
        Command::Idle => {
            let manager = open_manager(&config)?;
            let plan = manager.idle_candidates()?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn open_manager(config: &BridgeConfig) -> Result<SessionManager> {
    let db = Database::new(&config.database.path)?;
    Ok(SessionManager::new(
        db,
        config.session.clone(),
        config.assistant.clone(),
    ))
}

async fn serve(config: BridgeConfig) -> Result<()> {
    let manager = open_manager(&config)?;
    let recovery = manager
        .recover_after_restart()
        .await
        .context("Failed to recover sessions from the previous run")?;
    if !recovery.resumable.is_empty() {
        info!(
            "[bridge] {} active session(s) will resume on their next message",
            recovery.resumable.len()
        );
    }

    let cancel = CancellationToken::new();
    let sweeper = manager.spawn_idle_sweeper(cancel.clone());
    info!(
        "[bridge] Serving with workspaces under {}",
        config.session.work_dir.display()
    );

    wait_for_shutdown_signal().await;
    info!("[bridge] Shutting down");
    cancel.cancel();

    let report = manager.end_all_active_sessions().await;
    info!(
        "[bridge] Ended {} session(s); {} failure(s)",
        report.ended.len(),
        report.failures.len()
    );
    if report.stop_all.timed_out {
        warn!("[bridge] Some assistant processes had to be killed");
    }
    if let Err(e) = sweeper.await {
        warn!("[bridge] Idle sweeper ended abnormally: {e}");
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("[bridge] SIGTERM handler unavailable: {e}"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("[bridge] Ctrl-C handler failed: {e}");
    }
}

fn list_sessions(config: &BridgeConfig, user: Option<i64>, json: bool) -> Result<()> {
    let db_manager = SessionDbManager::new(Database::new(&config.database.path)?);
    let sessions: Vec<Session> = match user {
        Some(user_id) => db_manager.list_sessions_for_user(user_id)?,
        None => db_manager.list_open_sessions()?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No sessions found");
        return Ok(());
    }
    for session in sessions {
        println!(
            "{:<34} {:<9} {:<24} ${:<8.4} {}",
            session.session_id,
            session.status.as_str(),
            session.branch_name,
            session.running_cost,
            session.scope()
        );
    }
    Ok(())
}

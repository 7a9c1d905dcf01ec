//! Toolyard: a local process supervisor and multiplexed log inspector
//! with an HTTP control API.
//!
//! This is the entry point of the application. It parses command-line
//! arguments, loads configuration, builds the supervisor core, exposes
//! it over HTTP, and starts every configured tool respecting declared
//! dependencies.

mod ansi;
mod api;
mod bus;
mod config;
mod deps;
mod error;
mod manager;
mod pidfile;
mod process;
mod procutil;
mod stream;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::Parser;

use crate::api::ApiState;
use crate::config::ToolConfig;
use crate::manager::{ProcessManager, DEFAULT_MAX_LOG_LINES};

const DEFAULT_CONFIG_FILE: &str = "toolyard.toml";
const API_VIRTUAL_TOOL_NAME: &str = "MCP API";

#[derive(Parser, Debug)]
#[command(
    name = "toolyard",
    version,
    about = "Run and supervise a set of declared tools with a shared HTTP control API",
    styles = help_styles()
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum log lines retained per tool before the oldest are evicted.
    #[arg(long)]
    max_lines: Option<usize>,

    /// Port the HTTP control API binds to on 127.0.0.1.
    #[arg(short, long)]
    port: Option<u16>,
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

/// Kills every tracked process without waiting, on the way out. Dropped
/// at the very end of `main` (after `cleanup` has already had its
/// chance to shut down gracefully) so a panic unwinding past it still
/// leaves no orphans behind.
struct ExitGuard(ProcessManager);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.kill_all_sync();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let loaded = config::load_config(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;
    for warning in &loaded.warnings {
        tracing::warn!("{warning}");
    }

    let max_log_lines = cli.max_lines.unwrap_or(DEFAULT_MAX_LOG_LINES);
    let port = cli.port.or(loaded.port).unwrap_or(api::DEFAULT_PORT);

    let manager = ProcessManager::new(Some(config_path.clone()), max_log_lines);
    manager
        .initialize(loaded.tools)
        .await
        .context("failed to initialize process manager")?;
    let exit_guard = ExitGuard(manager.clone());

    let virtual_tool_index = manager.create_virtual_tool(API_VIRTUAL_TOOL_NAME).await;

    let reload_manager = manager.clone();
    let reload_callback: Arc<dyn Fn(Vec<ToolConfig>) + Send + Sync> =
        Arc::new(move |_new_tools: Vec<ToolConfig>| {
            let manager = reload_manager.clone();
            tokio::spawn(async move {
                start_everything(&manager).await;
            });
        });

    let api_state = ApiState::new(manager.clone(), virtual_tool_index).with_reload_callback(reload_callback);
    tokio::spawn(async move {
        if let Err(err) = api::serve(api_state, port).await {
            tracing::error!(error = %err, "HTTP control API stopped unexpectedly");
        }
    });

    start_everything(&manager).await;

    wait_for_shutdown_signal().await;
    tracing::info!("shutting down");
    manager.cleanup().await.context("cleanup failed")?;

    drop(exit_guard);
    Ok(())
}

/// Starts every configured tool respecting `depends_on`, treating a
/// dependency as ready once it has either settled into `running` or
/// already finished (`stopped`) — a one-shot dependency still counts as
/// having done its job.
async fn start_everything(manager: &ProcessManager) {
    let manager_for_ready = manager.clone();
    let is_ready = move |name: &str| {
        futures::executor::block_on(manager_for_ready.get_tool_by_name(name))
            .map(|tool| {
                matches!(
                    tool.status,
                    process::ToolStatus::Running | process::ToolStatus::Stopped
                )
            })
            .unwrap_or(false)
    };
    if let Err(err) = manager.start_all_with_dependencies(is_ready, None).await {
        tracing::error!(error = %err, "failed to start configured tools");
    }
}

/// Resolves once Ctrl-C or (on Unix) `SIGTERM` is received.
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

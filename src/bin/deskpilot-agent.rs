//! deskpilot agent entry point
//!
//! Runs inside a user desktop session, holds the session's single-instance
//! lock, and serves capability commands forwarded by the broker. With
//! `--watchdog` it instead supervises a child agent under the bounded
//! restart budget.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use deskpilot::agent::{
    register_builtin_handlers, run_watchdog, AgentConfig, AgentExit, AgentRuntime, Dispatcher,
    HandlerContext, HealthMonitor, LogManager, PluginManager, RingBufferLayer,
    SingleInstanceGuard, RESTART_EXIT_CODE,
};
use deskpilot::domain_types::{RestartBudget, RestartWindowSecs};
use deskpilot::gui::backend::{
    AccessibilityTree, ClipboardAccess, InputSynthesizer, ScreenCapture, WindowSystem,
};
use deskpilot::gui::input::{SendTextConfig, SendTextEngine};
use deskpilot::gui::position_memory::PositionMemory;
use deskpilot::gui::{CaptureService, WindowManager};
use deskpilot::production_time_provider;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

/// Desktop-session agent serving capability commands
#[derive(Debug, Parser)]
#[command(name = "deskpilot-agent", version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Broker WebSocket URL (overrides config)
    #[arg(long)]
    broker_url: Option<String>,

    /// Session label to register under (overrides config)
    #[arg(long)]
    session: Option<String>,

    /// Plugin manifest directory (overrides config)
    #[arg(long)]
    plugin_dir: Option<PathBuf>,

    /// Supervise a child agent instead of running one
    #[arg(long)]
    watchdog: bool,
}

struct Backends {
    windows: Arc<dyn WindowSystem>,
    tree: Arc<dyn AccessibilityTree>,
    input: Arc<dyn InputSynthesizer>,
    clipboard: Arc<dyn ClipboardAccess>,
    capture: Arc<dyn ScreenCapture>,
}

#[cfg(windows)]
fn build_backends() -> Result<Backends> {
    use deskpilot::platform::{
        Win32AccessibilityTree, Win32Clipboard, Win32Input, Win32ScreenCapture,
        Win32WindowSystem,
    };
    Ok(Backends {
        windows: Arc::new(Win32WindowSystem::new()),
        tree: Arc::new(Win32AccessibilityTree::new()),
        input: Arc::new(Win32Input::new()?),
        clipboard: Arc::new(Win32Clipboard),
        capture: Arc::new(Win32ScreenCapture),
    })
}

#[cfg(not(windows))]
fn build_backends() -> Result<Backends> {
    // Off Windows the agent serves the protocol against a simulated desktop,
    // which keeps integration environments and demos runnable anywhere
    let desktop = Arc::new(deskpilot::gui::SimulatedDesktop::new());
    Ok(Backends {
        windows: desktop.clone(),
        tree: desktop.clone(),
        input: desktop.clone(),
        clipboard: desktop.clone(),
        capture: desktop,
    })
}

fn main() -> Result<()> {
    let args = Args::parse();
    let code = tokio::runtime::Runtime::new()?.block_on(run(args))?;
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::development(),
    };
    if let Some(url) = args.broker_url.clone() {
        config.broker_url = url;
    }
    if let Some(session) = args.session.clone() {
        config.user_session = session;
    }
    if let Some(dir) = args.plugin_dir.clone() {
        config.plugin_dir = Some(dir);
    }
    config.validate()?;

    if args.watchdog {
        return run_supervisor(&args).await;
    }

    let logs = Arc::new(LogManager::new(config.log_buffer));
    let mut ring_layer = RingBufferLayer::new(Arc::clone(&logs));
    if let Some(path) = &config.log_file {
        let sink = deskpilot::agent::log_buffer::RotatingFileSink::open(
            path.clone(),
            config.log_file_max_bytes,
        )?;
        ring_layer = ring_layer.with_file_sink(Arc::new(sink));
    }
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("deskpilot=info".parse()?),
            ),
        )
        .with(ring_layer)
        .init();

    // Exactly one agent per desktop session
    let guard = match SingleInstanceGuard::acquire(&config.user_session) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("deskpilot-agent: {e}");
            return Ok(1);
        }
    };
    info!(session = %config.user_session, "single-instance lock held");

    let backends = build_backends()?;
    let time = production_time_provider();
    let windows = Arc::new(WindowManager::new(Arc::clone(&backends.windows)));
    let memory = Arc::new(match &config.position_memory_path {
        Some(path) => PositionMemory::load(path, Default::default(), Default::default()),
        None => PositionMemory::new(Default::default(), Default::default()),
    });
    let engine = Arc::new(SendTextEngine::new(
        Arc::clone(&windows),
        Arc::clone(&backends.tree),
        Arc::clone(&backends.input),
        Arc::clone(&backends.clipboard),
        Arc::clone(&memory),
        Arc::clone(&time),
        SendTextConfig {
            keystroke_delay: config.keystroke_delay,
            focus_settle: config.focus_settle,
        },
    ));
    let capture = Arc::new(CaptureService::new(
        Arc::clone(&backends.capture),
        Arc::clone(&windows),
    ));
    let health = Arc::new(HealthMonitor::new(config.health_sample, config.health_window));
    let (restart_tx, restart_rx) = mpsc::channel(4);

    let dispatcher = Arc::new(Dispatcher::new(config.capabilities.clone()));
    let ctx = Arc::new(HandlerContext {
        windows,
        tree: Arc::clone(&backends.tree),
        input: Arc::clone(&backends.input),
        engine,
        capture,
        ocr: None,
        memory: Arc::clone(&memory),
        logs: Arc::clone(&logs),
        health: Arc::clone(&health),
        restart: restart_tx.clone(),
    });
    register_builtin_handlers(&dispatcher, Arc::downgrade(&dispatcher), ctx);

    let _plugins = match &config.plugin_dir {
        Some(dir) if dir.is_dir() => {
            let manager = Arc::new(PluginManager::new(
                Arc::downgrade(&dispatcher),
                dir.clone(),
            ));
            match manager.reload_all() {
                Ok(loaded) => info!(count = loaded.len(), "plugins loaded"),
                Err(e) => error!(error = %e, "initial plugin scan failed"),
            }
            let restart = config.reexec_on_plugin_change.then(|| restart_tx.clone());
            if let Err(e) =
                manager.spawn_watcher(config.watch_debounce.as_duration(), restart)
            {
                error!(error = %e, "plugin watcher unavailable");
            }
            Some(manager)
        }
        _ => None,
    };

    let runtime = AgentRuntime::new(
        config,
        Arc::clone(&dispatcher),
        health,
        memory,
        time,
    );
    let shutdown = runtime.shutdown_token();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("interrupt received, shutting down");
        shutdown.cancel();
    });

    let exit = runtime.run(restart_rx).await;
    drop(guard);
    Ok(match exit {
        AgentExit::Shutdown => 0,
        AgentExit::Restart(request) => {
            info!(reason = %request.reason, "exiting for re-exec");
            tokio::time::sleep(std::time::Duration::from_secs(request.delay_secs)).await;
            RESTART_EXIT_CODE
        }
    })
}

async fn run_supervisor(args: &Args) -> Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("deskpilot=info".parse()?),
        )
        .init();

    let program = std::env::current_exe()?;
    let mut child_args: Vec<String> = Vec::new();
    if let Some(config) = &args.config {
        child_args.push("--config".to_string());
        child_args.push(config.display().to_string());
    }
    if let Some(url) = &args.broker_url {
        child_args.push("--broker-url".to_string());
        child_args.push(url.clone());
    }
    if let Some(session) = &args.session {
        child_args.push("--session".to_string());
        child_args.push(session.clone());
    }
    if let Some(dir) = &args.plugin_dir {
        child_args.push("--plugin-dir".to_string());
        child_args.push(dir.display().to_string());
    }

    let code = run_watchdog(
        &program.display().to_string(),
        &child_args,
        RestartBudget::default(),
        RestartWindowSecs::default(),
        production_time_provider(),
    )
    .await;
    Ok(code)
}

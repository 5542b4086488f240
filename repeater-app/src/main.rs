//! Repeater host entry point.
//!
//! Headless: a line-oriented console on stdin drives the engine, and engine
//! observations are rendered through `tracing`.
//!
//! ## Runtime note
//!
//! Engine lifecycle calls block until device threads confirm (start) or exit
//! (stop), so commands run on `spawn_blocking`. Observation channels are
//! drained by ordinary tokio tasks.

mod commands;
mod settings;
mod state;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use repeater_core::{
    ipc::events::{EngineStatus, EngineStatusEvent, LevelEvent},
    CpalBackend, RepeaterEngine, RepeaterMode,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use commands::{Command, Flow};
use settings::{default_settings_path, load_settings, normalize_device_name};
use state::AppState;

#[derive(Debug, Parser)]
#[command(
    name = "repeater",
    about = "Threshold-triggered audio repeater",
    author,
    version
)]
struct Args {
    /// Settings file (default: $XDG_DATA_HOME/repeater/settings.json)
    #[arg(long, env = "REPEATER_SETTINGS", value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Input device name (overrides the saved choice)
    #[arg(long = "input-device", value_name = "NAME")]
    input_device: Option<String>,

    /// Output device name (overrides the saved choice)
    #[arg(long = "output-device", value_name = "NAME")]
    output_device: Option<String>,

    /// Operating mode (overrides the saved choice)
    #[arg(long, value_name = "simplex|duplex", value_parser = parse_mode)]
    mode: Option<RepeaterMode>,

    /// Read input from a 16-bit mono 44.1 kHz WAV file instead of a device
    #[arg(long = "input-wav", value_name = "PATH")]
    input_wav: Option<PathBuf>,

    /// Print audio devices and exit
    #[arg(long = "list-devices", default_value_t = false)]
    list_devices: bool,

    /// Start repeating immediately
    #[arg(long, default_value_t = false)]
    autostart: bool,
}

fn parse_mode(raw: &str) -> Result<RepeaterMode, String> {
    raw.parse().map_err(|e| format!("{e}"))
}

fn render_status(event: &EngineStatusEvent) {
    match (event.status, event.dropped_buffers) {
        (EngineStatus::Error, _) => error!(
            state = %event.state,
            detail = event.detail.as_deref().unwrap_or(""),
            "engine error"
        ),
        (_, Some(dropped)) => warn!(
            dropped,
            detail = event.detail.as_deref().unwrap_or(""),
            "playback queue overflow"
        ),
        (status, None) => info!(?status, state = %event.state, "engine status"),
    }
}

fn render_level(event: &LevelEvent) {
    debug!(
        seq = event.seq,
        level = event.level,
        raw = event.raw_level,
        state = %event.state,
        progress = event.progress,
        dead_time_remaining = event.dead_time_remaining,
        "level"
    );
}

fn spawn_forwarder<T, F>(mut rx: broadcast::Receiver<T>, name: &'static str, render: F)
where
    T: Clone + Send + 'static,
    F: Fn(&T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => render(&event),
                Err(RecvError::Lagged(n)) => {
                    warn!("{name} receiver lagged by {n} events");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Execute on a blocking thread; errors are printed and the console goes on.
async fn run_command(state: &AppState, cmd: Command) -> Flow {
    let state = state.clone();
    let result = tokio::task::spawn_blocking(move || commands::execute(&state, cmd)).await;
    match result {
        Ok(Ok(flow)) => flow,
        Ok(Err(e)) => {
            println!("error: {e:#}");
            Flow::Continue
        }
        Err(e) => {
            error!("command task failed: {e}");
            Flow::Continue
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("repeater=info")),
        )
        .init();

    let args = Args::parse();
    if args.list_devices {
        commands::print_device_list();
        return Ok(());
    }

    // ── Settings ──────────────────────────────────────────────────────────
    let settings_path = args.settings.clone().unwrap_or_else(default_settings_path);
    let mut app_settings = load_settings(&settings_path);
    if let Some(name) = args.input_device.as_deref() {
        app_settings.input_device = normalize_device_name(Some(name));
    }
    if let Some(name) = args.output_device.as_deref() {
        app_settings.output_device = normalize_device_name(Some(name));
    }
    if let Some(mode) = args.mode {
        app_settings.mode = mode;
    }
    info!(
        path = %settings_path.display(),
        mode = %app_settings.mode,
        input = app_settings.input_device.as_deref().unwrap_or("default"),
        output = app_settings.output_device.as_deref().unwrap_or("default"),
        "repeater starting"
    );

    // ── Engine ────────────────────────────────────────────────────────────
    let backend = match &args.input_wav {
        Some(path) => {
            info!(path = %path.display(), "using WAV file as input");
            CpalBackend::with_input_wav(path)
        }
        None => CpalBackend::new(),
    };
    let engine = RepeaterEngine::with_backend(app_settings.engine_config(), backend)
        .context("saved settings produced an invalid engine configuration")?;
    engine.set_devices(app_settings.devices());
    engine.switch_mode(app_settings.mode)?;

    let state = AppState::new(engine, app_settings, settings_path);
    state.persist_or_warn();

    spawn_forwarder(state.engine.subscribe_status(), "status", render_status);
    spawn_forwarder(state.engine.subscribe_levels(), "level", render_level);

    if args.autostart {
        run_command(&state, Command::Start).await;
    }
    println!("type 'help' for commands");

    // ── Console ───────────────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("stdin read failed: {e}");
                        break;
                    }
                };
                match commands::parse(&line) {
                    Ok(Some(cmd)) => {
                        if run_command(&state, cmd).await == Flow::Quit {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("error: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    // ── Shutdown ──────────────────────────────────────────────────────────
    let engine = state.engine.clone();
    tokio::task::spawn_blocking(move || {
        if engine.is_running() {
            if let Err(e) = engine.stop() {
                warn!("stop on exit failed: {e}");
            }
        }
    })
    .await
    .context("shutdown task failed")?;
    state.persist()?;
    info!("repeater exited");
    Ok(())
}

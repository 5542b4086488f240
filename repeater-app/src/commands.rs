//! Console command parsing and execution.
//!
//! One command per line. Parsing is pure; execution runs on a blocking task
//! because `start`/`stop` wait for device threads.

use std::fmt;

use repeater_core::{
    audio::device::{list_input_devices, list_output_devices, DeviceInfo},
    dsp::BAND_CENTERS_HZ,
    ConfigUpdate, DeviceSelection, RepeaterMode,
};
use tracing::info;

use crate::settings::normalize_device_name;
use crate::state::AppState;

pub const HELP: &str = "\
commands:
  start                     open devices and start repeating
  stop                      stop and release devices
  mode <simplex|duplex>     switch mode (only while stopped)
  set <key> <value>         change a parameter; keys:
                              start, stop, attack, release, record,
                              silence, dead, gain, queue
  eq <band 1-5> <db>        set one equalizer band (-12..12 dB)
  input <name|default>      choose the input device (next start)
  output <name|default>     choose the output device (next start)
  status                    show state and configuration
  devices                   list audio devices
  diag                      show counters since the last start
  help                      show this text
  quit                      stop and exit";

/// Parameter addressed by `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKey {
    StartThreshold,
    StopThreshold,
    Attack,
    Release,
    MaxRecord,
    SilenceTimeout,
    DeadTime,
    OutputGain,
    QueueCapacity,
}

impl ParamKey {
    fn parse(raw: &str) -> Option<Self> {
        let key = match raw.to_ascii_lowercase().replace('-', "_").as_str() {
            "start" | "start_threshold" => ParamKey::StartThreshold,
            "stop" | "stop_threshold" => ParamKey::StopThreshold,
            "attack" | "attack_ms" | "rise" | "rise_time" => ParamKey::Attack,
            "release" | "release_ms" | "fall" | "fall_time" => ParamKey::Release,
            "record" | "max_record" | "max_record_seconds" | "record_time" => ParamKey::MaxRecord,
            "silence" | "silence_timeout" | "stop_time" => ParamKey::SilenceTimeout,
            "dead" | "dead_time" => ParamKey::DeadTime,
            "gain" | "output_gain" | "output_gain_db" => ParamKey::OutputGain,
            "queue" | "queue_capacity" => ParamKey::QueueCapacity,
            _ => return None,
        };
        Some(key)
    }

    fn to_update(self, value: f32) -> Result<ConfigUpdate, String> {
        let mut update = ConfigUpdate::default();
        match self {
            ParamKey::StartThreshold => update.start_threshold = Some(value),
            ParamKey::StopThreshold => update.stop_threshold = Some(value),
            ParamKey::Attack => update.attack_ms = Some(value),
            ParamKey::Release => update.release_ms = Some(value),
            ParamKey::MaxRecord => update.max_record_seconds = Some(value),
            ParamKey::SilenceTimeout => update.silence_timeout_seconds = Some(value),
            ParamKey::DeadTime => update.dead_time_seconds = Some(value),
            ParamKey::OutputGain => update.output_gain_db = Some(value),
            ParamKey::QueueCapacity => {
                if value < 0.0 || value.fract() != 0.0 {
                    return Err(format!("queue capacity must be a whole number, got {value}"));
                }
                update.queue_capacity = Some(value as usize);
            }
        }
        Ok(update)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Stop,
    Mode(RepeaterMode),
    Set(ParamKey, f32),
    /// Zero-based band index.
    Eq(usize, f32),
    Input(Option<String>),
    Output(Option<String>),
    Status,
    Devices,
    Diag,
    Help,
    Quit,
}

/// What the console loop should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError(String);

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ParseError {}

fn parse_number(raw: Option<&str>, what: &str) -> Result<f32, ParseError> {
    let raw = raw.ok_or_else(|| ParseError(format!("missing {what}")))?;
    raw.parse::<f32>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ParseError(format!("'{raw}' is not a number")))
}

fn device_arg(rest: &str) -> Option<String> {
    if rest.trim().eq_ignore_ascii_case("default") {
        None
    } else {
        normalize_device_name(Some(rest))
    }
}

/// Parse one console line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    let Some(word) = line.split_whitespace().next() else {
        return Ok(None);
    };
    let rest = line[word.len()..].trim();
    let mut args = rest.split_whitespace();

    let cmd = match word.to_ascii_lowercase().as_str() {
        "start" => Command::Start,
        "stop" => Command::Stop,
        "mode" => {
            let target = args.next().ok_or_else(|| ParseError("missing mode".into()))?;
            Command::Mode(target.parse().map_err(|e| ParseError(format!("{e}")))?)
        }
        "set" => {
            let key = args.next().ok_or_else(|| ParseError("missing key".into()))?;
            let key = ParamKey::parse(key).ok_or_else(|| ParseError(format!("unknown key '{key}'")))?;
            Command::Set(key, parse_number(args.next(), "value")?)
        }
        "eq" => {
            let band = args
                .next()
                .and_then(|b| b.parse::<usize>().ok())
                .filter(|b| (1..=BAND_CENTERS_HZ.len()).contains(b))
                .ok_or_else(|| ParseError(format!("band must be 1-{}", BAND_CENTERS_HZ.len())))?;
            Command::Eq(band - 1, parse_number(args.next(), "gain")?)
        }
        "input" => Command::Input(device_arg(rest)),
        "output" => Command::Output(device_arg(rest)),
        "status" => Command::Status,
        "devices" => Command::Devices,
        "diag" => Command::Diag,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError(format!("unknown command '{other}' (try 'help')"))),
    };
    Ok(Some(cmd))
}

fn print_devices(title: &str, devices: &[DeviceInfo]) {
    println!("{title}:");
    if devices.is_empty() {
        println!("  (none)");
    }
    for d in devices {
        let mut notes = Vec::new();
        if d.is_default {
            notes.push("default".to_string());
        }
        if !d.supports_native_rate {
            notes.push(format!("no 44.1 kHz, default {} Hz", d.default_sample_rate));
        }
        if d.is_loopback_like {
            notes.push("loopback?".to_string());
        }
        let notes = if notes.is_empty() {
            String::new()
        } else {
            format!(" [{}]", notes.join(", "))
        };
        println!("  {} ({} ch){notes}", d.name, d.max_channels);
    }
}

pub fn print_device_list() {
    print_devices("input devices", &list_input_devices());
    print_devices("output devices", &list_output_devices());
}

/// Run one command against the engine. Errors are reported by the caller and
/// never end the console.
pub fn execute(state: &AppState, cmd: Command) -> anyhow::Result<Flow> {
    let engine = &state.engine;
    match cmd {
        Command::Start => {
            engine.start()?;
            println!("started ({})", engine.mode());
        }
        Command::Stop => {
            engine.stop()?;
            state.persist_or_warn();
            let diag = engine.diagnostics_snapshot();
            info!(
                recordings_started = diag.recordings_started,
                buffers_played = diag.buffers_played,
                buffers_dropped = diag.buffers_dropped,
                "engine diagnostics snapshot on stop"
            );
            println!("stopped");
        }
        Command::Mode(mode) => {
            state.switch_mode(mode)?;
            println!("mode: {mode}");
        }
        Command::Set(key, value) => {
            let update = key.to_update(value).map_err(anyhow::Error::msg)?;
            state.update_config(&update)?;
            println!("ok");
        }
        Command::Eq(band, gain_db) => {
            state.update_config(&ConfigUpdate {
                eq_band: Some((band, gain_db)),
                ..Default::default()
            })?;
            println!("eq band {} ({} Hz): {gain_db:+.1} dB", band + 1, BAND_CENTERS_HZ[band]);
        }
        Command::Input(name) => {
            let mut devices = engine.devices();
            devices.input = name;
            state.set_devices(devices);
            println!("input: {}", describe_device(engine.devices().input.as_deref()));
        }
        Command::Output(name) => {
            let mut devices = engine.devices();
            devices.output = name;
            state.set_devices(devices);
            println!("output: {}", describe_device(engine.devices().output.as_deref()));
        }
        Command::Status => {
            let DeviceSelection { input, output } = engine.devices();
            println!("status: {:?}", engine.status());
            println!("state:  {}", engine.state());
            println!("input:  {}", describe_device(input.as_deref()));
            println!("output: {}", describe_device(output.as_deref()));
            println!("{}", serde_json::to_string_pretty(&engine.config())?);
        }
        Command::Devices => print_device_list(),
        Command::Diag => {
            println!("{}", serde_json::to_string_pretty(&engine.diagnostics_snapshot())?);
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}

fn describe_device(name: Option<&str>) -> &str {
    name.unwrap_or("system default")
}

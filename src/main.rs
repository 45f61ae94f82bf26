use chroma_stream::ble::{BleSessionManager, ConnectionState, GattTransport};
use chroma_stream::config::StreamConfig;
use chroma_stream::console_display;
use chroma_stream::pattern_file::{self, GenerateOptions};
use chroma_stream::player::{AudioTap, Player, WavTrack};
use chroma_stream::preview::PreviewFrame;
#[cfg(feature = "hardware")]
use chroma_stream::serial_bridge;
use chroma_stream::simulator::{SimulatedPeripheral, SyntheticSong, SyntheticTrack};
use chroma_stream::stream::{self, StreamLoop};
use chroma_stream::types::*;
use chroma_stream::ws_server;

use clap::{Args, Parser, Subcommand};
use crossbeam_channel::{bounded, Sender};
use log::{error, info, warn};
use std::error::Error;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

#[derive(Parser)]
#[command(name = "chroma-stream")]
#[command(about = "Audio-reactive LED matrix renderer and BLE streamer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Play a track and stream rendered frames to the LED device
    Stream(StreamArgs),
    /// Render a pattern file offline
    Generate(GenerateArgs),
}

#[derive(Args)]
struct StreamArgs {
    /// WAV file to play (default: synthetic demo song)
    #[arg(long)]
    wav: Option<PathBuf>,

    /// Serial port of a BLE bridge dongle (default: simulated peripheral)
    #[arg(long)]
    port: Option<String>,

    /// Bridge baud rate
    #[arg(long, default_value_t = 921_600)]
    baud: u32,

    /// Config file; missing fields use defaults
    #[arg(long, default_value = "chroma-stream.json")]
    config: PathBuf,

    /// Write the effective config back to --config
    #[arg(long)]
    save_config: bool,

    #[arg(long)]
    rows: Option<usize>,

    #[arg(long)]
    cols: Option<usize>,

    /// Device frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// Device brightness factor 0.0–1.0
    #[arg(long)]
    brightness: Option<f32>,

    /// "auto" or a pattern name
    #[arg(long)]
    pattern: Option<String>,

    /// off, auto or manual
    #[arg(long)]
    strobe: Option<StrobeMode>,

    /// Manual strobe frequency (Hz)
    #[arg(long)]
    strobe_hz: Option<f32>,

    /// Only connect to devices whose name starts with this
    #[arg(long)]
    device_prefix: Option<String>,

    /// Terminal preview of the matrix
    #[arg(long)]
    console: bool,

    /// Console redraw rate (Hz)
    #[arg(long, default_value_t = 15)]
    display_hz: u32,

    /// Browser preview over HTTP + WebSocket
    #[arg(long)]
    ws: bool,

    #[arg(long, default_value = "127.0.0.1:8080")]
    ws_addr: String,

    /// WebSocket broadcast rate (Hz)
    #[arg(long, default_value_t = 30)]
    ws_fps: u32,

    /// Wait for a "play" command instead of starting immediately
    #[arg(long)]
    paused: bool,
}

#[derive(Args)]
struct GenerateArgs {
    /// WAV file to analyse (default: silent timeline of --duration)
    #[arg(long)]
    wav: Option<PathBuf>,

    /// Output JSON path
    #[arg(long, short, default_value = "patterns.json")]
    output: PathBuf,

    #[arg(long, default_value_t = 8)]
    rows: usize,

    #[arg(long, default_value_t = 8)]
    cols: usize,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Seconds, when no WAV is given
    #[arg(long, default_value_t = 30.0)]
    duration: f64,

    #[arg(long, default_value_t = 128)]
    fft_size: usize,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    match Cli::parse().command {
        Command::Stream(args) => run_stream(args),
        Command::Generate(args) => run_generate(args),
    }
}

fn run_generate(args: GenerateArgs) -> Result<(), Box<dyn Error>> {
    let track = match &args.wav {
        Some(path) => Some(WavTrack::open(path)?),
        None => None,
    };
    let opts = GenerateOptions {
        geometry: chroma_stream::frame::MatrixGeometry::new(args.rows, args.cols)?,
        fps: args.fps,
        duration: args.duration,
        fft_size: args.fft_size,
    };
    let file = pattern_file::generate(&opts, track.as_ref())?;
    file.save(&args.output)?;
    Ok(())
}

fn apply_overrides(config: &mut StreamConfig, args: &StreamArgs) -> Result<(), String> {
    if let Some(v) = args.rows {
        config.rows = v;
    }
    if let Some(v) = args.cols {
        config.cols = v;
    }
    if let Some(v) = args.fps {
        config.target_fps = v;
    }
    if let Some(v) = args.brightness {
        config.brightness = v;
    }
    if let Some(p) = &args.pattern {
        config.pattern = if p.eq_ignore_ascii_case("auto") {
            PatternMode::Auto
        } else {
            PatternMode::Fixed(p.parse()?)
        };
    }
    if let Some(v) = args.strobe {
        config.strobe_mode = v;
    }
    if let Some(v) = args.strobe_hz {
        config.manual_strobe_hz = v;
    }
    if let Some(v) = &args.device_prefix {
        config.device_name_prefix = Some(v.clone());
    }
    Ok(())
}

fn run_stream(args: StreamArgs) -> Result<(), Box<dyn Error>> {
    let mut config = StreamConfig::load(&args.config).unwrap_or_default();
    apply_overrides(&mut config, &args)?;
    config.geometry()?;
    if args.save_config {
        config.save(&args.config)?;
    }

    info!("═══════════════════════════════════════════════");
    info!("  CHROMA STREAM v{}", env!("CARGO_PKG_VERSION"));
    info!("  Matrix: {}x{} @ {} fps", config.rows, config.cols, config.target_fps);
    info!(
        "  Audio: {}",
        args.wav
            .as_ref()
            .map_or("synthetic demo".to_string(), |p| p.display().to_string())
    );
    info!(
        "  Device: {}",
        args.port.as_deref().unwrap_or("simulated peripheral")
    );
    if args.ws {
        info!("  UI: WebSocket on {}", args.ws_addr);
    }
    if args.console {
        info!("  UI: Console");
    }
    info!("═══════════════════════════════════════════════");

    if let Some(port) = &args.port {
        #[cfg(feature = "hardware")]
        {
            let bridge = serial_bridge::open_port(port, args.baud)?;
            return with_player(bridge, &config, &args);
        }
        #[cfg(not(feature = "hardware"))]
        {
            error!(
                "Bridge port {} (baud {}) requires the 'hardware' feature. Falling back to simulator.",
                port, args.baud
            );
        }
    }
    with_player(SimulatedPeripheral::new("ChromaMind LED"), &config, &args)
}

fn with_player<T: GattTransport + 'static>(
    transport: T,
    config: &StreamConfig,
    args: &StreamArgs,
) -> Result<(), Box<dyn Error>> {
    match &args.wav {
        Some(path) => {
            let track = WavTrack::open(path)?;
            launch(transport, track, config, args)
        }
        None => launch(
            transport,
            SyntheticTrack::new(SyntheticSong::default()),
            config,
            args,
        ),
    }
}

/// Open (or reopen) the device session and apply the configured
/// device-side brightness.
fn connect_device<T: GattTransport>(
    ble: &BleSessionManager<T>,
    config: &StreamConfig,
) -> Result<(), chroma_stream::ble::BleError> {
    let device = ble.connect(config.device_name_prefix.as_deref())?;
    if let Some(level) = config.device_brightness {
        ble.send_brightness(level);
        info!("Device brightness set to {} on {}", level, device.name);
    }
    Ok(())
}

fn launch<T, P>(
    transport: T,
    player: P,
    config: &StreamConfig,
    args: &StreamArgs,
) -> Result<(), Box<dyn Error>>
where
    T: GattTransport + 'static,
    P: Player + AudioTap + Send + 'static,
{
    info!("Track: {:.1}s @ {} Hz", player.duration(), player.sample_rate());

    let ble = Arc::new(BleSessionManager::new(transport));
    let watch = ble.watch();
    thread::Builder::new()
        .name("ble-watch".into())
        .spawn(move || {
            for state in watch.iter() {
                if state == ConnectionState::Disconnected {
                    warn!("BLE link down; frames are skipped. Type 'connect' to reconnect");
                }
            }
        })?;

    if let Err(e) = connect_device(&ble, config) {
        warn!("Continuing without a device: {}", e);
    }

    // ─── Preview consumers ──────────────────────────────────────────
    let mut preview_txs: Vec<Sender<PreviewFrame>> = Vec::new();

    if args.console {
        let (tx, rx) = bounded::<PreviewFrame>(8);
        preview_txs.push(tx);
        let hz = args.display_hz;
        let source_fps = config.target_fps;
        thread::Builder::new()
            .name("display".into())
            .spawn(move || console_display::ConsoleDisplay::new(rx, hz, source_fps).run())?;
    }

    if args.ws {
        let (tx, rx) = bounded::<PreviewFrame>(8);
        preview_txs.push(tx);
        let addr = args.ws_addr.clone();
        // Previews never arrive faster than the loop renders
        let fps = args.ws_fps.min(config.target_fps).max(1);
        let page = std::env::current_dir()
            .unwrap_or_default()
            .join("preview.html");
        thread::Builder::new().name("ws-server".into()).spawn(move || {
            if let Err(e) = ws_server::WsServer::new(rx, addr, fps, page).run() {
                error!("Preview server stopped: {}", e);
            }
        })?;
    }

    let mut stream_loop = StreamLoop::new(config, Arc::clone(&ble))?;
    if !preview_txs.is_empty() {
        let (tx, rx) = bounded::<PreviewFrame>(8);
        stream_loop = stream_loop.with_preview(tx);
        thread::Builder::new()
            .name("preview-fanout".into())
            .spawn(move || {
                for frame in rx.iter() {
                    for out in &preview_txs {
                        let _ = out.try_send(frame.clone());
                    }
                }
            })?;
    }

    let handle = stream::spawn(stream_loop, player, !args.paused)?;

    // ─── Interactive control on stdin ───────────────────────────────
    let control = handle.controller();
    let link = Arc::clone(&ble);
    let link_config = config.clone();
    thread::Builder::new()
        .name("control".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<ConsoleCommand>() {
                    Ok(ConsoleCommand::Control(event)) => {
                        let stop = event == ControlEvent::Stop;
                        if control.send(event).is_err() || stop {
                            break;
                        }
                    }
                    Ok(ConsoleCommand::Connect) => {
                        let link = Arc::clone(&link);
                        let cfg = link_config.clone();
                        // Handshake may wait on the chooser; keep reading stdin
                        let spawned = thread::Builder::new()
                            .name("ble-connect".into())
                            .spawn(move || {
                                if let Err(e) = connect_device(&link, &cfg) {
                                    warn!("Reconnect failed: {}", e);
                                }
                            });
                        if let Err(e) = spawned {
                            error!("Could not start reconnect: {}", e);
                        }
                    }
                    Ok(ConsoleCommand::Disconnect) => link.disconnect(),
                    Err(e) => warn!("{}", e),
                }
            }
        })?;

    info!("Streaming. Commands: play, pause, seek <s>, pattern <name|auto>, brightness <0-1>, strobe <mode>, hz <f>, connect, disconnect, stop");
    handle.wait();

    let stats = ble.stats();
    ble.disconnect();
    info!(
        "Done: {} frames, {} commands, {} write errors, {} skipped",
        stats.frames_sent, stats.commands_sent, stats.write_errors, stats.skipped
    );
    Ok(())
}

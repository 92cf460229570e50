//! Sonar - live acoustic sonar from the command line
//!
//! Emits chirps on the output device, images the echoes captured by a
//! stereo input, and prints a one-line status while running.

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use sonar::audio::device::{list_devices, CpalDuplex};
use sonar::controller::FrameSnapshot;
use sonar::dsp::geometry::EchoGeometry;
use sonar::dsp::histogram::HistogramFilter;
use sonar::dsp::post::{
    AmplificationFilter, AverageFilter, LeadingEdgeFilter, MeanPeakDetector, MonoFilter,
    SharpenFilter, SmoothenFilter,
};
use sonar::dsp::sonogram::SonogramGeometry;
use sonar::recording::{ReplaySource, StreamReader, StreamWriter};
use sonar::{FilterChain, Rect, Sonar, SonarConfig, SonarController, SonarView};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Options collected from the command line
#[derive(Debug, Default)]
struct Options {
    device: Option<String>,
    config: Option<PathBuf>,
    record: Option<PathBuf>,
    replay: Option<PathBuf>,
    histogram: bool,
    post: Option<String>,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sonar=info".parse()?)
                .add_directive("sonar_core=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let mut options = Options::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--list" | "-l" => {
                print_devices();
                return Ok(());
            }
            "--version" | "-v" => {
                println!("sonar {}", sonar::VERSION);
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "--histogram" => options.histogram = true,
            flag @ ("--device" | "-d" | "--config" | "-c" | "--record" | "--replay"
            | "--post") => {
                let Some(value) = args.get(i + 1) else {
                    eprintln!("Error: {} requires a value", flag);
                    return Ok(());
                };
                match flag {
                    "--device" | "-d" => options.device = Some(value.clone()),
                    "--config" | "-c" => options.config = Some(PathBuf::from(value)),
                    "--record" => options.record = Some(PathBuf::from(value)),
                    "--post" => options.post = Some(value.clone()),
                    _ => options.replay = Some(PathBuf::from(value)),
                }
                i += 2;
                continue;
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(());
            }
        }
        i += 1;
    }

    run(options)
}

fn print_help() {
    println!("Usage: sonar [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -l, --list              List available audio devices");
    println!("  -d, --device NAME       Use the named device for capture and playback");
    println!("  -c, --config PATH       Load settings from a JSON file");
    println!("      --record PATH       Record captured windows to a file");
    println!("      --replay PATH       Process a recording instead of live audio");
    println!("      --histogram         Show a 1-D range profile instead of the sonogram");
    println!("      --post LIST         Post filters, comma separated (default: average)");
    println!("                          smoothen, amplify, mono, average, edge, peaks, sharpen, none");
    println!("  -v, --version           Show version");
    println!("  -h, --help              Show this help");
    println!();
    println!("Examples:");
    println!("  sonar -d \"USB Audio\" --record session.sonar");
    println!("  sonar --replay session.sonar --histogram");
    println!("  sonar --post edge,peaks,average");
}

fn print_devices() {
    println!("Scanning for audio devices...");
    println!();

    match list_devices() {
        Ok(devices) => {
            println!("Found {} device(s):", devices.len());
            println!();
            for (i, device) in devices.iter().enumerate() {
                let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
                println!("  {}. {}{}", i + 1, device.name, default_marker);
                println!(
                    "     Channels: {} in, {} out",
                    device.input_channels, device.output_channels
                );
                if !device.sample_rates.is_empty() {
                    println!("     Sample rates: {:?}", device.sample_rates);
                }
                println!();
            }
        }
        Err(e) => {
            error!("Failed to list devices: {}", e);
            println!("Error: {}", e);
        }
    }
}

fn run(options: Options) -> Result<()> {
    let mut config = match &options.config {
        Some(path) => SonarConfig::load(path),
        None => SonarConfig::default(),
    };
    if options.device.is_some() {
        config.device = options.device.clone();
    }

    let canvas = if options.histogram {
        Rect::sized(config.canvas_width, 1)
    } else {
        Rect::sized(config.canvas_width, config.canvas_height)
    };
    let (view, snapshots) = SonarView::new(canvas, 4);
    let view = Arc::new(view);
    let mut sonar = Sonar::new(config.clone(), Arc::clone(&view) as Arc<dyn SonarController>)?;

    let reducer = if options.histogram {
        FilterChain::new().with(HistogramFilter::new(0, config.speed_of_sound))
    } else {
        sonar.default_filter()
    };
    let processing = with_post_filters(reducer, options.post.as_deref().unwrap_or("average"))?;

    let writer = match (&options.record, &options.replay) {
        (Some(path), None) => Some(Arc::new(
            StreamWriter::create(path)
                .with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        (Some(_), Some(_)) => {
            eprintln!("Error: --record and --replay cannot be combined");
            return Ok(());
        }
        _ => None,
    };
    let chain = match &writer {
        Some(writer) => FilterChain::new()
            .with_shared(Arc::clone(writer) as Arc<dyn sonar::SignalFilter>)
            .with(processing),
        None => processing,
    };
    sonar.set_filter(chain);

    // Streams must outlive the loops
    let mut duplex = None;
    match &options.replay {
        Some(path) => {
            let reader = StreamReader::open_path(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            println!("Replaying: {}", path.display());
            sonar.start_replay(ReplaySource::new(reader, config.pulse_interval()))?;
        }
        None => {
            let device = config.device.as_deref();
            let (streams, input, output) = CpalDuplex::open(
                device,
                device,
                config.sample_rate,
                config.ring_frames(),
            )?;
            println!("Device: {}", device.unwrap_or("default"));
            duplex = Some(streams);
            sonar.start(input, output)?;
        }
    }

    println!("Sonar running. Press Ctrl+C to stop.");
    println!();
    println!("Status:");
    println!("────────────────────────────────────────");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    let mut last_status = String::new();
    while running.load(Ordering::SeqCst) && sonar.is_running() {
        if let Some(snapshot) = latest(&snapshots) {
            let status_line = status_line(&sonar, &view, &snapshot);
            if status_line != last_status {
                println!("{}", status_line);
                last_status = status_line;
            }
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    println!();
    println!("Stopping...");
    let result = sonar.stop();
    drop(duplex);
    if let Some(writer) = writer {
        writer.close()?;
    }
    let stats = result?;
    info!(
        windows = stats.windows,
        pulses = stats.pulses,
        discarded = stats.discarded,
        "Session finished"
    );
    println!("Done.");

    Ok(())
}

/// Append the named post filters, in order
fn with_post_filters(mut chain: FilterChain, list: &str) -> Result<FilterChain> {
    for name in list.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        chain = match name {
            "none" => chain,
            "smoothen" => chain.with(SmoothenFilter::default()),
            "amplify" => chain.with(AmplificationFilter::default()),
            "mono" => chain.with(MonoFilter::default()),
            "average" => chain.with(AverageFilter::new()),
            "edge" => chain.with(LeadingEdgeFilter::default()),
            "peaks" => chain.with(MeanPeakDetector),
            "sharpen" => chain.with(SharpenFilter::default()),
            other => anyhow::bail!("Unknown post filter: {}", other),
        };
    }
    Ok(chain)
}

/// Drain the channel, keeping only the newest snapshot
fn latest(snapshots: &Receiver<FrameSnapshot>) -> Option<FrameSnapshot> {
    snapshots.try_iter().last()
}

fn status_line(sonar: &Sonar, view: &SonarView, snapshot: &FrameSnapshot) -> String {
    let echo = match snapshot.peak() {
        Some((index, value)) if value > 0.0 => {
            format!("{:>6.2}m", strongest_range(sonar, snapshot, index))
        }
        _ => "     -".to_string(),
    };
    let phase = sonar
        .sync_phase()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "off".to_string());
    format!(
        "Frames: {:>7} | {:>5.1} fps | Max: {:>10.1} | Echo: {} | Sync: {:<10} | Baseline: {:.3}m | Dropped: {}",
        view.received(),
        sonar.framerate().unwrap_or(0.0),
        snapshot.max_value,
        echo,
        phase,
        sonar.baseline(),
        sonar.discarded() + view.dropped()
    )
}

/// Distance of the strongest output cell from microphone A
fn strongest_range(sonar: &Sonar, snapshot: &FrameSnapshot, index: usize) -> f32 {
    let echo = EchoGeometry::new(snapshot.sample_rate, sonar.config().speed_of_sound);
    let width = snapshot.canvas.width().max(1) as usize;

    if snapshot.canvas.height() <= 1 {
        // Histogram bins split the window's horizontal extent
        let left = echo.distance((snapshot.window.left - snapshot.resolution.left) as f32 / 2.0);
        let right =
            echo.distance((snapshot.window.right - snapshot.resolution.left) as f32 / 2.0);
        let step = (right - left) / width as f32;
        return left + (index as f32 + 0.5) * step;
    }

    SonogramGeometry::new(
        echo,
        snapshot.window,
        snapshot.canvas,
        snapshot.resolution,
        sonar.baseline(),
    )
    .range(index % width, index / width)
}

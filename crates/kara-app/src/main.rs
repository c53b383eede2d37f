//! kara - karaoke playback and recording
//!
//! Main application entry point.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use kara_audio::source::{self, AudioResource};
use kara_audio::{
    CaptureController, CompressedPacketBuffer, CpalDevice, DesktopSession, DeviceRole,
    EffectSpec, EngineConfig, PlaybackController, SessionCoordinator, WavFileSink,
};
use kara_audio::persist::FrameSink;
use kara_core::AudioFormat;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Control-thread tick period
const TICK: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "kara", version)]
#[command(about = "Karaoke playback and recording with live effects", long_about = None)]
struct Cli {
    /// Engine configuration file (.ron)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Play an audio file in a loop through an effect
    Play {
        file: PathBuf,

        /// Effect, e.g. `none`, `delay:0.5`, `reverb:cathedral`, `eq`
        #[arg(short, long)]
        effect: Option<EffectSpec>,

        /// How long to play (defaults to one pass through the file)
        #[arg(short, long)]
        seconds: Option<f32>,

        /// Output volume
        #[arg(long, default_value_t = 1.0)]
        volume: f32,
    },

    /// Record the microphone through an effect into a WAV file
    Record {
        output: PathBuf,

        #[arg(short, long)]
        effect: Option<EffectSpec>,

        /// Also produce lossless 24-bit packets
        #[arg(long)]
        compress: bool,

        /// Directory receiving the packet buffers as numbered .flac files
        #[arg(long, requires = "compress")]
        packets: Option<PathBuf>,

        #[arg(short, long, default_value_t = 10.0)]
        seconds: f32,

        /// Start with the microphone muted
        #[arg(long)]
        mute: bool,

        /// Backing track mixed into the recording
        #[arg(long)]
        backing: Option<PathBuf>,

        /// Send the mix to the speakers at this gain
        #[arg(long)]
        monitor: Option<f32>,
    },

    /// Write a sine test tone
    Tone {
        output: PathBuf,

        #[arg(short, long, default_value_t = 440.0)]
        frequency: f32,

        #[arg(short, long, default_value_t = 5.0)]
        seconds: f32,

        #[arg(short, long, default_value_t = 48000)]
        rate: u32,

        #[arg(short, long, default_value_t = 0.5)]
        amplitude: f32,
    },

    /// List the selectable effects
    Effects,

    /// Write the default configuration
    InitConfig { output: PathBuf },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kara=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    match cli.command {
        Command::Play {
            file,
            effect,
            seconds,
            volume,
        } => play(&config, file, effect.unwrap_or(config.default_effect), seconds, volume),
        Command::Record {
            output,
            effect,
            compress,
            packets,
            seconds,
            mute,
            backing,
            monitor,
        } => record(
            &config,
            &RecordArgs {
                output,
                effect: effect.unwrap_or(config.default_effect),
                compress,
                packets,
                seconds,
                mute,
                backing,
                monitor,
            },
        ),
        Command::Tone {
            output,
            frequency,
            seconds,
            rate,
            amplitude,
        } => tone(&output, frequency, seconds, rate, amplitude),
        Command::Effects => {
            for effect in EffectSpec::catalog() {
                println!("{effect}");
            }
            Ok(())
        }
        Command::InitConfig { output } => {
            EngineConfig::default()
                .save(&output)
                .with_context(|| format!("Failed to write {}", output.display()))?;
            println!("Wrote {}", output.display());
            Ok(())
        }
    }
}

/// Tick the coordinator until `duration` has elapsed.
fn run_for(
    coordinator: &mut SessionCoordinator,
    duration: Duration,
    mut each_tick: impl FnMut(&mut SessionCoordinator) -> Result<()>,
) -> Result<()> {
    let started = Instant::now();
    while started.elapsed() < duration {
        coordinator.tick(Instant::now());
        each_tick(coordinator)?;
        std::thread::sleep(TICK);
    }
    Ok(())
}

fn play(
    config: &EngineConfig,
    file: PathBuf,
    effect: EffectSpec,
    seconds: Option<f32>,
    volume: f32,
) -> Result<()> {
    let mut coordinator = SessionCoordinator::new(DesktopSession::shared(), config);
    let device = CpalDevice::new(DeviceRole::Playback, Some(config.block_size))
        .context("No playback device")?
        .with_signals(coordinator.signal_sender());
    coordinator.set_playback(PlaybackController::new(Box::new(device), config));

    let Some(playback) = coordinator.playback_mut() else {
        bail!("playback controller missing");
    };
    playback.set_volume(volume);
    playback
        .play(AudioResource::File(file.clone()), effect)
        .with_context(|| format!("Failed to play {}", file.display()))?;
    let duration = seconds.map_or_else(|| playback.duration_secs(), f64::from);
    tracing::info!("Playing {} for {:.1}s ({})", file.display(), duration, effect);

    run_for(&mut coordinator, Duration::from_secs_f64(duration.max(0.0)), |_| Ok(()))?;

    if let Some(playback) = coordinator.playback_mut() {
        tracing::info!("Stopped at frame {}", playback.position());
        playback.stop();
    }
    Ok(())
}

struct RecordArgs {
    output: PathBuf,
    effect: EffectSpec,
    compress: bool,
    packets: Option<PathBuf>,
    seconds: f32,
    mute: bool,
    backing: Option<PathBuf>,
    monitor: Option<f32>,
}

fn record(config: &EngineConfig, args: &RecordArgs) -> Result<()> {
    if let Some(dir) = &args.packets {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create packet directory {}", dir.display()))?;
    }

    let mut coordinator = SessionCoordinator::new(DesktopSession::shared(), config);
    let monitor = args.monitor.unwrap_or(config.monitor_gain) > 0.0;
    let device = CpalDevice::new(DeviceRole::Capture { monitor }, Some(config.block_size))
        .context("No capture device")?
        .with_signals(coordinator.signal_sender());
    let mut capture = CaptureController::new(Box::new(device), config);

    if let Some(gain) = args.monitor {
        capture.set_monitor_gain(gain);
    }
    if let Some(path) = &args.backing {
        let buffer = source::decode_file(path)
            .with_context(|| format!("Failed to load backing track {}", path.display()))?;
        capture.set_backing_track(Some(buffer))?;
    }
    capture.switch_muted(args.mute);
    let packets = capture.packets();
    capture.change_effect(args.effect)?;
    capture
        .start(args.output.clone(), args.compress)
        .with_context(|| format!("Failed to start recording to {}", args.output.display()))?;
    coordinator.set_capture(capture);

    let mut written = 0;
    run_for(
        &mut coordinator,
        Duration::from_secs_f32(args.seconds.max(0.0)),
        |coordinator| {
            if let Some(capture) = coordinator.capture_mut() {
                let level = capture.output_level();
                tracing::trace!("Level: peak {:.3}, rms {:.3}", level.peak, level.rms);
            }
            for buffer in packets.try_iter() {
                written += write_packets(args.packets.as_deref(), &buffer, written)?;
            }
            Ok(())
        },
    )?;

    let report = coordinator
        .capture_mut()
        .and_then(CaptureController::stop)
        .unwrap_or_default();
    for buffer in packets.try_iter() {
        written += write_packets(args.packets.as_deref(), &buffer, written)?;
    }

    println!(
        "Recorded {} frames to {} ({} write errors, {} dropped tap buffers)",
        report.frames_written,
        args.output.display(),
        report.write_errors,
        report.dropped_tap_buffers
    );
    if args.compress {
        println!(
            "Produced {} packets in {} buffers",
            report.packets_produced, written
        );
    }
    Ok(())
}

/// Store one packet buffer as `packets-NNNNN.flac`. Returns how many files
/// were written.
fn write_packets(dir: Option<&Path>, buffer: &CompressedPacketBuffer, index: usize) -> Result<usize> {
    let Some(dir) = dir else {
        return Ok(1);
    };
    let path = dir.join(format!("packets-{index:05}.flac"));
    std::fs::write(&path, &buffer.bytes)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::debug!(
        "Wrote {} ({} packets, generation {})",
        path.display(),
        buffer.packet_count,
        buffer.generation
    );
    Ok(1)
}

fn tone(output: &Path, frequency: f32, seconds: f32, rate: u32, amplitude: f32) -> Result<()> {
    let format = AudioFormat::float32(rate, 1);
    let buffer = source::sine_wave(frequency, seconds, amplitude, format);
    let mut sink = WavFileSink::create(output, format)
        .with_context(|| format!("Failed to create {}", output.display()))?;
    sink.write(&buffer, 0).context("Failed to write tone")?;
    sink.finalize().context("Failed to finalize tone")?;
    println!(
        "Wrote {} frames of {frequency:.1} Hz to {}",
        buffer.frame_count(),
        output.display()
    );
    Ok(())
}

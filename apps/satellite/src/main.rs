//! Outpost Satellite - standalone voice satellite daemon.
//!
//! Connects local transducer services (mic, speaker, wake word, LEDs) to a
//! remote Wyoming voice pipeline server. The streaming mode is implicit:
//! a wake service enables wake-gated streaming, `--vad` enables
//! speech-gated streaming, otherwise all audio streams while the server
//! keeps the satellite running.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Map, Value};
use tokio::signal;
use tokio_util::sync::CancellationToken;

use outpost_core::utils::{mac_address_hex, split_command};
use outpost_core::{
    EventSettings, Listener, MicSettings, Satellite, SatelliteSettings, SndSettings, VadSettings,
    WakeSettings, WakeWordBinding, ZeroconfAdvertiser,
};

/// Outpost Satellite - remote voice control over the Wyoming protocol.
#[derive(Parser, Debug)]
#[command(name = "outpost-satellite")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URI to listen for server connections on (tcp:// or unix://).
    #[arg(long, required = true, env = "OUTPOST_URI")]
    uri: String,

    /// Name of the satellite.
    #[arg(long, default_value = "Outpost Satellite", env = "OUTPOST_NAME")]
    name: String,

    /// Area name of the satellite (e.g. kitchen).
    #[arg(long)]
    area: Option<String>,

    /// Name of the server pipeline to run for detected wake words without
    /// an explicit binding.
    #[arg(long)]
    pipeline: Option<String>,

    // ── Microphone ──────────────────────────────────────────────────────
    /// URI of the microphone service.
    #[arg(long)]
    mic_uri: Option<String>,

    /// Program to run for microphone input (raw PCM on stdout).
    #[arg(long)]
    mic_command: Option<String>,

    /// Sample rate of the mic command audio (hertz).
    #[arg(long, default_value_t = 16_000)]
    mic_command_rate: u32,

    /// Sample width of the mic command audio (bytes).
    #[arg(long, default_value_t = 2)]
    mic_command_width: u16,

    /// Channels of the mic command audio.
    #[arg(long, default_value_t = 1)]
    mic_command_channels: u16,

    /// Samples per chunk of the mic command audio.
    #[arg(long, default_value_t = 1024)]
    mic_command_samples_per_chunk: usize,

    /// Multiplier applied to mic samples (1.0 = no change).
    #[arg(long, default_value_t = 1.0)]
    mic_volume_multiplier: f32,

    /// Noise suppression level (0 = disabled, 4 = max).
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u32).range(0..=4))]
    mic_noise_suppression: u32,

    /// Auto gain target (0 = disabled, 31 = max).
    #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u32).range(0..=31))]
    mic_auto_gain: u32,

    /// Use only this channel from a multi-channel microphone.
    #[arg(long)]
    mic_channel_index: Option<u16>,

    /// Don't mute the microphone while the awake cue plays.
    #[arg(long)]
    mic_no_mute_during_awake_wav: bool,

    /// Seconds to keep the microphone muted after the awake cue.
    #[arg(long, default_value_t = 0.5)]
    mic_seconds_to_mute_after_awake_wav: f64,

    // ── Sound ───────────────────────────────────────────────────────────
    /// URI of the sound service.
    #[arg(long)]
    snd_uri: Option<String>,

    /// Program to run for sound output (raw PCM on stdin).
    #[arg(long)]
    snd_command: Option<String>,

    /// Sample rate of the snd command audio (hertz).
    #[arg(long, default_value_t = 22_050)]
    snd_command_rate: u32,

    /// Sample width of the snd command audio (bytes).
    #[arg(long, default_value_t = 2)]
    snd_command_width: u16,

    /// Channels of the snd command audio.
    #[arg(long, default_value_t = 1)]
    snd_command_channels: u16,

    /// Samples per chunk of the snd command audio.
    #[arg(long, default_value_t = 1024)]
    snd_command_samples_per_chunk: usize,

    /// Multiplier applied to output samples (1.0 = no change).
    #[arg(long, default_value_t = 1.0)]
    snd_volume_multiplier: f32,

    /// Release the sound device after each audio stop.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    snd_disconnect_after_stop: bool,

    /// WAV played when a wake word is detected.
    #[arg(long)]
    awake_wav: Option<PathBuf>,

    /// WAV played when a transcript is received.
    #[arg(long)]
    done_wav: Option<PathBuf>,

    /// WAV played when a timer finishes.
    #[arg(long)]
    timer_finished_wav: Option<PathBuf>,

    /// Repeat the timer finished WAV: <repeat> <delay-seconds>.
    #[arg(long, num_args = 2, value_names = ["REPEAT", "DELAY"])]
    timer_finished_wav_repeat: Option<Vec<f64>>,

    // ── Wake word ───────────────────────────────────────────────────────
    /// URI of the wake word detection service.
    #[arg(long)]
    wake_uri: Option<String>,

    /// Program to run for wake word detection.
    #[arg(long)]
    wake_command: Option<String>,

    /// Sample rate of the wake command audio (hertz).
    #[arg(long, default_value_t = 16_000)]
    wake_command_rate: u32,

    /// Sample width of the wake command audio (bytes).
    #[arg(long, default_value_t = 2)]
    wake_command_width: u16,

    /// Channels of the wake command audio.
    #[arg(long, default_value_t = 1)]
    wake_command_channels: u16,

    /// Wake word to listen for, with an optional pipeline name:
    /// <name> [pipeline]. May be repeated.
    #[arg(long, num_args = 1..=2, value_names = ["NAME", "PIPELINE"], action = clap::ArgAction::Append)]
    wake_word_name: Vec<Vec<String>>,

    /// Seconds before the same wake word may trigger again (0 disables).
    #[arg(long, default_value_t = 5.0)]
    wake_refractory_seconds: f64,

    // ── Voice activity detection ────────────────────────────────────────
    /// Wait for speech before streaming audio.
    #[arg(long)]
    vad: bool,

    /// Speech probability threshold (0-1).
    #[arg(long, default_value_t = 0.5)]
    vad_threshold: f32,

    /// Number of speech frames before streaming starts.
    #[arg(long, default_value_t = 1)]
    vad_trigger_level: u32,

    /// Seconds of audio to buffer before speech is detected.
    #[arg(long, default_value_t = 2.0)]
    vad_buffer_seconds: f64,

    /// Seconds to wait for a wake word before stopping the stream.
    #[arg(long, default_value_t = 5.0)]
    vad_wake_word_timeout: f64,

    // ── Events ──────────────────────────────────────────────────────────
    /// URI of a service to forward satellite events to.
    #[arg(long)]
    event_uri: Option<String>,

    /// Command run when the satellite starts.
    #[arg(long)]
    startup_command: Option<String>,

    /// Command run when audio streaming starts.
    #[arg(long)]
    streaming_start_command: Option<String>,

    /// Command run when audio streaming stops.
    #[arg(long)]
    streaming_stop_command: Option<String>,

    /// Command run when wake word detection starts.
    #[arg(long)]
    detect_command: Option<String>,

    /// Command run when a wake word is detected (name on stdin).
    #[arg(long)]
    detection_command: Option<String>,

    /// Command run when TTS playback finishes.
    #[arg(long)]
    played_command: Option<String>,

    /// Command run when a transcript arrives (text on stdin).
    #[arg(long)]
    transcript_command: Option<String>,

    /// Command run when the user starts speaking.
    #[arg(long)]
    stt_start_command: Option<String>,

    /// Command run when the user stops speaking.
    #[arg(long)]
    stt_stop_command: Option<String>,

    /// Command run when text-to-speech starts (text on stdin).
    #[arg(long)]
    synthesize_command: Option<String>,

    /// Command run when TTS audio starts.
    #[arg(long)]
    tts_start_command: Option<String>,

    /// Command run when TTS audio stops.
    #[arg(long)]
    tts_stop_command: Option<String>,

    /// Command run on a server error (message on stdin).
    #[arg(long)]
    error_command: Option<String>,

    /// Command run when a server connects.
    #[arg(long)]
    connected_command: Option<String>,

    /// Command run when the server disconnects.
    #[arg(long)]
    disconnected_command: Option<String>,

    /// Command run when a timer starts (timer JSON on stdin).
    #[arg(long)]
    timer_started_command: Option<String>,

    /// Command run when a timer updates (timer JSON on stdin).
    #[arg(long)]
    timer_updated_command: Option<String>,

    /// Command run when a timer is cancelled (timer JSON on stdin).
    #[arg(long)]
    timer_cancelled_command: Option<String>,

    /// Command run when a timer finishes (timer JSON on stdin).
    #[arg(long)]
    timer_finished_command: Option<String>,

    // ── Satellite ───────────────────────────────────────────────────────
    /// Disable discovery over zeroconf.
    #[arg(long)]
    no_zeroconf: bool,

    /// Name used for zeroconf discovery (default: MAC address).
    #[arg(long)]
    zeroconf_name: Option<String>,

    /// Host address advertised over zeroconf (default: auto-detect).
    #[arg(long)]
    zeroconf_host: Option<String>,

    /// Seconds to wait before restarting after an internal error.
    #[arg(long, default_value_t = 5.0)]
    restart_timeout: f64,

    /// Directory to write wake/stt debug WAV recordings to.
    #[arg(long)]
    debug_recording_dir: Option<PathBuf>,

    /// Log DEBUG messages.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(if args.debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .format_timestamp_millis()
        .init();

    log::info!("Outpost Satellite v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("{:?}", args);

    let settings = build_settings(&args);
    validate(&args, &settings)?;

    let info = satellite_info(&args, &settings);
    let satellite = Satellite::new(settings, info).context("Failed to create satellite")?;
    log::info!("Streaming mode: {:?}", satellite.mode());

    // Bind the server listener before anything else so argument problems
    // surface immediately.
    let listener = Listener::bind(&args.uri)
        .await
        .with_context(|| format!("Failed to bind {}", args.uri))?;

    // Zeroconf requires a TCP listener.
    let advertiser = match (args.no_zeroconf, listener.tcp_port()) {
        (false, Some(port)) => {
            let name = args
                .zeroconf_name
                .clone()
                .unwrap_or_else(mac_address_hex);
            match ZeroconfAdvertiser::new(&name, args.zeroconf_host.as_deref(), port) {
                Ok(advertiser) => Some(advertiser),
                Err(err) => {
                    log::warn!("Zeroconf registration failed: {}", err);
                    None
                }
            }
        }
        _ => None,
    };

    let mut handle = satellite.handle();
    let listener_cancel = CancellationToken::new();
    tokio::spawn(listener.run(handle.commands(), listener_cancel.child_token()));
    log::info!("Ready (listening on {})", args.uri);

    let run_task = tokio::spawn(satellite.run());

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    handle.stop().await;
    listener_cancel.cancel();
    if let Some(advertiser) = advertiser {
        advertiser.shutdown();
    }
    if let Ok(Err(err)) = run_task.await {
        log::error!("Satellite error: {}", err);
    }

    log::info!("Shutdown complete");
    Ok(())
}

/// Builds the settings tree from CLI arguments.
fn build_settings(args: &Args) -> SatelliteSettings {
    let timer_repeat = args.timer_finished_wav_repeat.as_deref();

    SatelliteSettings {
        mic: MicSettings {
            uri: args.mic_uri.clone(),
            command: args.mic_command.as_deref().and_then(split_command),
            volume_multiplier: args.mic_volume_multiplier,
            noise_suppression: args.mic_noise_suppression,
            auto_gain: args.mic_auto_gain,
            rate: args.mic_command_rate,
            width: args.mic_command_width,
            channels: args.mic_command_channels,
            samples_per_chunk: args.mic_command_samples_per_chunk,
            channel_index: args.mic_channel_index,
            mute_during_awake_wav: !args.mic_no_mute_during_awake_wav,
            seconds_to_mute_after_awake_wav: args.mic_seconds_to_mute_after_awake_wav,
            ..MicSettings::default()
        },
        snd: SndSettings {
            uri: args.snd_uri.clone(),
            command: args.snd_command.as_deref().and_then(split_command),
            volume_multiplier: args.snd_volume_multiplier,
            rate: args.snd_command_rate,
            width: args.snd_command_width,
            channels: args.snd_command_channels,
            samples_per_chunk: args.snd_command_samples_per_chunk,
            awake_wav: args.awake_wav.clone(),
            done_wav: args.done_wav.clone(),
            timer_finished_wav: args.timer_finished_wav.clone(),
            timer_finished_wav_repeat: timer_repeat
                .and_then(|values| values.first())
                .map_or(1, |&repeat| repeat.max(1.0) as u32),
            timer_finished_wav_delay: timer_repeat
                .and_then(|values| values.get(1))
                .copied()
                .unwrap_or(0.0),
            disconnect_after_stop: args.snd_disconnect_after_stop,
            ..SndSettings::default()
        },
        wake: WakeSettings {
            uri: args.wake_uri.clone(),
            command: args.wake_command.as_deref().and_then(split_command),
            names: args
                .wake_word_name
                .iter()
                .map(|entry| WakeWordBinding {
                    name: entry[0].clone(),
                    pipeline: entry.get(1).cloned().or_else(|| args.pipeline.clone()),
                })
                .collect(),
            rate: args.wake_command_rate,
            width: args.wake_command_width,
            channels: args.wake_command_channels,
            refractory_seconds: (args.wake_refractory_seconds > 0.0)
                .then_some(args.wake_refractory_seconds),
            ..WakeSettings::default()
        },
        vad: VadSettings {
            enabled: args.vad,
            threshold: args.vad_threshold,
            trigger_level: args.vad_trigger_level,
            buffer_seconds: args.vad_buffer_seconds,
            wake_word_timeout: (args.vad_wake_word_timeout > 0.0)
                .then_some(args.vad_wake_word_timeout),
        },
        event: EventSettings {
            uri: args.event_uri.clone(),
            startup: args.startup_command.as_deref().and_then(split_command),
            streaming_start: args
                .streaming_start_command
                .as_deref()
                .and_then(split_command),
            streaming_stop: args
                .streaming_stop_command
                .as_deref()
                .and_then(split_command),
            detect: args.detect_command.as_deref().and_then(split_command),
            detection: args.detection_command.as_deref().and_then(split_command),
            played: args.played_command.as_deref().and_then(split_command),
            transcript: args.transcript_command.as_deref().and_then(split_command),
            stt_start: args.stt_start_command.as_deref().and_then(split_command),
            stt_stop: args.stt_stop_command.as_deref().and_then(split_command),
            synthesize: args.synthesize_command.as_deref().and_then(split_command),
            tts_start: args.tts_start_command.as_deref().and_then(split_command),
            tts_stop: args.tts_stop_command.as_deref().and_then(split_command),
            error: args.error_command.as_deref().and_then(split_command),
            connected: args.connected_command.as_deref().and_then(split_command),
            disconnected: args
                .disconnected_command
                .as_deref()
                .and_then(split_command),
            timer_started: args
                .timer_started_command
                .as_deref()
                .and_then(split_command),
            timer_updated: args
                .timer_updated_command
                .as_deref()
                .and_then(split_command),
            timer_cancelled: args
                .timer_cancelled_command
                .as_deref()
                .and_then(split_command),
            timer_finished: args
                .timer_finished_command
                .as_deref()
                .and_then(split_command),
            ..EventSettings::default()
        },
        restart_timeout: args.restart_timeout,
        debug_recording_dir: args.debug_recording_dir.clone(),
    }
}

/// Fatal argument validation; runs before any connection is made.
fn validate(args: &Args, settings: &SatelliteSettings) -> Result<()> {
    if !settings.mic.enabled() {
        bail!("A microphone service is required (--mic-uri or --mic-command)");
    }
    if !args.wake_word_name.is_empty() && !settings.wake.enabled() {
        bail!("--wake-word-name requires --wake-uri or --wake-command");
    }
    if settings.wake.enabled() && settings.vad.enabled {
        log::warn!("VAD is not used with local wake word detection");
    }
    if settings.mic.channel_index.is_some() && settings.mic.width != 2 {
        bail!("--mic-channel-index requires 16-bit mic audio");
    }

    for (flag, wav) in [
        ("--awake-wav", &settings.snd.awake_wav),
        ("--done-wav", &settings.snd.done_wav),
        ("--timer-finished-wav", &settings.snd.timer_finished_wav),
    ] {
        if let Some(path) = wav {
            if !path.is_file() {
                bail!("{} file does not exist: {}", flag, path.display());
            }
        }
    }

    Ok(())
}

/// The satellite section of the info payload served on `describe`.
fn satellite_info(args: &Args, settings: &SatelliteSettings) -> Map<String, Value> {
    let mut satellite = Map::new();
    satellite.insert("name".into(), json!(args.name));
    satellite.insert("description".into(), json!(args.name));
    if let Some(area) = &args.area {
        satellite.insert("area".into(), json!(area));
    }
    satellite.insert("attribution".into(), json!({"name": "", "url": ""}));
    satellite.insert("installed".into(), json!(true));
    satellite.insert("has_vad".into(), json!(settings.vad.enabled));
    if settings.snd.enabled() {
        satellite.insert("snd_format".into(), json!(settings.snd.format()));
    }

    let mut info = Map::new();
    info.insert("satellite".into(), Value::Object(satellite));
    info
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

//! The four peer service tasks: mic (in), snd (out), wake (bidirectional)
//! and event (observability fan-out).
//!
//! All four share one restart contract: a task exits only on cancellation;
//! any error or end-of-stream disconnects the peer, sleeps the configured
//! back-off and reconnects. Peer problems never escalate to the satellite
//! lifecycle.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::audio::{multiply_volume, select_channel};
use crate::dsp::MicEnhancer;
use crate::error::SatelliteResult;
use crate::event::Event;
use crate::peer::{PeerConnection, PeerConnector, ProcessAudioConfig};
use crate::satellite::{Command, SoundEvent};
use crate::settings::{EventSettings, MicSettings, SndSettings, WakeSettings};

/// Sleeps out the reconnect back-off; false when cancelled.
async fn backoff(seconds: f64, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = time::sleep(Duration::from_secs_f64(seconds.max(0.0))) => true,
    }
}

async fn drop_connection(connection: &mut Option<PeerConnection>) {
    if let Some(connection) = connection.take() {
        connection.shutdown().await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Mic
// ─────────────────────────────────────────────────────────────────────────────

/// Reads mic audio, applies inline pre-processing (channel selection,
/// volume, noise suppression / auto gain) and hands events to the
/// satellite.
pub(crate) async fn mic_task(
    settings: MicSettings,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
) {
    let connector = match mic_connector(&settings) {
        Ok(connector) => connector,
        Err(err) => {
            log::error!("Invalid mic service settings: {}", err);
            return;
        }
    };

    let mut enhancer = if settings.needs_enhancement() {
        log::debug!("Using noise suppression / auto gain");
        match MicEnhancer::new(settings.auto_gain, settings.noise_suppression) {
            Ok(enhancer) => Some(enhancer),
            Err(err) => {
                log::error!("Audio enhancement unavailable: {}", err);
                None
            }
        }
    } else {
        None
    };

    let mut connection: Option<PeerConnection> = None;
    loop {
        let healthy = tokio::select! {
            _ = cancel.cancelled() => break,
            result = mic_step(&connector, &mut connection, &settings, &mut enhancer, &commands) => {
                match result {
                    Ok(true) => true,
                    Ok(false) => {
                        log::warn!("Mic service disconnected");
                        false
                    }
                    Err(err) => {
                        log::error!("Unexpected error in mic task: {}", err);
                        false
                    }
                }
            }
        };
        if !healthy {
            drop_connection(&mut connection).await;
            if !backoff(settings.reconnect_seconds, &cancel).await {
                break;
            }
        }
    }
    drop_connection(&mut connection).await;
}

fn mic_connector(settings: &MicSettings) -> SatelliteResult<PeerConnector> {
    PeerConnector::from_service(
        settings.uri.as_deref(),
        settings.command.as_deref(),
        ProcessAudioConfig {
            format: settings.format(),
            samples_per_chunk: settings.samples_per_chunk,
        },
    )
}

/// One mic iteration: connect if needed, read one event, pre-process,
/// forward. `Ok(false)` means the peer closed the stream.
async fn mic_step(
    connector: &PeerConnector,
    connection: &mut Option<PeerConnection>,
    settings: &MicSettings,
    enhancer: &mut Option<MicEnhancer>,
    commands: &mpsc::UnboundedSender<Command>,
) -> SatelliteResult<bool> {
    if connection.is_none() {
        *connection = Some(connector.connect().await?);
        log::debug!("Connected to mic service");
    }
    let active = connection.as_mut().expect("connection was just set");

    let Some(event) = active.read_event().await? else {
        return Ok(false);
    };

    let event = match event {
        Event::AudioChunk {
            mut format,
            timestamp,
            mut audio,
        } if settings.needs_processing() => {
            if let Some(index) = settings.channel_index {
                // Channel selection requires 16-bit samples.
                if format.width == 2 && format.channels > 1 {
                    audio = select_channel(&audio, format.channels, index);
                    format.channels = 1;
                }
            }
            if (settings.volume_multiplier - 1.0).abs() > f32::EPSILON {
                audio = multiply_volume(&audio, settings.volume_multiplier);
            }
            if let Some(enhancer) = enhancer {
                audio = enhancer.process(&audio);
            }
            Event::AudioChunk {
                format,
                timestamp,
                audio,
            }
        }
        other => other,
    };

    let _ = commands.send(Command::FromMic(event));
    Ok(true)
}

// ─────────────────────────────────────────────────────────────────────────────
// Snd
// ─────────────────────────────────────────────────────────────────────────────

/// Drains the sound queue into the snd peer, connecting lazily on the first
/// event. After `audio-stop` the connection may be dropped so an
/// `aplay`-style child releases the device; TTS completion is reported back
/// to the satellite.
pub(crate) async fn snd_task(
    settings: SndSettings,
    mut queue: mpsc::UnboundedReceiver<SoundEvent>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
) {
    let connector = match PeerConnector::from_service(
        settings.uri.as_deref(),
        settings.command.as_deref(),
        ProcessAudioConfig {
            format: settings.format(),
            samples_per_chunk: settings.samples_per_chunk,
        },
    ) {
        Ok(connector) => connector,
        Err(err) => {
            log::error!("Invalid snd service settings: {}", err);
            return;
        }
    };

    let mut connection: Option<PeerConnection> = None;
    loop {
        let sound = tokio::select! {
            _ = cancel.cancelled() => break,
            sound = queue.recv() => match sound {
                Some(sound) => sound,
                None => break,
            },
        };

        let delivered = tokio::select! {
            _ = cancel.cancelled() => break,
            result = snd_deliver(&connector, &mut connection, &settings, &commands, &sound) => result,
        };
        if let Err(err) = delivered {
            log::error!("Unexpected error in snd task: {}", err);
            drop_connection(&mut connection).await;
            // Drop queued audio from the failed utterance, like a fresh queue.
            while queue.try_recv().is_ok() {}
            if !backoff(settings.reconnect_seconds, &cancel).await {
                break;
            }
        }
    }
    drop_connection(&mut connection).await;
}

async fn snd_deliver(
    connector: &PeerConnector,
    connection: &mut Option<PeerConnection>,
    settings: &SndSettings,
    commands: &mpsc::UnboundedSender<Command>,
    sound: &SoundEvent,
) -> SatelliteResult<()> {
    if connection.is_none() {
        *connection = Some(connector.connect().await?);
        log::debug!("Connected to snd service");
    }
    let active = connection.as_mut().expect("connection was just set");

    let event = match &sound.event {
        Event::AudioChunk {
            format,
            timestamp,
            audio,
        } if settings.needs_processing() => Event::AudioChunk {
            format: *format,
            timestamp: *timestamp,
            audio: multiply_volume(audio, settings.volume_multiplier),
        },
        other => other.clone(),
    };
    active.write_event(&event).await?;

    if settings.disconnect_after_stop && matches!(event, Event::AudioStop { .. }) {
        drop_connection(connection).await;
        if sound.is_tts {
            let _ = commands.send(Command::SndPlayed);
        }
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Wake
// ─────────────────────────────────────────────────────────────────────────────

/// Bidirectional wake peer: queued outbound events (audio, detect,
/// describe) and inbound events (detections, info) are multiplexed, not
/// ordered. On every (re)connect the detect request is re-sent and stale
/// queued audio is dropped.
pub(crate) async fn wake_task(
    settings: WakeSettings,
    mut queue: mpsc::UnboundedReceiver<Event>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
) {
    let connector = match PeerConnector::from_service(
        settings.uri.as_deref(),
        settings.command.as_deref(),
        ProcessAudioConfig {
            format: settings.format(),
            samples_per_chunk: 1024,
        },
    ) {
        Ok(connector) => connector,
        Err(err) => {
            log::error!("Invalid wake service settings: {}", err);
            return;
        }
    };

    let names: Option<Vec<String>> = if settings.names.is_empty() {
        None
    } else {
        Some(
            settings
                .names
                .iter()
                .map(|binding| binding.name.clone())
                .collect(),
        )
    };

    'reconnect: loop {
        if cancel.is_cancelled() {
            break;
        }

        let connection = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connector.connect() => match result {
                Ok(connection) => connection,
                Err(err) => {
                    log::warn!("Could not connect to wake service: {}", err);
                    if !backoff(settings.reconnect_seconds, &cancel).await {
                        break;
                    }
                    continue;
                }
            },
        };
        log::debug!("Connected to wake service");

        // Stale audio queued while disconnected is useless to the detector.
        while queue.try_recv().is_ok() {}

        let (mut reader, mut writer) = connection.split();

        // Tell the wake service which wake word(s) to detect.
        if let Err(err) = writer
            .write_event(&Event::Detect {
                names: names.clone(),
            })
            .await
        {
            log::warn!("Could not send detect request: {}", err);
            if !backoff(settings.reconnect_seconds, &cancel).await {
                break;
            }
            continue;
        }
        let _ = commands.send(Command::WakeConnected);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    writer.shutdown().await;
                    break 'reconnect;
                }
                outbound = queue.recv() => {
                    let Some(event) = outbound else {
                        writer.shutdown().await;
                        break 'reconnect;
                    };
                    if let Err(err) = writer.write_event(&event).await {
                        log::error!("Unexpected error writing to wake service: {}", err);
                        break;
                    }
                }
                inbound = reader.read_event() => {
                    match inbound {
                        Ok(Some(event)) => {
                            let _ = commands.send(Command::FromWake(event));
                        }
                        Ok(None) => {
                            log::warn!("Wake service disconnected");
                            break;
                        }
                        Err(err) => {
                            log::error!("Unexpected error in wake task: {}", err);
                            break;
                        }
                    }
                }
            }
        }

        writer.shutdown().await;
        drop(reader);
        if !backoff(settings.reconnect_seconds, &cancel).await {
            break;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

/// Observability fan-out: drains the event queue into the event peer. Pure
/// output; failures drop pending events and reconnect.
pub(crate) async fn event_task(
    settings: EventSettings,
    mut queue: mpsc::UnboundedReceiver<Event>,
    cancel: CancellationToken,
) {
    let Some(uri) = settings.uri.clone() else {
        return;
    };
    let connector = match PeerConnector::from_service(
        Some(&uri),
        None,
        ProcessAudioConfig {
            format: crate::event::AudioFormat::default(),
            samples_per_chunk: 1024,
        },
    ) {
        Ok(connector) => connector,
        Err(err) => {
            log::error!("Invalid event service settings: {}", err);
            return;
        }
    };

    let mut connection: Option<PeerConnection> = None;
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = queue.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = event_deliver(&connector, &mut connection, &event) => result,
        };

        if let Err(err) = result {
            log::error!("Unexpected error in event task: {}", err);
            drop_connection(&mut connection).await;
            while queue.try_recv().is_ok() {}
            if !backoff(settings.reconnect_seconds(), &cancel).await {
                break;
            }
        }
    }
    drop_connection(&mut connection).await;
}

async fn event_deliver(
    connector: &PeerConnector,
    connection: &mut Option<PeerConnection>,
    event: &Event,
) -> SatelliteResult<()> {
    if connection.is_none() {
        *connection = Some(connector.connect().await?);
        log::debug!("Connected to event service");
    }
    connection
        .as_mut()
        .expect("connection was just set")
        .write_event(event)
        .await
}

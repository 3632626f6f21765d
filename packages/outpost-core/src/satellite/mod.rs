//! The satellite runtime: lifecycle FSM, server link with keep-alive,
//! event routing, trigger hooks and the three streaming modes.
//!
//! All satellite state is owned by a single actor task. Peer tasks
//! ([`peers`]) and server connection handlers communicate with it through
//! typed [`Command`]s on one mpsc channel; the satellite owns the only
//! senders for the snd / wake / event peer queues. The server writer is the
//! one shared object: an async mutex split between the owning connection
//! handler (`describe` replies) and the satellite (everything else).

pub mod peers;

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::audio::{wav_to_events, DebugAudioWriter, RingBuffer};
use crate::dsp::SpeechDetector;
use crate::error::{SatelliteError, SatelliteResult};
use crate::event::codec;
use crate::event::{AudioFormat, Event, PipelineStage};
use crate::settings::SatelliteSettings;
use crate::utils::{normalize_wake_word, now_nanos, run_event_command};

/// Cadence of satellite-initiated pings once keep-alive is enabled.
const PING_INTERVAL: Duration = Duration::from_secs(2);

/// How long to wait for a pong before dropping the server binding.
const PONG_TIMEOUT: Duration = Duration::from_secs(5);

/// How much audio the wake debug recording keeps around a wake word.
const WAKE_DEBUG_SECONDS: f64 = 2.0;

/// Lifecycle state of the satellite run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotStarted,
    Starting,
    Started,
    Restarting,
    Stopping,
    Stopped,
}

impl State {
    /// The satellite keeps running until it reaches [`State::Stopped`].
    pub fn is_running(self) -> bool {
        self != Self::Stopped
    }
}

/// Which streaming state machine drives this satellite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    /// Stream all mic audio while the server keeps the satellite running.
    Always,
    /// Gate streaming on local voice activity detection.
    Vad,
    /// Gate streaming on local wake word detection.
    Wake,
}

impl StreamingMode {
    /// Mode selection is implicit: a wake service wins over VAD, which wins
    /// over always-streaming.
    pub fn from_settings(settings: &SatelliteSettings) -> Self {
        if settings.wake.enabled() {
            Self::Wake
        } else if settings.vad.enabled {
            Self::Vad
        } else {
            Self::Always
        }
    }
}

/// An event queued for the sound service. `is_tts` distinguishes server TTS
/// audio from locally generated cues (awake / done / timer), so only real
/// TTS completion reports `played`.
#[derive(Debug, Clone)]
pub struct SoundEvent {
    pub event: Event,
    pub is_tts: bool,
}

/// Shared write half of the active server connection.
pub type ServerWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Messages into the satellite actor.
pub enum Command {
    /// Processed event from the mic service.
    FromMic(Event),
    /// Event from the wake service (detections, info).
    FromWake(Event),
    /// The wake task (re)connected and sent its `detect` request.
    WakeConnected,
    /// The snd service finished playing TTS audio.
    SndPlayed,
    /// Event read by a server connection handler. `accept` resolves to
    /// false when another connection owns the satellite.
    FromServer {
        client_id: u64,
        writer: ServerWriter,
        event: Event,
        accept: oneshot::Sender<bool>,
    },
    /// A server connection handler saw its stream close.
    ServerDisconnected { client_id: u64 },
    /// Refresh wake service info, replying with the composite info once the
    /// wake peer answers. The caller enforces its own timeout.
    UpdateInfo {
        reply: oneshot::Sender<Map<String, Value>>,
    },
    /// Current composite info, answered immediately.
    GetInfo {
        reply: oneshot::Sender<Map<String, Value>>,
    },
    /// Begin a graceful shutdown.
    Stop,
}

/// Cloneable handle for controlling a running satellite.
#[derive(Clone)]
pub struct SatelliteHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<State>,
}

impl SatelliteHandle {
    /// Sender for feeding commands into the satellite (used by the server
    /// listener and tests).
    pub fn commands(&self) -> mpsc::UnboundedSender<Command> {
        self.commands.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        *self.state.borrow()
    }

    /// Requests a stop and waits for the satellite to reach `Stopped`.
    pub async fn stop(&mut self) {
        let _ = self.commands.send(Command::Stop);
        while *self.state.borrow() != State::Stopped {
            if self.state.changed().await.is_err() {
                break;
            }
        }
    }
}

/// The satellite actor. Construct with [`Satellite::new`], then drive with
/// [`Satellite::run`].
pub struct Satellite {
    settings: SatelliteSettings,
    mode: StreamingMode,
    /// Composite info served on `describe` (wake section overlaid once the
    /// wake peer reports in).
    info: Map<String, Value>,

    state: State,
    state_tx: watch::Sender<State>,
    state_rx: watch::Receiver<State>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,

    /// At most one active server: `(client_id, writer)`.
    server: Option<(u64, ServerWriter)>,

    // Peer plumbing; present while connected.
    cancel: Option<CancellationToken>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    snd_tx: Option<mpsc::UnboundedSender<SoundEvent>>,
    wake_tx: Option<mpsc::UnboundedSender<Event>>,
    event_tx: Option<mpsc::UnboundedSender<Event>>,

    // Keep-alive: enabled by the first server ping.
    ping_enabled: bool,
    pong_deadline: Option<Instant>,

    // Streaming state (fields used depend on the mode).
    is_streaming: bool,
    paused: bool,
    mic_unmute_at: Option<Instant>,
    vad: Option<SpeechDetector>,
    vad_prebuffer: Option<RingBuffer>,
    vad_timeout_deadline: Option<Instant>,
    /// Wake word name -> instant after which another detection is accepted.
    refractory: HashMap<Option<String>, Instant>,

    // Debug recording (wake ring + stt session share one timestamp).
    wake_debug: Option<DebugAudioWriter>,
    stt_debug: Option<DebugAudioWriter>,
    debug_timestamp: u64,

    /// Pending `UpdateInfo` requests waiting on the wake peer.
    info_waiters: Vec<oneshot::Sender<Map<String, Value>>>,
}

impl Satellite {
    pub fn new(settings: SatelliteSettings, info: Map<String, Value>) -> SatelliteResult<Self> {
        let mode = StreamingMode::from_settings(&settings);

        let (vad, vad_prebuffer) = if mode == StreamingMode::Vad {
            let detector = SpeechDetector::new(settings.vad.threshold, settings.vad.trigger_level)?;
            let prebuffer = (settings.vad.buffer_seconds > 0.0).then(|| {
                let bytes =
                    (settings.vad.buffer_seconds * f64::from(AudioFormat::default().byte_rate()))
                        .ceil() as usize;
                RingBuffer::new(bytes)
            });
            (Some(detector), prebuffer)
        } else {
            (None, None)
        };

        let recording_format = AudioFormat {
            channels: if settings.mic.channel_index.is_some() {
                1
            } else {
                settings.mic.channels
            },
            ..settings.mic.format()
        };
        let (wake_debug, stt_debug) = match &settings.debug_recording_dir {
            Some(dir) => {
                let wake = (mode == StreamingMode::Wake).then(|| {
                    let ring_bytes = (WAKE_DEBUG_SECONDS
                        * f64::from(recording_format.byte_rate()))
                    .ceil() as usize;
                    DebugAudioWriter::new(dir, "wake", recording_format, Some(ring_bytes))
                });
                let stt = DebugAudioWriter::new(dir, "stt", recording_format, None);
                (wake, Some(stt))
            }
            None => (None, None),
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(State::NotStarted);

        Ok(Self {
            settings,
            mode,
            info,
            state: State::NotStarted,
            state_tx,
            state_rx,
            commands_tx,
            commands_rx,
            server: None,
            cancel: None,
            tasks: Vec::new(),
            snd_tx: None,
            wake_tx: None,
            event_tx: None,
            ping_enabled: false,
            pong_deadline: None,
            is_streaming: false,
            paused: false,
            mic_unmute_at: None,
            vad,
            vad_prebuffer,
            vad_timeout_deadline: None,
            refractory: HashMap::new(),
            wake_debug,
            stt_debug,
            debug_timestamp: 0,
            info_waiters: Vec::new(),
        })
    }

    pub fn mode(&self) -> StreamingMode {
        self.mode
    }

    /// Handle for the server listener and for external shutdown.
    pub fn handle(&self) -> SatelliteHandle {
        SatelliteHandle {
            commands: self.commands_tx.clone(),
            state: self.state_rx.clone(),
        }
    }

    fn set_state(&mut self, state: State) {
        if self.state == state {
            return;
        }
        log::debug!("State: {:?} -> {:?}", self.state, state);
        self.state = state;
        let _ = self.state_tx.send(state);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Runs the satellite until stopped. Internal errors restart the
    /// satellite after `restart_timeout`; peer problems never reach here.
    pub async fn run(mut self) -> SatelliteResult<()> {
        while self.state.is_running() {
            match self.state {
                State::NotStarted => {
                    self.set_state(State::Starting);
                    self.connect_peers();
                    self.set_state(State::Started);
                    run_event_command(&self.settings.event.startup, None).await;
                }
                State::Starting | State::Started => {
                    if let Err(err) = self.process(None).await {
                        if self.state.is_running() {
                            log::error!("Unexpected error running satellite: {}", err);
                            self.set_state(State::Restarting);
                        }
                    }
                }
                State::Restarting => {
                    self.disconnect_peers().await;
                    log::debug!(
                        "Restarting in {} second(s)",
                        self.settings.restart_timeout
                    );
                    let deadline =
                        Instant::now() + Duration::from_secs_f64(self.settings.restart_timeout);
                    match self.process(Some(deadline)).await {
                        Ok(()) => {
                            if self.state == State::Restarting {
                                self.set_state(State::NotStarted);
                            }
                        }
                        Err(err) => {
                            log::error!("Unexpected error while restarting: {}", err);
                        }
                    }
                }
                State::Stopping => {
                    self.server = None;
                    self.ping_enabled = false;
                    self.pong_deadline = None;
                    self.disconnect_peers().await;
                    self.set_state(State::Stopped);
                }
                State::Stopped => break,
            }
        }
        self.set_state(State::Stopped);
        Ok(())
    }

    /// Processes commands and timers until the state changes or `until`
    /// passes. Every satellite mutation happens inside this loop.
    async fn process(&mut self, until: Option<Instant>) -> SatelliteResult<()> {
        let mut ping_interval = time::interval(PING_INTERVAL);
        ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let ping_active = self.ping_enabled && self.server.is_some();
            let pong_deadline = self.pong_deadline;
            // Placeholder for disabled deadline branches; never polled.
            let parked = Instant::now() + Duration::from_secs(3600);

            tokio::select! {
                command = self.commands_rx.recv() => {
                    let Some(command) = command else { return Ok(()) };
                    let before = self.state;
                    self.handle_command(command).await?;
                    if self.state != before {
                        return Ok(());
                    }
                }
                _ = ping_interval.tick(), if ping_active => {
                    self.send_ping().await;
                }
                _ = time::sleep_until(pong_deadline.unwrap_or(parked)), if pong_deadline.is_some() => {
                    log::warn!("Server did not respond to ping; disconnecting");
                    self.clear_server().await;
                }
                _ = time::sleep_until(until.unwrap_or(parked)), if until.is_some() => {
                    return Ok(());
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> SatelliteResult<()> {
        match command {
            Command::FromMic(event) => self.event_from_mic(event).await,
            Command::FromWake(event) => self.event_from_wake(event).await,
            Command::WakeConnected => self.trigger_detect().await,
            Command::SndPlayed => self.trigger_played().await,
            Command::FromServer {
                client_id,
                writer,
                event,
                accept,
            } => {
                let accepted = match &self.server {
                    None => {
                        // Take over after the previous owner released.
                        self.set_server(client_id, writer).await;
                        true
                    }
                    Some((owner, _)) => *owner == client_id,
                };
                let _ = accept.send(accepted);
                if accepted {
                    self.event_from_server(event).await?;
                }
            }
            Command::ServerDisconnected { client_id } => {
                if matches!(self.server, Some((owner, _)) if owner == client_id) {
                    self.clear_server().await;
                }
            }
            Command::UpdateInfo { reply } => {
                self.info_waiters.retain(|waiter| !waiter.is_closed());
                if self.settings.wake.enabled() && self.wake_tx.is_some() {
                    self.event_to_wake(Event::Describe);
                    self.info_waiters.push(reply);
                } else {
                    let _ = reply.send(self.info.clone());
                }
            }
            Command::GetInfo { reply } => {
                let _ = reply.send(self.info.clone());
            }
            Command::Stop => self.set_state(State::Stopping),
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Server link
    // ─────────────────────────────────────────────────────────────────────

    async fn set_server(&mut self, client_id: u64, writer: ServerWriter) {
        self.server = Some((client_id, writer));
        log::debug!("Server set: {}", client_id);
        self.forward_event(Event::SatelliteConnected);
        run_event_command(&self.settings.event.connected, None).await;
    }

    /// Releases the server binding. Idempotent: only the first call after a
    /// bind broadcasts `satellite-disconnected`.
    async fn clear_server(&mut self) {
        if self.server.take().is_none() {
            return;
        }
        self.ping_enabled = false;
        self.pong_deadline = None;
        log::debug!("Server disconnected");
        self.forward_event(Event::SatelliteDisconnected);
        run_event_command(&self.settings.event.disconnected, None).await;

        // Reset the streaming FSM to its idle state.
        let was_streaming = self.is_streaming;
        self.is_streaming = false;
        self.vad_timeout_deadline = None;
        if let Some(vad) = &mut self.vad {
            vad.reset();
        }
        if let Some(buffer) = &mut self.vad_prebuffer {
            buffer.clear();
        }
        if self.mode == StreamingMode::Wake {
            if let Some(writer) = &mut self.wake_debug {
                writer.stop();
            }
        }
        if let Some(writer) = &mut self.stt_debug {
            writer.stop();
        }
        if was_streaming {
            self.trigger_streaming_stop().await;
        }
    }

    /// Writes an event to the bound server; a no-op without a binding. On
    /// write failure the binding is cleared, never raising to the caller.
    async fn event_to_server(&mut self, event: &Event) {
        let Some((_, writer)) = &self.server else {
            return;
        };
        let writer = Arc::clone(writer);
        let result = {
            let mut guard = writer.lock().await;
            codec::write_event(&mut *guard, &event.to_wire()).await
        };
        if let Err(err) = result {
            match &err {
                SatelliteError::Io(io)
                    if matches!(
                        io.kind(),
                        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe
                    ) =>
                {
                    log::warn!("Server disconnected unexpectedly");
                }
                _ => log::error!("Unexpected error sending event to server: {}", err),
            }
            self.clear_server().await;
        }
    }

    async fn send_ping(&mut self) {
        if self.pong_deadline.is_some() {
            // Still waiting on the previous ping.
            return;
        }
        self.event_to_server(&Event::Ping { text: None }).await;
        if self.server.is_some() {
            self.pong_deadline = Some(Instant::now() + PONG_TIMEOUT);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Event routing
    // ─────────────────────────────────────────────────────────────────────

    async fn event_from_server(&mut self, event: Event) -> SatelliteResult<()> {
        // In wake mode a transcript ends the utterance *before* the "done"
        // cue plays, so cue audio is never forwarded to the server.
        if self.mode == StreamingMode::Wake && matches!(event, Event::Transcript { .. }) {
            self.is_streaming = false;
        }

        if matches!(event, Event::AudioChunk { .. }) {
            // TTS audio; never fanned out to the event service.
            self.event_to_snd(SoundEvent {
                event,
                is_tts: true,
            });
            return Ok(());
        }

        match &event {
            Event::Ping { text } => {
                let text = text.clone();
                self.event_to_server(&Event::Pong { text }).await;
                if !self.ping_enabled {
                    log::debug!("Keep-alive pings enabled");
                    self.ping_enabled = true;
                }
                return Ok(());
            }
            Event::Pong { .. } => {
                self.pong_deadline = None;
                return Ok(());
            }
            Event::AudioStart { .. } => {
                self.event_to_snd(SoundEvent {
                    event: event.clone(),
                    is_tts: true,
                });
                self.trigger_tts_start().await;
            }
            Event::AudioStop { .. } => {
                self.event_to_snd(SoundEvent {
                    event: event.clone(),
                    is_tts: true,
                });
                self.trigger_tts_stop().await;
            }
            Event::Detect { .. } => self.trigger_detect().await,
            Event::Detection { name, .. } => {
                log::debug!("Wake word detected");
                let name = name.clone();
                self.trigger_detection(name.as_deref()).await;
            }
            Event::VoiceStarted { .. } => self.trigger_stt_start().await,
            Event::VoiceStopped { .. } => self.trigger_stt_stop().await,
            Event::Transcript { text } => {
                log::debug!("Transcript: {}", text);
                let text = text.clone();
                self.trigger_transcript(&text).await;
            }
            Event::Synthesize { text, .. } => {
                let text = text.clone();
                self.trigger_synthesize(&text).await;
            }
            Event::Error { text, .. } => {
                log::warn!("Error from server: {}", text);
                let text = text.clone();
                self.trigger_error(&text).await;
            }
            Event::TimerStarted { data } => {
                let input = Value::Object(data.clone()).to_string();
                run_event_command(&self.settings.event.timer_started, Some(&input)).await;
            }
            Event::TimerUpdated { data } => {
                let input = Value::Object(data.clone()).to_string();
                run_event_command(&self.settings.event.timer_updated, Some(&input)).await;
            }
            Event::TimerCancelled { data } => {
                let input = Value::Object(data.clone()).to_string();
                run_event_command(&self.settings.event.timer_cancelled, Some(&input)).await;
            }
            Event::TimerFinished { data } => {
                let input = Value::Object(data.clone()).to_string();
                run_event_command(&self.settings.event.timer_finished, Some(&input)).await;
                self.play_timer_finished_cue();
            }
            _ => {}
        }

        // Everything except ping/pong/audio-chunk fans out for observability.
        self.forward_event(event.clone());
        self.mode_event_from_server(&event).await;
        Ok(())
    }

    async fn mode_event_from_server(&mut self, event: &Event) {
        match self.mode {
            StreamingMode::Always => match event {
                Event::RunSatellite => {
                    self.is_streaming = true;
                    log::info!("Streaming audio");
                    if let Some(writer) = &mut self.stt_debug {
                        writer.start(None);
                    }
                    self.send_run_pipeline(None).await;
                    self.trigger_streaming_start().await;
                }
                Event::PauseSatellite => {
                    self.is_streaming = false;
                    if let Some(writer) = &mut self.stt_debug {
                        writer.stop();
                    }
                }
                Event::Transcript { .. } => {
                    log::info!("Streaming audio");
                    // Streaming never stopped; re-fire so observers (LEDs)
                    // reset anyway.
                    self.trigger_streaming_start().await;
                }
                _ => {}
            },
            StreamingMode::Vad => match event {
                Event::RunSatellite => {
                    self.paused = false;
                    log::info!("Waiting for speech");
                }
                Event::PauseSatellite => {
                    self.paused = true;
                    self.stop_vad_streaming(false).await;
                }
                Event::Transcript { .. } | Event::Error { .. } => {
                    self.stop_vad_streaming(true).await;
                }
                _ => {}
            },
            StreamingMode::Wake => match event {
                Event::RunSatellite => {
                    self.paused = false;
                    self.enter_wait_for_wake(true).await;
                }
                Event::PauseSatellite => {
                    self.paused = true;
                    self.enter_wait_for_wake(false).await;
                }
                Event::Transcript { .. } | Event::Error { .. } => {
                    self.enter_wait_for_wake(true).await;
                }
                _ => {}
            },
        }
    }

    /// Mic audio after pre-processing. Muted audio is dropped here, before
    /// any mode sees it.
    async fn event_from_mic(&mut self, event: Event) {
        let Event::AudioChunk { format, audio, .. } = &event else {
            return;
        };

        if let Some(unmute_at) = self.mic_unmute_at {
            if Instant::now() < unmute_at {
                return;
            }
            self.mic_unmute_at = None;
            log::debug!("Unmuted microphone");
        }

        match self.mode {
            StreamingMode::Always => {
                if !self.is_streaming {
                    return;
                }
                if let Some(writer) = &mut self.stt_debug {
                    writer.write(audio);
                }
                self.event_to_server(&event).await;
            }
            StreamingMode::Vad => {
                if self.paused {
                    return;
                }
                if self.is_streaming {
                    if let Some(deadline) = self.vad_timeout_deadline {
                        if Instant::now() >= deadline {
                            // The server never heard a wake word; stop the
                            // pipeline and go back to listening.
                            self.is_streaming = false;
                            self.vad_timeout_deadline = None;
                            self.event_to_server(&Event::AudioStop { timestamp: None })
                                .await;
                            log::info!("Waiting for speech");
                            self.trigger_streaming_stop().await;
                        }
                    }
                }
                if !self.is_streaming {
                    let detected = match self.vad.as_mut() {
                        Some(vad) => vad.detect(audio),
                        None => false,
                    };
                    if !detected {
                        if let Some(buffer) = &mut self.vad_prebuffer {
                            buffer.put(audio);
                        }
                        return;
                    }

                    self.is_streaming = true;
                    log::info!("Streaming audio");
                    self.send_run_pipeline(None).await;
                    self.trigger_streaming_start().await;
                    self.vad_timeout_deadline = self
                        .settings
                        .vad
                        .wake_word_timeout
                        .map(|secs| Instant::now() + Duration::from_secs_f64(secs));

                    // Drain the pre-roll: audio recorded right before speech
                    // was detected, sent as a single chunk.
                    let preroll = self.vad_prebuffer.as_mut().and_then(|buffer| {
                        let bytes = (!buffer.is_empty()).then(|| buffer.to_bytes());
                        buffer.clear();
                        bytes
                    });
                    if let Some(preroll) = preroll {
                        self.event_to_server(&Event::AudioChunk {
                            format: *format,
                            timestamp: None,
                            audio: preroll,
                        })
                        .await;
                    }
                    if let Some(vad) = &mut self.vad {
                        vad.reset();
                    }
                }
                if self.is_streaming {
                    self.event_to_server(&event).await;
                }
            }
            StreamingMode::Wake => {
                if self.paused {
                    return;
                }
                if self.is_streaming {
                    if let Some(writer) = &mut self.stt_debug {
                        writer.write(audio);
                    }
                    self.event_to_server(&event).await;
                } else {
                    if let Some(writer) = &mut self.wake_debug {
                        writer.write(audio);
                    }
                    self.event_to_wake(event);
                }
            }
        }
    }

    async fn event_from_wake(&mut self, event: Event) {
        match &event {
            Event::Info { data } => {
                if let Some(wake) = data.get("wake") {
                    self.info.insert("wake".into(), wake.clone());
                }
                for waiter in self.info_waiters.drain(..) {
                    let _ = waiter.send(self.info.clone());
                }
            }
            Event::Detection { name, .. } => {
                if self.mode != StreamingMode::Wake || self.is_streaming || self.paused {
                    return;
                }
                if self.server.is_none() {
                    log::debug!("Ignoring detection: no server connected");
                    return;
                }

                let key = name.clone();
                let now = Instant::now();
                if let Some(until) = self.refractory.get(&key) {
                    if now < *until {
                        log::debug!("Ignoring detection in refractory period");
                        return;
                    }
                }
                match self.settings.wake.refractory_seconds {
                    Some(seconds) => {
                        self.refractory
                            .insert(key, now + Duration::from_secs_f64(seconds));
                    }
                    None => {
                        self.refractory.remove(&key);
                    }
                }

                log::debug!("Wake word detected: {:?}", name);
                if let Some(writer) = &mut self.wake_debug {
                    writer.stop();
                }
                if let Some(writer) = &mut self.stt_debug {
                    writer.start(Some(self.debug_timestamp));
                }

                // The server must see the detection before the pipeline
                // request, and the pipeline request before any audio.
                self.event_to_server(&event).await;
                let pipeline = self.resolve_pipeline_name(name.as_deref());
                self.send_run_pipeline(pipeline).await;
                self.forward_event(event.clone());
                let name = name.clone();
                self.trigger_detection(name.as_deref()).await;
                self.trigger_streaming_start().await;
                self.is_streaming = true;
                log::debug!("Streaming audio");
            }
            _ => {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Streaming helpers
    // ─────────────────────────────────────────────────────────────────────

    async fn stop_vad_streaming(&mut self, announce: bool) {
        let was_streaming = self.is_streaming;
        self.is_streaming = false;
        self.vad_timeout_deadline = None;
        if let Some(vad) = &mut self.vad {
            vad.reset();
        }
        if let Some(buffer) = &mut self.vad_prebuffer {
            buffer.clear();
        }
        if was_streaming {
            self.trigger_streaming_stop().await;
            if announce {
                log::info!("Waiting for speech");
            }
        }
    }

    /// Returns wake mode to `waiting_for_wake`. With `resume_detect`, the
    /// wake service is told to start detecting again and the wake debug
    /// ring starts a fresh window; a pause skips both.
    async fn enter_wait_for_wake(&mut self, resume_detect: bool) {
        let was_streaming = self.is_streaming;
        self.is_streaming = false;
        if let Some(writer) = &mut self.stt_debug {
            writer.stop();
        }
        if resume_detect || was_streaming {
            self.trigger_streaming_stop().await;
        }
        if resume_detect {
            self.debug_timestamp = now_nanos();
            if let Some(writer) = &mut self.wake_debug {
                writer.start(Some(self.debug_timestamp));
            }
            self.send_wake_detect().await;
            log::info!("Waiting for wake word");
        }
    }

    async fn send_wake_detect(&mut self) {
        let names = if self.settings.wake.names.is_empty() {
            None
        } else {
            Some(
                self.settings
                    .wake
                    .names
                    .iter()
                    .map(|binding| binding.name.clone())
                    .collect(),
            )
        };
        self.event_to_wake(Event::Detect { names });
        self.trigger_detect().await;
    }

    /// Resolves the server pipeline bound to a detected wake word by
    /// normalized-name match.
    fn resolve_pipeline_name(&self, detected: Option<&str>) -> Option<String> {
        let detected = normalize_wake_word(detected?);
        self.settings
            .wake
            .names
            .iter()
            .find(|binding| normalize_wake_word(&binding.name) == detected)
            .and_then(|binding| binding.pipeline.clone())
    }

    /// Emits `run-pipeline` with stages derived from the configuration:
    /// local wake detection skips the server's wake stage, and a sound
    /// service asks for TTS output.
    async fn send_run_pipeline(&mut self, name: Option<String>) {
        let start_stage = if self.settings.wake.enabled() {
            PipelineStage::Asr
        } else {
            PipelineStage::Wake
        };
        let end_stage = if self.settings.snd.enabled() {
            PipelineStage::Tts
        } else {
            PipelineStage::Handle
        };
        // Only an always-streaming satellite asks the server to loop.
        let restart_on_end = !self.settings.wake.enabled() && !self.settings.vad.enabled;
        let snd_format = self.settings.snd.enabled().then(|| self.settings.snd.format());

        let event = Event::RunPipeline {
            start_stage,
            end_stage,
            name,
            restart_on_end,
            snd_format,
        };
        self.event_to_server(&event).await;
        self.forward_event(event);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Peer queues
    // ─────────────────────────────────────────────────────────────────────

    fn event_to_snd(&mut self, sound: SoundEvent) {
        if let Some(tx) = &self.snd_tx {
            let _ = tx.send(sound);
        }
    }

    fn event_to_wake(&mut self, event: Event) {
        if let Some(tx) = &self.wake_tx {
            let _ = tx.send(event);
        }
    }

    /// Fan-out to the observability peer; never influences behaviour.
    fn forward_event(&mut self, event: Event) {
        if let Some(tx) = &self.event_tx {
            tracing::debug!(event_type = event.event_type(), "forward_event");
            let _ = tx.send(event);
        }
    }

    /// Queues a local WAV cue for playback, returning its duration.
    fn play_wav(&mut self, path: &Path, is_tts: bool) -> Option<Duration> {
        if !self.settings.snd.enabled() {
            return None;
        }
        match wav_to_events(
            path,
            self.settings.snd.samples_per_chunk,
            self.settings.snd.volume_multiplier,
        ) {
            Ok((events, duration)) => {
                for event in events {
                    self.event_to_snd(SoundEvent { event, is_tts });
                }
                Some(duration)
            }
            Err(err) => {
                log::warn!("Could not play {}: {}", path.display(), err);
                None
            }
        }
    }

    fn play_timer_finished_cue(&mut self) {
        let Some(path) = self.settings.snd.timer_finished_wav.clone() else {
            return;
        };
        if !self.settings.snd.enabled() {
            return;
        }
        let Some(snd_tx) = self.snd_tx.clone() else {
            return;
        };
        let repeat = self.settings.snd.timer_finished_wav_repeat.max(1);
        let delay =
            Duration::from_secs_f64(self.settings.snd.timer_finished_wav_delay.max(0.0));

        match wav_to_events(
            &path,
            self.settings.snd.samples_per_chunk,
            self.settings.snd.volume_multiplier,
        ) {
            Ok((events, _)) => {
                // Repeats are spaced out without blocking the event loop.
                tokio::spawn(async move {
                    for iteration in 0..repeat {
                        if iteration > 0 && !delay.is_zero() {
                            time::sleep(delay).await;
                        }
                        for event in &events {
                            if snd_tx
                                .send(SoundEvent {
                                    event: event.clone(),
                                    is_tts: false,
                                })
                                .is_err()
                            {
                                return;
                            }
                        }
                    }
                });
            }
            Err(err) => log::warn!("Could not play {}: {}", path.display(), err),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Triggers
    // ─────────────────────────────────────────────────────────────────────

    async fn trigger_streaming_start(&mut self) {
        run_event_command(&self.settings.event.streaming_start, None).await;
        self.forward_event(Event::StreamingStarted);
    }

    async fn trigger_streaming_stop(&mut self) {
        run_event_command(&self.settings.event.streaming_stop, None).await;
        self.forward_event(Event::StreamingStopped);
    }

    async fn trigger_detect(&mut self) {
        run_event_command(&self.settings.event.detect, None).await;
    }

    /// A wake word was detected (locally or by the server): run the command,
    /// play the awake cue and optionally mute the mic while it plays.
    async fn trigger_detection(&mut self, name: Option<&str>) {
        run_event_command(&self.settings.event.detection, name).await;

        let Some(awake_wav) = self.settings.snd.awake_wav.clone() else {
            return;
        };
        if let Some(duration) = self.play_wav(&awake_wav, false) {
            if self.settings.mic.mute_during_awake_wav {
                let mute = duration
                    + Duration::from_secs_f64(
                        self.settings.mic.seconds_to_mute_after_awake_wav.max(0.0),
                    );
                self.mic_unmute_at = Some(Instant::now() + mute);
                log::debug!("Microphone muted for {:?}", mute);
            }
        }
    }

    async fn trigger_transcript(&mut self, text: &str) {
        run_event_command(&self.settings.event.transcript, Some(text)).await;
        if let Some(done_wav) = self.settings.snd.done_wav.clone() {
            self.play_wav(&done_wav, false);
        }
    }

    async fn trigger_stt_start(&mut self) {
        run_event_command(&self.settings.event.stt_start, None).await;
    }

    async fn trigger_stt_stop(&mut self) {
        run_event_command(&self.settings.event.stt_stop, None).await;
    }

    async fn trigger_synthesize(&mut self, text: &str) {
        run_event_command(&self.settings.event.synthesize, Some(text)).await;
    }

    async fn trigger_tts_start(&mut self) {
        run_event_command(&self.settings.event.tts_start, None).await;
    }

    async fn trigger_tts_stop(&mut self) {
        run_event_command(&self.settings.event.tts_stop, None).await;
    }

    async fn trigger_error(&mut self, text: &str) {
        run_event_command(&self.settings.event.error, Some(text)).await;
    }

    /// TTS playback finished at the snd peer.
    async fn trigger_played(&mut self) {
        run_event_command(&self.settings.event.played, None).await;
        self.forward_event(Event::Played);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Peer tasks
    // ─────────────────────────────────────────────────────────────────────

    fn connect_peers(&mut self) {
        let cancel = CancellationToken::new();

        if self.settings.mic.enabled() {
            log::debug!(
                "Connecting to mic service: {}",
                describe_service(&self.settings.mic.uri, &self.settings.mic.command)
            );
            self.tasks.push((
                "mic",
                tokio::spawn(peers::mic_task(
                    self.settings.mic.clone(),
                    self.commands_tx.clone(),
                    cancel.child_token(),
                )),
            ));
        }

        if self.settings.snd.enabled() {
            log::debug!(
                "Connecting to snd service: {}",
                describe_service(&self.settings.snd.uri, &self.settings.snd.command)
            );
            let (tx, rx) = mpsc::unbounded_channel();
            self.snd_tx = Some(tx);
            self.tasks.push((
                "snd",
                tokio::spawn(peers::snd_task(
                    self.settings.snd.clone(),
                    rx,
                    self.commands_tx.clone(),
                    cancel.child_token(),
                )),
            ));
        }

        if self.settings.wake.enabled() {
            log::debug!(
                "Connecting to wake service: {}",
                describe_service(&self.settings.wake.uri, &self.settings.wake.command)
            );
            let (tx, rx) = mpsc::unbounded_channel();
            self.wake_tx = Some(tx);
            self.tasks.push((
                "wake",
                tokio::spawn(peers::wake_task(
                    self.settings.wake.clone(),
                    rx,
                    self.commands_tx.clone(),
                    cancel.child_token(),
                )),
            ));
        }

        if self.settings.event.enabled() {
            log::debug!(
                "Connecting to event service: {}",
                describe_service(&self.settings.event.uri, &None)
            );
            let (tx, rx) = mpsc::unbounded_channel();
            self.event_tx = Some(tx);
            self.tasks.push((
                "event",
                tokio::spawn(peers::event_task(
                    self.settings.event.clone(),
                    rx,
                    cancel.child_token(),
                )),
            ));
        }

        self.cancel = Some(cancel);
        log::info!("Connected to services");
    }

    /// Cancels and joins all peer tasks in spawn order (mic, snd, wake,
    /// event). Queue senders drop first so draining tasks see end-of-queue.
    async fn disconnect_peers(&mut self) {
        self.snd_tx = None;
        self.wake_tx = None;
        self.event_tx = None;
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        for (name, task) in self.tasks.drain(..) {
            log::debug!("Stopping {} service", name);
            let _ = task.await;
        }
        log::debug!("Disconnected from services");
    }
}

fn describe_service(uri: &Option<String>, command: &Option<Vec<String>>) -> String {
    match (uri, command) {
        (Some(uri), _) => uri.clone(),
        (None, Some(command)) => command.join(" "),
        (None, None) => "(disabled)".to_string(),
    }
}

//! Immutable satellite settings tree.
//!
//! A service subtree is *enabled* iff it has a URI or a command. Defaults
//! match the upstream protocol conventions (16 kHz mic audio, 22.05 kHz
//! playback, 3 s reconnect back-off).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::event::AudioFormat;

/// Microphone service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicSettings {
    pub uri: Option<String>,
    pub command: Option<Vec<String>>,
    pub reconnect_seconds: f64,
    pub volume_multiplier: f32,
    /// webrtc noise suppression level (0 = off, 4 = max).
    pub noise_suppression: u32,
    /// webrtc auto gain target in -dBFS (0 = off, max 31).
    pub auto_gain: u32,
    pub rate: u32,
    pub width: u16,
    pub channels: u16,
    pub samples_per_chunk: usize,
    /// Deinterleave this channel from multi-channel mic audio.
    pub channel_index: Option<u16>,
    /// Mute the mic while the awake cue plays.
    pub mute_during_awake_wav: bool,
    /// Extra mute time after the awake cue finishes.
    pub seconds_to_mute_after_awake_wav: f64,
}

impl Default for MicSettings {
    fn default() -> Self {
        Self {
            uri: None,
            command: None,
            reconnect_seconds: 3.0,
            volume_multiplier: 1.0,
            noise_suppression: 0,
            auto_gain: 0,
            rate: 16_000,
            width: 2,
            channels: 1,
            samples_per_chunk: 1024,
            channel_index: None,
            mute_during_awake_wav: true,
            seconds_to_mute_after_awake_wav: 0.5,
        }
    }
}

impl MicSettings {
    pub fn enabled(&self) -> bool {
        self.uri.is_some() || self.command.is_some()
    }

    pub fn needs_enhancement(&self) -> bool {
        self.enabled() && (self.auto_gain > 0 || self.noise_suppression > 0)
    }

    pub fn needs_processing(&self) -> bool {
        self.enabled()
            && ((self.volume_multiplier - 1.0).abs() > f32::EPSILON
                || self.needs_enhancement()
                || self.channel_index.is_some())
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.rate, self.width, self.channels)
    }
}

/// Sound (playback) service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SndSettings {
    pub uri: Option<String>,
    pub command: Option<Vec<String>>,
    pub reconnect_seconds: f64,
    pub volume_multiplier: f32,
    pub rate: u32,
    pub width: u16,
    pub channels: u16,
    pub samples_per_chunk: usize,
    /// Cue played when the wake word is detected.
    pub awake_wav: Option<PathBuf>,
    /// Cue played when a transcript arrives.
    pub done_wav: Option<PathBuf>,
    /// Cue played when a timer finishes.
    pub timer_finished_wav: Option<PathBuf>,
    /// How many times to repeat the timer cue.
    pub timer_finished_wav_repeat: u32,
    /// Delay between timer cue repeats, in seconds.
    pub timer_finished_wav_delay: f64,
    /// Release the playback device after each `audio-stop`.
    pub disconnect_after_stop: bool,
}

impl Default for SndSettings {
    fn default() -> Self {
        Self {
            uri: None,
            command: None,
            reconnect_seconds: 3.0,
            volume_multiplier: 1.0,
            rate: 22_050,
            width: 2,
            channels: 1,
            samples_per_chunk: 1024,
            awake_wav: None,
            done_wav: None,
            timer_finished_wav: None,
            timer_finished_wav_repeat: 1,
            timer_finished_wav_delay: 0.0,
            disconnect_after_stop: true,
        }
    }
}

impl SndSettings {
    pub fn enabled(&self) -> bool {
        self.uri.is_some() || self.command.is_some()
    }

    pub fn needs_processing(&self) -> bool {
        self.enabled() && (self.volume_multiplier - 1.0).abs() > f32::EPSILON
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.rate, self.width, self.channels)
    }
}

/// A wake word the satellite listens for, optionally bound to a server
/// pipeline that should run when it is detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeWordBinding {
    pub name: String,
    pub pipeline: Option<String>,
}

/// Wake word service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeSettings {
    pub uri: Option<String>,
    pub command: Option<Vec<String>>,
    pub reconnect_seconds: f64,
    pub names: Vec<WakeWordBinding>,
    pub rate: u32,
    pub width: u16,
    pub channels: u16,
    /// Minimum time between accepted detections of the same wake word.
    pub refractory_seconds: Option<f64>,
}

impl Default for WakeSettings {
    fn default() -> Self {
        Self {
            uri: None,
            command: None,
            reconnect_seconds: 3.0,
            names: Vec::new(),
            rate: 16_000,
            width: 2,
            channels: 1,
            refractory_seconds: Some(5.0),
        }
    }
}

impl WakeSettings {
    pub fn enabled(&self) -> bool {
        self.uri.is_some() || self.command.is_some()
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.rate, self.width, self.channels)
    }
}

/// Voice activity detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadSettings {
    pub enabled: bool,
    pub threshold: f32,
    pub trigger_level: u32,
    /// Seconds of audio to keep before detected speech (pre-roll).
    pub buffer_seconds: f64,
    /// Stop streaming if the server detects no wake word in this time.
    pub wake_word_timeout: Option<f64>,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.5,
            trigger_level: 1,
            buffer_seconds: 2.0,
            wake_word_timeout: Some(5.0),
        }
    }
}

/// Event (observability) service settings plus per-trigger commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventSettings {
    pub uri: Option<String>,
    pub reconnect_seconds: Option<f64>,
    pub startup: Option<Vec<String>>,
    pub streaming_start: Option<Vec<String>>,
    pub streaming_stop: Option<Vec<String>>,
    pub detect: Option<Vec<String>>,
    pub detection: Option<Vec<String>>,
    pub played: Option<Vec<String>>,
    pub transcript: Option<Vec<String>>,
    pub stt_start: Option<Vec<String>>,
    pub stt_stop: Option<Vec<String>>,
    pub synthesize: Option<Vec<String>>,
    pub tts_start: Option<Vec<String>>,
    pub tts_stop: Option<Vec<String>>,
    pub error: Option<Vec<String>>,
    pub connected: Option<Vec<String>>,
    pub disconnected: Option<Vec<String>>,
    pub timer_started: Option<Vec<String>>,
    pub timer_updated: Option<Vec<String>>,
    pub timer_cancelled: Option<Vec<String>>,
    pub timer_finished: Option<Vec<String>>,
}

impl EventSettings {
    pub fn enabled(&self) -> bool {
        self.uri.is_some()
    }

    pub fn reconnect_seconds(&self) -> f64 {
        self.reconnect_seconds.unwrap_or(3.0)
    }
}

/// The complete satellite settings tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SatelliteSettings {
    pub mic: MicSettings,
    pub vad: VadSettings,
    pub wake: WakeSettings,
    pub snd: SndSettings,
    pub event: EventSettings,
    /// Back-off before restarting after an internal error, in seconds.
    pub restart_timeout: f64,
    /// Directory for wake/stt debug WAV recordings.
    pub debug_recording_dir: Option<PathBuf>,
}

impl Default for SatelliteSettings {
    fn default() -> Self {
        Self {
            mic: MicSettings::default(),
            vad: VadSettings::default(),
            wake: WakeSettings::default(),
            snd: SndSettings::default(),
            event: EventSettings::default(),
            restart_timeout: 5.0,
            debug_recording_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_enabled_by_uri_or_command() {
        let mut mic = MicSettings::default();
        assert!(!mic.enabled());

        mic.uri = Some("tcp://127.0.0.1:10600".into());
        assert!(mic.enabled());

        mic.uri = None;
        mic.command = Some(vec!["arecord".into(), "-r".into(), "16000".into()]);
        assert!(mic.enabled());
    }

    #[test]
    fn mic_processing_flags() {
        let mut mic = MicSettings {
            uri: Some("tcp://127.0.0.1:10600".into()),
            ..MicSettings::default()
        };
        assert!(!mic.needs_processing());

        mic.volume_multiplier = 2.0;
        assert!(mic.needs_processing());
        assert!(!mic.needs_enhancement());

        mic.volume_multiplier = 1.0;
        mic.noise_suppression = 2;
        assert!(mic.needs_enhancement());
        assert!(mic.needs_processing());

        mic.noise_suppression = 0;
        mic.channel_index = Some(1);
        assert!(mic.needs_processing());
    }

    #[test]
    fn disabled_mic_never_needs_processing() {
        let mic = MicSettings {
            volume_multiplier: 2.0,
            ..MicSettings::default()
        };
        assert!(!mic.needs_processing());
    }
}

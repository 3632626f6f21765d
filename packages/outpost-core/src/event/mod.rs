//! Typed event model for the Wyoming wire protocol.
//!
//! The codec ([`codec`]) reads and writes raw frames ([`codec::WireEvent`]);
//! this module lifts them into a tagged union so the satellite dispatches on
//! enum variants instead of string comparisons. Unknown event types are
//! preserved in [`Event::Other`] so pass-through forwarding keeps working.

pub mod codec;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::event::codec::WireEvent;

/// PCM audio format carried inside audio event headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz.
    pub rate: u32,
    /// Sample width in bytes (2 = 16-bit).
    pub width: u16,
    /// Number of interleaved channels.
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(rate: u32, width: u16, channels: u16) -> Self {
        Self {
            rate,
            width,
            channels,
        }
    }

    /// Bytes per second of PCM at this format.
    pub fn byte_rate(&self) -> u32 {
        self.rate * u32::from(self.width) * u32::from(self.channels)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        // 16 kHz, 16-bit mono: the format expected by wake and VAD services.
        Self::new(16_000, 2, 1)
    }
}

/// Stage of the remote voice pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Wake,
    Asr,
    Tts,
    Handle,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wake => "wake",
            Self::Asr => "asr",
            Self::Tts => "tts",
            Self::Handle => "handle",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "wake" => Some(Self::Wake),
            "asr" => Some(Self::Asr),
            "tts" => Some(Self::Tts),
            "handle" => Some(Self::Handle),
            _ => None,
        }
    }
}

/// A single protocol event, decoded from (or encodable to) a wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Ping {
        text: Option<String>,
    },
    Pong {
        text: Option<String>,
    },
    RunSatellite,
    PauseSatellite,
    AudioStart {
        format: AudioFormat,
        timestamp: i64,
    },
    AudioChunk {
        format: AudioFormat,
        timestamp: Option<i64>,
        audio: Bytes,
    },
    AudioStop {
        timestamp: Option<i64>,
    },
    Detect {
        names: Option<Vec<String>>,
    },
    Detection {
        name: Option<String>,
        timestamp: Option<i64>,
    },
    VoiceStarted {
        timestamp: Option<i64>,
    },
    VoiceStopped {
        timestamp: Option<i64>,
    },
    Transcript {
        text: String,
    },
    Synthesize {
        text: String,
        voice: Option<Value>,
    },
    Error {
        text: String,
        code: Option<String>,
    },
    RunPipeline {
        start_stage: PipelineStage,
        end_stage: PipelineStage,
        name: Option<String>,
        restart_on_end: bool,
        snd_format: Option<AudioFormat>,
    },
    Describe,
    Info {
        data: Map<String, Value>,
    },
    TimerStarted {
        data: Map<String, Value>,
    },
    TimerUpdated {
        data: Map<String, Value>,
    },
    TimerCancelled {
        data: Map<String, Value>,
    },
    TimerFinished {
        data: Map<String, Value>,
    },
    StreamingStarted,
    StreamingStopped,
    Played,
    SatelliteConnected,
    SatelliteDisconnected,
    /// Any event type this satellite does not interpret. Forwarded as-is.
    Other {
        event_type: String,
        data: Map<String, Value>,
        payload: Option<Bytes>,
    },
}

fn get_str(data: &Map<String, Value>, key: &str) -> Option<String> {
    data.get(key).and_then(Value::as_str).map(str::to_string)
}

fn get_i64(data: &Map<String, Value>, key: &str) -> Option<i64> {
    data.get(key).and_then(Value::as_i64)
}

fn get_format(data: &Map<String, Value>) -> AudioFormat {
    let defaults = AudioFormat::default();
    AudioFormat {
        rate: get_i64(data, "rate").map_or(defaults.rate, |v| v as u32),
        width: get_i64(data, "width").map_or(defaults.width, |v| v as u16),
        channels: get_i64(data, "channels").map_or(defaults.channels, |v| v as u16),
    }
}

fn format_fields(data: &mut Map<String, Value>, format: &AudioFormat) {
    data.insert("rate".into(), json!(format.rate));
    data.insert("width".into(), json!(format.width));
    data.insert("channels".into(), json!(format.channels));
}

impl Event {
    /// The wire `type` string for this event.
    pub fn event_type(&self) -> &str {
        match self {
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::RunSatellite => "run-satellite",
            Self::PauseSatellite => "pause-satellite",
            Self::AudioStart { .. } => "audio-start",
            Self::AudioChunk { .. } => "audio-chunk",
            Self::AudioStop { .. } => "audio-stop",
            Self::Detect { .. } => "detect",
            Self::Detection { .. } => "detection",
            Self::VoiceStarted { .. } => "voice-started",
            Self::VoiceStopped { .. } => "voice-stopped",
            Self::Transcript { .. } => "transcript",
            Self::Synthesize { .. } => "synthesize",
            Self::Error { .. } => "error",
            Self::RunPipeline { .. } => "run-pipeline",
            Self::Describe => "describe",
            Self::Info { .. } => "info",
            Self::TimerStarted { .. } => "timer-started",
            Self::TimerUpdated { .. } => "timer-updated",
            Self::TimerCancelled { .. } => "timer-cancelled",
            Self::TimerFinished { .. } => "timer-finished",
            Self::StreamingStarted => "streaming-started",
            Self::StreamingStopped => "streaming-stopped",
            Self::Played => "played",
            Self::SatelliteConnected => "satellite-connected",
            Self::SatelliteDisconnected => "satellite-disconnected",
            Self::Other { event_type, .. } => event_type,
        }
    }

    /// Decodes a wire frame into a typed event. Never fails: unrecognized
    /// types land in [`Event::Other`].
    pub fn from_wire(wire: WireEvent) -> Self {
        match Self::decode_known(&wire) {
            Some(event) => event,
            None => Self::Other {
                event_type: wire.event_type,
                data: wire.data,
                payload: wire.payload,
            },
        }
    }

    /// Decodes the event types this satellite understands; `None` keeps the
    /// frame intact in [`Event::Other`].
    fn decode_known(wire: &WireEvent) -> Option<Self> {
        let data = &wire.data;
        let event = match wire.event_type.as_str() {
            "ping" => Self::Ping {
                text: get_str(data, "text"),
            },
            "pong" => Self::Pong {
                text: get_str(data, "text"),
            },
            "run-satellite" => Self::RunSatellite,
            "pause-satellite" => Self::PauseSatellite,
            "audio-start" => Self::AudioStart {
                format: get_format(data),
                timestamp: get_i64(data, "timestamp").unwrap_or(0),
            },
            "audio-chunk" => Self::AudioChunk {
                format: get_format(data),
                timestamp: get_i64(data, "timestamp"),
                audio: wire.payload.clone().unwrap_or_default(),
            },
            "audio-stop" => Self::AudioStop {
                timestamp: get_i64(data, "timestamp"),
            },
            "detect" => Self::Detect {
                names: data.get("names").and_then(Value::as_array).map(|names| {
                    names
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                }),
            },
            "detection" => Self::Detection {
                name: get_str(data, "name"),
                timestamp: get_i64(data, "timestamp"),
            },
            "voice-started" => Self::VoiceStarted {
                timestamp: get_i64(data, "timestamp"),
            },
            "voice-stopped" => Self::VoiceStopped {
                timestamp: get_i64(data, "timestamp"),
            },
            "transcript" => Self::Transcript {
                text: get_str(data, "text").unwrap_or_default(),
            },
            "synthesize" => Self::Synthesize {
                text: get_str(data, "text").unwrap_or_default(),
                voice: data.get("voice").cloned(),
            },
            "error" => Self::Error {
                text: get_str(data, "text").unwrap_or_default(),
                code: get_str(data, "code"),
            },
            "run-pipeline" => {
                // Unusable stages keep the frame intact for forwarding.
                let start_stage = get_str(data, "start_stage")
                    .as_deref()
                    .and_then(PipelineStage::from_str)?;
                let end_stage = get_str(data, "end_stage")
                    .as_deref()
                    .and_then(PipelineStage::from_str)?;
                Self::RunPipeline {
                    start_stage,
                    end_stage,
                    name: get_str(data, "name"),
                    restart_on_end: data
                        .get("restart_on_end")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    snd_format: data
                        .get("snd_format")
                        .and_then(Value::as_object)
                        .map(get_format),
                }
            }
            "describe" => Self::Describe,
            "info" => Self::Info { data: data.clone() },
            "timer-started" => Self::TimerStarted { data: data.clone() },
            "timer-updated" => Self::TimerUpdated { data: data.clone() },
            "timer-cancelled" => Self::TimerCancelled { data: data.clone() },
            "timer-finished" => Self::TimerFinished { data: data.clone() },
            "streaming-started" => Self::StreamingStarted,
            "streaming-stopped" => Self::StreamingStopped,
            "played" => Self::Played,
            "satellite-connected" => Self::SatelliteConnected,
            "satellite-disconnected" => Self::SatelliteDisconnected,
            _ => return None,
        };
        Some(event)
    }

    /// Encodes this event as a wire frame.
    pub fn to_wire(&self) -> WireEvent {
        let mut data = Map::new();
        let mut payload = None;

        match self {
            Self::Ping { text } | Self::Pong { text } => {
                if let Some(text) = text {
                    data.insert("text".into(), json!(text));
                }
            }
            Self::RunSatellite
            | Self::PauseSatellite
            | Self::Describe
            | Self::StreamingStarted
            | Self::StreamingStopped
            | Self::Played
            | Self::SatelliteConnected
            | Self::SatelliteDisconnected => {}
            Self::AudioStart { format, timestamp } => {
                format_fields(&mut data, format);
                data.insert("timestamp".into(), json!(timestamp));
            }
            Self::AudioChunk {
                format,
                timestamp,
                audio,
            } => {
                format_fields(&mut data, format);
                if let Some(timestamp) = timestamp {
                    data.insert("timestamp".into(), json!(timestamp));
                }
                payload = Some(audio.clone());
            }
            Self::AudioStop { timestamp }
            | Self::VoiceStarted { timestamp }
            | Self::VoiceStopped { timestamp } => {
                if let Some(timestamp) = timestamp {
                    data.insert("timestamp".into(), json!(timestamp));
                }
            }
            Self::Detect { names } => {
                if let Some(names) = names {
                    data.insert("names".into(), json!(names));
                }
            }
            Self::Detection { name, timestamp } => {
                if let Some(name) = name {
                    data.insert("name".into(), json!(name));
                }
                if let Some(timestamp) = timestamp {
                    data.insert("timestamp".into(), json!(timestamp));
                }
            }
            Self::Transcript { text } => {
                data.insert("text".into(), json!(text));
            }
            Self::Synthesize { text, voice } => {
                data.insert("text".into(), json!(text));
                if let Some(voice) = voice {
                    data.insert("voice".into(), voice.clone());
                }
            }
            Self::Error { text, code } => {
                data.insert("text".into(), json!(text));
                if let Some(code) = code {
                    data.insert("code".into(), json!(code));
                }
            }
            Self::RunPipeline {
                start_stage,
                end_stage,
                name,
                restart_on_end,
                snd_format,
            } => {
                data.insert("start_stage".into(), json!(start_stage.as_str()));
                data.insert("end_stage".into(), json!(end_stage.as_str()));
                if let Some(name) = name {
                    data.insert("name".into(), json!(name));
                }
                data.insert("restart_on_end".into(), json!(restart_on_end));
                if let Some(format) = snd_format {
                    data.insert("snd_format".into(), json!(format));
                }
            }
            Self::Info { data: info }
            | Self::TimerStarted { data: info }
            | Self::TimerUpdated { data: info }
            | Self::TimerCancelled { data: info }
            | Self::TimerFinished { data: info } => {
                data = info.clone();
            }
            Self::Other {
                data: other_data,
                payload: other_payload,
                ..
            } => {
                data = other_data.clone();
                payload = other_payload.clone();
            }
        }

        WireEvent {
            event_type: self.event_type().to_string(),
            data,
            payload,
        }
    }
}

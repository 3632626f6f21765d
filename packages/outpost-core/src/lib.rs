//! Outpost Core - shared library for the Outpost voice satellite.
//!
//! Outpost is an edge process that captures microphone audio, cooperates
//! with remote speech pipelines over the Wyoming line-delimited event
//! protocol, optionally performs local wake-word and voice-activity
//! detection, and plays back synthesized speech.
//!
//! # Architecture
//!
//! - [`event`]: wire codec and the typed event model
//! - [`peer`]: connection to a single external service (socket or child)
//! - [`audio`]: chunking, ring buffers, volume, WAV streams, debug recording
//! - [`dsp`]: noise suppression / auto gain and VAD wrappers
//! - [`satellite`]: the actor that owns all state: lifecycle FSM, server
//!   link with keep-alive, peer tasks and the three streaming modes
//! - [`server`]: listener for server connections, single-owner binding
//! - [`settings`]: immutable configuration tree
//! - [`zeroconf`]: optional mDNS registration
//!
//! Peer tasks and connection handlers never touch satellite state directly:
//! they send typed commands into the satellite's channel, and the satellite
//! owns the senders for every peer queue.

#![warn(clippy::all)]

pub mod audio;
pub mod dsp;
pub mod error;
pub mod event;
pub mod peer;
pub mod satellite;
pub mod server;
pub mod settings;
pub mod utils;
pub mod zeroconf;

// Re-export commonly used types at the crate root
pub use error::{SatelliteError, SatelliteResult};
pub use event::{AudioFormat, Event, PipelineStage};
pub use satellite::{Command, Satellite, SatelliteHandle, SoundEvent, State, StreamingMode};
pub use server::Listener;
pub use settings::{
    EventSettings, MicSettings, SatelliteSettings, SndSettings, VadSettings, WakeSettings,
    WakeWordBinding,
};
pub use zeroconf::ZeroconfAdvertiser;

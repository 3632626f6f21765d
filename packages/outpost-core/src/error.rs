//! Centralized error types for the Outpost core library.
//!
//! Peer-facing I/O and framing problems are recoverable (the owning task
//! disconnects and retries); configuration problems are fatal at startup.

use thiserror::Error;

/// Application-wide error type for the satellite.
#[derive(Debug, Error)]
pub enum SatelliteError {
    /// I/O failure on a peer or server connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame on the wire: bad JSON header, negative lengths,
    /// or a stream that ended mid-record.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid or incomplete configuration (bad URI, missing service).
    #[error("Configuration error: {0}")]
    Config(String),

    /// WAV file could not be read or written.
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    /// DSP backend failure (audio processor or VAD model).
    #[error("DSP error: {0}")]
    Dsp(String),
}

impl SatelliteError {
    /// Returns a machine-readable error code for logs and diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "io_error",
            Self::Protocol(_) => "protocol_error",
            Self::Config(_) => "configuration_error",
            Self::Wav(_) => "wav_error",
            Self::Dsp(_) => "dsp_error",
        }
    }

    /// True for errors that the peer reconnect loops recover from locally.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Protocol(_))
    }
}

/// Convenient Result alias for satellite operations.
pub type SatelliteResult<T> = Result<T, SatelliteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_is_transient() {
        let err = SatelliteError::Protocol("truncated payload".into());
        assert_eq!(err.code(), "protocol_error");
        assert!(err.is_transient());
    }

    #[test]
    fn config_error_is_fatal() {
        let err = SatelliteError::Config("no microphone service".into());
        assert_eq!(err.code(), "configuration_error");
        assert!(!err.is_transient());
    }
}

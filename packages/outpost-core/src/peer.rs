//! Connection to a single external service (mic, snd, wake, event).
//!
//! A peer is reachable either through a socket URI (`tcp://host:port`,
//! `unix://path`) or as a spawned child process speaking the event protocol
//! on stdin/stdout. Reconnection policy lives with the owning task; this
//! module only connects, frames and tears down.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::process::{Child, Command};

use crate::error::{SatelliteError, SatelliteResult};
use crate::event::codec::{self, WireEvent};
use crate::event::{AudioFormat, Event};

/// Parsed socket address of a peer service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddress {
    /// `tcp://host:port`
    Tcp(String),
    /// `unix://path`
    #[cfg(unix)]
    Unix(PathBuf),
}

impl PeerAddress {
    pub fn parse(uri: &str) -> SatelliteResult<Self> {
        if let Some(addr) = uri.strip_prefix("tcp://") {
            if addr.is_empty() {
                return Err(SatelliteError::Config(format!("invalid URI: {uri}")));
            }
            return Ok(Self::Tcp(addr.to_string()));
        }
        #[cfg(unix)]
        if let Some(path) = uri.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(SatelliteError::Config(format!("invalid URI: {uri}")));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        Err(SatelliteError::Config(format!(
            "unsupported URI scheme: {uri}"
        )))
    }
}

/// Audio format negotiated with a process peer at spawn time.
#[derive(Debug, Clone, Copy)]
pub struct ProcessAudioConfig {
    pub format: AudioFormat,
    pub samples_per_chunk: usize,
}

/// Recipe for reaching a peer service.
#[derive(Debug, Clone)]
pub enum PeerConnector {
    Socket(PeerAddress),
    Process {
        command: Vec<String>,
        audio: ProcessAudioConfig,
    },
}

impl PeerConnector {
    /// Builds a connector from service settings; a command takes precedence
    /// over a URI, matching the settings `enabled` contract.
    pub fn from_service(
        uri: Option<&str>,
        command: Option<&[String]>,
        audio: ProcessAudioConfig,
    ) -> SatelliteResult<Self> {
        if let Some(command) = command {
            if command.is_empty() {
                return Err(SatelliteError::Config("empty peer command".into()));
            }
            return Ok(Self::Process {
                command: command.to_vec(),
                audio,
            });
        }
        if let Some(uri) = uri {
            return Ok(Self::Socket(PeerAddress::parse(uri)?));
        }
        Err(SatelliteError::Config(
            "peer has neither URI nor command".into(),
        ))
    }

    pub async fn connect(&self) -> SatelliteResult<PeerConnection> {
        match self {
            Self::Socket(PeerAddress::Tcp(addr)) => {
                let stream = TcpStream::connect(addr).await?;
                let (read_half, write_half) = stream.into_split();
                Ok(PeerConnection {
                    reader: PeerReader {
                        reader: Box::new(BufReader::new(read_half)),
                        _child: None,
                    },
                    writer: PeerWriter {
                        writer: Box::new(write_half),
                    },
                })
            }
            #[cfg(unix)]
            Self::Socket(PeerAddress::Unix(path)) => {
                let stream = UnixStream::connect(path).await?;
                let (read_half, write_half) = stream.into_split();
                Ok(PeerConnection {
                    reader: PeerReader {
                        reader: Box::new(BufReader::new(read_half)),
                        _child: None,
                    },
                    writer: PeerWriter {
                        writer: Box::new(write_half),
                    },
                })
            }
            Self::Process { command, audio } => {
                let mut child = Command::new(&command[0])
                    .args(&command[1..])
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| SatelliteError::Config("child has no stdin".into()))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| SatelliteError::Config("child has no stdout".into()))?;

                let mut connection = PeerConnection {
                    reader: PeerReader {
                        reader: Box::new(BufReader::new(stdout)),
                        _child: Some(child),
                    },
                    writer: PeerWriter {
                        writer: Box::new(stdin),
                    },
                };
                connection.send_handshake(audio).await?;
                Ok(connection)
            }
        }
    }
}

/// Read half of a peer connection. Holds the child process (if any) so the
/// child is killed when reading stops.
pub struct PeerReader {
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
    _child: Option<Child>,
}

impl PeerReader {
    /// Reads the next event; `Ok(None)` exactly when the remote closed.
    pub async fn read_event(&mut self) -> SatelliteResult<Option<Event>> {
        Ok(codec::read_event(&mut self.reader)
            .await?
            .map(Event::from_wire))
    }
}

/// Write half of a peer connection.
pub struct PeerWriter {
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl PeerWriter {
    pub async fn write_event(&mut self, event: &Event) -> SatelliteResult<()> {
        codec::write_event(&mut self.writer, &event.to_wire()).await
    }

    /// Best-effort stream shutdown; safe to skip (drop closes the stream).
    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// A live connection to a peer service.
pub struct PeerConnection {
    reader: PeerReader,
    writer: PeerWriter,
}

impl PeerConnection {
    pub async fn read_event(&mut self) -> SatelliteResult<Option<Event>> {
        self.reader.read_event().await
    }

    pub async fn write_event(&mut self, event: &Event) -> SatelliteResult<()> {
        self.writer.write_event(event).await
    }

    /// Splits into independent halves, for tasks that read and write
    /// concurrently (the wake peer).
    pub fn split(self) -> (PeerReader, PeerWriter) {
        (self.reader, self.writer)
    }

    /// Closes the connection, killing any child process.
    pub async fn shutdown(mut self) {
        self.writer.shutdown().await;
    }

    /// Publishes the negotiated audio format to a spawned child so it can
    /// emit (or expect) matching `audio-chunk` frames.
    async fn send_handshake(&mut self, audio: &ProcessAudioConfig) -> SatelliteResult<()> {
        codec::write_event(&mut self.writer.writer, &handshake_event(audio)).await
    }
}

/// The `describe` frame sent to a spawned child, carrying the audio format
/// the child is expected to speak.
fn handshake_event(audio: &ProcessAudioConfig) -> WireEvent {
    let mut data = serde_json::Map::new();
    data.insert("rate".into(), audio.format.rate.into());
    data.insert("width".into(), audio.format.width.into());
    data.insert("channels".into(), audio.format.channels.into());
    data.insert(
        "samples_per_chunk".into(),
        (audio.samples_per_chunk as u64).into(),
    );
    WireEvent {
        event_type: "describe".into(),
        data,
        payload: None,
    }
}

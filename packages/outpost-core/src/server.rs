//! Server-facing listener: accepts connections from the remote
//! conversational server and enforces single-owner binding.
//!
//! Each accepted connection gets a handler task and a monotonic-nanosecond
//! client id. A handler answers `describe` itself (after refreshing wake
//! info through the satellite) and passes everything else to the satellite,
//! which decides ownership: the first connection to send a non-describe
//! event owns the satellite until it disconnects.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::SatelliteResult;
use crate::event::codec::{self, WireEvent};
use crate::event::Event;
use crate::peer::PeerAddress;
use crate::satellite::{Command, ServerWriter};
use crate::utils::now_nanos;

/// How long a `describe` reply waits for refreshed wake info.
const INFO_TIMEOUT: Duration = Duration::from_secs(2);

/// Listening socket for server connections.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    /// Binds `tcp://host:port` or `unix://path`.
    pub async fn bind(uri: &str) -> SatelliteResult<Self> {
        match PeerAddress::parse(uri)? {
            PeerAddress::Tcp(addr) => Ok(Self::Tcp(TcpListener::bind(addr).await?)),
            #[cfg(unix)]
            PeerAddress::Unix(path) => {
                // A previous run may have left the socket file behind.
                let _ = std::fs::remove_file(&path);
                Ok(Self::Unix(UnixListener::bind(path)?))
            }
        }
    }

    /// The bound TCP port, if listening on TCP (used for zeroconf).
    pub fn tcp_port(&self) -> Option<u16> {
        match self {
            Self::Tcp(listener) => listener.local_addr().ok().map(|addr| addr.port()),
            #[cfg(unix)]
            Self::Unix(_) => None,
        }
    }

    /// Accept loop; spawns one handler task per connection.
    pub async fn run(self, commands: mpsc::UnboundedSender<Command>, cancel: CancellationToken) {
        match self {
            Self::Tcp(listener) => loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            log::debug!("Server connection from {}", addr);
                            let (read_half, write_half) = stream.into_split();
                            tokio::spawn(handle_connection(
                                read_half,
                                write_half,
                                commands.clone(),
                                cancel.child_token(),
                            ));
                        }
                        Err(err) => {
                            log::warn!("Accept failed: {}", err);
                        }
                    },
                }
            },
            #[cfg(unix)]
            Self::Unix(listener) => loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let (read_half, write_half) = stream.into_split();
                            tokio::spawn(handle_connection(
                                read_half,
                                write_half,
                                commands.clone(),
                                cancel.child_token(),
                            ));
                        }
                        Err(err) => {
                            log::warn!("Accept failed: {}", err);
                        }
                    },
                }
            },
        }
    }
}

/// Per-connection handler. Exits when the connection closes, the satellite
/// refuses ownership, or the listener is cancelled.
pub(crate) async fn handle_connection<R, W>(
    read_half: R,
    write_half: W,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let client_id = now_nanos();
    log::debug!("Client connected: {}", client_id);

    let mut reader = BufReader::new(read_half);
    let writer: ServerWriter = Arc::new(Mutex::new(Box::new(write_half)));

    loop {
        let wire = tokio::select! {
            _ = cancel.cancelled() => break,
            wire = codec::read_event(&mut reader) => wire,
        };

        match wire {
            Ok(Some(wire)) => {
                let event = Event::from_wire(wire);
                if matches!(event, Event::Describe) {
                    if !send_info(&commands, &writer).await {
                        break;
                    }
                    continue;
                }

                let (accept_tx, accept_rx) = oneshot::channel();
                if commands
                    .send(Command::FromServer {
                        client_id,
                        writer: Arc::clone(&writer),
                        event,
                        accept: accept_tx,
                    })
                    .is_err()
                {
                    break; // satellite is gone
                }
                match accept_rx.await {
                    Ok(true) => {}
                    Ok(false) => {
                        // Another connection owns the satellite.
                        log::debug!("Connection cancelled: {}", client_id);
                        break;
                    }
                    Err(_) => break,
                }
            }
            Ok(None) => break,
            Err(err) => {
                log::warn!("Bad frame from server connection: {}", err);
                break;
            }
        }
    }

    let _ = commands.send(Command::ServerDisconnected { client_id });
    log::debug!("Client disconnected: {}", client_id);
}

/// Replies to `describe`: asks the satellite to refresh wake info, falling
/// back to the current info if the wake service does not answer in time.
async fn send_info(
    commands: &mpsc::UnboundedSender<Command>,
    writer: &ServerWriter,
) -> bool {
    let (reply_tx, reply_rx) = oneshot::channel();
    if commands
        .send(Command::UpdateInfo { reply: reply_tx })
        .is_err()
    {
        return false;
    }

    let info = match timeout(INFO_TIMEOUT, reply_rx).await {
        Ok(Ok(info)) => Some(info),
        Ok(Err(_)) => None,
        Err(_) => {
            // Wake service did not answer; serve what we have.
            let (reply_tx, reply_rx) = oneshot::channel();
            if commands.send(Command::GetInfo { reply: reply_tx }).is_err() {
                return false;
            }
            reply_rx.await.ok()
        }
    };
    let Some(info) = info else {
        return false;
    };

    let result = {
        let mut guard = writer.lock().await;
        codec::write_event(
            &mut *guard,
            &WireEvent {
                event_type: "info".into(),
                data: info,
                payload: None,
            },
        )
        .await
    };
    if let Err(err) = result {
        log::warn!("Could not send info: {}", err);
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use tokio::io::AsyncWriteExt;

    /// Minimal stand-in for the satellite actor: answers info requests and
    /// accepts or refuses ownership by client id.
    async fn fake_satellite(
        mut commands: mpsc::UnboundedReceiver<Command>,
        owner: Option<u64>,
    ) -> Vec<String> {
        let mut seen = Vec::new();
        while let Some(command) = commands.recv().await {
            match command {
                Command::UpdateInfo { reply } | Command::GetInfo { reply } => {
                    let mut info = Map::new();
                    info.insert("satellite".into(), json!({"name": "test"}));
                    let _ = reply.send(info);
                }
                Command::FromServer {
                    client_id,
                    event,
                    accept,
                    ..
                } => {
                    seen.push(event.event_type().to_string());
                    let _ = accept.send(owner.map_or(true, |owner| owner == client_id));
                }
                Command::ServerDisconnected { .. } => {
                    seen.push("disconnected".to_string());
                    break;
                }
                _ => {}
            }
        }
        seen
    }

    #[tokio::test]
    async fn describe_gets_info_reply() {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let satellite = tokio::spawn(fake_satellite(commands_rx, None));

        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let handler = tokio::spawn(handle_connection(
            server_read,
            server_write,
            commands_tx,
            CancellationToken::new(),
        ));

        let (client_read, mut client_write) = tokio::io::split(client);
        let mut client_reader = BufReader::new(client_read);

        codec::write_event(&mut client_write, &Event::Describe.to_wire())
            .await
            .unwrap();
        let info = codec::read_event(&mut client_reader).await.unwrap().unwrap();
        assert_eq!(info.event_type, "info");
        assert_eq!(
            info.data.get("satellite"),
            Some(&json!({"name": "test"}))
        );

        // Closing the connection reports the disconnect.
        client_write.shutdown().await.unwrap();
        drop(client_write);
        drop(client_reader);
        handler.await.unwrap();
        assert_eq!(satellite.await.unwrap(), vec!["disconnected"]);
    }

    #[tokio::test]
    async fn refused_ownership_closes_connection() {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        // Satellite is owned by some other connection id.
        let satellite = tokio::spawn(fake_satellite(commands_rx, Some(1)));

        let (client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let handler = tokio::spawn(handle_connection(
            server_read,
            server_write,
            commands_tx,
            CancellationToken::new(),
        ));

        let (_client_read, mut client_write) = tokio::io::split(client);
        codec::write_event(&mut client_write, &Event::RunSatellite.to_wire())
            .await
            .unwrap();

        // Handler must hang up on its own after the refusal.
        handler.await.unwrap();
        let seen = satellite.await.unwrap();
        assert_eq!(seen, vec!["run-satellite", "disconnected"]);
    }

    #[tokio::test]
    async fn binds_tcp_and_reports_port() {
        let listener = Listener::bind("tcp://127.0.0.1:0").await.unwrap();
        let port = listener.tcp_port().unwrap();
        assert_ne!(port, 0);
    }
}

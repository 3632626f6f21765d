//! End-to-end tests for the satellite state machines.
//!
//! Most tests drive the satellite directly through `handle_command`, with
//! the server writer backed by an in-memory duplex stream. Tests that need
//! the run loop (keep-alive timers, live peer tasks) spawn `run()` and talk
//! to real TCP peers bound to ephemeral ports.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Map, Value};
use tokio::io::{BufReader, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time;

use super::*;
use crate::dsp::SpeechDetector;
use crate::event::codec;
use crate::settings::{EventSettings, MicSettings, SndSettings, WakeSettings, WakeWordBinding};

const CHUNK_BYTES: usize = 1024; // one 512-sample VAD frame

fn mic_chunk(fill: u8) -> Event {
    Event::AudioChunk {
        format: AudioFormat::default(),
        timestamp: None,
        audio: Bytes::from(vec![fill; CHUNK_BYTES]),
    }
}

/// In-memory server connection: the satellite writes into one end of a
/// duplex pipe, the test reads events from the other.
struct TestServer {
    writer: ServerWriter,
    reader: BufReader<DuplexStream>,
}

impl TestServer {
    fn new() -> Self {
        let (satellite_side, test_side) = tokio::io::duplex(1 << 16);
        Self {
            writer: Arc::new(Mutex::new(Box::new(satellite_side))),
            reader: BufReader::new(test_side),
        }
    }

    async fn next_event(&mut self) -> Event {
        let wire = time::timeout(Duration::from_secs(2), codec::read_event(&mut self.reader))
            .await
            .expect("timed out waiting for server event")
            .expect("read error")
            .expect("server stream closed");
        Event::from_wire(wire)
    }

    async fn expect_silence(&mut self) {
        let result =
            time::timeout(Duration::from_millis(200), codec::read_event(&mut self.reader)).await;
        assert!(result.is_err(), "unexpected event: {result:?}");
    }
}

/// Sends a server event through the ownership path, returning whether the
/// satellite accepted this client.
async fn from_server(
    satellite: &mut Satellite,
    client_id: u64,
    server: &TestServer,
    event: Event,
) -> bool {
    let (accept_tx, accept_rx) = oneshot::channel();
    satellite
        .handle_command(Command::FromServer {
            client_id,
            writer: Arc::clone(&server.writer),
            event,
            accept: accept_tx,
        })
        .await
        .unwrap();
    accept_rx.await.unwrap()
}

fn satellite_info() -> Map<String, Value> {
    let mut info = Map::new();
    info.insert("satellite".into(), json!({"name": "test satellite"}));
    info
}

// ─────────────────────────────────────────────────────────────────────────────
// Always streaming
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn always_streaming_happy_path() {
    let satellite = Satellite::new(SatelliteSettings::default(), satellite_info()).unwrap();
    let mut handle = satellite.handle();
    let commands = handle.commands();
    let run = tokio::spawn(satellite.run());

    let mut server = TestServer::new();
    let (accept_tx, accept_rx) = oneshot::channel();
    commands
        .send(Command::FromServer {
            client_id: 1,
            writer: Arc::clone(&server.writer),
            event: Event::RunSatellite,
            accept: accept_tx,
        })
        .unwrap();
    assert!(accept_rx.await.unwrap());

    // No wake, no VAD: the pipeline starts at the server's wake stage and
    // restarts on end.
    match server.next_event().await {
        Event::RunPipeline {
            start_stage,
            end_stage,
            restart_on_end,
            snd_format,
            ..
        } => {
            assert_eq!(start_stage, PipelineStage::Wake);
            assert_eq!(end_stage, PipelineStage::Handle);
            assert!(restart_on_end);
            assert!(snd_format.is_none());
        }
        other => panic!("expected run-pipeline, got {other:?}"),
    }

    // Mic audio streams straight through.
    let chunk = mic_chunk(1);
    commands.send(Command::FromMic(chunk.clone())).unwrap();
    assert_eq!(server.next_event().await, chunk);

    // A transcript does not interrupt the stream.
    let (accept_tx, accept_rx) = oneshot::channel();
    commands
        .send(Command::FromServer {
            client_id: 1,
            writer: Arc::clone(&server.writer),
            event: Event::Transcript { text: "ok".into() },
            accept: accept_tx,
        })
        .unwrap();
    assert!(accept_rx.await.unwrap());
    let chunk = mic_chunk(2);
    commands.send(Command::FromMic(chunk.clone())).unwrap();
    assert_eq!(server.next_event().await, chunk);

    handle.stop().await;
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn always_mode_gates_on_run_and_pause() {
    let mut satellite = Satellite::new(SatelliteSettings::default(), satellite_info()).unwrap();
    let mut server = TestServer::new();

    // Before run-satellite: nothing is streamed.
    assert!(from_server(&mut satellite, 1, &server, Event::Ping { text: None }).await);
    assert!(matches!(server.next_event().await, Event::Pong { .. }));
    satellite.event_from_mic(mic_chunk(1)).await;
    server.expect_silence().await;

    assert!(from_server(&mut satellite, 1, &server, Event::RunSatellite).await);
    assert!(matches!(
        server.next_event().await,
        Event::RunPipeline { .. }
    ));
    satellite.event_from_mic(mic_chunk(2)).await;
    assert_eq!(server.next_event().await, mic_chunk(2));

    // Pause drops mic audio again.
    assert!(from_server(&mut satellite, 1, &server, Event::PauseSatellite).await);
    satellite.event_from_mic(mic_chunk(3)).await;
    server.expect_silence().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Wake streaming
// ─────────────────────────────────────────────────────────────────────────────

fn wake_settings() -> SatelliteSettings {
    SatelliteSettings {
        wake: WakeSettings {
            uri: Some("tcp://127.0.0.1:10400".into()),
            names: vec![WakeWordBinding {
                name: "ok_nabu".into(),
                pipeline: Some("Kitchen".into()),
            }],
            refractory_seconds: Some(5.0),
            ..WakeSettings::default()
        },
        mic: MicSettings {
            uri: Some("tcp://127.0.0.1:10600".into()),
            ..MicSettings::default()
        },
        ..SatelliteSettings::default()
    }
}

#[tokio::test(start_paused = true)]
async fn wake_detection_with_refractory() {
    let mut satellite = Satellite::new(wake_settings(), satellite_info()).unwrap();

    // Observe the wake service queue directly.
    let (wake_tx, mut wake_rx) = mpsc::unbounded_channel();
    satellite.wake_tx = Some(wake_tx);

    let mut server = TestServer::new();
    assert!(from_server(&mut satellite, 1, &server, Event::RunSatellite).await);

    // Returning to waiting re-sends the detect request.
    match wake_rx.recv().await.unwrap() {
        Event::Detect { names } => assert_eq!(names, Some(vec!["ok_nabu".to_string()])),
        other => panic!("expected detect, got {other:?}"),
    }

    // Mic audio goes to the wake service, not the server.
    satellite.event_from_mic(mic_chunk(1)).await;
    assert_eq!(wake_rx.recv().await.unwrap(), mic_chunk(1));
    server.expect_silence().await;

    // Detection: forwarded to the server, then the pipeline request with
    // the bound pipeline name resolved via normalization.
    let detection = Event::Detection {
        name: Some("ok_nabu_v0.1".into()),
        timestamp: None,
    };
    satellite.event_from_wake(detection.clone()).await;
    assert_eq!(server.next_event().await, detection);
    match server.next_event().await {
        Event::RunPipeline {
            start_stage,
            end_stage,
            name,
            restart_on_end,
            ..
        } => {
            assert_eq!(start_stage, PipelineStage::Asr);
            assert_eq!(end_stage, PipelineStage::Handle);
            assert_eq!(name.as_deref(), Some("Kitchen"));
            assert!(!restart_on_end);
        }
        other => panic!("expected run-pipeline, got {other:?}"),
    }
    assert!(satellite.is_streaming);

    // Mic audio now streams to the server.
    satellite.event_from_mic(mic_chunk(2)).await;
    assert_eq!(server.next_event().await, mic_chunk(2));

    // Back to waiting after the transcript; detect is re-sent.
    assert!(from_server(&mut satellite, 1, &server, Event::Transcript { text: "ok".into() }).await);
    assert!(!satellite.is_streaming);
    assert!(matches!(
        wake_rx.recv().await.unwrap(),
        Event::Detect { .. }
    ));

    // A second detection inside the refractory window is dropped.
    satellite.event_from_wake(detection.clone()).await;
    assert!(!satellite.is_streaming);
    server.expect_silence().await;

    // After the refractory period it is accepted again.
    time::advance(Duration::from_secs(6)).await;
    satellite.event_from_wake(detection.clone()).await;
    assert!(satellite.is_streaming);
    assert_eq!(server.next_event().await, detection);
}

#[tokio::test]
async fn wake_detection_needs_server_and_waiting_state() {
    let mut satellite = Satellite::new(wake_settings(), satellite_info()).unwrap();
    let detection = Event::Detection {
        name: None,
        timestamp: None,
    };

    // No server bound: ignored.
    satellite.event_from_wake(detection.clone()).await;
    assert!(!satellite.is_streaming);

    let server = TestServer::new();
    assert!(from_server(&mut satellite, 1, &server, Event::RunSatellite).await);

    // Paused: ignored.
    assert!(from_server(&mut satellite, 1, &server, Event::PauseSatellite).await);
    satellite.event_from_wake(detection.clone()).await;
    assert!(!satellite.is_streaming);

    // Resumed: accepted.
    assert!(from_server(&mut satellite, 1, &server, Event::RunSatellite).await);
    satellite.event_from_wake(detection).await;
    assert!(satellite.is_streaming);
}

// ─────────────────────────────────────────────────────────────────────────────
// VAD streaming
// ─────────────────────────────────────────────────────────────────────────────

fn vad_satellite(probabilities: Vec<f32>, trigger_level: u32) -> Satellite {
    let mut satellite =
        Satellite::new(SatelliteSettings::default(), satellite_info()).unwrap();
    // Swap in a scripted detector so tests are independent of the model.
    satellite.mode = StreamingMode::Vad;
    satellite.settings.vad.enabled = true;
    satellite.settings.vad.wake_word_timeout = Some(5.0);
    satellite.vad = Some(SpeechDetector::scripted(probabilities, 0.5, trigger_level));
    satellite.vad_prebuffer = Some(RingBuffer::new(4 * CHUNK_BYTES));
    satellite
}

#[tokio::test(start_paused = true)]
async fn vad_gates_streaming_with_preroll() {
    let mut satellite = vad_satellite(vec![0.0, 0.0, 0.9, 0.9], 2);
    let mut server = TestServer::new();
    assert!(from_server(&mut satellite, 1, &server, Event::RunSatellite).await);

    // Silence: buffered, nothing streamed.
    satellite.event_from_mic(mic_chunk(1)).await;
    satellite.event_from_mic(mic_chunk(2)).await;
    server.expect_silence().await;

    // First speech frame: activation 1 of 2, still buffered.
    satellite.event_from_mic(mic_chunk(3)).await;
    server.expect_silence().await;

    // Second speech frame fires the trigger.
    satellite.event_from_mic(mic_chunk(4)).await;
    match server.next_event().await {
        Event::RunPipeline {
            start_stage,
            restart_on_end,
            ..
        } => {
            assert_eq!(start_stage, PipelineStage::Wake);
            assert!(!restart_on_end);
        }
        other => panic!("expected run-pipeline, got {other:?}"),
    }

    // Pre-roll: one chunk holding everything up to the trigger.
    match server.next_event().await {
        Event::AudioChunk { audio, .. } => {
            let mut expected = Vec::new();
            for fill in 1..=3u8 {
                expected.extend_from_slice(&vec![fill; CHUNK_BYTES]);
            }
            assert_eq!(&audio[..], &expected[..]);
        }
        other => panic!("expected pre-roll chunk, got {other:?}"),
    }
    // Then the triggering chunk itself.
    assert_eq!(server.next_event().await, mic_chunk(4));

    // No wake word within the timeout: audio-stop, back to waiting.
    time::advance(Duration::from_secs(6)).await;
    satellite.event_from_mic(mic_chunk(5)).await;
    assert_eq!(
        server.next_event().await,
        Event::AudioStop { timestamp: None }
    );
    assert!(!satellite.is_streaming);
    server.expect_silence().await;
}

#[tokio::test]
async fn vad_pause_resets_to_waiting() {
    let mut satellite = vad_satellite(vec![0.9, 0.9], 1);
    let mut server = TestServer::new();
    assert!(from_server(&mut satellite, 1, &server, Event::RunSatellite).await);

    satellite.event_from_mic(mic_chunk(1)).await;
    assert!(satellite.is_streaming);
    assert!(matches!(
        server.next_event().await,
        Event::RunPipeline { .. }
    ));
    assert_eq!(server.next_event().await, mic_chunk(1)); // pre-roll is empty

    assert!(from_server(&mut satellite, 1, &server, Event::PauseSatellite).await);
    assert!(!satellite.is_streaming);
    assert!(satellite.vad_timeout_deadline.is_none());

    // Paused: mic audio is ignored entirely.
    satellite.event_from_mic(mic_chunk(2)).await;
    server.expect_silence().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Server binding & keep-alive
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn single_owner_server_binding() {
    let mut satellite = Satellite::new(SatelliteSettings::default(), satellite_info()).unwrap();
    let first = TestServer::new();
    let second = TestServer::new();

    assert!(from_server(&mut satellite, 1, &first, Event::RunSatellite).await);
    // A different connection is refused while the first owns the satellite.
    assert!(!from_server(&mut satellite, 2, &second, Event::RunSatellite).await);
    // Events from the owner still flow.
    assert!(from_server(&mut satellite, 1, &first, Event::PauseSatellite).await);

    // Once the owner disconnects, the next connection takes over.
    satellite
        .handle_command(Command::ServerDisconnected { client_id: 1 })
        .await
        .unwrap();
    assert!(from_server(&mut satellite, 2, &second, Event::RunSatellite).await);
}

#[tokio::test]
async fn clear_server_broadcasts_disconnect_once() {
    let mut satellite = Satellite::new(SatelliteSettings::default(), satellite_info()).unwrap();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    satellite.event_tx = Some(event_tx);

    let server = TestServer::new();
    assert!(from_server(&mut satellite, 1, &server, Event::RunSatellite).await);

    satellite
        .handle_command(Command::ServerDisconnected { client_id: 1 })
        .await
        .unwrap();
    satellite
        .handle_command(Command::ServerDisconnected { client_id: 1 })
        .await
        .unwrap();

    let mut disconnects = 0;
    while let Ok(event) = event_rx.try_recv() {
        if matches!(event, Event::SatelliteDisconnected) {
            disconnects += 1;
        }
    }
    assert_eq!(disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn ping_timeout_releases_binding() {
    let satellite = Satellite::new(SatelliteSettings::default(), satellite_info()).unwrap();
    let mut handle = satellite.handle();
    let commands = handle.commands();
    let run = tokio::spawn(satellite.run());

    let mut server = TestServer::new();
    let (accept_tx, accept_rx) = oneshot::channel();
    commands
        .send(Command::FromServer {
            client_id: 1,
            writer: Arc::clone(&server.writer),
            event: Event::Ping {
                text: Some("hi".into()),
            },
            accept: accept_tx,
        })
        .unwrap();
    assert!(accept_rx.await.unwrap());

    // The ping is answered with a matching pong, and keep-alive starts.
    assert_eq!(
        server.next_event().await,
        Event::Pong {
            text: Some("hi".into())
        }
    );
    assert_eq!(server.next_event().await, Event::Ping { text: None });

    // Never answer: the binding must be released, letting a new
    // connection take over.
    time::sleep(Duration::from_secs(8)).await;

    let second = TestServer::new();
    let (accept_tx, accept_rx) = oneshot::channel();
    commands
        .send(Command::FromServer {
            client_id: 2,
            writer: Arc::clone(&second.writer),
            event: Event::RunSatellite,
            accept: accept_tx,
        })
        .unwrap();
    assert!(accept_rx.await.unwrap());

    handle.stop().await;
    run.await.unwrap().unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Live peers (snd + event fan-out)
// ─────────────────────────────────────────────────────────────────────────────

/// Accepts one connection and collects event types until the stream closes
/// or `last` is seen.
async fn collect_peer_events(listener: TcpListener, last: &str) -> Vec<String> {
    let (stream, _) = listener.accept().await.unwrap();
    let (read_half, _write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut seen = Vec::new();
    while let Ok(Some(wire)) = codec::read_event(&mut reader).await {
        let done = wire.event_type == last;
        seen.push(wire.event_type);
        if done {
            break;
        }
    }
    seen
}

#[tokio::test]
async fn snd_playback_completion_reports_played() {
    let snd_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let event_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let settings = SatelliteSettings {
        snd: SndSettings {
            uri: Some(format!("tcp://{}", snd_listener.local_addr().unwrap())),
            ..SndSettings::default()
        },
        event: EventSettings {
            uri: Some(format!("tcp://{}", event_listener.local_addr().unwrap())),
            ..EventSettings::default()
        },
        ..SatelliteSettings::default()
    };

    let snd_peer = tokio::spawn(collect_peer_events(snd_listener, "audio-stop"));
    let event_peer = tokio::spawn(collect_peer_events(event_listener, "played"));

    let satellite = Satellite::new(settings, satellite_info()).unwrap();
    let mut handle = satellite.handle();
    let commands = handle.commands();
    let run = tokio::spawn(satellite.run());

    let server = TestServer::new();
    for event in [
        Event::AudioStart {
            format: AudioFormat::new(22_050, 2, 1),
            timestamp: 0,
        },
        Event::AudioChunk {
            format: AudioFormat::new(22_050, 2, 1),
            timestamp: None,
            audio: Bytes::from(vec![0u8; 64]),
        },
        Event::AudioStop { timestamp: None },
    ] {
        let (accept_tx, accept_rx) = oneshot::channel();
        commands
            .send(Command::FromServer {
                client_id: 1,
                writer: Arc::clone(&server.writer),
                event,
                accept: accept_tx,
            })
            .unwrap();
        assert!(accept_rx.await.unwrap());
    }

    // The snd peer sees all three audio events in order.
    let snd_events = time::timeout(Duration::from_secs(5), snd_peer)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snd_events, vec!["audio-start", "audio-chunk", "audio-stop"]);

    // The event peer sees start/stop and the final played notification,
    // but never raw audio chunks.
    let event_events = time::timeout(Duration::from_secs(5), event_peer)
        .await
        .unwrap()
        .unwrap();
    assert!(event_events.contains(&"satellite-connected".to_string()));
    assert!(event_events.contains(&"audio-start".to_string()));
    assert!(event_events.contains(&"audio-stop".to_string()));
    assert_eq!(event_events.last().map(String::as_str), Some("played"));
    assert!(!event_events.contains(&"audio-chunk".to_string()));

    handle.stop().await;
    run.await.unwrap().unwrap();
}

#[tokio::test]
async fn describe_reply_merges_wake_info() {
    // Fake wake service: answers describe requests with wake info.
    let wake_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let wake_uri = format!("tcp://{}", wake_listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (stream, _) = wake_listener.accept().await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        while let Ok(Some(wire)) = codec::read_event(&mut reader).await {
            if wire.event_type == "describe" {
                let mut data = Map::new();
                data.insert("wake".into(), json!([{"name": "nabu-wake"}]));
                codec::write_event(
                    &mut write_half,
                    &codec::WireEvent {
                        event_type: "info".into(),
                        data,
                        payload: None,
                    },
                )
                .await
                .unwrap();
            }
        }
    });

    let settings = SatelliteSettings {
        wake: WakeSettings {
            uri: Some(wake_uri),
            ..WakeSettings::default()
        },
        mic: MicSettings {
            uri: Some("tcp://127.0.0.1:10600".into()),
            ..MicSettings::default()
        },
        ..SatelliteSettings::default()
    };
    let satellite = Satellite::new(settings, satellite_info()).unwrap();
    let mut handle = satellite.handle();
    let commands = handle.commands();
    let run = tokio::spawn(satellite.run());

    // Give the wake task a moment to connect (a describe queued before the
    // connection exists is dropped with the stale queue).
    time::sleep(Duration::from_millis(250)).await;

    let (reply_tx, reply_rx) = oneshot::channel();
    commands.send(Command::UpdateInfo { reply: reply_tx }).unwrap();
    let info = time::timeout(Duration::from_secs(2), reply_rx)
        .await
        .expect("timed out waiting for info")
        .unwrap();

    assert_eq!(info.get("satellite"), Some(&json!({"name": "test satellite"})));
    assert_eq!(info.get("wake"), Some(&json!([{"name": "nabu-wake"}])));

    handle.stop().await;
    run.await.unwrap().unwrap();
}

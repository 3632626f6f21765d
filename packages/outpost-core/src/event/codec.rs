//! Wire framing for the line-delimited event protocol.
//!
//! Each frame is a single JSON header object terminated by `\n`. If the
//! header declares `data_length: D`, a second JSON object of exactly `D`
//! bytes follows and is merged into `data` (an escape hatch for oversized
//! headers). If it declares `payload_length: P`, exactly `P` raw bytes
//! follow in the same position, after any `data_length` continuation.

use bytes::Bytes;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{SatelliteError, SatelliteResult};

/// A raw protocol frame: type string, JSON data, optional binary payload.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEvent {
    pub event_type: String,
    pub data: Map<String, Value>,
    pub payload: Option<Bytes>,
}

/// Validates and extracts a declared length field from the header.
fn length_field(header: &Map<String, Value>, key: &str) -> SatelliteResult<Option<usize>> {
    let Some(value) = header.get(key) else {
        return Ok(None);
    };
    match value.as_i64() {
        Some(len) if len >= 0 => Ok(Some(len as usize)),
        _ => Err(SatelliteError::Protocol(format!(
            "invalid {key}: {value}"
        ))),
    }
}

/// Reads exactly `len` bytes, mapping early end-of-stream to a protocol error.
async fn read_exact_or_protocol<R>(reader: &mut R, len: usize, what: &str) -> SatelliteResult<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            SatelliteError::Protocol(format!("stream ended while reading {what} ({len} bytes)"))
        } else {
            SatelliteError::Io(err)
        }
    })?;
    Ok(buf)
}

/// Reads the next event frame. Returns `Ok(None)` when the stream ends
/// cleanly before a header line.
pub async fn read_event<R>(reader: &mut R) -> SatelliteResult<Option<WireEvent>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .await
        .map_err(|err| match err.kind() {
            std::io::ErrorKind::InvalidData => {
                SatelliteError::Protocol("header is not valid UTF-8".into())
            }
            _ => SatelliteError::Io(err),
        })?;
    if read == 0 {
        return Ok(None);
    }

    let header: Value = serde_json::from_str(line.trim_end())
        .map_err(|err| SatelliteError::Protocol(format!("malformed header: {err}")))?;
    let header = header
        .as_object()
        .ok_or_else(|| SatelliteError::Protocol("header is not a JSON object".into()))?;
    let event_type = header
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| SatelliteError::Protocol("header is missing \"type\"".into()))?
        .to_string();

    let mut data = match header.get("data") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };

    if let Some(data_length) = length_field(header, "data_length")? {
        let buf = read_exact_or_protocol(reader, data_length, "data").await?;
        let extra: Value = serde_json::from_slice(&buf)
            .map_err(|err| SatelliteError::Protocol(format!("malformed data object: {err}")))?;
        let extra = extra
            .as_object()
            .ok_or_else(|| SatelliteError::Protocol("data is not a JSON object".into()))?;
        for (key, value) in extra {
            data.insert(key.clone(), value.clone());
        }
    }

    let payload = match length_field(header, "payload_length")? {
        Some(payload_length) => Some(Bytes::from(
            read_exact_or_protocol(reader, payload_length, "payload").await?,
        )),
        None => None,
    };

    Ok(Some(WireEvent {
        event_type,
        data,
        payload,
    }))
}

/// Writes one event frame. Writes to a single peer must be serialized by
/// the caller: one writer, one logical producer at a time.
pub async fn write_event<W>(writer: &mut W, event: &WireEvent) -> SatelliteResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = Map::new();
    header.insert("type".into(), json!(event.event_type));
    if !event.data.is_empty() {
        header.insert("data".into(), Value::Object(event.data.clone()));
    }
    if let Some(payload) = &event.payload {
        header.insert("payload_length".into(), json!(payload.len()));
    }

    let mut frame = serde_json::to_vec(&Value::Object(header))
        .map_err(|err| SatelliteError::Protocol(format!("unserializable header: {err}")))?;
    frame.push(b'\n');
    if let Some(payload) = &event.payload {
        frame.extend_from_slice(payload);
    }

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

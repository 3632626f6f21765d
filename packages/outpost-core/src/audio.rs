//! Audio plumbing: fixed-size chunking, pre-roll ring buffer, PCM volume
//! scaling, channel selection, WAV playback streams and debug recording.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{SatelliteError, SatelliteResult};
use crate::event::{AudioFormat, Event};
use crate::utils::now_nanos;

/// Fixed-capacity byte accumulator with a variable length.
///
/// Used to reassemble caller chunks into the fixed frame sizes the DSP
/// backends require; any tail shorter than a frame stays here until the
/// next call.
#[derive(Debug)]
pub struct AudioBuffer {
    buffer: Vec<u8>,
    length: usize,
}

impl AudioBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity],
            length: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.length = 0;
    }

    /// Appends bytes; errors if the buffer would overflow its capacity.
    pub fn append(&mut self, data: &[u8]) -> SatelliteResult<()> {
        if self.length + data.len() > self.buffer.len() {
            return Err(SatelliteError::Dsp(format!(
                "audio buffer overflow: {} + {} > {}",
                self.length,
                data.len(),
                self.buffer.len()
            )));
        }
        self.buffer[self.length..self.length + data.len()].copy_from_slice(data);
        self.length += data.len();
        Ok(())
    }

    /// The valid prefix of the buffer.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer[..self.length])
    }
}

/// Fixed-capacity byte ring with drop-oldest overflow.
///
/// Keeps the most recent `capacity` bytes pushed through it; used for the
/// VAD pre-roll and for the wake debug recording window.
#[derive(Debug)]
pub struct RingBuffer {
    data: Vec<u8>,
    capacity: usize,
    write_pos: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Pushes bytes, overwriting the oldest content when full.
    pub fn put(&mut self, bytes: &[u8]) {
        if self.capacity == 0 {
            return;
        }
        // Only the final `capacity` bytes of oversized input can survive.
        let bytes = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };
        for &b in bytes {
            self.data[self.write_pos] = b;
            self.write_pos = (self.write_pos + 1) % self.capacity;
            if self.len < self.capacity {
                self.len += 1;
            }
        }
    }

    /// Contents in chronological order (oldest first).
    pub fn to_bytes(&self) -> Bytes {
        if self.len < self.capacity {
            Bytes::copy_from_slice(&self.data[..self.len])
        } else {
            let mut out = BytesMut::with_capacity(self.capacity);
            out.extend_from_slice(&self.data[self.write_pos..]);
            out.extend_from_slice(&self.data[..self.write_pos]);
            out.freeze()
        }
    }

    pub fn clear(&mut self) {
        self.write_pos = 0;
        self.len = 0;
    }
}

/// Splits `samples` into fixed-size blocks, carrying any short tail across
/// calls in `leftover`. Feeding `a ++ b` produces the same blocks as feeding
/// `a` then `b` with the same leftover buffer.
pub fn chunk_samples(
    samples: &[u8],
    bytes_per_chunk: usize,
    leftover: &mut AudioBuffer,
) -> Vec<Bytes> {
    let mut chunks = Vec::new();

    if leftover.len() + samples.len() < bytes_per_chunk {
        // Not enough for a full chunk yet.
        let _ = leftover.append(samples);
        return chunks;
    }

    let mut next = 0;
    if !leftover.is_empty() {
        let to_copy = bytes_per_chunk - leftover.len();
        let _ = leftover.append(&samples[..to_copy]);
        next = to_copy;
        chunks.push(leftover.to_bytes());
        leftover.clear();
    }

    while next + bytes_per_chunk <= samples.len() {
        chunks.push(Bytes::copy_from_slice(&samples[next..next + bytes_per_chunk]));
        next += bytes_per_chunk;
    }

    if next < samples.len() {
        let _ = leftover.append(&samples[next..]);
    }

    chunks
}

/// Scales signed 16-bit little-endian PCM by a constant, saturating at the
/// i16 range. The input length must be a multiple of 2.
pub fn multiply_volume(audio: &[u8], multiplier: f32) -> Bytes {
    debug_assert!(audio.len() % 2 == 0, "PCM byte length must be even");

    let mut out = BytesMut::with_capacity(audio.len());
    for pair in audio.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        let scaled = (f32::from(sample) * multiplier)
            .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
        out.put_i16_le(scaled);
    }
    out.freeze()
}

/// Picks one channel out of interleaved 16-bit PCM, returning mono audio.
pub fn select_channel(audio: &[u8], channels: u16, channel_index: u16) -> Bytes {
    let channels = usize::from(channels.max(1));
    let channel_index = usize::from(channel_index).min(channels - 1);
    let frame_bytes = channels * 2;

    let mut out = BytesMut::with_capacity(audio.len() / channels);
    for frame in audio.chunks_exact(frame_bytes) {
        let offset = channel_index * 2;
        out.extend_from_slice(&frame[offset..offset + 2]);
    }
    out.freeze()
}

/// Loads a WAV file as a finite event stream: `AudioStart`, `AudioChunk`...,
/// `AudioStop`, with cumulative millisecond timestamps. Returns the events
/// and the total audio duration (used to time microphone muting while a cue
/// plays). Only 16-bit PCM is supported.
pub fn wav_to_events(
    wav_path: &Path,
    samples_per_chunk: usize,
    volume_multiplier: f32,
) -> SatelliteResult<(Vec<Event>, Duration)> {
    let mut reader = hound::WavReader::open(wav_path)?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
        return Err(hound::Error::Unsupported.into());
    }

    let format = AudioFormat::new(spec.sample_rate, 2, spec.channels);
    let samples: Vec<i16> = reader
        .samples::<i16>()
        .collect::<Result<_, _>>()
        .map_err(SatelliteError::from)?;

    let mut events = Vec::new();
    let mut timestamp: i64 = 0;
    events.push(Event::AudioStart {
        format,
        timestamp: 0,
    });

    // One chunk holds `samples_per_chunk` frames across all channels.
    let chunk_samples = samples_per_chunk.max(1) * usize::from(spec.channels);
    for chunk in samples.chunks(chunk_samples) {
        let mut audio = BytesMut::with_capacity(chunk.len() * 2);
        for &sample in chunk {
            audio.put_i16_le(sample);
        }
        let mut audio = audio.freeze();
        if (volume_multiplier - 1.0).abs() > f32::EPSILON {
            audio = multiply_volume(&audio, volume_multiplier);
        }

        let frames = chunk.len() / usize::from(spec.channels);
        events.push(Event::AudioChunk {
            format,
            timestamp: Some(timestamp),
            audio,
        });
        timestamp += (frames as i64) * 1000 / i64::from(spec.sample_rate);
    }

    events.push(Event::AudioStop {
        timestamp: Some(timestamp),
    });

    let total_frames = samples.len() / usize::from(spec.channels);
    let duration = Duration::from_secs_f64(total_frames as f64 / f64::from(spec.sample_rate));
    Ok((events, duration))
}

/// Writes mic audio to timestamped WAV files for debugging.
///
/// Each session writes `<dir>/<nanoseconds>-<suffix>.wav`. With a ring size
/// configured, `write` stores into the ring and `stop` flushes it, so only
/// the last few seconds around an event are kept on disk.
pub struct DebugAudioWriter {
    dir: PathBuf,
    suffix: String,
    format: AudioFormat,
    ring_size: Option<usize>,
    ring: Option<RingBuffer>,
    writer: Option<hound::WavWriter<std::io::BufWriter<std::fs::File>>>,
    wav_path: Option<PathBuf>,
}

impl DebugAudioWriter {
    pub fn new(
        dir: impl Into<PathBuf>,
        suffix: impl Into<String>,
        format: AudioFormat,
        ring_size: Option<usize>,
    ) -> Self {
        Self {
            dir: dir.into(),
            suffix: suffix.into(),
            format,
            ring_size,
            ring: None,
            writer: None,
            wav_path: None,
        }
    }

    /// Starts a new recording session, closing any previous one. Failures
    /// are logged and disable the session; they never affect the satellite.
    pub fn start(&mut self, timestamp_ns: Option<u64>) {
        self.stop();

        let timestamp = timestamp_ns.unwrap_or_else(now_nanos);
        let path = self.dir.join(format!("{}-{}.wav", timestamp, self.suffix));
        if let Err(err) = std::fs::create_dir_all(&self.dir) {
            log::warn!("Could not create {}: {}", self.dir.display(), err);
            return;
        }

        let spec = hound::WavSpec {
            channels: self.format.channels,
            sample_rate: self.format.rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        match hound::WavWriter::create(&path, spec) {
            Ok(writer) => {
                log::debug!("Started recording to {}", path.display());
                self.writer = Some(writer);
                self.wav_path = Some(path);
                self.ring = self.ring_size.map(RingBuffer::new);
            }
            Err(err) => {
                log::warn!("Could not record to {}: {}", path.display(), err);
            }
        }
    }

    /// Appends audio to the active session (no-op when not recording).
    pub fn write(&mut self, audio: &[u8]) {
        if self.writer.is_none() {
            return;
        }
        if let Some(ring) = &mut self.ring {
            ring.put(audio);
        } else if let Some(writer) = &mut self.writer {
            Self::write_samples(writer, audio);
        }
    }

    /// Finalizes the active session, flushing any ring-buffered audio.
    pub fn stop(&mut self) {
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        if let Some(ring) = self.ring.take() {
            Self::write_samples(&mut writer, &ring.to_bytes());
        }
        if let Err(err) = writer.finalize() {
            log::warn!("Could not finalize debug recording: {}", err);
        }
        if let Some(path) = self.wav_path.take() {
            log::debug!("Stopped recording to {}", path.display());
        }
    }

    fn write_samples(
        writer: &mut hound::WavWriter<std::io::BufWriter<std::fs::File>>,
        audio: &[u8],
    ) {
        for pair in audio.chunks_exact(2) {
            if let Err(err) = writer.write_sample(i16::from_le_bytes([pair[0], pair[1]])) {
                log::warn!("Debug recording write failed: {}", err);
                return;
            }
        }
    }
}

impl Drop for DebugAudioWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_buffer_rejects_overflow() {
        let mut buffer = AudioBuffer::new(4);
        buffer.append(&[1, 2, 3]).unwrap();
        assert!(buffer.append(&[4, 5]).is_err());
        assert_eq!(buffer.len(), 3);
        assert_eq!(&buffer.to_bytes()[..], &[1, 2, 3]);

        buffer.clear();
        assert!(buffer.is_empty());
        buffer.append(&[9, 9, 9, 9]).unwrap();
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn chunker_keeps_leftover_across_calls() {
        let mut leftover = AudioBuffer::new(4);

        let chunks = chunk_samples(&[1, 2, 3, 4, 5, 6], 4, &mut leftover);
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0][..], &[1, 2, 3, 4]);
        assert_eq!(leftover.len(), 2);

        let chunks = chunk_samples(&[7, 8, 9], 4, &mut leftover);
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0][..], &[5, 6, 7, 8]);
        assert_eq!(leftover.len(), 1);
    }

    #[test]
    fn chunker_is_associative_under_concatenation() {
        let data: Vec<u8> = (0u8..50).collect();
        let (a, b) = data.split_at(17);

        let mut leftover = AudioBuffer::new(8);
        let mut split_chunks = chunk_samples(a, 8, &mut leftover);
        split_chunks.extend(chunk_samples(b, 8, &mut leftover));
        let split_tail = leftover.to_bytes();

        let mut leftover = AudioBuffer::new(8);
        let whole_chunks = chunk_samples(&data, 8, &mut leftover);
        let whole_tail = leftover.to_bytes();

        assert_eq!(split_chunks, whole_chunks);
        assert_eq!(split_tail, whole_tail);
    }

    #[test]
    fn volume_saturates_at_i16_bounds() {
        let audio: Vec<u8> = [30_000i16, -30_000, 100]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let scaled = multiply_volume(&audio, 10.0);
        let samples: Vec<i16> = scaled
            .chunks_exact(2)
            .map(|p| i16::from_le_bytes([p[0], p[1]]))
            .collect();
        assert_eq!(samples, vec![32_767, -32_768, 1_000]);
    }

    #[test]
    fn volume_identity_is_lossless() {
        let audio: Vec<u8> = [1234i16, -1234, 0]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        assert_eq!(&multiply_volume(&audio, 1.0)[..], &audio[..]);
    }

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut ring = RingBuffer::new(4);
        ring.put(&[1, 2, 3]);
        assert_eq!(&ring.to_bytes()[..], &[1, 2, 3]);

        ring.put(&[4, 5, 6]);
        assert_eq!(ring.len(), 4);
        assert_eq!(&ring.to_bytes()[..], &[3, 4, 5, 6]);
    }

    #[test]
    fn ring_buffer_handles_oversized_input() {
        let mut ring = RingBuffer::new(3);
        ring.put(&[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(&ring.to_bytes()[..], &[5, 6, 7]);
    }

    #[test]
    fn channel_selection_deinterleaves() {
        // Two channels: L = 1, 3; R = 2, 4.
        let audio: Vec<u8> = [1i16, 2, 3, 4].iter().flat_map(|s| s.to_le_bytes()).collect();
        let left = select_channel(&audio, 2, 0);
        let right = select_channel(&audio, 2, 1);

        let to_samples = |bytes: &Bytes| -> Vec<i16> {
            bytes
                .chunks_exact(2)
                .map(|p| i16::from_le_bytes([p[0], p[1]]))
                .collect()
        };
        assert_eq!(to_samples(&left), vec![1, 3]);
        assert_eq!(to_samples(&right), vec![2, 4]);
    }

    fn write_test_wav(path: &Path, rate: u32, samples: &[i16]) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &sample in samples {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn wav_events_have_start_chunks_stop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cue.wav");
        // 1600 samples @ 16 kHz = 100 ms.
        write_test_wav(&path, 16_000, &vec![100i16; 1600]);

        let (events, duration) = wav_to_events(&path, 1024, 1.0).unwrap();
        assert_eq!(duration, Duration::from_millis(100));

        assert!(matches!(events.first(), Some(Event::AudioStart { .. })));
        assert!(matches!(
            events.last(),
            Some(Event::AudioStop {
                timestamp: Some(100)
            })
        ));

        let chunks: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                Event::AudioChunk {
                    timestamp, audio, ..
                } => Some((timestamp.unwrap(), audio.len())),
                _ => None,
            })
            .collect();
        // 1600 samples in 1024-sample chunks: 1024 + 576.
        assert_eq!(chunks, vec![(0, 2048), (64, 1152)]);
    }

    #[test]
    fn debug_writer_ring_keeps_recent_audio() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DebugAudioWriter::new(
            dir.path(),
            "wake",
            AudioFormat::default(),
            Some(4), // two samples
        );

        writer.start(Some(42));
        let audio: Vec<u8> = [1i16, 2, 3, 4].iter().flat_map(|s| s.to_le_bytes()).collect();
        writer.write(&audio);
        writer.stop();

        let path = dir.path().join("42-wake.wav");
        let mut reader = hound::WavReader::open(&path).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples, vec![3, 4]);
    }

    #[test]
    fn debug_writer_stop_without_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DebugAudioWriter::new(dir.path(), "stt", AudioFormat::default(), None);
        writer.stop();
        writer.write(&[0, 0]);
    }
}

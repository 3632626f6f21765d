//! DSP wrappers: webrtc noise suppression / auto gain and silero voice
//! activity detection with a hysteresis trigger.
//!
//! Both backends want fixed frame sizes; arbitrary caller chunks are
//! reassembled through a leftover [`AudioBuffer`].

use bytes::{BufMut, Bytes, BytesMut};
use voice_activity_detector::VoiceActivityDetector;
use webrtc_audio_processing::{
    Config, GainControl, GainControlMode, InitializationConfig, NoiseSuppression,
    NoiseSuppressionLevel, Processor,
};

use crate::audio::{chunk_samples, AudioBuffer};
use crate::error::{SatelliteError, SatelliteResult};

/// Mic audio rate expected by both DSP backends.
const DSP_RATE: u32 = 16_000;

/// webrtc operates on 10 ms ticks: 160 samples at 16 kHz mono.
const ENHANCER_FRAME_SAMPLES: usize = 160;
const ENHANCER_FRAME_BYTES: usize = ENHANCER_FRAME_SAMPLES * 2;

/// Silero's internal chunk size at 16 kHz.
const VAD_FRAME_SAMPLES: usize = 512;
const VAD_FRAME_BYTES: usize = VAD_FRAME_SAMPLES * 2;

fn frame_to_i16(frame: &[u8]) -> Vec<i16> {
    frame
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Noise suppression and automatic gain control for mic input.
///
/// Levels follow the upstream ranges: noise suppression 0-4 (off to very
/// high), auto gain 0-31 (off, or the AGC target level in -dBFS).
pub struct MicEnhancer {
    processor: Processor,
    leftover: AudioBuffer,
}

impl MicEnhancer {
    pub fn new(auto_gain: u32, noise_suppression: u32) -> SatelliteResult<Self> {
        let mut processor = Processor::new(&InitializationConfig {
            num_capture_channels: 1,
            num_render_channels: 1,
            ..InitializationConfig::default()
        })
        .map_err(|err| SatelliteError::Dsp(format!("audio processor: {err:?}")))?;

        let mut config = Config::default();
        if noise_suppression > 0 {
            config.noise_suppression = Some(NoiseSuppression {
                suppression_level: match noise_suppression {
                    1 => NoiseSuppressionLevel::Low,
                    2 => NoiseSuppressionLevel::Moderate,
                    3 => NoiseSuppressionLevel::High,
                    _ => NoiseSuppressionLevel::VeryHigh,
                },
            });
        }
        if auto_gain > 0 {
            config.gain_control = Some(GainControl {
                mode: GainControlMode::AdaptiveDigital,
                target_level_dbfs: auto_gain.min(31) as i32,
                compression_gain_db: 9,
                enable_limiter: true,
            });
        }
        processor.set_config(config);

        Ok(Self {
            processor,
            leftover: AudioBuffer::new(ENHANCER_FRAME_BYTES),
        })
    }

    /// Processes 16 kHz 16-bit mono PCM in 10 ms ticks, returning the
    /// concatenated clean frames. Sub-frame tails carry to the next call.
    pub fn process(&mut self, audio: &[u8]) -> Bytes {
        let mut clean = BytesMut::with_capacity(audio.len());
        for frame in chunk_samples(audio, ENHANCER_FRAME_BYTES, &mut self.leftover) {
            let mut samples: Vec<f32> = frame_to_i16(&frame)
                .into_iter()
                .map(|s| f32::from(s) / 32_768.0)
                .collect();
            if let Err(err) = self.processor.process_capture_frame(&mut samples) {
                log::warn!("Audio enhancement failed: {:?}", err);
                clean.extend_from_slice(&frame);
                continue;
            }
            for sample in samples {
                clean.put_i16_le((sample.clamp(-1.0, 1.0) * 32_767.0) as i16);
            }
        }
        clean.freeze()
    }
}

/// Hysteresis around raw speech probabilities.
///
/// Each frame at or above `threshold` bumps the activation counter; when it
/// reaches `trigger_level` the trigger fires and resets. Frames below the
/// threshold decay the counter toward zero.
#[derive(Debug)]
pub struct VadTrigger {
    threshold: f32,
    trigger_level: u32,
    activation: u32,
}

impl VadTrigger {
    pub fn new(threshold: f32, trigger_level: u32) -> Self {
        Self {
            threshold,
            trigger_level: trigger_level.max(1),
            activation: 0,
        }
    }

    /// Feeds one frame probability; true when the trigger fires.
    pub fn update(&mut self, probability: f32) -> bool {
        if probability >= self.threshold {
            self.activation += 1;
            if self.activation >= self.trigger_level {
                self.activation = 0;
                return true;
            }
        } else {
            self.activation = self.activation.saturating_sub(1);
        }
        false
    }

    pub fn reset(&mut self) {
        self.activation = 0;
    }
}

enum VadEngine {
    Silero(VoiceActivityDetector),
    /// Scripted probabilities for deterministic tests.
    #[cfg(test)]
    Scripted(std::collections::VecDeque<f32>),
}

impl VadEngine {
    fn silero() -> SatelliteResult<Self> {
        let detector = VoiceActivityDetector::builder()
            .sample_rate(DSP_RATE as i64)
            .chunk_size(VAD_FRAME_SAMPLES)
            .build()
            .map_err(|err| SatelliteError::Dsp(format!("VAD model: {err}")))?;
        Ok(Self::Silero(detector))
    }

    fn predict(&mut self, samples: Vec<i16>) -> f32 {
        match self {
            Self::Silero(detector) => detector.predict(samples),
            #[cfg(test)]
            Self::Scripted(probabilities) => probabilities.pop_front().unwrap_or(0.0),
        }
    }

    fn reset(&mut self) {
        match self {
            Self::Silero(_) => {
                // The model carries internal state between frames; rebuild it
                // so a new utterance starts from scratch.
                if let Ok(fresh) = Self::silero() {
                    *self = fresh;
                }
            }
            #[cfg(test)]
            Self::Scripted(_) => {}
        }
    }
}

/// Speech detection over arbitrary-size PCM buffers.
///
/// Splits input into the detector's 512-sample frames (leftover carried
/// across calls) and runs each probability through the hysteresis trigger.
pub struct SpeechDetector {
    engine: VadEngine,
    trigger: VadTrigger,
    leftover: AudioBuffer,
}

impl SpeechDetector {
    pub fn new(threshold: f32, trigger_level: u32) -> SatelliteResult<Self> {
        Ok(Self {
            engine: VadEngine::silero()?,
            trigger: VadTrigger::new(threshold, trigger_level),
            leftover: AudioBuffer::new(VAD_FRAME_BYTES),
        })
    }

    #[cfg(test)]
    pub(crate) fn scripted(
        probabilities: impl IntoIterator<Item = f32>,
        threshold: f32,
        trigger_level: u32,
    ) -> Self {
        Self {
            engine: VadEngine::Scripted(probabilities.into_iter().collect()),
            trigger: VadTrigger::new(threshold, trigger_level),
            leftover: AudioBuffer::new(VAD_FRAME_BYTES),
        }
    }

    /// Feeds audio; true if speech triggered within this buffer.
    pub fn detect(&mut self, audio: &[u8]) -> bool {
        let mut triggered = false;
        for frame in chunk_samples(audio, VAD_FRAME_BYTES, &mut self.leftover) {
            let probability = self.engine.predict(frame_to_i16(&frame));
            if self.trigger.update(probability) {
                triggered = true;
            }
        }
        triggered
    }

    /// Clears activation, buffered tail and detector state.
    pub fn reset(&mut self) {
        self.trigger.reset();
        self.leftover.clear();
        self.engine.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_level_one_fires_per_speech_frame() {
        let mut trigger = VadTrigger::new(0.5, 1);
        assert!(trigger.update(0.5));
        assert!(!trigger.update(0.49));
        assert!(trigger.update(0.9));
    }

    #[test]
    fn trigger_level_requires_consecutive_activation() {
        let mut trigger = VadTrigger::new(0.5, 3);
        assert!(!trigger.update(0.8));
        assert!(!trigger.update(0.8));
        assert!(trigger.update(0.8));
        // Counter reset after firing.
        assert!(!trigger.update(0.8));
    }

    #[test]
    fn silence_decays_activation() {
        let mut trigger = VadTrigger::new(0.5, 2);
        assert!(!trigger.update(0.8));
        assert!(!trigger.update(0.1)); // decays to 0
        assert!(!trigger.update(0.8)); // back to 1
        assert!(trigger.update(0.8));
    }

    #[test]
    fn reset_clears_activation() {
        let mut trigger = VadTrigger::new(0.5, 2);
        assert!(!trigger.update(0.8));
        trigger.reset();
        assert!(!trigger.update(0.8));
        assert!(trigger.update(0.8));
    }

    #[test]
    fn detector_buffers_sub_frame_input() {
        let mut detector = SpeechDetector::scripted([1.0], 0.5, 1);
        // Half a frame: no prediction yet.
        assert!(!detector.detect(&vec![0u8; VAD_FRAME_BYTES / 2]));
        // Second half completes the frame and fires.
        assert!(detector.detect(&vec![0u8; VAD_FRAME_BYTES / 2]));
    }

    #[test]
    fn detector_honors_trigger_level() {
        let mut detector = SpeechDetector::scripted([0.9, 0.9, 0.9], 0.5, 2);
        let frame = vec![0u8; VAD_FRAME_BYTES];
        assert!(!detector.detect(&frame));
        assert!(detector.detect(&frame));
    }
}

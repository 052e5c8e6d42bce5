//! Audio reference stages.
//!
//! Real codecs are external collaborators; these stages implement the
//! core's contracts (bounded work, shape translation, reconfiguration)
//! with byte-preserving payload transforms, so a pipeline built purely
//! from the core is testable end to end.

use crate::error::Result;
use crate::filter::{FilterType, Progress, Stage, StageIo};
use crate::frame::{AudioCodec, FrameShape, SampleFormat};
use serde_json::json;

/// Decoder: encoded audio in, raw PCM out.
pub struct AudioDecoderStage {
    sample_rate: u32,
    channels: u32,
    scratch: Vec<u8>,
    presentation_us: u64,
    sequence: u64,
}

impl AudioDecoderStage {
    /// Create a decoder producing 48 kHz stereo S16 PCM.
    pub fn new() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            scratch: Vec::new(),
            presentation_us: 0,
            sequence: 0,
        }
    }
}

impl Default for AudioDecoderStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for AudioDecoderStage {
    fn kind(&self) -> FilterType {
        FilterType::AudioDecoder
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        if io.writer_count() == 0 {
            return Ok(Progress::Idle);
        }
        {
            let Some(reader) = io.first_reader() else {
                return Ok(Progress::Idle);
            };
            let Some(front) = reader.front() else {
                return Ok(Progress::Idle);
            };
            self.scratch.clear();
            self.scratch.extend_from_slice(front.payload());
            self.presentation_us = front.presentation_us();
            self.sequence = front.sequence();
            front.release();
        }

        let Some(writer) = io.first_writer() else {
            return Ok(Progress::Worked);
        };
        if let Some(mut slot) = writer.rear() {
            slot.fill_from(&self.scratch);
            slot.set_presentation_us(self.presentation_us);
            slot.set_sequence(self.sequence);
            slot.mark_updated();
            slot.commit();
        }
        Ok(Progress::Worked)
    }

    fn output_shape(&self) -> FrameShape {
        FrameShape::Audio {
            sample_rate: self.sample_rate,
            channels: self.channels,
            sample_format: SampleFormat::S16,
            codec: AudioCodec::Pcm,
        }
    }

    fn describe(&self, state: &mut serde_json::Map<String, serde_json::Value>) {
        state.insert("sampleRate".into(), json!(self.sample_rate));
        state.insert("channels".into(), json!(self.channels));
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Encoder: raw PCM in, encoded audio out.
///
/// Reconfiguration replaces codec, channel count and sample rate in one
/// step; the pipeline manager drives it through the path-replacement
/// composite operation so the stage is never reconfigured mid-wire.
pub struct AudioEncoderStage {
    codec: AudioCodec,
    channels: u32,
    sample_rate: u32,
    scratch: Vec<u8>,
    presentation_us: u64,
    sequence: u64,
}

impl AudioEncoderStage {
    /// Create an encoder with the default configuration (AAC, stereo,
    /// 48 kHz).
    pub fn new() -> Self {
        Self {
            codec: AudioCodec::Aac,
            channels: 2,
            sample_rate: 48_000,
            scratch: Vec::new(),
            presentation_us: 0,
            sequence: 0,
        }
    }

    /// The configured codec.
    pub fn codec(&self) -> AudioCodec {
        self.codec
    }
}

impl Default for AudioEncoderStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for AudioEncoderStage {
    fn kind(&self) -> FilterType {
        FilterType::AudioEncoder
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        if io.writer_count() == 0 {
            return Ok(Progress::Idle);
        }
        {
            let Some(reader) = io.first_reader() else {
                return Ok(Progress::Idle);
            };
            let Some(front) = reader.front() else {
                return Ok(Progress::Idle);
            };
            self.scratch.clear();
            self.scratch.extend_from_slice(front.payload());
            self.presentation_us = front.presentation_us();
            self.sequence = front.sequence();
            front.release();
        }

        let Some(writer) = io.first_writer() else {
            return Ok(Progress::Worked);
        };
        if let Some(mut slot) = writer.rear() {
            slot.fill_from(&self.scratch);
            slot.set_presentation_us(self.presentation_us);
            slot.set_sequence(self.sequence);
            slot.mark_updated();
            slot.commit();
        }
        Ok(Progress::Worked)
    }

    fn output_shape(&self) -> FrameShape {
        FrameShape::Audio {
            sample_rate: self.sample_rate,
            channels: self.channels,
            sample_format: SampleFormat::S16,
            codec: self.codec,
        }
    }

    fn describe(&self, state: &mut serde_json::Map<String, serde_json::Value>) {
        state.insert("codec".into(), json!(self.codec.token()));
        state.insert("sampleRate".into(), json!(self.sample_rate));
        state.insert("channels".into(), json!(self.channels));
    }

    fn reconfigure_audio(&mut self, codec: AudioCodec, channels: u32, sample_rate: u32) -> bool {
        self.codec = codec;
        self.channels = channels;
        self.sample_rate = sample_rate;
        true
    }
}

// ============================================================================
// Mixer
// ============================================================================

/// Mixer: raw PCM from every reader port, saturating-summed into one
/// output frame per call.
pub struct AudioMixerStage {
    sample_rate: u32,
    channels: u32,
    mix: Vec<i16>,
    sequence: u64,
}

impl AudioMixerStage {
    /// Create a mixer producing 48 kHz stereo S16 PCM.
    pub fn new() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            mix: Vec::new(),
            sequence: 0,
        }
    }
}

impl Default for AudioMixerStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for AudioMixerStage {
    fn kind(&self) -> FilterType {
        FilterType::AudioMixer
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        if io.writer_count() == 0 {
            return Ok(Progress::Idle);
        }

        self.mix.clear();
        let mut mixed_any = false;
        let mut presentation_us = u64::MAX;

        for (_, reader) in io.readers() {
            let Some(front) = reader.front() else { continue };
            let payload = front.payload();
            let samples = payload.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]]));
            if self.mix.len() < payload.len() / 2 {
                self.mix.resize(payload.len() / 2, 0);
            }
            for (acc, sample) in self.mix.iter_mut().zip(samples) {
                *acc = acc.saturating_add(sample);
            }
            presentation_us = presentation_us.min(front.presentation_us());
            front.release();
            mixed_any = true;
        }

        if !mixed_any {
            return Ok(Progress::Idle);
        }

        let Some(writer) = io.first_writer() else {
            return Ok(Progress::Worked);
        };
        if let Some(mut slot) = writer.rear() {
            let buf = slot.buffer_mut();
            let n = (self.mix.len() * 2).min(buf.len());
            for (i, sample) in self.mix.iter().take(n / 2).enumerate() {
                buf[i * 2..i * 2 + 2].copy_from_slice(&sample.to_le_bytes());
            }
            slot.set_len(n);
            slot.set_presentation_us(presentation_us);
            slot.set_sequence(self.sequence);
            slot.mark_updated();
            slot.commit();
            self.sequence += 1;
        }
        Ok(Progress::Worked)
    }

    fn output_shape(&self) -> FrameShape {
        FrameShape::Audio {
            sample_rate: self.sample_rate,
            channels: self.channels,
            sample_format: SampleFormat::S16,
            codec: AudioCodec::Pcm,
        }
    }

    fn describe(&self, state: &mut serde_json::Map<String, serde_json::Value>) {
        state.insert("sampleRate".into(), json!(self.sample_rate));
        state.insert("channels".into(), json!(self.channels));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterNode;
    use crate::stages::testing::{CollectSink, FrameCounterSource};

    #[test]
    fn test_decoder_forwards_payload_and_metadata() {
        let mut src = FilterNode::new(Box::new(FrameCounterSource::new(3)));
        let mut dec = FilterNode::new(Box::new(AudioDecoderStage::new()));
        let (sink_stage, collected) = CollectSink::new();
        let mut sink = FilterNode::new(Box::new(sink_stage));

        src.connect_one_to_one(&mut dec).unwrap();
        dec.connect_one_to_one(&mut sink).unwrap();

        for _ in 0..3 {
            src.process().unwrap();
            dec.process().unwrap();
            sink.process().unwrap();
        }

        let frames = collected.sequences();
        assert_eq!(frames, vec![0, 1, 2]);
    }

    #[test]
    fn test_encoder_reconfigure() {
        let mut enc = AudioEncoderStage::new();
        assert_eq!(enc.codec(), AudioCodec::Aac);
        assert!(enc.reconfigure_audio(AudioCodec::Opus, 2, 48_000));
        assert_eq!(enc.codec(), AudioCodec::Opus);
        match enc.output_shape() {
            FrameShape::Audio { codec, .. } => assert_eq!(codec, AudioCodec::Opus),
            _ => panic!("audio shape expected"),
        }
    }

    #[test]
    fn test_mixer_saturating_sum() {
        let mut src_a = FilterNode::new(Box::new(FrameCounterSource::with_payload(
            1,
            &100i16.to_le_bytes(),
        )));
        let mut src_b = FilterNode::new(Box::new(FrameCounterSource::with_payload(
            1,
            &250i16.to_le_bytes(),
        )));
        let mut mixer = FilterNode::new(Box::new(AudioMixerStage::new()));
        let (sink_stage, collected) = CollectSink::new();
        let mut sink = FilterNode::new(Box::new(sink_stage));

        let r0 = mixer.generate_reader_id();
        src_a.connect_one_to_many(&mut mixer, r0).unwrap();
        let r1 = mixer.generate_reader_id();
        src_b.connect_one_to_many(&mut mixer, r1).unwrap();
        mixer.connect_one_to_one(&mut sink).unwrap();

        src_a.process().unwrap();
        src_b.process().unwrap();
        mixer.process().unwrap();
        sink.process().unwrap();

        let payloads = collected.payloads();
        assert_eq!(payloads.len(), 1);
        let sample = i16::from_le_bytes([payloads[0][0], payloads[0][1]]);
        assert_eq!(sample, 350);
    }

    #[test]
    fn test_mixer_idle_without_input() {
        let mut src = FilterNode::new(Box::new(FrameCounterSource::new(0)));
        let mut mixer = FilterNode::new(Box::new(AudioMixerStage::new()));
        let (sink_stage, _collected) = CollectSink::new();
        let mut sink = FilterNode::new(Box::new(sink_stage));

        let r0 = mixer.generate_reader_id();
        src.connect_one_to_many(&mut mixer, r0).unwrap();
        mixer.connect_one_to_one(&mut sink).unwrap();

        assert_eq!(mixer.process().unwrap(), Progress::Idle);
    }
}

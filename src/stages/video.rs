//! Video reference stages.
//!
//! Same footing as the audio stages: byte-preserving transforms that
//! honor the core contracts. The resampler is the exception; it does a
//! real nearest-neighbor rescale on packed RGB rasters.

use crate::error::Result;
use crate::filter::{FilterType, Progress, Stage, StageIo};
use crate::frame::{FrameShape, PixelFormat, VideoCodec};
use serde_json::json;

/// Decoder: encoded video in, raw raster out.
pub struct VideoDecoderStage {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    scratch: Vec<u8>,
    presentation_us: u64,
    sequence: u64,
}

impl VideoDecoderStage {
    /// Create a decoder producing 1280x720 YUV 4:2:0.
    pub fn new() -> Self {
        Self {
            width: 1280,
            height: 720,
            pixel_format: PixelFormat::Yuv420p,
            scratch: Vec::new(),
            presentation_us: 0,
            sequence: 0,
        }
    }

    /// Set the raster this decoder produces.
    pub fn set_output_raster(&mut self, width: u32, height: u32, pixel_format: PixelFormat) {
        self.width = width;
        self.height = height;
        self.pixel_format = pixel_format;
    }
}

impl Default for VideoDecoderStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for VideoDecoderStage {
    fn kind(&self) -> FilterType {
        FilterType::VideoDecoder
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
        FrameShape::Video {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            codec: VideoCodec::Raw,
        }
    }

    fn describe(&self, state: &mut serde_json::Map<String, serde_json::Value>) {
        state.insert("width".into(), json!(self.width));
        state.insert("height".into(), json!(self.height));
    }
}

// ============================================================================
// Encoder
// ============================================================================

/// Encoder: raw raster in, encoded video out.
pub struct VideoEncoderStage {
    codec: VideoCodec,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    scratch: Vec<u8>,
    presentation_us: u64,
    sequence: u64,
}

impl VideoEncoderStage {
    /// Create an H.264 encoder at 1280x720.
    pub fn new() -> Self {
        Self {
            codec: VideoCodec::H264,
            width: 1280,
            height: 720,
            pixel_format: PixelFormat::Yuv420p,
            scratch: Vec::new(),
            presentation_us: 0,
            sequence: 0,
        }
    }

    /// The configured codec.
    pub fn codec(&self) -> VideoCodec {
        self.codec
    }

    /// Set the output codec.
    pub fn set_codec(&mut self, codec: VideoCodec) {
        self.codec = codec;
    }
}

impl Default for VideoEncoderStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for VideoEncoderStage {
    fn kind(&self) -> FilterType {
        FilterType::VideoEncoder
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
        FrameShape::Video {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            codec: self.codec,
        }
    }

    fn describe(&self, state: &mut serde_json::Map<String, serde_json::Value>) {
        state.insert("codec".into(), json!(self.codec.token()));
        state.insert("width".into(), json!(self.width));
        state.insert("height".into(), json!(self.height));
    }
}

// ============================================================================
// Mixer
// ============================================================================

/// Mixer: drains one raster per reader per call; the lowest-numbered
/// port that has a frame wins the output slot.
///
/// Layout compositing belongs to a full mixer implementation outside
/// the core; this stage keeps the multi-input cadence and ordering
/// semantics testable.
pub struct VideoMixerStage {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    scratch: Vec<u8>,
    sequence: u64,
}

impl VideoMixerStage {
    /// Create a mixer producing 1280x720 YUV 4:2:0.
    pub fn new() -> Self {
        Self {
            width: 1280,
            height: 720,
            pixel_format: PixelFormat::Yuv420p,
            scratch: Vec::new(),
            sequence: 0,
        }
    }
}

impl Default for VideoMixerStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for VideoMixerStage {
    fn kind(&self) -> FilterType {
        FilterType::VideoMixer
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        if io.writer_count() == 0 {
            return Ok(Progress::Idle);
        }

        self.scratch.clear();
        let mut presentation_us = u64::MAX;
        let mut drained = false;

        for (_, reader) in io.readers() {
            let Some(front) = reader.front() else { continue };
            if self.scratch.is_empty() {
                self.scratch.extend_from_slice(front.payload());
            }
            presentation_us = presentation_us.min(front.presentation_us());
            front.release();
            drained = true;
        }

        if !drained {
            return Ok(Progress::Idle);
        }

        let Some(writer) = io.first_writer() else {
            return Ok(Progress::Worked);
        };
        if let Some(mut slot) = writer.rear() {
            slot.fill_from(&self.scratch);
            slot.set_presentation_us(presentation_us);
            slot.set_sequence(self.sequence);
            slot.mark_updated();
            slot.commit();
            self.sequence += 1;
        }
        Ok(Progress::Worked)
    }

    fn output_shape(&self) -> FrameShape {
        FrameShape::Video {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            codec: VideoCodec::Raw,
        }
    }
}

// ============================================================================
// Resampler
// ============================================================================

/// Resampler: nearest-neighbor rescale of packed RGB rasters to a
/// target size; other layouts pass through unscaled.
pub struct VideoResamplerStage {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    scratch: Vec<u8>,
    presentation_us: u64,
    sequence: u64,
}

impl VideoResamplerStage {
    /// Create a resampler targeting 640x360 RGB24.
    pub fn new() -> Self {
        Self {
            width: 640,
            height: 360,
            pixel_format: PixelFormat::Rgb24,
            scratch: Vec::new(),
            presentation_us: 0,
            sequence: 0,
        }
    }

    /// Set the target raster.
    pub fn set_target(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    fn rescale(&self, src: &[u8], src_w: u32, src_h: u32, dst: &mut [u8]) -> usize {
        let (dst_w, dst_h) = (self.width as usize, self.height as usize);
        let (src_w, src_h) = (src_w as usize, src_h as usize);
        let out_len = dst_w * dst_h * 3;
        if src_w == 0 || src_h == 0 || src.len() < src_w * src_h * 3 || dst.len() < out_len {
            return 0;
        }
        for y in 0..dst_h {
            let sy = y * src_h / dst_h;
            for x in 0..dst_w {
                let sx = x * src_w / dst_w;
                let s = (sy * src_w + sx) * 3;
                let d = (y * dst_w + x) * 3;
                dst[d..d + 3].copy_from_slice(&src[s..s + 3]);
            }
        }
        out_len
    }
}

impl Default for VideoResamplerStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for VideoResamplerStage {
    fn kind(&self) -> FilterType {
        FilterType::VideoResampler
    }

    fn process(&mut self, io: &mut StageIo<'_>) -> Result<Progress> {
        if io.writer_count() == 0 {
            return Ok(Progress::Idle);
        }

        let input_raster;
        {
            let Some(reader) = io.first_reader() else {
                return Ok(Progress::Idle);
            };
            input_raster = match reader.queue().shape() {
                FrameShape::Video {
                    width,
                    height,
                    pixel_format: PixelFormat::Rgb24,
                    codec: VideoCodec::Raw,
                } => Some((width, height)),
                _ => None,
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
            let written = match input_raster {
                Some((src_w, src_h)) => {
                    let scratch = std::mem::take(&mut self.scratch);
                    let n = self.rescale(&scratch, src_w, src_h, slot.buffer_mut());
                    self.scratch = scratch;
                    n
                }
                None => 0,
            };
            if written > 0 {
                slot.set_len(written);
            } else {
                slot.fill_from(&self.scratch);
            }
            slot.set_presentation_us(self.presentation_us);
            slot.set_sequence(self.sequence);
            slot.mark_updated();
            slot.commit();
        }
        Ok(Progress::Worked)
    }

    fn output_shape(&self) -> FrameShape {
        FrameShape::Video {
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            codec: VideoCodec::Raw,
        }
    }

    fn describe(&self, state: &mut serde_json::Map<String, serde_json::Value>) {
        state.insert("width".into(), json!(self.width));
        state.insert("height".into(), json!(self.height));
    }
}

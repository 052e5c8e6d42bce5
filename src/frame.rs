//! Frame types: the currency exchanged between filters.
//!
//! A [`Frame`] is a flat byte buffer plus timing metadata. Frames are
//! pre-allocated inside the queue that hosts them and reused slot by
//! slot; producing a frame means overwriting a slot's bytes and
//! committing a length, never allocating.
//!
//! The shape of a frame (audio sample layout or video raster layout) is
//! fixed when the hosting queue is allocated. A stage that changes shape
//! produces into a differently shaped queue.

use serde::{Deserialize, Serialize};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

// ============================================================================
// Codec and sample/pixel format enums
// ============================================================================

/// Audio codec tag carried by encoded audio frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    /// Raw interleaved PCM.
    Pcm,
    /// G.711 mu-law.
    Pcmu,
    /// AAC-LC.
    Aac,
    /// Opus.
    Opus,
    /// MPEG layer III.
    Mp3,
}

impl AudioCodec {
    /// Map a control-plane codec string to the enum.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "pcm" => Some(Self::Pcm),
            "pcmu" => Some(Self::Pcmu),
            "aac" => Some(Self::Aac),
            "opus" => Some(Self::Opus),
            "mp3" => Some(Self::Mp3),
            _ => None,
        }
    }

    /// The control-plane string for this codec.
    pub fn token(self) -> &'static str {
        match self {
            Self::Pcm => "pcm",
            Self::Pcmu => "pcmu",
            Self::Aac => "aac",
            Self::Opus => "opus",
            Self::Mp3 => "mp3",
        }
    }
}

/// Video codec tag carried by encoded video frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    /// Uncompressed raster.
    Raw,
    /// H.264 / AVC.
    H264,
    /// H.265 / HEVC.
    H265,
    /// VP8.
    Vp8,
    /// Motion JPEG.
    Mjpeg,
}

impl VideoCodec {
    /// Map a control-plane codec string to the enum.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "raw" => Some(Self::Raw),
            "h264" => Some(Self::H264),
            "h265" => Some(Self::H265),
            "vp8" => Some(Self::Vp8),
            "mjpeg" => Some(Self::Mjpeg),
            _ => None,
        }
    }

    /// The control-plane string for this codec.
    pub fn token(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::H264 => "h264",
            Self::H265 => "h265",
            Self::Vp8 => "vp8",
            Self::Mjpeg => "mjpeg",
        }
    }
}

/// Audio sample format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    /// Unsigned 8-bit.
    U8,
    /// Signed 16-bit interleaved.
    S16,
    /// Signed 32-bit interleaved.
    S32,
    /// 32-bit float interleaved.
    F32,
    /// Signed 16-bit planar.
    S16P,
    /// 32-bit float planar.
    F32P,
}

impl SampleFormat {
    /// Bytes per sample for one channel.
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 | Self::S16P => 2,
            Self::S32 | Self::F32 | Self::F32P => 4,
        }
    }
}

/// Video pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// Packed 24-bit RGB.
    Rgb24,
    /// Packed 32-bit RGBA.
    Rgba,
    /// Planar YUV 4:2:0.
    Yuv420p,
    /// Planar YUV 4:2:2.
    Yuv422p,
    /// Semi-planar YUV 4:2:0.
    Nv12,
}

impl PixelFormat {
    /// Bytes needed for one frame at the given dimensions.
    pub fn frame_bytes(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            Self::Rgb24 => pixels * 3,
            Self::Rgba => pixels * 4,
            Self::Yuv420p | Self::Nv12 => pixels * 3 / 2,
            Self::Yuv422p => pixels * 2,
        }
    }
}

// ============================================================================
// FrameShape
// ============================================================================

/// Default sample count per audio frame (matches common codec framing).
pub const AUDIO_SAMPLES_PER_FRAME: usize = 1024;

/// Slot capacity for encoded video frames.
const ENCODED_VIDEO_SLOT_BYTES: usize = 512 * 1024;

/// Slot capacity for encoded audio frames.
const ENCODED_AUDIO_SLOT_BYTES: usize = 8 * 1024;

/// Immutable shape of the frames flowing through one edge.
///
/// Shape is read-only for the lifetime of a frame; reshaping requires
/// producing into a queue allocated with the new shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameShape {
    /// Audio frames.
    Audio {
        /// Sample rate in Hz.
        sample_rate: u32,
        /// Channel count.
        channels: u32,
        /// Sample layout.
        sample_format: SampleFormat,
        /// Codec of the payload (`Pcm` means raw samples).
        codec: AudioCodec,
    },
    /// Video frames.
    Video {
        /// Raster width in pixels.
        width: u32,
        /// Raster height in pixels.
        height: u32,
        /// Pixel layout.
        pixel_format: PixelFormat,
        /// Codec of the payload (`Raw` means an uncompressed raster).
        codec: VideoCodec,
    },
}

impl FrameShape {
    /// Default raw audio shape: 48 kHz stereo S16 PCM.
    pub fn raw_audio() -> Self {
        Self::Audio {
            sample_rate: 48_000,
            channels: 2,
            sample_format: SampleFormat::S16,
            codec: AudioCodec::Pcm,
        }
    }

    /// Default raw video shape: 1280x720 YUV 4:2:0.
    pub fn raw_video() -> Self {
        Self::Video {
            width: 1280,
            height: 720,
            pixel_format: PixelFormat::Yuv420p,
            codec: VideoCodec::Raw,
        }
    }

    /// Whether this shape is audio.
    pub fn is_audio(&self) -> bool {
        matches!(self, Self::Audio { .. })
    }

    /// Whether this shape is video.
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video { .. })
    }

    /// Byte capacity a queue slot needs to hold one frame of this shape.
    pub fn slot_capacity(&self) -> usize {
        match *self {
            Self::Audio {
                channels,
                sample_format,
                codec,
                ..
            } => {
                if codec == AudioCodec::Pcm {
                    AUDIO_SAMPLES_PER_FRAME * channels as usize * sample_format.bytes_per_sample()
                } else {
                    ENCODED_AUDIO_SLOT_BYTES
                }
            }
            Self::Video {
                width,
                height,
                pixel_format,
                codec,
            } => {
                if codec == VideoCodec::Raw {
                    pixel_format.frame_bytes(width, height)
                } else {
                    ENCODED_VIDEO_SLOT_BYTES
                }
            }
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

/// A media frame: fixed-capacity byte buffer plus timing metadata.
///
/// The presentation time is the wall-clock instant (microseconds since
/// the Unix epoch) at which the frame should be rendered; it is set by
/// the source and propagated verbatim unless a stage rewrites it. The
/// update timestamp is monotonic and refreshed whenever a stage
/// finalizes a transformation; scheduling uses it to detect staleness,
/// never the presentation time.
pub struct Frame {
    data: Box<[u8]>,
    len: usize,
    presentation_us: u64,
    updated: Instant,
    sequence: u64,
    shape: FrameShape,
}

impl Frame {
    /// Allocate a frame sized for the given shape.
    pub fn new(shape: FrameShape) -> Self {
        Self::with_capacity(shape, shape.slot_capacity())
    }

    /// Allocate a frame with an explicit byte capacity.
    pub fn with_capacity(shape: FrameShape, capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            presentation_us: 0,
            updated: Instant::now(),
            sequence: 0,
            shape,
        }
    }

    /// The committed payload.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The whole writable buffer (up to capacity).
    ///
    /// Producers write here and then call [`set_len`](Self::set_len).
    #[inline]
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Committed payload length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no payload has been committed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Buffer capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Commit the payload length. Clamped to capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.data.len());
    }

    /// Copy `src` into the buffer and commit its length.
    ///
    /// Bytes past capacity are truncated.
    pub fn fill_from(&mut self, src: &[u8]) {
        let n = src.len().min(self.data.len());
        self.data[..n].copy_from_slice(&src[..n]);
        self.len = n;
    }

    /// Presentation time in microseconds since the Unix epoch.
    #[inline]
    pub fn presentation_us(&self) -> u64 {
        self.presentation_us
    }

    /// Set the presentation time.
    #[inline]
    pub fn set_presentation_us(&mut self, us: u64) {
        self.presentation_us = us;
    }

    /// Stamp the presentation time from the wall clock.
    pub fn stamp_presentation_now(&mut self) {
        self.presentation_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
    }

    /// Monotonic instant of the last finalized transformation.
    #[inline]
    pub fn updated(&self) -> Instant {
        self.updated
    }

    /// Refresh the update timestamp. Call when finalizing a frame.
    #[inline]
    pub fn mark_updated(&mut self) {
        self.updated = Instant::now();
    }

    /// Monotonic sequence number within the producing edge.
    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Set the sequence number.
    #[inline]
    pub fn set_sequence(&mut self, seq: u64) {
        self.sequence = seq;
    }

    /// The frame's shape.
    #[inline]
    pub fn shape(&self) -> FrameShape {
        self.shape
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .field("sequence", &self.sequence)
            .field("presentation_us", &self.presentation_us)
            .field("shape", &self.shape)
            .finish()
    }
}

//! Built-in stages.
//!
//! Concrete codecs live outside the core; these are the framework's
//! software reference stages, one per [`FilterType`], plus the two
//! endpoint stages the pipeline manager creates implicitly and a pair
//! of deterministic test stages. Every stage honors the bounded-work
//! `process` contract: at most one frame moves per port per call.

mod audio;
mod endpoints;
mod testing;
mod video;

pub use audio::{AudioDecoderStage, AudioEncoderStage, AudioMixerStage};
pub use endpoints::{
    ReceiverEndpoint, ReceiverHandle, TransmitterEndpoint, TransmitterHandle,
};
pub use testing::{CollectSink, CollectedFrames, FrameCounterSource};
pub use video::{VideoDecoderStage, VideoEncoderStage, VideoMixerStage, VideoResamplerStage};

use crate::filter::{FilterType, Stage};

/// Instantiate the built-in stage for a creatable filter type.
///
/// The two endpoints are not creatable through the factory; the
/// pipeline manager constructs them at startup.
pub fn create_stage(kind: FilterType) -> Option<Box<dyn Stage>> {
    match kind {
        FilterType::VideoDecoder => Some(Box::new(VideoDecoderStage::new())),
        FilterType::VideoEncoder => Some(Box::new(VideoEncoderStage::new())),
        FilterType::VideoMixer => Some(Box::new(VideoMixerStage::new())),
        FilterType::VideoResampler => Some(Box::new(VideoResamplerStage::new())),
        FilterType::AudioDecoder => Some(Box::new(AudioDecoderStage::new())),
        FilterType::AudioEncoder => Some(Box::new(AudioEncoderStage::new())),
        FilterType::AudioMixer => Some(Box::new(AudioMixerStage::new())),
        FilterType::Receiver | FilterType::Transmitter => None,
    }
}

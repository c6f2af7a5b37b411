//! Model collaborator seam
//!
//! The intake pipeline hands a canonical sample to an [`Inference`]
//! implementation and embeds whatever JSON it returns under `Result`.
//! Real models live outside this crate; the probes below describe the
//! sample they received and serve as the default collaborators.

use crate::audio::CanonicalAudio;
use crate::error::Result;
use crate::image::CanonicalImage;
use async_trait::async_trait;
use serde_json::{json, Value};

/// A model consuming one canonical sample.
#[async_trait]
pub trait Inference<S>: Send + Sync {
    async fn infer(&self, sample: S) -> Result<Value>;
}

/// Reports the geometry of a canonical image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShapeProbe;

#[async_trait]
impl Inference<CanonicalImage> for ShapeProbe {
    async fn infer(&self, sample: CanonicalImage) -> Result<Value> {
        let (height, width, channels) = sample.pixels.dim();
        Ok(json!({
            "height": height,
            "width": width,
            "channels": channels,
            "orientation": sample.orientation,
            "channel_order": sample.order.as_str(),
        }))
    }
}

/// Reports length, rate and peak level of a canonical waveform.
#[derive(Debug, Clone, Copy, Default)]
pub struct WaveformProbe;

#[async_trait]
impl Inference<CanonicalAudio> for WaveformProbe {
    async fn infer(&self, sample: CanonicalAudio) -> Result<Value> {
        let peak = sample.samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
        Ok(json!({
            "samples": sample.samples.len(),
            "sample_rate": sample.sample_rate,
            "duration_secs": sample.duration_secs(),
            "peak": peak,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelOrder;
    use ndarray::Array3;

    #[tokio::test]
    async fn test_shape_probe() {
        let sample = CanonicalImage {
            pixels: Array3::zeros((4, 6, 3)),
            order: ChannelOrder::Bgr,
            orientation: 6,
        };
        let result = ShapeProbe.infer(sample).await.unwrap();
        assert_eq!(result["height"], 4);
        assert_eq!(result["width"], 6);
        assert_eq!(result["channels"], 3);
        assert_eq!(result["orientation"], 6);
        assert_eq!(result["channel_order"], "bgr");
    }

    #[tokio::test]
    async fn test_waveform_probe() {
        let sample = CanonicalAudio {
            samples: vec![0.0, -0.5, 0.25, 0.0],
            sample_rate: 16_000,
        };
        let result = WaveformProbe.infer(sample).await.unwrap();
        assert_eq!(result["samples"], 4);
        assert_eq!(result["sample_rate"], 16_000);
        assert_eq!(result["peak"], 0.5);
    }
}

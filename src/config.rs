//! Runtime configuration for the intake service
//!
//! Each endpoint owns its own block so the vision and sonic sides can pick
//! different failure policies. The daemon fills these from CLI flags and
//! environment variables; library users build them directly.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Default sample rate every waveform is brought to before inference.
pub const DEFAULT_TARGET_SAMPLE_RATE: u32 = 16_000;

/// Default request body ceiling (50 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Order of the three color channels in a canonical image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelOrder {
    /// Blue, green, red (OpenCV convention)
    #[default]
    Bgr,
    Rgb,
}

impl ChannelOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelOrder::Bgr => "bgr",
            ChannelOrder::Rgb => "rgb",
        }
    }
}

/// How a 4-channel image loses its alpha channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlphaPolicy {
    /// Composite over black: `c * a / 255`
    #[default]
    Composite,
    /// Drop alpha and keep the color channels untouched
    Discard,
}

/// How malformed input is reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputErrorPolicy {
    /// 200 with the failure envelope, like every other fault
    #[default]
    Envelope,
    /// 400 with `{"detail": "..."}`
    BadRequest,
}

/// Routing strategy of the per-request log capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapturePolicy {
    /// A request only sees events emitted inside its own span.
    #[default]
    Isolated,
    /// Every attached capture sees every observed event while attached,
    /// including lines from other requests in flight.
    Shared,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionConfig {
    pub path: String,
    pub channel_order: ChannelOrder,
    pub alpha: AlphaPolicy,
    /// Rotate/flip the pixels according to EXIF orientation instead of
    /// passing the code along.
    pub apply_orientation: bool,
    pub input_errors: InputErrorPolicy,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            path: "/vision_entrance".to_string(),
            channel_order: ChannelOrder::Bgr,
            alpha: AlphaPolicy::Composite,
            apply_orientation: false,
            input_errors: InputErrorPolicy::Envelope,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SonicConfig {
    pub path: String,
    pub target_sample_rate: u32,
    pub input_errors: InputErrorPolicy,
}

impl Default for SonicConfig {
    fn default() -> Self {
        Self {
            path: "/sonic_entrance".to_string(),
            target_sample_rate: DEFAULT_TARGET_SAMPLE_RATE,
            input_errors: InputErrorPolicy::Envelope,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub policy: CapturePolicy,
    /// Target prefixes whose events are captured. An empty prefix matches
    /// every target.
    pub targets: Vec<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            policy: CapturePolicy::Isolated,
            targets: vec![env!("CARGO_CRATE_NAME").to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    pub vision: VisionConfig,
    pub sonic: SonicConfig,
    pub capture: CaptureConfig,
    pub max_body_bytes: usize,
    /// Answer cross-origin requests from any origin.
    pub cors: bool,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            vision: VisionConfig::default(),
            sonic: SonicConfig::default(),
            capture: CaptureConfig::default(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            cors: false,
        }
    }
}

//! media_intake - HTTP ingestion and normalization of image and audio payloads
//!
//! Accepts a media payload as a multipart file, a base64 JSON string or a
//! JSON byte array, decodes it in memory and canonicalizes it (3-channel
//! image in a fixed channel order, or mono waveform at a fixed sample rate)
//! before handing it to an inference collaborator. The log lines emitted
//! while handling a request are returned with its response.

pub mod audio;
pub mod capture;
pub mod config;
pub mod error;
pub mod image;
pub mod inference;
pub mod intake;
pub mod metrics;
pub mod payload;
pub mod server;
pub mod transport;

pub use capture::{CaptureHandle, CaptureHub, CaptureLayer};
pub use config::{
    AlphaPolicy, CaptureConfig, CapturePolicy, ChannelOrder, InputErrorPolicy, IntakeConfig,
    SonicConfig, VisionConfig,
};
pub use error::{ErrorKind, IntakeError, Result};
pub use inference::{Inference, ShapeProbe, WaveformProbe};
pub use intake::{Intake, MediaKind, Outcome, ResponseEnvelope, Sonic, Vision, FAILURE_SENTINEL};
pub use server::{build_router, serve, AppState};
pub use transport::{InputMode, RawBytes};

//! Audio decoding and resampling
//!
//! Containers are probed by symphonia from their own headers; samples are
//! downmixed to mono f32 and then brought to the target rate with a
//! band-limited sinc resampler (rubato).

use crate::error::{IntakeError, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// Frames fed to the resampler per call.
const RESAMPLE_CHUNK: usize = 1024;

/// Mono waveform at its native sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Channel count of the source before downmixing
    pub channels: usize,
}

/// Mono waveform at the configured target rate.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl CanonicalAudio {
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decode an audio container held in memory.
pub fn decode_audio(raw: &[u8]) -> Result<DecodedAudio> {
    let mss = MediaSourceStream::new(Box::new(Cursor::new(raw.to_vec())), Default::default());

    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| IntakeError::decode(format!("probe: {}", e)))?;

    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| IntakeError::decode("no audio track found"))?;

    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params
        .sample_rate
        .filter(|&rate| rate > 0)
        .ok_or_else(|| IntakeError::decode("unknown sample rate"))?;
    let channels = codec_params.channels.map(|c| c.count()).unwrap_or(1).max(1);
    let declared_frames = codec_params.n_frames;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| IntakeError::decode(format!("codec: {}", e)))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut decoded_frames: u64 = 0;

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(IntakeError::decode(format!("packet: {}", e))),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!(error = %e, "Skipping corrupt audio frame");
                continue;
            }
            Err(e) => return Err(IntakeError::decode(format!("decode: {}", e))),
        };

        let frames = decoded.frames();
        if frames == 0 {
            continue;
        }

        decoded_frames += frames as u64;
        let spec = *decoded.spec();
        let mut buf = SampleBuffer::<f32>::new(frames as u64, spec);
        buf.copy_interleaved_ref(decoded);

        let interleaved = buf.samples();
        let stride = spec.channels.count().max(1);
        if stride > 1 {
            samples.extend(
                interleaved
                    .chunks_exact(stride)
                    .map(|frame| frame.iter().sum::<f32>() / stride as f32),
            );
        } else {
            samples.extend_from_slice(interleaved);
        }
    }

    if samples.is_empty() {
        return Err(IntakeError::decode("no audio samples decoded"));
    }

    // The stream ending early reads as EOF; the header still knows the length.
    if let Some(expected) = declared_frames {
        if decoded_frames < expected {
            return Err(IntakeError::decode(format!(
                "truncated audio: got {} of {} frames",
                decoded_frames, expected
            )));
        }
    }

    debug!(
        samples = samples.len(),
        sample_rate,
        channels,
        "Audio decoded"
    );

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Bring a decoded waveform to `target_rate`.
///
/// A waveform already at the target rate is returned untouched.
pub fn canonicalize(decoded: DecodedAudio, target_rate: u32) -> Result<CanonicalAudio> {
    if decoded.sample_rate == target_rate {
        return Ok(CanonicalAudio {
            samples: decoded.samples,
            sample_rate: target_rate,
        });
    }

    let samples = resample(&decoded.samples, decoded.sample_rate, target_rate)?;
    Ok(CanonicalAudio {
        samples,
        sample_rate: target_rate,
    })
}

/// Band-limited sinc resampling of a mono signal.
pub fn resample(input: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == 0 || to_rate == 0 {
        return Err(IntakeError::decode(format!(
            "cannot resample {} Hz -> {} Hz",
            from_rate, to_rate
        )));
    }
    if input.is_empty() || from_rate == to_rate {
        return Ok(input.to_vec());
    }

    let ratio = to_rate as f64 / from_rate as f64;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| IntakeError::decode(format!("resampler init: {}", e)))?;

    let expected = (input.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut chunks = input.chunks_exact(RESAMPLE_CHUNK);
    for chunk in &mut chunks {
        let out = resampler
            .process(&[chunk], None)
            .map_err(|e| IntakeError::decode(format!("resample: {}", e)))?;
        output.extend_from_slice(&out[0]);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let tail: [&[f32]; 1] = [remainder];
        let out = resampler
            .process_partial(Some(&tail[..]), None)
            .map_err(|e| IntakeError::decode(format!("resample: {}", e)))?;
        output.extend_from_slice(&out[0]);
    }

    // Flush the filter tail until the delayed signal is fully out
    while output.len() < delay + expected {
        let out = resampler
            .process_partial(None::<&[&[f32]]>, None)
            .map_err(|e| IntakeError::decode(format!("resample: {}", e)))?;
        if out[0].is_empty() {
            break;
        }
        output.extend_from_slice(&out[0]);
    }

    let end = (delay + expected).min(output.len());
    let start = delay.min(end);

    debug!(
        from_rate,
        to_rate,
        input = input.len(),
        output = end - start,
        "Resampled waveform"
    );

    Ok(output[start..end].to_vec())
}

//! Image decoding and canonicalization
//!
//! Bytes are decoded in memory with the `image` crate into an HxWxC grid
//! (C in {1, 3, 4}) laid out in the configured channel order, with alpha
//! last. Canonicalization always yields exactly three channels.

use crate::config::{AlphaPolicy, ChannelOrder, VisionConfig};
use crate::error::{IntakeError, Result};
use image::{ColorType, DynamicImage};
use ndarray::{s, Array3};
use std::io::Cursor;
use tracing::{debug, warn};

/// EXIF orientation meaning "already upright".
pub const DEFAULT_ORIENTATION: u16 = 1;

/// Image as decoded, before channel normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    /// Shape (height, width, channels)
    pub pixels: Array3<u8>,
    pub order: ChannelOrder,
    /// EXIF orientation code (1-8)
    pub orientation: u16,
}

impl DecodedImage {
    pub fn channels(&self) -> usize {
        self.pixels.dim().2
    }
}

/// Three-channel image handed to the vision model.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalImage {
    /// Shape (height, width, 3)
    pub pixels: Array3<u8>,
    pub order: ChannelOrder,
    /// Orientation still to be applied by the consumer; 1 once corrected.
    pub orientation: u16,
}

impl CanonicalImage {
    pub fn height(&self) -> usize {
        self.pixels.dim().0
    }

    pub fn width(&self) -> usize {
        self.pixels.dim().1
    }
}

/// Decode image bytes, keeping the format's natural channel count.
pub fn decode_image(raw: &[u8], order: ChannelOrder) -> Result<DecodedImage> {
    let img = image::load_from_memory(raw).map_err(|e| {
        let hint = infer::get(raw)
            .map(|kind| kind.mime_type())
            .unwrap_or("unrecognized bytes");
        IntakeError::decode(format!("{} ({})", e, hint))
    })?;

    let pixels = to_array(img, order)?;
    let orientation = read_orientation(raw);

    debug!(
        height = pixels.dim().0,
        width = pixels.dim().1,
        channels = pixels.dim().2,
        orientation,
        "Image decoded"
    );

    Ok(DecodedImage {
        pixels,
        order,
        orientation,
    })
}

fn to_array(img: DynamicImage, order: ChannelOrder) -> Result<Array3<u8>> {
    let (width, height) = (img.width() as usize, img.height() as usize);

    let (channels, mut data) = match img.color() {
        ColorType::L8 | ColorType::L16 => (1, img.into_luma8().into_raw()),
        color if color.has_alpha() => (4, img.into_rgba8().into_raw()),
        _ => (3, img.into_rgb8().into_raw()),
    };

    if order == ChannelOrder::Bgr && channels >= 3 {
        for px in data.chunks_exact_mut(channels) {
            px.swap(0, 2);
        }
    }

    Array3::from_shape_vec((height, width, channels), data)
        .map_err(|e| IntakeError::decode(format!("pixel buffer shape mismatch: {}", e)))
}

/// Read the EXIF orientation tag.
///
/// Missing or unreadable metadata is not an error: the lookup degrades to
/// [`DEFAULT_ORIENTATION`].
pub fn read_orientation(raw: &[u8]) -> u16 {
    let mut cursor = Cursor::new(raw);
    let exif = match exif::Reader::new().read_from_container(&mut cursor) {
        Ok(exif) => exif,
        // No EXIF block, or a container kamadak-exif cannot carry EXIF in
        Err(exif::Error::NotFound(_)) | Err(exif::Error::InvalidFormat(_)) => {
            return DEFAULT_ORIENTATION
        }
        Err(e) => {
            warn!("EXIF read error: {}", e);
            return DEFAULT_ORIENTATION;
        }
    };

    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .and_then(|v| u16::try_from(v).ok())
        .filter(|v| (1..=8).contains(v))
        .unwrap_or(DEFAULT_ORIENTATION)
}

/// Bring a decoded image to exactly three channels.
pub fn canonicalize(decoded: DecodedImage, config: &VisionConfig) -> Result<CanonicalImage> {
    let DecodedImage {
        pixels,
        order,
        orientation,
    } = decoded;

    let (height, width, channels) = pixels.dim();
    let mut pixels = match channels {
        3 => pixels,
        1 => Array3::from_shape_fn((height, width, 3), |(y, x, _)| pixels[[y, x, 0]]),
        4 => match config.alpha {
            AlphaPolicy::Composite => Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
                let alpha = pixels[[y, x, 3]] as u32;
                ((pixels[[y, x, c]] as u32 * alpha + 127) / 255) as u8
            }),
            AlphaPolicy::Discard => pixels.slice(s![.., .., ..3]).to_owned(),
        },
        n => {
            return Err(IntakeError::decode(format!(
                "unsupported channel count: {}",
                n
            )))
        }
    };

    let mut orientation = orientation;
    if config.apply_orientation && orientation != DEFAULT_ORIENTATION {
        pixels = apply_orientation(pixels, orientation);
        orientation = DEFAULT_ORIENTATION;
    }

    Ok(CanonicalImage {
        pixels,
        order,
        orientation,
    })
}

/// Rotate/flip pixels so that an image tagged with `orientation` displays
/// upright.
pub fn apply_orientation(pixels: Array3<u8>, orientation: u16) -> Array3<u8> {
    if !(2..=8).contains(&orientation) {
        return pixels;
    }

    let view = pixels.view();
    let upright = match orientation {
        2 => view.slice_move(s![.., ..;-1, ..]),
        3 => view.slice_move(s![..;-1, ..;-1, ..]),
        4 => view.slice_move(s![..;-1, .., ..]),
        5 => view.permuted_axes([1, 0, 2]),
        6 => view.permuted_axes([1, 0, 2]).slice_move(s![.., ..;-1, ..]),
        7 => view.permuted_axes([1, 0, 2]).slice_move(s![..;-1, ..;-1, ..]),
        _ => view.permuted_axes([1, 0, 2]).slice_move(s![..;-1, .., ..]),
    };

    upright.as_standard_layout().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureHub;
    use crate::config::{CaptureConfig, CapturePolicy};
    use image::{GrayImage, ImageFormat, Luma, Rgb, RgbImage, Rgba, RgbaImage};
    use tracing_subscriber::layer::SubscriberExt;

    fn encode(img: DynamicImage, format: ImageFormat) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, format).unwrap();
        buf.into_inner()
    }

    fn config(alpha: AlphaPolicy) -> VisionConfig {
        VisionConfig {
            alpha,
            ..Default::default()
        }
    }

    #[test]
    fn test_rgb_png_decodes_in_bgr_order() {
        let img = RgbImage::from_pixel(2, 1, Rgb([10, 20, 30]));
        let raw = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);

        let decoded = decode_image(&raw, ChannelOrder::Bgr).unwrap();
        assert_eq!(decoded.pixels.dim(), (1, 2, 3));
        assert_eq!(decoded.pixels[[0, 1, 0]], 30);
        assert_eq!(decoded.pixels[[0, 1, 2]], 10);
        assert_eq!(decoded.orientation, DEFAULT_ORIENTATION);

        let decoded = decode_image(&raw, ChannelOrder::Rgb).unwrap();
        assert_eq!(decoded.pixels[[0, 0, 0]], 10);
    }

    #[test]
    fn test_three_channels_pass_through_unchanged() {
        let img = RgbImage::from_fn(3, 2, |x, y| Rgb([x as u8, y as u8, 7]));
        let raw = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);
        let decoded = decode_image(&raw, ChannelOrder::Bgr).unwrap();

        let canonical = canonicalize(decoded.clone(), &VisionConfig::default()).unwrap();
        assert_eq!(canonical.pixels, decoded.pixels);

        // Canonicalizing twice changes nothing
        let again = canonicalize(
            DecodedImage {
                pixels: canonical.pixels.clone(),
                order: canonical.order,
                orientation: canonical.orientation,
            },
            &VisionConfig::default(),
        )
        .unwrap();
        assert_eq!(again, canonical);
    }

    #[test]
    fn test_gray_is_broadcast() {
        let img = GrayImage::from_pixel(2, 2, Luma([77]));
        let raw = encode(DynamicImage::ImageLuma8(img), ImageFormat::Png);
        let decoded = decode_image(&raw, ChannelOrder::Bgr).unwrap();
        assert_eq!(decoded.channels(), 1);

        let canonical = canonicalize(decoded, &VisionConfig::default()).unwrap();
        assert_eq!(canonical.pixels.dim(), (2, 2, 3));
        assert!(canonical.pixels.iter().all(|&v| v == 77));
    }

    #[test]
    fn test_alpha_composited_over_black() {
        let img = RgbaImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgba([200, 100, 50, 255])
            } else {
                Rgba([200, 100, 50, 128])
            }
        });
        let raw = encode(DynamicImage::ImageRgba8(img), ImageFormat::Png);
        let decoded = decode_image(&raw, ChannelOrder::Rgb).unwrap();
        assert_eq!(decoded.channels(), 4);

        let canonical = canonicalize(decoded.clone(), &config(AlphaPolicy::Composite)).unwrap();
        assert_eq!(canonical.pixels.dim(), (1, 2, 3));

        // Same content pre-composited and stored without alpha
        let flat = RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgb([200, 100, 50])
            } else {
                Rgb([100, 50, 25])
            }
        });
        let flat_raw = encode(DynamicImage::ImageRgb8(flat), ImageFormat::Png);
        let direct = decode_image(&flat_raw, ChannelOrder::Rgb).unwrap();
        assert_eq!(canonical.pixels, direct.pixels);

        let dropped = canonicalize(decoded, &config(AlphaPolicy::Discard)).unwrap();
        assert_eq!(dropped.pixels[[0, 1, 0]], 200);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let err = decode_image(b"definitely not an image", ChannelOrder::Bgr).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Decode);

        let img = RgbImage::from_pixel(8, 8, Rgb([1, 2, 3]));
        let raw = encode(DynamicImage::ImageRgb8(img), ImageFormat::Png);
        assert!(decode_image(&raw[..raw.len() / 2], ChannelOrder::Bgr).is_err());
    }

    #[test]
    fn test_orientation_defaults_without_exif() {
        assert_eq!(read_orientation(b"garbage"), DEFAULT_ORIENTATION);
        assert_eq!(read_orientation(&[]), DEFAULT_ORIENTATION);
    }

    #[test]
    fn test_formats_without_exif_support_degrade_silently() {
        let hub = CaptureHub::new(&CaptureConfig {
            policy: CapturePolicy::Shared,
            targets: vec![env!("CARGO_CRATE_NAME").to_string()],
        });
        let subscriber = tracing_subscriber::registry().with(hub.layer());

        tracing::subscriber::with_default(subscriber, || {
            let handle = hub.attach();
            let img = RgbImage::from_pixel(2, 2, Rgb([1, 2, 3]));
            let bmp = encode(DynamicImage::ImageRgb8(img), ImageFormat::Bmp);

            assert_eq!(read_orientation(&bmp), DEFAULT_ORIENTATION);
            assert_eq!(decode_image(&bmp, ChannelOrder::Bgr).unwrap().orientation, 1);

            let logs = handle.detach();
            assert!(!logs.contains("EXIF read error"), "{}", logs);
        });
    }

    #[test]
    fn test_apply_orientation() {
        // 2 rows x 3 cols, single channel for readability
        let px = Array3::from_shape_vec((2, 3, 1), vec![1, 2, 3, 4, 5, 6]).unwrap();
        let flat = |a: Array3<u8>| a.iter().copied().collect::<Vec<_>>();

        assert_eq!(flat(apply_orientation(px.clone(), 1)), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(flat(apply_orientation(px.clone(), 2)), vec![3, 2, 1, 6, 5, 4]);
        assert_eq!(flat(apply_orientation(px.clone(), 3)), vec![6, 5, 4, 3, 2, 1]);
        assert_eq!(flat(apply_orientation(px.clone(), 4)), vec![4, 5, 6, 1, 2, 3]);

        let rotated = apply_orientation(px.clone(), 6);
        assert_eq!(rotated.dim(), (3, 2, 1));
        assert_eq!(flat(rotated), vec![4, 1, 5, 2, 6, 3]);

        let rotated = apply_orientation(px.clone(), 8);
        assert_eq!(flat(rotated), vec![3, 6, 2, 5, 1, 4]);

        assert_eq!(flat(apply_orientation(px.clone(), 5)), vec![1, 4, 2, 5, 3, 6]);
        assert_eq!(flat(apply_orientation(px, 7)), vec![6, 3, 5, 2, 4, 1]);
    }
}

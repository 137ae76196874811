//! Raw frame to JPEG conversion

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use thiserror::Error;

use super::{FrameBuffer, PixelFormat};

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("{format:?} frame {width}x{height} needs {expected} bytes, got {got}")]
    SizeMismatch {
        format: PixelFormat,
        width: u32,
        height: u32,
        expected: usize,
        got: usize,
    },

    #[error("YUYV frames need an even width, got {0}")]
    OddWidth(u32),

    #[error("JPEG encoder error: {0}")]
    Image(#[from] image::ImageError),
}

/// Encodes `frame` as JPEG. JPEG input is passed through unchanged.
pub fn frame_to_jpeg(frame: &FrameBuffer, quality: u8) -> Result<Vec<u8>, EncodeError> {
    if let Some(bpp) = frame.format.bytes_per_pixel() {
        let expected = bpp * frame.width as usize * frame.height as usize;
        if frame.data.len() != expected {
            return Err(EncodeError::SizeMismatch {
                format: frame.format,
                width: frame.width,
                height: frame.height,
                expected,
                got: frame.data.len(),
            });
        }
    }

    let (width, height) = (frame.width, frame.height);
    match frame.format {
        PixelFormat::Jpeg => Ok(frame.data.clone()),
        PixelFormat::Rgb888 => encode(&frame.data, width, height, ExtendedColorType::Rgb8, quality),
        PixelFormat::Grayscale => {
            encode(&frame.data, width, height, ExtendedColorType::L8, quality)
        }
        PixelFormat::Yuyv => {
            if width % 2 != 0 {
                return Err(EncodeError::OddWidth(width));
            }
            let rgb = yuyv_to_rgb(&frame.data);
            encode(&rgb, width, height, ExtendedColorType::Rgb8, quality)
        }
    }
}

pub(crate) fn encode(
    pixels: &[u8],
    width: u32,
    height: u32,
    color: ExtendedColorType,
    quality: u8,
) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(pixels.len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(pixels, width, height, color)?;
    Ok(out)
}

/// BT.601 studio-swing YUV 4:2:2 to packed RGB
pub fn yuyv_to_rgb(yuyv: &[u8]) -> Vec<u8> {
    let mut rgb = Vec::with_capacity(yuyv.len() / 2 * 3);
    for px in yuyv.chunks_exact(4) {
        let (y0, u, y1, v) = (px[0], px[1], px[2], px[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    rgb
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;

    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

pub(crate) fn rgb_to_yuv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    let y = ((66 * r + 129 * g + 25 * b + 128) >> 8) + 16;
    let u = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let v = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (y as u8, u as u8, v as u8)
}

use image::{GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use video_ingest::{Frame, FrameFormat};

use crate::DetectionError;

fn check_dimensions(frame: &Frame) -> Result<(u32, u32), DetectionError> {
    if frame.width <= 0 || frame.height <= 0 {
        return Err(DetectionError::InvalidFrame(format!(
            "non-positive frame size {}x{}",
            frame.width, frame.height
        )));
    }
    if frame.data.len() != frame.expected_len() {
        return Err(DetectionError::InvalidFrame(format!(
            "unexpected frame buffer size: got {} bytes, expected {}",
            frame.data.len(),
            frame.expected_len()
        )));
    }
    Ok((frame.width as u32, frame.height as u32))
}

/// Convert a BGR frame into an RGB image.
pub fn frame_to_rgb(frame: &Frame) -> Result<RgbImage, DetectionError> {
    let (width, height) = check_dimensions(frame)?;
    match frame.format {
        FrameFormat::Bgr8 => {
            let mut rgb = Vec::with_capacity(frame.data.len());
            for chunk in frame.data.chunks_exact(3) {
                rgb.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
            }
            ImageBuffer::<Rgb<u8>, Vec<u8>>::from_vec(width, height, rgb).ok_or_else(|| {
                DetectionError::InvalidFrame("failed to convert frame into image buffer".into())
            })
        }
    }
}

/// Convert a BGR frame into an 8-bit luma image (BT.601 weights).
pub fn frame_to_luma(frame: &Frame) -> Result<GrayImage, DetectionError> {
    let (width, height) = check_dimensions(frame)?;
    match frame.format {
        FrameFormat::Bgr8 => {
            let luma: Vec<u8> = frame
                .data
                .chunks_exact(3)
                .map(|px| {
                    let (b, g, r) = (px[0] as u32, px[1] as u32, px[2] as u32);
                    ((299 * r + 587 * g + 114 * b + 500) / 1000) as u8
                })
                .collect();
            ImageBuffer::<Luma<u8>, Vec<u8>>::from_vec(width, height, luma).ok_or_else(|| {
                DetectionError::InvalidFrame("failed to convert frame into luma buffer".into())
            })
        }
    }
}

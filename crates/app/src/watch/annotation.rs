use std::sync::OnceLock;

use actix_web::web::Bytes;
use anyhow::{Result, anyhow};
use image::{Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use ml_core::{Detection, frame_to_rgb};
use tracing::warn;
use video_ingest::Frame;

use crate::watch::alert::AlertState;

const ALERT_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const MONITOR_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const BACKDROP_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const GLYPH_ADVANCE: i32 = 6;
const GLYPH_HEIGHT: i32 = 7;
const BOX_THICKNESS: i32 = 2;
const MARGIN: i32 = 10;

static PLACEHOLDER: OnceLock<Bytes> = OnceLock::new();

/// What to draw on top of a frame.
pub(crate) struct Overlay<'a> {
    pub(crate) detections: &'a [&'a Detection],
    pub(crate) alert: AlertState,
    pub(crate) fps: f32,
}

/// Convert `frame` to RGB and draw boxes, the status banner and the fps counter.
pub(crate) fn annotate_frame(frame: &Frame, overlay: &Overlay<'_>) -> Result<RgbImage> {
    let mut image = plain_frame(frame)?;
    let (width, height) = (image.width() as i32, image.height() as i32);
    let scale = text_scale(width);

    for det in overlay.detections {
        let [x1, y1, x2, y2] = clamp_box(&det.bbox, width, height);
        for inset in 0..BOX_THICKNESS {
            draw_rectangle(
                &mut image,
                x1 + inset,
                y1 + inset,
                x2 - inset,
                y2 - inset,
                ALERT_COLOR,
            );
        }

        let label = format!("{} {:.2}", det.label, det.confidence);
        let label_y = if y1 - GLYPH_HEIGHT - 4 >= 0 {
            y1 - GLYPH_HEIGHT - 4
        } else {
            y1 + BOX_THICKNESS + 2
        };
        fill_rect(
            &mut image,
            x1,
            label_y - 1,
            x1 + text_width(&label, 1) + 1,
            label_y + GLYPH_HEIGHT,
            BACKDROP_COLOR,
        );
        draw_label(&mut image, x1 + 1, label_y, &label, ALERT_COLOR, 1);
    }

    let banner = overlay.alert.banner();
    let banner_color = if overlay.alert.is_alert() {
        ALERT_COLOR
    } else {
        MONITOR_COLOR
    };
    fill_rect(
        &mut image,
        MARGIN - 4,
        MARGIN - 4,
        MARGIN + text_width(banner, scale) + 2,
        MARGIN + GLYPH_HEIGHT * scale + 3,
        BACKDROP_COLOR,
    );
    draw_label(&mut image, MARGIN, MARGIN, banner, banner_color, scale);

    let fps = format!("FPS: {}", overlay.fps.round() as u32);
    let fps_y = (height - MARGIN - GLYPH_HEIGHT * scale).max(0);
    fill_rect(
        &mut image,
        MARGIN - 4,
        fps_y - 4,
        MARGIN + text_width(&fps, scale) + 2,
        fps_y + GLYPH_HEIGHT * scale + 3,
        BACKDROP_COLOR,
    );
    draw_label(&mut image, MARGIN, fps_y, &fps, TEXT_COLOR, scale);

    Ok(image)
}

/// The frame as RGB without any overlay.
pub(crate) fn plain_frame(frame: &Frame) -> Result<RgbImage> {
    frame_to_rgb(frame).map_err(|err| anyhow!("cannot convert frame #{}: {err}", frame.sequence))
}

pub(crate) fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

/// Small `STANDBY` frame served while no pipeline is running.
pub(crate) fn placeholder_jpeg() -> Bytes {
    PLACEHOLDER
        .get_or_init(|| {
            let mut image = RgbImage::from_pixel(320, 240, Rgb([24, 24, 24]));
            let text = "STANDBY";
            let scale = 3;
            let x = (320 - text_width(text, scale)) / 2;
            let y = (240 - GLYPH_HEIGHT * scale) / 2;
            draw_label(&mut image, x, y, text, Rgb([200, 200, 200]), scale);
            match encode_jpeg(&image, 80) {
                Ok(jpeg) => Bytes::from(jpeg),
                Err(err) => {
                    warn!("failed to render placeholder frame: {err}");
                    Bytes::new()
                }
            }
        })
        .clone()
}

fn text_scale(width: i32) -> i32 {
    if width >= 480 { 2 } else { 1 }
}

fn text_width(text: &str, scale: i32) -> i32 {
    text.chars().count() as i32 * GLYPH_ADVANCE * scale
}

fn clamp_box(bbox: &[f32; 4], width: i32, height: i32) -> [i32; 4] {
    let max_x = (width - 1).max(0) as f32;
    let max_y = (height - 1).max(0) as f32;
    [
        bbox[0].clamp(0.0, max_x).round() as i32,
        bbox[1].clamp(0.0, max_y).round() as i32,
        bbox[2].clamp(0.0, max_x).round() as i32,
        bbox[3].clamp(0.0, max_y).round() as i32,
    ]
}

fn draw_rectangle(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    if right < left || bottom < top {
        return;
    }
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for x in left..=right {
        *image.get_pixel_mut(x as u32, top as u32) = color;
        *image.get_pixel_mut(x as u32, bottom as u32) = color;
    }
    for y in top..=bottom {
        *image.get_pixel_mut(left as u32, y as u32) = color;
        *image.get_pixel_mut(right as u32, y as u32) = color;
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width.saturating_sub(1));
    let right = right.clamp(0, width.saturating_sub(1));
    let top = top.clamp(0, height.saturating_sub(1));
    let bottom = bottom.clamp(0, height.saturating_sub(1));

    for y in top..=bottom {
        for x in left..=right {
            *image.get_pixel_mut(x as u32, y as u32) = color;
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>, scale: i32) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let px = x + col * scale + dx;
                            let py = y + row as i32 * scale + dy;
                            if px >= 0 && px < width && py >= 0 && py < height {
                                *image.get_pixel_mut(px as u32, py as u32) = color;
                            }
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE * scale;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    match ch {
        'A' => Some([0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
        'B' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110]),
        'C' => Some([0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110]),
        'D' => Some([0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100]),
        'E' => Some([0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111]),
        'F' => Some([0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000]),
        'G' => Some([0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111]),
        'H' => Some([0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001]),
        'I' => Some([0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        'J' => Some([0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100]),
        'K' => Some([0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001]),
        'L' => Some([0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111]),
        'M' => Some([0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001]),
        'N' => Some([0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001]),
        'O' => Some([0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'P' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000]),
        'Q' => Some([0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101]),
        'R' => Some([0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001]),
        'S' => Some([0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110]),
        'T' => Some([0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100]),
        'U' => Some([0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110]),
        'V' => Some([0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100]),
        'W' => Some([0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010]),
        'X' => Some([0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001]),
        'Y' => Some([0b10001, 0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100]),
        'Z' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111]),
        '0' => Some([0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110]),
        '1' => Some([0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110]),
        '2' => Some([0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111]),
        '3' => Some([0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110]),
        '4' => Some([0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010]),
        '5' => Some([0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110]),
        '6' => Some([0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110]),
        '7' => Some([0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000]),
        '8' => Some([0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110]),
        '9' => Some([0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100]),
        ':' => Some([0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0]),
        '.' => Some([0, 0, 0, 0, 0, 0b00110, 0b00110]),
        '-' => Some([0, 0, 0, 0b11111, 0, 0, 0]),
        '_' => Some([0, 0, 0, 0, 0, 0, 0b11111]),
        '%' => Some([0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0]),
        '#' => Some([0b01010, 0b01010, 0b11111, 0b01010, 0b11111, 0b01010, 0b01010]),
        '/' => Some([0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000]),
        ' ' => Some([0; 7]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use video_ingest::FrameFormat;

    use super::*;

    fn gray_frame(width: i32, height: i32) -> Frame {
        Frame {
            data: vec![128; (width * height * 3) as usize],
            width,
            height,
            timestamp_ms: 0,
            sequence: 1,
            format: FrameFormat::Bgr8,
        }
    }

    fn person() -> Detection {
        Detection {
            label: "person".into(),
            confidence: 0.87,
            bbox: [100.0, 100.0, 200.0, 300.0],
        }
    }

    #[test]
    fn draws_boxes_only_for_given_detections() {
        let frame = gray_frame(640, 480);
        let det = person();
        let qualifying = [&det];
        let image = annotate_frame(
            &frame,
            &Overlay {
                detections: &qualifying,
                alert: AlertState::Alert,
                fps: 24.6,
            },
        )
        .unwrap();

        assert_eq!(*image.get_pixel(150, 100), ALERT_COLOR);
        assert_eq!(*image.get_pixel(100, 200), ALERT_COLOR);
        assert_eq!(*image.get_pixel(150, 200), Rgb([128, 128, 128]));
    }

    #[test]
    fn banner_color_follows_alert_state() {
        let frame = gray_frame(640, 480);
        let render = |alert| {
            annotate_frame(
                &frame,
                &Overlay {
                    detections: &[],
                    alert,
                    fps: 0.0,
                },
            )
            .unwrap()
        };
        let count = |image: &RgbImage, color: Rgb<u8>| {
            (0..60)
                .flat_map(|y| (0..500).map(move |x| (x, y)))
                .filter(|(x, y)| *image.get_pixel(*x, *y) == color)
                .count()
        };

        let alert = render(AlertState::Alert);
        let monitoring = render(AlertState::Monitoring);
        assert!(count(&alert, ALERT_COLOR) > 0);
        assert_eq!(count(&alert, MONITOR_COLOR), 0);
        assert!(count(&monitoring, MONITOR_COLOR) > 0);
        assert_eq!(count(&monitoring, ALERT_COLOR), 0);
    }

    #[test]
    fn out_of_bounds_boxes_are_clamped() {
        let frame = gray_frame(64, 48);
        let det = Detection {
            label: "person".into(),
            confidence: 0.9,
            bbox: [-50.0, -50.0, 500.0, 500.0],
        };
        let qualifying = [&det];
        let image = annotate_frame(
            &frame,
            &Overlay {
                detections: &qualifying,
                alert: AlertState::Alert,
                fps: 30.0,
            },
        )
        .unwrap();
        assert_eq!(*image.get_pixel(63, 47), ALERT_COLOR);
    }

    #[test]
    fn rejects_truncated_frames() {
        let mut frame = gray_frame(64, 48);
        frame.data.truncate(10);
        assert!(plain_frame(&frame).is_err());
    }

    #[test]
    fn encodes_valid_jpegs() {
        let jpeg = encode_jpeg(&RgbImage::new(32, 32), 85).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let placeholder = placeholder_jpeg();
        assert_eq!(&placeholder[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&placeholder).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (320, 240));
    }
}

//! Background-subtraction motion detector.
//!
//! Keeps a running-average background per run, thresholds the absolute
//! difference of each blurred grayscale frame against it, cleans the mask with
//! a morphological opening and reports every 8-connected blob above the
//! minimum area as a `motion` detection.

use std::{collections::HashMap, sync::Mutex};

use image::{GrayImage, Luma};
use imageproc::{
    distance_transform::Norm,
    filter::gaussian_blur_f32,
    morphology::open,
    region_labelling::{Connectivity, connected_components},
};
use tracing::trace;
use video_ingest::Frame;

use crate::{Detection, DetectionError, Detector, imaging::frame_to_luma};

/// Label attached to every detection produced by [`MotionDetector`].
pub const MOTION_LABEL: &str = "motion";

#[derive(Clone, Debug)]
pub struct MotionConfig {
    /// Weight of the current frame when updating the background average.
    pub learning_rate: f32,
    /// Minimum absolute luma difference for a pixel to count as foreground.
    pub diff_threshold: u8,
    /// Minimum blob size in pixels.
    pub min_area: u32,
    /// Gaussian blur applied before differencing; `0.0` disables it.
    pub blur_sigma: f32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.05,
            diff_threshold: 25,
            min_area: 500,
            blur_sigma: 1.5,
        }
    }
}

struct Background {
    width: u32,
    height: u32,
    model: Vec<f32>,
}

impl Background {
    fn seed(gray: &GrayImage) -> Self {
        Self {
            width: gray.width(),
            height: gray.height(),
            model: gray.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    fn matches(&self, gray: &GrayImage) -> bool {
        self.width == gray.width() && self.height == gray.height()
    }
}

pub struct MotionDetector {
    config: MotionConfig,
    background: Mutex<Option<Background>>,
}

impl MotionDetector {
    pub fn new(config: MotionConfig) -> Self {
        Self {
            config,
            background: Mutex::new(None),
        }
    }

    /// Blob confidence: exactly 0.5 at `min_area`, approaching 1.0 as the blob grows.
    fn confidence(&self, area: u32) -> f32 {
        let min_area = self.config.min_area.max(1) as f32;
        let area = area as f32;
        area / (area + min_area)
    }

    fn foreground_mask(&self, gray: &GrayImage, background: &mut Background) -> GrayImage {
        let mut mask = GrayImage::new(gray.width(), gray.height());
        let threshold = self.config.diff_threshold as f32;
        let rate = self.config.learning_rate.clamp(0.0, 1.0);

        for ((pixel, model), out) in gray
            .as_raw()
            .iter()
            .zip(background.model.iter_mut())
            .zip(mask.iter_mut())
        {
            let value = *pixel as f32;
            if (value - *model).abs() > threshold {
                *out = 255;
            }
            *model += rate * (value - *model);
        }

        open(&mask, Norm::LInf, 1)
    }

    fn blobs(&self, mask: &GrayImage) -> Vec<Detection> {
        let labeled = connected_components(mask, Connectivity::Eight, Luma([0u8]));
        let mut regions: HashMap<u32, (u32, u32, u32, u32, u32)> = HashMap::new();

        for (x, y, label) in labeled.enumerate_pixels() {
            let label = label[0];
            if label == 0 {
                continue;
            }
            regions
                .entry(label)
                .and_modify(|(min_x, min_y, max_x, max_y, count)| {
                    *min_x = (*min_x).min(x);
                    *min_y = (*min_y).min(y);
                    *max_x = (*max_x).max(x);
                    *max_y = (*max_y).max(y);
                    *count += 1;
                })
                .or_insert((x, y, x, y, 1));
        }

        let mut detections: Vec<Detection> = regions
            .into_values()
            .filter(|(_, _, _, _, count)| *count >= self.config.min_area)
            .map(|(min_x, min_y, max_x, max_y, count)| Detection {
                label: MOTION_LABEL.to_string(),
                confidence: self.confidence(count),
                bbox: [
                    min_x as f32,
                    min_y as f32,
                    (max_x + 1) as f32,
                    (max_y + 1) as f32,
                ],
            })
            .collect();
        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        detections
    }
}

impl Default for MotionDetector {
    fn default() -> Self {
        Self::new(MotionConfig::default())
    }
}

impl Detector for MotionDetector {
    fn name(&self) -> &str {
        "motion"
    }

    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        let mut gray = frame_to_luma(frame)?;
        if self.config.blur_sigma > 0.0 {
            gray = gaussian_blur_f32(&gray, self.config.blur_sigma);
        }

        let mut guard = self
            .background
            .lock()
            .map_err(|_| DetectionError::Poisoned)?;
        if !guard.as_ref().is_some_and(|background| background.matches(&gray)) {
            *guard = Some(Background::seed(&gray));
            trace!(frame = frame.sequence, "seeded motion background");
            return Ok(Vec::new());
        }
        let Some(background) = guard.as_mut() else {
            return Ok(Vec::new());
        };

        let mask = self.foreground_mask(&gray, background);
        drop(guard);
        Ok(self.blobs(&mask))
    }

    fn reset(&self) {
        if let Ok(mut guard) = self.background.lock() {
            *guard = None;
        }
    }
}

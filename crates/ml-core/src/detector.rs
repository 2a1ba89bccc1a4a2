use std::{convert::TryFrom, path::Path, sync::Mutex};

use anyhow::{Result, anyhow, bail};
use image::imageops::{self, FilterType};
use tch::{self, Device, Kind, Tensor};
use video_ingest::Frame;

use crate::{
    Detection, DetectionError, Detector,
    boxes::non_max_suppression,
    imaging::frame_to_rgb,
    labels::label_for,
};

const MAX_DETECTIONS: usize = 512;

/// TorchScript-backed YOLOv8 detector.
pub struct TorchDetector {
    module: Mutex<tch::CModule>,
    device: Device,
    input_size: (i64, i64),
    confidence_threshold: f32,
    iou_threshold: f32,
}

impl TorchDetector {
    /// Load a TorchScript module onto `device`.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        device: Device,
        input_size: (i64, i64),
    ) -> Result<Self> {
        let module = tch::CModule::load_on_device(model_path, device)?;
        Ok(Self {
            module: Mutex::new(module),
            device,
            input_size,
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
        })
    }

    /// Override the pre-filter confidence applied before NMS.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Resize a frame to the model input and build a normalised NCHW tensor.
    fn frame_to_tensor(&self, frame: &Frame) -> Result<Tensor, DetectionError> {
        let (in_w, in_h) = self.input_size;
        let rgb = frame_to_rgb(frame)?;
        let resized = imageops::resize(&rgb, in_w as u32, in_h as u32, FilterType::Triangle);
        let tensor = Tensor::from_slice(resized.as_raw())
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h, in_w, 3])
            .permute([0, 3, 1, 2])
            / 255.0;
        Ok(tensor)
    }

    /// Decode a `[1, 4 + classes, anchors]` output into frame-space detections.
    fn decode(&self, output: &Tensor, frame: &Frame) -> Result<Vec<Detection>> {
        let shape = output.size();
        if shape.len() != 3 {
            bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[0] != 1 {
            bail!("detector expected batch=1 but received {}", shape[0]);
        }
        if shape[1] < 5 {
            bail!(
                "detector output requires at least 5 channels (x,y,w,h,cls), got {}",
                shape[1]
            );
        }

        let preds = output
            .to_device(Device::Cpu)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let (in_w, in_h) = self.input_size;
        let scale_x = frame.width as f32 / in_w as f32;
        let scale_y = frame.height as f32 / in_h as f32;
        let max_x = (frame.width - 1).max(0) as f32;
        let max_y = (frame.height - 1).max(0) as f32;

        let mut detections = Vec::new();
        for row in rows {
            let Some((class_id, score)) = row[4..]
                .iter()
                .copied()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))
            else {
                continue;
            };
            if score < self.confidence_threshold {
                continue;
            }
            let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
            detections.push(Detection {
                label: label_for(class_id),
                confidence: score.clamp(0.0, 1.0),
                bbox: [
                    ((cx - w / 2.0) * scale_x).clamp(0.0, max_x),
                    ((cy - h / 2.0) * scale_y).clamp(0.0, max_y),
                    ((cx + w / 2.0) * scale_x).clamp(0.0, max_x),
                    ((cy + h / 2.0) * scale_y).clamp(0.0, max_y),
                ],
            });
            if detections.len() >= MAX_DETECTIONS {
                break;
            }
        }

        Ok(non_max_suppression(detections, self.iou_threshold))
    }
}

impl Detector for TorchDetector {
    fn name(&self) -> &str {
        "torchscript"
    }

    fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, DetectionError> {
        let input = self.frame_to_tensor(frame)?;
        let output = {
            let module = self.module.lock().map_err(|_| DetectionError::Poisoned)?;
            tch::no_grad(|| module.forward_ts(&[input]))
                .map_err(|err| anyhow!("forward pass failed: {err}"))?
        };
        Ok(self.decode(&output, frame)?)
    }
}

//! Neural network models.
//!
//! [`WasteClassifier`] maps an uploaded image to an entry of the class table,
//! [`YoloDetector`] finds objects in live frames and draws them.
use std::path::Path;

use anyhow::{Context, Result};
use common::protocol::Classification;
use image::RgbImage;
use ndarray::{s, ArrayView2, Axis, Ix2};
use rusttype::Font;
use tract_onnx::prelude::*;

use crate::{
    artifacts::{Artifacts, ClassInfo},
    overlay::draw_detections,
};

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Bounding box `[x_top_left, y_top_left, x_bottom_right, y_bottom_right]`.
pub type Bbox = [f32; 4];

/// Positive additive constant to avoid divide-by-zero.
const EPS: f32 = 1.0e-7;

/// Maps an image file to a classification.
pub trait Classifier: Send + Sync {
    fn classify(&self, image_path: &Path) -> Result<Classification>;
}

/// Draws inference results onto a live frame in place.
pub trait FrameAnnotator: Send + Sync {
    fn annotate(&self, frame: &mut RgbImage);
}

/// Leaves frames untouched, used when no detection model is available.
pub struct PassThrough;

impl FrameAnnotator for PassThrough {
    fn annotate(&self, _frame: &mut RgbImage) {}
}

fn load_onnx(path: &Path, width: u32, height: u32) -> Result<NnModel> {
    let input_fact = InferenceFact::dt_shape(
        f32::datum_type(),
        tvec!(1, 3, height as usize, width as usize),
    );
    let model = tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to load model {}", path.display()))?
        .with_input_fact(0, input_fact)?
        .into_optimized()?
        .into_runnable()?;

    Ok(model)
}

/// Resize and normalize an image into a `1x3xHxW` tensor.
fn to_input_tensor(
    image: &RgbImage,
    (width, height): (u32, u32),
    mean: [f32; 3],
    std: [f32; 3],
) -> Tensor {
    let resized: RgbImage =
        image::imageops::resize(image, width, height, image::imageops::FilterType::Triangle);

    tract_ndarray::Array4::from_shape_fn(
        (1, 3, height as usize, width as usize),
        |(_, c, y, x)| (resized[(x as _, y as _)][c] as f32 / 255.0 - mean[c]) / std[c],
    )
    .into()
}

/// Index and softmax probability of the highest score.
fn top_class(scores: &[f32]) -> Option<(usize, f32)> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return None;
    }

    let sum: f32 = scores.iter().map(|score| (score - max).exp()).sum();
    scores
        .iter()
        .position(|score| *score == max)
        .map(|idx| (idx, 1.0 / sum))
}

/// Image classifier built from the startup artifacts.
pub struct WasteClassifier {
    model: NnModel,
    input_size: (u32, u32),
    mean: [f32; 3],
    std: [f32; 3],
    classes: Vec<ClassInfo>,
}

impl WasteClassifier {
    pub fn new(artifacts: &Artifacts) -> Result<Self> {
        let (width, height) = artifacts.input_size;
        let model = load_onnx(&artifacts.model_path, width, height)?;
        log::info!("Loaded classifier {}", artifacts.model_path.display());

        Ok(Self {
            model,
            input_size: artifacts.input_size,
            mean: artifacts.mean,
            std: artifacts.std,
            classes: artifacts.classes.clone(),
        })
    }

    /// Class index and confidence of the most likely class.
    pub fn predict(&self, image: &RgbImage) -> Result<(usize, f32)> {
        let input = to_input_tensor(image, self.input_size, self.mean, self.std);
        let outputs = self.model.run(tvec!(input.into()))?;

        let scores: Vec<f32> = outputs[0].to_array_view::<f32>()?.iter().copied().collect();
        top_class(&scores).context("classifier returned no scores")
    }
}

impl Classifier for WasteClassifier {
    fn classify(&self, image_path: &Path) -> Result<Classification> {
        let image = image::open(image_path)
            .with_context(|| format!("failed to decode {}", image_path.display()))?
            .to_rgb8();

        let (idx, confidence) = self.predict(&image)?;
        let class = self.classes.get(idx).with_context(|| {
            format!(
                "class index {idx} out of range for {} classes",
                self.classes.len()
            )
        })?;

        log::info!(
            "Classified {} as {} ({:.1}%)",
            image_path.display(),
            class.label,
            confidence * 100.0
        );

        Ok(class.to_classification())
    }
}

/// One detected object in frame coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub bbox: Bbox,
    pub confidence: f32,
    pub class_id: usize,
}

/// YOLOv8 style detector with a square input and a `[1, 4 + classes, N]` output.
pub struct YoloDetector {
    model: NnModel,
    input_size: u32,
    min_confidence: f32,
    max_iou: f32,
    labels: Vec<String>,
    font: Option<Font<'static>>,
}

impl YoloDetector {
    pub fn new(
        model_path: &Path,
        input_size: u32,
        min_confidence: f32,
        max_iou: f32,
    ) -> Result<Self> {
        let model = load_onnx(model_path, input_size, input_size)?;
        log::info!("Loaded detection model {}", model_path.display());

        Ok(Self {
            model,
            input_size,
            min_confidence,
            max_iou,
            labels: Vec::new(),
            font: None,
        })
    }

    pub fn with_labels(mut self, labels: Vec<String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_font(mut self, font: Font<'static>) -> Self {
        self.font = Some(font);
        self
    }

    pub fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let size = self.input_size;
        let input = to_input_tensor(frame, (size, size), [0.0; 3], [1.0; 3]);
        let outputs = self.model.run(tvec!(input.into()))?;

        let raw = outputs[0]
            .to_array_view::<f32>()?
            .index_axis_move(Axis(0), 0)
            .into_dimensionality::<Ix2>()?;
        let candidates = decode_candidates(raw, self.min_confidence);
        let mut selected = non_maximum_suppression(candidates, self.max_iou);

        // Scale from model input back to frame coordinates
        let sx = frame.width() as f32 / size as f32;
        let sy = frame.height() as f32 / size as f32;
        for detection in selected.iter_mut() {
            let [x_tl, y_tl, x_br, y_br] = detection.bbox;
            detection.bbox = [x_tl * sx, y_tl * sy, x_br * sx, y_br * sy];
        }

        Ok(selected)
    }
}

impl FrameAnnotator for YoloDetector {
    fn annotate(&self, frame: &mut RgbImage) {
        match self.detect(frame) {
            Ok(detections) => {
                log::trace!("{} detections", detections.len());
                draw_detections(frame, &detections, &self.labels, self.font.as_ref());
            }
            Err(e) => log::warn!("Detection failed: {e:#}"),
        }
    }
}

/// Turn raw `[4 + classes, N]` model output into candidate detections.
///
/// Every column holds a centre-format box `cx, cy, w, h` followed by one score
/// per class. Candidates not above `min_confidence` are discarded.
fn decode_candidates(raw: ArrayView2<f32>, min_confidence: f32) -> Vec<Detection> {
    if raw.nrows() <= 4 {
        return Vec::new();
    }

    raw.columns()
        .into_iter()
        .filter_map(|column| {
            let (class_id, confidence) = column
                .slice(s![4..])
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (idx, score)| {
                    if score > best.1 {
                        (idx, score)
                    } else {
                        best
                    }
                });

            if confidence <= min_confidence {
                return None;
            }

            let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
            Some(Detection {
                bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
                confidence,
                class_id,
            })
        })
        .collect()
}

/// Run non-maximum-suppression on candidate detections.
///
/// Start with the most confident detection and iterate over all others in the
/// order of sinking confidence. A candidate is kept only if it does not
/// overlap an already kept detection of the same class by more than
/// `max_iou`.
fn non_maximum_suppression(mut candidates: Vec<Detection>, max_iou: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

    let mut selected: Vec<Detection> = vec![];
    'candidates: while let Some(candidate) = candidates.pop() {
        for chosen in selected.iter() {
            if chosen.class_id == candidate.class_id && iou(&candidate.bbox, &chosen.bbox) > max_iou
            {
                continue 'candidates;
            }
        }

        selected.push(candidate);
    }

    selected
}

/// Calculate the intersection-over-union metric for two bounding boxes.
fn iou(bbox_a: &Bbox, bbox_b: &Bbox) -> f32 {
    // If the boxes do not overlap, the top left corner of the overlap box lies
    // below/right of its bottom right corner and the area is zero.
    let overlap_box: Bbox = [
        f32::max(bbox_a[0], bbox_b[0]),
        f32::max(bbox_a[1], bbox_b[1]),
        f32::min(bbox_a[2], bbox_b[2]),
        f32::min(bbox_a[3], bbox_b[3]),
    ];

    let overlap_area = bbox_area(&overlap_box);

    overlap_area / (bbox_area(bbox_a) + bbox_area(bbox_b) - overlap_area + EPS)
}

/// Area enclosed by a bounding box, zero for ill-defined boxes.
fn bbox_area(bbox: &Bbox) -> f32 {
    let width = bbox[2] - bbox[0];
    let height = bbox[3] - bbox[1];
    if width < 0.0 || height < 0.0 {
        return 0.0;
    }

    width * height
}

//! ONNX face-descriptor extraction.
//!
//! Two-stage pipeline: a lightweight detector proposes the best face box
//! in a grayscale frame, and an embedder turns the cropped face into a
//! 128-dimensional descriptor. "No face in frame" is an ordinary
//! `Ok(None)` outcome, never an error.

use crate::types::{Descriptor, RecordError, DESCRIPTOR_LEN};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

// --- Named constants ---
const DETECT_MEAN: f32 = 127.5;
const DETECT_STD: f32 = 128.0;
const EMBED_INPUT_SIZE: usize = 150;
const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 127.5;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("model load failed: {0}")]
    ModelLoad(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Detection tuning knobs: minimum detector score for a box to count as
/// a face, and the square input size the frame is letterboxed into.
#[derive(Debug, Clone, Copy)]
pub struct DetectOptions {
    pub min_score: f32,
    pub input_size: usize,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            min_score: 0.5,
            input_size: 416,
        }
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Best face proposal, in frame coordinates.
#[derive(Debug, Clone, Copy)]
struct FaceBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
}

/// Blocking two-session ONNX extractor. Callers needing async should run
/// this behind `spawn_blocking`.
#[derive(Debug)]
pub struct FaceExtractor {
    detector: Session,
    embedder: Session,
    options: DetectOptions,
}

impl FaceExtractor {
    /// Load both ONNX models from disk.
    pub fn load(
        detector_path: &str,
        embedder_path: &str,
        options: DetectOptions,
    ) -> Result<Self, ExtractorError> {
        let detector = load_session(detector_path)?;
        let embedder = load_session(embedder_path)?;
        tracing::info!(
            detector = detector_path,
            embedder = embedder_path,
            min_score = options.min_score,
            input_size = options.input_size,
            "face extractor loaded"
        );
        Ok(Self {
            detector,
            embedder,
            options,
        })
    }

    /// Detect the most confident face in a grayscale frame and extract
    /// its descriptor. Returns `Ok(None)` when no box clears the
    /// minimum score.
    pub fn detect_descriptor(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<Descriptor>, ExtractorError> {
        let Some(face) = self.best_face(frame, width, height)? else {
            return Ok(None);
        };

        let crop = crop_resize_gray(frame, width, height, &face, EMBED_INPUT_SIZE);
        let input = preprocess(&crop, EMBED_INPUT_SIZE, EMBED_MEAN, EMBED_STD);

        let outputs = self
            .embedder
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::Inference(format!("descriptor extraction: {e}")))?;
        let raw: Vec<f32> = raw_data.to_vec();

        if raw.len() != DESCRIPTOR_LEN {
            return Err(ExtractorError::Inference(format!(
                "expected {DESCRIPTOR_LEN}-dim descriptor, got {}",
                raw.len()
            )));
        }

        let values = l2_normalize(raw);
        let descriptor = Descriptor::new(values).map_err(|e: RecordError| {
            ExtractorError::Inference(format!("descriptor construction: {e}"))
        })?;
        Ok(Some(descriptor))
    }

    /// Run the detector and return the highest-scoring box above the
    /// minimum score, mapped back to frame coordinates.
    fn best_face(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<FaceBox>, ExtractorError> {
        let size = self.options.input_size;
        let (boxed, letterbox) = letterbox_gray(frame, width as usize, height as usize, size);
        let input = preprocess(&boxed, size, DETECT_MEAN, DETECT_STD);

        let outputs = self
            .detector
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, scores) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::Inference(format!("detector scores: {e}")))?;
        let (_, boxes) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::Inference(format!("detector boxes: {e}")))?;

        let mut best_idx = None;
        let mut best_score = self.options.min_score;
        for (i, &score) in scores.iter().enumerate() {
            // Strict improvement keeps the earliest proposal on ties and
            // enforces score > min_score overall.
            if score > best_score {
                best_score = score;
                best_idx = Some(i);
            }
        }

        let Some(idx) = best_idx else {
            return Ok(None);
        };
        if boxes.len() < (idx + 1) * 4 {
            return Err(ExtractorError::Inference(format!(
                "detector box tensor too short: {} entries for proposal {idx}",
                boxes.len()
            )));
        }

        // Boxes are (x1, y1, x2, y2) in letterboxed input pixels.
        let x1 = (boxes[idx * 4] - letterbox.pad_x) / letterbox.scale;
        let y1 = (boxes[idx * 4 + 1] - letterbox.pad_y) / letterbox.scale;
        let x2 = (boxes[idx * 4 + 2] - letterbox.pad_x) / letterbox.scale;
        let y2 = (boxes[idx * 4 + 3] - letterbox.pad_y) / letterbox.scale;

        let x = x1.clamp(0.0, width as f32 - 1.0);
        let y = y1.clamp(0.0, height as f32 - 1.0);
        let face = FaceBox {
            x,
            y,
            width: (x2.clamp(0.0, width as f32) - x).max(1.0),
            height: (y2.clamp(0.0, height as f32) - y).max(1.0),
        };

        tracing::debug!(
            score = best_score,
            x = face.x,
            y = face.y,
            w = face.width,
            h = face.height,
            "best face proposal"
        );
        Ok(Some(face))
    }
}

fn load_session(model_path: &str) -> Result<Session, ExtractorError> {
    if !Path::new(model_path).exists() {
        return Err(ExtractorError::ModelNotFound(model_path.to_string()));
    }
    Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(model_path)
        .map_err(|e| ExtractorError::ModelLoad(format!("{model_path}: {e}")))
}

/// Resize a grayscale frame into a centred square letterbox, preserving
/// aspect ratio. Padding is filled with black.
fn letterbox_gray(frame: &[u8], width: usize, height: usize, size: usize) -> (Vec<u8>, LetterboxInfo) {
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale) as usize).max(1);
    let new_h = ((height as f32 * scale) as usize).max(1);
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;

    let mut out = vec![0u8; size * size];
    for y in 0..new_h {
        let src_y = ((y as f32 / scale) as usize).min(height.saturating_sub(1));
        for x in 0..new_w {
            let src_x = ((x as f32 / scale) as usize).min(width.saturating_sub(1));
            let pixel = frame.get(src_y * width + src_x).copied().unwrap_or(0);
            out[(y + pad_y) * size + (x + pad_x)] = pixel;
        }
    }

    (
        out,
        LetterboxInfo {
            scale,
            pad_x: pad_x as f32,
            pad_y: pad_y as f32,
        },
    )
}

/// Crop a face box out of a grayscale frame and resize it to a square,
/// nearest-neighbour.
fn crop_resize_gray(frame: &[u8], width: u32, height: u32, face: &FaceBox, size: usize) -> Vec<u8> {
    let w = width as usize;
    let h = height as usize;
    let mut out = vec![0u8; size * size];

    for y in 0..size {
        let src_y = face.y + (y as f32 + 0.5) / size as f32 * face.height;
        let src_y = (src_y as usize).min(h.saturating_sub(1));
        for x in 0..size {
            let src_x = face.x + (x as f32 + 0.5) / size as f32 * face.width;
            let src_x = (src_x as usize).min(w.saturating_sub(1));
            out[y * size + x] = frame.get(src_y * w + src_x).copied().unwrap_or(0);
        }
    }
    out
}

/// Grayscale square crop into a normalized NCHW float tensor, replicating
/// the single channel into RGB.
fn preprocess(gray: &[u8], size: usize, mean: f32, std: f32) -> Array4<f32> {
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..size {
        for x in 0..size {
            let pixel = gray.get(y * size + x).copied().unwrap_or(0) as f32;
            let normalized = (pixel - mean) / std;
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }
    tensor
}

fn l2_normalize(raw: Vec<f32>) -> Vec<f32> {
    let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|x| x / norm).collect()
    } else {
        raw
    }
}

//! Face embedding extraction via ONNX Runtime.
//!
//! Runs a MobileFaceNet-style model on face crops: RGB input resized to a
//! square, scaled to [0, 1], NHWC layout; output is a single raw
//! (un-normalized) embedding vector.

use crate::config::PipelineConfig;
use crate::frame::FaceCrop;
use crate::types::Embedding;
use image::{imageops, RgbImage};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const PIXEL_SCALE: f32 = 255.0;
const INTRA_THREADS: usize = 4;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("failed to load model: {0}")]
    ModelLoad(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Turns a face crop into a fixed-length embedding.
///
/// Implementations need `&mut self`: one inference call finishes before the
/// next starts on the same instance.
pub trait EmbeddingExtractor: Send {
    /// Length of every embedding this extractor returns.
    fn embedding_len(&self) -> usize;

    fn extract(&mut self, crop: &FaceCrop) -> Result<Embedding, ExtractError>;
}

/// ONNX Runtime backed extractor.
pub struct OnnxExtractor {
    session: Session,
    input_size: usize,
    embedding_len: usize,
}

impl OnnxExtractor {
    /// Load the embedding model. Failure here is fatal to recognition.
    pub fn load(model_path: &str, config: &PipelineConfig) -> Result<Self, ExtractError> {
        if !Path::new(model_path).exists() {
            return Err(ExtractError::ModelNotFound(model_path.to_string()));
        }

        let session =
            open_session(model_path).map_err(|e| ExtractError::ModelLoad(e.to_string()))?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            input_size = config.input_size,
            embedding_len = config.embedding_len,
            "loaded embedding model"
        );

        Ok(Self {
            session,
            input_size: config.input_size,
            embedding_len: config.embedding_len,
        })
    }
}

fn open_session(model_path: &str) -> Result<Session, ort::Error> {
    Ok(Session::builder()?
        .with_intra_threads(INTRA_THREADS)?
        .commit_from_file(model_path)?)
}

impl EmbeddingExtractor for OnnxExtractor {
    fn embedding_len(&self) -> usize {
        self.embedding_len
    }

    fn extract(&mut self, crop: &FaceCrop) -> Result<Embedding, ExtractError> {
        let input = preprocess(&crop.image, self.input_size)?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractError::Inference(format!("embedding extraction: {e}")))?;

        if raw.len() != self.embedding_len {
            return Err(ExtractError::Inference(format!(
                "expected {}-dim embedding, got {}",
                self.embedding_len,
                raw.len()
            )));
        }
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(ExtractError::Inference("embedding contains non-finite values".into()));
        }

        Ok(Embedding::new(raw.to_vec()))
    }
}

/// Resize a crop to `size`×`size` with bilinear filtering and pack it into a
/// `[1, size, size, 3]` tensor of R,G,B values in [0, 1].
pub(crate) fn preprocess(crop: &RgbImage, size: usize) -> Result<Array4<f32>, ExtractError> {
    let (w, h) = crop.dimensions();
    if w == 0 || h == 0 {
        return Err(ExtractError::Inference(format!("empty crop ({w}x{h})")));
    }

    let resized = imageops::resize(crop, size as u32, size as u32, imageops::FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        for c in 0..3 {
            tensor[[0, y, x, c]] = pixel[c] as f32 / PIXEL_SCALE;
        }
    }

    Ok(tensor)
}

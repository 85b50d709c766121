//! Per-frame recognition: crop → embed → match → decide, for every face.

use crate::attendance::{AttendanceDecider, Decision};
use crate::extractor::{EmbeddingExtractor, ExtractError};
use crate::frame::{CropError, FaceCrop, Frame, Rotation};
use crate::matcher::{CosineMatcher, MatchError, Matcher};
use crate::roster::{Roster, RosterError};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("extractor produces {extractor}-dim embeddings but the roster holds {roster}-dim ones")]
    DimensionMismatch { extractor: usize, roster: usize },
}

/// Why one face in a frame produced no decision.
#[derive(Error, Debug)]
pub enum FaceError {
    #[error("crop: {0}")]
    Crop(#[from] CropError),
    #[error("extract: {0}")]
    Extract(#[from] ExtractError),
    #[error("match: {0}")]
    Match(#[from] MatchError),
    #[error("roster: {0}")]
    Roster(#[from] RosterError),
}

/// Everything the caller needs to draw the overlay and log the outcome.
#[derive(Debug)]
pub struct FrameReport {
    /// Every detected box, whether or not it was matched.
    pub faces: Vec<BoundingBox>,
    /// Sensor resolution of the frame, before rotation.
    pub resolution: (u32, u32),
    pub rotation: Rotation,
    /// One entry per face, in `faces` order. Empty when recognition is inactive.
    pub outcomes: Vec<Result<Decision, FaceError>>,
}

impl FrameReport {
    pub fn marked(&self) -> impl Iterator<Item = &Decision> {
        self.outcomes
            .iter()
            .filter_map(|o| o.as_ref().ok())
            .filter(|d| matches!(d, Decision::Marked { .. }))
    }
}

pub struct FrameRecognitionPipeline {
    extractor: Mutex<Box<dyn EmbeddingExtractor>>,
    matcher: CosineMatcher,
    decider: AttendanceDecider,
    roster: Arc<Roster>,
    active: AtomicBool,
}

impl FrameRecognitionPipeline {
    /// Build a pipeline. Recognition starts active.
    pub fn new(
        extractor: Box<dyn EmbeddingExtractor>,
        roster: Arc<Roster>,
        decider: AttendanceDecider,
    ) -> Result<Self, PipelineError> {
        if extractor.embedding_len() != roster.embedding_len() {
            return Err(PipelineError::DimensionMismatch {
                extractor: extractor.embedding_len(),
                roster: roster.embedding_len(),
            });
        }

        Ok(Self {
            extractor: Mutex::new(extractor),
            matcher: CosineMatcher,
            decider,
            roster,
            active: AtomicBool::new(true),
        })
    }

    pub fn roster(&self) -> &Arc<Roster> {
        &self.roster
    }

    pub fn embedding_len(&self) -> usize {
        self.roster.embedding_len()
    }

    /// Toggle matching without tearing down the frame source.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        tracing::info!(active, "recognition toggled");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Process one analyzed frame.
    ///
    /// A failure on one face is logged and recorded; the remaining faces are
    /// still processed. The frame is released when this returns, on every
    /// path.
    pub fn process_frame(&self, frame: Frame, faces: Vec<BoundingBox>) -> FrameReport {
        let mut report = FrameReport {
            faces,
            resolution: frame.resolution(),
            rotation: frame.rotation(),
            outcomes: Vec::new(),
        };

        if !self.is_active() || report.faces.is_empty() {
            return report;
        }

        let upright = frame.upright();
        let snapshot = self.roster.snapshot();

        for (i, face) in report.faces.iter().enumerate() {
            let outcome = self.recognize_face(&upright, frame.rotation(), face, &snapshot);
            match &outcome {
                Ok(decision) => tracing::debug!(face = i, ?decision, "face decided"),
                Err(FaceError::Match(err)) => {
                    tracing::error!(face = i, error = %err, "embedding can't be compared with the roster")
                }
                Err(err) => tracing::warn!(face = i, error = %err, "face skipped"),
            }
            report.outcomes.push(outcome);
        }

        report
    }

    /// Embed the single face in an enrollment frame.
    ///
    /// Returns `None` unless the frame has exactly one face, so a bystander
    /// can't leak into someone else's centroid. The frame is released when
    /// this returns.
    pub fn enrollment_sample(
        &self,
        frame: Frame,
        faces: &[BoundingBox],
    ) -> Result<Option<Embedding>, FaceError> {
        let [face] = faces else {
            tracing::debug!(faces = faces.len(), "enrollment frame skipped: need exactly one face");
            return Ok(None);
        };

        let crop = FaceCrop::cut(&frame.upright(), frame.rotation(), face)?;
        drop(frame);
        let embedding = self.extract(&crop)?;
        Ok(Some(embedding))
    }

    fn recognize_face(
        &self,
        upright: &RgbImage,
        rotation: Rotation,
        face: &BoundingBox,
        snapshot: &[crate::types::RosterEntry],
    ) -> Result<Decision, FaceError> {
        let crop = FaceCrop::cut(upright, rotation, face)?;
        let embedding = self.extract(&crop)?;
        let result = self.matcher.best_match(&embedding, snapshot)?;
        Ok(self.decider.decide(&self.roster, &result)?)
    }

    fn extract(&self, crop: &FaceCrop) -> Result<Embedding, ExtractError> {
        let mut extractor = self
            .extractor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        extractor.extract(crop)
    }
}

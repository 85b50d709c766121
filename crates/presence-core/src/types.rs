use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, in pixel coordinates of the rotated frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default = "full_confidence")]
    pub confidence: f32,
}

fn full_confidence() -> f32 {
    1.0
}

/// Face embedding vector (192-dimensional for MobileFaceNet).
///
/// Immutable once produced: the extractor either yields a complete vector or
/// fails, and the enrollment centroid is built off to the side before being
/// wrapped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when no component is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    pub fn into_values(self) -> Vec<f32> {
        self.values
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Attendance state of one roster entry within the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceState {
    NotAttended,
    Attended,
}

/// An enrolled student.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Externally assigned student number; primary key of the roster.
    pub id: u32,
    pub name: String,
    pub embedding: Embedding,
    pub attended: bool,
}

impl RosterEntry {
    /// A freshly enrolled entry, not yet attended.
    pub fn new(id: u32, name: impl Into<String>, embedding: Embedding) -> Self {
        Self {
            id,
            name: name.into(),
            embedding,
            attended: false,
        }
    }

    pub fn state(&self) -> AttendanceState {
        if self.attended {
            AttendanceState::Attended
        } else {
            AttendanceState::NotAttended
        }
    }
}

/// Fired once per student per session when attendance is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: u32,
    pub name: String,
}

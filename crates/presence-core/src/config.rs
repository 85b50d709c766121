use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Side length of the square model input, in pixels.
pub const DEFAULT_INPUT_SIZE: usize = 112;
/// Length of the embedding produced by the recognition model.
pub const DEFAULT_EMBEDDING_LEN: usize = 192;
/// Best-match similarity must be strictly greater than this to mark attendance.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.75;
/// Number of samples averaged into one enrollment centroid.
pub const DEFAULT_ENROLLMENT_SAMPLES: usize = 10;
/// Upper bound on one enrollment session before it gives up.
pub const DEFAULT_ENROLLMENT_TIMEOUT_SECS: u64 = 30;

/// Tunables shared by the extractor, decider and enrollment aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub input_size: usize,
    pub embedding_len: usize,
    pub similarity_threshold: f32,
    pub enrollment_samples: usize,
    /// Zero disables the timeout.
    pub enrollment_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            embedding_len: DEFAULT_EMBEDDING_LEN,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            enrollment_samples: DEFAULT_ENROLLMENT_SAMPLES,
            enrollment_timeout_secs: DEFAULT_ENROLLMENT_TIMEOUT_SECS,
        }
    }
}

impl PipelineConfig {
    pub fn enrollment_timeout(&self) -> Option<Duration> {
        (self.enrollment_timeout_secs > 0).then(|| Duration::from_secs(self.enrollment_timeout_secs))
    }
}

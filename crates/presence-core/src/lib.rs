//! presence-core: Face embedding, roster matching and attendance marking.
//!
//! Face crops are embedded by an ONNX model, matched by cosine similarity
//! against the enrolled roster, and marked present at most once per session.
//! New students are enrolled from the centroid of several live samples.

pub mod attendance;
pub mod config;
pub mod enrollment;
pub mod extractor;
pub mod frame;
pub mod matcher;
pub mod notify;
pub mod pipeline;
pub mod roster;
pub mod types;

pub use attendance::{AttendanceDecider, Decision};
pub use config::PipelineConfig;
pub use enrollment::{CancelHandle, EnrollmentError, EnrollmentSession, Offer, SampleFeed};
pub use extractor::{EmbeddingExtractor, ExtractError, OnnxExtractor};
pub use frame::{FaceCrop, Frame, Rotation};
pub use matcher::{cosine_similarity, find_best_match, CosineMatcher, MatchResult, Matcher};
pub use notify::{LogSink, NotificationSink};
pub use pipeline::{FaceError, FrameRecognitionPipeline, FrameReport, PipelineError};
pub use roster::{MemoryRosterStore, Roster, RosterError, RosterStore, StoreError};
pub use types::{AttendanceEvent, AttendanceState, BoundingBox, Embedding, RosterEntry};

//! Cosine similarity and nearest-neighbour search over the roster.

use crate::types::{Embedding, RosterEntry};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    #[error("embedding length mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding contains a non-finite value")]
    NonFinite,
}

/// Cosine similarity between two embeddings, in [-1, 1].
///
/// Returns exactly 0.0 when either vector has zero norm. Embeddings of
/// different lengths, or holding NaN or infinity, are never compared.
pub fn cosine_similarity(a: &Embedding, b: &Embedding) -> Result<f32, MatchError> {
    if a.len() != b.len() {
        return Err(MatchError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }
    if !a.is_finite() || !b.is_finite() {
        return Err(MatchError::NonFinite);
    }

    // f64 sums: squares of large f32 components overflow f32.
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.values().iter().zip(b.values()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0) as f32)
}

/// Outcome of matching one query embedding against a roster.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    /// The roster was empty.
    NoCandidates,
    Candidate { entry: RosterEntry, similarity: f32 },
}

impl MatchResult {
    pub fn similarity(&self) -> Option<f32> {
        match self {
            MatchResult::NoCandidates => None,
            MatchResult::Candidate { similarity, .. } => Some(*similarity),
        }
    }
}

/// Strategy for finding the closest enrolled student to a query embedding.
pub trait Matcher {
    fn best_match(
        &self,
        query: &Embedding,
        roster: &[RosterEntry],
    ) -> Result<MatchResult, MatchError>;
}

/// Linear-scan cosine matcher.
///
/// Keeps the entry with the strictly greatest similarity, so on exact ties
/// the first entry in roster order wins.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(
        &self,
        query: &Embedding,
        roster: &[RosterEntry],
    ) -> Result<MatchResult, MatchError> {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in roster.iter().enumerate() {
            let sim = cosine_similarity(query, &entry.embedding)?;
            let is_better = match best {
                None => true,
                Some((_, best_sim)) => sim > best_sim,
            };
            if is_better {
                best = Some((i, sim));
            }
        }

        Ok(match best {
            Some((idx, similarity)) => MatchResult::Candidate {
                entry: roster[idx].clone(),
                similarity,
            },
            None => MatchResult::NoCandidates,
        })
    }
}

/// Convenience wrapper around [`CosineMatcher`].
pub fn find_best_match(
    query: &Embedding,
    roster: &[RosterEntry],
) -> Result<MatchResult, MatchError> {
    CosineMatcher.best_match(query, roster)
}

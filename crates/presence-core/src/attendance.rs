//! Turns match results into attendance marks.
//!
//! A student moves `NotAttended -> Attended` at most once per session: only
//! when the best match is strictly above the threshold and the student has
//! not been marked yet. The check-and-set itself lives in
//! [`Roster::mark_attended`]; the decider adds the threshold policy and the
//! single notification per transition.

use crate::matcher::MatchResult;
use crate::notify::NotificationSink;
use crate::roster::{Roster, RosterError};
use crate::types::AttendanceEvent;
use std::sync::Arc;

/// What the decider did with one match result.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    NoCandidates,
    BelowThreshold { id: u32, similarity: f32 },
    AlreadyAttended { id: u32, similarity: f32 },
    Marked { id: u32, name: String, similarity: f32 },
}

pub struct AttendanceDecider {
    threshold: f32,
    sink: Arc<dyn NotificationSink>,
}

impl AttendanceDecider {
    pub fn new(threshold: f32, sink: Arc<dyn NotificationSink>) -> Self {
        Self { threshold, sink }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Apply one match result to the roster.
    ///
    /// On a firing transition the roster store is written once and the sink
    /// is notified once. Store failures leave the student unmarked and are
    /// returned to the caller.
    pub fn decide(&self, roster: &Roster, result: &MatchResult) -> Result<Decision, RosterError> {
        let (candidate, similarity) = match result {
            MatchResult::NoCandidates => return Ok(Decision::NoCandidates),
            MatchResult::Candidate { entry, similarity } => (entry, *similarity),
        };
        let id = candidate.id;

        // Written as a negated `>` so a NaN similarity never marks anyone.
        if !(similarity > self.threshold) {
            tracing::debug!(id, similarity, threshold = self.threshold, "best match below threshold");
            return Ok(Decision::BelowThreshold { id, similarity });
        }

        // The snapshot the match came from may be stale; the roster re-checks
        // the flag under its lock.
        match roster.mark_attended(id)? {
            Some(entry) => {
                tracing::info!(id, name = %entry.name, similarity, "attendance marked");
                self.sink.notify(AttendanceEvent {
                    id,
                    name: entry.name.clone(),
                });
                Ok(Decision::Marked {
                    id,
                    name: entry.name,
                    similarity,
                })
            }
            None => Ok(Decision::AlreadyAttended { id, similarity }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roster::tests::seeded;
    use crate::types::{AttendanceState, Embedding, RosterEntry};
    use std::sync::atomic::Ordering;
    use std::sync::{mpsc, Mutex};

    const TAU: f32 = 0.75;

    fn setup() -> (
        Roster,
        AttendanceDecider,
        mpsc::Receiver<AttendanceEvent>,
        Arc<std::sync::atomic::AtomicUsize>,
    ) {
        let ada = RosterEntry::new(1, "Ada", Embedding::new(vec![1.0, 0.0]));
        let (store, upserts) = seeded(&[ada]);
        let roster = Roster::open(store, 2).unwrap();
        let (tx, rx) = mpsc::channel();
        let decider = AttendanceDecider::new(TAU, Arc::new(Mutex::new(tx)));
        (roster, decider, rx, upserts)
    }

    fn candidate(roster: &Roster, similarity: f32) -> MatchResult {
        MatchResult::Candidate {
            entry: roster.snapshot()[0].clone(),
            similarity,
        }
    }

    #[test]
    fn test_no_candidates() {
        let (roster, decider, rx, upserts) = setup();
        let d = decider.decide(&roster, &MatchResult::NoCandidates).unwrap();
        assert_eq!(d, Decision::NoCandidates);
        assert!(rx.try_recv().is_err());
        assert_eq!(upserts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_exact_threshold_does_not_mark() {
        let (roster, decider, rx, upserts) = setup();
        let d = decider.decide(&roster, &candidate(&roster, TAU)).unwrap();
        assert!(matches!(d, Decision::BelowThreshold { id: 1, .. }));
        assert!(rx.try_recv().is_err());
        assert_eq!(upserts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_nan_similarity_does_not_mark() {
        let (roster, decider, rx, upserts) = setup();
        let d = decider.decide(&roster, &candidate(&roster, f32::NAN)).unwrap();
        assert!(matches!(d, Decision::BelowThreshold { id: 1, .. }));
        assert!(rx.try_recv().is_err());
        assert_eq!(upserts.load(Ordering::SeqCst), 0);
        assert_eq!(roster.state_of(1), Some(AttendanceState::NotAttended));
    }

    #[test]
    fn test_just_above_threshold_marks() {
        let (roster, decider, rx, upserts) = setup();
        let sim = TAU + f32::EPSILON;
        let d = decider.decide(&roster, &candidate(&roster, sim)).unwrap();
        assert!(matches!(d, Decision::Marked { id: 1, .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            AttendanceEvent {
                id: 1,
                name: "Ada".into()
            }
        );
        assert_eq!(upserts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_repeated_matches_are_idempotent() {
        let (roster, decider, rx, upserts) = setup();
        // Reuse the pre-mark snapshot entry: stale `attended = false` must not
        // cause a second mark.
        let stale = candidate(&roster, 0.99);
        assert!(matches!(
            decider.decide(&roster, &stale).unwrap(),
            Decision::Marked { .. }
        ));
        for _ in 0..5 {
            assert!(matches!(
                decider.decide(&roster, &stale).unwrap(),
                Decision::AlreadyAttended { id: 1, .. }
            ));
        }
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(upserts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_decisions_notify_once() {
        let (roster, decider, rx, upserts) = setup();
        let result = candidate(&roster, 0.9);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| decider.decide(&roster, &result).unwrap());
            }
        });

        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(upserts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_marks_again_after_session_reset() {
        let (roster, decider, rx, _) = setup();
        decider.decide(&roster, &candidate(&roster, 0.9)).unwrap();
        roster.reset_session().unwrap();
        let d = decider.decide(&roster, &candidate(&roster, 0.9)).unwrap();
        assert!(matches!(d, Decision::Marked { .. }));
        assert_eq!(rx.try_iter().count(), 2);
    }
}

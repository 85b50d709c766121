//! Multi-sample enrollment.
//!
//! A capture stream offers one embedding per analyzed frame through a
//! [`SampleFeed`]; the [`EnrollmentSession`] blocks on a condition variable
//! until a new sample arrives, adds `sample / N` to its running sum, and
//! finishes after N samples with the centroid (arithmetic mean, not
//! re-normalized).
//!
//! The slot holds at most one unconsumed sample. The first embedding offered
//! after the previous one was taken is the one that counts; anything offered
//! while a sample is pending is ignored.

use crate::types::Embedding;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrollmentError {
    #[error("enrollment cancelled after {collected} samples")]
    Cancelled { collected: usize },
    #[error("enrollment timed out after {collected} of {target} samples")]
    TimedOut { collected: usize, target: usize },
    #[error("capture stream closed after {collected} of {target} samples")]
    StreamClosed { collected: usize, target: usize },
    #[error("enrollment needs at least one sample")]
    NoSamplesRequested,
}

/// What happened to an offered sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// A previous sample is still waiting to be taken.
    Ignored,
    /// Wrong embedding length for this session.
    Rejected { expected: usize, actual: usize },
    /// The session has completed, failed or been cancelled.
    Closed,
}

struct Slot {
    pending: Option<Embedding>,
    collected: usize,
    producers: usize,
    cancelled: bool,
    finished: bool,
}

struct Shared {
    slot: Mutex<Slot>,
    /// Signalled when a sample is offered, a producer leaves, or on cancel.
    arrived: Condvar,
    /// Signalled when the consumer takes a sample or stops.
    taken: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cancel(&self) {
        let mut slot = self.lock();
        slot.cancelled = true;
        slot.pending = None;
        drop(slot);
        self.arrived.notify_all();
        self.taken.notify_all();
    }
}

/// Producer side of an enrollment session. Cloneable; the session ends with
/// [`EnrollmentError::StreamClosed`] once every feed is dropped.
pub struct SampleFeed {
    shared: Arc<Shared>,
    embedding_len: usize,
}

impl SampleFeed {
    /// Offer a sample without blocking.
    pub fn offer(&self, embedding: Embedding) -> Offer {
        if embedding.len() != self.embedding_len {
            return Offer::Rejected {
                expected: self.embedding_len,
                actual: embedding.len(),
            };
        }

        let mut slot = self.shared.lock();
        if slot.cancelled || slot.finished {
            return Offer::Closed;
        }
        if slot.pending.is_some() {
            return Offer::Ignored;
        }
        slot.pending = Some(embedding);
        drop(slot);
        self.shared.arrived.notify_one();
        Offer::Accepted
    }

    /// Offer a sample and block until the session has taken it.
    ///
    /// Waits for any earlier pending sample first, so no sample is dropped.
    /// Used when replaying a finite recording rather than a live stream.
    pub fn hand_off(&self, embedding: Embedding) -> Offer {
        if embedding.len() != self.embedding_len {
            return Offer::Rejected {
                expected: self.embedding_len,
                actual: embedding.len(),
            };
        }

        let mut slot = self.shared.lock();
        while slot.pending.is_some() && !slot.cancelled && !slot.finished {
            slot = self.shared.taken.wait(slot).unwrap_or_else(|p| p.into_inner());
        }
        if slot.cancelled || slot.finished {
            return Offer::Closed;
        }
        slot.pending = Some(embedding);
        // `collected` moves past this value only when the session takes the
        // sample; stopping clears `pending` without counting it.
        let ticket = slot.collected;
        self.shared.arrived.notify_one();

        while slot.collected == ticket && !slot.cancelled && !slot.finished {
            slot = self.shared.taken.wait(slot).unwrap_or_else(|p| p.into_inner());
        }
        if slot.collected == ticket {
            slot.pending = None;
            return Offer::Closed;
        }
        Offer::Accepted
    }

    /// Abort the session; partial accumulation is discarded.
    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Whether the session has stopped accepting samples.
    pub fn is_closed(&self) -> bool {
        let slot = self.shared.lock();
        slot.cancelled || slot.finished
    }

    /// Samples taken by the session so far.
    pub fn collected(&self) -> usize {
        self.shared.lock().collected
    }
}

impl Clone for SampleFeed {
    fn clone(&self) -> Self {
        self.shared.lock().producers += 1;
        Self {
            shared: self.shared.clone(),
            embedding_len: self.embedding_len,
        }
    }
}

impl Drop for SampleFeed {
    fn drop(&mut self) {
        self.shared.lock().producers -= 1;
        self.shared.arrived.notify_all();
    }
}

/// Cancels a session without keeping its stream open.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

/// Consumer side: accumulates N samples into a centroid.
pub struct EnrollmentSession {
    target: usize,
    accumulator: Vec<f32>,
    timeout: Option<Duration>,
    shared: Arc<Shared>,
}

impl EnrollmentSession {
    /// Create a session expecting `target` samples of length `embedding_len`.
    pub fn new(
        target: usize,
        embedding_len: usize,
        timeout: Option<Duration>,
    ) -> (Self, SampleFeed) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot {
                pending: None,
                collected: 0,
                producers: 1,
                cancelled: false,
                finished: false,
            }),
            arrived: Condvar::new(),
            taken: Condvar::new(),
        });

        let session = Self {
            target,
            accumulator: vec![0.0; embedding_len],
            timeout,
            shared: shared.clone(),
        };
        let feed = SampleFeed {
            shared,
            embedding_len,
        };
        (session, feed)
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: self.shared.clone(),
        }
    }

    /// Block until `target` samples have been accumulated, returning their
    /// centroid.
    ///
    /// Wakes only when a sample arrives, a producer leaves, the session is
    /// cancelled, or the timeout elapses.
    pub fn run(mut self) -> Result<Embedding, EnrollmentError> {
        if self.target == 0 {
            return Err(EnrollmentError::NoSamplesRequested);
        }

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let n = self.target as f32;
        let target = self.target;

        loop {
            let sample = {
                let mut slot = self.shared.lock();
                loop {
                    if slot.cancelled {
                        tracing::info!(collected = slot.collected, target, "enrollment cancelled");
                        return Err(EnrollmentError::Cancelled {
                            collected: slot.collected,
                        });
                    }
                    if let Some(sample) = slot.pending.take() {
                        slot.collected += 1;
                        break sample;
                    }
                    if slot.producers == 0 {
                        return Err(EnrollmentError::StreamClosed {
                            collected: slot.collected,
                            target,
                        });
                    }
                    slot = match deadline {
                        None => self.shared.arrived.wait(slot).unwrap_or_else(|p| p.into_inner()),
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                tracing::warn!(collected = slot.collected, target, "enrollment timed out");
                                return Err(EnrollmentError::TimedOut {
                                    collected: slot.collected,
                                    target,
                                });
                            }
                            self.shared
                                .arrived
                                .wait_timeout(slot, deadline - now)
                                .unwrap_or_else(|p| p.into_inner())
                                .0
                        }
                    };
                }
            };
            self.shared.taken.notify_all();

            for (acc, v) in self.accumulator.iter_mut().zip(sample.values()) {
                *acc += v / n;
            }

            let collected = self.shared.lock().collected;
            tracing::debug!(collected, target, "enrollment sample accepted");
            if collected == target {
                tracing::info!(target, "enrollment centroid complete");
                return Ok(Embedding::new(std::mem::take(&mut self.accumulator)));
            }
        }
    }
}

impl Drop for EnrollmentSession {
    fn drop(&mut self) {
        let mut slot = self.shared.lock();
        slot.finished = true;
        slot.pending = None;
        drop(slot);
        self.shared.taken.notify_all();
    }
}

//! The enrolled-student roster: a persistent store plus the in-memory view
//! the pipeline matches against.
//!
//! Matching reads an immutable snapshot (`Arc<[RosterEntry]>`) that is
//! swapped wholesale after every mutation. All mutations, including the
//! attendance check-and-set, run under one mutex that also owns the store, so
//! two concurrent detections of the same student can't both observe
//! `NotAttended`.

use crate::types::{AttendanceState, Embedding, RosterEntry};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("roster store backend: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("corrupt roster record {id}: {reason}")]
    Corrupt { id: u32, reason: String },
}

#[derive(Error, Debug)]
pub enum RosterError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("student {id} has a {actual}-dim embedding, extractor produces {expected}")]
    DimensionMismatch {
        id: u32,
        expected: usize,
        actual: usize,
    },
    #[error("student {0} has a non-finite embedding")]
    NonFinite(u32),
    #[error("no enrolled student with id {0}")]
    UnknownStudent(u32),
}

/// Synchronous key-value store of roster entries, keyed by student id.
pub trait RosterStore: Send {
    fn get_all(&self) -> Result<Vec<RosterEntry>, StoreError>;

    /// Insert, or replace the entry with the same id.
    fn upsert(&mut self, entry: &RosterEntry) -> Result<(), StoreError>;

    /// Returns whether an entry was removed.
    fn delete(&mut self, id: u32) -> Result<bool, StoreError>;
}

/// Volatile store, ordered by id.
#[derive(Debug, Default)]
pub struct MemoryRosterStore {
    entries: BTreeMap<u32, RosterEntry>,
}

impl MemoryRosterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RosterStore for MemoryRosterStore {
    fn get_all(&self) -> Result<Vec<RosterEntry>, StoreError> {
        Ok(self.entries.values().cloned().collect())
    }

    fn upsert(&mut self, entry: &RosterEntry) -> Result<(), StoreError> {
        self.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    fn delete(&mut self, id: u32) -> Result<bool, StoreError> {
        Ok(self.entries.remove(&id).is_some())
    }
}

struct RosterState {
    store: Box<dyn RosterStore>,
    /// Authoritative copy, in store order.
    entries: Vec<RosterEntry>,
}

/// Shared roster used by the pipeline, the decider and enrollment commits.
pub struct Roster {
    embedding_len: usize,
    state: Mutex<RosterState>,
    snapshot: RwLock<Arc<[RosterEntry]>>,
}

impl Roster {
    /// Load every entry from `store`.
    ///
    /// Fails if any stored embedding has a length other than `embedding_len`
    /// or holds a NaN or infinity: matching against it would be meaningless.
    pub fn open(store: Box<dyn RosterStore>, embedding_len: usize) -> Result<Self, RosterError> {
        let entries = store.get_all()?;
        for entry in &entries {
            check_embedding(entry.id, &entry.embedding, embedding_len)?;
        }

        tracing::info!(
            students = entries.len(),
            attended = entries.iter().filter(|e| e.attended).count(),
            "roster loaded"
        );

        let snapshot: Arc<[RosterEntry]> = entries.clone().into();
        Ok(Self {
            embedding_len,
            state: Mutex::new(RosterState { store, entries }),
            snapshot: RwLock::new(snapshot),
        })
    }

    pub fn embedding_len(&self) -> usize {
        self.embedding_len
    }

    /// Current immutable view of the roster.
    pub fn snapshot(&self) -> Arc<[RosterEntry]> {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state_of(&self, id: u32) -> Option<AttendanceState> {
        self.snapshot().iter().find(|e| e.id == id).map(RosterEntry::state)
    }

    /// Add a newly enrolled student, replacing any entry with the same id.
    /// The entry starts the session not attended.
    pub fn commit(&self, id: u32, name: &str, embedding: Embedding) -> Result<RosterEntry, RosterError> {
        check_embedding(id, &embedding, self.embedding_len)?;
        let entry = RosterEntry::new(id, name, embedding);

        let mut state = self.lock();
        state.store.upsert(&entry)?;
        match state.entries.iter_mut().find(|e| e.id == id) {
            Some(existing) => *existing = entry.clone(),
            None => state.entries.push(entry.clone()),
        }
        self.publish(&state);

        tracing::info!(id, name, "student enrolled");
        Ok(entry)
    }

    /// Remove a student from the roster.
    pub fn remove(&self, id: u32) -> Result<(), RosterError> {
        let mut state = self.lock();
        let removed = state.store.delete(id)?;
        let before = state.entries.len();
        state.entries.retain(|e| e.id != id);
        if !removed && before == state.entries.len() {
            return Err(RosterError::UnknownStudent(id));
        }
        self.publish(&state);

        tracing::info!(id, "student removed");
        Ok(())
    }

    /// Start a new session: every student goes back to `NotAttended`.
    ///
    /// Returns how many entries were reset.
    pub fn reset_session(&self) -> Result<usize, RosterError> {
        let mut state = self.lock();
        let RosterState { store, entries } = &mut *state;

        let mut reset = 0;
        for entry in entries.iter_mut().filter(|e| e.attended) {
            let mut cleared = entry.clone();
            cleared.attended = false;
            store.upsert(&cleared)?;
            *entry = cleared;
            reset += 1;
        }
        self.publish(&state);

        tracing::info!(reset, "attendance session reset");
        Ok(reset)
    }

    /// Atomically move `id` from `NotAttended` to `Attended`.
    ///
    /// Returns the updated entry if this call performed the transition, or
    /// `None` if the student was already attended. The store write happens
    /// before the in-memory flag flips; if it fails the student stays
    /// `NotAttended`.
    pub fn mark_attended(&self, id: u32) -> Result<Option<RosterEntry>, RosterError> {
        let mut state = self.lock();
        let RosterState { store, entries } = &mut *state;

        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(RosterError::UnknownStudent(id))?;
        if entry.state() == AttendanceState::Attended {
            return Ok(None);
        }

        let mut marked = entry.clone();
        marked.attended = true;
        store.upsert(&marked)?;
        *entry = marked.clone();
        self.publish(&state);

        Ok(Some(marked))
    }

    fn lock(&self) -> MutexGuard<'_, RosterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &RosterState) {
        let snapshot: Arc<[RosterEntry]> = state.entries.clone().into();
        *self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;
    }
}

fn check_embedding(id: u32, embedding: &Embedding, expected: usize) -> Result<(), RosterError> {
    if embedding.len() != expected {
        return Err(RosterError::DimensionMismatch {
            id,
            expected,
            actual: embedding.len(),
        });
    }
    if !embedding.is_finite() {
        return Err(RosterError::NonFinite(id));
    }
    Ok(())
}

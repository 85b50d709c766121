//! presence-store: SQLite persistence for the student roster.
//!
//! Embeddings are stored as little-endian `f32` blobs. Enrollment and
//! attendance times are kept alongside for the record; the core only sees
//! `RosterEntry` values.

use chrono::Utc;
use presence_core::{Embedding, RosterEntry, RosterStore, StoreError};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS students (
    id           INTEGER PRIMARY KEY,
    name         TEXT    NOT NULL,
    embedding    BLOB    NOT NULL,
    attended     INTEGER NOT NULL DEFAULT 0,
    enrolled_at  TEXT    NOT NULL,
    attended_at  TEXT
);
";

/// Roster store backed by a single SQLite database file.
pub struct SqliteRosterStore {
    conn: Connection,
}

impl SqliteRosterStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(Box::new(e)))?;
        }
        let conn = Connection::open(path).map_err(backend)?;
        tracing::debug!(path = %path.display(), "opened roster database");
        Self::with_connection(conn)
    }

    /// Volatile database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(backend)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self { conn })
    }

    /// When `id` was last marked present this session (RFC 3339), if at all.
    pub fn attended_at(&self, id: u32) -> Result<Option<String>, StoreError> {
        let row: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT attended_at FROM students WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        Ok(row.flatten())
    }
}

impl RosterStore for SqliteRosterStore {
    fn get_all(&self) -> Result<Vec<RosterEntry>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, embedding, attended FROM students ORDER BY id")
            .map_err(backend)?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            })
            .map_err(backend)?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, name, blob, attended) = row.map_err(backend)?;
            let embedding = decode_embedding(id, &blob)?;
            entries.push(RosterEntry {
                id,
                name,
                embedding,
                attended,
            });
        }
        Ok(entries)
    }

    fn upsert(&mut self, entry: &RosterEntry) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        // enrolled_at moves only when the embedding changes (re-enrollment),
        // not on attendance updates. attended_at is stamped on the
        // false -> true edge.
        self.conn
            .execute(
                "INSERT INTO students (id, name, embedding, attended, enrolled_at, attended_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, CASE WHEN ?4 THEN ?5 END)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     enrolled_at = CASE
                         WHEN excluded.embedding IS NOT students.embedding THEN excluded.enrolled_at
                         ELSE students.enrolled_at
                     END,
                     embedding = excluded.embedding,
                     attended_at = CASE
                         WHEN excluded.attended AND NOT students.attended THEN ?5
                         WHEN excluded.attended THEN students.attended_at
                     END,
                     attended = excluded.attended",
                params![
                    entry.id,
                    entry.name,
                    encode_embedding(&entry.embedding),
                    entry.attended,
                    now
                ],
            )
            .map_err(backend)?;
        Ok(())
    }

    fn delete(&mut self, id: u32) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute("DELETE FROM students WHERE id = ?1", params![id])
            .map_err(backend)?;
        Ok(n > 0)
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(Box::new(e))
}

fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    embedding
        .values()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn decode_embedding(id: u32, blob: &[u8]) -> Result<Embedding, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Corrupt {
            id,
            reason: format!("embedding blob is {} bytes, not a multiple of 4", blob.len()),
        });
    }
    let values: Vec<f32> = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::Corrupt {
            id,
            reason: "embedding holds NaN or infinity".to_string(),
        });
    }
    Ok(Embedding::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::Roster;

    fn entry(id: u32, name: &str, values: &[f32]) -> RosterEntry {
        RosterEntry::new(id, name, Embedding::new(values.to_vec()))
    }

    #[test]
    fn test_upsert_and_get_all() {
        let mut store = SqliteRosterStore::open_in_memory().unwrap();
        store.upsert(&entry(2, "Grace", &[0.5, -0.25])).unwrap();
        store.upsert(&entry(1, "Ada", &[1.0, 2.0])).unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], entry(1, "Ada", &[1.0, 2.0]));
        assert_eq!(all[1].embedding.values(), &[0.5, -0.25]);
    }

    #[test]
    fn test_upsert_replaces_same_id() {
        let mut store = SqliteRosterStore::open_in_memory().unwrap();
        store.upsert(&entry(1, "Ada", &[1.0])).unwrap();
        store.upsert(&entry(1, "Ada Lovelace", &[3.0])).unwrap();

        let all = store.get_all().unwrap();
        assert_eq!(all, vec![entry(1, "Ada Lovelace", &[3.0])]);
    }

    #[test]
    fn test_attended_at_stamped_on_mark_and_cleared_on_reset() {
        let mut store = SqliteRosterStore::open_in_memory().unwrap();
        let mut e = entry(1, "Ada", &[1.0]);
        store.upsert(&e).unwrap();
        assert_eq!(store.attended_at(1).unwrap(), None);

        e.attended = true;
        store.upsert(&e).unwrap();
        let first = store.attended_at(1).unwrap().expect("stamped");
        store.upsert(&e).unwrap();
        assert_eq!(store.attended_at(1).unwrap(), Some(first));

        e.attended = false;
        store.upsert(&e).unwrap();
        assert_eq!(store.attended_at(1).unwrap(), None);
        assert!(!store.get_all().unwrap()[0].attended);
    }

    #[test]
    fn test_delete() {
        let mut store = SqliteRosterStore::open_in_memory().unwrap();
        store.upsert(&entry(1, "Ada", &[1.0])).unwrap();
        assert!(store.delete(1).unwrap());
        assert!(!store.delete(1).unwrap());
        assert!(store.get_all().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_blob_rejected() {
        let store = SqliteRosterStore::open_in_memory().unwrap();
        store
            .conn
            .execute(
                "INSERT INTO students (id, name, embedding, attended, enrolled_at)
                 VALUES (5, 'Bad', x'010203', 0, '')",
                [],
            )
            .unwrap();
        let err = store.get_all().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { id: 5, .. }));
    }

    #[test]
    fn test_non_finite_blob_rejected() {
        let store = SqliteRosterStore::open_in_memory().unwrap();
        let blob: Vec<u8> = [1.0f32, f32::NAN]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        store
            .conn
            .execute(
                "INSERT INTO students (id, name, embedding, attended, enrolled_at)
                 VALUES (6, 'Nan', ?1, 0, '')",
                params![blob],
            )
            .unwrap();
        let err = store.get_all().unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { id: 6, .. }));
    }

    #[test]
    fn test_persists_across_reopen() {
        let path = std::env::temp_dir().join(format!("presence-store-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        {
            let mut store = SqliteRosterStore::open(&path).unwrap();
            store.upsert(&entry(9, "Linus", &[0.1, 0.2, 0.3])).unwrap();
        }
        let store = SqliteRosterStore::open(&path).unwrap();
        let all = store.get_all().unwrap();
        assert_eq!(all, vec![entry(9, "Linus", &[0.1, 0.2, 0.3])]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_roster_mark_persists() {
        let path = std::env::temp_dir().join(format!("presence-mark-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        {
            let mut store = SqliteRosterStore::open(&path).unwrap();
            store.upsert(&entry(1, "Ada", &[1.0, 0.0])).unwrap();
            let roster = Roster::open(Box::new(store), 2).unwrap();
            assert!(roster.mark_attended(1).unwrap().is_some());
        }
        let store = SqliteRosterStore::open(&path).unwrap();
        assert!(store.get_all().unwrap()[0].attended);
        assert!(store.attended_at(1).unwrap().is_some());
        let _ = std::fs::remove_file(&path);
    }

    fn enrolled_at(store: &SqliteRosterStore, id: u32) -> String {
        store
            .conn
            .query_row("SELECT enrolled_at FROM students WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .unwrap()
    }

    #[test]
    fn test_enrolled_at_moves_only_on_reenrollment() {
        let mut store = SqliteRosterStore::open_in_memory().unwrap();
        let mut e = entry(1, "Ada", &[1.0, 0.0]);
        store.upsert(&e).unwrap();
        store
            .conn
            .execute("UPDATE students SET enrolled_at = 'then' WHERE id = 1", [])
            .unwrap();

        e.attended = true;
        store.upsert(&e).unwrap();
        assert_eq!(enrolled_at(&store, 1), "then");

        store.upsert(&entry(1, "Ada", &[0.0, 1.0])).unwrap();
        assert_ne!(enrolled_at(&store, 1), "then");
    }
}

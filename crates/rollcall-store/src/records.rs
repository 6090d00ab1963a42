//! Record-store collaborator: named collections of JSON documents.
//!
//! This is the external document-store contract the attendance core
//! writes roster entities and attendance events through. Two backends:
//! SQLite for production and an in-memory map for tests and `--dev`
//! runs.

use crate::error::StoreError;
use async_trait::async_trait;
use rusqlite::params;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, OnceCell};
use tokio_rusqlite::Connection;

/// Collection names used by the attendance core.
pub mod collections {
    pub const STUDENTS: &str = "students";
    pub const ATTENDANCE: &str = "attendance";
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Every document in a collection. Order is unspecified.
    async fn list_all(&self, collection: &str) -> Result<Vec<Value>, StoreError>;

    async fn append(&self, collection: &str, record: Value) -> Result<(), StoreError>;

    /// Remove every document matching the predicate; returns the count
    /// removed.
    async fn remove_where(
        &self,
        collection: &str,
        predicate: &(dyn for<'a> Fn(&'a Value) -> bool + Send + Sync),
    ) -> Result<usize, StoreError>;
}

/// SQLite-backed record store. Shares the lazy open-once discipline of
/// the descriptor store.
pub struct SqliteRecordStore {
    db_path: PathBuf,
    conn: OnceCell<Connection>,
}

impl SqliteRecordStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            conn: OnceCell::new(),
        }
    }

    async fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn
            .get_or_try_init(|| open_record_db(&self.db_path))
            .await
    }
}

async fn open_record_db(db_path: &Path) -> Result<Connection, StoreError> {
    if let Some(dir) = db_path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", dir.display())))?;
        }
    }
    let conn = Connection::open(db_path)
        .await
        .map_err(|e| StoreError::Unavailable(format!("{}: {e}", db_path.display())))?;
    conn.call(|c| {
        c.busy_timeout(std::time::Duration::from_secs(5))?;
        c.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                 seq INTEGER PRIMARY KEY AUTOINCREMENT,
                 collection TEXT NOT NULL,
                 body TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_records_collection
                 ON records (collection);",
        )?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    tracing::debug!(path = %db_path.display(), "record store opened");
    Ok(conn)
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn list_all(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        let conn = self.conn().await?;
        let collection = collection.to_string();
        let bodies: Vec<String> = conn
            .call(move |c| {
                let mut stmt = c.prepare("SELECT body FROM records WHERE collection = ?1")?;
                let rows = stmt
                    .query_map(params![collection], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        bodies
            .into_iter()
            .map(|b| serde_json::from_str(&b).map_err(|e| StoreError::Corrupt(e.to_string())))
            .collect()
    }

    async fn append(&self, collection: &str, record: Value) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let collection = collection.to_string();
        let body = record.to_string();
        conn.call(move |c| {
            c.execute(
                "INSERT INTO records (collection, body) VALUES (?1, ?2)",
                params![collection, body],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn remove_where(
        &self,
        collection: &str,
        predicate: &(dyn for<'a> Fn(&'a Value) -> bool + Send + Sync),
    ) -> Result<usize, StoreError> {
        let conn = self.conn().await?;
        let coll = collection.to_string();
        let rows: Vec<(i64, String)> = conn
            .call(move |c| {
                let mut stmt = c.prepare("SELECT seq, body FROM records WHERE collection = ?1")?;
                let rows = stmt
                    .query_map(params![coll], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut doomed = Vec::new();
        for (seq, body) in rows {
            let value: Value =
                serde_json::from_str(&body).map_err(|e| StoreError::Corrupt(e.to_string()))?;
            if predicate(&value) {
                doomed.push(seq);
            }
        }

        let removed = doomed.len();
        if !doomed.is_empty() {
            conn.call(move |c| {
                let tx = c.transaction()?;
                for seq in &doomed {
                    tx.execute("DELETE FROM records WHERE seq = ?1", params![seq])?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        }
        Ok(removed)
    }
}

/// In-memory record store for tests and development runs.
#[derive(Default)]
pub struct MemoryRecordStore {
    data: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn list_all(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        Ok(self
            .data
            .lock()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, collection: &str, record: Value) -> Result<(), StoreError> {
        self.data
            .lock()
            .await
            .entry(collection.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn remove_where(
        &self,
        collection: &str,
        predicate: &(dyn for<'a> Fn(&'a Value) -> bool + Send + Sync),
    ) -> Result<usize, StoreError> {
        let mut data = self.data.lock().await;
        let Some(docs) = data.get_mut(collection) else {
            return Ok(0);
        };
        let before = docs.len();
        docs.retain(|doc| !predicate(doc));
        Ok(before - docs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sqlite_append_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRecordStore::new(dir.path().join("records.db"));
        store
            .append(collections::STUDENTS, json!({"id": "s1"}))
            .await
            .unwrap();
        store
            .append(collections::STUDENTS, json!({"id": "s2"}))
            .await
            .unwrap();
        store
            .append(collections::ATTENDANCE, json!({"student_id": "s1"}))
            .await
            .unwrap();

        let students = store.list_all(collections::STUDENTS).await.unwrap();
        assert_eq!(students.len(), 2);
        let attendance = store.list_all(collections::ATTENDANCE).await.unwrap();
        assert_eq!(attendance.len(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_remove_where() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRecordStore::new(dir.path().join("records.db"));
        store
            .append(collections::ATTENDANCE, json!({"student_id": "s1"}))
            .await
            .unwrap();
        store
            .append(collections::ATTENDANCE, json!({"student_id": "s2"}))
            .await
            .unwrap();

        let removed = store
            .remove_where(collections::ATTENDANCE, &|doc| {
                doc["student_id"] == json!("s1")
            })
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let left = store.list_all(collections::ATTENDANCE).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0]["student_id"], json!("s2"));
    }

    #[tokio::test]
    async fn test_sqlite_list_empty_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRecordStore::new(dir.path().join("records.db"));
        assert!(store.list_all("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_remove_where_missing_collection() {
        let store = MemoryRecordStore::new();
        let removed = store.remove_where("ghost", &|_| true).await.unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn test_memory_roundtrip() {
        let store = MemoryRecordStore::new();
        store.append("c", json!({"k": 1})).await.unwrap();
        store.append("c", json!({"k": 2})).await.unwrap();
        let removed = store
            .remove_where("c", &|doc| doc["k"] == json!(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_all("c").await.unwrap().len(), 1);
    }
}

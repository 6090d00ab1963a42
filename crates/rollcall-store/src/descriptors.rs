//! Persistent student-id → face-descriptor mapping.
//!
//! The SQLite connection opens lazily on first use: every operation
//! awaits the same shared open, so nothing ever runs against an
//! unopened store. An open failure surfaces as
//! [`StoreError::Unavailable`] to all waiters and is retried on the
//! next call.

use crate::error::StoreError;
use rollcall_core::types::Descriptor;
use rusqlite::params;
use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tokio_rusqlite::Connection;

pub struct DescriptorStore {
    db_path: PathBuf,
    conn: OnceCell<Connection>,
}

impl DescriptorStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            conn: OnceCell::new(),
        }
    }

    async fn conn(&self) -> Result<&Connection, StoreError> {
        self.conn
            .get_or_try_init(|| open_descriptor_db(&self.db_path))
            .await
    }

    /// Upsert a descriptor; silently overwrites an existing entry.
    pub async fn put(&self, student_id: &str, descriptor: &Descriptor) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let id = student_id.to_string();
        let blob = encode_descriptor(descriptor);
        conn.call(move |c| {
            c.execute(
                "INSERT INTO descriptors (student_id, descriptor) VALUES (?1, ?2)
                 ON CONFLICT(student_id) DO UPDATE SET descriptor = excluded.descriptor",
                params![id, blob],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    pub async fn get(&self, student_id: &str) -> Result<Option<Descriptor>, StoreError> {
        let conn = self.conn().await?;
        let id = student_id.to_string();
        let blob: Option<Vec<u8>> = conn
            .call(move |c| {
                let mut stmt =
                    c.prepare("SELECT descriptor FROM descriptors WHERE student_id = ?1")?;
                let mut rows = stmt.query(params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await?;
        blob.map(|b| decode_descriptor(&b)).transpose()
    }

    /// All stored descriptors. Order is unspecified; consumers must not
    /// rely on it.
    pub async fn get_all(&self) -> Result<Vec<(String, Descriptor)>, StoreError> {
        let conn = self.conn().await?;
        let rows: Vec<(String, Vec<u8>)> = conn
            .call(|c| {
                let mut stmt = c.prepare("SELECT student_id, descriptor FROM descriptors")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(id, blob)| decode_descriptor(&blob).map(|d| (id, d)))
            .collect()
    }

    /// Delete a descriptor. Idempotent: no error when absent.
    pub async fn delete(&self, student_id: &str) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let id = student_id.to_string();
        conn.call(move |c| {
            c.execute("DELETE FROM descriptors WHERE student_id = ?1", params![id])?;
            Ok(())
        })
        .await?;
        Ok(())
    }
}

async fn open_descriptor_db(db_path: &Path) -> Result<Connection, StoreError> {
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
            "CREATE TABLE IF NOT EXISTS descriptors (
                 student_id TEXT PRIMARY KEY,
                 descriptor BLOB NOT NULL
             )",
        )?;
        Ok(())
    })
    .await
    .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    tracing::debug!(path = %db_path.display(), "descriptor store opened");
    Ok(conn)
}

fn encode_descriptor(descriptor: &Descriptor) -> Vec<u8> {
    let mut blob = Vec::with_capacity(descriptor.values().len() * 4);
    for v in descriptor.values() {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    blob
}

fn decode_descriptor(blob: &[u8]) -> Result<Descriptor, StoreError> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Corrupt(format!(
            "descriptor blob length {} not a multiple of 4",
            blob.len()
        )));
    }
    let values: Vec<f32> = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Descriptor::new(values).map_err(|e| StoreError::Corrupt(e.to_string()))
}

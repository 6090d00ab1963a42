//! rollcall-store — descriptor persistence and the record-store collaborator.
//!
//! The descriptor store holds one biometric descriptor per enrolled
//! student in SQLite. The record store is the external document-store
//! contract used for roster entities and attendance events, with a
//! SQLite backend for production and an in-memory backend for tests and
//! development runs.

pub mod descriptors;
pub mod error;
pub mod records;

pub use descriptors::DescriptorStore;
pub use error::StoreError;
pub use records::{collections, MemoryRecordStore, RecordStore, SqliteRecordStore};

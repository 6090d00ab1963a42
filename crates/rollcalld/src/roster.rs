//! Typed access to the roster and attendance collections of the record
//! store.
//!
//! Documents are tolerantly decoded: a malformed record is logged and
//! skipped rather than failing the whole query, which also covers
//! descriptors whose owning student record never landed.

use chrono::NaiveDate;
use rollcall_core::{AttendanceEvent, Student};
use rollcall_store::{collections, DescriptorStore, RecordStore, StoreError};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

pub async fn students(records: &dyn RecordStore) -> Result<Vec<Student>, StoreError> {
    let docs = records.list_all(collections::STUDENTS).await?;
    Ok(decode_all(docs, "student"))
}

pub async fn find_by_college_id(
    records: &dyn RecordStore,
    college_id: &str,
) -> Result<Option<Student>, StoreError> {
    Ok(students(records)
        .await?
        .into_iter()
        .find(|s| s.college_id == college_id))
}

pub async fn attendance(records: &dyn RecordStore) -> Result<Vec<AttendanceEvent>, StoreError> {
    let docs = records.list_all(collections::ATTENDANCE).await?;
    Ok(decode_all(docs, "attendance event"))
}

/// Events for one day, newest first.
pub async fn attendance_on(
    records: &dyn RecordStore,
    day: NaiveDate,
) -> Result<Vec<AttendanceEvent>, StoreError> {
    let mut events: Vec<_> = attendance(records)
        .await?
        .into_iter()
        .filter(|e| e.day == day)
        .collect();
    events.sort_by_key(|e| std::cmp::Reverse(e.timestamp_ms));
    Ok(events)
}

/// Events for one student, newest first.
pub async fn attendance_for_student(
    records: &dyn RecordStore,
    student_id: &str,
) -> Result<Vec<AttendanceEvent>, StoreError> {
    let mut events: Vec<_> = attendance(records)
        .await?
        .into_iter()
        .filter(|e| e.student_id == student_id)
        .collect();
    events.sort_by_key(|e| std::cmp::Reverse(e.timestamp_ms));
    Ok(events)
}

/// Whether an attendance event already exists for (student, day).
pub async fn is_marked(
    records: &dyn RecordStore,
    student_id: &str,
    day: NaiveDate,
) -> Result<bool, StoreError> {
    Ok(attendance(records)
        .await?
        .iter()
        .any(|e| e.student_id == student_id && e.day == day))
}

/// Remove a student and everything keyed to them: roster record,
/// descriptor, and attendance events. Returns false when no student has
/// the given college id.
pub async fn remove_student(
    records: &dyn RecordStore,
    descriptors: &DescriptorStore,
    college_id: &str,
) -> Result<bool, StoreError> {
    let Some(student) = find_by_college_id(records, college_id).await? else {
        return Ok(false);
    };

    records
        .remove_where(collections::STUDENTS, &|doc| {
            doc.get("id").and_then(Value::as_str) == Some(student.id.as_str())
        })
        .await?;
    let events_removed = records
        .remove_where(collections::ATTENDANCE, &|doc| {
            doc.get("student_id").and_then(Value::as_str) == Some(student.id.as_str())
        })
        .await?;
    descriptors.delete(&student.id).await?;

    tracing::info!(
        college_id,
        student_id = %student.id,
        events_removed,
        "student removed"
    );
    Ok(true)
}

/// One roster row with attendance stats.
#[derive(Debug, Clone, Serialize)]
pub struct RosterEntry {
    #[serde(flatten)]
    pub student: Student,
    pub days_present: usize,
    /// Days present over distinct days that have any recorded
    /// attendance at all. The system has no academic calendar, so this
    /// is the best available denominator.
    pub attendance_pct: f32,
}

pub async fn roster_summary(records: &dyn RecordStore) -> Result<Vec<RosterEntry>, StoreError> {
    let students = students(records).await?;
    let events = attendance(records).await?;

    let all_days: BTreeSet<NaiveDate> = events.iter().map(|e| e.day).collect();
    let mut per_student: HashMap<&str, BTreeSet<NaiveDate>> = HashMap::new();
    for event in &events {
        per_student
            .entry(event.student_id.as_str())
            .or_default()
            .insert(event.day);
    }

    Ok(students
        .into_iter()
        .map(|student| {
            let days_present = per_student
                .get(student.id.as_str())
                .map(BTreeSet::len)
                .unwrap_or(0);
            let attendance_pct = if all_days.is_empty() {
                0.0
            } else {
                days_present as f32 / all_days.len() as f32 * 100.0
            };
            RosterEntry {
                student,
                days_present,
                attendance_pct,
            }
        })
        .collect())
}

fn decode_all<T: serde::de::DeserializeOwned>(docs: Vec<Value>, kind: &str) -> Vec<T> {
    docs.into_iter()
        .filter_map(|doc| match serde_json::from_value(doc) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(error = %e, kind, "skipping malformed record");
                None
            }
        })
        .collect()
}

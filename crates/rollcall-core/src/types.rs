use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a face descriptor vector.
pub const DESCRIPTOR_LEN: usize = 128;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("descriptor must have {DESCRIPTOR_LEN} values, got {0}")]
    BadDescriptorLength(usize),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
}

/// Face descriptor vector produced by the detection capability.
///
/// Immutable once stored; replaced only by deleting the owning student
/// and re-enrolling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    /// Construct from raw values, validating the fixed length.
    pub fn new(values: Vec<f32>) -> Result<Self, RecordError> {
        if values.len() != DESCRIPTOR_LEN {
            return Err(RecordError::BadDescriptorLength(values.len()));
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean distance to another descriptor.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Metadata supplied by the operator when confirming an enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStudent {
    pub name: String,
    pub college_id: String,
    pub roll_number: String,
    pub class_name: String,
}

impl NewStudent {
    /// All fields are required; whitespace-only input counts as missing.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.name.trim().is_empty() {
            return Err(RecordError::MissingField("name"));
        }
        if self.college_id.trim().is_empty() {
            return Err(RecordError::MissingField("college_id"));
        }
        if self.roll_number.trim().is_empty() {
            return Err(RecordError::MissingField("roll_number"));
        }
        if self.class_name.trim().is_empty() {
            return Err(RecordError::MissingField("class_name"));
        }
        Ok(())
    }
}

/// An enrolled student. Keyed internally by `id`; `college_id` is the
/// operator-facing identity key and is unique across the roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    pub name: String,
    pub college_id: String,
    pub roll_number: String,
    pub class_name: String,
    pub registered_at: DateTime<Utc>,
}

impl Student {
    pub fn register(new: NewStudent, id: String) -> Result<Self, RecordError> {
        new.validate()?;
        Ok(Self {
            id,
            name: new.name.trim().to_string(),
            college_id: new.college_id.trim().to_string(),
            roll_number: new.roll_number.trim().to_string(),
            class_name: new.class_name.trim().to_string(),
            registered_at: Utc::now(),
        })
    }
}

/// One presence mark: at most one per (student, day) ever exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: String,
    pub student_id: String,
    pub student_name: String,
    pub roll_number: String,
    pub class_name: String,
    pub day: NaiveDate,
    pub time: String,
    pub timestamp_ms: i64,
}

impl AttendanceEvent {
    pub fn mark(student: &Student, id: String, day: NaiveDate, at: DateTime<Local>) -> Self {
        Self {
            id,
            student_id: student.id.clone(),
            student_name: student.name.clone(),
            roll_number: student.roll_number.clone(),
            class_name: student.class_name.clone(),
            day,
            time: at.format("%H:%M:%S").to_string(),
            timestamp_ms: at.timestamp_millis(),
        }
    }
}

/// Day key for the local calendar day.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// Result of matching a probe descriptor against the enrolled gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub student_id: String,
    /// Euclidean distance of the best match.
    pub distance: f32,
    /// Derived percentage: `(1 - distance) * 100`. Only meaningful for
    /// distances below the match threshold.
    pub confidence: f32,
}

//! rollcall-core — face descriptor extraction and identity matching.
//!
//! Wraps a face detector and a descriptor embedder (both ONNX models run
//! via ONNX Runtime) and provides the Euclidean nearest-match logic used
//! to identify enrolled students.

pub mod extract;
pub mod matcher;
pub mod types;

pub use extract::{DetectOptions, FaceExtractor};
pub use matcher::{Matcher, NearestMatcher};
pub use types::{AttendanceEvent, Descriptor, MatchResult, NewStudent, Student};

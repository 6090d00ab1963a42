//! Enrollment workflow: capture → detect → confirm → persist.
//!
//! State machine: `Idle -> CameraLive -> Captured`, with `retake`
//! returning to `CameraLive` and a successful `confirm` resetting to
//! `CameraLive` for the next enrollment. A failed confirm leaves the
//! workflow in `Captured` so the operator can retry without
//! recapturing.

use crate::capability::DetectCapability;
use rollcall_core::extract::ExtractorError;
use rollcall_core::types::RecordError;
use rollcall_core::{Descriptor, NewStudent, Student};
use rollcall_hw::{is_dark_frame, CameraError, CameraSession, FacingMode, Frame, DARK_FRAME_RATIO};
use rollcall_store::{collections, DescriptorStore, RecordStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("camera is not live")]
    CameraNotLive,
    #[error("no face has been captured")]
    NothingCaptured,
    #[error("a student with college id {0} already exists")]
    DuplicateIdentity(String),
    #[error(transparent)]
    Invalid(#[from] RecordError),
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error(transparent)]
    Extractor(#[from] ExtractorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outcome of a capture attempt. A frame with no detectable face is a
/// normal, retryable outcome, not an error.
#[derive(Debug, PartialEq, Eq)]
pub enum CaptureOutcome {
    Captured,
    NoFace,
}

enum EnrollState {
    Idle,
    CameraLive,
    Captured {
        descriptor: Descriptor,
        photo: Frame,
    },
}

impl EnrollState {
    fn name(&self) -> &'static str {
        match self {
            EnrollState::Idle => "idle",
            EnrollState::CameraLive => "camera_live",
            EnrollState::Captured { .. } => "captured",
        }
    }
}

pub struct EnrollmentWorkflow {
    camera: Arc<Mutex<CameraSession>>,
    capability: Arc<dyn DetectCapability>,
    descriptors: Arc<DescriptorStore>,
    records: Arc<dyn RecordStore>,
    state: Mutex<EnrollState>,
    /// Serializes the duplicate check against the write, so two
    /// confirms for the same college id cannot both pass.
    confirm_lock: Mutex<()>,
}

impl EnrollmentWorkflow {
    pub fn new(
        camera: Arc<Mutex<CameraSession>>,
        capability: Arc<dyn DetectCapability>,
        descriptors: Arc<DescriptorStore>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            camera,
            capability,
            descriptors,
            records,
            state: Mutex::new(EnrollState::Idle),
            confirm_lock: Mutex::new(()),
        }
    }

    /// Start the camera for enrollment, entering `CameraLive`.
    pub async fn open_camera(&self, facing: FacingMode) -> Result<(), EnrollError> {
        let mut state = self.state.lock().await;
        self.camera.lock().await.start(facing)?;
        *state = EnrollState::CameraLive;
        Ok(())
    }

    /// Release the camera and reset to `Idle`, discarding any capture.
    pub async fn close_camera(&self) {
        let mut state = self.state.lock().await;
        self.camera.lock().await.stop();
        *state = EnrollState::Idle;
    }

    /// Toggle the camera facing mode. Keeps the current state.
    pub async fn switch_camera(&self) -> Result<FacingMode, EnrollError> {
        let _state = self.state.lock().await;
        Ok(self.camera.lock().await.switch()?)
    }

    /// Run detection on the current frame. On success, snapshots the
    /// descriptor and the still frame and transitions to `Captured`;
    /// a no-face frame leaves the workflow in `CameraLive`.
    pub async fn capture_face(&self) -> Result<CaptureOutcome, EnrollError> {
        let mut state = self.state.lock().await;
        if !matches!(*state, EnrollState::CameraLive) {
            return Err(EnrollError::CameraNotLive);
        }

        let frame = self.camera.lock().await.capture_frame()?;
        if is_dark_frame(&frame.data, DARK_FRAME_RATIO) {
            tracing::debug!(
                brightness = frame.avg_brightness(),
                "dark capture frame, not running detection"
            );
            return Ok(CaptureOutcome::NoFace);
        }
        match self.capability.detect(&frame).await? {
            None => {
                tracing::debug!("no face detected in capture frame");
                Ok(CaptureOutcome::NoFace)
            }
            Some(descriptor) => {
                *state = EnrollState::Captured {
                    descriptor,
                    photo: frame,
                };
                tracing::info!("face captured");
                Ok(CaptureOutcome::Captured)
            }
        }
    }

    /// Discard the captured snapshot and return to `CameraLive`.
    pub async fn retake(&self) -> Result<(), EnrollError> {
        let mut state = self.state.lock().await;
        match *state {
            EnrollState::Captured { .. } => {
                *state = EnrollState::CameraLive;
                Ok(())
            }
            _ => Err(EnrollError::NothingCaptured),
        }
    }

    /// Persist the captured descriptor under a new student record.
    ///
    /// The college id must be unique among existing enrollments; a
    /// duplicate is rejected before anything is written. The descriptor
    /// lands first, then the roster record — a failure in between
    /// leaves an orphaned descriptor, which matching tolerates by
    /// skipping descriptors with no backing student.
    pub async fn confirm(&self, new: NewStudent) -> Result<Student, EnrollError> {
        new.validate()?;

        let _confirm = self.confirm_lock.lock().await;
        let mut state = self.state.lock().await;
        let descriptor = match &*state {
            EnrollState::Captured { descriptor, .. } => descriptor.clone(),
            _ => return Err(EnrollError::NothingCaptured),
        };

        let college_id = new.college_id.trim().to_string();
        if crate::roster::find_by_college_id(self.records.as_ref(), &college_id)
            .await?
            .is_some()
        {
            return Err(EnrollError::DuplicateIdentity(college_id));
        }

        let student = Student::register(new, uuid::Uuid::new_v4().to_string())?;
        self.descriptors.put(&student.id, &descriptor).await?;
        self.records
            .append(collections::STUDENTS, serde_json::to_value(&student)?)
            .await?;

        *state = EnrollState::CameraLive;
        tracing::info!(
            student_id = %student.id,
            college_id = %student.college_id,
            "student enrolled"
        );
        Ok(student)
    }

    /// Still frame snapshotted by the last successful capture.
    pub async fn captured_photo(&self) -> Option<Frame> {
        match &*self.state.lock().await {
            EnrollState::Captured { photo, .. } => Some(photo.clone()),
            _ => None,
        }
    }

    pub async fn state_name(&self) -> &'static str {
        self.state.lock().await.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{new_student, scripted, zero_descriptor, TestDeps};
    use rollcall_core::types::DESCRIPTOR_LEN;

    #[tokio::test]
    async fn test_capture_requires_live_camera() {
        let deps = TestDeps::new(scripted(vec![Some(zero_descriptor())]));
        let workflow = deps.workflow();
        assert!(matches!(
            workflow.capture_face().await,
            Err(EnrollError::CameraNotLive)
        ));
    }

    #[tokio::test]
    async fn test_no_face_is_retryable() {
        let deps = TestDeps::new(scripted(vec![None, Some(zero_descriptor())]));
        let workflow = deps.workflow();
        workflow.open_camera(FacingMode::Front).await.unwrap();

        assert_eq!(workflow.capture_face().await.unwrap(), CaptureOutcome::NoFace);
        assert_eq!(workflow.state_name().await, "camera_live");
        assert_eq!(
            workflow.capture_face().await.unwrap(),
            CaptureOutcome::Captured
        );
        assert_eq!(workflow.state_name().await, "captured");
    }

    #[tokio::test]
    async fn test_dark_frame_counts_as_no_face() {
        let deps = TestDeps::with_frame_luma(scripted(vec![Some(zero_descriptor())]), 5);
        let workflow = deps.workflow();
        workflow.open_camera(FacingMode::Front).await.unwrap();

        assert_eq!(workflow.capture_face().await.unwrap(), CaptureOutcome::NoFace);
        assert_eq!(workflow.state_name().await, "camera_live");
        // Detection never ran on the unusable frame.
        assert_eq!(
            deps.capability
                .calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn test_retake_discards_snapshot() {
        let deps = TestDeps::new(scripted(vec![Some(zero_descriptor())]));
        let workflow = deps.workflow();
        workflow.open_camera(FacingMode::Front).await.unwrap();
        workflow.capture_face().await.unwrap();
        assert!(workflow.captured_photo().await.is_some());

        workflow.retake().await.unwrap();
        assert_eq!(workflow.state_name().await, "camera_live");
        assert!(workflow.captured_photo().await.is_none());

        assert!(matches!(
            workflow.retake().await,
            Err(EnrollError::NothingCaptured)
        ));
    }

    #[tokio::test]
    async fn test_confirm_without_capture() {
        let deps = TestDeps::new(scripted(vec![]));
        let workflow = deps.workflow();
        workflow.open_camera(FacingMode::Front).await.unwrap();
        assert!(matches!(
            workflow.confirm(new_student("C-001")).await,
            Err(EnrollError::NothingCaptured)
        ));
    }

    #[tokio::test]
    async fn test_confirm_persists_descriptor_then_record() {
        let deps = TestDeps::new(scripted(vec![Some(zero_descriptor())]));
        let workflow = deps.workflow();
        workflow.open_camera(FacingMode::Front).await.unwrap();
        workflow.capture_face().await.unwrap();

        let student = workflow.confirm(new_student("C-001")).await.unwrap();
        assert_eq!(student.college_id, "C-001");
        assert!(deps
            .descriptors
            .get(&student.id)
            .await
            .unwrap()
            .is_some());
        let roster = crate::roster::students(deps.records.as_ref()).await.unwrap();
        assert_eq!(roster.len(), 1);
        // Ready for the next enrollment.
        assert_eq!(workflow.state_name().await, "camera_live");
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected_without_write() {
        let deps = TestDeps::new(scripted(vec![
            Some(zero_descriptor()),
            Some(zero_descriptor()),
        ]));
        let workflow = deps.workflow();
        workflow.open_camera(FacingMode::Front).await.unwrap();
        workflow.capture_face().await.unwrap();
        workflow.confirm(new_student("C-001")).await.unwrap();

        workflow.capture_face().await.unwrap();
        let err = workflow.confirm(new_student("C-001")).await.unwrap_err();
        assert!(matches!(err, EnrollError::DuplicateIdentity(_)));

        // Nothing was written, and the capture survives for a retry
        // with corrected metadata.
        let roster = crate::roster::students(deps.records.as_ref()).await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(deps.descriptors.get_all().await.unwrap().len(), 1);
        assert_eq!(workflow.state_name().await, "captured");

        let mut fixed = new_student("C-002");
        fixed.name = "Another Student".into();
        workflow.confirm(fixed).await.unwrap();
        assert_eq!(
            crate::roster::students(deps.records.as_ref())
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_confirm_validates_metadata() {
        let deps = TestDeps::new(scripted(vec![Some(zero_descriptor())]));
        let workflow = deps.workflow();
        workflow.open_camera(FacingMode::Front).await.unwrap();
        workflow.capture_face().await.unwrap();

        let mut incomplete = new_student("C-001");
        incomplete.roll_number = "  ".into();
        assert!(matches!(
            workflow.confirm(incomplete).await,
            Err(EnrollError::Invalid(RecordError::MissingField(
                "roll_number"
            )))
        ));
    }

    #[tokio::test]
    async fn test_close_camera_resets() {
        let deps = TestDeps::new(scripted(vec![Some(
            rollcall_core::Descriptor::new(vec![0.0; DESCRIPTOR_LEN]).unwrap(),
        )]));
        let workflow = deps.workflow();
        workflow.open_camera(FacingMode::Front).await.unwrap();
        workflow.capture_face().await.unwrap();
        workflow.close_camera().await;
        assert_eq!(workflow.state_name().await, "idle");
        assert!(!deps.camera.lock().await.is_live());
    }
}

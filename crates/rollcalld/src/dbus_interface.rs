use crate::capability::DetectCapability;
use crate::enroll::{CaptureOutcome, EnrollmentWorkflow};
use crate::roster;
use crate::scan::ScanLoop;
use rollcall_core::NewStudent;
use rollcall_hw::FacingMode;
use rollcall_store::{DescriptorStore, RecordStore};
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
///
/// Structured results go over the wire as JSON strings, keeping the
/// interface signature-stable as fields evolve.
pub struct RollcallService {
    pub enrollment: Arc<EnrollmentWorkflow>,
    pub scan: Arc<ScanLoop>,
    pub capability: Arc<dyn DetectCapability>,
    pub descriptors: Arc<DescriptorStore>,
    pub records: Arc<dyn RecordStore>,
}

fn failed(e: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Open the enrollment camera ("front" or "back").
    async fn open_camera(&self, facing: &str) -> zbus::fdo::Result<()> {
        let facing: FacingMode = facing
            .parse()
            .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{e}")))?;
        tracing::info!(?facing, "open_camera requested");
        self.enrollment.open_camera(facing).await.map_err(failed)
    }

    async fn close_camera(&self) -> zbus::fdo::Result<()> {
        self.enrollment.close_camera().await;
        Ok(())
    }

    /// Switch between front and back cameras; returns the new facing.
    async fn switch_camera(&self) -> zbus::fdo::Result<String> {
        let facing = self.enrollment.switch_camera().await.map_err(failed)?;
        Ok(facing.as_str().to_string())
    }

    /// Try to capture a face from the live camera. Returns true when a
    /// face was captured, false when no face was visible.
    async fn capture_face(&self) -> zbus::fdo::Result<bool> {
        match self.enrollment.capture_face().await.map_err(failed)? {
            CaptureOutcome::Captured => Ok(true),
            CaptureOutcome::NoFace => Ok(false),
        }
    }

    /// Discard the captured face and return to the live preview.
    async fn retake(&self) -> zbus::fdo::Result<()> {
        self.enrollment.retake().await.map_err(failed)
    }

    /// Save the captured face under a new student record. Returns the
    /// stored student as JSON.
    async fn confirm_enrollment(
        &self,
        name: &str,
        college_id: &str,
        roll_number: &str,
        class_name: &str,
    ) -> zbus::fdo::Result<String> {
        let new = NewStudent {
            name: name.into(),
            college_id: college_id.into(),
            roll_number: roll_number.into(),
            class_name: class_name.into(),
        };
        tracing::info!(college_id, "enrollment confirmation requested");
        let student = self.enrollment.confirm(new).await.map_err(failed)?;
        serde_json::to_string(&student).map_err(failed)
    }

    /// Start the continuous scan loop, bringing the camera up if no
    /// session holds it. Returns false if it was already running.
    async fn start_scan(&self) -> zbus::fdo::Result<bool> {
        self.scan.start().await.map_err(failed)
    }

    async fn stop_scan(&self) -> zbus::fdo::Result<()> {
        self.scan.stop().await;
        Ok(())
    }

    /// Human-readable outcome of the most recent scan tick.
    async fn scan_status(&self) -> zbus::fdo::Result<String> {
        Ok(self.scan.status().to_string())
    }

    /// Enrolled students with attendance summaries, as a JSON array.
    async fn list_students(&self) -> zbus::fdo::Result<String> {
        let roster = roster::roster_summary(self.records.as_ref())
            .await
            .map_err(failed)?;
        serde_json::to_string(&roster).map_err(failed)
    }

    /// Attendance history for one student (newest first), as JSON.
    async fn attendance_history(&self, student_id: &str) -> zbus::fdo::Result<String> {
        let events = roster::attendance_for_student(self.records.as_ref(), student_id)
            .await
            .map_err(failed)?;
        serde_json::to_string(&events).map_err(failed)
    }

    /// Attendance events recorded today (newest first), as JSON.
    async fn today_feed(&self) -> zbus::fdo::Result<String> {
        let events = roster::attendance_on(self.records.as_ref(), rollcall_core::types::today())
            .await
            .map_err(failed)?;
        serde_json::to_string(&events).map_err(failed)
    }

    /// Remove a student by college id, cascading to their descriptor
    /// and attendance events. Returns false when no such student.
    async fn remove_student(&self, college_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(college_id, "student removal requested");
        roster::remove_student(self.records.as_ref(), &self.descriptors, college_id)
            .await
            .map_err(failed)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "models_loaded": self.capability.loaded(),
            "scan_running": self.scan.is_running().await,
            "enrollment_state": self.enrollment.state_name().await,
        })
        .to_string())
    }
}

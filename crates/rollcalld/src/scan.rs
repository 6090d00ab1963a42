//! Continuous scan loop: capture → detect → match → record, on a fixed
//! interval, with reentrancy protection.
//!
//! Each tick failure is converted to a reported status; nothing inside
//! a tick can kill the loop. `stop` guarantees no tick fires after it
//! returns — an in-flight tick is allowed to finish first.

use crate::capability::DetectCapability;
use crate::roster;
use rollcall_core::types::today;
use rollcall_core::{AttendanceEvent, Descriptor, Matcher, Student};
use rollcall_hw::{is_dark_frame, CameraError, CameraSession, FacingMode, DARK_FRAME_RATIO};
use rollcall_store::{collections, DescriptorStore, RecordStore, StoreError};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Outcome of one scan tick, also used as the display status.
#[derive(Debug, Clone, PartialEq)]
pub enum TickReport {
    /// Loop not running, or no tick has completed yet.
    Idle,
    /// A previous tick was still in flight; this one did nothing.
    Busy,
    NoFace,
    /// A face was found but nobody enrolled matched it.
    Unrecognized,
    AlreadyMarked { name: String },
    Marked { name: String, confidence: f32 },
    Failed { reason: String },
}

impl fmt::Display for TickReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickReport::Idle => write!(f, "scanner idle"),
            TickReport::Busy => write!(f, "previous scan still in progress"),
            TickReport::NoFace => write!(f, "no face detected"),
            TickReport::Unrecognized => write!(f, "face not recognized"),
            TickReport::AlreadyMarked { name } => {
                write!(f, "{name} already marked present today")
            }
            TickReport::Marked { name, confidence } => {
                write!(f, "attendance marked for {name} ({confidence:.1}% confidence)")
            }
            TickReport::Failed { reason } => write!(f, "scan failed: {reason}"),
        }
    }
}

struct RunningScan {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    /// Whether `start` acquired the camera itself. A camera that was
    /// already live (e.g. enrollment in progress) stays live on stop.
    release_camera: bool,
}

pub struct ScanLoop {
    camera: Arc<Mutex<CameraSession>>,
    capability: Arc<dyn DetectCapability>,
    descriptors: Arc<DescriptorStore>,
    records: Arc<dyn RecordStore>,
    matcher: Box<dyn Matcher + Send + Sync>,
    threshold: f32,
    confidence_floor: f32,
    interval: Duration,
    /// Reentrancy guard: a tick firing while another is unresolved
    /// becomes a no-op.
    in_flight: AtomicBool,
    running: Mutex<Option<RunningScan>>,
    status: watch::Sender<TickReport>,
}

impl ScanLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: Arc<Mutex<CameraSession>>,
        capability: Arc<dyn DetectCapability>,
        descriptors: Arc<DescriptorStore>,
        records: Arc<dyn RecordStore>,
        matcher: Box<dyn Matcher + Send + Sync>,
        threshold: f32,
        confidence_floor: f32,
        interval: Duration,
    ) -> Self {
        let (status, _) = watch::channel(TickReport::Idle);
        Self {
            camera,
            capability,
            descriptors,
            records,
            matcher,
            threshold,
            confidence_floor,
            interval,
            in_flight: AtomicBool::new(false),
            running: Mutex::new(None),
            status,
        }
    }

    /// Begin ticking on the configured interval, acquiring the camera
    /// if nothing else holds it live. Returns Ok(false) if the loop is
    /// already running.
    pub async fn start(self: &Arc<Self>) -> Result<bool, CameraError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(false);
        }

        let release_camera = {
            let mut camera = self.camera.lock().await;
            if camera.is_live() {
                false
            } else {
                camera.start(FacingMode::Front)?;
                true
            }
        };

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let scan = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scan.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        scan.scan_once().await;
                    }
                }
            }
            tracing::debug!("scan task exiting");
        });

        *running = Some(RunningScan {
            shutdown: shutdown_tx,
            task,
            release_camera,
        });
        tracing::info!(interval_ms = self.interval.as_millis() as u64, "scan loop started");
        Ok(true)
    }

    /// Stop ticking. Idempotent. When this returns, no further tick
    /// will fire; an in-flight tick has already completed. Releases the
    /// camera if `start` acquired it.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if let Some(run) = running.take() {
            let _ = run.shutdown.send(true);
            let _ = run.task.await;
            if run.release_camera {
                self.camera.lock().await.stop();
            }
            self.status.send_replace(TickReport::Idle);
            tracing::info!("scan loop stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Most recent tick outcome.
    pub fn status(&self) -> TickReport {
        self.status.borrow().clone()
    }

    /// Watch tick outcomes as they happen.
    pub fn subscribe(&self) -> watch::Receiver<TickReport> {
        self.status.subscribe()
    }

    /// Run a single tick now. No-ops with [`TickReport::Busy`] when a
    /// previous tick is still unresolved.
    pub async fn scan_once(&self) -> TickReport {
        if self.in_flight.swap(true, Ordering::Acquire) {
            return TickReport::Busy;
        }
        let report = self.run_tick().await;
        self.in_flight.store(false, Ordering::Release);

        match &report {
            TickReport::Marked { name, confidence } => {
                tracing::info!(name = %name, confidence, "attendance marked");
            }
            TickReport::AlreadyMarked { name } => {
                tracing::debug!(name = %name, "already marked today");
            }
            TickReport::Failed { reason } => {
                tracing::warn!(reason = %reason, "scan tick failed");
            }
            _ => {}
        }
        self.status.send_replace(report.clone());
        report
    }

    async fn run_tick(&self) -> TickReport {
        let frame = {
            let mut camera = self.camera.lock().await;
            match camera.capture_frame() {
                Ok(frame) => frame,
                Err(e) => return TickReport::Failed { reason: e.to_string() },
            }
        };

        // Not worth running inference on a covered or unlit lens.
        if is_dark_frame(&frame.data, DARK_FRAME_RATIO) {
            tracing::debug!(
                brightness = frame.avg_brightness(),
                "dark frame, skipping detection"
            );
            return TickReport::NoFace;
        }

        let descriptor = match self.capability.detect(&frame).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => return TickReport::NoFace,
            Err(e) => return TickReport::Failed { reason: e.to_string() },
        };

        let (gallery, students) = match self.enrolled_gallery().await {
            Ok(g) => g,
            Err(e) => return TickReport::Failed { reason: e.to_string() },
        };

        let Some(matched) = self
            .matcher
            .find_best(&descriptor, &gallery, self.threshold)
        else {
            return TickReport::Unrecognized;
        };
        // Secondary confidence floor on top of the distance threshold.
        if matched.confidence <= self.confidence_floor {
            return TickReport::Unrecognized;
        }
        let Some(student) = students.get(&matched.student_id) else {
            return TickReport::Unrecognized;
        };

        self.mark_if_unmarked(student, matched.confidence).await
    }

    /// The duplicate check and the write are not atomic, but ticks are
    /// serialized by the in-flight guard, so the pair cannot race with
    /// itself.
    async fn mark_if_unmarked(&self, student: &Student, confidence: f32) -> TickReport {
        let day = today();
        match roster::is_marked(self.records.as_ref(), &student.id, day).await {
            Err(e) => return TickReport::Failed { reason: e.to_string() },
            Ok(true) => {
                return TickReport::AlreadyMarked {
                    name: student.name.clone(),
                }
            }
            Ok(false) => {}
        }

        let event = AttendanceEvent::mark(
            student,
            uuid::Uuid::new_v4().to_string(),
            day,
            chrono::Local::now(),
        );
        let doc = match serde_json::to_value(&event) {
            Ok(doc) => doc,
            Err(e) => return TickReport::Failed { reason: e.to_string() },
        };
        if let Err(e) = self.records.append(collections::ATTENDANCE, doc).await {
            return TickReport::Failed { reason: e.to_string() };
        }

        TickReport::Marked {
            name: student.name.clone(),
            confidence,
        }
    }

    /// Stored descriptors joined against the roster. Descriptors with
    /// no backing student record (orphans from interrupted enrollments)
    /// are skipped, not errors.
    async fn enrolled_gallery(
        &self,
    ) -> Result<(Vec<(String, Descriptor)>, HashMap<String, Student>), StoreError> {
        let stored = self.descriptors.get_all().await?;
        let students: HashMap<String, Student> = roster::students(self.records.as_ref())
            .await?
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();

        let mut gallery = Vec::with_capacity(stored.len());
        for (id, descriptor) in stored {
            if students.contains_key(&id) {
                gallery.push((id, descriptor));
            } else {
                tracing::debug!(student_id = %id, "skipping orphaned descriptor");
            }
        }
        Ok((gallery, students))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enroll::CaptureOutcome;
    use crate::testutil::{
        descriptor_at, new_student, scripted, scripted_gated, zero_descriptor, TestDeps,
    };
    use rollcall_core::NearestMatcher;
    use rollcall_hw::FacingMode;
    use std::sync::atomic::Ordering as AtomicOrdering;
    use tokio::sync::Notify;

    async fn enroll(deps: &TestDeps, college_id: &str) -> Student {
        let student = Student::register(new_student(college_id), format!("id-{college_id}"))
            .unwrap();
        deps.records
            .append(collections::STUDENTS, serde_json::to_value(&student).unwrap())
            .await
            .unwrap();
        deps.descriptors
            .put(&student.id, &zero_descriptor())
            .await
            .unwrap();
        student
    }

    #[tokio::test]
    async fn test_marks_once_per_day() {
        let deps = TestDeps::new(scripted(vec![
            Some(descriptor_at(0.1)),
            Some(descriptor_at(0.1)),
        ]));
        let student = enroll(&deps, "C-001").await;
        deps.camera.lock().await.start(FacingMode::Front).unwrap();
        let scan = deps.scan_loop();

        let first = scan.scan_once().await;
        match first {
            TickReport::Marked { ref name, confidence } => {
                assert_eq!(name, &student.name);
                assert!((confidence - 90.0).abs() < 1e-3);
            }
            other => panic!("expected Marked, got {other:?}"),
        }

        let second = scan.scan_once().await;
        assert_eq!(
            second,
            TickReport::AlreadyMarked {
                name: student.name.clone()
            }
        );

        let events = roster::attendance(deps.records.as_ref()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].student_id, student.id);
        assert_eq!(events[0].day, today());
        assert_eq!(scan.status(), second);
    }

    #[tokio::test]
    async fn test_no_face_writes_nothing() {
        let deps = TestDeps::new(scripted(vec![None]));
        enroll(&deps, "C-001").await;
        deps.camera.lock().await.start(FacingMode::Front).unwrap();
        let scan = deps.scan_loop();

        assert_eq!(scan.scan_once().await, TickReport::NoFace);
        assert!(roster::attendance(deps.records.as_ref())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_face_is_unrecognized() {
        let deps = TestDeps::new(scripted(vec![Some(descriptor_at(0.7))]));
        enroll(&deps, "C-001").await;
        deps.camera.lock().await.start(FacingMode::Front).unwrap();
        let scan = deps.scan_loop();

        assert_eq!(scan.scan_once().await, TickReport::Unrecognized);
        assert!(roster::attendance(deps.records.as_ref())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_confidence_floor_applies_after_threshold() {
        // With a loose distance threshold, a distant match can pass the
        // threshold yet fall under the 40% confidence floor.
        let deps = TestDeps::new(scripted(vec![Some(descriptor_at(0.8))]));
        enroll(&deps, "C-001").await;
        deps.camera.lock().await.start(FacingMode::Front).unwrap();
        let scan = Arc::new(ScanLoop::new(
            Arc::clone(&deps.camera),
            deps.capability.clone() as Arc<dyn DetectCapability>,
            Arc::clone(&deps.descriptors),
            deps.records.clone() as Arc<dyn RecordStore>,
            Box::new(NearestMatcher),
            0.9,
            40.0,
            Duration::from_millis(20),
        ));

        assert_eq!(scan.scan_once().await, TickReport::Unrecognized);
    }

    #[tokio::test]
    async fn test_orphaned_descriptor_is_skipped() {
        let deps = TestDeps::new(scripted(vec![
            Some(descriptor_at(0.1)),
            Some(descriptor_at(0.1)),
        ]));
        deps.camera.lock().await.start(FacingMode::Front).unwrap();
        let scan = deps.scan_loop();

        // Descriptor with no backing student record: never matches.
        deps.descriptors
            .put("ghost", &zero_descriptor())
            .await
            .unwrap();
        assert_eq!(scan.scan_once().await, TickReport::Unrecognized);

        // A real enrollment farther from the probe still wins, because
        // the orphan never enters the gallery.
        let student = Student::register(new_student("C-001"), "id-C-001".into()).unwrap();
        deps.records
            .append(collections::STUDENTS, serde_json::to_value(&student).unwrap())
            .await
            .unwrap();
        deps.descriptors
            .put(&student.id, &descriptor_at(0.3))
            .await
            .unwrap();
        match scan.scan_once().await {
            TickReport::Marked { name, .. } => assert_eq!(name, student.name),
            other => panic!("expected Marked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_noop() {
        let gate = Arc::new(Notify::new());
        let capability = scripted_gated(vec![None], Arc::clone(&gate));
        let deps = TestDeps::new(Arc::clone(&capability));
        deps.camera.lock().await.start(FacingMode::Front).unwrap();
        let scan = deps.scan_loop();

        let held = {
            let scan = Arc::clone(&scan);
            tokio::spawn(async move { scan.scan_once().await })
        };
        // Wait until the first tick's detection is actually in flight.
        while capability.calls.load(AtomicOrdering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        assert_eq!(scan.scan_once().await, TickReport::Busy);

        gate.notify_one();
        assert_eq!(held.await.unwrap(), TickReport::NoFace);
        // Only the first tick ever reached the capability.
        assert_eq!(capability.calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_prevents_further_ticks() {
        let deps = TestDeps::new(scripted(vec![]));
        deps.camera.lock().await.start(FacingMode::Front).unwrap();
        let scan = deps.scan_loop();

        assert!(scan.start().await.unwrap());
        assert!(!scan.start().await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scan.is_running().await);

        scan.stop().await;
        assert!(!scan.is_running().await);
        let calls_at_stop = deps.capability.calls.load(AtomicOrdering::SeqCst);
        assert!(calls_at_stop >= 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            deps.capability.calls.load(AtomicOrdering::SeqCst),
            calls_at_stop
        );

        // Idempotent.
        scan.stop().await;
    }

    #[tokio::test]
    async fn test_tick_failure_reports_without_killing_loop() {
        let deps = TestDeps::new(scripted(vec![]));
        let scan = deps.scan_loop();

        assert!(scan.start().await.unwrap());
        // Yank the camera out from under the loop: every tick fails,
        // the loop keeps going.
        deps.camera.lock().await.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scan.is_running().await);
        assert!(matches!(scan.status(), TickReport::Failed { .. }));
        scan.stop().await;
        assert_eq!(scan.status(), TickReport::Idle);
    }

    #[tokio::test]
    async fn test_start_acquires_camera_and_stop_releases_it() {
        let deps = TestDeps::new(scripted(vec![]));
        let scan = deps.scan_loop();

        assert!(!deps.camera.lock().await.is_live());
        assert!(scan.start().await.unwrap());
        assert!(deps.camera.lock().await.is_live());

        // Ticks capture real frames instead of failing on a dead
        // session.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scan.status(), TickReport::NoFace);

        scan.stop().await;
        assert!(!deps.camera.lock().await.is_live());
    }

    #[tokio::test]
    async fn test_stop_leaves_externally_opened_camera_live() {
        let deps = TestDeps::new(scripted(vec![]));
        deps.camera.lock().await.start(FacingMode::Front).unwrap();
        let scan = deps.scan_loop();

        assert!(scan.start().await.unwrap());
        scan.stop().await;
        // The session predates the loop (e.g. an enrollment in
        // progress), so stopping the loop must not tear it down.
        assert!(deps.camera.lock().await.is_live());
    }

    #[tokio::test]
    async fn test_dark_frame_skips_detection() {
        let deps = TestDeps::with_frame_luma(scripted(vec![Some(descriptor_at(0.1))]), 5);
        enroll(&deps, "C-001").await;
        deps.camera.lock().await.start(FacingMode::Front).unwrap();
        let scan = deps.scan_loop();

        assert_eq!(scan.scan_once().await, TickReport::NoFace);
        // The extractor never ran.
        assert_eq!(deps.capability.calls.load(AtomicOrdering::SeqCst), 0);
        assert!(roster::attendance(deps.records.as_ref())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_enrollment_then_scan_marks_same_student() {
        let deps = TestDeps::new(scripted(vec![
            Some(zero_descriptor()),
            Some(descriptor_at(0.1)),
            Some(descriptor_at(0.1)),
        ]));
        let workflow = deps.workflow();
        workflow.open_camera(FacingMode::Front).await.unwrap();
        assert_eq!(
            workflow.capture_face().await.unwrap(),
            CaptureOutcome::Captured
        );
        let student = workflow.confirm(new_student("C-042")).await.unwrap();

        let scan = deps.scan_loop();
        match scan.scan_once().await {
            TickReport::Marked { name, .. } => assert_eq!(name, student.name),
            other => panic!("expected Marked, got {other:?}"),
        }
        assert_eq!(
            scan.scan_once().await,
            TickReport::AlreadyMarked {
                name: student.name.clone()
            }
        );

        let events = roster::attendance(deps.records.as_ref()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].student_id, student.id);
        assert_eq!(events[0].roll_number, student.roll_number);
    }
}

//! Shared test doubles for the daemon: a scripted detection capability,
//! a static frame provider, and pre-wired component bundles.

use crate::capability::DetectCapability;
use crate::enroll::EnrollmentWorkflow;
use crate::scan::ScanLoop;
use async_trait::async_trait;
use rollcall_core::extract::ExtractorError;
use rollcall_core::types::DESCRIPTOR_LEN;
use rollcall_core::{Descriptor, NearestMatcher, NewStudent};
use rollcall_hw::{CameraError, CameraSession, DeviceProvider, FacingMode, Frame, FrameSource};
use rollcall_store::{DescriptorStore, MemoryRecordStore, RecordStore};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

pub fn zero_descriptor() -> Descriptor {
    Descriptor::new(vec![0.0; DESCRIPTOR_LEN]).unwrap()
}

/// Descriptor at the given Euclidean distance from [`zero_descriptor`].
pub fn descriptor_at(distance: f32) -> Descriptor {
    let mut values = vec![0.0f32; DESCRIPTOR_LEN];
    values[0] = distance;
    Descriptor::new(values).unwrap()
}

pub fn new_student(college_id: &str) -> NewStudent {
    NewStudent {
        name: "Asha Rao".into(),
        college_id: college_id.into(),
        roll_number: "17".into(),
        class_name: "CS-A".into(),
    }
}

/// Capability returning a scripted sequence of detection results; an
/// exhausted script keeps returning "no face". With a gate set, every
/// detect call waits for one `notify_one` before resolving, letting
/// tests hold a detection in flight.
pub struct ScriptedCapability {
    replies: Mutex<VecDeque<Option<Descriptor>>>,
    pub calls: AtomicUsize,
    pub gate: Option<Arc<Notify>>,
}

pub fn scripted(replies: Vec<Option<Descriptor>>) -> Arc<ScriptedCapability> {
    Arc::new(ScriptedCapability {
        replies: Mutex::new(replies.into()),
        calls: AtomicUsize::new(0),
        gate: None,
    })
}

pub fn scripted_gated(
    replies: Vec<Option<Descriptor>>,
    gate: Arc<Notify>,
) -> Arc<ScriptedCapability> {
    Arc::new(ScriptedCapability {
        replies: Mutex::new(replies.into()),
        calls: AtomicUsize::new(0),
        gate: Some(gate),
    })
}

#[async_trait]
impl DetectCapability for ScriptedCapability {
    async fn detect(&self, _frame: &Frame) -> Result<Option<Descriptor>, ExtractorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(self.replies.lock().await.pop_front().unwrap_or(None))
    }

    fn loaded(&self) -> bool {
        true
    }
}

struct StaticSource {
    luma: u8,
}

impl FrameSource for StaticSource {
    fn grab(&mut self) -> Result<Frame, CameraError> {
        Ok(Frame {
            data: vec![self.luma; 4],
            width: 2,
            height: 2,
            timestamp: std::time::Instant::now(),
            sequence: 0,
        })
    }
}

struct StaticProvider {
    luma: u8,
}

impl DeviceProvider for StaticProvider {
    fn acquire(&self, _facing: FacingMode) -> Result<Box<dyn FrameSource>, CameraError> {
        Ok(Box::new(StaticSource { luma: self.luma }))
    }
}

/// Pre-wired component bundle backed by fakes and a temp-dir SQLite
/// descriptor store.
pub struct TestDeps {
    pub camera: Arc<Mutex<CameraSession>>,
    pub capability: Arc<ScriptedCapability>,
    pub descriptors: Arc<DescriptorStore>,
    pub records: Arc<MemoryRecordStore>,
    _tmp: tempfile::TempDir,
}

impl TestDeps {
    pub fn new(capability: Arc<ScriptedCapability>) -> Self {
        Self::with_frame_luma(capability, 128)
    }

    /// Like [`TestDeps::new`] but the fake camera emits frames of the
    /// given uniform brightness.
    pub fn with_frame_luma(capability: Arc<ScriptedCapability>, luma: u8) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        Self {
            camera: Arc::new(Mutex::new(CameraSession::new(Box::new(StaticProvider {
                luma,
            })))),
            capability,
            descriptors: Arc::new(DescriptorStore::new(tmp.path().join("faces.db"))),
            records: Arc::new(MemoryRecordStore::new()),
            _tmp: tmp,
        }
    }

    pub fn workflow(&self) -> EnrollmentWorkflow {
        EnrollmentWorkflow::new(
            Arc::clone(&self.camera),
            self.capability.clone() as Arc<dyn DetectCapability>,
            Arc::clone(&self.descriptors),
            self.records.clone() as Arc<dyn RecordStore>,
        )
    }

    pub fn scan_loop(&self) -> Arc<ScanLoop> {
        Arc::new(ScanLoop::new(
            Arc::clone(&self.camera),
            self.capability.clone() as Arc<dyn DetectCapability>,
            Arc::clone(&self.descriptors),
            self.records.clone() as Arc<dyn RecordStore>,
            Box::new(NearestMatcher),
            0.6,
            40.0,
            Duration::from_millis(20),
        ))
    }
}

//! Face-detection capability adapter.
//!
//! The underlying model is opaque to the rest of the daemon: a frame
//! goes in, at most one descriptor comes out. [`ModelGate`] adds the
//! load-once discipline on top of the blocking extractor — the first
//! caller triggers the load, concurrent first callers await the same
//! in-flight load, and a failed load leaves the gate unloaded so the
//! next call retries.

use async_trait::async_trait;
use rollcall_core::extract::ExtractorError;
use rollcall_core::{Descriptor, DetectOptions, FaceExtractor};
use rollcall_hw::Frame;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

#[async_trait]
pub trait DetectCapability: Send + Sync {
    /// Detect a face descriptor in a frame. `Ok(None)` means no face —
    /// a normal outcome, not a failure.
    async fn detect(&self, frame: &Frame) -> Result<Option<Descriptor>, ExtractorError>;

    /// Whether the underlying model has finished loading.
    fn loaded(&self) -> bool;
}

/// Loads a blocking extractor. Separate from the gate so tests can
/// observe how many loads actually happen.
pub trait ExtractorLoader: Send + Sync + 'static {
    type Extractor: BlockingDetect;

    fn load(&self) -> Result<Self::Extractor, ExtractorError>;
}

/// The synchronous detect surface of a loaded extractor.
pub trait BlockingDetect: Send + 'static {
    fn detect_descriptor(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<Descriptor>, ExtractorError>;
}

impl BlockingDetect for FaceExtractor {
    fn detect_descriptor(
        &mut self,
        frame: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Option<Descriptor>, ExtractorError> {
        FaceExtractor::detect_descriptor(self, frame, width, height)
    }
}

/// Production loader for the ONNX extractor.
pub struct OnnxLoader {
    detector_path: String,
    embedder_path: String,
    options: DetectOptions,
}

impl OnnxLoader {
    pub fn new(detector_path: String, embedder_path: String, options: DetectOptions) -> Self {
        Self {
            detector_path,
            embedder_path,
            options,
        }
    }
}

impl ExtractorLoader for OnnxLoader {
    type Extractor = FaceExtractor;

    fn load(&self) -> Result<FaceExtractor, ExtractorError> {
        FaceExtractor::load(&self.detector_path, &self.embedder_path, self.options)
    }
}

/// Load-once gate around a blocking extractor. Inference runs on the
/// blocking pool; the extractor itself is single-flight behind a mutex.
pub struct ModelGate<L: ExtractorLoader> {
    loader: Arc<L>,
    model: OnceCell<Arc<Mutex<L::Extractor>>>,
}

impl<L: ExtractorLoader> ModelGate<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader: Arc::new(loader),
            model: OnceCell::new(),
        }
    }

    async fn model(&self) -> Result<Arc<Mutex<L::Extractor>>, ExtractorError> {
        self.model
            .get_or_try_init(|| {
                let loader = Arc::clone(&self.loader);
                async move {
                    tracing::info!("loading face models");
                    tokio::task::spawn_blocking(move || {
                        loader.load().map(|m| Arc::new(Mutex::new(m)))
                    })
                    .await
                    .map_err(|e| ExtractorError::ModelLoad(format!("load task failed: {e}")))?
                }
            })
            .await
            .map(Arc::clone)
    }
}

#[async_trait]
impl<L: ExtractorLoader> DetectCapability for ModelGate<L> {
    async fn detect(&self, frame: &Frame) -> Result<Option<Descriptor>, ExtractorError> {
        let model = self.model().await?;
        let data = frame.data.clone();
        let (width, height) = (frame.width, frame.height);
        tokio::task::spawn_blocking(move || {
            let mut extractor = model
                .lock()
                .map_err(|_| ExtractorError::Inference("extractor mutex poisoned".into()))?;
            extractor.detect_descriptor(&data, width, height)
        })
        .await
        .map_err(|e| ExtractorError::Inference(format!("detect task failed: {e}")))?
    }

    fn loaded(&self) -> bool {
        self.model.initialized()
    }
}

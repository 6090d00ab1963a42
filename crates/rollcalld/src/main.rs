use anyhow::Result;
use rollcall_core::NearestMatcher;
use rollcall_hw::{CameraSession, V4lProvider};
use rollcall_store::{DescriptorStore, RecordStore, SqliteRecordStore};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

mod capability;
mod config;
mod dbus_interface;
mod enroll;
mod roster;
mod scan;
#[cfg(test)]
mod testutil;

use capability::{DetectCapability, ModelGate, OnnxLoader};
use config::Config;
use dbus_interface::RollcallService;
use enroll::EnrollmentWorkflow;
use scan::ScanLoop;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        models = %config.model_dir.display(),
        "rollcalld starting"
    );

    let provider = V4lProvider::new(
        config.front_camera_device.clone(),
        config.back_camera_device.clone(),
    );
    let camera = Arc::new(Mutex::new(CameraSession::new(Box::new(provider))));

    let descriptors = Arc::new(DescriptorStore::new(config.db_path.clone()));
    let records: Arc<dyn RecordStore> =
        Arc::new(SqliteRecordStore::new(config.db_path.clone()));

    // Models load lazily on the first detection, deduplicated across
    // concurrent callers.
    let loader = OnnxLoader::new(
        config.detector_model_path(),
        config.embedder_model_path(),
        config.detect_options(),
    );
    let capability: Arc<dyn DetectCapability> = Arc::new(ModelGate::new(loader));

    let enrollment = Arc::new(EnrollmentWorkflow::new(
        Arc::clone(&camera),
        Arc::clone(&capability),
        Arc::clone(&descriptors),
        Arc::clone(&records),
    ));
    let scan = Arc::new(ScanLoop::new(
        Arc::clone(&camera),
        Arc::clone(&capability),
        Arc::clone(&descriptors),
        Arc::clone(&records),
        Box::new(NearestMatcher),
        config.match_threshold,
        config.confidence_floor,
        config.scan_interval,
    ));

    let service = RollcallService {
        enrollment: Arc::clone(&enrollment),
        scan: Arc::clone(&scan),
        capability,
        descriptors,
        records,
    };

    let _conn = zbus::connection::Builder::session()?
        .name("org.rollcall.Rollcall1")?
        .serve_at("/org/rollcall/Rollcall1", service)?
        .build()
        .await?;

    tracing::info!("rollcalld ready on org.rollcall.Rollcall1");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    scan.stop().await;
    enrollment.close_camera().await;

    Ok(())
}

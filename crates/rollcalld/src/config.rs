use rollcall_core::DetectOptions;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// V4L2 device path for the front camera (default: /dev/video0).
    pub front_camera_device: String,
    /// Optional V4L2 device path for the back camera.
    pub back_camera_device: Option<String>,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub match_threshold: f32,
    /// Secondary confidence floor (percent) applied by the scan loop.
    pub confidence_floor: f32,
    /// Interval between scan ticks.
    pub scan_interval: Duration,
    /// Minimum detector score for a box to count as a face.
    pub detect_min_score: f32,
    /// Square input size the detector letterboxes frames into.
    pub detect_input_size: usize,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with
    /// defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("models"));

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("rollcall.db"));

        Self {
            front_camera_device: std::env::var("ROLLCALL_FRONT_CAMERA")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            back_camera_device: std::env::var("ROLLCALL_BACK_CAMERA").ok(),
            model_dir,
            db_path,
            match_threshold: env_f32("ROLLCALL_MATCH_THRESHOLD", 0.6),
            confidence_floor: env_f32("ROLLCALL_CONFIDENCE_FLOOR", 40.0),
            scan_interval: Duration::from_millis(env_u64("ROLLCALL_SCAN_INTERVAL_MS", 2000)),
            detect_min_score: env_f32("ROLLCALL_DETECT_MIN_SCORE", 0.5),
            detect_input_size: env_usize("ROLLCALL_DETECT_INPUT_SIZE", 416),
        }
    }

    /// Path to the face-detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join("face_det.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the descriptor-embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join("face_rec_128d.onnx")
            .to_string_lossy()
            .into_owned()
    }

    pub fn detect_options(&self) -> DetectOptions {
        DetectOptions {
            min_score: self.detect_min_score,
            input_size: self.detect_input_size,
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

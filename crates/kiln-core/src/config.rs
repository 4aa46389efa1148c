//! Environment-driven configuration.
//!
//! Every knob comes from an environment variable with a production-safe
//! default. Malformed values fall back to the default with a warning
//! rather than aborting startup.

use std::path::PathBuf;

use tracing::warn;

/// Runtime configuration for the whole service.
#[derive(Debug, Clone)]
pub struct KilnConfig {
    /// LLM model ids to preload at startup (comma-separated `MODEL_IDS`).
    pub model_ids: Vec<String>,
    /// Tensor-parallel degree hint forwarded to the LLM engine.
    pub tensor_parallel_size: u32,
    /// Fraction of GPU memory the LLM engine may claim.
    pub gpu_memory_utilization: f64,
    /// Maximum sequence length hint forwarded to the LLM engine.
    pub max_model_len: u32,
    /// Default text-to-image model.
    pub image_model: String,
    /// Default image-to-image model.
    pub image2image_model: String,
    /// Default video model.
    pub video_model: String,
    pub enable_image: bool,
    pub enable_image2image: bool,
    pub enable_video: bool,
    /// Redis endpoint for the task store.
    pub redis_url: String,
    /// Task record lifetime in hours.
    pub task_ttl_hours: u64,
    /// TCP port for the HTTP surface.
    pub port: u16,
    /// Directory receiving encoded video containers.
    pub output_dir: PathBuf,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            model_ids: Vec::new(),
            tensor_parallel_size: 1,
            gpu_memory_utilization: 0.95,
            max_model_len: 8192,
            image_model: "Tongyi-MAI/Z-Image-Turbo".to_string(),
            image2image_model: "stabilityai/stable-diffusion-xl-refiner-1.0".to_string(),
            video_model: "Phr00t/WAN2.2-14B-Rapid-AllInOne".to_string(),
            enable_image: true,
            enable_image2image: true,
            enable_video: true,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            task_ttl_hours: 24,
            port: 8000,
            output_dir: PathBuf::from("./outputs"),
        }
    }
}

impl KilnConfig {
    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let model_ids = std::env::var("MODEL_IDS")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.trim().to_string())
            .collect();

        Self {
            model_ids,
            tensor_parallel_size: env_parse("TENSOR_PARALLEL_SIZE", defaults.tensor_parallel_size),
            gpu_memory_utilization: env_parse(
                "GPU_MEMORY_UTILIZATION",
                defaults.gpu_memory_utilization,
            ),
            max_model_len: env_parse("MAX_MODEL_LEN", defaults.max_model_len),
            image_model: env_string("IMAGE_MODEL", &defaults.image_model),
            image2image_model: env_string("IMAGE2IMAGE_MODEL", &defaults.image2image_model),
            video_model: env_string("VIDEO_MODEL", &defaults.video_model),
            enable_image: env_flag("ENABLE_IMAGE", defaults.enable_image),
            enable_image2image: env_flag("ENABLE_IMAGE2IMAGE", defaults.enable_image2image),
            enable_video: env_flag("ENABLE_VIDEO", defaults.enable_video),
            redis_url: env_string("REDIS_URL", &defaults.redis_url),
            task_ttl_hours: env_parse("TASK_TTL_HOURS", defaults.task_ttl_hours),
            port: env_parse("PORT", defaults.port),
            output_dir: PathBuf::from(env_string(
                "OUTPUT_DIR",
                &defaults.output_dir.to_string_lossy(),
            )),
        }
    }

    /// Task record TTL in seconds.
    pub fn task_ttl_secs(&self) -> u64 {
        self.task_ttl_hours * 3600
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_flag(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v.to_lowercase() == "true",
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "malformed value, using default");
            default
        }),
        Err(_) => default,
    }
}

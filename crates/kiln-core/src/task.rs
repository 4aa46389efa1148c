//! Task records and typed task parameters.
//!
//! A [`Task`] is the persisted unit of asynchronous work. Its `params` and
//! `result` travel as opaque JSON through the queue; the typed records in
//! this module decode `params` at the handler boundary.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Types of tasks that can be queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Image,
    #[serde(rename = "image2image")]
    Image2Image,
    Video,
    LlmCompare,
}

impl TaskType {
    /// All task types, in a fixed order (used to size worker counters).
    pub const ALL: [TaskType; 4] = [
        TaskType::Image,
        TaskType::Image2Image,
        TaskType::Video,
        TaskType::LlmCompare,
    ];
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Image2Image => write!(f, "image2image"),
            Self::Video => write!(f, "video"),
            Self::LlmCompare => write!(f, "llm_compare"),
        }
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "image2image" => Ok(Self::Image2Image),
            "video" => Ok(Self::Video),
            "llm_compare" => Ok(Self::LlmCompare),
            other => Err(format!("unknown task type '{other}'")),
        }
    }
}

/// Status of a task in the queue.
///
/// Transitions are monotone: `Pending → Processing → {Completed, Failed}`,
/// or `{Pending, Processing} → Cancelled`. Terminal records are only ever
/// removed by TTL expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// A persisted asynchronous job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Completion percentage in `[0.0, 100.0]`.
    pub progress: f32,
    /// Type-specific parameters, opaque to the queue.
    pub params: Value,
    /// Present iff `status == Completed` (or partially, `Failed`).
    pub result: Option<Value>,
    /// Present iff `status == Failed`.
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub user_id: Option<String>,
}

impl Task {
    /// Construct a fresh pending task with both timestamps set to now.
    pub fn new(id: String, task_type: TaskType, params: Value, user_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            task_type,
            status: TaskStatus::Pending,
            progress: 0.0,
            params,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            user_id,
        }
    }
}

/// A single chat message exchanged with an LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

// ── Typed parameter records ──────────────────────────────────────────────

fn default_negative_prompt() -> String {
    String::new()
}

fn default_image_size() -> u32 {
    1024
}

fn default_image_steps() -> u32 {
    4
}

fn default_image_guidance() -> f32 {
    3.5
}

/// Parameters for an image generation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageTaskParams {
    pub prompt: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    #[serde(default = "default_image_size")]
    pub width: u32,
    #[serde(default = "default_image_size")]
    pub height: u32,
    #[serde(default = "default_image_steps")]
    pub num_inference_steps: u32,
    #[serde(default = "default_image_guidance")]
    pub guidance_scale: f32,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_strength() -> f32 {
    0.75
}

fn default_i2i_steps() -> u32 {
    30
}

fn default_i2i_guidance() -> f32 {
    7.5
}

/// Parameters for an image-to-image task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image2ImageTaskParams {
    pub prompt: String,
    /// Input image, base64-encoded.
    pub image_base64: String,
    #[serde(default = "default_negative_prompt")]
    pub negative_prompt: String,
    #[serde(default = "default_strength")]
    pub strength: f32,
    #[serde(default = "default_i2i_steps")]
    pub num_inference_steps: u32,
    #[serde(default = "default_i2i_guidance")]
    pub guidance_scale: f32,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_video_steps() -> u32 {
    50
}

fn default_video_guidance() -> f32 {
    6.0
}

fn default_num_frames() -> u32 {
    49
}

/// Parameters for a video generation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoTaskParams {
    pub prompt: String,
    /// Conditioning image, base64-encoded.
    pub image_base64: String,
    #[serde(default = "default_video_steps")]
    pub num_inference_steps: u32,
    #[serde(default = "default_video_guidance")]
    pub guidance_scale: f32,
    #[serde(default = "default_num_frames")]
    pub num_frames: u32,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.95
}

fn default_top_k() -> u32 {
    40
}

fn default_max_tokens() -> u32 {
    2048
}

/// Parameters for a multi-model LLM comparison task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmCompareTaskParams {
    pub models: Vec<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

//! Model taxonomy: families, lifecycle statuses, and the sampled GPU view.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The model families the gateway can host on the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Text generation engine (multiple may coexist, memory permitting)
    Llm,
    /// Text-to-image diffusion pipeline
    Image,
    /// Image-to-image diffusion pipeline
    #[serde(rename = "image2image")]
    Image2Image,
    /// Image-to-video diffusion pipeline
    Video,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Llm => write!(f, "llm"),
            Self::Image => write!(f, "image"),
            Self::Image2Image => write!(f, "image2image"),
            Self::Video => write!(f, "video"),
        }
    }
}

impl FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "llm" => Ok(Self::Llm),
            "image" => Ok(Self::Image),
            "image2image" => Ok(Self::Image2Image),
            "video" => Ok(Self::Video),
            other => Err(format!("unknown model type '{other}'")),
        }
    }
}

/// Lifecycle status of a model identifier, visible to operators even after
/// the resident instance is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    NotLoaded,
    Loading,
    Loaded,
    Unloading,
    Error,
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLoaded => write!(f, "not_loaded"),
            Self::Loading => write!(f, "loading"),
            Self::Loaded => write!(f, "loaded"),
            Self::Unloading => write!(f, "unloading"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Video model families with different pipeline requirements.
///
/// Detection is purely name-based; the handle returned by the video adapter
/// carries the detected family in its metadata so generation can apply
/// family-specific parameter normalisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoFamily {
    /// THUDM/CogVideoX-* models
    #[serde(rename = "cogvideox")]
    CogVideoX,
    /// tencent/HunyuanVideo
    Hunyuan,
    /// Wan-AI/Wan2.2-* models
    Wan,
    /// Phr00t/WAN2.2-*-Rapid-* (FP8 accelerated, fixed 4-step sampling)
    WanRapid,
    /// Lightricks/LTX-Video
    Ltx,
    Unknown,
}

impl VideoFamily {
    /// Detect the family from a model identifier.
    ///
    /// Rapid variants are checked before generic Wan so that
    /// `Phr00t/WAN2.2-14B-Rapid-AllInOne` is not mistaken for plain Wan.
    pub fn detect(model_id: &str) -> Self {
        let id = model_id.to_lowercase();

        if id.contains("cogvideo") || id.contains("thudm") {
            Self::CogVideoX
        } else if id.contains("hunyuan") || id.contains("tencent") {
            Self::Hunyuan
        } else if id.contains("rapid") || id.contains("phr00t") {
            Self::WanRapid
        } else if id.contains("wan") {
            Self::Wan
        } else if id.contains("ltx") || id.contains("lightricks") {
            Self::Ltx
        } else {
            Self::Unknown
        }
    }

    /// Output frame rate used when encoding this family's frames.
    pub fn fps(&self) -> u32 {
        match self {
            Self::CogVideoX | Self::Unknown => 8,
            Self::Hunyuan | Self::Ltx => 30,
            Self::Wan | Self::WanRapid => 24,
        }
    }
}

impl fmt::Display for VideoFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CogVideoX => write!(f, "cogvideox"),
            Self::Hunyuan => write!(f, "hunyuan"),
            Self::Wan => write!(f, "wan"),
            Self::WanRapid => write!(f, "wan_rapid"),
            Self::Ltx => write!(f, "ltx"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for VideoFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cogvideox" => Ok(Self::CogVideoX),
            "hunyuan" => Ok(Self::Hunyuan),
            "wan" => Ok(Self::Wan),
            "wan_rapid" => Ok(Self::WanRapid),
            "ltx" => Ok(Self::Ltx),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown video family '{other}'")),
        }
    }
}

/// A point-in-time sample of accelerator memory. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpuStatus {
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
}

impl GpuStatus {
    pub fn new(total_mb: u64, used_mb: u64, free_mb: u64) -> Self {
        Self {
            total_mb,
            used_mb,
            free_mb,
        }
    }

    /// A zeroed sample, reported when no accelerator is visible.
    pub fn unavailable() -> Self {
        Self::new(0, 0, 0)
    }
}

impl fmt::Display for GpuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuStatus(total={}MB, used={}MB, free={}MB)",
            self.total_mb, self.used_mb, self.free_mb
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_type_roundtrip() {
        for ty in [
            ModelType::Llm,
            ModelType::Image,
            ModelType::Image2Image,
            ModelType::Video,
        ] {
            let s = ty.to_string();
            assert_eq!(s.parse::<ModelType>().unwrap(), ty);

            let json = serde_json::to_string(&ty).unwrap();
            let back: ModelType = serde_json::from_str(&json).unwrap();
            assert_eq!(back, ty);
        }
    }

    #[test]
    fn test_model_type_serde_tags() {
        assert_eq!(
            serde_json::to_string(&ModelType::Image2Image).unwrap(),
            "\"image2image\""
        );
        assert_eq!(serde_json::to_string(&ModelType::Llm).unwrap(), "\"llm\"");
    }

    #[test]
    fn test_video_family_detection() {
        assert_eq!(
            VideoFamily::detect("THUDM/CogVideoX-5b-I2V"),
            VideoFamily::CogVideoX
        );
        assert_eq!(
            VideoFamily::detect("tencent/HunyuanVideo"),
            VideoFamily::Hunyuan
        );
        assert_eq!(
            VideoFamily::detect("Wan-AI/Wan2.2-I2V-14B-480P-Diffusers"),
            VideoFamily::Wan
        );
        assert_eq!(
            VideoFamily::detect("Lightricks/LTX-Video"),
            VideoFamily::Ltx
        );
        assert_eq!(VideoFamily::detect("some/other-model"), VideoFamily::Unknown);
    }

    #[test]
    fn test_rapid_detected_before_wan() {
        // The id contains both "wan" and "rapid"; rapid must win.
        assert_eq!(
            VideoFamily::detect("Phr00t/WAN2.2-14B-Rapid-AllInOne"),
            VideoFamily::WanRapid
        );
    }

    #[test]
    fn test_video_family_fps() {
        assert_eq!(VideoFamily::CogVideoX.fps(), 8);
        assert_eq!(VideoFamily::Hunyuan.fps(), 30);
        assert_eq!(VideoFamily::Wan.fps(), 24);
        assert_eq!(VideoFamily::WanRapid.fps(), 24);
        assert_eq!(VideoFamily::Ltx.fps(), 30);
        assert_eq!(VideoFamily::Unknown.fps(), 8);
    }

    #[test]
    fn test_model_status_display() {
        assert_eq!(ModelStatus::NotLoaded.to_string(), "not_loaded");
        assert_eq!(ModelStatus::Loaded.to_string(), "loaded");
    }

    #[test]
    fn test_gpu_status_display() {
        let gpu = GpuStatus::new(24576, 8192, 16384);
        assert_eq!(
            gpu.to_string(),
            "GpuStatus(total=24576MB, used=8192MB, free=16384MB)"
        );
    }
}

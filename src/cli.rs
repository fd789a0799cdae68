use crate::{
    LogLevel,
    analyzer::AnalyzerConfig,
    detector::ObjectDetectionModel,
    onnx::OnnxConfig,
};
use clap::Args;
use std::path::PathBuf;
use tracing::info;

/// Logging flags shared by every binary.
#[derive(Args, Debug, Clone)]
pub struct LogArgs {
    /// Sets the level of logging
    #[clap(long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,
    /// If log_path is set, then stdout logging will be disabled and it will log to file
    #[clap(long)]
    pub log_path: Option<PathBuf>,
}

/// Model locations and inference device flags.
#[derive(Args, Debug, Clone)]
pub struct ModelArgs {
    /// Directory holding the ONNX models and tokenizer.
    /// Default is the directory of the executable. Missing default models are downloaded there.
    #[clap(long)]
    pub models_dir: Option<PathBuf>,
    /// Path to the ONNX detector model file.
    /// If not given the default small RT-DETRv2 model is used.
    #[clap(long)]
    pub model: Option<PathBuf>,
    /// Type of the detector model
    #[clap(long, value_enum, default_value_t = ObjectDetectionModel::RtDetrv2)]
    pub object_detection_model_type: ObjectDetectionModel,
    /// Path to the object classes yaml file
    /// Default: the yaml next to the model, otherwise the 80 standard COCO classes
    #[clap(long)]
    pub object_classes: Option<PathBuf>,
    /// Path to the CLIP vision tower ONNX file
    #[clap(long)]
    pub clip_vision_model: Option<PathBuf>,
    /// Path to the CLIP text tower ONNX file
    #[clap(long)]
    pub clip_text_model: Option<PathBuf>,
    /// Path to the CLIP tokenizer.json
    #[clap(long)]
    pub clip_tokenizer: Option<PathBuf>,
    /// Force using CPU for inference
    #[clap(long, default_value_t = false)]
    pub force_cpu: bool,
    /// GPU Index, best effort to select the correct one if multiple GPUs exist.
    #[clap(long, default_value_t = 0)]
    pub gpu_index: i32,
    /// Intra thread parallelism max is cpu cores - 1
    #[clap(long, default_value_t = 192)]
    pub intra_threads: usize,
    /// Inter thread parallelism max is cpu cores - 1
    #[clap(long, default_value_t = 192)]
    pub inter_threads: usize,
}

impl ModelArgs {
    pub fn onnx_config(&self) -> OnnxConfig {
        OnnxConfig {
            intra_threads: self.intra_threads,
            inter_threads: self.inter_threads,
            gpu_index: self.gpu_index,
            force_cpu: self.force_cpu,
        }
    }

    pub fn models_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(models_dir) = &self.models_dir {
            return Ok(models_dir.clone());
        }
        let exe_path = std::env::current_exe()?;
        exe_path
            .parent()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("Failed to get parent directory of executable"))
    }
}

/// Analysis tuning: an optional JSON config file with individual flag overrides on top.
#[derive(Args, Debug, Clone, Default)]
pub struct AnalyzerArgs {
    /// Load analyzer settings from a JSON file
    #[clap(long)]
    pub config: Option<PathBuf>,
    /// Write the effective analyzer settings to a JSON file
    #[clap(long)]
    pub save_config: Option<PathBuf>,
    /// Detector confidence threshold
    #[clap(long)]
    pub confidence_threshold: Option<f32>,
    /// IoU threshold for suppressing overlapping boxes
    #[clap(long)]
    pub iou_threshold: Option<f32>,
    /// Minimum similarity for a crop to count toward an item
    #[clap(long)]
    pub similarity_threshold: Option<f32>,
    /// Pixels of padding around each detection crop
    #[clap(long)]
    pub crop_padding: Option<u32>,
    /// Optional path to save annotated images
    #[clap(long)]
    pub save_image_path: Option<PathBuf>,
}

impl AnalyzerArgs {
    pub fn resolve(&self) -> anyhow::Result<AnalyzerConfig> {
        let mut config = match &self.config {
            Some(path) => {
                info!(path = %path.display(), "Loading analyzer configuration");
                AnalyzerConfig::load(path)?
            }
            None => AnalyzerConfig::default(),
        };
        if let Some(v) = self.confidence_threshold {
            config.confidence_threshold = v;
        }
        if let Some(v) = self.iou_threshold {
            config.iou_threshold = v;
        }
        if let Some(v) = self.similarity_threshold {
            config.similarity_threshold = v;
        }
        if let Some(v) = self.crop_padding {
            config.crop_padding = v;
        }
        if let Some(path) = &self.save_image_path {
            config.save_image_path = Some(path.clone());
        }
        if let Some(path) = &self.save_config {
            config.save(path)?;
        }
        Ok(config)
    }
}

use analyzer::{Analyzer, AnalyzerConfig};
use clap::ValueEnum;
use cli::ModelArgs;
use detector::{Detector, DetectorConfig};
use download_models::{
    CLIP_TEXT_MODEL_FILE_NAME, CLIP_TOKENIZER_FILE_NAME, CLIP_VISION_MODEL_FILE_NAME,
    SMALL_RT_DETR_V2_MODEL_FILE_NAME,
};
use embedder::{ClipEmbedder, ClipModelConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
pub mod analyzer;
pub mod api;
pub mod batch;
pub mod catalog;
pub mod cli;
pub mod detector;
pub mod download_models;
pub mod embedder;
pub mod image;
pub mod onnx;
pub mod prompt;
pub mod system_info;
pub mod verification;

pub static COCO_CLASSES_STR: &str = include_str!("../assets/coco_classes.yaml");

#[allow(non_snake_case)]
#[derive(Debug, Deserialize)]
struct CocoClasses {
    NAMES: Vec<String>,
}

pub fn get_object_classes(yaml_file: Option<PathBuf>) -> anyhow::Result<Vec<String>> {
    let yaml_data = match yaml_file {
        Some(yaml_file) => std::fs::read_to_string(yaml_file)?,
        None => COCO_CLASSES_STR.to_string(),
    };
    Ok(serde_yaml::from_str::<CocoClasses>(yaml_data.as_str())?.NAMES)
}

pub fn direct_ml_available() -> bool {
    #[cfg(not(windows))]
    {
        false
    }
    #[cfg(windows)]
    {
        let Ok(exe_path) = std::env::current_exe() else {
            return false;
        };
        let Some(exe_dir) = exe_path.parent() else {
            return false;
        };
        exe_dir.join("DirectML.dll").exists()
    }
}

pub fn log_available_gpus() {
    #[cfg(windows)]
    if direct_ml_available() {
        info!("DirectML is available for GPU inference");
    } else {
        info!("DirectML is not available - only CPU inference will be supported");
    }

    #[cfg(not(windows))]
    info!("GPU acceleration not available on this platform - only CPU inference will be supported");

    if let Err(e) = system_info::gpu_info(true) {
        warn!("Failed to enumerate GPU devices: {}", e);
    }
}

/// Installs the global subscriber. Logs go to stdout, or to a daily rolling
/// `smart_bin.log` under `log_path` when one is given. Keep the returned guard alive.
pub fn init_logging(
    log_level: LogLevel,
    log_path: Option<PathBuf>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    setup_ansi_support();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(log_level)));

    let guard = if let Some(path) = log_path {
        let log_directory = resolve_log_directory(path);
        let log_file = log_directory.join("smart_bin.log");
        println!("Starting smart bin, logging into: {}", log_file.display());

        let file_appender = tracing_appender::rolling::daily(&log_directory, "smart_bin.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .try_init()
            .map_err(|_| anyhow::anyhow!("Logging already initialized"))?;

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .map_err(|_| anyhow::anyhow!("Logging already initialized"))?;

        None
    };

    info!(?log_level, "Logging initialized");
    Ok(guard)
}

/// Paths starting with `.` are relative to the executable.
fn resolve_log_directory(path: PathBuf) -> PathBuf {
    if !path.starts_with(".") {
        return path;
    }
    let stripped = path.strip_prefix(".").unwrap_or(&path).to_path_buf();
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|p| p.join(&stripped)))
        .unwrap_or(stripped)
}

fn level_to_filter_string(log_level: LogLevel) -> String {
    match log_level {
        LogLevel::Trace => "trace",
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
    .to_string()
}

fn setup_ansi_support() {
    #[cfg(target_os = "windows")]
    if let Err(e) = ansi_term::enable_ansi_support() {
        eprintln!("Failed to enable ANSI support: {e}");
    }
}

#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    ValueEnum,
    Debug,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Resolved locations of every model file the analyzer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPaths {
    pub detector: PathBuf,
    /// Class names shipped with the detector, when present next to it.
    pub detector_classes: Option<PathBuf>,
    pub clip_vision: PathBuf,
    pub clip_text: PathBuf,
    pub clip_tokenizer: PathBuf,
}

/// Ensures the model files exist, downloading default ones into the models directory if needed.
/// Explicitly given paths are never downloaded.
pub fn ensure_model_files(model_args: &ModelArgs) -> anyhow::Result<ModelPaths> {
    let models_dir = model_args.models_dir()?;
    let detector = ensure_file(
        model_args.model.as_deref(),
        SMALL_RT_DETR_V2_MODEL_FILE_NAME,
        &models_dir,
    )?;

    let yaml_path = detector.with_extension("yaml");
    if !yaml_path.exists() && model_args.model.is_none() && model_args.object_classes.is_none() {
        if let Some(yaml_name) = yaml_path.file_name().map(|n| n.to_string_lossy().to_string()) {
            if let Err(e) = download(&yaml_name, &models_dir) {
                warn!("Failed to download {}: {}, using COCO classes", yaml_name, e);
            }
        }
    }
    let detector_classes = yaml_path.exists().then_some(yaml_path);

    let paths = ModelPaths {
        detector,
        detector_classes,
        clip_vision: ensure_file(
            model_args.clip_vision_model.as_deref(),
            CLIP_VISION_MODEL_FILE_NAME,
            &models_dir,
        )?,
        clip_text: ensure_file(
            model_args.clip_text_model.as_deref(),
            CLIP_TEXT_MODEL_FILE_NAME,
            &models_dir,
        )?,
        clip_tokenizer: ensure_file(
            model_args.clip_tokenizer.as_deref(),
            CLIP_TOKENIZER_FILE_NAME,
            &models_dir,
        )?,
    };
    info!(?paths, "Model files ready");
    Ok(paths)
}

fn ensure_file(explicit: Option<&Path>, default_name: &str, models_dir: &Path) -> anyhow::Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.exists() {
            anyhow::bail!("Model file {} does not exist", path.display());
        }
        return Ok(path.to_path_buf());
    }

    let path = models_dir.join(default_name);
    if !path.exists() {
        info!("Model {} not found, downloading...", default_name);
        download(default_name, models_dir)?;
    }
    if !path.exists() {
        anyhow::bail!(
            "Model file {} is required but could not be found or downloaded",
            default_name
        );
    }
    Ok(path)
}

fn download(file_name: &str, models_dir: &Path) -> anyhow::Result<PathBuf> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(download_models::download_file_to_dir(file_name, models_dir))
}

/// Loads the detector and CLIP models and wires them into an [`Analyzer`].
pub fn build_analyzer(
    model_args: &ModelArgs,
    config: AnalyzerConfig,
) -> anyhow::Result<Analyzer<Detector, ClipEmbedder>> {
    log_available_gpus();
    let paths = ensure_model_files(model_args)?;
    let onnx_config = model_args.onnx_config();

    let detector = Detector::new(DetectorConfig {
        model: paths.detector,
        object_classes: model_args
            .object_classes
            .clone()
            .or(paths.detector_classes),
        confidence_threshold: config.confidence_threshold,
        iou_threshold: config.iou_threshold,
        onnx_config: onnx_config.clone(),
        object_detection_model: model_args.object_detection_model_type,
    })?;
    info!(
        model = %detector.get_model_name(),
        provider = %detector.get_endpoint_provider_name(),
        gpu = detector.is_using_gpu(),
        "Detector ready"
    );
    let embedder = ClipEmbedder::new(ClipModelConfig {
        vision_model: paths.clip_vision,
        text_model: paths.clip_text,
        tokenizer: paths.clip_tokenizer,
        onnx_config,
    })?;
    info!("CLIP embedder ready on {}", embedder.device_type());

    Ok(Analyzer::new(detector, embedder, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coco_classes() {
        let classes = get_object_classes(None).unwrap();
        assert_eq!(classes.len(), 80);
        assert_eq!(classes[0], "person");
    }

    #[test]
    fn test_custom_object_classes() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = dir.path().join("bins.yaml");
        std::fs::write(&yaml, "NAMES:\n  - box\n  - bag\n").unwrap();
        assert_eq!(get_object_classes(Some(yaml)).unwrap(), vec!["box", "bag"]);
    }

    #[test]
    fn test_explicit_model_paths_are_not_downloaded() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.onnx");
        assert!(ensure_file(Some(&missing), "ignored.onnx", dir.path()).is_err());

        let present = dir.path().join("present.onnx");
        std::fs::write(&present, b"onnx").unwrap();
        assert_eq!(
            ensure_file(Some(&present), "ignored.onnx", dir.path()).unwrap(),
            present
        );

        std::fs::write(dir.path().join(CLIP_TOKENIZER_FILE_NAME), b"{}").unwrap();
        assert_eq!(
            ensure_file(None, CLIP_TOKENIZER_FILE_NAME, dir.path()).unwrap(),
            dir.path().join(CLIP_TOKENIZER_FILE_NAME)
        );
    }

    #[test]
    fn test_resolve_log_directory() {
        assert_eq!(
            resolve_log_directory(PathBuf::from("/var/log/smart_bin")),
            PathBuf::from("/var/log/smart_bin")
        );
        assert!(resolve_log_directory(PathBuf::from("./logs")).ends_with("logs"));
    }
}

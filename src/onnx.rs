use crate::direct_ml_available;
use anyhow::Context;
use ort::{execution_providers::DirectMLExecutionProvider, session::Session};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct OnnxConfig {
    pub intra_threads: usize,
    pub inter_threads: usize,
    pub gpu_index: i32,
    pub force_cpu: bool,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            intra_threads: 192,
            inter_threads: 192,
            gpu_index: 0,
            force_cpu: false,
        }
    }
}

/// Builds a session for `model_path`, preferring DirectML when it is available.
pub fn initialize_session(
    onnx_config: &OnnxConfig,
    model_path: &Path,
) -> anyhow::Result<(Session, DeviceType, EndpointProvider)> {
    let mut providers = Vec::new();
    let mut device_type = DeviceType::CPU;
    let max_threads = num_cpus::get_physical().saturating_sub(1).max(1);

    let (num_intra_threads, num_inter_threads) = if onnx_config.force_cpu {
        let num_intra_threads = onnx_config.intra_threads.min(max_threads);
        let num_inter_threads = onnx_config.inter_threads.min(max_threads);
        info!(
            "Forcing CPU for inference with {} intra and {} inter threads",
            num_intra_threads, num_inter_threads
        );
        (num_intra_threads, num_inter_threads)
    } else if direct_ml_available() {
        info!(
            gpu_index = onnx_config.gpu_index,
            "DirectML available, using DirectML for inference"
        );
        providers.push(
            DirectMLExecutionProvider::default()
                .with_device_id(onnx_config.gpu_index)
                .build()
                .error_on_failure(),
        );

        device_type = DeviceType::GPU;
        (1, 1)
    } else {
        let num_intra_threads = onnx_config.intra_threads.min(max_threads);
        let num_inter_threads = onnx_config.inter_threads.min(max_threads);
        warn!(
            "DirectML not available, falling back to CPU for inference with {} intra and {} inter threads",
            num_intra_threads, num_inter_threads
        );
        (num_intra_threads, num_inter_threads)
    };

    let model_bytes = std::fs::read(model_path)
        .with_context(|| format!("Failed to read model file {}", model_path.display()))?;

    info!(
        "Loading model {:?} with inference running on {}",
        model_path, device_type,
    );

    let session = Session::builder()?
        .with_execution_providers(providers)?
        .with_intra_threads(num_intra_threads)?
        .with_inter_threads(num_inter_threads)?
        .commit_from_memory(model_bytes.as_slice())?;

    let endpoint_provider = match device_type {
        DeviceType::GPU => EndpointProvider::DirectML,
        DeviceType::CPU => EndpointProvider::CPU,
    };

    Ok((session, device_type, endpoint_provider))
}

/// First of `candidates` that the session takes as input.
pub fn find_input(session: &Session, candidates: &[&str]) -> Option<String> {
    let names: Vec<&str> = session.inputs.iter().map(|i| i.name.as_str()).collect();
    pick_name(&names, candidates)
}

/// First of `candidates` that the session produces, falling back to its first output.
pub fn find_output(session: &Session, candidates: &[&str]) -> Option<String> {
    let names: Vec<&str> = session.outputs.iter().map(|o| o.name.as_str()).collect();
    pick_name(&names, candidates).or_else(|| names.first().map(|n| n.to_string()))
}

fn pick_name(names: &[&str], candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .find(|c| names.contains(c))
        .map(|c| c.to_string())
}

#[derive(Debug, Clone, Copy)]
pub enum EndpointProvider {
    CPU,
    DirectML,
}

impl std::fmt::Display for EndpointProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointProvider::CPU => write!(f, "CPU"),
            EndpointProvider::DirectML => write!(f, "DirectML"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    CPU,
    GPU,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::CPU => write!(f, "CPU"),
            DeviceType::GPU => write!(f, "GPU"),
        }
    }
}

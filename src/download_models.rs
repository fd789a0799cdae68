use hf_hub::api::tokio::Api;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

pub const SMALL_RT_DETR_V2_MODEL_FILE_NAME: &str = "rt-detrv2-s.onnx";
pub const CLIP_VISION_MODEL_FILE_NAME: &str = "clip-vit-b32-vision.onnx";
pub const CLIP_TEXT_MODEL_FILE_NAME: &str = "clip-vit-b32-text.onnx";
pub const CLIP_TOKENIZER_FILE_NAME: &str = "clip-vit-b32-tokenizer.json";

/// A file in a Hugging Face repository and the name it is stored under locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelFile {
    pub repo: &'static str,
    pub remote: &'static str,
    pub local: &'static str,
}

const fn same_name(repo: &'static str, name: &'static str) -> ModelFile {
    ModelFile {
        repo,
        remote: name,
        local: name,
    }
}

const RT_DETR2_REPO: &str = "xnorpx/rt-detr2-onnx";

pub const RT_DETR2_MODELS: &[ModelFile] = &[
    same_name(RT_DETR2_REPO, "rt-detrv2-s.onnx"),
    same_name(RT_DETR2_REPO, "rt-detrv2-s.yaml"),
    same_name(RT_DETR2_REPO, "rt-detrv2-ms.onnx"),
    same_name(RT_DETR2_REPO, "rt-detrv2-ms.yaml"),
    same_name(RT_DETR2_REPO, "rt-detrv2-m.onnx"),
    same_name(RT_DETR2_REPO, "rt-detrv2-m.yaml"),
    same_name(RT_DETR2_REPO, "rt-detrv2-l.onnx"),
    same_name(RT_DETR2_REPO, "rt-detrv2-l.yaml"),
    same_name(RT_DETR2_REPO, "rt-detrv2-x.onnx"),
    same_name(RT_DETR2_REPO, "rt-detrv2-x.yaml"),
];

pub const CLIP_MODELS: &[ModelFile] = &[
    ModelFile {
        repo: "Qdrant/clip-ViT-B-32-vision",
        remote: "model.onnx",
        local: CLIP_VISION_MODEL_FILE_NAME,
    },
    ModelFile {
        repo: "Qdrant/clip-ViT-B-32-text",
        remote: "model.onnx",
        local: CLIP_TEXT_MODEL_FILE_NAME,
    },
    ModelFile {
        repo: "Qdrant/clip-ViT-B-32-text",
        remote: "tokenizer.json",
        local: CLIP_TOKENIZER_FILE_NAME,
    },
];

pub enum Model {
    /// One file by its local name, plus the detector yaml when it is an RT-DETRv2 model
    Model(String),
    /// Small RT-DETRv2 detector and the CLIP models, everything the tools need
    Default,
    AllRtDetr2,
    Clip,
    All,
}

pub fn all_model_files() -> impl Iterator<Item = &'static ModelFile> {
    RT_DETR2_MODELS.iter().chain(CLIP_MODELS.iter())
}

pub fn find_model_file(local_name: &str) -> Option<&'static ModelFile> {
    all_model_files().find(|f| f.local == local_name)
}

pub fn get_all_model_names() -> Vec<String> {
    all_model_files()
        .filter(|f| f.local.ends_with(".onnx"))
        .map(|f| f.local.to_string())
        .collect()
}

pub fn list_models() {
    for model_name in get_all_model_names() {
        info!("{}", model_name);
    }
}

fn files_for(model: &Model) -> anyhow::Result<Vec<&'static ModelFile>> {
    Ok(match model {
        Model::Model(name) => {
            let file = find_model_file(name)
                .ok_or_else(|| anyhow::anyhow!("File {} not found in any repository", name))?;
            let mut files = vec![file];
            if let Some(yaml) = find_model_file(&name.replace(".onnx", ".yaml")) {
                if yaml != file {
                    files.push(yaml);
                }
            }
            files
        }
        Model::Default => {
            let mut files = Vec::new();
            for name in [
                SMALL_RT_DETR_V2_MODEL_FILE_NAME,
                "rt-detrv2-s.yaml",
                CLIP_VISION_MODEL_FILE_NAME,
                CLIP_TEXT_MODEL_FILE_NAME,
                CLIP_TOKENIZER_FILE_NAME,
            ] {
                files.extend(find_model_file(name));
            }
            files
        }
        Model::AllRtDetr2 => RT_DETR2_MODELS.iter().collect(),
        Model::Clip => CLIP_MODELS.iter().collect(),
        Model::All => all_model_files().collect(),
    })
}

/// Downloads the files of `model` into `model_path`. Individual failures are logged and skipped.
pub async fn download_model(model_path: PathBuf, model: Model) -> anyhow::Result<()> {
    if !model_path.exists() {
        fs::create_dir_all(&model_path).await?;
    }

    let api = Api::new()?;
    let mut downloaded_models: Vec<&str> = Vec::new();
    let mut errors = Vec::new();
    for file in files_for(&model)? {
        match fetch(&api, file, &model_path).await {
            Ok(_) => downloaded_models.push(file.local),
            Err(e) => {
                warn!("Failed to download {}: {}", file.local, e);
                errors.push(file.local);
            }
        }
    }

    info!("Successfully downloaded models: {:?}", downloaded_models);
    if !errors.is_empty() {
        warn!("Some files failed to download: {:?}", errors);
    }
    Ok(())
}

/// Download a specific file, by local name, from whichever repository provides it
pub async fn download_file_to_dir(filename: &str, target_dir: &Path) -> anyhow::Result<PathBuf> {
    let file = find_model_file(filename)
        .ok_or_else(|| anyhow::anyhow!("File {} not found in any repository", filename))?;
    info!("Found {} in repository {}", filename, file.repo);

    if !target_dir.exists() {
        fs::create_dir_all(target_dir).await?;
    }
    fetch(&Api::new()?, file, target_dir).await
}

async fn fetch(api: &Api, file: &ModelFile, target_dir: &Path) -> anyhow::Result<PathBuf> {
    let cached_file = api.model(file.repo.to_string()).get(file.remote).await?;
    let target_path = target_dir.join(file.local);
    fs::copy(&cached_file, &target_path).await?;
    info!("Downloaded {} to {}", file.local, target_path.display());
    Ok(target_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_names() {
        let names = get_all_model_names();
        assert!(names.contains(&SMALL_RT_DETR_V2_MODEL_FILE_NAME.to_string()));
        assert!(names.contains(&CLIP_TEXT_MODEL_FILE_NAME.to_string()));
        assert!(names.iter().all(|n| n.ends_with(".onnx")));
    }

    #[test]
    fn test_files_for_model() {
        let files = files_for(&Model::Model("rt-detrv2-m.onnx".into())).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.local).collect();
        assert_eq!(names, vec!["rt-detrv2-m.onnx", "rt-detrv2-m.yaml"]);

        let files = files_for(&Model::Model(CLIP_TOKENIZER_FILE_NAME.into())).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].remote, "tokenizer.json");

        assert!(files_for(&Model::Model("missing.onnx".into())).is_err());
        assert_eq!(files_for(&Model::Default).unwrap().len(), 5);
    }
}

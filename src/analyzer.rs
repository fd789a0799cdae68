//! Zero-shot bin analysis.
//!
//! A bin photo is cut into candidate crops (one generous center crop plus one
//! padded crop per detected object). Every crop is embedded and compared by
//! cosine similarity against the ensemble text feature of each expected item
//! and of a background description. A crop counts toward an item when that
//! item is its best match and the similarity clears `similarity_threshold`.

use crate::{
    api::Prediction,
    image::{
        AnnotatedBox, Image, PixelRegion, create_annotated_image_name, decode_image,
        encode_and_save_annotated_jpeg, load_image,
    },
    prompt::BACKGROUND_PROMPT,
    verification::MatchCounts,
};
use anyhow::{Context, bail};
use image::RgbImage;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tracing::{debug, info};

/// Something that finds object boxes in a decoded image.
pub trait ObjectDetector {
    fn detect_objects(&mut self, image: &Image) -> anyhow::Result<Vec<Prediction>>;
}

/// Something that maps text and image crops into a shared, L2-normalized embedding space.
pub trait Embedder {
    /// Feature for one item description.
    fn text_feature(&mut self, description: &str) -> anyhow::Result<Array1<f32>>;
    /// One feature row per crop.
    fn image_features(&mut self, crops: &[RgbImage]) -> anyhow::Result<Array2<f32>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Detector score threshold. Kept very low so objects in corners are still proposed.
    pub confidence_threshold: f32,
    /// IoU for class agnostic suppression of overlapping boxes.
    pub iou_threshold: f32,
    /// Minimum cosine similarity (exclusive) for a crop to count toward an item.
    pub similarity_threshold: f32,
    /// Boxes narrower or shorter than this fraction of the image are ignored.
    pub min_box_fraction: f32,
    /// Boxes wider or taller than this fraction of the image are ignored.
    pub max_box_fraction: f32,
    /// Pixels added on every side of a detection before cropping.
    pub crop_padding: u32,
    /// Margin of the center backup crop, as a fraction of each side.
    pub center_crop_margin: f32,
    /// Description embedded as the background class.
    pub background_prompt: String,
    /// Directory for annotated copies of analyzed images.
    pub save_image_path: Option<PathBuf>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.01,
            iou_threshold: 0.5,
            similarity_threshold: 0.20,
            min_box_fraction: 0.05,
            max_box_fraction: 0.95,
            crop_padding: 25,
            center_crop_margin: 0.1,
            background_prompt: BACKGROUND_PROMPT.to_string(),
            save_image_path: None,
        }
    }
}

impl AnalyzerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config {}", path.display()))?;
        info!(path = %path.display(), "Configuration saved");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CropSource {
    /// Backup crop covering the middle of the bin, in case detection misses the pile.
    Center,
    /// Padded crop around a detector box.
    Detection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub region: PixelRegion,
    pub source: CropSource,
}

/// Center backup crop, PIL style rounding of the fractional corners.
pub fn center_crop_region(width: usize, height: usize, margin: f32) -> CropRegion {
    let (w, h) = (width as f64, height as f64);
    let margin = margin as f64;
    let corner = |v: f64| v.round_ties_even().max(0.0) as u32;
    CropRegion {
        region: PixelRegion {
            x_min: corner(w * margin),
            y_min: corner(h * margin),
            x_max: corner(w * (1.0 - margin)),
            y_max: corner(h * (1.0 - margin)),
        },
        source: CropSource::Center,
    }
}

/// Padded crop for a detection, `None` when the box is too small or too large.
pub fn detection_crop_region(
    prediction: &Prediction,
    width: usize,
    height: usize,
    config: &AnalyzerConfig,
) -> Option<CropRegion> {
    let box_width = prediction.x_max.saturating_sub(prediction.x_min) as f32;
    let box_height = prediction.y_max.saturating_sub(prediction.y_min) as f32;
    let (image_width, image_height) = (width as f32, height as f32);

    if box_width < image_width * config.min_box_fraction
        || box_height < image_height * config.min_box_fraction
    {
        return None;
    }
    if box_width > image_width * config.max_box_fraction
        || box_height > image_height * config.max_box_fraction
    {
        return None;
    }

    let pad = config.crop_padding as usize;
    let region = PixelRegion {
        x_min: prediction.x_min.saturating_sub(pad) as u32,
        y_min: prediction.y_min.saturating_sub(pad) as u32,
        x_max: (prediction.x_max + pad).min(width) as u32,
        y_max: (prediction.y_max + pad).min(height) as u32,
    };
    // Boxes entirely outside the image
    if region.width() == 0 || region.height() == 0 {
        return None;
    }
    Some(CropRegion {
        region,
        source: CropSource::Detection,
    })
}

/// Center crop first, then one crop per usable detection, in detection order.
pub fn crop_regions(
    predictions: &[Prediction],
    width: usize,
    height: usize,
    config: &AnalyzerConfig,
) -> Vec<CropRegion> {
    let mut regions = vec![center_crop_region(width, height, config.center_crop_margin)];
    regions.extend(
        predictions
            .iter()
            .filter_map(|p| detection_crop_region(p, width, height, config)),
    );
    regions
}

/// Best text column for each crop row: `(column, score, counted)`.
///
/// The last column is the background. Ties go to the first column.
pub fn assign_matches(similarity: ArrayView2<f32>, threshold: f32) -> Vec<(usize, f32, bool)> {
    let background = similarity.ncols().saturating_sub(1);
    similarity
        .outer_iter()
        .map(|scores| {
            let mut best = 0;
            for (j, &score) in scores.iter().enumerate().skip(1) {
                if score > scores[best] {
                    best = j;
                }
            }
            let score = scores[best];
            (best, score, best != background && score > threshold)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CropMatch {
    pub crop: CropRegion,
    /// Best matching description, `None` when the background won.
    pub best_match: Option<String>,
    pub score: f32,
    pub counted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Analysis {
    /// Crops counted per description. Only descriptions counted at least once appear.
    pub counts: MatchCounts,
    pub crops: Vec<CropMatch>,
    /// Boxes returned by the detector, before size filtering.
    pub detections: usize,
    pub processing_time: Duration,
}

pub struct Analyzer<D, E> {
    detector: D,
    embedder: E,
    config: AnalyzerConfig,
    text_features: HashMap<String, Array1<f32>>,
}

impl<D: ObjectDetector, E: Embedder> Analyzer<D, E> {
    pub fn new(detector: D, embedder: E, config: AnalyzerConfig) -> Self {
        Self {
            detector,
            embedder,
            config,
            text_features: HashMap::new(),
        }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn analyze_image(
        &mut self,
        image_path: &Path,
        descriptions: &[String],
    ) -> anyhow::Result<Analysis> {
        let image_bytes = load_image(image_path)?;
        let mut image = Image::default();
        decode_image(
            Some(image_path.to_string_lossy().to_string()),
            image_bytes,
            &mut image,
        )
        .with_context(|| format!("Failed to decode {}", image_path.display()))?;
        self.analyze(&image, descriptions)
    }

    pub fn analyze(&mut self, image: &Image, descriptions: &[String]) -> anyhow::Result<Analysis> {
        let start = Instant::now();
        if descriptions.is_empty() {
            debug!("No expected items for {}, skipping analysis", image);
            return Ok(Analysis::default());
        }

        let predictions = self.detector.detect_objects(image)?;
        let regions = crop_regions(&predictions, image.width, image.height, &self.config);
        debug!(
            detections = predictions.len(),
            crops = regions.len(),
            "Crops prepared for {}",
            image
        );
        if regions.is_empty() {
            return Ok(Analysis {
                detections: predictions.len(),
                ..Default::default()
            });
        }

        let crops = regions
            .iter()
            .map(|r| image.crop(&r.region))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let text_features = self.text_matrix(descriptions)?;
        let image_features = self.embedder.image_features(&crops)?;
        if image_features.nrows() != crops.len() {
            bail!(
                "Embedder returned {} image features for {} crops",
                image_features.nrows(),
                crops.len()
            );
        }
        if image_features.ncols() != text_features.ncols() {
            bail!(
                "Image feature size {} does not match text feature size {}",
                image_features.ncols(),
                text_features.ncols()
            );
        }

        let similarity = image_features.dot(&text_features.t());
        let assignments = assign_matches(similarity.view(), self.config.similarity_threshold);

        let mut counts = MatchCounts::new();
        let mut crop_matches = Vec::with_capacity(regions.len());
        for (crop, (best, score, counted)) in regions.into_iter().zip(assignments) {
            let best_match = descriptions.get(best).cloned();
            if counted {
                if let Some(description) = &best_match {
                    *counts.entry(description.clone()).or_insert(0) += 1;
                }
            }
            debug!(?crop, ?best_match, score, counted, "Crop matched");
            crop_matches.push(CropMatch {
                crop,
                best_match,
                score,
                counted,
            });
        }

        if let Some(save_image_path) = self.config.save_image_path.clone() {
            save_annotated(image, &save_image_path, &crop_matches)?;
        }

        let processing_time = start.elapsed();
        info!(
            image = %image,
            ?counts,
            ?processing_time,
            "Analysis done"
        );

        Ok(Analysis {
            counts,
            crops: crop_matches,
            detections: predictions.len(),
            processing_time,
        })
    }

    /// Rows are the descriptions in order followed by the background.
    fn text_matrix(&mut self, descriptions: &[String]) -> anyhow::Result<Array2<f32>> {
        let background = self.config.background_prompt.clone();
        let texts: Vec<&String> = descriptions
            .iter()
            .chain(std::iter::once(&background))
            .collect();
        for &text in &texts {
            if !self.text_features.contains_key(text) {
                let feature = self.embedder.text_feature(text)?;
                self.text_features.insert(text.clone(), feature);
            }
        }
        let rows: Vec<_> = texts
            .iter()
            .map(|&text| self.text_features[text].view())
            .collect();
        Ok(ndarray::stack(Axis(0), &rows)?)
    }
}

fn save_annotated(image: &Image, directory: &Path, crops: &[CropMatch]) -> anyhow::Result<()> {
    std::fs::create_dir_all(directory)?;
    let image_name = image.name.clone().unwrap_or_else(|| "bin.jpg".to_string());
    let file_name = create_annotated_image_name(&image_name)?;
    let boxes: Vec<AnnotatedBox> = crops
        .iter()
        .map(|c| AnnotatedBox {
            region: c.crop.region,
            counted: c.counted,
        })
        .collect();
    encode_and_save_annotated_jpeg(image, &directory.join(file_name), &boxes)
}

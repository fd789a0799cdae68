use crate::{
    analyzer::Embedder,
    onnx::{DeviceType, OnnxConfig, find_input, find_output, initialize_session},
    prompt::{ensemble_prompts, safe_text},
};
use anyhow::{anyhow, bail};
use image::{GenericImageView, RgbImage, imageops::FilterType};
use ndarray::{Array1, Array2, Array4, ArrayViewMut3, Axis};
use ort::{session::Session, value::Value};
use rayon::prelude::*;
use std::{path::PathBuf, time::Instant};
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::{debug, info};

pub const CLIP_IMAGE_SIZE: u32 = 224;
pub const CLIP_CONTEXT_LENGTH: usize = 77;
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

#[derive(Debug, Clone)]
pub struct ClipModelConfig {
    pub vision_model: PathBuf,
    pub text_model: PathBuf,
    pub tokenizer: PathBuf,
    pub onnx_config: OnnxConfig,
}

/// CLIP vision and text towers sharing one embedding space.
pub struct ClipEmbedder {
    vision: Session,
    text: Session,
    tokenizer: Tokenizer,
    vision_input: String,
    vision_output: String,
    text_ids: String,
    text_mask: Option<String>,
    text_output: String,
    device_type: DeviceType,
}

impl ClipEmbedder {
    pub fn new(config: ClipModelConfig) -> anyhow::Result<Self> {
        let (vision, device_type, _) =
            initialize_session(&config.onnx_config, &config.vision_model)?;
        let (text, _, _) = initialize_session(&config.onnx_config, &config.text_model)?;

        let mut tokenizer = Tokenizer::from_file(&config.tokenizer)
            .map_err(|e| anyhow!("Failed to load tokenizer {:?}: {}", config.tokenizer, e))?;
        let pad_id = tokenizer
            .token_to_id("<|endoftext|>")
            .ok_or_else(|| anyhow!("Tokenizer has no <|endoftext|> token"))?;
        tokenizer
            .with_padding(Some(PaddingParams {
                strategy: PaddingStrategy::Fixed(CLIP_CONTEXT_LENGTH),
                pad_id,
                pad_token: "<|endoftext|>".to_string(),
                ..Default::default()
            }))
            .with_truncation(Some(TruncationParams {
                max_length: CLIP_CONTEXT_LENGTH,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("Failed to configure tokenizer: {}", e))?;

        let vision_input = find_input(&vision, &["pixel_values", "input", "image"])
            .ok_or_else(|| anyhow!("Could not find vision input node"))?;
        let vision_output = find_output(&vision, &["image_embeds", "embeddings", "output"])
            .ok_or_else(|| anyhow!("Vision model has no outputs"))?;
        let text_ids = find_input(&text, &["input_ids", "input", "text"])
            .ok_or_else(|| anyhow!("Could not find text input node"))?;
        let text_mask = find_input(&text, &["attention_mask"]);
        let text_output = find_output(&text, &["text_embeds", "embeddings", "output"])
            .ok_or_else(|| anyhow!("Text model has no outputs"))?;

        info!(
            %vision_input, %vision_output, %text_ids, ?text_mask, %text_output,
            "CLIP embedder initialized on {}", device_type
        );

        Ok(Self {
            vision,
            text,
            tokenizer,
            vision_input,
            vision_output,
            text_ids,
            text_mask,
            text_output,
            device_type,
        })
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn tokenize(&self, texts: &[String]) -> anyhow::Result<(Array2<i64>, Array2<i64>)> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

        let batch_size = encodings.len();
        let ids: Vec<i64> = encodings
            .iter()
            .flat_map(|e| e.get_ids().iter().map(|&x| i64::from(x)))
            .collect();
        let mask: Vec<i64> = encodings
            .iter()
            .flat_map(|e| e.get_attention_mask().iter().map(|&x| i64::from(x)))
            .collect();

        Ok((
            Array2::from_shape_vec((batch_size, CLIP_CONTEXT_LENGTH), ids)?,
            Array2::from_shape_vec((batch_size, CLIP_CONTEXT_LENGTH), mask)?,
        ))
    }

    /// Raw (unnormalized) text embeddings, one row per text.
    fn encode_texts(&mut self, texts: &[String]) -> anyhow::Result<Array2<f32>> {
        if texts.is_empty() {
            bail!("No texts to encode");
        }
        let (ids, mask) = self.tokenize(texts)?;
        let ids = Value::from_array(ids)?;
        let outputs = match &self.text_mask {
            Some(mask_name) => self.text.run(ort::inputs![
                self.text_ids.as_str() => ids,
                mask_name.as_str() => Value::from_array(mask)?
            ])?,
            None => self.text.run(ort::inputs![self.text_ids.as_str() => ids])?,
        };
        let embeddings = outputs[self.text_output.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<ndarray::Ix2>()?
            .to_owned();
        Ok(embeddings)
    }

    /// L2-normalized embeddings of `texts`, each trimmed to the encoder's text limit.
    pub fn embed_texts(&mut self, texts: &[String]) -> anyhow::Result<Array2<f32>> {
        let texts: Vec<String> = texts.iter().map(|t| safe_text(t)).collect();
        Ok(l2_normalize_rows(self.encode_texts(&texts)?))
    }

    /// Ensemble feature over the prompt variants of `description`.
    pub fn ensemble_text_feature(&mut self, description: &str) -> anyhow::Result<Array1<f32>> {
        let prompts = ensemble_prompts(description).to_vec();
        ensemble_feature(&self.encode_texts(&prompts)?)
    }

    /// L2-normalized embeddings, one row per image.
    pub fn embed_images(&mut self, images: &[RgbImage]) -> anyhow::Result<Array2<f32>> {
        let preprocess_start = Instant::now();
        let batch = preprocess_batch(images)?;
        debug!(
            "Preprocessed {} crops in {:?}",
            images.len(),
            preprocess_start.elapsed()
        );

        let inference_start = Instant::now();
        let outputs = self.vision.run(ort::inputs![
            self.vision_input.as_str() => Value::from_array(batch)?
        ])?;
        let embeddings = outputs[self.vision_output.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<ndarray::Ix2>()?
            .to_owned();
        debug!("Vision inference time: {:?}", inference_start.elapsed());
        Ok(l2_normalize_rows(embeddings))
    }
}

impl Embedder for ClipEmbedder {
    fn text_feature(&mut self, description: &str) -> anyhow::Result<Array1<f32>> {
        self.ensemble_text_feature(description)
    }

    fn image_features(&mut self, crops: &[RgbImage]) -> anyhow::Result<Array2<f32>> {
        self.embed_images(crops)
    }
}

/// Mean of the raw (unnormalized) embedding rows, then L2-normalized.
pub fn ensemble_feature(embeddings: &Array2<f32>) -> anyhow::Result<Array1<f32>> {
    let mean = embeddings
        .mean_axis(Axis(0))
        .ok_or_else(|| anyhow!("Empty prompt embedding batch"))?;
    Ok(l2_normalize(mean))
}

/// CLIP preprocessing for a batch, `[n, 3, 224, 224]`.
pub fn preprocess_batch(images: &[RgbImage]) -> anyhow::Result<Array4<f32>> {
    if images.is_empty() {
        bail!("Empty image batch");
    }
    let size = CLIP_IMAGE_SIZE as usize;
    let mut batch = Array4::<f32>::zeros((images.len(), 3, size, size));
    batch
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(images.par_iter())
        .try_for_each(|(mut slot, image)| preprocess_into(image, &mut slot))?;
    Ok(batch)
}

/// Shortest side to 224 (bicubic), center crop, normalize with CLIP mean and std.
fn preprocess_into(image: &RgbImage, out: &mut ArrayViewMut3<f32>) -> anyhow::Result<()> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        bail!("Cannot embed an empty crop");
    }
    let size = CLIP_IMAGE_SIZE;
    let (scaled_width, scaled_height) = resized_dimensions(width, height, size);
    let resized = image::imageops::resize(image, scaled_width, scaled_height, FilterType::CatmullRom);
    let x = center_crop_offset(scaled_width, size);
    let y = center_crop_offset(scaled_height, size);
    let cropped = resized.view(x, y, size, size);

    for (px, py, pixel) in cropped.pixels() {
        for c in 0..3 {
            let value = f32::from(pixel.0[c]) / 255.0;
            out[[c, py as usize, px as usize]] = (value - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
    Ok(())
}

/// Shortest side becomes `size`, the longer side keeps the aspect ratio and is truncated.
fn resized_dimensions(width: u32, height: u32, size: u32) -> (u32, u32) {
    let (short, long) = (width.min(height), width.max(height));
    let scaled_long = ((f64::from(size) * f64::from(long) / f64::from(short)) as u32).max(size);
    if width <= height {
        (size, scaled_long)
    } else {
        (scaled_long, size)
    }
}

/// Start of a centered `size` window, half offsets rounded to even.
fn center_crop_offset(scaled: u32, size: u32) -> u32 {
    (f64::from(scaled.saturating_sub(size)) / 2.0).round_ties_even() as u32
}

pub fn l2_normalize(vector: Array1<f32>) -> Array1<f32> {
    let norm = vector.dot(&vector).sqrt();
    if norm > 0.0 { vector / norm } else { vector }
}

pub fn l2_normalize_rows(mut matrix: Array2<f32>) -> Array2<f32> {
    for mut row in matrix.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row /= norm;
        }
    }
    matrix
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(array![3.0_f32, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(array![0.0_f32, 0.0]), array![0.0_f32, 0.0]);
    }

    #[test]
    fn test_l2_normalize_rows() {
        let m = l2_normalize_rows(array![[3.0_f32, 4.0], [0.0, 2.0], [0.0, 0.0]]);
        assert!((m[[0, 1]] - 0.8).abs() < 1e-6);
        assert!((m[[1, 1]] - 1.0).abs() < 1e-6);
        assert_eq!(m[[2, 0]], 0.0);
    }

    #[test]
    fn test_preprocess_batch_shape_and_normalization() {
        let white = RgbImage::from_pixel(300, 150, image::Rgb([255, 255, 255]));
        let black = RgbImage::from_pixel(50, 80, image::Rgb([0, 0, 0]));
        let batch = preprocess_batch(&[white, black]).unwrap();
        assert_eq!(batch.shape(), &[2, 3, 224, 224]);

        let expected_white = (1.0 - CLIP_MEAN[0]) / CLIP_STD[0];
        assert!((batch[[0, 0, 100, 100]] - expected_white).abs() < 1e-3);
        let expected_black = (0.0 - CLIP_MEAN[2]) / CLIP_STD[2];
        assert!((batch[[1, 2, 10, 10]] - expected_black).abs() < 1e-3);
    }

    #[test]
    fn test_ensemble_feature_averages_raw_embeddings() {
        let embeddings = array![[3.0_f32, 0.0], [0.0, 1.0]];
        let feature = ensemble_feature(&embeddings).unwrap();
        // Raw mean [1.5, 0.5], not the mean of the normalized rows [0.5, 0.5]
        let expected = 1.0 / 10.0_f32.sqrt();
        assert!((feature[0] - 3.0 * expected).abs() < 1e-6);
        assert!((feature[1] - expected).abs() < 1e-6);
        assert!((feature.dot(&feature) - 1.0).abs() < 1e-6);

        assert!(ensemble_feature(&Array2::<f32>::zeros((0, 2))).is_err());
    }

    #[test]
    fn test_resize_truncates_and_crop_rounds_half_to_even() {
        assert_eq!(resized_dimensions(224, 224, 224), (224, 224));
        // 224 * 7 / 5 = 313.6
        assert_eq!(resized_dimensions(7, 5, 224), (313, 224));
        assert_eq!(resized_dimensions(50, 80, 224), (224, 358));
        assert_eq!(resized_dimensions(300, 150, 224), (448, 224));

        assert_eq!(center_crop_offset(313, 224), 44);
        assert_eq!(center_crop_offset(227, 224), 2);
        assert_eq!(center_crop_offset(225, 224), 0);
        assert_eq!(center_crop_offset(448, 224), 112);
        assert_eq!(center_crop_offset(224, 224), 0);
    }

    #[test]
    fn test_preprocess_rejects_empty_batch() {
        assert!(preprocess_batch(&[]).is_err());
    }
}

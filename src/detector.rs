use crate::{
    analyzer::ObjectDetector,
    api::Prediction,
    get_object_classes,
    image::{Image, Resizer},
    onnx::{DeviceType, EndpointProvider, OnnxConfig, initialize_session},
};
use anyhow::{anyhow, bail};
use ndarray::{Array, ArrayView1, ArrayView2, Axis, s};
use ort::{session::Session, value::Value};
use smallvec::SmallVec;
use std::{
    fmt::Debug,
    path::PathBuf,
    time::{Duration, Instant},
};
use tracing::{debug, info};

const INPUT_SIZE: usize = 640;

pub struct DetectResult {
    pub predictions: SmallVec<[Prediction; 10]>,
    pub processing_time: Duration,
    pub resize_image_time: Duration,
    pub pre_processing_time: Duration,
    pub inference_time: Duration,
    pub post_processing_time: Duration,
    pub device_type: DeviceType,
    pub endpoint_provider: EndpointProvider,
}

impl Debug for DetectResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetectResult")
            .field("# predictions", &self.predictions.len())
            .field("processing_time", &self.processing_time)
            .field("resize_image_time", &self.resize_image_time)
            .field("pre_processing_time", &self.pre_processing_time)
            .field("inference_time", &self.inference_time)
            .field("post_processing_time", &self.post_processing_time)
            .field("device_type", &self.device_type)
            .finish()
    }
}

pub struct Detector {
    session: Session,
    resizer: Resizer,
    resized_image: Image,
    object_classes: Vec<String>,
    input: ndarray::Array4<f32>,
    confidence_threshold: f32,
    iou_threshold: f32,
    device_type: DeviceType,
    endpoint_provider: EndpointProvider,
    model_name: String,
    object_detection_model: ObjectDetectionModel,
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize,
)]
pub enum ObjectDetectionModel {
    #[default]
    RtDetrv2,
    Yolo8,
}

impl std::fmt::Display for ObjectDetectionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectDetectionModel::RtDetrv2 => write!(f, "rt-detrv2"),
            ObjectDetectionModel::Yolo8 => write!(f, "yolo8"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub model: PathBuf,
    pub object_classes: Option<PathBuf>,
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub onnx_config: OnnxConfig,
    pub object_detection_model: ObjectDetectionModel,
}

impl Detector {
    pub fn new(detector_config: DetectorConfig) -> anyhow::Result<Self> {
        let object_classes = get_object_classes(detector_config.object_classes)?;
        let (session, device_type, endpoint_provider) =
            initialize_session(&detector_config.onnx_config, &detector_config.model)?;
        let model_name = detector_config
            .model
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| detector_config.model.display().to_string());

        info!(
            model = %model_name,
            kind = %detector_config.object_detection_model,
            classes = object_classes.len(),
            "Detector initialized"
        );

        let mut detector = Self {
            session,
            resizer: Resizer::default(),
            resized_image: Image::default(),
            object_classes,
            input: Array::zeros((1, 3, INPUT_SIZE, INPUT_SIZE)),
            confidence_threshold: detector_config.confidence_threshold,
            iou_threshold: detector_config.iou_threshold,
            device_type,
            endpoint_provider,
            model_name,
            object_detection_model: detector_config.object_detection_model,
        };

        info!("Warming up the detector");
        let detector_warmup_start_time = Instant::now();
        detector.detect(&warmup_image())?;
        info!(
            "Detector warmed up in: {:?}",
            detector_warmup_start_time.elapsed()
        );

        Ok(detector)
    }

    pub fn detect(&mut self, image: &Image) -> anyhow::Result<DetectResult> {
        if image.width == 0 || image.height == 0 {
            bail!("Cannot run detection on an empty image {}", image);
        }
        let processing_time_start = Instant::now();

        let resize_factor_x = image.width as f32 / INPUT_SIZE as f32;
        let resize_factor_y = image.height as f32 / INPUT_SIZE as f32;
        self.resizer.resize_image(image, &mut self.resized_image)?;
        let resize_image_time = processing_time_start.elapsed();
        debug!("Resize image time: {:#?}", resize_image_time);

        for (index, chunk) in self.resized_image.pixels.chunks_exact(3).enumerate() {
            let y = index / INPUT_SIZE;
            let x = index % INPUT_SIZE;
            self.input[[0, 0, y, x]] = chunk[0] as f32 / 255.0;
            self.input[[0, 1, y, x]] = chunk[1] as f32 / 255.0;
            self.input[[0, 2, y, x]] = chunk[2] as f32 / 255.0;
        }
        let pre_processing_time = processing_time_start.elapsed();
        debug!("Pre-process time: {:?}", pre_processing_time);

        let images = Value::from_array(self.input.clone())?;
        let start_inference_time = Instant::now();
        let (raw_predictions, inference_time) = match self.object_detection_model {
            ObjectDetectionModel::RtDetrv2 => {
                let orig_size = Array::from_shape_vec(
                    (1, 2),
                    vec![INPUT_SIZE as i64, INPUT_SIZE as i64],
                )?;
                let outputs = self.session.run(ort::inputs![
                    "images" => images,
                    "orig_target_sizes" => Value::from_array(orig_size)?
                ])?;
                let inference_time = start_inference_time.elapsed();
                let labels = outputs["labels"].try_extract_array::<i64>()?;
                let boxes = outputs["boxes"].try_extract_array::<f32>()?;
                let scores = outputs["scores"].try_extract_array::<f32>()?;
                let predictions = rt_detrv2_post_process(
                    labels.index_axis(Axis(0), 0).into_dimensionality()?,
                    boxes.index_axis(Axis(0), 0).into_dimensionality()?,
                    scores.index_axis(Axis(0), 0).into_dimensionality()?,
                    self.confidence_threshold,
                    resize_factor_x,
                    resize_factor_y,
                    &self.object_classes,
                );
                (predictions, inference_time)
            }
            ObjectDetectionModel::Yolo8 => {
                let outputs = self.session.run(ort::inputs!["images" => images])?;
                let inference_time = start_inference_time.elapsed();
                let output = outputs[0].try_extract_array::<f32>()?;
                let predictions = yolo8_post_process(
                    output.index_axis(Axis(0), 0).into_dimensionality()?,
                    self.confidence_threshold,
                    resize_factor_x,
                    resize_factor_y,
                    &self.object_classes,
                )?;
                (predictions, inference_time)
            }
        };
        debug!("Inference time: {:?}", inference_time);

        let post_processing_time_start = Instant::now();
        let raw_predictions = clip_to_image(raw_predictions, image.width, image.height);
        let predictions = non_maximum_suppression(raw_predictions, self.iou_threshold);
        for (i, prediction) in predictions.iter().enumerate() {
            debug!("Prediction - {}: {:?}", i + 1, prediction);
        }

        let now = Instant::now();
        let post_processing_time = now.duration_since(post_processing_time_start);
        let processing_time = now.duration_since(processing_time_start);
        debug!(
            "Detected {} objects in {:?} (post-processing {:?})",
            predictions.len(),
            processing_time,
            post_processing_time
        );

        Ok(DetectResult {
            predictions,
            processing_time,
            resize_image_time,
            pre_processing_time,
            inference_time,
            post_processing_time,
            device_type: self.device_type,
            endpoint_provider: self.endpoint_provider,
        })
    }

    pub fn get_model_name(&self) -> &String {
        &self.model_name
    }

    pub fn get_endpoint_provider_name(&self) -> String {
        self.endpoint_provider.to_string()
    }

    pub fn is_using_gpu(&self) -> bool {
        self.device_type == DeviceType::GPU
    }
}

impl ObjectDetector for Detector {
    fn detect_objects(&mut self, image: &Image) -> anyhow::Result<Vec<Prediction>> {
        let result = self.detect(image)?;
        debug!(?result, "Detection done");
        Ok(result.predictions.into_vec())
    }
}

fn warmup_image() -> Image {
    Image {
        name: Some("warmup".to_string()),
        width: INPUT_SIZE,
        height: INPUT_SIZE,
        pixels: vec![114; INPUT_SIZE * INPUT_SIZE * 3],
    }
}

fn class_name(object_classes: &[String], index: usize) -> String {
    object_classes
        .get(index)
        .cloned()
        .unwrap_or_else(|| format!("class_{index}"))
}

/// RT-DETRv2 emits xyxy boxes in model input coordinates with one label and score per query.
fn rt_detrv2_post_process(
    labels: ArrayView1<i64>,
    bboxes: ArrayView2<f32>,
    scores: ArrayView1<f32>,
    confidence_threshold: f32,
    resize_factor_x: f32,
    resize_factor_y: f32,
    object_classes: &[String],
) -> SmallVec<[Prediction; 10]> {
    let mut predictions = SmallVec::<[Prediction; 10]>::new();

    for (i, bbox) in bboxes.outer_iter().enumerate() {
        if scores[i] > confidence_threshold {
            predictions.push(Prediction {
                x_min: (bbox[0] * resize_factor_x) as usize,
                x_max: (bbox[2] * resize_factor_x) as usize,
                y_min: (bbox[1] * resize_factor_y) as usize,
                y_max: (bbox[3] * resize_factor_y) as usize,
                confidence: scores[i],
                label: class_name(object_classes, labels[i].max(0) as usize),
            });
        }
    }

    predictions
}

/// YOLOv8 emits `[4 + classes, anchors]`: cx, cy, w, h followed by per class scores.
fn yolo8_post_process(
    output: ArrayView2<f32>,
    confidence_threshold: f32,
    resize_factor_x: f32,
    resize_factor_y: f32,
    object_classes: &[String],
) -> anyhow::Result<SmallVec<[Prediction; 10]>> {
    if output.shape()[0] <= 4 {
        return Err(anyhow!(
            "Unexpected yolo8 output shape {:?}, expected [4 + classes, anchors]",
            output.shape()
        ));
    }

    let mut predictions = SmallVec::<[Prediction; 10]>::new();

    for anchor in output.axis_iter(Axis(1)) {
        let Some((class_idx, &confidence)) = anchor
            .slice(s![4..])
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            continue;
        };
        if confidence <= confidence_threshold {
            continue;
        }

        let x_center = anchor[0] * resize_factor_x;
        let y_center = anchor[1] * resize_factor_y;
        let width = anchor[2] * resize_factor_x;
        let height = anchor[3] * resize_factor_y;
        predictions.push(Prediction {
            x_min: (x_center - width / 2.0) as usize,
            y_min: (y_center - height / 2.0) as usize,
            x_max: (x_center + width / 2.0) as usize,
            y_max: (y_center + height / 2.0) as usize,
            confidence,
            label: class_name(object_classes, class_idx),
        });
    }

    Ok(predictions)
}

/// Clamps boxes to the `width` x `height` image they were scaled back to.
fn clip_to_image(
    mut predictions: SmallVec<[Prediction; 10]>,
    width: usize,
    height: usize,
) -> SmallVec<[Prediction; 10]> {
    for prediction in predictions.iter_mut() {
        prediction.x_min = prediction.x_min.min(width);
        prediction.x_max = prediction.x_max.min(width);
        prediction.y_min = prediction.y_min.min(height);
        prediction.y_max = prediction.y_max.min(height);
    }
    predictions
}

/// Class agnostic suppression: boxes overlapping a more confident box by `iou_threshold` or more are dropped.
fn non_maximum_suppression(
    mut predictions: SmallVec<[Prediction; 10]>,
    iou_threshold: f32,
) -> SmallVec<[Prediction; 10]> {
    predictions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: SmallVec<[Prediction; 10]> = SmallVec::new();
    for pred in predictions {
        if kept
            .iter()
            .all(|kept_pred| calculate_iou(&pred, kept_pred) < iou_threshold)
        {
            kept.push(pred);
        }
    }
    kept
}

fn calculate_iou(a: &Prediction, b: &Prediction) -> f32 {
    let x_min = a.x_min.max(b.x_min) as f32;
    let y_min = a.y_min.max(b.y_min) as f32;
    let x_max = a.x_max.min(b.x_max) as f32;
    let y_max = a.y_max.min(b.y_max) as f32;
    let intersection = (x_max - x_min).max(0.0) * (y_max - y_min).max(0.0);
    let area_a = a.x_max.saturating_sub(a.x_min) as f32 * a.y_max.saturating_sub(a.y_min) as f32;
    let area_b = b.x_max.saturating_sub(b.x_min) as f32 * b.y_max.saturating_sub(b.y_min) as f32;
    let union = area_a + area_b - intersection;

    if union <= 0.0 {
        0.0
    } else {
        intersection / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};

    fn prediction(x_min: usize, y_min: usize, x_max: usize, y_max: usize, confidence: f32) -> Prediction {
        Prediction {
            x_min,
            y_min,
            x_max,
            y_max,
            confidence,
            label: "box".to_string(),
        }
    }

    #[test]
    fn test_iou() {
        let a = prediction(0, 0, 10, 10, 0.9);
        let b = prediction(5, 0, 15, 10, 0.8);
        assert!((calculate_iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(calculate_iou(&a, &prediction(20, 20, 30, 30, 0.5)), 0.0);
        assert_eq!(calculate_iou(&a, &a), 1.0);
    }

    #[test]
    fn test_nms_is_class_agnostic() {
        let mut book = prediction(0, 0, 100, 100, 0.4);
        book.label = "book".into();
        let mut cup = prediction(2, 2, 100, 100, 0.9);
        cup.label = "cup".into();
        let far = prediction(300, 300, 400, 400, 0.1);
        let kept = non_maximum_suppression(SmallVec::from_vec(vec![book, cup, far]), 0.5);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].label, "cup");
        assert_eq!(kept[1].x_min, 300);
    }

    #[test]
    fn test_rt_detrv2_post_process_scales_and_filters() {
        let classes = vec!["person".to_string(), "book".to_string()];
        let labels = Array1::from(vec![1_i64, 0]);
        let boxes = Array2::from_shape_vec((2, 4), vec![10., 20., 110., 220., 0., 0., 5., 5.]).unwrap();
        let scores = Array1::from(vec![0.7_f32, 0.005]);
        let predictions = rt_detrv2_post_process(
            labels.view(),
            boxes.view(),
            scores.view(),
            0.01,
            2.0,
            0.5,
            &classes,
        );
        assert_eq!(predictions.len(), 1);
        let p = &predictions[0];
        assert_eq!((p.x_min, p.y_min, p.x_max, p.y_max), (20, 10, 220, 110));
        assert_eq!(p.label, "book");
    }

    #[test]
    fn test_yolo8_post_process() {
        // Two anchors, two classes
        let output = Array2::from_shape_vec(
            (6, 2),
            vec![
                100., 300., // cx
                100., 300., // cy
                40., 10., // w
                20., 10., // h
                0.1, 0.001, // class 0
                0.8, 0.002, // class 1
            ],
        )
        .unwrap();
        let classes = vec!["a".to_string(), "b".to_string()];
        let predictions = yolo8_post_process(output.view(), 0.01, 1.0, 1.0, &classes).unwrap();
        assert_eq!(predictions.len(), 1);
        let p = &predictions[0];
        assert_eq!((p.x_min, p.y_min, p.x_max, p.y_max), (80, 90, 120, 110));
        assert_eq!(p.label, "b");
        assert!((p.confidence - 0.8).abs() < 1e-6);

        let bad = Array2::<f32>::zeros((4, 3));
        assert!(yolo8_post_process(bad.view(), 0.01, 1.0, 1.0, &classes).is_err());
    }

    #[test]
    fn test_boxes_past_the_edge_are_clipped() {
        // 400x400 image, so the 640 input is scaled by 0.625
        let classes = vec!["box".to_string()];
        let labels = Array1::from(vec![0_i64, 0]);
        let boxes = Array2::from_shape_vec(
            (2, 4),
            vec![48., 80., 672., 480., -16., 600., 64., 720.],
        )
        .unwrap();
        let scores = Array1::from(vec![0.9_f32, 0.6]);
        let raw = rt_detrv2_post_process(
            labels.view(),
            boxes.view(),
            scores.view(),
            0.01,
            0.625,
            0.625,
            &classes,
        );
        assert_eq!((raw[0].x_min, raw[0].y_min, raw[0].x_max, raw[0].y_max), (30, 50, 420, 300));

        let clipped = clip_to_image(raw, 400, 400);
        assert_eq!(
            (clipped[0].x_min, clipped[0].y_min, clipped[0].x_max, clipped[0].y_max),
            (30, 50, 400, 300)
        );
        assert_eq!(
            (clipped[1].x_min, clipped[1].y_min, clipped[1].x_max, clipped[1].y_max),
            (0, 375, 40, 400)
        );

        let region = crate::analyzer::detection_crop_region(
            &clipped[0],
            400,
            400,
            &crate::analyzer::AnalyzerConfig::default(),
        )
        .unwrap();
        assert_eq!(region.region.x_max, 400);
    }

    #[test]
    fn test_class_name_fallback() {
        let classes = vec!["person".to_string()];
        assert_eq!(class_name(&classes, 0), "person");
        assert_eq!(class_name(&classes, 7), "class_7");
    }
}

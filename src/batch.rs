//! Dataset runs over a bin image folder and its metadata.

use crate::{
    analyzer::{Analyzer, Embedder, ObjectDetector},
    catalog::{BinMetadata, DescriptionCatalog, top_asins},
    verification::{MatchCounts, ValidationSummary, score_bin},
};
use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{info, warn};

pub const DEFAULT_SUBSET_LIMIT: usize = 50;
pub const DEFAULT_VALIDATION_IMAGES: usize = 50;
pub const DEFAULT_VALIDATION_SEED: u64 = 42;
pub const DEFAULT_SMALL_CATALOG_SIZE: usize = 300;

/// Per image counts, keyed by image file name.
pub type SubsetResults = BTreeMap<String, MatchCounts>;

/// Folder layout of a bin dataset.
#[derive(Debug, Clone)]
pub struct Dataset {
    root: PathBuf,
}

impl Dataset {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subset_dir(&self) -> PathBuf {
        self.root.join("subset")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("processed")
    }

    pub fn metadata_csv(&self) -> PathBuf {
        self.processed_dir().join("master_metadata.csv")
    }

    pub fn full_catalog(&self) -> PathBuf {
        self.processed_dir().join("asin_text.json")
    }

    pub fn small_catalog(&self) -> PathBuf {
        self.processed_dir().join("asin_text_small.json")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join("outputs")
    }

    pub fn subset_results(&self) -> PathBuf {
        self.outputs_dir().join("subset_results.json")
    }

    pub fn load_catalog(&self) -> anyhow::Result<DescriptionCatalog> {
        DescriptionCatalog::load_with_fallback(&self.full_catalog(), &self.small_catalog())
    }

    pub fn load_metadata(&self) -> anyhow::Result<BinMetadata> {
        BinMetadata::load(&self.metadata_csv())
    }
}

/// `.jpg` and `.png` files in `dir`, sorted by name.
pub fn list_bin_images(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list images in {}", dir.display()))?
    {
        let path = entry?.path();
        let is_image = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .is_some_and(|n| n.ends_with(".jpg") || n.ends_with(".png"));
        if is_image && path.is_file() {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

/// Seeded shuffle of `images`, then the first `n`.
pub fn select_validation_images(mut images: Vec<PathBuf>, n: usize, seed: u64) -> Vec<PathBuf> {
    let mut rng = StdRng::seed_from_u64(seed);
    images.shuffle(&mut rng);
    images.truncate(n);
    images
}

fn image_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn progress_bar(len: usize) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Counts for the first `limit` subset images, also written to `outputs/subset_results.json`.
pub fn run_subset<D: ObjectDetector, E: Embedder>(
    analyzer: &mut Analyzer<D, E>,
    dataset: &Dataset,
    limit: usize,
) -> anyhow::Result<SubsetResults> {
    let catalog = dataset.load_catalog()?;
    let metadata = dataset.load_metadata()?;
    let mut images = list_bin_images(&dataset.subset_dir())?;
    images.truncate(limit);

    info!("Generating results for {} images", images.len());
    let start = Instant::now();
    let pb = progress_bar(images.len())?;
    let mut results = SubsetResults::new();
    for path in &images {
        let name = image_name(path);
        let descriptions = catalog.expected_descriptions(metadata.asins(&name));
        let counts = if descriptions.is_empty() {
            MatchCounts::new()
        } else {
            analyzer.analyze_image(path, &descriptions)?.counts
        };
        results.insert(name, counts);
        pb.inc(1);
    }
    pb.finish_and_clear();

    save_subset_results(&results, &dataset.subset_results())?;
    info!(
        "Done in {:?}, results saved to {}",
        start.elapsed(),
        dataset.subset_results().display()
    );
    Ok(results)
}

pub fn save_subset_results(results: &SubsetResults, path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(results)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write results {}", path.display()))?;
    Ok(())
}

/// Zero-shot validation over `n` seeded random subset images.
///
/// Images without any known expected item are skipped but still counted as tested.
pub fn run_validation<D: ObjectDetector, E: Embedder>(
    analyzer: &mut Analyzer<D, E>,
    dataset: &Dataset,
    n: usize,
    seed: u64,
) -> anyhow::Result<ValidationSummary> {
    let catalog = dataset.load_catalog()?;
    let metadata = dataset.load_metadata()?;
    let images = select_validation_images(list_bin_images(&dataset.subset_dir())?, n, seed);

    info!("Starting zero-shot validation on {} images", images.len());
    let mut summary = ValidationSummary {
        images_tested: images.len(),
        ..Default::default()
    };
    for (i, path) in images.iter().enumerate() {
        let name = image_name(path);
        let order = catalog.bin_order(&metadata, &name)?;
        if order.is_empty() {
            warn!("[{}] {} has no known expected items, skipping", i + 1, name);
            continue;
        }

        let analysis = analyzer.analyze_image(path, &order.descriptions())?;
        let score = score_bin(&order, &analysis.counts);
        info!(
            "[{}] {} | Expected: {} | Verified: {} | {}",
            i + 1,
            name,
            score.expected,
            score.verified,
            if score.is_perfect() { "PERFECT" } else { "PARTIAL" }
        );
        summary.record(score);
    }
    Ok(summary)
}

/// Writes the catalog entries of the `n` most frequent ASINs to `out`, in rank order.
pub fn make_small_catalog(
    metadata_csv: &Path,
    full_catalog: &Path,
    out: &Path,
    n: usize,
) -> anyhow::Result<DescriptionCatalog> {
    let top = top_asins(metadata_csv, n)?;
    info!("Top ASINs selected: {}", top.len());
    let small = DescriptionCatalog::load(full_catalog)?.subset(&top);
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }
    small.save(out)?;
    info!(
        "Created {} with {} ASINs",
        out.display(),
        small.len()
    );
    Ok(small)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analyzer::AnalyzerConfig,
        api::Prediction,
        image::Image,
    };
    use image::{Rgb, RgbImage};
    use ndarray::{Array1, Array2, array};

    /// One box covering the left half of every image.
    struct HalfDetector;

    impl ObjectDetector for HalfDetector {
        fn detect_objects(&mut self, image: &Image) -> anyhow::Result<Vec<Prediction>> {
            Ok(vec![Prediction {
                x_min: 0,
                y_min: 0,
                x_max: image.width / 2,
                y_max: image.height / 2,
                confidence: 0.9,
                label: "object".into(),
            }])
        }
    }

    /// Every crop looks like "Mug", text features are one-hot per known description.
    struct MugEmbedder;

    impl Embedder for MugEmbedder {
        fn text_feature(&mut self, description: &str) -> anyhow::Result<Array1<f32>> {
            Ok(match description {
                "Mug" => array![1.0, 0.0, 0.0],
                "Book" => array![0.0, 1.0, 0.0],
                _ => array![0.0, 0.0, 1.0],
            })
        }

        fn image_features(&mut self, crops: &[RgbImage]) -> anyhow::Result<Array2<f32>> {
            let mut features = Array2::zeros((crops.len(), 3));
            features.column_mut(0).fill(1.0);
            Ok(features)
        }
    }

    fn analyzer() -> Analyzer<HalfDetector, MugEmbedder> {
        Analyzer::new(HalfDetector, MugEmbedder, AnalyzerConfig::default())
    }

    fn dataset(dir: &Path) -> Dataset {
        let dataset = Dataset::new(dir);
        std::fs::create_dir_all(dataset.subset_dir()).unwrap();
        std::fs::create_dir_all(dataset.processed_dir()).unwrap();
        for name in ["b.jpg", "a.png", "c.JPG", "d.jpg"] {
            RgbImage::from_pixel(64, 64, Rgb([120, 80, 40]))
                .save_with_format(dataset.subset_dir().join(name), image::ImageFormat::Png)
                .unwrap();
        }
        std::fs::write(dataset.subset_dir().join("notes.txt"), "ignore me").unwrap();
        std::fs::write(
            dataset.metadata_csv(),
            "image,asins\n\
             a.png,M1;B1\n\
             b.jpg,\"M1, M1\"\n\
             c.JPG,UNKNOWN\n",
        )
        .unwrap();
        std::fs::write(
            dataset.small_catalog(),
            r#"{"M1": "Mug", "B1": "Book"}"#,
        )
        .unwrap();
        dataset
    }

    #[test]
    fn test_list_bin_images_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dataset(dir.path());
        let names: Vec<String> = list_bin_images(&dataset.subset_dir())
            .unwrap()
            .iter()
            .map(|p| image_name(p))
            .collect();
        assert_eq!(names, vec!["a.png", "b.jpg", "c.JPG", "d.jpg"]);
    }

    #[test]
    fn test_select_validation_images_is_deterministic() {
        let images: Vec<PathBuf> = (0..20).map(|i| PathBuf::from(format!("{i}.jpg"))).collect();
        let first = select_validation_images(images.clone(), 5, 42);
        let second = select_validation_images(images.clone(), 5, 42);
        assert_eq!(first, second);
        assert_eq!(first.len(), 5);
        assert_eq!(select_validation_images(images, 50, 42).len(), 20);
    }

    #[test]
    fn test_run_subset_writes_results() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dataset(dir.path());
        let results = run_subset(&mut analyzer(), &dataset, 3).unwrap();

        assert_eq!(results.len(), 3);
        // Center crop and the detection crop both look like a mug
        assert_eq!(results["a.png"], MatchCounts::from([("Mug".to_string(), 2)]));
        assert_eq!(results["b.jpg"], MatchCounts::from([("Mug".to_string(), 2)]));
        assert!(results["c.JPG"].is_empty());
        assert!(!results.contains_key("d.jpg"));

        let saved: SubsetResults =
            serde_json::from_str(&std::fs::read_to_string(dataset.subset_results()).unwrap())
                .unwrap();
        assert_eq!(saved, results);
    }

    #[test]
    fn test_run_validation_scores_bins() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dataset(dir.path());
        let summary = run_validation(&mut analyzer(), &dataset, 50, 42).unwrap();

        assert_eq!(summary.images_tested, 4);
        // a.png expects Mug + Book, b.jpg expects 2 Mugs
        assert_eq!(summary.total_expected, 4);
        assert_eq!(summary.total_verified, 3);
        assert_eq!(summary.perfect_bins, 1);
    }

    #[test]
    fn test_blank_catalog_descriptions_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dataset(dir.path());
        std::fs::write(
            dataset.metadata_csv(),
            "image,asins\n\
             a.png,M1\n\
             b.jpg,E1\n\
             c.JPG,E1;M1\n",
        )
        .unwrap();
        std::fs::write(dataset.small_catalog(), r#"{"M1": "Mug", "E1": ""}"#).unwrap();

        let results = run_subset(&mut analyzer(), &dataset, 4).unwrap();
        assert!(results["b.jpg"].is_empty());
        assert_eq!(results["c.JPG"], MatchCounts::from([("Mug".to_string(), 2)]));

        let summary = run_validation(&mut analyzer(), &dataset, 50, 42).unwrap();
        assert_eq!(summary.images_tested, 4);
        // b.jpg and d.jpg have nothing to verify
        assert_eq!(summary.total_expected, 2);
        assert_eq!(summary.total_verified, 2);
        assert_eq!(summary.perfect_bins, 2);
    }

    #[test]
    fn test_run_validation_ignores_later_unknown_rows() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dataset(dir.path());
        std::fs::write(
            dataset.metadata_csv(),
            "image,asins\n\
             a.png,B1\n\
             a.png,UNKNOWN\n",
        )
        .unwrap();

        let results = run_subset(&mut analyzer(), &dataset, 1).unwrap();
        assert!(results["a.png"].is_empty());

        let summary = run_validation(&mut analyzer(), &dataset, 50, 42).unwrap();
        // a.png is still checked against its Book row, and every crop looks like a mug
        assert_eq!(summary.total_expected, 1);
        assert_eq!(summary.total_verified, 0);
        assert_eq!(summary.perfect_bins, 0);
    }

    #[test]
    fn test_make_small_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("master_metadata.csv");
        let full = dir.path().join("asin_text.json");
        let out = dir.path().join("processed/asin_text_small.json");
        std::fs::write(&csv_path, "image,asins\nx.jpg,A;B;B\ny.jpg,C;B;A\n").unwrap();
        std::fs::write(&full, r#"{"A": "Apple", "C": "Cable", "Z": "Zebra"}"#).unwrap();

        let small = make_small_catalog(&csv_path, &full, &out, 2).unwrap();
        // B is most frequent but missing from the full catalog
        assert_eq!(small.asins().collect::<Vec<_>>(), vec!["A"]);
        assert_eq!(DescriptionCatalog::load(&out).unwrap().get("A"), Some("Apple"));
    }
}

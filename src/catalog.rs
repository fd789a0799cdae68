//! Product catalog (ASIN -> description) and per bin metadata.

use crate::verification::Order;
use anyhow::Context;
use serde::Deserialize;
use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
};
use tracing::{info, warn};

/// ASIN to description mapping, in file order.
#[derive(Debug, Clone, Default)]
pub struct DescriptionCatalog {
    entries: Vec<(String, String)>,
    index: HashMap<String, usize>,
}

impl DescriptionCatalog {
    pub fn from_entries(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut catalog = Self::default();
        for (asin, description) in entries {
            catalog.insert(asin, description);
        }
        catalog
    }

    fn insert(&mut self, asin: String, description: String) {
        match self.index.get(&asin) {
            Some(&i) => self.entries[i].1 = description,
            None => {
                self.index.insert(asin.clone(), self.entries.len());
                self.entries.push((asin, description));
            }
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog {}", path.display()))?;
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&data)
            .with_context(|| format!("Catalog {} is not a JSON object", path.display()))?;
        let mut catalog = Self::default();
        for (asin, description) in map {
            match description {
                serde_json::Value::String(description) => catalog.insert(asin, description),
                other => warn!(%asin, ?other, "Skipping catalog entry without a text description"),
            }
        }
        info!(path = %path.display(), entries = catalog.len(), "Catalog loaded");
        Ok(catalog)
    }

    /// Loads `full` when it exists, otherwise `small`.
    pub fn load_with_fallback(full: &Path, small: &Path) -> anyhow::Result<Self> {
        if full.exists() {
            Self::load(full)
        } else {
            info!(
                "Catalog {} not found, using {}",
                full.display(),
                small.display()
            );
            Self::load(small)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let map: serde_json::Map<String, serde_json::Value> = self
            .entries
            .iter()
            .map(|(asin, description)| (asin.clone(), serde_json::Value::from(description.clone())))
            .collect();
        let json = serde_json::to_string_pretty(&map)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write catalog {}", path.display()))?;
        Ok(())
    }

    pub fn get(&self, asin: &str) -> Option<&str> {
        self.index
            .get(asin)
            .map(|&i| self.entries[i].1.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn asins(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(asin, _)| asin.as_str())
    }

    /// Sorted, deduplicated descriptions.
    pub fn unique_descriptions(&self) -> Vec<String> {
        let mut descriptions: Vec<String> = self.entries.iter().map(|(_, d)| d.clone()).collect();
        descriptions.sort();
        descriptions.dedup();
        descriptions
    }

    /// Case-insensitive substring search over [`Self::unique_descriptions`].
    pub fn search(&self, term: &str) -> Vec<String> {
        let term = term.to_lowercase();
        self.unique_descriptions()
            .into_iter()
            .filter(|d| d.to_lowercase().contains(&term))
            .collect()
    }

    /// Entries for `asins` that exist in the catalog, in the order given.
    pub fn subset<S: AsRef<str>>(&self, asins: &[S]) -> Self {
        Self::from_entries(asins.iter().filter_map(|asin| {
            self.get(asin.as_ref())
                .map(|d| (asin.as_ref().to_string(), d.to_string()))
        }))
    }

    /// Descriptions for `asins` in order, duplicates kept. Unknown ASINs and blank
    /// descriptions are skipped.
    pub fn expected_descriptions<S: AsRef<str>>(&self, asins: &[S]) -> Vec<String> {
        asins
            .iter()
            .filter_map(|asin| self.get(asin.as_ref()))
            .filter(|description| !description.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Order where each ASIN occurrence adds one unit of its description.
    pub fn expected_order<S: AsRef<str>>(&self, asins: &[S]) -> anyhow::Result<Order> {
        let mut order = Order::default();
        for description in self.expected_descriptions(asins) {
            order.increment(&description, 1)?;
        }
        Ok(order)
    }

    /// Expected order of `image`, taken from its last metadata row with at least one known item.
    pub fn bin_order(&self, metadata: &BinMetadata, image: &str) -> anyhow::Result<Order> {
        for asins in metadata.rows(image).iter().rev() {
            let order = self.expected_order(asins.as_slice())?;
            if !order.is_empty() {
                return Ok(order);
            }
        }
        Ok(Order::default())
    }
}

#[derive(Debug, Deserialize)]
struct MetadataRecord {
    #[serde(default)]
    image: String,
    #[serde(default)]
    asins: String,
}

/// Splits an `asins` cell on `;` or `,`, trimming and dropping empties.
pub fn parse_asin_list(raw: &str) -> Vec<String> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

fn read_metadata_records(path: &Path) -> anyhow::Result<Vec<MetadataRecord>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open metadata {}", path.display()))?;
    reader
        .deserialize::<MetadataRecord>()
        .map(|record| record.with_context(|| format!("Malformed row in {}", path.display())))
        .collect()
}

/// Expected ASINs per bin image, from `master_metadata.csv`.
///
/// Every row of an image is kept in file order.
#[derive(Debug, Clone, Default)]
pub struct BinMetadata {
    bins: BTreeMap<String, Vec<Vec<String>>>,
}

impl BinMetadata {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut bins: BTreeMap<String, Vec<Vec<String>>> = BTreeMap::new();
        for record in read_metadata_records(path)? {
            if record.image.is_empty() {
                continue;
            }
            bins.entry(record.image)
                .or_default()
                .push(parse_asin_list(&record.asins));
        }
        info!(path = %path.display(), bins = bins.len(), "Bin metadata loaded");
        Ok(Self { bins })
    }

    /// ASINs of the last row for `image`.
    pub fn asins(&self, image: &str) -> &[String] {
        self.rows(image).last().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rows(&self, image: &str) -> &[Vec<String>] {
        self.bins.get(image).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

impl FromIterator<(String, Vec<String>)> for BinMetadata {
    fn from_iter<T: IntoIterator<Item = (String, Vec<String>)>>(iter: T) -> Self {
        let mut bins: BTreeMap<String, Vec<Vec<String>>> = BTreeMap::new();
        for (image, asins) in iter {
            bins.entry(image).or_default().push(asins);
        }
        Self { bins }
    }
}

/// Most frequent ASINs across every metadata row, count descending, first seen wins ties.
pub fn top_asins(metadata_csv: &Path, n: usize) -> anyhow::Result<Vec<String>> {
    let all_asins = read_metadata_records(metadata_csv)?
        .into_iter()
        .flat_map(|record| parse_asin_list(&record.asins));
    Ok(rank_by_frequency(all_asins, n))
}

pub fn rank_by_frequency(items: impl IntoIterator<Item = String>, n: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (position, item) in items.into_iter().enumerate() {
        counts.entry(item).or_insert((0, position)).0 += 1;
    }
    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.0.cmp(&a.1.0).then(a.1.1.cmp(&b.1.1)));
    ranked.into_iter().take(n).map(|(item, _)| item).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> DescriptionCatalog {
        DescriptionCatalog::from_entries([
            ("B01".to_string(), "Red Nike Shoes".to_string()),
            ("B02".to_string(), "Blue coffee mug".to_string()),
            ("B03".to_string(), "Red Nike Shoes".to_string()),
        ])
    }

    #[test]
    fn test_parse_asin_list() {
        assert_eq!(parse_asin_list("A1; B2,C3 ,,"), vec!["A1", "B2", "C3"]);
        assert!(parse_asin_list("").is_empty());
    }

    #[test]
    fn test_catalog_lookups() {
        let catalog = catalog();
        assert_eq!(catalog.get("B02"), Some("Blue coffee mug"));
        assert_eq!(catalog.get("nope"), None);
        assert_eq!(
            catalog.unique_descriptions(),
            vec!["Blue coffee mug", "Red Nike Shoes"]
        );
        assert_eq!(catalog.search("nike"), vec!["Red Nike Shoes"]);
        assert!(catalog.search("laptop").is_empty());
    }

    #[test]
    fn test_expected_descriptions_and_order() {
        let catalog = catalog();
        let asins = ["B01", "X", "B02", "B01", "B03"];
        assert_eq!(
            catalog.expected_descriptions(&asins),
            vec!["Red Nike Shoes", "Blue coffee mug", "Red Nike Shoes", "Red Nike Shoes"]
        );
        let order = catalog.expected_order(&asins).unwrap();
        assert_eq!(order.quantity("Red Nike Shoes"), Some(3));
        assert_eq!(order.quantity("Blue coffee mug"), Some(1));
        assert_eq!(order.descriptions(), vec!["Red Nike Shoes", "Blue coffee mug"]);
    }

    #[test]
    fn test_rank_by_frequency_ties_keep_first_seen() {
        let items = ["c", "a", "b", "a", "b", "d"].map(String::from);
        assert_eq!(rank_by_frequency(items, 3), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_catalog_roundtrip_preserves_order_and_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let small = dir.path().join("asin_text_small.json");
        let full = dir.path().join("asin_text.json");
        catalog().subset(&["B02", "B01", "missing"]).save(&small).unwrap();

        let loaded = DescriptionCatalog::load_with_fallback(&full, &small).unwrap();
        assert_eq!(loaded.asins().collect::<Vec<_>>(), vec!["B02", "B01"]);

        std::fs::write(&full, r#"{"Z9": "Stapler", "Z8": 5}"#).unwrap();
        let loaded = DescriptionCatalog::load_with_fallback(&full, &small).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("Z9"), Some("Stapler"));
    }

    #[test]
    fn test_bin_metadata_and_top_asins() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("master_metadata.csv");
        std::fs::write(
            &csv_path,
            "image,asins,quantity\n\
             bin_1.jpg,A1;A2,2\n\
             ,A9,1\n\
             bin_2.jpg,\"A2, A3\",2\n\
             bin_3.jpg,,0\n\
             bin_1.jpg,A2;A2,2\n",
        )
        .unwrap();

        let metadata = BinMetadata::load(&csv_path).unwrap();
        assert_eq!(metadata.len(), 3);
        assert_eq!(metadata.asins("bin_1.jpg"), ["A2", "A2"]);
        assert_eq!(metadata.asins("bin_2.jpg"), ["A2", "A3"]);
        assert!(metadata.asins("bin_3.jpg").is_empty());
        assert!(metadata.asins("unknown.jpg").is_empty());

        let top = top_asins(&csv_path, 2).unwrap();
        assert_eq!(top, vec!["A2", "A1"]);
    }

    #[test]
    fn test_blank_descriptions_are_not_expected() {
        let catalog = DescriptionCatalog::from_entries([
            ("M1".to_string(), "Mug".to_string()),
            ("E1".to_string(), "".to_string()),
            ("E2".to_string(), "  ".to_string()),
        ]);
        assert_eq!(catalog.expected_descriptions(&["E1", "M1", "E2"]), vec!["Mug"]);
        assert!(catalog.expected_order(&["E1", "E2"]).unwrap().is_empty());
        assert_eq!(catalog.expected_order(&["E1", "M1"]).unwrap().quantity("Mug"), Some(1));
    }

    #[test]
    fn test_bin_order_keeps_last_row_with_known_items() {
        let catalog = catalog();
        let metadata: BinMetadata = [
            ("bin_1.jpg".to_string(), vec!["B01".to_string()]),
            ("bin_1.jpg".to_string(), vec!["B02".to_string(), "B02".to_string()]),
            ("bin_1.jpg".to_string(), vec!["UNKNOWN".to_string()]),
            ("bin_2.jpg".to_string(), vec!["UNKNOWN".to_string()]),
        ]
        .into_iter()
        .collect();

        assert_eq!(metadata.len(), 2);
        assert_eq!(metadata.rows("bin_1.jpg").len(), 3);
        assert_eq!(metadata.asins("bin_1.jpg"), ["UNKNOWN"]);

        let order = catalog.bin_order(&metadata, "bin_1.jpg").unwrap();
        assert_eq!(order.descriptions(), vec!["Blue coffee mug"]);
        assert_eq!(order.quantity("Blue coffee mug"), Some(2));
        assert!(catalog.bin_order(&metadata, "bin_2.jpg").unwrap().is_empty());
        assert!(catalog.bin_order(&metadata, "missing.jpg").unwrap().is_empty());
    }
}

//! Orders and how a bin's detected counts are judged against them.
//!
//! Two judgements exist. [`verify_order`] is the strict per item check used when an
//! operator validates a single bin: an item matches only when at least the ordered
//! quantity was found. [`score_bin`] is the lenient scoring used for dataset
//! validation, where every found unit up to the ordered quantity counts toward recall.

use anyhow::{Context, bail};
use std::{collections::BTreeMap, fmt, path::Path};

pub type MatchCounts = BTreeMap<String, usize>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderLine {
    pub description: String,
    pub quantity: usize,
}

/// Ordered manifest of item descriptions and quantities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Order {
    lines: Vec<OrderLine>,
}

impl Order {
    /// Adds an item, replacing the quantity if the description is already present.
    pub fn add(&mut self, description: &str, quantity: usize) -> anyhow::Result<()> {
        let description = description.trim();
        if description.is_empty() {
            bail!("Order item description is empty");
        }
        if quantity == 0 {
            bail!("Quantity for {description:?} must be at least 1");
        }
        match self.lines.iter_mut().find(|l| l.description == description) {
            Some(line) => line.quantity = quantity,
            None => self.lines.push(OrderLine {
                description: description.to_string(),
                quantity,
            }),
        }
        Ok(())
    }

    /// Adds `quantity` on top of whatever is already ordered for `description`.
    pub fn increment(&mut self, description: &str, quantity: usize) -> anyhow::Result<()> {
        let current = self.quantity(description).unwrap_or(0);
        self.add(description, current + quantity)
    }

    pub fn quantity(&self, description: &str) -> Option<usize> {
        self.lines
            .iter()
            .find(|l| l.description == description.trim())
            .map(|l| l.quantity)
    }

    pub fn lines(&self) -> &[OrderLine] {
        &self.lines
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.lines.iter().map(|l| l.description.clone()).collect()
    }

    pub fn total_quantity(&self) -> usize {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Loads `{ "description": quantity, ... }`, keeping file order.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read order file {}", path.display()))?;
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&data)
            .with_context(|| format!("Order file {} is not a JSON object", path.display()))?;
        let mut order = Self::default();
        for (description, quantity) in map {
            let Some(quantity) = quantity.as_u64() else {
                bail!("Quantity for {description:?} must be a positive integer");
            };
            order.add(&description, quantity as usize)?;
        }
        Ok(order)
    }
}

/// Splits `DESC[=QTY]`, quantity defaults to 1.
pub fn parse_item_arg(arg: &str) -> anyhow::Result<(String, usize)> {
    match arg.rsplit_once('=') {
        Some((description, quantity))
            if !quantity.trim().is_empty()
                && quantity.trim().chars().all(|c| c.is_ascii_digit()) =>
        {
            let quantity = quantity
                .trim()
                .parse::<usize>()
                .with_context(|| format!("Invalid quantity in {arg:?}"))?;
            Ok((description.trim().to_string(), quantity))
        }
        _ => Ok((arg.trim().to_string(), 1)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemStatus {
    Match,
    Mismatch,
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemStatus::Match => write!(f, "MATCH"),
            ItemStatus::Mismatch => write!(f, "MISMATCH"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemVerification {
    pub description: String,
    pub quantity: usize,
    pub found: usize,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderVerification {
    pub items: Vec<ItemVerification>,
    pub all_verified: bool,
}

impl fmt::Display for OrderVerification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .items
            .iter()
            .map(|i| i.description.chars().count())
            .max()
            .unwrap_or(0)
            .max("Item".len());
        writeln!(f, "{:<width$} | {:>8} | Status", "Item", "Quantity")?;
        writeln!(f, "{}", "-".repeat(width + 22))?;
        for item in &self.items {
            writeln!(
                f,
                "{:<width$} | {:>8} | {}",
                item.description, item.quantity, item.status
            )?;
        }
        if self.all_verified {
            write!(f, "ORDER VERIFIED")
        } else {
            write!(f, "ORDER NOT VERIFIED")
        }
    }
}

/// Strict check: an item matches only if at least its ordered quantity was found.
pub fn verify_order(order: &Order, counts: &MatchCounts) -> anyhow::Result<OrderVerification> {
    if order.is_empty() {
        bail!("Order is empty, add at least one item before validating");
    }
    let items: Vec<ItemVerification> = order
        .lines()
        .iter()
        .map(|line| {
            let found = counts.get(&line.description).copied().unwrap_or(0);
            let status = if found >= line.quantity {
                ItemStatus::Match
            } else {
                ItemStatus::Mismatch
            };
            ItemVerification {
                description: line.description.clone(),
                quantity: line.quantity,
                found,
                status,
            }
        })
        .collect();
    let all_verified = items.iter().all(|i| i.status == ItemStatus::Match);
    Ok(OrderVerification {
        items,
        all_verified,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinScore {
    pub expected: usize,
    pub verified: usize,
}

impl BinScore {
    pub fn is_perfect(&self) -> bool {
        self.verified == self.expected
    }
}

/// Found units are capped at the ordered quantity, surplus finds earn nothing.
pub fn score_bin(order: &Order, counts: &MatchCounts) -> BinScore {
    let verified = order
        .lines()
        .iter()
        .map(|line| {
            counts
                .get(&line.description)
                .copied()
                .unwrap_or(0)
                .min(line.quantity)
        })
        .sum();
    BinScore {
        expected: order.total_quantity(),
        verified,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationSummary {
    pub images_tested: usize,
    pub total_expected: usize,
    pub total_verified: usize,
    pub perfect_bins: usize,
}

impl ValidationSummary {
    pub fn record(&mut self, score: BinScore) {
        self.total_expected += score.expected;
        self.total_verified += score.verified;
        if score.is_perfect() {
            self.perfect_bins += 1;
        }
    }

    /// Item recall in percent, 0 when nothing was expected.
    pub fn recall(&self) -> f64 {
        if self.total_expected == 0 {
            0.0
        } else {
            self.total_verified as f64 / self.total_expected as f64 * 100.0
        }
    }
}

impl fmt::Display for ValidationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "=".repeat(40))?;
        writeln!(f, "FINAL RESULTS (ZERO-SHOT)")?;
        writeln!(f, "{}", "=".repeat(40))?;
        writeln!(f, "Images Tested       : {}", self.images_tested)?;
        writeln!(f, "Total Items Ordered : {}", self.total_expected)?;
        writeln!(f, "Total Items Verified: {}", self.total_verified)?;
        writeln!(f, "Item Recall Rate    : {:.2}%", self.recall())?;
        writeln!(f, "Perfect Bins        : {}", self.perfect_bins)?;
        write!(f, "{}", "=".repeat(40))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(entries: &[(&str, usize)]) -> MatchCounts {
        entries.iter().map(|(d, c)| (d.to_string(), *c)).collect()
    }

    #[test]
    fn test_order_add_overwrites_quantity() {
        let mut order = Order::default();
        order.add("Red Nike Shoes", 1).unwrap();
        order.add("Blue mug", 2).unwrap();
        order.add(" Red Nike Shoes ", 3).unwrap();
        assert_eq!(order.len(), 2);
        assert_eq!(order.quantity("Red Nike Shoes"), Some(3));
        assert_eq!(order.descriptions(), vec!["Red Nike Shoes", "Blue mug"]);
        assert_eq!(order.total_quantity(), 5);

        order.increment("Blue mug", 1).unwrap();
        assert_eq!(order.quantity("Blue mug"), Some(3));

        assert!(order.add("", 1).is_err());
        assert!(order.add("x", 0).is_err());
        assert_eq!(order.len(), 2);
        assert!(!order.is_empty());
    }

    #[test]
    fn test_parse_item_arg() {
        assert_eq!(parse_item_arg("Blue mug=3").unwrap(), ("Blue mug".into(), 3));
        assert_eq!(parse_item_arg("Blue mug").unwrap(), ("Blue mug".into(), 1));
        assert_eq!(
            parse_item_arg("a=b cable").unwrap(),
            ("a=b cable".into(), 1)
        );
    }

    #[test]
    fn test_verify_order_is_strict() {
        let mut order = Order::default();
        order.add("shoe", 2).unwrap();
        order.add("mug", 1).unwrap();

        let partial = verify_order(&order, &counts(&[("shoe", 1), ("mug", 4)])).unwrap();
        assert_eq!(partial.items[0].status, ItemStatus::Mismatch);
        assert_eq!(partial.items[1].status, ItemStatus::Match);
        assert!(!partial.all_verified);

        let full = verify_order(&order, &counts(&[("shoe", 2), ("mug", 1)])).unwrap();
        assert!(full.all_verified);
        assert!(full.to_string().ends_with("ORDER VERIFIED"));

        assert!(verify_order(&Order::default(), &MatchCounts::new()).is_err());
    }

    #[test]
    fn test_score_bin_caps_found_quantity() {
        let mut order = Order::default();
        order.add("book", 1).unwrap();
        order.add("cable", 2).unwrap();

        let score = score_bin(&order, &counts(&[("book", 6), ("cable", 1), ("other", 3)]));
        assert_eq!(score, BinScore { expected: 3, verified: 2 });
        assert!(!score.is_perfect());

        let score = score_bin(&order, &counts(&[("book", 1), ("cable", 2)]));
        assert!(score.is_perfect());
    }

    #[test]
    fn test_validation_summary_recall() {
        let mut summary = ValidationSummary::default();
        assert_eq!(summary.recall(), 0.0);
        summary.record(BinScore { expected: 3, verified: 3 });
        summary.record(BinScore { expected: 1, verified: 0 });
        summary.images_tested = 2;
        assert_eq!(summary.perfect_bins, 1);
        assert!((summary.recall() - 75.0).abs() < 1e-9);
        assert!(summary.to_string().contains("Item Recall Rate    : 75.00%"));
    }

    #[test]
    fn test_order_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("order.json");
        std::fs::write(&path, r#"{"Red shoe": 2, "Blue mug": 1}"#).unwrap();
        let order = Order::from_json_file(&path).unwrap();
        assert_eq!(order.descriptions(), vec!["Red shoe", "Blue mug"]);
        assert_eq!(order.quantity("Red shoe"), Some(2));

        std::fs::write(&path, r#"{"Red shoe": "two"}"#).unwrap();
        assert!(Order::from_json_file(&path).is_err());
    }
}

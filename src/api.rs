use crate::verification::{ItemStatus, OrderVerification};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;

#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct Prediction {
    pub x_max: usize,
    pub x_min: usize,
    pub y_max: usize,
    pub y_min: usize,
    pub confidence: f32,
    pub label: String,
}

impl Debug for Prediction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prediction")
            .field("label", &self.label)
            .field("confidence", &self.confidence)
            .field("x_min", &self.x_min)
            .field("y_min", &self.y_min)
            .field("x_max", &self.x_max)
            .field("y_max", &self.y_max)
            .finish()
    }
}

/// JSON document printed by `smart_bin --json`.
#[derive(Serialize, Deserialize, Default, Debug)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationResponse {
    /// True if the analysis ran.
    pub success: bool,
    /// Image that was verified.
    pub image: String,
    /// Description of the error if success was false.
    pub error: Option<String>,
    /// True when every ordered item was found in at least the ordered quantity.
    pub all_verified: bool,
    /// One entry per ordered item.
    pub items: Vec<ItemResponse>,
    /// Raw counts per description, including items found beyond the ordered quantity.
    pub detected_counts: BTreeMap<String, usize>,
    /// Detector boxes before crop filtering.
    pub detections: usize,
    /// Time (ms) for the whole analysis.
    pub process_ms: i32,
}

#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemResponse {
    pub item: String,
    pub quantity: usize,
    pub found: usize,
    pub status: String,
}

impl VerificationResponse {
    pub fn from_verification(
        image: String,
        verification: &OrderVerification,
        detected_counts: BTreeMap<String, usize>,
        detections: usize,
        process_ms: i32,
    ) -> Self {
        Self {
            success: true,
            image,
            error: None,
            all_verified: verification.all_verified,
            items: verification
                .items
                .iter()
                .map(|item| ItemResponse {
                    item: item.description.clone(),
                    quantity: item.quantity,
                    found: item.found,
                    status: item.status.to_string(),
                })
                .collect(),
            detected_counts,
            detections,
            process_ms,
        }
    }

    pub fn failure(image: String, error: &anyhow::Error) -> Self {
        Self {
            success: false,
            image,
            error: Some(format!("{error:#}")),
            ..Default::default()
        }
    }

    pub fn mismatched_items(&self) -> impl Iterator<Item = &ItemResponse> {
        let mismatch = ItemStatus::Mismatch.to_string();
        self.items.iter().filter(move |i| i.status == mismatch)
    }
}

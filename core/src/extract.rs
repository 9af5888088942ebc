use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::models::{
    Analysis, ChatMessage, Item, Receipt, ReceiptMetadata, ScanQuality, UserProfile,
};

/// One image or PDF handed to the extractor.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn from_path(path: &Path) -> Result<Self> {
        let mime_type = mime_for_path(path)
            .with_context(|| format!("Unsupported file type: {}", path.display()))?;
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Ok(Self {
            file_name,
            mime_type: mime_type.to_string(),
            bytes,
        })
    }
}

#[must_use]
pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => Some("image/jpeg"),
        "png" => Some("image/png"),
        "webp" => Some("image/webp"),
        "heic" => Some("image/heic"),
        "heif" => Some("image/heif"),
        "pdf" => Some("application/pdf"),
        _ => None,
    }
}

/// Turns one receipt image into a structured receipt. Any error means the
/// input was unreadable or processing failed; there are no partial results.
#[async_trait]
pub trait ReceiptExtractor: Send + Sync {
    async fn extract(&self, upload: &Upload, profile: &UserProfile) -> Result<Receipt>;
}

/// Conversational budget coach.
#[async_trait]
pub trait Coach: Send + Sync {
    async fn reply(
        &self,
        profile: &UserProfile,
        history: &[Receipt],
        chat: &[ChatMessage],
    ) -> Result<String>;
}

/// Keeps the device awake while a processing batch runs.
pub trait WakeLock: Send + Sync {
    fn acquire(&self) -> Result<()>;
    fn release(&self);
}

/// Platforms without a wake lock.
pub struct NoWakeLock;

impl WakeLock for NoWakeLock {
    fn acquire(&self) -> Result<()> {
        Ok(())
    }

    fn release(&self) {}
}

/// Holds a wake lock for its lifetime. Releases on drop, on every exit path.
pub struct WakeGuard<'a> {
    lock: &'a dyn WakeLock,
    held: bool,
}

impl<'a> WakeGuard<'a> {
    pub fn acquire(lock: &'a dyn WakeLock) -> Self {
        let held = match lock.acquire() {
            Ok(()) => true,
            Err(e) => {
                warn!("wake lock unavailable: {e:#}");
                false
            }
        };
        Self { lock, held }
    }
}

impl Drop for WakeGuard<'_> {
    fn drop(&mut self) {
        if self.held {
            self.lock.release();
        }
    }
}

// --- Model output ---

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExtractedReceipt {
    pub store_name: Option<String>,
    pub date: Option<String>,
    pub time: Option<String>,
    pub total_spent: Option<f64>,
    pub total_saved: Option<f64>,
    pub scan_quality: Option<ScanQuality>,
    pub items: Vec<ExtractedItem>,
    pub analysis: Option<ExtractedAnalysis>,
    pub coach_message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExtractedItem {
    pub raw_name: Option<String>,
    pub name: Option<String>,
    pub category: Option<String>,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub total_price: Option<f64>,
    pub is_discounted: Option<bool>,
    pub tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExtractedAnalysis {
    pub budget_impact_pct: Option<f64>,
    pub diet_compliant: Option<bool>,
    pub flagged_items: Vec<String>,
    pub insights: Option<String>,
}

/// Parse the model's text reply, tolerating a fenced code block around the JSON.
pub fn parse_model_output(text: &str) -> Result<ExtractedReceipt> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).context("Model reply is not valid receipt JSON")
}

fn extracted_item(item: ExtractedItem) -> Option<Item> {
    let raw_name = item
        .raw_name
        .or_else(|| item.name.clone())
        .filter(|n| !n.trim().is_empty())?;
    let quantity = item.quantity.filter(|q| *q > 0.0).unwrap_or(1.0);
    let total_price = item
        .total_price
        .or_else(|| item.unit_price.map(|u| u * quantity))?;
    let unit_price = item.unit_price.unwrap_or(total_price / quantity);
    Some(Item {
        name: item.name.unwrap_or_else(|| raw_name.clone()),
        raw_name,
        category: item.category.unwrap_or_default(),
        quantity,
        unit_price,
        total_price,
        is_discounted: item.is_discounted.unwrap_or(false),
        tags: item.tags,
    })
}

/// Convert model output into a receipt. `None` when nothing usable was read.
#[must_use]
pub fn extracted_to_receipt(extracted: ExtractedReceipt) -> Option<Receipt> {
    let items: Vec<Item> = extracted
        .items
        .into_iter()
        .filter_map(extracted_item)
        .collect();
    if items.is_empty() && extracted.total_spent.unwrap_or(0.0) <= 0.0 {
        return None;
    }

    let analysis = extracted.analysis.unwrap_or_default();
    Some(Receipt {
        id: String::new(),
        image_ref: None,
        metadata: ReceiptMetadata {
            store_name: extracted.store_name.unwrap_or_default(),
            date: extracted.date.unwrap_or_default(),
            time: extracted.time,
            total_spent: extracted.total_spent.unwrap_or(0.0),
            total_saved: extracted.total_saved.unwrap_or(0.0),
            scan_quality: extracted.scan_quality.unwrap_or_default(),
        },
        items,
        analysis: Analysis {
            budget_impact_pct: analysis.budget_impact_pct.unwrap_or(0.0),
            diet_compliant: analysis.diet_compliant.unwrap_or(true),
            flagged_items: analysis.flagged_items,
            insights: analysis.insights.unwrap_or_default(),
        },
        coach_message: extracted.coach_message.unwrap_or_default(),
    })
}

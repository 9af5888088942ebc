use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category labels used when a profile has no custom categories.
pub const DEFAULT_CATEGORIES: &[&str] = &[
    "Produce",
    "Meat & Seafood",
    "Dairy & Eggs",
    "Bakery",
    "Pantry",
    "Frozen",
    "Beverages",
    "Snacks",
    "Household",
    "Personal Care",
    "Other",
];

/// Label items fall back to when the extractor returns an unknown category.
pub const FALLBACK_CATEGORY: &str = "Other";

/// Maximum number of receipts kept in history (newest first).
pub const HISTORY_CAP: usize = 100;

/// Maximum number of chat messages kept (most recent).
pub const CHAT_CAP: usize = 30;

const PRICE_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Trial,
    Active,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Owner,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub name: String,
    pub email: String,
    pub dietary_regime: String,
    pub monthly_budget: f64,
    pub current_spend: f64,
    pub family_context: String,
    pub goals: String,
    pub account_status: AccountStatus,
    pub role: Role,
    pub joined_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promo_code: Option<String>,
    pub custom_categories: Vec<String>,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            email: String::new(),
            dietary_regime: "none".to_string(),
            monthly_budget: 600.0,
            current_spend: 0.0,
            family_context: String::new(),
            goals: String::new(),
            account_status: AccountStatus::Trial,
            role: Role::User,
            joined_at: String::new(),
            promo_code: None,
            custom_categories: default_categories(),
        }
    }
}

impl UserProfile {
    /// Produce a fully populated profile: keyed email, non-negative budget,
    /// and a non-empty, de-duplicated category list.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.email = normalize_email(&self.email);
        self.name = self.name.trim().to_string();
        if !self.monthly_budget.is_finite() || self.monthly_budget < 0.0 {
            self.monthly_budget = 0.0;
        }
        if !self.current_spend.is_finite() || self.current_spend < 0.0 {
            self.current_spend = 0.0;
        }

        let mut categories: Vec<String> = Vec::new();
        for label in &self.custom_categories {
            let label = label.trim();
            if label.is_empty() {
                continue;
            }
            if !categories.iter().any(|c| c.eq_ignore_ascii_case(label)) {
                categories.push(label.to_string());
            }
        }
        if categories.is_empty() {
            categories = default_categories();
        }
        self.custom_categories = categories;
        self
    }

    /// An anonymous profile is never persisted.
    #[must_use]
    pub fn has_identity(&self) -> bool {
        !self.email.trim().is_empty()
    }

    #[must_use]
    pub fn categories(&self) -> &[String] {
        &self.custom_categories
    }
}

#[must_use]
pub fn default_categories() -> Vec<String> {
    DEFAULT_CATEGORIES.iter().map(|c| (*c).to_string()).collect()
}

/// Remote documents are keyed by trimmed, lower-cased email.
#[must_use]
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

pub fn validate_email(email: &str) -> Result<String> {
    let email = normalize_email(email);
    let Some((local, domain)) = email.split_once('@') else {
        bail!("Invalid email '{email}'. Expected name@domain");
    };
    if local.is_empty() || domain.is_empty() || email.contains(char::is_whitespace) {
        bail!("Invalid email '{email}'. Expected name@domain");
    }
    Ok(email)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanQuality {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiptMetadata {
    pub store_name: String,
    /// `YYYY-MM-DD`
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    pub total_spent: f64,
    pub total_saved: f64,
    pub scan_quality: ScanQuality,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Item {
    pub raw_name: String,
    pub name: String,
    pub category: String,
    pub quantity: f64,
    pub unit_price: f64,
    pub total_price: f64,
    pub is_discounted: bool,
    pub tags: Vec<String>,
}

impl Default for Item {
    fn default() -> Self {
        Self {
            raw_name: String::new(),
            name: String::new(),
            category: FALLBACK_CATEGORY.to_string(),
            quantity: 1.0,
            unit_price: 0.0,
            total_price: 0.0,
            is_discounted: false,
            tags: Vec::new(),
        }
    }
}

impl Item {
    /// True when `total_price` differs from `quantity * unit_price` by more
    /// than a cent. The mismatch is surfaced, never corrected.
    #[must_use]
    pub fn has_total_mismatch(&self) -> bool {
        (self.quantity * self.unit_price - self.total_price).abs() > PRICE_TOLERANCE
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.raw_name
        } else {
            &self.name
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Analysis {
    pub budget_impact_pct: f64,
    pub diet_compliant: bool,
    pub flagged_items: Vec<String>,
    pub insights: String,
}

impl Default for Analysis {
    fn default() -> Self {
        Self {
            budget_impact_pct: 0.0,
            diet_compliant: true,
            flagged_items: Vec::new(),
            insights: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Receipt {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
    pub metadata: ReceiptMetadata,
    pub items: Vec<Item>,
    pub analysis: Analysis,
    pub coach_message: String,
}

impl Receipt {
    /// Build a manually entered receipt; totals are derived from the items.
    #[must_use]
    pub fn manual(store_name: &str, date: NaiveDate, items: Vec<Item>) -> Self {
        Self {
            id: String::new(),
            image_ref: None,
            metadata: ReceiptMetadata {
                store_name: store_name.trim().to_string(),
                date: date.format("%Y-%m-%d").to_string(),
                time: None,
                total_spent: 0.0,
                total_saved: 0.0,
                scan_quality: ScanQuality::High,
            },
            items,
            analysis: Analysis::default(),
            coach_message: String::new(),
        }
    }

    /// Fill in identity and totals, and coerce every item category into
    /// `categories`.
    #[must_use]
    pub fn normalized(mut self, categories: &[String]) -> Self {
        if self.id.trim().is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        for item in &mut self.items {
            item.category = coerce_category(&item.category, categories);
            if item.name.trim().is_empty() {
                item.name = item.raw_name.trim().to_string();
            }
        }
        if self.metadata.total_spent <= 0.0 && !self.items.is_empty() {
            self.metadata.total_spent = self.items_total();
        }
        if !self.metadata.total_saved.is_finite() || self.metadata.total_saved < 0.0 {
            self.metadata.total_saved = 0.0;
        }
        self
    }

    #[must_use]
    pub fn items_total(&self) -> f64 {
        self.items.iter().map(|i| i.total_price).sum()
    }

    #[must_use]
    pub fn date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.metadata.date, "%Y-%m-%d").ok()
    }

    #[must_use]
    pub fn mismatched_items(&self) -> Vec<&Item> {
        self.items.iter().filter(|i| i.has_total_mismatch()).collect()
    }
}

/// Map a label onto the active category set, matching case-insensitively.
/// Unknown labels land on `Other` when the set has it, else on the last label.
#[must_use]
pub fn coerce_category(label: &str, categories: &[String]) -> String {
    let label = label.trim();
    if let Some(hit) = categories.iter().find(|c| c.eq_ignore_ascii_case(label)) {
        return hit.clone();
    }
    categories
        .iter()
        .find(|c| c.eq_ignore_ascii_case(FALLBACK_CATEGORY))
        .or_else(|| categories.last())
        .cloned()
        .unwrap_or_else(|| FALLBACK_CATEGORY.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub text: String,
}

impl ChatMessage {
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Model,
            text: text.into(),
        }
    }
}

/// The only unit of cross-device synchronization. Written whole to the local
/// cache and the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedBundle {
    pub user: UserProfile,
    #[serde(default)]
    pub history: Vec<Receipt>,
    #[serde(default)]
    pub chat_history: Vec<ChatMessage>,
    #[serde(default = "default_cloud_enabled")]
    pub is_cloud_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

fn default_cloud_enabled() -> bool {
    true
}

impl PersistedBundle {
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.user = self.user.normalized();
        let categories = self.user.custom_categories.clone();
        self.history = self
            .history
            .into_iter()
            .map(|r| r.normalized(&categories))
            .collect();
        cap_history(&mut self.history);
        cap_chat(&mut self.chat_history);
        self
    }
}

/// Remote document as stored: every field may be absent. Merging a pulled
/// document overwrites exactly the fields that are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteBundle {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<Receipt>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_history: Option<Vec<ChatMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_cloud_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
}

impl From<PersistedBundle> for RemoteBundle {
    fn from(bundle: PersistedBundle) -> Self {
        Self {
            user: Some(bundle.user),
            history: Some(bundle.history),
            chat_history: Some(bundle.chat_history),
            is_cloud_enabled: Some(bundle.is_cloud_enabled),
            saved_at: bundle.saved_at,
        }
    }
}

impl RemoteBundle {
    /// Wholesale conversion used by sign-in: absent fields take defaults.
    #[must_use]
    pub fn into_bundle(self) -> PersistedBundle {
        PersistedBundle {
            user: self.user.unwrap_or_default(),
            history: self.history.unwrap_or_default(),
            chat_history: self.chat_history.unwrap_or_default(),
            is_cloud_enabled: self.is_cloud_enabled.unwrap_or(true),
            saved_at: self.saved_at,
        }
        .normalized()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPointer {
    pub email: String,
}

/// In-memory application state owned by the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppState {
    pub profile: UserProfile,
    pub current_analysis: Option<Receipt>,
    pub history: Vec<Receipt>,
    pub is_loading: bool,
    pub error: Option<String>,
    pub chat_history: Vec<ChatMessage>,
    pub is_cloud_enabled: bool,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            profile: UserProfile::default(),
            current_analysis: None,
            history: Vec::new(),
            is_loading: false,
            error: None,
            chat_history: Vec::new(),
            is_cloud_enabled: true,
        }
    }
}

impl AppState {
    #[must_use]
    pub fn from_bundle(bundle: PersistedBundle) -> Self {
        let bundle = bundle.normalized();
        Self {
            profile: bundle.user,
            history: bundle.history,
            chat_history: bundle.chat_history,
            is_cloud_enabled: bundle.is_cloud_enabled,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn to_bundle(&self) -> PersistedBundle {
        PersistedBundle {
            user: self.profile.clone(),
            history: self.history.clone(),
            chat_history: self.chat_history.clone(),
            is_cloud_enabled: self.is_cloud_enabled,
            saved_at: None,
        }
    }

    /// Overwrite exactly the fields the remote document carries. A remote
    /// profile without an email keeps the current identity.
    pub fn merge_remote(&mut self, remote: RemoteBundle) {
        if let Some(user) = remote.user {
            let mut user = user.normalized();
            if !user.has_identity() {
                user.email = std::mem::take(&mut self.profile.email);
            }
            self.profile = user;
        }
        if let Some(history) = remote.history {
            let categories = self.profile.custom_categories.clone();
            self.history = history
                .into_iter()
                .map(|r| r.normalized(&categories))
                .collect();
            cap_history(&mut self.history);
        }
        if let Some(mut chat) = remote.chat_history {
            cap_chat(&mut chat);
            self.chat_history = chat;
        }
        if let Some(enabled) = remote.is_cloud_enabled {
            self.is_cloud_enabled = enabled;
        }
    }
}

pub fn cap_history(history: &mut Vec<Receipt>) {
    history.truncate(HISTORY_CAP);
}

pub fn cap_chat(chat: &mut Vec<ChatMessage>) {
    if chat.len() > CHAT_CAP {
        let excess = chat.len() - CHAT_CAP;
        chat.drain(..excess);
    }
}

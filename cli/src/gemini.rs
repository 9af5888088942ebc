use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use tracing::debug;

use basket_core::extract::{
    Coach, ReceiptExtractor, Upload, extracted_to_receipt, parse_model_output,
};
use basket_core::insights::month_to_date;
use basket_core::models::{ChatMessage, ChatRole, Receipt, UserProfile};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Receipts summarized into the coach's context.
const COACH_CONTEXT_RECEIPTS: usize = 10;

// --- Wire types ---

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum Part {
    Text(String),
    InlineData(InlineData),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl Content {
    fn text(role: Option<&'static str>, text: String) -> Self {
        Self {
            role,
            parts: vec![Part::Text(text)],
        }
    }
}

/// Concatenated text of the first candidate.
fn candidate_text(response: GenerateResponse) -> Option<String> {
    let text: String = response
        .candidates
        .into_iter()
        .next()?
        .content?
        .parts
        .into_iter()
        .filter_map(|p| p.text)
        .collect();
    (!text.trim().is_empty()).then_some(text)
}

// --- Prompts ---

fn extraction_prompt(profile: &UserProfile) -> String {
    let categories = profile.categories().join(", ");
    let mut prompt = String::from(
        "You read grocery receipts. Extract every purchased line item from the attached receipt \
         and reply with JSON only, using exactly these keys:\n\
         {\"store_name\": string, \"date\": \"YYYY-MM-DD\", \"time\": \"HH:MM\" or null, \
         \"total_spent\": number, \"total_saved\": number, \
         \"scan_quality\": \"high\" | \"medium\" | \"low\", \
         \"items\": [{\"raw_name\": string, \"name\": string, \"category\": string, \
         \"quantity\": number, \"unit_price\": number, \"total_price\": number, \
         \"is_discounted\": boolean, \"tags\": [string]}], \
         \"analysis\": {\"budget_impact_pct\": number, \"diet_compliant\": boolean, \
         \"flagged_items\": [string], \"insights\": string}, \
         \"coach_message\": string}\n",
    );
    let _ = writeln!(
        prompt,
        "raw_name is the text exactly as printed; name is a readable product name."
    );
    let _ = writeln!(prompt, "category must be one of: {categories}.");
    let _ = writeln!(
        prompt,
        "The shopper's dietary regime is '{}'. Flag items that conflict with it.",
        profile.dietary_regime
    );
    let _ = writeln!(
        prompt,
        "Monthly grocery budget: {:.2}. Already spent this month: {:.2}.",
        profile.monthly_budget, profile.current_spend
    );
    if !profile.family_context.trim().is_empty() {
        let _ = writeln!(prompt, "Household: {}.", profile.family_context.trim());
    }
    if !profile.goals.trim().is_empty() {
        let _ = writeln!(prompt, "Goals: {}.", profile.goals.trim());
    }
    let _ = writeln!(
        prompt,
        "If the image is not a receipt or is unreadable, reply with {{\"items\": []}}."
    );
    prompt
}

fn coach_instruction(profile: &UserProfile, history: &[Receipt]) -> String {
    let today = Local::now().date_naive();
    let mtd = month_to_date(history, profile, today);
    let mut text = String::from(
        "You are a friendly, practical grocery budget coach. Answer briefly and concretely, \
         using the shopper's own receipts when relevant.\n",
    );
    if !profile.name.trim().is_empty() {
        let _ = writeln!(text, "Shopper: {}.", profile.name.trim());
    }
    let _ = writeln!(
        text,
        "Dietary regime: {}. Monthly budget: {:.2}. Spent in {}: {:.2} across {} receipts, \
         projected month total {:.2}.",
        profile.dietary_regime,
        mtd.budget,
        mtd.month,
        mtd.spent,
        mtd.receipt_count,
        mtd.projected_total
    );
    if !profile.family_context.trim().is_empty() {
        let _ = writeln!(text, "Household: {}.", profile.family_context.trim());
    }
    if !profile.goals.trim().is_empty() {
        let _ = writeln!(text, "Goals: {}.", profile.goals.trim());
    }
    if !history.is_empty() {
        let _ = writeln!(text, "Recent receipts (newest first):");
        for receipt in history.iter().take(COACH_CONTEXT_RECEIPTS) {
            let _ = write!(
                text,
                "- {} {} total {:.2}",
                receipt.metadata.date, receipt.metadata.store_name, receipt.metadata.total_spent
            );
            if !receipt.analysis.flagged_items.is_empty() {
                let _ = write!(text, " (flagged: {})", receipt.analysis.flagged_items.join(", "));
            }
            text.push('\n');
        }
    }
    text
}

fn chat_contents(chat: &[ChatMessage]) -> Vec<Content> {
    chat.iter()
        .map(|m| {
            let role = match m.role {
                ChatRole::User => "user",
                ChatRole::Model => "model",
            };
            Content::text(Some(role), m.text.clone())
        })
        .collect()
}

// --- Client ---

pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String, model: String) -> Result<Self> {
        Self::with_base_url(api_key, model, API_BASE)
    }

    fn with_base_url(api_key: String, model: String, base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(format!("basket-cli/{}", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(90))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .context("Failed to reach the Gemini API")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Gemini API returned {status}: {}", body.trim());
        }
        let data: GenerateResponse = resp
            .json()
            .await
            .context("Failed to parse Gemini response")?;
        candidate_text(data).context("Gemini returned no text")
    }
}

#[async_trait]
impl ReceiptExtractor for GeminiClient {
    async fn extract(&self, upload: &Upload, profile: &UserProfile) -> Result<Receipt> {
        debug!(file = %upload.file_name, bytes = upload.bytes.len(), "extracting receipt");
        let request = GenerateRequest {
            contents: vec![Content {
                role: Some("user"),
                parts: vec![
                    Part::Text(extraction_prompt(profile)),
                    Part::InlineData(InlineData {
                        mime_type: upload.mime_type.clone(),
                        data: STANDARD.encode(&upload.bytes),
                    }),
                ],
            }],
            system_instruction: None,
            generation_config: GenerationConfig {
                temperature: 0.1,
                response_mime_type: Some("application/json"),
            },
        };
        let text = self.generate(&request).await?;
        let extracted = parse_model_output(&text)?;
        extracted_to_receipt(extracted)
            .with_context(|| format!("No receipt could be read from {}", upload.file_name))
    }
}

#[async_trait]
impl Coach for GeminiClient {
    async fn reply(
        &self,
        profile: &UserProfile,
        history: &[Receipt],
        chat: &[ChatMessage],
    ) -> Result<String> {
        let request = GenerateRequest {
            contents: chat_contents(chat),
            system_instruction: Some(Content::text(None, coach_instruction(profile, history))),
            generation_config: GenerationConfig {
                temperature: 0.7,
                response_mime_type: None,
            },
        };
        let text = self.generate(&request).await?;
        Ok(text.trim().to_string())
    }
}

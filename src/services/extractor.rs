//! LLM extraction of structured order data from card text
//!
//! The extractor is treated as a pure function with failure: card name and
//! description in, structured fields and line items out. The underlying LLM
//! client is constructed once at startup and shared; individual extractions
//! borrow it.
//!
//! Two passes per card: line-item extraction, then a classification pass
//! that assigns business line, material, and dimensions. A failed
//! classification pass degrades to unclassified items rather than failing
//! the extraction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

use crate::config::ExtractorSettings;
use crate::models::card::parse_title_fields;
use crate::models::line_item::{derive_prices, BusinessLine, PriceKind};
use crate::models::{LineItemRow, SourceCard};
use crate::services::classifier::normalize_description;

const EXTRACT_SYSTEM_PROMPT: &str = r#"Extract line items from signage orders. For each card return JSON:
{"card_id":"...", "items":[{"qty":1, "price":100.00, "price_type":"total", "desc":"item description"}], "buyer_name":"...", "buyer_email":"..."}

price_type: "per_unit" if price has "ea"/"each", otherwise "total".
Return JSON array, one object per card."#;

const CLASSIFY_SYSTEM_PROMPT: &str = r#"Classify line items from a signage company.

For each line item, determine:

1. **business_line** - Choose ONE:
   - "Signage" - Signs, banners, decals, vehicle wraps, channel letters, pylons, ACP panels, coroplast, building signage, vinyl graphics
   - "Printing" - Business cards, flyers, brochures, booklets, invoices, forms, apparel printing, promotional items, labels
   - "Engraving" - Engraved plaques, nameplates, trophies, awards, laser-cut items, etched materials

2. **material** - Extract the material (e.g., "Aluminum", "Acrylic", "Vinyl", "Coroplast", "14PT Coated", "ACP", "Foamcore") or null

3. **dimensions** - Extract dimensions as string (e.g., "36x24", "3.5x2", "96x48") or null

Return JSON array matching input order:
[{"business_line": "Signage", "material": "Vinyl", "dimensions": "36x24"}, ...]"#;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extraction request failed: {0}")]
    Request(String),

    #[error("extraction timed out after {0}s")]
    Timeout(u64),

    #[error("extractor returned unusable output: {0}")]
    BadOutput(String),
}

/// Structured fields extracted for the card itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CardFields {
    pub purchaser: Option<String>,
    pub order_summary: Option<String>,
    pub primary_buyer_name: Option<String>,
    pub primary_buyer_email: Option<String>,
}

/// Full extraction result for one card.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub card_fields: CardFields,
    pub line_items: Vec<LineItemRow>,
}

/// Seam the dispatcher extracts through.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, card: &SourceCard) -> Result<Extraction, ExtractError>;
}

// ---------------------------------------------------------------------------
// LLM wire types (generateContent-style JSON API)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Content,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

/// First-pass output, parsed leniently: the model occasionally returns
/// numbers as strings and vice versa.
#[derive(Debug, Deserialize)]
struct RawCardExtraction {
    #[serde(default)]
    card_id: Option<String>,
    #[serde(default)]
    items: Vec<RawItem>,
    #[serde(default)]
    buyer_name: Option<String>,
    #[serde(default)]
    buyer_email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    #[serde(default)]
    qty: Option<serde_json::Value>,
    #[serde(default)]
    price: Option<serde_json::Value>,
    #[serde(default)]
    price_type: Option<String>,
    #[serde(default)]
    desc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawClassification {
    #[serde(default)]
    business_line: Option<String>,
    #[serde(default)]
    material: Option<String>,
    #[serde(default)]
    dimensions: Option<String>,
}

fn coerce_i64(value: Option<&serde_json::Value>, default: i64) -> i64 {
    match value {
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(default),
        Some(serde_json::Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

fn coerce_f64(value: Option<&serde_json::Value>) -> Option<f64> {
    match value {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().trim_start_matches('$').parse().ok(),
        _ => None,
    }
}

/// Strip markdown code fences the model sometimes wraps JSON in.
fn strip_code_fences(text: &str) -> String {
    if !text.trim_start().starts_with("```") {
        return text.trim().to_string();
    }
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Truncate input on a char boundary.
fn truncate_input(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Extractor backed by a hosted LLM.
pub struct LlmExtractor {
    http: reqwest::Client,
    api_base: String,
    api_key: String,
    model_id: String,
    timeout_s: u64,
    max_input_length: usize,
}

impl LlmExtractor {
    pub fn new(settings: &ExtractorSettings) -> Result<Self, ExtractError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_s))
            .build()
            .map_err(|e| ExtractError::Request(e.to_string()))?;
        tracing::info!(model = %settings.model_id, "Initialized extraction client");
        Ok(Self {
            http,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            model_id: settings.model_id.clone(),
            timeout_s: settings.timeout_s,
            max_input_length: settings.max_input_length,
        })
    }

    async fn generate(&self, system_prompt: &str, prompt: &str) -> Result<String, ExtractError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.api_base, self.model_id
        );
        let body = json!({
            "system_instruction": {"parts": [{"text": system_prompt}]},
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": 0.1,
                "responseMimeType": "application/json"
            }
        });

        let response = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExtractError::Timeout(self.timeout_s)
                } else {
                    ExtractError::Request(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractError::Request(format!("status {status}: {body}")));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ExtractError::BadOutput(e.to_string()))?;
        let text = parsed
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| ExtractError::BadOutput("empty response".to_string()))?;
        Ok(strip_code_fences(&text))
    }

    async fn extract_items(
        &self,
        card: &SourceCard,
        desc: &str,
    ) -> Result<RawCardExtraction, ExtractError> {
        let card_input = json!({
            "id": card.id,
            "name": card.name.as_deref().unwrap_or(""),
            "desc": truncate_input(desc, self.max_input_length),
        });
        let prompt = format!("Cards:\n{}\n\nReturn JSON array.", json!([card_input]));

        let text = self.generate(EXTRACT_SYSTEM_PROMPT, &prompt).await?;
        let mut results = parse_one_or_many(&text)?;

        // Prefer the entry matching this card id
        if let Some(idx) = results
            .iter()
            .position(|r| r.card_id.as_deref() == Some(card.id.as_str()))
        {
            return Ok(results.swap_remove(idx));
        }
        results
            .into_iter()
            .next()
            .ok_or_else(|| ExtractError::BadOutput("empty result array".to_string()))
    }

    async fn classify_items(&self, items: &mut [LineItemRow]) {
        if items.is_empty() {
            return;
        }
        let input: Vec<serde_json::Value> = items
            .iter()
            .map(|item| {
                json!({
                    "description": truncate_input(item.description.as_deref().unwrap_or(""), 200),
                    "quantity": item.quantity,
                    "revenue": item.total_revenue.unwrap_or(0.0),
                })
            })
            .collect();
        let prompt = format!(
            "Classify these {} line items:\n\n{}\n\nReturn JSON array with business_line, material, dimensions for each (same order as input).",
            input.len(),
            json!(input)
        );

        let classifications: Vec<RawClassification> = match self
            .generate(CLASSIFY_SYSTEM_PROMPT, &prompt)
            .await
            .and_then(|text| {
                serde_json::from_str(&text)
                    .map_err(|e| ExtractError::BadOutput(format!("{e}: {text}")))
            }) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "Line-item classification failed; leaving items unclassified");
                return;
            }
        };

        for (item, classification) in items.iter_mut().zip(classifications) {
            item.business_line = classification
                .business_line
                .as_deref()
                .and_then(BusinessLine::parse);
            item.material = classification.material;
            item.dimensions = classification.dimensions;
        }
    }
}

fn parse_one_or_many(text: &str) -> Result<Vec<RawCardExtraction>, ExtractError> {
    if let Ok(many) = serde_json::from_str::<Vec<RawCardExtraction>>(text) {
        return Ok(many);
    }
    serde_json::from_str::<RawCardExtraction>(text)
        .map(|one| vec![one])
        .map_err(|e| ExtractError::BadOutput(format!("{e}: {text}")))
}

fn items_from_raw(raw: &RawCardExtraction) -> Vec<LineItemRow> {
    raw.items
        .iter()
        .enumerate()
        .map(|(idx, item)| {
            let quantity = coerce_i64(item.qty.as_ref(), 1);
            let raw_price = coerce_f64(item.price.as_ref());
            let kind = item
                .price_type
                .as_deref()
                .map(PriceKind::parse)
                .unwrap_or(PriceKind::Total);
            let prices = derive_prices(raw_price, quantity, kind);
            LineItemRow {
                line_index: (idx + 1) as i64,
                quantity,
                raw_price,
                price_kind: kind,
                unit_price: prices.unit_price,
                total_revenue: prices.total_revenue,
                description: item.desc.clone(),
                business_line: None,
                material: None,
                dimensions: None,
            }
        })
        .collect()
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract(&self, card: &SourceCard) -> Result<Extraction, ExtractError> {
        let (purchaser, order_summary) = match card.name.as_deref() {
            Some(name) => parse_title_fields(name),
            None => (None, None),
        };

        // Empty description: nothing to extract, and not an error
        let desc = normalize_description(card.desc.as_deref());
        if desc.is_empty() {
            return Ok(Extraction {
                card_fields: CardFields {
                    purchaser,
                    order_summary,
                    ..CardFields::default()
                },
                line_items: Vec::new(),
            });
        }

        let raw = self.extract_items(card, &desc).await?;
        let mut line_items = items_from_raw(&raw);
        self.classify_items(&mut line_items).await;

        tracing::debug!(
            card_id = %card.id,
            line_items = line_items.len(),
            "Extraction completed"
        );

        Ok(Extraction {
            card_fields: CardFields {
                purchaser,
                order_summary,
                primary_buyer_name: raw.buyer_name.clone(),
                primary_buyer_email: raw.buyer_email.clone(),
            },
            line_items,
        })
    }
}

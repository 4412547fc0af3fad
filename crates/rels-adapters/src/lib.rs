//! Retrieval + reasoning service boundaries, raw record mapping and payload
//! normalization.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use rels_core::{CandidateListing, QueryParameters};
use rels_storage::{BackoffPolicy, FetchError, JsonHttpClient};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

pub mod normalize;

pub use normalize::{NormalizeDefect, Normalized, Payload, ResponseNormalizer, DEFAULT_WRAPPER_KEYS};

pub const CRATE_NAME: &str = "rels-adapters";

pub const DEFAULT_APIFY_BASE_URL: &str = "https://api.apify.com";
pub const DEFAULT_ACTOR_ID: &str = "l7auNT3I30CssRrvO";
pub const DEFAULT_SITE_BASE: &str = "https://www.zillow.com";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("listing source request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("listing source reported an error: {0}")]
    Upstream(String),
    #[error("listing source returned an unexpected payload: {0}")]
    UnexpectedShape(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// External listing retrieval service.
///
/// An empty result is a valid answer; `Err` is the explicit error indicator
/// that makes a call eligible for the pipeline's single retry.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Base URL relative detail links are resolved against.
    fn site_base(&self) -> &str {
        DEFAULT_SITE_BASE
    }

    async fn fetch_listings(&self, params: &QueryParameters) -> Result<Vec<JsonValue>, RetrievalError>;
}

/// Runs the zip-code search actor synchronously and reads its dataset items.
#[derive(Debug, Clone)]
pub struct ApifyActorSource {
    http: JsonHttpClient,
    base_url: String,
    actor_id: String,
    token: String,
}

impl ApifyActorSource {
    pub fn new(
        http: JsonHttpClient,
        base_url: impl Into<String>,
        actor_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            http: http.with_backoff(BackoffPolicy::no_retries()),
            base_url: base_url.into(),
            actor_id: actor_id.into(),
            token: token.into(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!(
            "{}/v2/acts/{}/run-sync-get-dataset-items?token={}",
            self.base_url.trim_end_matches('/'),
            self.actor_id,
            self.token
        )
    }
}

#[async_trait]
impl ListingSource for ApifyActorSource {
    fn source_id(&self) -> &'static str {
        "apify-zip-search"
    }

    async fn fetch_listings(&self, params: &QueryParameters) -> Result<Vec<JsonValue>, RetrievalError> {
        let resp = self.http.post_json(&self.endpoint(), None, params).await?;
        let body: JsonValue = serde_json::from_slice(&resp.body)
            .map_err(|e| RetrievalError::UnexpectedShape(format!("dataset items are not JSON: {e}")))?;
        let items = dataset_items(body)?;
        info!(source = self.source_id(), count = items.len(), "fetched listings");
        Ok(items)
    }
}

fn dataset_items(body: JsonValue) -> Result<Vec<JsonValue>, RetrievalError> {
    match body {
        JsonValue::Array(items) => Ok(items),
        JsonValue::Object(obj) => {
            if let Some(err) = obj.get("error") {
                let message = json_str(err, &["message"])
                    .map(ToString::to_string)
                    .unwrap_or_else(|| err.to_string());
                return Err(RetrievalError::Upstream(message));
            }
            match obj.get("items") {
                Some(JsonValue::Array(items)) => Ok(items.clone()),
                _ => Err(RetrievalError::UnexpectedShape(format!(
                    "object with keys {:?}",
                    obj.keys().collect::<Vec<_>>()
                ))),
            }
        }
        other => Err(RetrievalError::UnexpectedShape(format!("{other}"))),
    }
}

/// Serves a recorded retrieval payload from disk, for offline runs.
#[derive(Debug, Clone)]
pub struct FixtureListingSource {
    path: PathBuf,
    normalizer: ResponseNormalizer,
}

impl FixtureListingSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            normalizer: ResponseNormalizer::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ListingSource for FixtureListingSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn fetch_listings(&self, params: &QueryParameters) -> Result<Vec<JsonValue>, RetrievalError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading listing fixture {}", self.path.display()))?;
        let value: JsonValue = serde_json::from_str(&text)
            .map_err(|e| RetrievalError::UnexpectedShape(format!("{}: {e}", self.path.display())))?;
        let (records, _defects) = self.normalizer.extract_records(Payload::Structured(value));
        debug!(zip_codes = ?params.zip_codes, count = records.len(), "served fixture listings");
        Ok(records)
    }
}

/// Map raw retrieval records onto candidate listings, in order.
pub fn candidates_from_raw(records: &[JsonValue], site_base: &str) -> Vec<CandidateListing> {
    records
        .iter()
        .enumerate()
        .map(|(idx, raw)| map_raw_listing(idx, raw, site_base))
        .collect()
}

pub fn map_raw_listing(index: usize, raw: &JsonValue, site_base: &str) -> CandidateListing {
    let first_unit = raw.get("units").and_then(|u| u.as_array()).and_then(|u| u.first());

    let id = json_scalar_string(raw, &["id"])
        .or_else(|| json_scalar_string(raw, &["zpid"]))
        .unwrap_or_else(|| format!("listing-{index}"));

    let detail_url = json_str(raw, &["detailUrl"])
        .or_else(|| json_str(raw, &["url"]))
        .map(|u| absolutize_url(u, site_base));

    let img_src = json_str(raw, &["imgSrc"])
        .filter(|s| !s.trim().is_empty())
        .map(ToString::to_string);

    let price = json_str(raw, &["price"])
        .map(ToString::to_string)
        .or_else(|| json_f64(raw, &["price"]).map(format_usd))
        .or_else(|| json_f64(raw, &["unformattedPrice"]).map(format_usd))
        .or_else(|| first_unit.and_then(|u| json_str(u, &["price"])).map(ToString::to_string));

    let address = json_str(raw, &["address"])
        .map(ToString::to_string)
        .or_else(|| compose_address(raw));

    let bedrooms = json_count(raw, &["bedrooms"])
        .or_else(|| json_count(raw, &["beds"]))
        .or_else(|| first_unit.and_then(|u| json_count(u, &["beds"])));

    let bathrooms = json_number(raw, &["bathrooms"]).or_else(|| json_number(raw, &["baths"]));

    let home_type = json_str(raw, &["homeType"])
        .or_else(|| json_str(raw, &["hdpData", "homeInfo", "homeType"]))
        .map(ToString::to_string);

    let area = json_number(raw, &["area"])
        .or_else(|| json_number(raw, &["livingArea"]))
        .or_else(|| json_number(raw, &["hdpData", "homeInfo", "livingArea"]));

    CandidateListing {
        id,
        detail_url,
        img_src,
        price,
        address,
        bedrooms,
        bathrooms,
        home_type,
        area,
        raw: raw.clone(),
    }
}

fn compose_address(raw: &JsonValue) -> Option<String> {
    let street = json_str(raw, &["addressStreet"])?;
    let mut out = street.trim().to_string();
    let city = json_str(raw, &["addressCity"]);
    let state = json_str(raw, &["addressState"]);
    let zip = json_str(raw, &["addressZipcode"]);
    if let Some(city) = city {
        out.push_str(", ");
        out.push_str(city.trim());
    }
    let tail = [state, zip]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if !tail.is_empty() {
        out.push_str(", ");
        out.push_str(&tail);
    }
    Some(out)
}

fn absolutize_url(url: &str, site_base: &str) -> String {
    if url.starts_with('/') {
        format!("{}{}", site_base.trim_end_matches('/'), url)
    } else {
        url.to_string()
    }
}

/// `1985.0` → `$1,985`.
pub fn format_usd(amount: f64) -> String {
    let whole = amount.round().max(0.0) as u64;
    let digits = whole.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    format!("${out}")
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    json_at(value, path)?.as_f64()
}

fn json_scalar_string(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numbers, or numeric strings such as `"1.5"`.
fn json_number(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let v = match json_at(value, path)? {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().replace(',', "").parse::<f64>().ok()?,
        _ => return None,
    };
    (v.is_finite() && v >= 0.0).then_some(v)
}

fn json_count(value: &JsonValue, path: &[&str]) -> Option<u32> {
    let v = json_number(value, path)?;
    (v.fract() == 0.0 && v <= f64::from(u32::MAX)).then_some(v as u32)
}

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("reasoning request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("reasoning response malformed: {0}")]
    Malformed(String),
    #[error("reasoning response had no content")]
    EmptyContent,
}

/// External text-generation service asked for JSON answers.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    fn model(&self) -> &str;

    async fn complete_json(&self, system: &str, user: &str) -> Result<String, ReasoningError>;
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    ty: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

/// OpenAI-compatible chat-completions client in JSON-object mode. Makes a
/// single HTTP attempt per call.
#[derive(Debug, Clone)]
pub struct OpenAiChatClient {
    http: JsonHttpClient,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiChatClient {
    pub fn new(
        http: JsonHttpClient,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            http: http.with_backoff(BackoffPolicy::no_retries()),
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl ReasoningClient for OpenAiChatClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete_json(&self, system: &str, user: &str) -> Result<String, ReasoningError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user.to_string(),
                },
            ],
            temperature: 0.0,
            response_format: ResponseFormat { ty: "json_object" },
        };
        let resp = self
            .http
            .post_json(&self.endpoint(), Some(self.api_key.as_str()), &body)
            .await?;
        let chat: ChatResponse = serde_json::from_slice(&resp.body)
            .map_err(|e| ReasoningError::Malformed(e.to_string()))?;
        extract_chat_content(chat)
    }
}

fn extract_chat_content(chat: ChatResponse) -> Result<String, ReasoningError> {
    chat.choices
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or(ReasoningError::EmptyContent)
}

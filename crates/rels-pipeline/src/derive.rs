//! Free-text request to retrieval query parameters.

use std::sync::Arc;

use async_trait::async_trait;
use rels_adapters::normalize::parse_lenient;
use rels_adapters::{ReasoningClient, ReasoningError};
use rels_core::{QueryParameters, SchemaError, MAX_ZIP_CODES};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cues::{self, Words};

const RENT_CUES: &[&str] = &[
    "rent", "rental", "rentals", "renting", "lease", "leasing", "month", "monthly",
];
const BUY_CUES: &[&str] = &["buy", "buying", "purchase", "purchasing", "sale"];
const SOLD_CUES: &[&str] = &["sold"];

const DERIVE_INSTRUCTIONS: &str = "You convert real-estate search requests into query parameters \
for a zip-code based listing search. Reply with one JSON object and nothing else, shaped as \
{\"zipCodes\": [string], \"forRent\": bool, \"forSaleByAgent\": bool, \"forSaleByOwner\": bool, \
\"sold\": bool, \"priceMin\": number|null, \"priceMax\": number|null}. \
zipCodes must hold 1 to 3 five-digit US zip codes: use codes written in the request verbatim, \
otherwise choose the most relevant zip codes for the city or neighbourhood named. \
Set forRent for rentals, leases, monthly prices or apartments; set forSaleByAgent and \
forSaleByOwner when the user wants to buy; set sold only for sold homes. \
priceMin and priceMax are whole dollars taken from budget phrases, or null.";

#[derive(Debug, Error)]
pub enum DerivationError {
    #[error("request names no zip code or recognisable location")]
    NoLocation,
    #[error(transparent)]
    Reasoning(#[from] ReasoningError),
    #[error("derived parameters have the wrong shape: {0}")]
    Shape(String),
    #[error("derived parameters are invalid: {0}")]
    Invalid(#[from] SchemaError),
}

#[async_trait]
pub trait SearchParameterDeriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn derive(&self, request: &str) -> Result<QueryParameters, DerivationError>;
}

/// Keyword signals read directly from the request text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestCues {
    pub zip_codes: Vec<String>,
    pub for_rent: bool,
    pub for_sale: bool,
    pub sold: bool,
    pub price_min: Option<u64>,
    pub price_max: Option<u64>,
}

impl RequestCues {
    pub fn scan(request: &str) -> Self {
        let words = Words::new(request);
        let buy = words.contains_any(BUY_CUES);
        let sold = words.contains_any(SOLD_CUES);
        let rent_cue = words.contains_any(RENT_CUES)
            || words.as_slice().iter().any(|w| w.contains("/mo"))
            || (!buy && words.contains_prefix(&["apartment", "apt"]));
        let bounds = cues::price_bounds(&words);

        Self {
            zip_codes: cues::zip_codes(request, MAX_ZIP_CODES),
            for_rent: rent_cue,
            for_sale: buy,
            sold,
            price_min: bounds.min.map(whole_dollars),
            price_max: bounds.max.map(whole_dollars),
        }
    }

    fn query_for(&self, zip_codes: Vec<String>) -> Result<QueryParameters, SchemaError> {
        let mut params = QueryParameters::for_zip_codes(zip_codes)?;
        params.for_rent = self.for_rent;
        params.for_sale_by_agent = self.for_sale;
        params.for_sale_by_owner = self.for_sale;
        params.sold = self.sold;
        params.price_min = self.price_min;
        params.price_max = self.price_max;
        params.validate()?;
        Ok(params)
    }
}

fn whole_dollars(amount: f64) -> u64 {
    amount.round().max(0.0) as u64
}

/// Deterministic deriver for offline runs. Needs an explicit zip code.
#[derive(Debug, Clone, Default)]
pub struct KeywordParameterDeriver;

#[async_trait]
impl SearchParameterDeriver for KeywordParameterDeriver {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn derive(&self, request: &str) -> Result<QueryParameters, DerivationError> {
        let cues = RequestCues::scan(request);
        if cues.zip_codes.is_empty() {
            return Err(DerivationError::NoLocation);
        }
        let params = cues.query_for(cues.zip_codes.clone())?;
        debug!(?params, "derived query parameters from keywords");
        Ok(params)
    }
}

/// Asks the reasoning service for parameters; explicit zip codes in the text
/// short-circuit the call and always win over model-supplied ones.
#[derive(Clone)]
pub struct ReasoningParameterDeriver {
    client: Arc<dyn ReasoningClient>,
}

impl ReasoningParameterDeriver {
    pub fn new(client: Arc<dyn ReasoningClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SearchParameterDeriver for ReasoningParameterDeriver {
    fn name(&self) -> &'static str {
        "reasoning"
    }

    async fn derive(&self, request: &str) -> Result<QueryParameters, DerivationError> {
        let cues = RequestCues::scan(request);
        if !cues.zip_codes.is_empty() {
            debug!(zip_codes = ?cues.zip_codes, "explicit zip codes; skipping reasoning call");
            return Ok(cues.query_for(cues.zip_codes.clone())?);
        }

        info!(model = self.client.model(), "asking reasoning service for query parameters");
        let text = self
            .client
            .complete_json(DERIVE_INSTRUCTIONS, &format!("Request: {request}"))
            .await?;
        let params = parse_reasoned_parameters(&text)?;
        Ok(merge_with_cues(params, &cues)?)
    }
}

/// Parse the reasoning reply into parameters. Zip lists longer than the
/// retrieval limit are cut to the first three.
pub fn parse_reasoned_parameters(text: &str) -> Result<QueryParameters, DerivationError> {
    let value = parse_lenient(text).map_err(|e| DerivationError::Shape(e.to_string()))?;
    let mut value = match value {
        JsonValue::Object(mut obj) if !obj.contains_key("zipCodes") => {
            match ["queryParameters", "parameters", "input"]
                .iter()
                .find_map(|k| obj.remove(*k))
            {
                Some(inner) => inner,
                None => JsonValue::Object(obj),
            }
        }
        other => other,
    };
    let Some(obj) = value.as_object_mut() else {
        return Err(DerivationError::Shape("expected a JSON object".into()));
    };
    for key in ["priceMin", "priceMax"] {
        if let Some(amount) = obj.get(key).and_then(JsonValue::as_f64) {
            obj.insert(key.to_string(), JsonValue::from(whole_dollars(amount)));
        }
    }
    let mut params: QueryParameters =
        serde_json::from_value(value).map_err(|e| DerivationError::Shape(e.to_string()))?;

    params.zip_codes.retain(|z| !z.trim().is_empty());
    if params.zip_codes.is_empty() {
        return Err(DerivationError::NoLocation);
    }
    if params.zip_codes.len() > MAX_ZIP_CODES {
        warn!(count = params.zip_codes.len(), "reasoning returned too many zip codes; keeping the first three");
        params.zip_codes.truncate(MAX_ZIP_CODES);
    }
    Ok(params)
}

fn merge_with_cues(mut params: QueryParameters, cues: &RequestCues) -> Result<QueryParameters, SchemaError> {
    if params.price_min.is_none() {
        params.price_min = cues.price_min;
    }
    if params.price_max.is_none() {
        params.price_max = cues.price_max;
    }
    if !(params.for_rent || params.for_sale_by_agent || params.for_sale_by_owner || params.sold) {
        params.for_rent = cues.for_rent;
        params.for_sale_by_agent = cues.for_sale;
        params.for_sale_by_owner = cues.for_sale;
        params.sold = cues.sold;
    }
    params.validate()?;
    Ok(params)
}

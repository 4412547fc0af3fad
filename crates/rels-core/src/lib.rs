//! Core listing schema, search request and query parameter types for RELS.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "rels-core";

/// Upper bound on zip codes carried by one query.
pub const MAX_ZIP_CODES: usize = 3;

/// Run slot holding the listing output or the error record.
pub const OUTPUT_KEY: &str = "OUTPUT";
pub const INPUT_KEY: &str = "INPUT";
pub const USAGE_KEY: &str = "USAGE";
pub const REPORT_KEY: &str = "real_estate_report.html";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` must be {expected}")]
    WrongType {
        field: &'static str,
        expected: &'static str,
    },
    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),
    #[error("expected 1..={max} zip codes, got {count}", max = MAX_ZIP_CODES)]
    ZipCodeCount { count: usize },
    #[error("priceMin {min} exceeds priceMax {max}")]
    PriceBounds { min: u64, max: u64 },
}

/// One property in the final result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub id: String,
    pub detail_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_src: Option<String>,
    pub price: String,
    pub address: String,
    pub bedrooms: u32,
    pub bathrooms: f64,
    pub home_type: String,
    pub area: f64,
    #[serde(rename = "match_reason")]
    pub match_reason: String,
}

impl Listing {
    /// Validate an arbitrary JSON record against the listing schema.
    ///
    /// Numeric ids are accepted and rendered as strings since upstream
    /// sources commonly key records by integer.
    pub fn from_record(record: &JsonValue) -> Result<Self, SchemaError> {
        let obj = record.as_object().ok_or(SchemaError::NotAnObject)?;

        let id = match required(obj, "id")? {
            JsonValue::String(s) => s.trim().to_string(),
            JsonValue::Number(n) => n.to_string(),
            _ => {
                return Err(SchemaError::WrongType {
                    field: "id",
                    expected: "a string",
                })
            }
        };
        if id.is_empty() {
            return Err(SchemaError::EmptyField("id"));
        }

        let match_reason = required_str(obj, "match_reason")?.trim().to_string();
        if match_reason.is_empty() {
            return Err(SchemaError::EmptyField("match_reason"));
        }

        let img_src = match obj.get("imgSrc") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(s)) if s.trim().is_empty() => None,
            Some(JsonValue::String(s)) => Some(s.clone()),
            Some(_) => {
                return Err(SchemaError::WrongType {
                    field: "imgSrc",
                    expected: "a string",
                })
            }
        };

        Ok(Self {
            id,
            detail_url: required_str(obj, "detailUrl")?.to_string(),
            img_src,
            price: required_str(obj, "price")?.to_string(),
            address: required_str(obj, "address")?.to_string(),
            bedrooms: required_count(obj, "bedrooms")?,
            bathrooms: required_non_negative(obj, "bathrooms")?,
            home_type: required_str(obj, "homeType")?.to_string(),
            area: required_non_negative(obj, "area")?,
            match_reason,
        })
    }
}

fn required<'a>(obj: &'a Map<String, JsonValue>, field: &'static str) -> Result<&'a JsonValue, SchemaError> {
    match obj.get(field) {
        None | Some(JsonValue::Null) => Err(SchemaError::MissingField(field)),
        Some(v) => Ok(v),
    }
}

fn required_str<'a>(obj: &'a Map<String, JsonValue>, field: &'static str) -> Result<&'a str, SchemaError> {
    required(obj, field)?.as_str().ok_or(SchemaError::WrongType {
        field,
        expected: "a string",
    })
}

fn required_non_negative(obj: &Map<String, JsonValue>, field: &'static str) -> Result<f64, SchemaError> {
    let value = required(obj, field)?;
    match value.as_f64() {
        Some(v) if v.is_finite() && v >= 0.0 => Ok(v),
        _ => Err(SchemaError::WrongType {
            field,
            expected: "a non-negative number",
        }),
    }
}

fn required_count(obj: &Map<String, JsonValue>, field: &'static str) -> Result<u32, SchemaError> {
    let value = required_non_negative(obj, field)?;
    if value.fract() != 0.0 || value > f64::from(u32::MAX) {
        return Err(SchemaError::WrongType {
            field,
            expected: "a non-negative integer",
        });
    }
    Ok(value as u32)
}

/// The single output shape pushed on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ListingOutput {
    pub listings: Vec<Listing>,
}

/// Output pushed in place of [`ListingOutput`] when an invocation fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub error: String,
    pub kind: String,
}

/// JSON schema handed to the reasoning service describing [`ListingOutput`].
pub fn listing_output_schema() -> JsonValue {
    serde_json::json!({
        "type": "object",
        "properties": {
            "listings": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "string", "description": "Unique identifier for the listing" },
                        "imgSrc": { "type": "string" },
                        "detailUrl": { "type": "string", "description": "URL to the detailed listing page" },
                        "price": { "type": "string", "description": "Price formatted as string (e.g. '$1,985/mo')" },
                        "address": { "type": "string", "description": "Full address of the property" },
                        "bedrooms": { "type": "number", "description": "Number of bedrooms (0 for studio)" },
                        "bathrooms": { "type": "number", "description": "Number of bathrooms" },
                        "homeType": { "type": "string", "description": "Type of residence (e.g. 'APARTMENT', 'HOUSE')" },
                        "area": { "type": "number", "description": "Square footage of the property" },
                        "match_reason": { "type": "string", "description": "Explanation of why this listing matches search criteria" }
                    },
                    "required": ["id", "detailUrl", "price", "address", "bedrooms", "bathrooms", "homeType", "area", "match_reason"]
                }
            }
        },
        "required": ["listings"]
    })
}

/// Free-text search request plus optional reasoning-service credential.
///
/// Field names follow the input document accepted by the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    #[serde(rename = "realEstateRequest", alias = "request")]
    pub request: String,
    #[serde(
        rename = "OPENAI_API_KEY",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub api_key: Option<String>,
}

impl SearchRequest {
    pub fn new(request: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            request: request.into(),
            api_key,
        }
    }

    /// Reject requests whose text is empty after trimming.
    pub fn validated(self) -> Result<Self, SchemaError> {
        if self.request.trim().is_empty() {
            return Err(SchemaError::EmptyField("realEstateRequest"));
        }
        Ok(self)
    }

    /// The override credential, if one was supplied and is non-blank.
    pub fn credential_override(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    pub fn redacted(&self) -> Self {
        Self {
            request: self.request.clone(),
            api_key: self.credential_override().map(|_| "<redacted>".to_string()),
        }
    }
}

/// Structured query accepted by the listing retrieval source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryParameters {
    pub zip_codes: Vec<String>,
    #[serde(default)]
    pub for_rent: bool,
    #[serde(default)]
    pub for_sale_by_agent: bool,
    #[serde(default)]
    pub for_sale_by_owner: bool,
    #[serde(default)]
    pub sold: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_min: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price_max: Option<u64>,
}

impl QueryParameters {
    pub fn for_zip_codes(zip_codes: Vec<String>) -> Result<Self, SchemaError> {
        let params = Self {
            zip_codes,
            for_rent: false,
            for_sale_by_agent: false,
            for_sale_by_owner: false,
            sold: false,
            price_min: None,
            price_max: None,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        let count = self.zip_codes.len();
        if count == 0 || count > MAX_ZIP_CODES {
            return Err(SchemaError::ZipCodeCount { count });
        }
        if self.zip_codes.iter().any(|z| z.trim().is_empty()) {
            return Err(SchemaError::EmptyField("zipCodes"));
        }
        if let (Some(min), Some(max)) = (self.price_min, self.price_max) {
            if min > max {
                return Err(SchemaError::PriceBounds { min, max });
            }
        }
        Ok(())
    }
}

/// A retrieved record mapped onto listing fields, before filtering.
///
/// `raw` keeps the upstream record for keyword matching and for forwarding
/// to the reasoning service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateListing {
    pub id: String,
    pub detail_url: Option<String>,
    pub img_src: Option<String>,
    pub price: Option<String>,
    pub address: Option<String>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<f64>,
    pub home_type: Option<String>,
    pub area: Option<f64>,
    pub raw: JsonValue,
}

impl CandidateListing {
    /// Listing-shaped JSON record carrying `match_reason`. Unknown fields are
    /// omitted so schema validation decides whether the record survives.
    pub fn to_record(&self, match_reason: &str) -> JsonValue {
        let mut obj = Map::new();
        obj.insert("id".into(), JsonValue::String(self.id.clone()));
        if let Some(v) = &self.detail_url {
            obj.insert("detailUrl".into(), JsonValue::String(v.clone()));
        }
        if let Some(v) = &self.img_src {
            obj.insert("imgSrc".into(), JsonValue::String(v.clone()));
        }
        if let Some(v) = &self.price {
            obj.insert("price".into(), JsonValue::String(v.clone()));
        }
        if let Some(v) = &self.address {
            obj.insert("address".into(), JsonValue::String(v.clone()));
        }
        if let Some(v) = self.bedrooms {
            obj.insert("bedrooms".into(), JsonValue::from(v));
        }
        if let Some(v) = self.bathrooms {
            obj.insert("bathrooms".into(), JsonValue::from(v));
        }
        if let Some(v) = &self.home_type {
            obj.insert("homeType".into(), JsonValue::String(v.clone()));
        }
        if let Some(v) = self.area {
            obj.insert("area".into(), JsonValue::from(v));
        }
        obj.insert(
            "match_reason".into(),
            JsonValue::String(match_reason.to_string()),
        );
        JsonValue::Object(obj)
    }

    /// Schema check of the mapped fields alone. A candidate failing it can
    /// never survive normalization, whatever reason it is given.
    pub fn check_listing_fields(&self) -> Result<(), SchemaError> {
        Listing::from_record(&self.to_record("-")).map(|_| ())
    }

    /// Descriptive text (address, description, status line) for amenity and
    /// proximity lookups. Keys, ids and URLs are left out.
    pub fn search_text(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if let Some(address) = &self.address {
            parts.push(address.as_str());
        }
        for key in ["description", "statusText"] {
            if let Some(text) = self.raw.get(key).and_then(JsonValue::as_str) {
                parts.push(text);
            }
        }
        parts.join(" ").to_lowercase()
    }
}

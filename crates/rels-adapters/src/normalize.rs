//! Tolerant extraction of listing arrays from loosely shaped JSON payloads.

use std::path::Path;

use anyhow::{Context, Result};
use rels_core::{Listing, SchemaError};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

/// Keys under which an upstream process may nest the result array, in the
/// order they are tried.
pub const DEFAULT_WRAPPER_KEYS: &[&str] = &[
    "input",
    "output",
    "result",
    "results",
    "response",
    "listings",
    "homes",
    "rentals",
    "houses",
    "filteredListings",
    "filteredHomes",
    "filteredRentals",
    "filteredHouses",
];

const MAX_UNWRAP_DEPTH: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Structured(JsonValue),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizeDefect {
    Unparsable { error: String },
    UnknownWrapper { keys: Vec<String> },
    WrappedScalar,
    InvalidRecord { index: usize, error: SchemaError },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Normalized {
    pub listings: Vec<Listing>,
    pub dropped: usize,
    pub defects: Vec<NormalizeDefect>,
}

#[derive(Debug, Clone, Deserialize)]
struct WrapperKeyRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    wrapper_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResponseNormalizer {
    wrapper_keys: Vec<String>,
}

impl Default for ResponseNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_WRAPPER_KEYS.iter().map(|k| k.to_string()).collect())
    }
}

impl ResponseNormalizer {
    pub fn new(wrapper_keys: Vec<String>) -> Self {
        Self { wrapper_keys }
    }

    /// Load the wrapper-key priority list from a YAML rules file.
    pub fn from_rules_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let rules: WrapperKeyRulesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        if rules.wrapper_keys.is_empty() {
            anyhow::bail!("{} lists no wrapper keys", path.display());
        }
        Ok(Self::new(rules.wrapper_keys))
    }

    pub fn wrapper_keys(&self) -> &[String] {
        &self.wrapper_keys
    }

    /// Produce a validated listing set. Never fails: unparsable payloads
    /// degrade to an empty set and invalid records are dropped and counted.
    pub fn normalize(&self, payload: Payload) -> Normalized {
        let (records, mut defects) = self.extract_records(payload);

        let mut listings = Vec::with_capacity(records.len());
        let mut dropped = 0usize;
        for (index, record) in records.iter().enumerate() {
            match Listing::from_record(record) {
                Ok(listing) => listings.push(listing),
                Err(error) => {
                    warn!(index, %error, "dropping record that fails listing schema");
                    dropped += 1;
                    defects.push(NormalizeDefect::InvalidRecord { index, error });
                }
            }
        }

        Normalized {
            listings,
            dropped,
            defects,
        }
    }

    /// Reduce a payload to a sequence of records without schema validation.
    pub fn extract_records(&self, payload: Payload) -> (Vec<JsonValue>, Vec<NormalizeDefect>) {
        let mut defects = Vec::new();
        let value = match payload {
            Payload::Structured(value) => value,
            Payload::Text(text) => match parse_lenient(&text) {
                Ok(value) => value,
                Err(err) => {
                    warn!(error = %err, "payload is not parseable JSON; treating as empty");
                    defects.push(NormalizeDefect::Unparsable {
                        error: err.to_string(),
                    });
                    return (Vec::new(), defects);
                }
            },
        };

        let value = self.unwrap_value(value, &mut defects);
        let records = match value {
            JsonValue::Array(items) => items,
            other => {
                debug!("wrapping non-sequence payload as a single record");
                defects.push(NormalizeDefect::WrappedScalar);
                vec![other]
            }
        };
        (records, defects)
    }

    fn unwrap_value(&self, mut value: JsonValue, defects: &mut Vec<NormalizeDefect>) -> JsonValue {
        for depth in 0..MAX_UNWRAP_DEPTH {
            let mut obj = match value {
                JsonValue::Object(obj) => obj,
                other => return other,
            };
            let found = self.wrapper_keys.iter().find(|k| obj.contains_key(k.as_str()));
            match found {
                Some(key) => {
                    debug!(key = key.as_str(), depth, "unwrapping payload");
                    value = obj.remove(key.as_str()).unwrap_or(JsonValue::Null);
                }
                None => {
                    if depth == 0 {
                        defects.push(NormalizeDefect::UnknownWrapper {
                            keys: obj.keys().cloned().collect(),
                        });
                    }
                    return JsonValue::Array(vec![JsonValue::Object(obj)]);
                }
            }
        }
        value
    }
}

/// Parse JSON text, falling back to a fenced code block or the outermost
/// bracketed slice when the text carries surrounding prose.
pub fn parse_lenient(text: &str) -> Result<JsonValue, serde_json::Error> {
    let trimmed = text.trim();
    let first_err = match serde_json::from_str(trimmed) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    if let Some(inner) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str(inner) {
            return Ok(value);
        }
    }
    if let Some(inner) = bracketed_slice(trimmed) {
        if let Ok(value) = serde_json::from_str(inner) {
            return Ok(value);
        }
    }
    Err(first_err)
}

fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

fn bracketed_slice(text: &str) -> Option<&str> {
    let start = text.find(['[', '{'])?;
    let closer = if text[start..].starts_with('[') { ']' } else { '}' };
    let end = text.rfind(closer)?;
    if end <= start {
        return None;
    }
    Some(&text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> JsonValue {
        json!({
            "id": id,
            "detailUrl": format!("https://example.com/{id}"),
            "price": "$1,500/mo",
            "address": "10 Elm St, Springfield, IL 62701",
            "bedrooms": 1,
            "bathrooms": 1,
            "homeType": "APARTMENT",
            "area": 640,
            "match_reason": "Matches your search area"
        })
    }

    #[test]
    fn bare_array_is_used_directly() {
        let normalizer = ResponseNormalizer::default();
        let out = normalizer.normalize(Payload::Structured(json!([record("1"), record("2")])));
        assert_eq!(out.listings.len(), 2);
        assert_eq!(out.dropped, 0);
        assert!(out.defects.is_empty());
    }

    #[test]
    fn results_wrapper_is_unwrapped() {
        let text = json!({ "results": [record("1")] }).to_string();
        let out = ResponseNormalizer::default().normalize(Payload::Text(text));
        assert_eq!(out.listings.len(), 1);
        assert_eq!(out.listings[0].id, "1");
    }

    #[test]
    fn wrapper_keys_are_tried_in_priority_order() {
        let payload = json!({
            "listings": [record("from-listings")],
            "output": [record("from-output")]
        });
        let out = ResponseNormalizer::default().normalize(Payload::Structured(payload));
        assert_eq!(out.listings.len(), 1);
        assert_eq!(out.listings[0].id, "from-output");
    }

    #[test]
    fn nested_wrappers_are_unwrapped() {
        let payload = json!({ "output": { "filteredRentals": [record("7")] } });
        let out = ResponseNormalizer::default().normalize(Payload::Structured(payload));
        assert_eq!(out.listings.len(), 1);
        assert_eq!(out.listings[0].id, "7");
    }

    #[test]
    fn unknown_key_object_becomes_single_record() {
        let out = ResponseNormalizer::default().normalize(Payload::Structured(record("solo")));
        assert_eq!(out.listings.len(), 1);
        assert_eq!(out.listings[0].id, "solo");
        assert!(matches!(out.defects[0], NormalizeDefect::UnknownWrapper { .. }));
    }

    #[test]
    fn scalar_is_wrapped_and_then_dropped_by_schema() {
        let out = ResponseNormalizer::default().normalize(Payload::Text("42".into()));
        assert!(out.listings.is_empty());
        assert_eq!(out.dropped, 1);
        assert!(out.defects.contains(&NormalizeDefect::WrappedScalar));
    }

    #[test]
    fn unparsable_text_degrades_to_empty() {
        let out = ResponseNormalizer::default().normalize(Payload::Text("not json".into()));
        assert!(out.listings.is_empty());
        assert_eq!(out.dropped, 0);
        assert!(matches!(out.defects[0], NormalizeDefect::Unparsable { .. }));
    }

    #[test]
    fn fenced_and_prose_wrapped_json_is_recovered() {
        let fenced = format!("Here you go:\n```json\n{}\n```", json!([record("a")]));
        let out = ResponseNormalizer::default().normalize(Payload::Text(fenced));
        assert_eq!(out.listings.len(), 1);

        let prose = format!("Result: {} -- done", json!({ "homes": [record("b")] }));
        let out = ResponseNormalizer::default().normalize(Payload::Text(prose));
        assert_eq!(out.listings[0].id, "b");
    }

    #[test]
    fn invalid_records_are_dropped_and_counted() {
        let mut broken = record("2");
        broken.as_object_mut().unwrap().remove("price");
        let out = ResponseNormalizer::default()
            .normalize(Payload::Structured(json!([record("1"), broken, record("3")])));
        let ids = out.listings.iter().map(|l| l.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "3"]);
        assert_eq!(out.dropped, 1);
        assert!(matches!(
            out.defects[0],
            NormalizeDefect::InvalidRecord { index: 1, error: SchemaError::MissingField("price") }
        ));
    }

    #[test]
    fn custom_wrapper_keys_extend_the_heuristic() {
        let normalizer = ResponseNormalizer::new(vec!["properties".into()]);
        let out = normalizer.normalize(Payload::Structured(json!({ "properties": [record("p")] })));
        assert_eq!(out.listings.len(), 1);
    }

    #[test]
    fn rules_file_overrides_default_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wrapper_keys.yaml");
        std::fs::write(&path, "version: 1\nwrapper_keys:\n  - data\n  - listings\n").unwrap();
        let normalizer = ResponseNormalizer::from_rules_file(&path).unwrap();
        assert_eq!(normalizer.wrapper_keys(), &["data".to_string(), "listings".to_string()]);
    }
}

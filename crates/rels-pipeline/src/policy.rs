//! Requirement extraction and candidate filtering.
//!
//! Both policies produce a [`Payload`] that goes through the response
//! normalizer, so keyword and reasoning runs share one validation path.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rels_adapters::{Payload, ReasoningClient, ReasoningError};
use rels_core::CandidateListing;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

use crate::cues::{self, CountCue, Words};

pub const SEARCH_AREA_REASON: &str = "Matches your search area";
pub const CLOSE_MATCH_REASON: &str = "Close to your search criteria";
pub const FALLBACK_CAP: usize = 5;

const AMENITIES: &[(&str, &[&str])] = &[
    ("pool", &["pool", "pools", "swimming"]),
    ("garage", &["garage", "garages"]),
    ("yard", &["yard", "backyard", "garden"]),
    ("parking", &["parking", "carport"]),
    ("pet", &["pet", "pets", "dog", "dogs", "cat", "cats"]),
    ("laundry", &["laundry", "washer", "w/d"]),
    ("gym", &["gym", "fitness"]),
    ("balcony", &["balcony", "patio", "terrace"]),
];

const AMENITY_LISTING_TERMS: &[(&str, &[&str])] = &[
    ("pool", &["pool", "pools"]),
    ("garage", &["garage", "garages"]),
    ("yard", &["yard", "yards", "backyard", "garden"]),
    ("parking", &["parking", "garage", "garages", "carport"]),
    ("pet", &["pet", "pets", "pet-friendly", "dog", "dogs", "cat", "cats"]),
    ("laundry", &["laundry", "washer", "w/d"]),
    ("gym", &["gym", "fitness"]),
    ("balcony", &["balcony", "balconies", "patio", "terrace"]),
];

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("reasoning service failed while filtering: {0}")]
    Reasoning(#[from] ReasoningError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    House,
    Apartment,
    Condo,
    Townhouse,
}

impl PropertyType {
    fn from_request(words: &Words) -> Option<Self> {
        let w = words.as_slice();
        let has = |terms: &[&str]| w.iter().any(|t| terms.contains(&t.as_str()));
        if has(&["townhouse", "townhouses", "townhome", "townhomes", "rowhouse"]) {
            Some(Self::Townhouse)
        } else if has(&["condo", "condos", "condominium", "condominiums"]) {
            Some(Self::Condo)
        } else if has(&["apartment", "apartments", "apt", "apts", "flat", "flats", "loft"]) {
            Some(Self::Apartment)
        } else if has(&["house", "houses", "single-family", "bungalow", "cottage"])
            || w.windows(2).any(|p| p[0] == "single" && p[1].starts_with("family"))
        {
            Some(Self::House)
        } else {
            None
        }
    }

    /// Match against upstream home types such as `SINGLE_FAMILY` or
    /// `APARTMENT`.
    fn matches_home_type(self, home_type: &str) -> bool {
        let ht = home_type.to_ascii_lowercase();
        match self {
            Self::House => ht.contains("single") || (ht.contains("house") && !ht.contains("town")),
            Self::Apartment => ht.contains("apartment") || ht.contains("multi"),
            Self::Condo => ht.contains("condo"),
            Self::Townhouse => ht.contains("town"),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::House => "a house",
            Self::Apartment => "an apartment",
            Self::Condo => "a condo",
            Self::Townhouse => "a townhouse",
        }
    }
}

/// Requirement dimensions identified in the request text.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequirementSet {
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
    pub bedrooms: Option<CountCue>,
    pub bathrooms_min: Option<f64>,
    pub property_type: Option<PropertyType>,
    pub area_min: Option<f64>,
    pub amenities: Vec<&'static str>,
    pub proximity: Vec<String>,
}

impl RequirementSet {
    pub fn from_request(request: &str) -> Self {
        let words = Words::new(request);
        let bounds = cues::price_bounds(&words);
        let amenities = AMENITIES
            .iter()
            .filter(|(_, terms)| words.contains_any(terms))
            .map(|(name, _)| *name)
            .collect();

        Self {
            price_min: bounds.min,
            price_max: bounds.max,
            bedrooms: cues::bedrooms(&words),
            bathrooms_min: cues::bathrooms(&words).map(|c| c.value()),
            property_type: PropertyType::from_request(&words),
            area_min: cues::min_area(&words),
            amenities,
            proximity: cues::proximity_phrases(&words),
        }
    }

    pub fn dimension_count(&self) -> usize {
        [
            self.price_min.is_some() || self.price_max.is_some(),
            self.bedrooms.is_some(),
            self.bathrooms_min.is_some(),
            self.property_type.is_some(),
            self.area_min.is_some(),
            !self.amenities.is_empty(),
            !self.proximity.is_empty(),
        ]
        .into_iter()
        .filter(|d| *d)
        .count()
    }

    pub fn is_empty(&self) -> bool {
        self.dimension_count() == 0
    }

    /// Satisfied dimensions phrased for the reader. Empty when the candidate
    /// qualifies on nothing, including dimensions whose field is unknown.
    pub fn satisfied(&self, candidate: &CandidateListing) -> Vec<String> {
        let mut hits = Vec::new();

        if self.price_min.is_some() || self.price_max.is_some() {
            let amount = candidate.price.as_deref().and_then(cues::listing_price_amount);
            if let (Some(amount), Some(display)) = (amount, candidate.price.as_deref()) {
                let above = self.price_min.map_or(true, |min| amount >= min);
                let below = self.price_max.map_or(true, |max| amount <= max);
                if above && below {
                    hits.push(format!("within your budget at {display}"));
                }
            }
        }

        if let (Some(cue), Some(beds)) = (self.bedrooms, candidate.bedrooms) {
            let beds_f = f64::from(beds);
            let ok = match cue {
                CountCue::Exactly(n) => beds_f == n,
                CountCue::AtLeast(n) => beds_f >= n,
            };
            if ok {
                hits.push(match beds {
                    0 => "a studio as requested".to_string(),
                    1 => "1 bedroom".to_string(),
                    n => format!("{n} bedrooms"),
                });
            }
        }

        if let (Some(min), Some(baths)) = (self.bathrooms_min, candidate.bathrooms) {
            if baths >= min {
                hits.push(if baths == 1.0 {
                    "1 bathroom".to_string()
                } else {
                    format!("{baths} bathrooms")
                });
            }
        }

        if let (Some(kind), Some(home_type)) = (self.property_type, candidate.home_type.as_deref()) {
            if kind.matches_home_type(home_type) {
                hits.push(format!("is {}", kind.label()));
            }
        }

        if let (Some(min), Some(area)) = (self.area_min, candidate.area) {
            if area >= min {
                hits.push(format!("{area} sq ft"));
            }
        }

        if !self.amenities.is_empty() || !self.proximity.is_empty() {
            let words = Words::new(&candidate.search_text());
            let found: Vec<&str> = self
                .amenities
                .iter()
                .copied()
                .filter(|name| amenity_in(name, &words))
                .collect();
            if !found.is_empty() {
                hits.push(format!("has {}", found.join(" and ")));
            }
            for place in &self.proximity {
                if contains_phrase(&words, place) {
                    hits.push(format!("near {place}"));
                }
            }
        }

        hits
    }
}

fn amenity_in(name: &str, words: &Words) -> bool {
    AMENITY_LISTING_TERMS
        .iter()
        .find(|(n, _)| *n == name)
        .is_some_and(|(_, terms)| words.contains_any(terms))
}

/// Whole-word match of a possibly multi-word place name.
fn contains_phrase(words: &Words, phrase: &str) -> bool {
    let needle: Vec<&str> = phrase.split_whitespace().collect();
    !needle.is_empty()
        && words
            .as_slice()
            .windows(needle.len())
            .any(|window| window.iter().zip(&needle).all(|(w, n)| w.as_str() == *n))
}

fn sentence_case(parts: &[String]) -> String {
    let joined = parts.join(", ");
    let mut chars = joined.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => joined,
    }
}

/// Which branch of the filter rules produced the selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterBranch {
    Matched,
    NoRequirements,
    NothingMatched,
}

impl fmt::Display for FilterBranch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Matched => "matched",
            Self::NoRequirements => "no_requirements",
            Self::NothingMatched => "nothing_matched",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub branch: FilterBranch,
    pub records: Vec<JsonValue>,
}

/// Apply the filter rules locally, keeping input order.
pub fn select_candidates(requirements: &RequirementSet, candidates: &[CandidateListing]) -> Selection {
    if requirements.is_empty() {
        return Selection {
            branch: FilterBranch::NoRequirements,
            records: candidates
                .iter()
                .map(|c| c.to_record(SEARCH_AREA_REASON))
                .collect(),
        };
    }

    let matched: Vec<JsonValue> = candidates
        .iter()
        .filter_map(|c| {
            let hits = requirements.satisfied(c);
            (!hits.is_empty()).then(|| c.to_record(&sentence_case(&hits)))
        })
        .collect();
    if !matched.is_empty() {
        return Selection {
            branch: FilterBranch::Matched,
            records: matched,
        };
    }

    Selection {
        branch: FilterBranch::NothingMatched,
        records: candidates
            .iter()
            .take(FALLBACK_CAP)
            .map(|c| c.to_record(CLOSE_MATCH_REASON))
            .collect(),
    }
}

#[async_trait]
pub trait FilterPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, request: &str, candidates: &[CandidateListing]) -> Result<Payload, PolicyError>;
}

#[derive(Debug, Clone, Default)]
pub struct KeywordFilterPolicy;

#[async_trait]
impl FilterPolicy for KeywordFilterPolicy {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn apply(&self, request: &str, candidates: &[CandidateListing]) -> Result<Payload, PolicyError> {
        let requirements = RequirementSet::from_request(request);
        let selection = select_candidates(&requirements, candidates);
        info!(
            dimensions = requirements.dimension_count(),
            branch = %selection.branch,
            kept = selection.records.len(),
            considered = candidates.len(),
            "keyword filter applied"
        );
        Ok(Payload::Structured(JsonValue::Array(selection.records)))
    }
}

/// Sends the filter rules and candidates to the reasoning service and hands
/// its raw reply back for normalization.
#[derive(Clone)]
pub struct ReasoningFilterPolicy {
    client: Arc<dyn ReasoningClient>,
}

impl ReasoningFilterPolicy {
    pub fn new(client: Arc<dyn ReasoningClient>) -> Self {
        Self { client }
    }
}

pub fn filter_instructions() -> String {
    format!(
        "You filter property listings against a user's real-estate request.\n\
         1. Identify the requirements in the request: budget (min/max price), bedrooms \
         (exact, or a minimum when written with '+' or 'at least'; a studio is 0), bathrooms \
         (minimum), property type (house, apartment, condo, townhouse), square footage \
         (minimum), amenities (pool, garage, yard, parking, pet, laundry, gym, balcony) and \
         proximity ('near X', 'close to X', 'walking distance to X').\n\
         2. Keep a listing when it satisfies at least one identified requirement. A requirement \
         whose listing field is missing is not satisfied.\n\
         3. Give every kept listing a non-empty match_reason naming the requirements it meets.\n\
         4. If the request names no requirements, keep every listing with match_reason \
         \"{SEARCH_AREA_REASON}\".\n\
         5. If requirements exist but no listing meets any of them, keep the first \
         {FALLBACK_CAP} listings in the given order with match_reason \"{CLOSE_MATCH_REASON}\".\n\
         6. Never reorder listings and never invent listings or field values.\n\
         Reply with one JSON object shaped as {{\"listings\": [...]}} where each listing \
         matches this JSON schema: {}",
        rels_core::listing_output_schema()
    )
}

fn candidate_summary(candidate: &CandidateListing) -> JsonValue {
    let mut record = candidate.to_record("");
    if let JsonValue::Object(obj) = &mut record {
        obj.remove("match_reason");
        for key in ["description", "statusText", "statusType"] {
            if let Some(v) = candidate.raw.get(key).filter(|v| !v.is_null()) {
                obj.insert(key.to_string(), v.clone());
            }
        }
    }
    record
}

#[async_trait]
impl FilterPolicy for ReasoningFilterPolicy {
    fn name(&self) -> &'static str {
        "reasoning"
    }

    async fn apply(&self, request: &str, candidates: &[CandidateListing]) -> Result<Payload, PolicyError> {
        let listings: Vec<JsonValue> = candidates.iter().map(candidate_summary).collect();
        let user = format!(
            "Request: {request}\nListings: {}",
            JsonValue::Array(listings)
        );
        debug!(candidates = candidates.len(), model = self.client.model(), "sending candidates for filtering");
        let text = self.client.complete_json(&filter_instructions(), &user).await?;
        Ok(Payload::Text(text))
    }
}

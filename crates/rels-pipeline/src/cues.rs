//! Keyword cue scanning over free-text search requests.

const MAX_CUE_WORDS: &[&str] = &[
    "under", "below", "budget", "afford", "max", "maximum", "up", "less", "cheaper", "within", "<",
];
const MIN_CUE_WORDS: &[&str] = &[
    "over", "above", "least", "min", "minimum", "from", "more", "starting", ">",
];
const AREA_UNITS: &[&str] = &["sq", "sqft", "sf", "square", "ft", "ft2", "feet"];
const BED_UNITS: &[&str] = &["br", "bd", "bed", "beds", "bedroom", "bedrooms", "bdr", "bdrm"];
const BATH_UNITS: &[&str] = &["ba", "bath", "baths", "bathroom", "bathrooms"];
const NUMBER_WORDS: &[(&str, f64)] = &[
    ("one", 1.0),
    ("two", 2.0),
    ("three", 3.0),
    ("four", 4.0),
    ("five", 5.0),
    ("six", 6.0),
];

/// Request text split into lowercase words with surrounding punctuation
/// trimmed; `$`, `+` and `/` are kept since they carry meaning.
#[derive(Debug, Clone)]
pub struct Words {
    words: Vec<String>,
}

impl Words {
    pub fn new(text: &str) -> Self {
        let words = text
            .to_lowercase()
            .split(|c: char| c.is_whitespace())
            .map(|w| {
                w.trim_matches(|c: char| matches!(c, ',' | '.' | ';' | ':' | '!' | '?' | '(' | ')' | '"' | '\''))
                    .to_string()
            })
            .filter(|w| !w.is_empty())
            .collect();
        Self { words }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.words
    }

    pub fn contains_any(&self, needles: &[&str]) -> bool {
        self.words.iter().any(|w| needles.contains(&w.as_str()))
    }

    pub fn contains_prefix(&self, prefixes: &[&str]) -> bool {
        self.words
            .iter()
            .any(|w| prefixes.iter().any(|p| w.starts_with(p)))
    }

    fn get(&self, idx: usize) -> Option<&str> {
        self.words.get(idx).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PriceBounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl PriceBounds {
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CountCue {
    Exactly(f64),
    AtLeast(f64),
}

impl CountCue {
    pub fn value(&self) -> f64 {
        match self {
            CountCue::Exactly(v) | CountCue::AtLeast(v) => *v,
        }
    }
}

/// Five-digit postal codes (optionally ZIP+4) in text order, verbatim,
/// skipping dollar amounts and square footage.
pub fn zip_codes(text: &str, limit: usize) -> Vec<String> {
    let words = Words::new(text);
    let mut out: Vec<String> = Vec::new();
    for (idx, word) in words.as_slice().iter().enumerate() {
        if out.len() >= limit {
            break;
        }
        if !is_zip_shape(word) {
            continue;
        }
        let prev = idx.checked_sub(1).and_then(|i| words.get(i)).unwrap_or_default();
        let next = words.get(idx + 1).unwrap_or_default();
        if MAX_CUE_WORDS.contains(&prev) || MIN_CUE_WORDS.contains(&prev) || is_area_unit(next) {
            continue;
        }
        if !out.contains(word) {
            out.push(word.clone());
        }
    }
    out
}

fn is_zip_shape(word: &str) -> bool {
    let (base, plus4) = match word.split_once('-') {
        Some((b, p)) => (b, Some(p)),
        None => (word, None),
    };
    let base_ok = base.len() == 5 && base.chars().all(|c| c.is_ascii_digit());
    let plus4_ok = plus4.map_or(true, |p| p.len() == 4 && p.chars().all(|c| c.is_ascii_digit()));
    base_ok && plus4_ok
}

fn is_area_unit(word: &str) -> bool {
    AREA_UNITS.iter().any(|u| word == *u || word.starts_with("sq"))
}

/// Parse `$2,000`, `2k`, `$1.5m`, `1985/mo`, `2000+` into a dollar amount.
pub fn parse_amount(word: &str) -> Option<f64> {
    let mut w = word.trim_start_matches('$').trim_end_matches('+');
    for suffix in ["/mo", "/month", "/mon", "/yr"] {
        w = w.trim_end_matches(suffix);
    }
    let w = w.replace(',', "");
    let (digits, multiplier) = if let Some(d) = w.strip_suffix('k') {
        (d.to_string(), 1_000.0)
    } else if let Some(d) = w.strip_suffix('m') {
        (d.to_string(), 1_000_000.0)
    } else {
        (w, 1.0)
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }
    digits.parse::<f64>().ok().map(|v| v * multiplier)
}

/// First dollar figure in a display price such as `$1,985/mo` or `$1.2M`.
pub fn listing_price_amount(display: &str) -> Option<f64> {
    let lower = display.to_lowercase();
    let start = lower.find(|c: char| c.is_ascii_digit())?;
    let figure: String = lower[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | 'k' | 'm'))
        .collect();
    parse_amount(figure.trim_end_matches('.'))
}

/// Dollar bounds implied by the request. A bare amount with no direction
/// cue is read as a ceiling.
pub fn price_bounds(words: &Words) -> PriceBounds {
    let w = words.as_slice();
    let mut bounds = PriceBounds::default();

    for idx in 0..w.len() {
        if w[idx] != "between" {
            continue;
        }
        let lo = w.get(idx + 1).and_then(|s| parse_amount(s));
        let hi = match w.get(idx + 2).map(String::as_str) {
            Some("and") | Some("to") | Some("-") => w.get(idx + 3).and_then(|s| parse_amount(s)),
            _ => None,
        };
        if let (Some(lo), Some(hi)) = (lo, hi) {
            bounds.min = Some(lo.min(hi));
            bounds.max = Some(lo.max(hi));
            return bounds;
        }
    }

    for (idx, word) in w.iter().enumerate() {
        let prev_words = &w[idx.saturating_sub(3)..idx];
        let has_cue = |cues: &[&str]| prev_words.iter().any(|p| cues.contains(&p.as_str()));
        let is_money = word.starts_with('$') || word.contains("/mo");
        let max_cue = has_cue(MAX_CUE_WORDS);
        let min_cue = has_cue(MIN_CUE_WORDS);
        if !is_money && !max_cue && !min_cue {
            continue;
        }
        let next = w.get(idx + 1).map(String::as_str).unwrap_or_default();
        if is_zip_shape(word) && !is_money || is_area_unit(next) || is_count_unit(next) {
            continue;
        }
        let Some(amount) = parse_amount(word) else {
            continue;
        };
        if min_cue && !max_cue {
            bounds.min.get_or_insert(amount);
        } else if bounds.max.is_none() {
            bounds.max = Some(amount);
        }
    }
    bounds
}

fn is_count_unit(word: &str) -> bool {
    BED_UNITS.contains(&word) || BATH_UNITS.contains(&word)
}

fn number_word(word: &str) -> Option<f64> {
    NUMBER_WORDS
        .iter()
        .find(|(name, _)| *name == word)
        .map(|(_, v)| *v)
        .or_else(|| word.parse::<f64>().ok())
}

/// Split `2br`, `2-bed`, `1.5ba`, `3+` into (number, at_least, unit suffix).
fn split_count(word: &str) -> Option<(f64, bool, String)> {
    let digits: String = word
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let (value, rest) = if digits.is_empty() {
        let (head, tail) = word.split_once('-').unwrap_or((word, ""));
        let head = head.trim_end_matches('+');
        (number_word(head)?, &word[word.len() - tail.len()..])
    } else {
        (digits.parse::<f64>().ok()?, &word[digits.len()..])
    };
    let at_least = rest.starts_with('+') || word.contains('+');
    let unit = rest.trim_start_matches('+').trim_start_matches('-').to_string();
    Some((value, at_least, unit))
}

fn count_for_units(words: &Words, units: &[&str]) -> Option<CountCue> {
    let w = words.as_slice();
    for (idx, word) in w.iter().enumerate() {
        let Some((value, mut at_least, unit)) = split_count(word) else {
            continue;
        };
        let unit_matches = if unit.is_empty() {
            w.get(idx + 1).is_some_and(|n| units.contains(&n.as_str()))
        } else {
            units.contains(&unit.as_str())
        };
        if !unit_matches {
            continue;
        }
        let prev = &w[idx.saturating_sub(2)..idx];
        if prev.iter().any(|p| matches!(p.as_str(), "least" | "min" | "minimum")) {
            at_least = true;
        }
        return Some(if at_least {
            CountCue::AtLeast(value)
        } else {
            CountCue::Exactly(value)
        });
    }
    None
}

pub fn bedrooms(words: &Words) -> Option<CountCue> {
    if words.contains_any(&["studio", "studios"]) {
        return Some(CountCue::Exactly(0.0));
    }
    count_for_units(words, BED_UNITS)
}

pub fn bathrooms(words: &Words) -> Option<CountCue> {
    count_for_units(words, BATH_UNITS)
}

/// Minimum square footage, e.g. `1,000 sq ft` or `800sqft`.
pub fn min_area(words: &Words) -> Option<f64> {
    let w = words.as_slice();
    for (idx, word) in w.iter().enumerate() {
        let digits: String = word
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == ',')
            .collect();
        if digits.is_empty() {
            continue;
        }
        let rest = word[digits.len()..].trim_start_matches('+');
        let unit_matches = if rest.is_empty() {
            w.get(idx + 1).is_some_and(|n| is_area_unit(n))
        } else {
            is_area_unit(rest)
        };
        if unit_matches {
            return digits.replace(',', "").parse::<f64>().ok();
        }
    }
    None
}

const PROXIMITY_STOP_WORDS: &[&str] = &[
    "and", "with", "under", "in", "for", "below", "that", "which", "or", "but", "at", "within",
    "around", "by", "less", "more", "than",
];

/// Place phrases following `near`, `close to`, `walking distance to/of`.
pub fn proximity_phrases(words: &Words) -> Vec<String> {
    let w = words.as_slice();
    let mut out = Vec::new();
    let mut idx = 0;
    while idx < w.len() {
        let start = match w[idx].as_str() {
            "near" | "nearby" => Some(idx + 1),
            "close" if w.get(idx + 1).is_some_and(|n| n == "to") => Some(idx + 2),
            "walking" if w.get(idx + 1).is_some_and(|n| n == "distance") => {
                match w.get(idx + 2).map(String::as_str) {
                    Some("to") | Some("of") | Some("from") => Some(idx + 3),
                    _ => Some(idx + 2),
                }
            }
            _ => None,
        };
        if let Some(start) = start {
            let phrase = w
                .iter()
                .skip(start)
                .skip_while(|t| matches!(t.as_str(), "the" | "a" | "an"))
                .take_while(|t| {
                    !PROXIMITY_STOP_WORDS.contains(&t.as_str())
                        && !t.chars().next().is_some_and(|c| c.is_ascii_digit() || c == '$')
                })
                .take(3)
                .cloned()
                .collect::<Vec<_>>()
                .join(" ");
            if !phrase.is_empty() && !out.contains(&phrase) {
                out.push(phrase);
            }
            idx = start;
            continue;
        }
        idx += 1;
    }
    out
}

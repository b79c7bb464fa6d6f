//! Turning raw vision-model output into food detections.
//!
//! The model is asked for a JSON array but frequently answers in prose, wraps
//! the array in a code fence, or returns something in between. Parsing
//! therefore never fails: it tries the structured path first, falls back to a
//! line heuristic, and at worst returns an empty list.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::debug;

use crate::models::FoodDetection;

/// Upper bound on detections returned for a single image.
pub const MAX_DETECTIONS: usize = 6;

/// Confidence assigned when the response carries none we can read.
pub const DEFAULT_CONFIDENCE: f64 = 0.6;

/// Strategy for extracting detections from a raw model response.
pub trait DetectionParser: Send + Sync {
    /// Parse `raw` into at most [`MAX_DETECTIONS`] detections tagged with `locale`.
    fn parse(&self, raw: &str, locale: &str) -> Vec<FoodDetection>;
}

/// JSON array first, newline/comma/semicolon separated lines as fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicParser;

impl DetectionParser for HeuristicParser {
    fn parse(&self, raw: &str, locale: &str) -> Vec<FoodDetection> {
        let mut detections = parse_structured(raw).unwrap_or_else(|| {
            debug!("vision response is not a JSON array, using line fallback");
            parse_lines(raw)
        });
        detections.truncate(MAX_DETECTIONS);
        for detection in &mut detections {
            detection.locale = locale.to_string();
        }
        detections
    }
}

static GRAMS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\(\s*(\d+)\s*g\s*\)").expect("valid grams regex"));

// Leading delimiter is consumed; the trailing boundary is checked by hand.
static CONFIDENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s(\[=:])(\d*\.\d+|\d+,\d+)").expect("valid confidence regex")
});

static CONFIDENCE_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[\s(\[,]*\b(?:confidence|conf)\.?\s*[=:]?\s*$")
        .expect("valid confidence label regex")
});

static BARE_GRAMS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\(?\s*(\d+)\s*g\s*\)?$").expect("valid bare grams regex"));

static LIST_MARKER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*•]+|\d+[.)])\s+").expect("valid list marker regex"));

/// Parse the substring between the first `[` and the last `]` as a JSON array.
///
/// Returns `None` when there is no bracket pair or the substring is not valid
/// JSON. A valid but empty array yields `Some(vec![])`.
#[must_use]
pub fn parse_structured(raw: &str) -> Option<Vec<FoodDetection>> {
    let start = raw.find('[')?;
    let end = raw.rfind(']')?;
    if end <= start {
        return None;
    }
    let value: Value = serde_json::from_str(&raw[start..=end]).ok()?;
    let items = value.as_array()?;
    Some(items.iter().filter_map(detection_from_value).collect())
}

fn detection_from_value(value: &Value) -> Option<FoodDetection> {
    match value {
        Value::String(name) => detection(name, None, None),
        Value::Object(map) => {
            let name = string_field(map, &["name", "food", "dish"])?;
            let grams = number_field(
                map,
                &[
                    "servingGrams",
                    "serving_grams",
                    "estimatedServingGrams",
                    "grams",
                ],
            );
            let confidence = number_field(map, &["confidence"]);
            detection(&name, grams, confidence)
        }
        _ => None,
    }
}

fn string_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| map.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn number_field(map: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| match map.get(*k)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches(['g', '%']).trim().parse().ok(),
        _ => None,
    })
}

fn detection(name: &str, grams: Option<f64>, confidence: Option<f64>) -> Option<FoodDetection> {
    let name = name.trim();
    if !has_letter(name) {
        return None;
    }
    Some(FoodDetection {
        name: name.to_string(),
        locale: String::new(),
        estimated_serving_g: grams.filter(|g| g.is_finite() && *g > 0.0),
        confidence: normalize_confidence(confidence),
    })
}

/// Map a model-reported confidence into `[0, 1]`.
///
/// Values in `(1, 100]` are read as percentages. Missing or non-finite values
/// become [`DEFAULT_CONFIDENCE`].
#[must_use]
pub fn normalize_confidence(confidence: Option<f64>) -> f64 {
    match confidence {
        Some(c) if c.is_finite() => {
            let c = if c > 1.0 && c <= 100.0 { c / 100.0 } else { c };
            c.clamp(0.0, 1.0)
        }
        _ => DEFAULT_CONFIDENCE,
    }
}

/// Heuristic fallback: one detection per non-empty line, comma or semicolon
/// separated segment.
///
/// A comma between two digits is a decimal separator, not a delimiter. A
/// segment that carries only a quantity or a confidence (`350g`, `0.9`) is
/// folded into the detection before it.
#[must_use]
pub fn parse_lines(raw: &str) -> Vec<FoodDetection> {
    let mut parts: Vec<LineParts<'_>> = Vec::new();
    for part in split_segments(raw).into_iter().filter_map(split_line) {
        match parts.last_mut() {
            Some(last) if !has_letter(part.name) => {
                last.grams = last.grams.or(part.grams);
                last.confidence = last.confidence.or(part.confidence);
            }
            _ => parts.push(part),
        }
    }
    parts
        .into_iter()
        .filter_map(|p| detection(p.name, p.grams, p.confidence))
        .collect()
}

/// Extract name, `(<n>g)` grams and a decimal confidence from one line.
///
/// The name is the first non-empty run of text outside the gram annotation
/// and the confidence token, so both `Phở (350g) 0.9` and `0.9 Phở (350g)`
/// name the dish.
#[must_use]
pub fn parse_line(line: &str) -> Option<FoodDetection> {
    let part = split_line(line)?;
    detection(part.name, part.grams, part.confidence)
}

struct LineParts<'a> {
    name: &'a str,
    grams: Option<f64>,
    confidence: Option<f64>,
}

fn split_segments(raw: &str) -> Vec<&str> {
    let bytes = raw.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    for (i, c) in raw.char_indices() {
        let split = match c {
            '\n' | ';' => true,
            ',' => {
                let digit_before = i > 0 && bytes[i - 1].is_ascii_digit();
                let digit_after = bytes.get(i + 1).is_some_and(u8::is_ascii_digit);
                !(digit_before && digit_after)
            }
            _ => false,
        };
        if split {
            segments.push(&raw[start..i]);
            start = i + c.len_utf8();
        }
    }
    segments.push(&raw[start..]);
    segments
}

fn split_line(line: &str) -> Option<LineParts<'_>> {
    let line = line.trim();
    let line = LIST_MARKER_RE
        .find(line)
        .map_or(line, |m| &line[m.end()..])
        .trim();
    if line.is_empty() {
        return None;
    }

    if let Some(caps) = BARE_GRAMS_RE.captures(line) {
        return Some(LineParts {
            name: "",
            grams: caps[1].parse().ok(),
            confidence: None,
        });
    }

    let grams = GRAMS_RE.captures(line);
    let grams_span = grams.as_ref().and_then(|c| c.get(0)).map(|m| m.range());
    let grams_value = grams
        .as_ref()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok());

    let confidence = find_confidence(line);

    let mut spans: Vec<Range<usize>> = grams_span
        .into_iter()
        .chain(confidence.as_ref().map(|(span, _)| span.clone()))
        .collect();
    spans.sort_by_key(|span| span.start);
    spans.push(line.len()..line.len());

    let mut name = "";
    let mut cursor = 0;
    for span in spans {
        if span.start >= cursor {
            let candidate = clean_name(&line[cursor..span.start]);
            if !candidate.is_empty() {
                name = candidate;
                break;
            }
        }
        cursor = cursor.max(span.end);
    }

    Some(LineParts {
        name,
        grams: grams_value,
        confidence: confidence.map(|(_, value)| value),
    })
}

fn clean_name(text: &str) -> &str {
    let text = CONFIDENCE_LABEL_RE
        .find(text)
        .map_or(text, |m| &text[..m.start()]);
    text.trim()
        .trim_matches([':', '-', '–', '(', ')', '=', ','])
        .trim()
}

fn has_letter(text: &str) -> bool {
    text.chars().any(char::is_alphabetic)
}

// First standalone decimal token whose value is within [0, 1].
fn find_confidence(line: &str) -> Option<(Range<usize>, f64)> {
    CONFIDENCE_RE.captures_iter(line).find_map(|caps| {
        let token = caps.get(1)?;
        let next = line[token.end()..].chars().next();
        if next.is_some_and(|c| c.is_alphanumeric() || c == '.') {
            return None;
        }
        let value: f64 = token.as_str().replace(',', ".").parse().ok()?;
        (0.0..=1.0)
            .contains(&value)
            .then_some((token.range(), value))
    })
}

//! Recovery and validation of JSON payloads embedded in model output.
//!
//! Models wrap their JSON in prose or markdown fences. Extraction takes the
//! span from the first opening bracket to the last closing one; if that span
//! does not parse (stray braces in trailing prose), it falls back to the first
//! complete JSON value starting at the opening bracket.
//!
//! Everything here is pure: no I/O, no logging.

use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::models::ParsedResult;

/// Confidence assigned when the model omits it or reports an out-of-range value.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

const DEFAULT_TRANSLATION_CONFIDENCE: f64 = 0.8;
const DEFAULT_ITEM_TRANSLATION_CONFIDENCE: f64 = 0.7;

/// Parse a single-item response (`{ ... }`).
pub fn parse_single(text: &str) -> Result<ParsedResult, ParseError> {
    let value = isolate(text, '{', '}', "object")?;
    match value {
        Value::Object(map) => candidate_from_map(&map, None),
        _ => Err(ParseError::Schema("expected a JSON object".to_string())),
    }
}

/// Parse a multi-item response (`[ {...}, ... ]`), preserving order.
pub fn parse_multi(text: &str) -> Result<Vec<ParsedResult>, ParseError> {
    let value = isolate(text, '[', ']', "array")?;
    let items = match value {
        Value::Array(items) => items,
        _ => return Err(ParseError::Schema("expected a JSON array".to_string())),
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(map) => candidate_from_map(map, Some(i)),
            _ => Err(ParseError::Schema(format!("item {} is not an object", i))),
        })
        .collect()
}

fn isolate(text: &str, open: char, close: char, expected: &'static str) -> Result<Value, ParseError> {
    let text = text.trim();
    let (start, end) = match (text.find(open), text.rfind(close)) {
        (Some(start), Some(end)) if start < end => (start, end),
        _ => return Err(ParseError::NoJson { expected }),
    };

    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(value) => Ok(value),
        Err(span_err) => {
            let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
            match stream.next() {
                Some(Ok(value)) => Ok(value),
                _ => Err(ParseError::Malformed(span_err.to_string())),
            }
        }
    }
}

fn candidate_from_map(map: &Map<String, Value>, index: Option<usize>) -> Result<ParsedResult, ParseError> {
    let field = |name: &str| match index {
        Some(i) => format!("{} (item {})", name, i),
        None => name.to_string(),
    };

    let standardized_name = match map.get("standardized_name") {
        None | Some(Value::Null) => {
            return Err(ParseError::MissingRequiredField(field("standardized_name")))
        }
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::String(_)) => {
            return Err(ParseError::Schema(format!(
                "{} must be non-empty",
                field("standardized_name")
            )))
        }
        Some(_) => {
            return Err(ParseError::Schema(format!(
                "{} must be a string",
                field("standardized_name")
            )))
        }
    };

    let confidence = map
        .get("confidence_score")
        .or_else(|| map.get("confidence"))
        .and_then(number)
        .map(clamp_confidence)
        .unwrap_or(DEFAULT_CONFIDENCE);

    Ok(ParsedResult {
        standardized_name,
        category: text_field(map, "category").unwrap_or_default(),
        subcategory: text_field(map, "subcategory").unwrap_or_default(),
        quantity_value: map
            .get("quantity_value")
            .and_then(number)
            .filter(|v| *v >= 0.0),
        quantity_unit: text_field(map, "quantity_unit"),
        notes: text_field(map, "notes"),
        confidence,
        raw_id: None,
        parsed_id: None,
    })
}

/// Values outside `[0,1]` are model noise, not signal: they get the default.
pub fn clamp_confidence(value: f64) -> f64 {
    if (0.0..=1.0).contains(&value) {
        value
    } else {
        DEFAULT_CONFIDENCE
    }
}

/// A number, or a string holding one (`"2"`, `"0,5"`). Empty strings are absent.
fn number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                s.replace(',', ".").parse::<f64>().ok()
            }
        }
        _ => None,
    }?;
    n.is_finite().then_some(n)
}

/// Non-empty trimmed string field; empty strings are treated as absent.
fn text_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

/// One translated line from a batch translation reply.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedLine {
    pub original_text: String,
    pub translated_text: String,
    pub detected_language: String,
    pub confidence: f64,
}

/// Batch translation reply as returned by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchTranslationReply {
    pub detected_language: String,
    pub target_language: String,
    pub translations: Vec<TranslatedLine>,
    pub confidence: f64,
}

pub fn parse_batch_translation(text: &str) -> Result<BatchTranslationReply, ParseError> {
    let map = match isolate(text, '{', '}', "object")? {
        Value::Object(map) => map,
        _ => return Err(ParseError::Schema("expected a JSON object".to_string())),
    };

    let detected_language = text_field(&map, "detected_language")
        .map(|s| s.to_lowercase())
        .unwrap_or_default();
    let target_language = text_field(&map, "target_language").unwrap_or_default();
    let confidence = map
        .get("confidence")
        .and_then(number)
        .filter(|c| (0.0..=1.0).contains(c))
        .unwrap_or(DEFAULT_TRANSLATION_CONFIDENCE);

    let lines = match map.get("translations") {
        Some(Value::Array(lines)) => lines,
        None | Some(Value::Null) => {
            return Err(ParseError::MissingRequiredField("translations".to_string()))
        }
        Some(_) => return Err(ParseError::Schema("translations must be an array".to_string())),
    };

    let mut translations = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        let line = match line {
            Value::Object(line) => line,
            _ => return Err(ParseError::Schema(format!("translation {} is not an object", i))),
        };
        let translated_text = text_field(line, "translated_text").ok_or_else(|| {
            ParseError::MissingRequiredField(format!("translated_text (item {})", i))
        })?;
        translations.push(TranslatedLine {
            original_text: text_field(line, "original_text").unwrap_or_default(),
            translated_text,
            detected_language: text_field(line, "detected_language")
                .map(|s| s.to_lowercase())
                .unwrap_or_else(|| detected_language.clone()),
            confidence: line
                .get("confidence")
                .and_then(number)
                .filter(|c| (0.0..=1.0).contains(c))
                .unwrap_or(DEFAULT_ITEM_TRANSLATION_CONFIDENCE),
        });
    }

    Ok(BatchTranslationReply {
        detected_language,
        target_language,
        translations,
        confidence,
    })
}

/// Reply to a single free-text translation.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleTranslation {
    pub translated_text: String,
    pub confidence: f64,
}

pub fn parse_translation(text: &str) -> Result<SingleTranslation, ParseError> {
    let map = match isolate(text, '{', '}', "object")? {
        Value::Object(map) => map,
        _ => return Err(ParseError::Schema("expected a JSON object".to_string())),
    };
    let translated_text = text_field(&map, "translated_text")
        .ok_or_else(|| ParseError::MissingRequiredField("translated_text".to_string()))?;
    Ok(SingleTranslation {
        translated_text,
        confidence: map
            .get("confidence")
            .and_then(number)
            .filter(|c| (0.0..=1.0).contains(c))
            .unwrap_or(DEFAULT_TRANSLATION_CONFIDENCE),
    })
}

/// Whether a message looks like a shopping list.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductListDetection {
    pub is_product_list: bool,
    pub confidence: f64,
    pub detected_items_count: u32,
    pub sample_items: Vec<String>,
}

pub fn parse_product_list_detection(text: &str) -> Result<ProductListDetection, ParseError> {
    let map = match isolate(text, '{', '}', "object")? {
        Value::Object(map) => map,
        _ => return Err(ParseError::Schema("expected a JSON object".to_string())),
    };

    let is_product_list = match map.get("is_product_list") {
        Some(Value::Bool(b)) => *b,
        None | Some(Value::Null) => {
            return Err(ParseError::MissingRequiredField("is_product_list".to_string()))
        }
        Some(_) => return Err(ParseError::Schema("is_product_list must be a boolean".to_string())),
    };

    Ok(ProductListDetection {
        is_product_list,
        confidence: map
            .get("confidence")
            .and_then(number)
            .map(clamp_confidence)
            .unwrap_or(DEFAULT_CONFIDENCE),
        detected_items_count: map
            .get("detected_items_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        sample_items: map
            .get("sample_items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    })
}

/// Canonical short form of a language code or name.
///
/// `"RUS"`, `"russian"` and `"ru-RU"` all become `"ru"`. Unknown codes keep
/// their lower-cased primary subtag; empty stays empty.
pub fn normalize_language(code: &str) -> String {
    let lowered = code.trim().to_lowercase();
    let primary = lowered.split(['-', '_']).next().unwrap_or_default();
    let canonical = match primary {
        "eng" | "english" => "en",
        "rus" | "russian" | "русский" => "ru",
        "ukr" | "ua" | "ukrainian" | "укр" | "українська" => "uk",
        "spa" | "spanish" | "español" => "es",
        other => other,
    };
    canonical.to_string()
}

/// Normalize a language-detection reply (`"RU."`, `` `uk` ``) to a tag.
///
/// Returns `None` unless the reply is 2–8 ASCII letters or hyphens.
pub fn parse_language_tag(text: &str) -> Option<String> {
    let token = text.split_whitespace().next()?;
    let tag = token
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_ascii_lowercase();
    let valid = (2..=8).contains(&tag.len())
        && tag.chars().all(|c| c.is_ascii_lowercase() || c == '-')
        && !tag.starts_with('-');
    valid.then_some(tag)
}

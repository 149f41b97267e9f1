//! Core data models used throughout the ingestion pipeline.
//!
//! These types represent user submissions, canonical parsed items, their
//! audit mappings, and catalog entries as they flow from the model parser
//! to SQLite.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a submission came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceHint {
    #[default]
    Keyboard,
    Voice,
    Receipt,
}

impl SourceHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceHint::Keyboard => "keyboard",
            SourceHint::Voice => "voice",
            SourceHint::Receipt => "receipt",
        }
    }
}

impl fmt::Display for SourceHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One training-data row: a single canonical name as submitted by a user.
#[derive(Debug, Clone)]
pub struct RawSubmission {
    pub id: Uuid,
    pub raw_text: String,
    pub language_code: String,
    pub quantity_raw: Option<String>,
    pub user_id: Uuid,
    pub source: SourceHint,
    pub created_at: i64,
}

/// Canonical item row, unique on `(standardized_name, language_code)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    pub id: Uuid,
    pub standardized_name: String,
    pub category: String,
    pub subcategory: String,
    pub quantity_value: Option<f64>,
    pub quantity_unit: Option<String>,
    pub notes: Option<String>,
    pub language_code: String,
    pub confidence: f64,
}

/// Audit link between a raw submission and a parsed item.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub raw_id: Uuid,
    pub parsed_id: Uuid,
    pub method: String,
    pub validated: bool,
}

pub const MAPPING_METHOD_MODEL: &str = "model";

/// A candidate item recovered from model output.
///
/// `raw_id` and `parsed_id` are attached once the item has been persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedResult {
    pub standardized_name: String,
    pub category: String,
    pub subcategory: String,
    pub quantity_value: Option<f64>,
    pub quantity_unit: Option<String>,
    pub notes: Option<String>,
    pub confidence: f64,
    pub raw_id: Option<Uuid>,
    pub parsed_id: Option<Uuid>,
}

impl ParsedResult {
    /// Human quantity such as `"2 л"` or `"0.5 кг"`.
    ///
    /// Whole numbers render without decimals, others with one decimal place.
    pub fn quantity_display(&self) -> Option<String> {
        let value = self.quantity_value?;
        let number = if value.fract() == 0.0 {
            format!("{:.0}", value)
        } else {
            format!("{:.1}", value)
        };
        Some(match self.quantity_unit.as_deref() {
            Some(unit) if !unit.is_empty() => format!("{} {}", number, unit),
            _ => number,
        })
    }
}

/// Product reference entry used to steer the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name_en: String,
    #[serde(default)]
    pub name_ru: String,
    #[serde(default)]
    pub name_uk: String,
    pub category: String,
    #[serde(default)]
    pub subcategory: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl CatalogEntry {
    /// Name in the given language, if the entry carries one.
    pub fn name_for(&self, lang: &str) -> Option<&str> {
        let name = match lang {
            "en" | "english" => &self.name_en,
            "ru" | "russian" => &self.name_ru,
            "uk" | "ukrainian" => &self.name_uk,
            _ => return None,
        };
        if name.trim().is_empty() {
            None
        } else {
            Some(name)
        }
    }

    pub fn names(&self) -> [&str; 3] {
        [&self.name_en, &self.name_ru, &self.name_uk]
    }
}

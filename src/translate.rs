//! Per-item translation cache in front of the reasoning model.
//!
//! Items are keyed by `SHA-256(lower(trim(item)))` plus the normalized target
//! locale, so `"EN"` and `"english"` share the `"en"` rows.
//! A batch call looks every item up, sends only the misses to the model in a
//! single request, stores each fresh translation in its own row, and merges
//! hits and fresh results back into input order.
//!
//! Cache reads and writes are best-effort: a failed lookup counts as a miss
//! and a failed store is logged. The model call is not best-effort: a reply
//! whose translation count differs from the number of misses fails the call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{StoreError, TranslateError};
use crate::model::{Effort, ReasoningModel};
use crate::parse::{self, normalize_language};
use crate::prompt::PromptAssembler;
use crate::scope::CallScope;

/// One item's translation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemTranslation {
    pub original_text: String,
    pub translated_text: String,
    #[serde(default)]
    pub detected_language: String,
    pub confidence: f64,
    /// Served from the cache rather than the model.
    #[serde(skip)]
    pub from_cache: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchTranslation {
    pub detected_language: String,
    pub target_language: String,
    /// Same order and length as the input items.
    pub translations: Vec<ItemTranslation>,
    pub confidence: f64,
}

#[async_trait]
pub trait Translator: Send + Sync {
    async fn batch_translate(
        &self,
        items: &[String],
        target_locale: &str,
        scope: &CallScope,
    ) -> Result<BatchTranslation, TranslateError>;
}

/// Lower-cased, trimmed form used for hashing.
pub fn normalize_item(item: &str) -> String {
    item.trim().to_lowercase()
}

/// Hex SHA-256 of the normalized item.
pub fn item_hash(item: &str) -> String {
    hex::encode(Sha256::digest(normalize_item(item).as_bytes()))
}

pub struct TranslationCache {
    pool: SqlitePool,
    model: Arc<dyn ReasoningModel>,
    prompts: PromptAssembler,
}

impl TranslationCache {
    pub fn new(pool: SqlitePool, model: Arc<dyn ReasoningModel>, prompts: PromptAssembler) -> Self {
        Self {
            pool,
            model,
            prompts,
        }
    }

    async fn lookup(&self, hash: &str, target_locale: &str) -> Result<Option<ItemTranslation>, StoreError> {
        let row = sqlx::query(
            "SELECT ai_response FROM translation_cache WHERE item_hash = ? AND target_locale = ?",
        )
        .bind(hash)
        .bind(target_locale)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let body: String = row.get("ai_response");
        serde_json::from_str::<ItemTranslation>(&body)
            .map(Some)
            .map_err(|e| StoreError::Other(format!("undecodable cache row: {}", e)))
    }

    async fn store(
        &self,
        item: &str,
        hash: &str,
        target_locale: &str,
        translation: &ItemTranslation,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_string(translation).map_err(|e| StoreError::Other(e.to_string()))?;
        let detected = Some(translation.detected_language.as_str()).filter(|l| !l.is_empty());
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO translation_cache
                (id, original_item, item_hash, target_locale, ai_response, detected_language, confidence, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(item_hash, target_locale) DO UPDATE SET
                ai_response = excluded.ai_response,
                detected_language = excluded.detected_language,
                confidence = excluded.confidence,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(normalize_item(item))
        .bind(hash)
        .bind(target_locale)
        .bind(body)
        .bind(detected)
        .bind(translation.confidence)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Uncached translation of free text between two languages.
    pub async fn translate_text(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
        scope: &CallScope,
    ) -> Result<parse::SingleTranslation, TranslateError> {
        let prompt = self.prompts.build_translation(
            text,
            &normalize_language(source_language),
            &normalize_language(target_language),
        )?;
        let reply = self.model.invoke(&prompt, Effort::Low, scope).await?;
        Ok(parse::parse_translation(&reply.text)?)
    }
}

#[async_trait]
impl Translator for TranslationCache {
    async fn batch_translate(
        &self,
        items: &[String],
        target_locale: &str,
        scope: &CallScope,
    ) -> Result<BatchTranslation, TranslateError> {
        let target_locale = normalize_language(target_locale);
        let target_locale = target_locale.as_str();
        let mut slots: Vec<Option<ItemTranslation>> = vec![None; items.len()];
        let hashes: Vec<String> = items.iter().map(|i| item_hash(i)).collect();

        // Misses in first-seen order, one entry per distinct hash
        let mut misses: Vec<usize> = Vec::new();
        let mut miss_index: HashMap<&str, usize> = HashMap::new();

        for (i, hash) in hashes.iter().enumerate() {
            if miss_index.contains_key(hash.as_str()) {
                continue;
            }
            match scope.store(self.lookup(hash, target_locale)).await {
                Ok(Some(mut hit)) => {
                    tracing::debug!(item = %items[i], target_locale, "translation cache hit");
                    hit.original_text = items[i].clone();
                    hit.from_cache = true;
                    slots[i] = Some(hit);
                }
                Ok(None) => {
                    miss_index.insert(hash, misses.len());
                    misses.push(i);
                }
                Err(e) => {
                    tracing::warn!(item = %items[i], error = %e, "translation cache lookup failed, treating as miss");
                    miss_index.insert(hash, misses.len());
                    misses.push(i);
                }
            }
        }

        let mut batch_language = String::new();
        let mut batch_confidence = None;
        let mut fresh: Vec<ItemTranslation> = Vec::with_capacity(misses.len());

        if !misses.is_empty() {
            let miss_items: Vec<String> = misses.iter().map(|&i| items[i].clone()).collect();
            let prompt = self.prompts.build_batch_translation(&miss_items, target_locale)?;
            let reply = self.model.invoke(&prompt, Effort::Low, scope).await?;
            let parsed = parse::parse_batch_translation(&reply.text)?;

            if parsed.translations.len() != miss_items.len() {
                return Err(TranslateError::CountMismatch {
                    expected: miss_items.len(),
                    got: parsed.translations.len(),
                });
            }

            batch_language = parsed.detected_language.clone();
            batch_confidence = Some(parsed.confidence);

            for (&i, line) in misses.iter().zip(parsed.translations) {
                let translation = ItemTranslation {
                    original_text: items[i].clone(),
                    translated_text: line.translated_text,
                    detected_language: line.detected_language,
                    confidence: line.confidence,
                    from_cache: false,
                };
                if let Err(e) = scope
                    .store(self.store(&items[i], &hashes[i], target_locale, &translation))
                    .await
                {
                    tracing::warn!(item = %items[i], error = %e, "failed to store translation in cache");
                }
                fresh.push(translation);
            }

            tracing::info!(
                items = items.len(),
                translated = miss_items.len(),
                target_locale,
                "batch translation complete"
            );
        }

        let mut translations = Vec::with_capacity(items.len());
        for (i, slot) in slots.into_iter().enumerate() {
            let translation = match slot {
                Some(hit) => hit,
                None => {
                    // Duplicates of a miss share its fresh translation
                    let k = miss_index
                        .get(hashes[i].as_str())
                        .copied()
                        .ok_or(TranslateError::CountMismatch {
                            expected: misses.len(),
                            got: fresh.len(),
                        })?;
                    let mut t = fresh[k].clone();
                    t.original_text = items[i].clone();
                    t
                }
            };
            translations.push(translation);
        }

        let detected_language = translations
            .iter()
            .map(|t| t.detected_language.as_str())
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or(batch_language);

        let confidence = batch_confidence.unwrap_or_else(|| {
            if translations.is_empty() {
                0.0
            } else {
                translations.iter().map(|t| t.confidence).sum::<f64>() / translations.len() as f64
            }
        });

        Ok(BatchTranslation {
            detected_language,
            target_language: target_locale.to_string(),
            translations,
            confidence,
        })
    }
}

//! Ingestion pipeline orchestration.
//!
//! Turns one free-text submission into persisted, canonical list items:
//! language detection → prompt assembly → model call → parse → duplicate
//! folding → confidence filtering → per-item persistence → list insert →
//! fanout.
//!
//! Language codes are normalized (`"RUS"`, `"russian"` → `"ru"`) before they
//! key any row.
//!
//! # Confidence Filtering
//!
//! Candidates at or above the threshold (default 0.60) become items. Names
//! below it are appended to the first kept item's notes. If nothing clears
//! the threshold, the single most confident candidate is kept.
//!
//! # Persistence
//!
//! Each kept item is written sequentially as a raw submission (carrying the
//! standardized name), a parsed-item upsert keyed on
//! `(standardized_name, language_code)`, and a mapping row. A failed raw or
//! parsed write skips that item; a failed mapping write is only logged.
//! Cancellation stops the loop; rows already written stay.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::catalog::CatalogReader;
use crate::config::{Config, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::error::{IngestError, ParseError, PersistError, StoreError};
use crate::fanout::{Fanout, FanoutReport, ListEvent};
use crate::lists::{ListItem, ListItemDraft, ListService};
use crate::model::{Effort, ReasoningModel};
use crate::models::{Mapping, ParsedItem, ParsedResult, RawSubmission, SourceHint, MAPPING_METHOD_MODEL};
use crate::parse::{self, normalize_language, ProductListDetection};
use crate::prompt::{PromptAssembler, PromptKind};
use crate::scope::CallScope;
use crate::store::TrainingStore;

/// `raw_submissions.raw_text` is VARCHAR(255).
pub const RAW_TEXT_LIMIT: usize = 255;

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub text: String,
    /// Empty means "detect".
    pub language: String,
    pub submitter_id: Uuid,
    pub list_id: Uuid,
    /// Family to notify; `None` skips fanout.
    pub family_id: Option<Uuid>,
    pub source: SourceHint,
}

#[derive(Debug)]
pub struct IngestOutcome {
    /// Language the items were parsed and stored under.
    pub language: String,
    /// Persisted items in model order, with `raw_id`/`parsed_id` attached.
    pub items: Vec<ParsedResult>,
    pub list_items: Vec<ListItem>,
    /// Names that were parsed but could not be persisted or listed.
    pub failed: Vec<String>,
    /// Background fanout task, if any events were published.
    pub fanout: Option<JoinHandle<FanoutReport>>,
}

pub struct Ingestor {
    model: Arc<dyn ReasoningModel>,
    prompts: PromptAssembler,
    catalog: Arc<dyn CatalogReader>,
    store: Arc<dyn TrainingStore>,
    lists: Arc<dyn ListService>,
    fanout: Option<Fanout>,
    threshold: f64,
    effort: Effort,
}

impl Ingestor {
    pub fn new(
        model: Arc<dyn ReasoningModel>,
        prompts: PromptAssembler,
        catalog: Arc<dyn CatalogReader>,
        store: Arc<dyn TrainingStore>,
        lists: Arc<dyn ListService>,
    ) -> Self {
        Self {
            model,
            prompts,
            catalog,
            store,
            lists,
            fanout: None,
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            effort: Effort::default(),
        }
    }

    /// Apply `[ingest]` and `[model]` settings.
    pub fn configured(self, config: &Config) -> Self {
        self.with_threshold(config.ingest.confidence_threshold)
            .with_effort(config.model.reasoning_effort)
    }

    pub fn with_fanout(mut self, fanout: Fanout) -> Self {
        self.fanout = Some(fanout);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_effort(mut self, effort: Effort) -> Self {
        self.effort = effort;
        self
    }

    pub async fn ingest(&self, req: &IngestRequest, scope: &CallScope) -> Result<IngestOutcome, IngestError> {
        let text = req.text.trim();
        if text.is_empty() {
            return Err(IngestError::EmptyInput);
        }

        let mut language = normalize_language(&req.language);
        if language.is_empty() {
            match self.detect_language(text, scope).await {
                Ok(tag) => language = tag,
                Err(e) => {
                    tracing::warn!(error = %e, "language detection failed, continuing without a language");
                }
            }
        }

        let catalog = match scope.store(self.catalog.list_all()).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "catalog unavailable, building prompt without it");
                Vec::new()
            }
        };

        let prompt = self
            .prompts
            .build(PromptKind::MultiItem, text, &language, &catalog)?;
        let reply = self.model.invoke(&prompt, self.effort, scope).await?;
        let candidates = parse::parse_multi(&reply.text)?;
        let parsed_count = candidates.len();

        let kept = filter_by_confidence(dedupe(candidates), self.threshold);

        tracing::info!(
            model = self.model.model_name(),
            language = %language,
            parsed = parsed_count,
            kept = kept.len(),
            usage_tokens = reply.usage_tokens,
            "model parse complete"
        );

        let mut items = Vec::with_capacity(kept.len());
        let mut failed = Vec::new();

        for mut item in kept {
            if scope.is_cancelled() {
                return Err(IngestError::Cancelled {
                    persisted: items.len(),
                });
            }

            let raw_text = item.standardized_name.clone();
            match self
                .persist_item(&mut item, &raw_text, &language, req.submitter_id, req.source, scope)
                .await
            {
                Ok(()) => items.push(item),
                Err(e) if e.is_cancelled() => {
                    return Err(IngestError::Cancelled {
                        persisted: items.len(),
                    })
                }
                Err(e) => {
                    tracing::warn!(item = %item.standardized_name, error = %e, "skipping item");
                    failed.push(item.standardized_name);
                }
            }
        }

        let drafts: Vec<ListItemDraft> = items.iter().map(ListItemDraft::from).collect();
        let mut list_items = Vec::new();
        if !drafts.is_empty() {
            match scope
                .store(self.lists.add_items(req.list_id, &drafts, req.submitter_id))
                .await
            {
                Ok(added) => {
                    list_items = added.added;
                    failed.extend(added.failed);
                }
                Err(StoreError::Cancelled) => {
                    return Err(IngestError::Cancelled {
                        persisted: items.len(),
                    })
                }
                Err(e) => {
                    tracing::warn!(list_id = %req.list_id, error = %e, "failed to add items to list");
                    failed.extend(drafts.into_iter().map(|d| d.display_name));
                }
            }
        }

        let events: Vec<ListEvent> = list_items.iter().map(ListEvent::item_added).collect();
        let fanout = self.publish(req.family_id, req.submitter_id, events, scope);

        tracing::info!(
            stored = items.len(),
            listed = list_items.len(),
            failed = failed.len(),
            "ingestion complete"
        );

        Ok(IngestOutcome {
            language,
            items,
            list_items,
            failed,
            fanout,
        })
    }

    /// Write the raw row for `raw_text`, upsert the parsed row, and link them.
    async fn persist_item(
        &self,
        item: &mut ParsedResult,
        raw_text: &str,
        language: &str,
        user_id: Uuid,
        source: SourceHint,
        scope: &CallScope,
    ) -> Result<(), PersistError> {
        let raw_len = raw_text.chars().count();
        if raw_len > RAW_TEXT_LIMIT {
            return Err(PersistError::NameTooLong(raw_len));
        }

        let raw = RawSubmission {
            id: Uuid::new_v4(),
            raw_text: raw_text.to_string(),
            language_code: language.to_string(),
            quantity_raw: item.quantity_display(),
            user_id,
            source,
            created_at: chrono::Utc::now().timestamp(),
        };
        scope
            .store(self.store.insert_raw(&raw))
            .await
            .map_err(PersistError::Raw)?;

        let candidate = ParsedItem {
            id: Uuid::new_v4(),
            standardized_name: item.standardized_name.clone(),
            category: item.category.clone(),
            subcategory: item.subcategory.clone(),
            quantity_value: item.quantity_value,
            quantity_unit: item.quantity_unit.clone(),
            notes: item.notes.clone(),
            language_code: language.to_string(),
            confidence: item.confidence,
        };
        let parsed = scope
            .store(self.store.upsert_parsed(&candidate))
            .await
            .map_err(PersistError::Parsed)?;

        let mapping = Mapping {
            raw_id: raw.id,
            parsed_id: parsed.id,
            method: MAPPING_METHOD_MODEL.to_string(),
            validated: false,
        };
        if let Err(e) = scope.store(self.store.upsert_mapping(&mapping)).await {
            let e = PersistError::Mapping(e);
            tracing::warn!(raw_id = %raw.id, parsed_id = %parsed.id, error = %e, "mapping not recorded");
        }

        item.raw_id = Some(raw.id);
        item.parsed_id = Some(parsed.id);
        Ok(())
    }

    fn publish(
        &self,
        family_id: Option<Uuid>,
        actor: Uuid,
        events: Vec<ListEvent>,
        scope: &CallScope,
    ) -> Option<JoinHandle<FanoutReport>> {
        match (&self.fanout, family_id) {
            (Some(fanout), Some(family_id)) if !events.is_empty() => {
                Some(fanout.publish(family_id, actor, events, scope.token().child_token()))
            }
            _ => None,
        }
    }

    /// Mark a list item completed and notify the family.
    pub async fn complete_item(
        &self,
        item_id: Uuid,
        actor: Uuid,
        family_id: Option<Uuid>,
        scope: &CallScope,
    ) -> Result<(ListItem, Option<JoinHandle<FanoutReport>>), StoreError> {
        let item = scope.store(self.lists.complete_item(item_id, actor)).await?;
        let handle = self.publish(family_id, actor, vec![ListEvent::item_completed(&item, actor)], scope);
        Ok((item, handle))
    }

    /// Ask the model for the language of `text`.
    pub async fn detect_language(&self, text: &str, scope: &CallScope) -> Result<String, IngestError> {
        let prompt = self.prompts.build(PromptKind::LanguageDetect, text, "", &[])?;
        let reply = self.model.invoke(&prompt, Effort::Low, scope).await?;
        parse::parse_language_tag(&reply.text)
            .map(|tag| normalize_language(&tag))
            .ok_or_else(|| {
            IngestError::Parse(ParseError::Schema(format!(
                "not a language tag: {:?}",
                reply.text.trim()
            )))
        })
    }

    /// Ask the model whether `text` is a shopping list.
    pub async fn detect_product_list(
        &self,
        text: &str,
        scope: &CallScope,
    ) -> Result<ProductListDetection, IngestError> {
        let prompt = self
            .prompts
            .build(PromptKind::ProductListDetect, text, "", &[])?;
        let reply = self.model.invoke(&prompt, Effort::Low, scope).await?;
        Ok(parse::parse_product_list_detection(&reply.text)?)
    }

    /// Parse `text` as exactly one item. Nothing is persisted.
    pub async fn parse_single_item(
        &self,
        text: &str,
        language: &str,
        scope: &CallScope,
    ) -> Result<ParsedResult, IngestError> {
        let prompt = self
            .prompts
            .build(PromptKind::SingleItem, text, &normalize_language(language), &[])?;
        let reply = self.model.invoke(&prompt, self.effort, scope).await?;
        Ok(parse::parse_single(&reply.text)?)
    }

    /// Parse one item, reusing the result of an earlier identical submission.
    ///
    /// A raw row with the same text and language that is mapped to a parsed
    /// item answers without a model call. Otherwise the text is parsed and
    /// stored as a raw row holding the submitted text, a parsed upsert, and a
    /// mapping.
    pub async fn get_or_create_single(
        &self,
        text: &str,
        language: &str,
        user_id: Uuid,
        scope: &CallScope,
    ) -> Result<ParsedResult, IngestError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(IngestError::EmptyInput);
        }
        let language = normalize_language(language);

        match scope.store(self.store.find_mapped_parsed(text, &language)).await {
            Ok(Some((raw_id, parsed))) => {
                tracing::debug!(item = %parsed.standardized_name, "reusing parsed item");
                return Ok(ParsedResult {
                    standardized_name: parsed.standardized_name,
                    category: parsed.category,
                    subcategory: parsed.subcategory,
                    quantity_value: parsed.quantity_value,
                    quantity_unit: parsed.quantity_unit,
                    notes: parsed.notes,
                    confidence: parsed.confidence,
                    raw_id: Some(raw_id),
                    parsed_id: Some(parsed.id),
                });
            }
            Ok(None) => {}
            Err(StoreError::Cancelled) => return Err(IngestError::Cancelled { persisted: 0 }),
            Err(e) => {
                tracing::warn!(error = %e, "parsed item lookup failed, parsing afresh");
            }
        }

        let mut item = self.parse_single_item(text, &language, scope).await?;
        match self
            .persist_item(&mut item, text, &language, user_id, SourceHint::Keyboard, scope)
            .await
        {
            Ok(()) => Ok(item),
            Err(e) if e.is_cancelled() => Err(IngestError::Cancelled { persisted: 0 }),
            Err(e) => Err(IngestError::Persist(e)),
        }
    }
}

/// Keep candidates at or above `threshold`, folding the rest into the first
/// kept item's notes. With nothing above the threshold, keep the single most
/// confident candidate (first on ties).
pub fn filter_by_confidence(items: Vec<ParsedResult>, threshold: f64) -> Vec<ParsedResult> {
    let (mut high, low): (Vec<_>, Vec<_>) = items
        .into_iter()
        .partition(|r| r.confidence >= threshold);

    if high.is_empty() {
        return low
            .into_iter()
            .reduce(|best, r| if r.confidence > best.confidence { r } else { best })
            .into_iter()
            .collect();
    }

    if !low.is_empty() {
        let mut notes: Vec<String> = Vec::with_capacity(low.len() + 1);
        if let Some(prior) = high[0].notes.take().filter(|n| !n.trim().is_empty()) {
            notes.push(prior);
        }
        notes.extend(low.into_iter().map(|r| r.standardized_name));
        high[0].notes = Some(notes.join(", "));
    }

    high
}

/// Drop repeated names (case- and whitespace-insensitive), keeping the first.
pub fn dedupe(items: Vec<ParsedResult>) -> Vec<ParsedResult> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|r| seen.insert(r.standardized_name.trim().to_lowercase()))
        .collect()
}

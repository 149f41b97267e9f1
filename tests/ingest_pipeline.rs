//! End-to-end ingestion tests against a temp SQLite database, the shipped
//! prompt templates, and a scripted model.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use basket::catalog::{CatalogReader, SqliteCatalog};
use basket::config::{load_config, Config};
use basket::error::{
    FanoutError, IngestError, IntakeError, ModelError, ParseError, PromptError, StoreError,
};
use basket::fanout::{Fanout, ListEvent, Notifier, SqliteFamilyDirectory};
use basket::ingest::{IngestRequest, Ingestor};
use basket::intake::{ingest_voice, AudioCodec, SpeechClient, Transcript};
use basket::lists::{ListService, SqliteListService};
use basket::model::{Effort, ModelReply, ReasoningModel};
use basket::models::{CatalogEntry, Mapping, ParsedItem, RawSubmission, SourceHint};
use basket::prompt::PromptAssembler;
use basket::scope::CallScope;
use basket::store::{SqliteStore, TrainingStore};
use basket::{db, migrate};

// ============ Fakes ============

/// Replies from a fixed script, recording every prompt it was sent.
#[derive(Default)]
struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn prompt(&self, i: usize) -> String {
        self.prompts.lock().unwrap()[i].clone()
    }
}

#[async_trait]
impl ReasoningModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn invoke(
        &self,
        prompt: &str,
        _effort: Effort,
        _scope: &CallScope,
    ) -> Result<ModelReply, ModelError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let text = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ModelError::Transport("script exhausted".to_string()))?;
        Ok(ModelReply {
            text,
            usage_tokens: 42,
        })
    }
}

/// Cancels the scope right after the first mapping is written.
struct CancelAfterFirstItem {
    inner: SqliteStore,
    cancel: CancellationToken,
}

#[async_trait]
impl TrainingStore for CancelAfterFirstItem {
    async fn insert_raw(&self, raw: &RawSubmission) -> Result<(), StoreError> {
        self.inner.insert_raw(raw).await
    }

    async fn find_parsed(&self, name: &str, lang: &str) -> Result<ParsedItem, StoreError> {
        self.inner.find_parsed(name, lang).await
    }

    async fn insert_parsed(&self, item: &ParsedItem) -> Result<(), StoreError> {
        self.inner.insert_parsed(item).await
    }

    async fn find_mapped_parsed(
        &self,
        raw_text: &str,
        lang: &str,
    ) -> Result<Option<(Uuid, ParsedItem)>, StoreError> {
        self.inner.find_mapped_parsed(raw_text, lang).await
    }

    async fn upsert_mapping(&self, mapping: &Mapping) -> Result<(), StoreError> {
        let res = self.inner.upsert_mapping(mapping).await;
        self.cancel.cancel();
        res
    }
}

/// Fails raw inserts for one name and every mapping write.
struct FlakyStore {
    inner: SqliteStore,
    reject_raw: &'static str,
    mapping_attempts: AtomicUsize,
}

#[async_trait]
impl TrainingStore for FlakyStore {
    async fn insert_raw(&self, raw: &RawSubmission) -> Result<(), StoreError> {
        if raw.raw_text == self.reject_raw {
            return Err(StoreError::TransientConnection("connection reset".to_string()));
        }
        self.inner.insert_raw(raw).await
    }

    async fn find_parsed(&self, name: &str, lang: &str) -> Result<ParsedItem, StoreError> {
        self.inner.find_parsed(name, lang).await
    }

    async fn insert_parsed(&self, item: &ParsedItem) -> Result<(), StoreError> {
        self.inner.insert_parsed(item).await
    }

    async fn find_mapped_parsed(
        &self,
        raw_text: &str,
        lang: &str,
    ) -> Result<Option<(Uuid, ParsedItem)>, StoreError> {
        self.inner.find_mapped_parsed(raw_text, lang).await
    }

    async fn upsert_mapping(&self, _mapping: &Mapping) -> Result<(), StoreError> {
        self.mapping_attempts.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Other("mappings table locked".to_string()))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(Uuid, ListEvent)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, user_id: Uuid, event: &ListEvent) -> Result<(), FanoutError> {
        self.sent.lock().unwrap().push((user_id, event.clone()));
        Ok(())
    }
}

struct FixedSpeech(&'static str, &'static str);

#[async_trait]
impl SpeechClient for FixedSpeech {
    async fn transcribe(
        &self,
        _audio: &[u8],
        _codec: AudioCodec,
        _language_hint: &str,
    ) -> Result<Transcript, IntakeError> {
        Ok(Transcript {
            text: self.0.to_string(),
            detected_language: self.1.to_string(),
        })
    }
}

// ============ Harness ============

struct Env {
    _tmp: TempDir,
    cfg: Config,
    pool: SqlitePool,
}

fn prompts() -> PromptAssembler {
    PromptAssembler::new(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("prompts"))
}

async fn setup() -> Env {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("basket.toml");
    fs::write(
        &config_path,
        format!(
            "[db]\npath = \"{}/data/basket.sqlite\"\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let cfg = load_config(&config_path).unwrap();
    migrate::run_migrations(&cfg).await.unwrap();
    let pool = db::connect(&cfg).await.unwrap();
    Env {
        _tmp: tmp,
        cfg,
        pool,
    }
}

fn ingestor(env: &Env, model: Arc<ScriptedModel>) -> Ingestor {
    ingestor_with_store(env, model, Arc::new(SqliteStore::new(env.pool.clone())))
}

fn ingestor_with_store(
    env: &Env,
    model: Arc<ScriptedModel>,
    store: Arc<dyn TrainingStore>,
) -> Ingestor {
    Ingestor::new(
        model,
        prompts(),
        Arc::new(SqliteCatalog::new(env.pool.clone())),
        store,
        Arc::new(SqliteListService::new(env.pool.clone())),
    )
    .configured(&env.cfg)
}

fn request(text: &str, language: &str) -> IngestRequest {
    IngestRequest {
        text: text.to_string(),
        language: language.to_string(),
        submitter_id: Uuid::new_v4(),
        list_id: Uuid::new_v4(),
        family_id: None,
        source: SourceHint::Keyboard,
    }
}

async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

const SHOPPING_REPLY: &str = r#"Here are the items:
[
  {"standardized_name": "молоко", "category": "Dairy", "subcategory": "Milk", "quantity_value": 2, "quantity_unit": "л", "confidence_score": 0.95},
  {"standardized_name": "хлеб", "category": "Bakery", "subcategory": "Bread", "confidence_score": 0.9},
  {"standardized_name": "яблоки", "category": "Produce", "subcategory": "Fruit", "quantity_value": 1, "quantity_unit": "кг", "confidence_score": 0.88}
]"#;

// ============ Scenarios ============

#[tokio::test]
async fn test_multi_item_split() {
    let env = setup().await;
    let model = ScriptedModel::new(&[SHOPPING_REPLY]);
    let ingestor = ingestor(&env, model.clone());

    let outcome = ingestor
        .ingest(&request("молоко 2л, хлеб, яблоки 1кг", "ru"), &CallScope::new())
        .await
        .unwrap();

    assert_eq!(model.calls(), 1, "language given, no detection call");
    assert_eq!(outcome.language, "ru");
    let names: Vec<&str> = outcome
        .items
        .iter()
        .map(|r| r.standardized_name.as_str())
        .collect();
    assert_eq!(names, vec!["молоко", "хлеб", "яблоки"]);

    let milk = &outcome.items[0];
    assert_eq!(milk.quantity_value, Some(2.0));
    assert_eq!(milk.quantity_unit.as_deref(), Some("л"));
    assert_eq!(milk.category, "Dairy");
    assert!(outcome.items.iter().all(|r| r.confidence >= 0.8));
    assert!(outcome
        .items
        .iter()
        .all(|r| r.raw_id.is_some() && r.parsed_id.is_some()));

    assert_eq!(count(&env.pool, "raw_submissions").await, 3);
    assert_eq!(count(&env.pool, "parsed_items").await, 3);
    assert_eq!(count(&env.pool, "mappings").await, 3);

    let languages: Vec<String> = sqlx::query_scalar("SELECT DISTINCT language_code FROM parsed_items")
        .fetch_all(&env.pool)
        .await
        .unwrap();
    assert_eq!(languages, vec!["ru".to_string()]);

    assert_eq!(outcome.list_items.len(), 3);
    assert_eq!(outcome.list_items[0].quantity.as_deref(), Some("2 л"));
    assert!(outcome.failed.is_empty());
    assert!(outcome.fanout.is_none());
}

#[tokio::test]
async fn test_every_item_has_a_model_mapping() {
    let env = setup().await;
    let ingestor = ingestor(&env, ScriptedModel::new(&[SHOPPING_REPLY]));

    let outcome = ingestor
        .ingest(&request("молоко 2л, хлеб, яблоки 1кг", "ru"), &CallScope::new())
        .await
        .unwrap();

    for item in &outcome.items {
        let method: String =
            sqlx::query_scalar("SELECT method FROM mappings WHERE raw_id = ? AND parsed_id = ?")
                .bind(item.raw_id.unwrap().to_string())
                .bind(item.parsed_id.unwrap().to_string())
                .fetch_one(&env.pool)
                .await
                .unwrap();
        assert_eq!(method, "model");
    }
}

#[tokio::test]
async fn test_duplicate_folding() {
    let env = setup().await;
    let reply = r#"[
        {"standardized_name": "кролик", "category": "Meat", "confidence_score": 0.9},
        {"standardized_name": "кролик", "category": "Meat", "confidence_score": 0.9}
    ]"#;
    let ingestor = ingestor(&env, ScriptedModel::new(&[reply]));

    let outcome = ingestor
        .ingest(&request("кролик, кролик", "ru"), &CallScope::new())
        .await
        .unwrap();

    assert_eq!(outcome.items.len(), 1);
    assert_eq!(outcome.items[0].standardized_name, "кролик");
    assert_eq!(count(&env.pool, "parsed_items").await, 1);
    assert_eq!(count(&env.pool, "raw_submissions").await, 1);
}

#[tokio::test]
async fn test_low_confidence_demotion() {
    let env = setup().await;
    let reply = r#"[
        {"standardized_name": "milk", "category": "Dairy", "confidence_score": 0.92},
        {"standardized_name": "xyzzy", "category": "Other", "confidence_score": 0.3}
    ]"#;
    let ingestor = ingestor(&env, ScriptedModel::new(&[reply]));

    let outcome = ingestor
        .ingest(&request("milk, xyzzy", "en"), &CallScope::new())
        .await
        .unwrap();

    assert_eq!(outcome.items.len(), 1);
    assert_eq!(outcome.items[0].standardized_name, "milk");
    assert!(outcome.items[0].notes.as_deref().unwrap().contains("xyzzy"));

    let names: Vec<String> = sqlx::query_scalar("SELECT standardized_name FROM parsed_items")
        .fetch_all(&env.pool)
        .await
        .unwrap();
    assert_eq!(names, vec!["milk".to_string()]);

    let notes: Option<String> = sqlx::query_scalar("SELECT notes FROM parsed_items")
        .fetch_one(&env.pool)
        .await
        .unwrap();
    assert!(notes.unwrap().contains("xyzzy"));
}

#[tokio::test]
async fn test_all_low_confidence_keeps_best() {
    let env = setup().await;
    let reply = r#"[
        {"standardized_name": "thing", "confidence_score": 0.2},
        {"standardized_name": "stuff", "confidence_score": 0.45},
        {"standardized_name": "junk", "confidence_score": 0.1}
    ]"#;
    let ingestor = ingestor(&env, ScriptedModel::new(&[reply]));

    let outcome = ingestor
        .ingest(&request("thing stuff junk", "en"), &CallScope::new())
        .await
        .unwrap();

    assert_eq!(outcome.items.len(), 1);
    assert_eq!(outcome.items[0].standardized_name, "stuff");
    assert_eq!(count(&env.pool, "parsed_items").await, 1);
}

#[tokio::test]
async fn test_out_of_range_confidence_is_clamped() {
    let env = setup().await;
    let reply = r#"[{"standardized_name": "milk", "confidence_score": 1.7}]"#;
    let ingestor = ingestor(&env, ScriptedModel::new(&[reply]));

    let outcome = ingestor
        .ingest(&request("milk", "en"), &CallScope::new())
        .await
        .unwrap();

    assert_eq!(outcome.items[0].confidence, 0.5);
}

#[tokio::test]
async fn test_repeat_ingest_reuses_parsed_rows() {
    let env = setup().await;
    let ingestor = ingestor(&env, ScriptedModel::new(&[SHOPPING_REPLY, SHOPPING_REPLY]));

    let first = ingestor
        .ingest(&request("молоко 2л, хлеб, яблоки 1кг", "ru"), &CallScope::new())
        .await
        .unwrap();
    let second = ingestor
        .ingest(&request("молоко 2л, хлеб, яблоки 1кг", "ru"), &CallScope::new())
        .await
        .unwrap();

    let first_ids: Vec<_> = first.items.iter().map(|r| r.parsed_id).collect();
    let second_ids: Vec<_> = second.items.iter().map(|r| r.parsed_id).collect();
    assert_eq!(first_ids, second_ids);

    assert_eq!(count(&env.pool, "parsed_items").await, 3);
    assert_eq!(count(&env.pool, "raw_submissions").await, 6);
    assert_eq!(count(&env.pool, "mappings").await, 6);
}

#[tokio::test]
async fn test_language_aliases_share_parsed_rows() {
    let env = setup().await;
    let ingestor = ingestor(&env, ScriptedModel::new(&[SHOPPING_REPLY, SHOPPING_REPLY]));

    let first = ingestor
        .ingest(&request("молоко 2л, хлеб, яблоки 1кг", "ru"), &CallScope::new())
        .await
        .unwrap();
    let second = ingestor
        .ingest(&request("молоко 2л, хлеб, яблоки 1кг", " Russian "), &CallScope::new())
        .await
        .unwrap();

    assert_eq!(second.language, "ru");
    let first_ids: Vec<_> = first.items.iter().map(|r| r.parsed_id).collect();
    let second_ids: Vec<_> = second.items.iter().map(|r| r.parsed_id).collect();
    assert_eq!(first_ids, second_ids);
    assert_eq!(count(&env.pool, "parsed_items").await, 3);
}

#[tokio::test]
async fn test_low_confidence_repeat_is_folded_not_noted() {
    let env = setup().await;
    let reply = r#"[
        {"standardized_name": "кролик", "category": "Meat", "confidence_score": 0.9},
        {"standardized_name": "кролик", "category": "Meat", "confidence_score": 0.3}
    ]"#;
    let ingestor = ingestor(&env, ScriptedModel::new(&[reply]));

    let outcome = ingestor
        .ingest(&request("кролик, кролик?", "ru"), &CallScope::new())
        .await
        .unwrap();

    assert_eq!(outcome.items.len(), 1);
    assert_eq!(outcome.items[0].notes, None);
}

#[tokio::test]
async fn test_overlong_name_is_skipped_and_sibling_kept() {
    let env = setup().await;
    let fits = "ж".repeat(255);
    let too_long = "щ".repeat(256);
    let reply = format!(
        r#"[
        {{"standardized_name": "{}", "confidence_score": 0.9}},
        {{"standardized_name": "{}", "confidence_score": 0.9}}
    ]"#,
        too_long, fits
    );
    let ingestor = ingestor(&env, ScriptedModel::new(&[reply.as_str()]));

    let outcome = ingestor
        .ingest(&request("long names", "ru"), &CallScope::new())
        .await
        .unwrap();

    assert_eq!(outcome.failed, vec![too_long.clone()]);
    assert_eq!(outcome.items.len(), 1);
    assert_eq!(outcome.items[0].standardized_name, fits);

    let raw_texts: Vec<String> = sqlx::query_scalar("SELECT raw_text FROM raw_submissions")
        .fetch_all(&env.pool)
        .await
        .unwrap();
    assert_eq!(raw_texts, vec![fits.clone()]);
    assert_eq!(count(&env.pool, "parsed_items").await, 1);
}

#[tokio::test]
async fn test_mapping_upsert_refreshes_method_per_pair() {
    let env = setup().await;
    let store = SqliteStore::new(env.pool.clone());

    let raw = RawSubmission {
        id: Uuid::new_v4(),
        raw_text: "молоко".to_string(),
        language_code: "ru".to_string(),
        quantity_raw: None,
        user_id: Uuid::new_v4(),
        source: SourceHint::Keyboard,
        created_at: 0,
    };
    store.insert_raw(&raw).await.unwrap();

    let parsed = |name: &str| ParsedItem {
        id: Uuid::new_v4(),
        standardized_name: name.to_string(),
        category: "Dairy".to_string(),
        subcategory: String::new(),
        quantity_value: None,
        quantity_unit: None,
        notes: None,
        language_code: "ru".to_string(),
        confidence: 0.9,
    };
    let milk = parsed("молоко");
    let kefir = parsed("кефир");
    store.insert_parsed(&milk).await.unwrap();
    store.insert_parsed(&kefir).await.unwrap();

    let mapping = |parsed_id: Uuid, method: &str| Mapping {
        raw_id: raw.id,
        parsed_id,
        method: method.to_string(),
        validated: false,
    };
    store.upsert_mapping(&mapping(milk.id, "model")).await.unwrap();
    store.upsert_mapping(&mapping(milk.id, "manual")).await.unwrap();

    let methods: Vec<String> = sqlx::query_scalar("SELECT method FROM mappings")
        .fetch_all(&env.pool)
        .await
        .unwrap();
    assert_eq!(methods, vec!["manual".to_string()]);

    store.upsert_mapping(&mapping(kefir.id, "model")).await.unwrap();
    assert_eq!(count(&env.pool, "mappings").await, 2);
}

#[tokio::test]
async fn test_unreadable_aliases_keep_the_entry() {
    let env = setup().await;
    let catalog = SqliteCatalog::new(env.pool.clone());
    catalog
        .import(&[CatalogEntry {
            id: Uuid::new_v4(),
            name_en: "milk".to_string(),
            name_ru: "молоко".to_string(),
            name_uk: "молоко".to_string(),
            category: "dairy".to_string(),
            subcategory: "milk".to_string(),
            aliases: vec!["молочко".to_string()],
        }])
        .await
        .unwrap();
    sqlx::query("UPDATE catalog_entries SET aliases_json = '{not json'")
        .execute(&env.pool)
        .await
        .unwrap();

    let entries = catalog.list_all().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name_en, "milk");
    assert!(entries[0].aliases.is_empty());
}

#[tokio::test]
async fn test_language_detected_when_missing() {
    let env = setup().await;
    let model = ScriptedModel::new(&["\"RU\".", SHOPPING_REPLY]);
    let ingestor = ingestor(&env, model.clone());

    let outcome = ingestor
        .ingest(&request("молоко 2л, хлеб, яблоки 1кг", ""), &CallScope::new())
        .await
        .unwrap();

    assert_eq!(model.calls(), 2);
    assert!(model.prompt(0).contains("молоко 2л, хлеб, яблоки 1кг"));
    assert!(model.prompt(1).contains("Language: ru"));
    assert_eq!(outcome.language, "ru");
}

#[tokio::test]
async fn test_failed_detection_continues_without_language() {
    let env = setup().await;
    let model = ScriptedModel::new(&["I cannot tell, sorry!", SHOPPING_REPLY]);
    let ingestor = ingestor(&env, model.clone());

    let outcome = ingestor
        .ingest(&request("молоко 2л, хлеб, яблоки 1кг", ""), &CallScope::new())
        .await
        .unwrap();

    assert_eq!(outcome.language, "");
    assert!(model.prompt(1).contains("Language: auto"));
    assert_eq!(outcome.items.len(), 3);
}

#[tokio::test]
async fn test_catalog_steers_multi_item_prompt() {
    let env = setup().await;
    SqliteCatalog::new(env.pool.clone())
        .import(&[CatalogEntry {
            id: Uuid::new_v4(),
            name_en: "milk".to_string(),
            name_ru: "молоко".to_string(),
            name_uk: "молоко".to_string(),
            category: "dairy".to_string(),
            subcategory: "milk".to_string(),
            aliases: vec!["молочко".to_string()],
        }])
        .await
        .unwrap();

    let model = ScriptedModel::new(&[SHOPPING_REPLY]);
    let ingestor = ingestor(&env, model.clone());
    ingestor
        .ingest(&request("молочко", "ru"), &CallScope::new())
        .await
        .unwrap();

    let prompt = model.prompt(0);
    assert!(prompt.contains("PRODUCT REFERENCE TABLE"));
    assert!(prompt.contains("=== dairy ==="));
    assert!(prompt.contains("молочко"));
}

#[tokio::test]
async fn test_empty_input_makes_no_model_call() {
    let env = setup().await;
    let model = ScriptedModel::new(&[]);
    let ingestor = ingestor(&env, model.clone());

    let err = ingestor
        .ingest(&request("   ", "en"), &CallScope::new())
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::EmptyInput));
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_unparseable_reply_writes_nothing() {
    let env = setup().await;
    let ingestor = ingestor(&env, ScriptedModel::new(&["Sorry, I can't help with that."]));

    let err = ingestor
        .ingest(&request("milk", "en"), &CallScope::new())
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Parse(ParseError::NoJson { .. })));
    assert_eq!(count(&env.pool, "raw_submissions").await, 0);
    assert_eq!(count(&env.pool, "list_items").await, 0);
}

#[tokio::test]
async fn test_empty_name_is_schema_error() {
    let env = setup().await;
    let ingestor = ingestor(
        &env,
        ScriptedModel::new(&[r#"[{"standardized_name": "", "confidence_score": 0.9}]"#]),
    );

    let err = ingestor
        .ingest(&request("milk", "en"), &CallScope::new())
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Parse(ParseError::Schema(_))));
}

#[tokio::test]
async fn test_cancellation_mid_persistence_keeps_written_rows() {
    let env = setup().await;
    let cancel = CancellationToken::new();
    let store = Arc::new(CancelAfterFirstItem {
        inner: SqliteStore::new(env.pool.clone()),
        cancel: cancel.clone(),
    });
    let ingestor = ingestor_with_store(&env, ScriptedModel::new(&[SHOPPING_REPLY]), store);

    let err = ingestor
        .ingest(
            &request("молоко 2л, хлеб, яблоки 1кг", "ru"),
            &CallScope::with_cancel(cancel),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Cancelled { persisted: 1 }));
    assert_eq!(count(&env.pool, "raw_submissions").await, 1);
    assert_eq!(count(&env.pool, "parsed_items").await, 1);
    assert_eq!(count(&env.pool, "mappings").await, 1);
    assert_eq!(count(&env.pool, "list_items").await, 0);
}

#[tokio::test]
async fn test_item_failures_are_skipped_and_mapping_failures_logged() {
    let env = setup().await;
    let store = Arc::new(FlakyStore {
        inner: SqliteStore::new(env.pool.clone()),
        reject_raw: "хлеб",
        mapping_attempts: AtomicUsize::new(0),
    });
    let ingestor = ingestor_with_store(&env, ScriptedModel::new(&[SHOPPING_REPLY]), store.clone());

    let outcome = ingestor
        .ingest(&request("молоко 2л, хлеб, яблоки 1кг", "ru"), &CallScope::new())
        .await
        .unwrap();

    let names: Vec<&str> = outcome
        .items
        .iter()
        .map(|r| r.standardized_name.as_str())
        .collect();
    assert_eq!(names, vec!["молоко", "яблоки"]);
    assert_eq!(outcome.failed, vec!["хлеб".to_string()]);
    assert_eq!(store.mapping_attempts.load(Ordering::SeqCst), 2);
    assert_eq!(count(&env.pool, "mappings").await, 0);
    assert_eq!(outcome.list_items.len(), 2);
}

#[tokio::test]
async fn test_fanout_reaches_family_except_actor() {
    let env = setup().await;
    let family = Uuid::new_v4();
    let actor = Uuid::new_v4();
    let partner = Uuid::new_v4();
    let child = Uuid::new_v4();
    for (i, user) in [actor, partner, child].iter().enumerate() {
        sqlx::query("INSERT INTO family_members (family_id, user_id, role, joined_at) VALUES (?, ?, 'member', ?)")
            .bind(family.to_string())
            .bind(user.to_string())
            .bind(i as i64)
            .execute(&env.pool)
            .await
            .unwrap();
    }

    let notifier = Arc::new(RecordingNotifier::default());
    let fanout = Fanout::new(
        Arc::new(SqliteFamilyDirectory::new(env.pool.clone())),
        notifier.clone(),
    );
    let ingestor = ingestor(&env, ScriptedModel::new(&[SHOPPING_REPLY])).with_fanout(fanout);

    let mut req = request("молоко 2л, хлеб, яблоки 1кг", "ru");
    req.submitter_id = actor;
    req.family_id = Some(family);

    let outcome = ingestor.ingest(&req, &CallScope::new()).await.unwrap();
    let report = outcome.fanout.expect("fanout published").await.unwrap();

    assert_eq!(report.recipients, 2);
    assert_eq!(report.delivered, 6);
    assert_eq!(report.failed, 0);

    let sent = notifier.sent.lock().unwrap();
    assert!(sent.iter().all(|(user, _)| *user != actor));
    let list_ids: Vec<Uuid> = outcome.list_items.iter().map(|i| i.id).collect();
    assert!(sent.iter().all(|(_, event)| list_ids.contains(&event.item_id())));
}

#[tokio::test]
async fn test_complete_item_notifies_family() {
    let env = setup().await;
    let family = Uuid::new_v4();
    let adder = Uuid::new_v4();
    let shopper = Uuid::new_v4();
    for user in [adder, shopper] {
        sqlx::query("INSERT INTO family_members (family_id, user_id, role, joined_at) VALUES (?, ?, 'member', 0)")
            .bind(family.to_string())
            .bind(user.to_string())
            .execute(&env.pool)
            .await
            .unwrap();
    }

    let notifier = Arc::new(RecordingNotifier::default());
    let fanout = Fanout::new(
        Arc::new(SqliteFamilyDirectory::new(env.pool.clone())),
        notifier.clone(),
    );
    let ingestor = ingestor(&env, ScriptedModel::new(&[SHOPPING_REPLY])).with_fanout(fanout);

    let mut req = request("молоко 2л, хлеб, яблоки 1кг", "ru");
    req.submitter_id = adder;
    let outcome = ingestor.ingest(&req, &CallScope::new()).await.unwrap();
    let milk = outcome.list_items[0].clone();

    let (done, handle) = ingestor
        .complete_item(milk.id, shopper, Some(family), &CallScope::new())
        .await
        .unwrap();
    assert!(done.completed);
    assert_eq!(done.completed_by, Some(shopper));

    let report = handle.expect("fanout published").await.unwrap();
    assert_eq!(report.delivered, 1);
    let sent = notifier.sent.lock().unwrap();
    assert_eq!(sent[0].0, adder);
    assert!(matches!(sent[0].1, ListEvent::ItemCompleted { .. }));

    let items = SqliteListService::new(env.pool.clone())
        .get_items(req.list_id)
        .await
        .unwrap();
    assert_eq!(items.len(), 3);
    assert!(items[0].completed);
    assert!(!items[1].completed);
}

#[tokio::test]
async fn test_complete_unknown_item_is_not_found() {
    let env = setup().await;
    let ingestor = ingestor(&env, ScriptedModel::new(&[]));

    let err = ingestor
        .complete_item(Uuid::new_v4(), Uuid::new_v4(), None, &CallScope::new())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound));
}

#[tokio::test]
async fn test_detect_product_list() {
    let env = setup().await;
    let reply = r#"{"is_product_list": true, "confidence": 0.93, "detected_items_count": 3, "sample_items": ["молоко", "хлеб"]}"#;
    let ingestor = ingestor(&env, ScriptedModel::new(&[reply]));

    let detection = ingestor
        .detect_product_list("молоко, хлеб, яблоки", &CallScope::new())
        .await
        .unwrap();
    assert!(detection.is_product_list);
    assert_eq!(detection.detected_items_count, 3);
    assert_eq!(detection.sample_items, vec!["молоко", "хлеб"]);
}

#[tokio::test]
async fn test_parse_single_item_persists_nothing() {
    let env = setup().await;
    let reply = r#"{"standardized_name": "tomatoes", "category": "produce", "quantity_value": "1,5", "quantity_unit": "kg", "confidence_score": 0.9}"#;
    let ingestor = ingestor(&env, ScriptedModel::new(&[reply]));

    let item = ingestor
        .parse_single_item("tomatos 1.5kg", "en", &CallScope::new())
        .await
        .unwrap();
    assert_eq!(item.standardized_name, "tomatoes");
    assert_eq!(item.quantity_value, Some(1.5));
    assert_eq!(count(&env.pool, "parsed_items").await, 0);
}

#[tokio::test]
async fn test_single_item_is_stored_then_reused() {
    let env = setup().await;
    let reply = r#"{"standardized_name": "tomatoes", "category": "produce", "quantity_value": 1.5, "quantity_unit": "kg", "confidence_score": 0.9}"#;
    let model = ScriptedModel::new(&[reply]);
    let ingestor = ingestor(&env, model.clone());
    let user = Uuid::new_v4();

    let first = ingestor
        .get_or_create_single(" tomatos 1.5kg ", "en", user, &CallScope::new())
        .await
        .unwrap();
    assert_eq!(model.calls(), 1);
    assert_eq!(first.standardized_name, "tomatoes");
    assert!(first.raw_id.is_some() && first.parsed_id.is_some());

    let raw_texts: Vec<String> = sqlx::query_scalar("SELECT raw_text FROM raw_submissions")
        .fetch_all(&env.pool)
        .await
        .unwrap();
    assert_eq!(raw_texts, vec!["tomatos 1.5kg".to_string()]);
    assert_eq!(count(&env.pool, "parsed_items").await, 1);
    assert_eq!(count(&env.pool, "mappings").await, 1);

    let again = ingestor
        .get_or_create_single("tomatos 1.5kg", "ENG", Uuid::new_v4(), &CallScope::new())
        .await
        .unwrap();
    assert_eq!(model.calls(), 1, "mapped raw text must not call the model");
    assert_eq!(again.parsed_id, first.parsed_id);
    assert_eq!(again.raw_id, first.raw_id);
    assert_eq!(again.quantity_value, Some(1.5));
    assert_eq!(count(&env.pool, "raw_submissions").await, 1);
}

#[tokio::test]
async fn test_single_item_language_is_part_of_the_lookup() {
    let env = setup().await;
    let en = r#"{"standardized_name": "milk", "confidence_score": 0.9}"#;
    let ru = r#"{"standardized_name": "молоко", "confidence_score": 0.9}"#;
    let model = ScriptedModel::new(&[en, ru]);
    let ingestor = ingestor(&env, model.clone());

    ingestor
        .get_or_create_single("moloko", "en", Uuid::new_v4(), &CallScope::new())
        .await
        .unwrap();
    let other = ingestor
        .get_or_create_single("moloko", "ru", Uuid::new_v4(), &CallScope::new())
        .await
        .unwrap();

    assert_eq!(model.calls(), 2);
    assert_eq!(other.standardized_name, "молоко");
    assert_eq!(count(&env.pool, "parsed_items").await, 2);
}

#[tokio::test]
async fn test_single_item_empty_text_makes_no_call() {
    let env = setup().await;
    let model = ScriptedModel::new(&[]);
    let ingestor = ingestor(&env, model.clone());

    let err = ingestor
        .get_or_create_single("  ", "en", Uuid::new_v4(), &CallScope::new())
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::EmptyInput));
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_voice_note_is_ingested_with_detected_language() {
    let env = setup().await;
    let model = ScriptedModel::new(&[SHOPPING_REPLY]);
    let ingestor = ingestor(&env, model.clone());
    let speech = FixedSpeech("  молоко два литра, хлеб и яблоки  ", "ru");

    let outcome = ingest_voice(
        &speech,
        &ingestor,
        b"OggS",
        AudioCodec::Ogg,
        request("", ""),
        &CallScope::new(),
    )
    .await
    .unwrap();

    assert_eq!(model.calls(), 1, "transcriber language skips detection");
    assert!(model.prompt(0).contains("молоко два литра, хлеб и яблоки"));
    assert_eq!(outcome.language, "ru");
    assert_eq!(outcome.items.len(), 3);

    let sources: Vec<String> = sqlx::query_scalar("SELECT DISTINCT source FROM raw_submissions")
        .fetch_all(&env.pool)
        .await
        .unwrap();
    assert_eq!(sources, vec!["voice".to_string()]);
}

#[tokio::test]
async fn test_empty_transcript_is_rejected() {
    let env = setup().await;
    let model = ScriptedModel::new(&[]);
    let ingestor = ingestor(&env, model.clone());

    let err = ingest_voice(
        &FixedSpeech("   ", ""),
        &ingestor,
        b"OggS",
        AudioCodec::Ogg,
        request("", "ru"),
        &CallScope::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, IntakeError::EmptyTranscript));
    assert_eq!(model.calls(), 0);
}

#[test]
fn test_path_traversal_rejected_before_read() {
    let err = prompts().load_template("../etc/passwd").unwrap_err();
    assert!(matches!(err, PromptError::InvalidFilename(_)));
}

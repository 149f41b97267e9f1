//! Training-data persistence: raw submissions, canonical parsed items, and
//! the mappings between them.
//!
//! [`TrainingStore`] is the capability the ingestion pipeline writes through.
//! [`SqliteStore`] is the production implementation; tests wrap or replace
//! it to inject failures.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{Mapping, ParsedItem, RawSubmission};

#[async_trait]
pub trait TrainingStore: Send + Sync {
    async fn insert_raw(&self, raw: &RawSubmission) -> Result<(), StoreError>;

    /// Look up a parsed item by natural key. [`StoreError::NotFound`] if absent.
    async fn find_parsed(
        &self,
        standardized_name: &str,
        language_code: &str,
    ) -> Result<ParsedItem, StoreError>;

    async fn insert_parsed(&self, item: &ParsedItem) -> Result<(), StoreError>;

    /// Latest raw submission with exactly this text and language that has a
    /// mapping, with the parsed item it maps to.
    async fn find_mapped_parsed(
        &self,
        raw_text: &str,
        language_code: &str,
    ) -> Result<Option<(Uuid, ParsedItem)>, StoreError>;

    /// Insert a mapping; on `(raw_id, parsed_id)` conflict refresh the method
    /// and `updated_at`.
    async fn upsert_mapping(&self, mapping: &Mapping) -> Result<(), StoreError>;

    /// Reuse the row for `(standardized_name, language_code)` or insert
    /// `candidate`. Existing rows are never modified.
    async fn upsert_parsed(&self, candidate: &ParsedItem) -> Result<ParsedItem, StoreError> {
        match self
            .find_parsed(&candidate.standardized_name, &candidate.language_code)
            .await
        {
            Ok(existing) => return Ok(existing),
            Err(StoreError::NotFound) => {}
            Err(e) => return Err(e),
        }

        match self.insert_parsed(candidate).await {
            Ok(()) => Ok(candidate.clone()),
            // Lost a race with a concurrent insert of the same key
            Err(StoreError::UniqueViolation(_)) => {
                self.find_parsed(&candidate.standardized_name, &candidate.language_code)
                    .await
            }
            Err(e) => Err(e),
        }
    }
}

/// Read a UUID stored as TEXT.
pub(crate) fn uuid_column(row: &SqliteRow, column: &str) -> Result<Uuid, StoreError> {
    let text: String = row.try_get(column)?;
    Uuid::parse_str(&text).map_err(|e| StoreError::Other(format!("bad uuid in {}: {}", column, e)))
}

/// Read a nullable UUID column.
pub(crate) fn opt_uuid_column(row: &SqliteRow, column: &str) -> Result<Option<Uuid>, StoreError> {
    let text: Option<String> = row.try_get(column)?;
    text.map(|t| Uuid::parse_str(&t))
        .transpose()
        .map_err(|e| StoreError::Other(format!("bad uuid in {}: {}", column, e)))
}

fn parsed_from_row(row: &SqliteRow) -> Result<ParsedItem, StoreError> {
    Ok(ParsedItem {
        id: uuid_column(row, "id")?,
        standardized_name: row.get("standardized_name"),
        category: row.get("category"),
        subcategory: row.get("subcategory"),
        quantity_value: row.get("quantity_value"),
        quantity_unit: row.get("quantity_unit"),
        notes: row.get("notes"),
        language_code: row.get("language_code"),
        confidence: row.get("confidence"),
    })
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TrainingStore for SqliteStore {
    async fn insert_raw(&self, raw: &RawSubmission) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO raw_submissions
                (id, raw_text, language_code, quantity_raw, user_id, source, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(raw.id.to_string())
        .bind(&raw.raw_text)
        .bind(&raw.language_code)
        .bind(&raw.quantity_raw)
        .bind(raw.user_id.to_string())
        .bind(raw.source.as_str())
        .bind(raw.created_at)
        .bind(raw.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_parsed(
        &self,
        standardized_name: &str,
        language_code: &str,
    ) -> Result<ParsedItem, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, standardized_name, category, subcategory, quantity_value,
                   quantity_unit, notes, language_code, confidence
            FROM parsed_items
            WHERE standardized_name = ? AND language_code = ?
            "#,
        )
        .bind(standardized_name)
        .bind(language_code)
        .fetch_one(&self.pool)
        .await?;

        parsed_from_row(&row)
    }

    async fn find_mapped_parsed(
        &self,
        raw_text: &str,
        language_code: &str,
    ) -> Result<Option<(Uuid, ParsedItem)>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT r.id AS raw_id, p.id, p.standardized_name, p.category, p.subcategory,
                   p.quantity_value, p.quantity_unit, p.notes, p.language_code, p.confidence
            FROM raw_submissions r
            JOIN mappings m ON m.raw_id = r.id
            JOIN parsed_items p ON p.id = m.parsed_id
            WHERE r.raw_text = ? AND r.language_code = ?
            ORDER BY r.created_at DESC, m.updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(raw_text)
        .bind(language_code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Ok((uuid_column(&row, "raw_id")?, parsed_from_row(&row)?)))
            .transpose()
    }

    async fn insert_parsed(&self, item: &ParsedItem) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO parsed_items
                (id, standardized_name, category, subcategory, quantity_value, quantity_unit,
                 notes, language_code, confidence, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.id.to_string())
        .bind(&item.standardized_name)
        .bind(&item.category)
        .bind(&item.subcategory)
        .bind(item.quantity_value)
        .bind(&item.quantity_unit)
        .bind(&item.notes)
        .bind(&item.language_code)
        .bind(item.confidence)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_mapping(&self, mapping: &Mapping) -> Result<(), StoreError> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO mappings (id, raw_id, parsed_id, method, validated, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(raw_id, parsed_id) DO UPDATE SET
                method = excluded.method,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(mapping.raw_id.to_string())
        .bind(mapping.parsed_id.to_string())
        .bind(&mapping.method)
        .bind(mapping.validated)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

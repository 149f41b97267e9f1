//! Product catalog: the reference table rendered into multi-item prompts.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use crate::error::StoreError;
use crate::models::CatalogEntry;
use crate::store::uuid_column;

#[async_trait]
pub trait CatalogReader: Send + Sync {
    async fn list_all(&self) -> Result<Vec<CatalogEntry>, StoreError>;
}

/// Catalog backed by the `catalog_entries` table.
#[derive(Clone)]
pub struct SqliteCatalog {
    pool: SqlitePool,
}

impl SqliteCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update entries, keyed on `(name_en, category)`.
    /// Returns the number of entries written.
    pub async fn import(&self, entries: &[CatalogEntry]) -> Result<usize, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            let aliases = serde_json::to_string(&entry.aliases)
                .map_err(|e| StoreError::Other(e.to_string()))?;
            sqlx::query(
                r#"
                INSERT INTO catalog_entries
                    (id, name_en, name_ru, name_uk, category, subcategory, aliases_json, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(name_en, category) DO UPDATE SET
                    name_ru = excluded.name_ru,
                    name_uk = excluded.name_uk,
                    subcategory = excluded.subcategory,
                    aliases_json = excluded.aliases_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(entry.id.to_string())
            .bind(&entry.name_en)
            .bind(&entry.name_ru)
            .bind(&entry.name_uk)
            .bind(&entry.category)
            .bind(&entry.subcategory)
            .bind(aliases)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(entries.len())
    }
}

#[async_trait]
impl CatalogReader for SqliteCatalog {
    async fn list_all(&self) -> Result<Vec<CatalogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name_en, name_ru, name_uk, category, subcategory, aliases_json
             FROM catalog_entries ORDER BY category, name_en",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let name_en: String = row.get("name_en");
                let aliases_json: String = row.get("aliases_json");
                let aliases = serde_json::from_str(&aliases_json).unwrap_or_else(|e| {
                    tracing::warn!(name = %name_en, error = %e, "ignoring unreadable catalog aliases");
                    Vec::new()
                });
                Ok(CatalogEntry {
                    id: uuid_column(row, "id")?,
                    name_en,
                    name_ru: row.get("name_ru"),
                    name_uk: row.get("name_uk"),
                    category: row.get("category"),
                    subcategory: row.get("subcategory"),
                    aliases,
                })
            })
            .collect()
    }
}

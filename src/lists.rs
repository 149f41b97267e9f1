//! Shopping-list items.
//!
//! The ingestion pipeline hands persisted items to a [`ListService`] as
//! drafts; each draft becomes one `list_items` row. Inserts are per-item so
//! one bad row does not lose the rest of the batch.

use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::ParsedResult;
use crate::store::{opt_uuid_column, uuid_column};

/// An item about to be added to a list.
#[derive(Debug, Clone, PartialEq)]
pub struct ListItemDraft {
    pub display_name: String,
    pub parsed_name: Option<String>,
    pub quantity: Option<String>,
    pub raw_id: Option<Uuid>,
    pub parsed_id: Option<Uuid>,
}

impl From<&ParsedResult> for ListItemDraft {
    /// Display and parsed names are both the standardized name, which stays
    /// in the submission's language.
    fn from(result: &ParsedResult) -> Self {
        Self {
            display_name: result.standardized_name.clone(),
            parsed_name: Some(result.standardized_name.clone()),
            quantity: result.quantity_display(),
            raw_id: result.raw_id,
            parsed_id: result.parsed_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListItem {
    pub id: Uuid,
    pub list_id: Uuid,
    pub display_name: String,
    pub parsed_name: Option<String>,
    pub quantity: Option<String>,
    pub raw_id: Option<Uuid>,
    pub parsed_id: Option<Uuid>,
    pub completed: bool,
    pub added_by: Uuid,
    pub completed_by: Option<Uuid>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
}

/// Outcome of a batch add: rows created and display names that failed.
#[derive(Debug, Clone, Default)]
pub struct AddItemsResult {
    pub added: Vec<ListItem>,
    pub failed: Vec<String>,
}

#[async_trait]
pub trait ListService: Send + Sync {
    async fn add_items(
        &self,
        list_id: Uuid,
        items: &[ListItemDraft],
        actor: Uuid,
    ) -> Result<AddItemsResult, StoreError>;

    /// Mark an item completed. [`StoreError::NotFound`] if no such item.
    async fn complete_item(&self, item_id: Uuid, actor: Uuid) -> Result<ListItem, StoreError>;

    /// Items of a list, oldest first.
    async fn get_items(&self, list_id: Uuid) -> Result<Vec<ListItem>, StoreError>;
}

#[derive(Clone)]
pub struct SqliteListService {
    pool: SqlitePool,
}

impl SqliteListService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert(&self, list_id: Uuid, draft: &ListItemDraft, actor: Uuid) -> Result<ListItem, StoreError> {
        let item = ListItem {
            id: Uuid::new_v4(),
            list_id,
            display_name: draft.display_name.clone(),
            parsed_name: draft.parsed_name.clone(),
            quantity: draft.quantity.clone(),
            raw_id: draft.raw_id,
            parsed_id: draft.parsed_id,
            completed: false,
            added_by: actor,
            completed_by: None,
            completed_at: None,
            created_at: chrono::Utc::now().timestamp(),
        };

        sqlx::query(
            r#"
            INSERT INTO list_items
                (id, list_id, display_name, parsed_name, quantity, raw_id, parsed_id,
                 completed, added_by, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            "#,
        )
        .bind(item.id.to_string())
        .bind(list_id.to_string())
        .bind(&item.display_name)
        .bind(&item.parsed_name)
        .bind(&item.quantity)
        .bind(item.raw_id.map(|id| id.to_string()))
        .bind(item.parsed_id.map(|id| id.to_string()))
        .bind(actor.to_string())
        .bind(item.created_at)
        .bind(item.created_at)
        .execute(&self.pool)
        .await?;

        Ok(item)
    }
}

const SELECT_ITEM: &str = r#"
    SELECT id, list_id, display_name, parsed_name, quantity, raw_id, parsed_id,
           completed, added_by, completed_by, completed_at, created_at
    FROM list_items
"#;

fn row_to_item(row: &SqliteRow) -> Result<ListItem, StoreError> {
    Ok(ListItem {
        id: uuid_column(row, "id")?,
        list_id: uuid_column(row, "list_id")?,
        display_name: row.try_get("display_name")?,
        parsed_name: row.try_get("parsed_name")?,
        quantity: row.try_get("quantity")?,
        raw_id: opt_uuid_column(row, "raw_id")?,
        parsed_id: opt_uuid_column(row, "parsed_id")?,
        completed: row.try_get("completed")?,
        added_by: uuid_column(row, "added_by")?,
        completed_by: opt_uuid_column(row, "completed_by")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ListService for SqliteListService {
    async fn add_items(
        &self,
        list_id: Uuid,
        items: &[ListItemDraft],
        actor: Uuid,
    ) -> Result<AddItemsResult, StoreError> {
        let mut result = AddItemsResult::default();
        for draft in items {
            match self.insert(list_id, draft, actor).await {
                Ok(item) => result.added.push(item),
                Err(e) => {
                    tracing::warn!(item = %draft.display_name, error = %e, "failed to add list item");
                    result.failed.push(draft.display_name.clone());
                }
            }
        }
        Ok(result)
    }

    async fn complete_item(&self, item_id: Uuid, actor: Uuid) -> Result<ListItem, StoreError> {
        let now = chrono::Utc::now().timestamp();
        let updated = sqlx::query(
            r#"
            UPDATE list_items
            SET completed = 1, completed_by = ?, completed_at = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(actor.to_string())
        .bind(now)
        .bind(now)
        .bind(item_id.to_string())
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }

        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_ITEM))
            .bind(item_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        row_to_item(&row)
    }

    async fn get_items(&self, list_id: Uuid) -> Result<Vec<ListItem>, StoreError> {
        let rows = sqlx::query(&format!(
            "{} WHERE list_id = ? ORDER BY created_at, rowid",
            SELECT_ITEM
        ))
        .bind(list_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_item).collect()
    }
}

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an already-open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per canonical-name training sample
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS raw_submissions (
            id TEXT PRIMARY KEY,
            raw_text VARCHAR(255) NOT NULL,
            language_code TEXT NOT NULL DEFAULT '',
            quantity_raw TEXT,
            user_id TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT 'keyboard',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS parsed_items (
            id TEXT PRIMARY KEY,
            standardized_name TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT '',
            subcategory TEXT NOT NULL DEFAULT '',
            quantity_value REAL,
            quantity_unit TEXT,
            notes TEXT,
            language_code TEXT NOT NULL DEFAULT '',
            confidence REAL NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(standardized_name, language_code)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS mappings (
            id TEXT PRIMARY KEY,
            raw_id TEXT NOT NULL,
            parsed_id TEXT NOT NULL,
            method TEXT NOT NULL,
            validated INTEGER NOT NULL DEFAULT 0,
            validated_by TEXT,
            validated_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(raw_id, parsed_id),
            FOREIGN KEY (raw_id) REFERENCES raw_submissions(id),
            FOREIGN KEY (parsed_id) REFERENCES parsed_items(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS translation_cache (
            id TEXT PRIMARY KEY,
            original_item TEXT NOT NULL,
            item_hash TEXT NOT NULL,
            target_locale TEXT NOT NULL,
            ai_response TEXT NOT NULL,
            detected_language TEXT,
            confidence REAL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(item_hash, target_locale)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS catalog_entries (
            id TEXT PRIMARY KEY,
            name_en TEXT NOT NULL,
            name_ru TEXT NOT NULL DEFAULT '',
            name_uk TEXT NOT NULL DEFAULT '',
            category TEXT NOT NULL,
            subcategory TEXT NOT NULL DEFAULT '',
            aliases_json TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(name_en, category)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS list_items (
            id TEXT PRIMARY KEY,
            list_id TEXT NOT NULL,
            display_name TEXT NOT NULL,
            parsed_name TEXT,
            quantity TEXT,
            raw_id TEXT,
            parsed_id TEXT,
            completed INTEGER NOT NULL DEFAULT 0,
            added_by TEXT NOT NULL,
            completed_by TEXT,
            completed_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS family_members (
            family_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'member',
            joined_at INTEGER NOT NULL,
            PRIMARY KEY (family_id, user_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_mappings_parsed_id ON mappings(parsed_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_raw_submissions_user_id ON raw_submissions(user_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_list_items_list_id ON list_items(list_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_catalog_entries_category ON catalog_entries(category)")
        .execute(pool)
        .await?;

    Ok(())
}

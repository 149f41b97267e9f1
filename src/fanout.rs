//! Best-effort delivery of list mutations to family members.
//!
//! Events go to every member of the family except the actor, at most once,
//! on a background task. There are no retries: a failed send is logged and
//! dropped, and if the member list cannot be read the publish is a no-op.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{FanoutError, StoreError};
use crate::lists::ListItem;
use crate::store::uuid_column;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListEvent {
    ItemAdded {
        list_id: Uuid,
        item_id: Uuid,
        actor_id: Uuid,
        display_name: String,
        parsed_name: Option<String>,
        quantity: Option<String>,
    },
    ItemCompleted {
        list_id: Uuid,
        item_id: Uuid,
        actor_id: Uuid,
        display_name: String,
    },
}

impl ListEvent {
    pub fn item_added(item: &ListItem) -> Self {
        ListEvent::ItemAdded {
            list_id: item.list_id,
            item_id: item.id,
            actor_id: item.added_by,
            display_name: item.display_name.clone(),
            parsed_name: item.parsed_name.clone(),
            quantity: item.quantity.clone(),
        }
    }

    pub fn item_completed(item: &ListItem, actor: Uuid) -> Self {
        ListEvent::ItemCompleted {
            list_id: item.list_id,
            item_id: item.id,
            actor_id: actor,
            display_name: item.display_name.clone(),
        }
    }

    pub fn item_id(&self) -> Uuid {
        match self {
            ListEvent::ItemAdded { item_id, .. } | ListEvent::ItemCompleted { item_id, .. } => *item_id,
        }
    }
}

#[async_trait]
pub trait FamilyDirectory: Send + Sync {
    /// Member ids of `family_id`, excluding `except`.
    async fn members_of(&self, family_id: Uuid, except: Uuid) -> Result<Vec<Uuid>, StoreError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, user_id: Uuid, event: &ListEvent) -> Result<(), FanoutError>;
}

/// Reads `family_members`.
#[derive(Clone)]
pub struct SqliteFamilyDirectory {
    pool: SqlitePool,
}

impl SqliteFamilyDirectory {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FamilyDirectory for SqliteFamilyDirectory {
    async fn members_of(&self, family_id: Uuid, except: Uuid) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            "SELECT user_id FROM family_members WHERE family_id = ? AND user_id != ? ORDER BY joined_at",
        )
        .bind(family_id.to_string())
        .bind(except.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(|row| uuid_column(row, "user_id")).collect()
    }
}

/// Writes each event to the log. Used by the operator binary, which has no
/// chat transport.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, user_id: Uuid, event: &ListEvent) -> Result<(), FanoutError> {
        let payload = serde_json::to_string(event).map_err(|e| FanoutError {
            user_id,
            reason: e.to_string(),
        })?;
        tracing::info!(%user_id, event = %payload, "notify");
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FanoutReport {
    pub recipients: usize,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Fanout {
    directory: Arc<dyn FamilyDirectory>,
    notifier: Arc<dyn Notifier>,
}

impl Fanout {
    pub fn new(directory: Arc<dyn FamilyDirectory>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            directory,
            notifier,
        }
    }

    /// Deliver `events` on a background task. The handle may be dropped.
    pub fn publish(
        &self,
        family_id: Uuid,
        actor: Uuid,
        events: Vec<ListEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<FanoutReport> {
        let fanout = self.clone();
        tokio::spawn(async move { fanout.deliver(family_id, actor, &events, &cancel).await })
    }

    pub async fn deliver(
        &self,
        family_id: Uuid,
        actor: Uuid,
        events: &[ListEvent],
        cancel: &CancellationToken,
    ) -> FanoutReport {
        let mut report = FanoutReport::default();
        if events.is_empty() {
            return report;
        }

        let members = tokio::select! {
            biased;
            _ = cancel.cancelled() => return report,
            res = self.directory.members_of(family_id, actor) => res,
        };
        let members = match members {
            Ok(members) => members,
            Err(e) => {
                tracing::debug!(%family_id, error = %e, "could not list family members, skipping fanout");
                return report;
            }
        };
        report.recipients = members.len();

        for user_id in members {
            for event in events {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return report,
                    res = self.notifier.send(user_id, event) => res,
                };
                match sent {
                    Ok(()) => report.delivered += 1,
                    Err(e) => {
                        tracing::warn!(error = %e, item_id = %event.item_id(), "fanout delivery failed");
                        report.failed += 1;
                    }
                }
            }
        }

        report
    }
}

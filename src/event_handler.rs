use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_rusqlite::Connection;
use tracing::{debug, instrument};

use crate::anonymize::anonymize_ip;
use crate::error::AppError;

pub const PROJECT_CLICK: &str = "project_click";
pub const CONTACT_SUBMIT: &str = "contact_submit";

#[derive(Debug, Deserialize)]
pub struct RecordEventInput {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub id: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub ip: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
}

pub struct EventHandler {
    db: Arc<Connection>,
    allowed_types: Vec<String>,
}

impl EventHandler {
    pub fn new(db: Arc<Connection>, allowed_types: Vec<String>) -> Self {
        Self { db, allowed_types }
    }

    pub fn is_allowed(&self, event_type: &str) -> bool {
        self.allowed_types.iter().any(|t| t == event_type)
    }

    /// Validates the type against the allow-list and appends the event.
    /// Nothing is written when validation fails.
    pub async fn record_event(
        &self,
        event_type: Option<&str>,
        raw_ip: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<i64, AppError> {
        let event_type = match event_type {
            Some(t) if self.is_allowed(t) => t.to_string(),
            _ => return Err(AppError::Validation("invalid event type".to_string())),
        };

        let metadata = metadata.filter(|m| !m.is_null()).map(|m| m.to_string());
        let id = self
            .insert_event(event_type, anonymize_ip(raw_ip), metadata, Utc::now().timestamp())
            .await?;
        Ok(id)
    }

    #[instrument(skip(self))]
    pub async fn insert_event(
        &self,
        event_type: String,
        ip: String,
        metadata: Option<String>,
        created_at: i64,
    ) -> Result<i64, tokio_rusqlite::Error> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO events (type, ip, metadata, created_at)
                     VALUES (?1, ?2, ?3, ?4) RETURNING id",
                )?;
                let id = stmt.query_row(
                    params![event_type, ip, metadata, created_at],
                    |row| row.get(0),
                )?;
                debug!("Stored {} event {}", event_type, id);
                Ok(id)
            })
            .await
    }

    #[cfg(test)]
    pub(crate) async fn get_event(&self, id: i64) -> Result<Option<EventRecord>, tokio_rusqlite::Error> {
        self.db
            .call(move |conn| {
                let result = conn.query_row(
                    "SELECT id, type, ip, metadata, created_at FROM events WHERE id = ?1",
                    params![id],
                    |row| {
                        let metadata: Option<String> = row.get(3)?;
                        Ok(EventRecord {
                            id: row.get(0)?,
                            event_type: row.get(1)?,
                            ip: row.get(2)?,
                            metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                            created_at: row.get(4)?,
                        })
                    },
                );

                match result {
                    Ok(event) => Ok(Some(event)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(tokio_rusqlite::Error::from(e)),
                }
            })
            .await
    }

    #[cfg(test)]
    pub(crate) async fn event_count(&self) -> Result<i64, tokio_rusqlite::Error> {
        self.db
            .call(|conn| {
                let count = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
    }
}

use chrono::Utc;

use hgr_types::{HangarError, Result, RunEvent};

use crate::connection::MetricsStore;
use crate::samples::parse_timestamp;

/// Repository for run lifecycle events.
pub struct EventRepository<'a> {
    store: &'a MetricsStore,
}

impl<'a> EventRepository<'a> {
    pub fn new(store: &'a MetricsStore) -> Self {
        Self { store }
    }

    /// Record an event stamped with the current time.
    pub async fn record(&self, kind: &str, detail: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query("INSERT INTO events (timestamp, kind, detail) VALUES (?, ?, ?)")
            .bind(&now)
            .bind(kind)
            .bind(detail)
            .execute(self.store.pool())
            .await
            .map_err(|e| HangarError::Database(format!("Record event: {e}")))?;
        Ok(())
    }

    pub async fn all(&self) -> Result<Vec<RunEvent>> {
        let rows: Vec<(String, String, Option<String>)> =
            sqlx::query_as("SELECT timestamp, kind, detail FROM events ORDER BY id")
                .fetch_all(self.store.pool())
                .await
                .map_err(|e| HangarError::Database(format!("Get events: {e}")))?;

        rows.into_iter()
            .map(|(timestamp, kind, detail)| {
                Ok(RunEvent {
                    timestamp: parse_timestamp(&timestamp)?,
                    kind,
                    detail,
                })
            })
            .collect()
    }
}

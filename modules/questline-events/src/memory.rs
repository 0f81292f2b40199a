//! In-process audit log for single-process deployments and tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use questline_common::{EventId, QuestlineError, TeamId};

use crate::types::{AppendEntry, LogEntry};
use crate::AuditLog;

#[derive(Clone, Default)]
pub struct MemoryAuditLog {
    inner: Arc<RwLock<Vec<LogEntry>>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, entry: AppendEntry) -> Result<LogEntry, QuestlineError> {
        let mut entries = self.inner.write().await;
        let stored = LogEntry {
            seq: entries.len() as i64 + 1,
            ts: Utc::now(),
            event_id: entry.event_id,
            team_id: entry.team_id,
            player_id: entry.player_id,
            entry_type: entry.entry_type,
            data: entry.data,
        };
        entries.push(stored.clone());
        Ok(stored)
    }

    async fn read_from(
        &self,
        event_id: EventId,
        seq_start: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, QuestlineError> {
        let entries = self.inner.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.event_id == event_id && e.seq >= seq_start)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn read_by_type(
        &self,
        event_id: EventId,
        entry_type: &str,
        seq_start: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, QuestlineError> {
        let entries = self.inner.read().await;
        Ok(entries
            .iter()
            .filter(|e| {
                e.event_id == event_id && e.entry_type == entry_type && e.seq >= seq_start
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn read_by_team(
        &self,
        event_id: EventId,
        team_id: TeamId,
        seq_start: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, QuestlineError> {
        let entries = self.inner.read().await;
        Ok(entries
            .iter()
            .filter(|e| {
                e.event_id == event_id && e.team_id == Some(team_id) && e.seq >= seq_start
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn latest_seq(&self) -> Result<i64, QuestlineError> {
        let entries = self.inner.read().await;
        Ok(entries.last().map(|e| e.seq).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn appends_are_ordered_and_filterable() {
        let log = MemoryAuditLog::new();

        log.append(AppendEntry::new(1, "team_assigned", json!({"team_id": 5})).with_team(5))
            .await
            .unwrap();
        log.append(AppendEntry::new(1, "visit_started", json!({"visit_id": 9})).with_team(5))
            .await
            .unwrap();
        log.append(AppendEntry::new(2, "team_assigned", json!({"team_id": 8})).with_team(8))
            .await
            .unwrap();

        let all = log.read_from(1, 1, 100).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.windows(2).all(|w| w[0].seq < w[1].seq));

        let by_type = log.read_by_type(1, "team_assigned", 1, 100).await.unwrap();
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].team_id, Some(5));

        let other_event = log.read_by_team(2, 8, 1, 100).await.unwrap();
        assert_eq!(other_event.len(), 1);

        assert_eq!(log.latest_seq().await.unwrap(), 3);
    }
}

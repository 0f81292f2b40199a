//! Postgres audit log.
//!
//! Reads are stable in `seq` order: a consumer paging with `read_from` sees
//! every committed entry exactly once and never sees entries reorder between
//! calls. BIGSERIAL gaps from rolled-back transactions are fine — `seq` is a
//! cursor, not a dense counter.

use async_trait::async_trait;
use sqlx::PgPool;

use questline_common::{EventId, QuestlineError, TeamId};

use crate::types::{AppendEntry, LogEntry};
use crate::AuditLog;

#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), QuestlineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_log (
                seq        BIGSERIAL   PRIMARY KEY,
                ts         TIMESTAMPTZ NOT NULL DEFAULT now(),
                event_id   BIGINT      NOT NULL,
                team_id    BIGINT,
                player_id  BIGINT,
                entry_type TEXT        NOT NULL,
                data       JSONB       NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_event_log_event_type ON event_log (event_id, entry_type)",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> QuestlineError {
    QuestlineError::Storage(e.to_string())
}

const COLS: &str = "seq, ts, event_id, team_id, player_id, entry_type, data";

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for LogEntry {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(LogEntry {
            seq: row.try_get("seq")?,
            ts: row.try_get("ts")?,
            event_id: row.try_get("event_id")?,
            team_id: row.try_get("team_id")?,
            player_id: row.try_get("player_id")?,
            entry_type: row.try_get("entry_type")?,
            data: row.try_get("data")?,
        })
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    async fn append(&self, entry: AppendEntry) -> Result<LogEntry, QuestlineError> {
        sqlx::query_as::<_, LogEntry>(&format!(
            r#"
            INSERT INTO event_log (event_id, team_id, player_id, entry_type, data)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {COLS}
            "#
        ))
        .bind(entry.event_id)
        .bind(entry.team_id)
        .bind(entry.player_id)
        .bind(&entry.entry_type)
        .bind(&entry.data)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn read_from(
        &self,
        event_id: EventId,
        seq_start: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, QuestlineError> {
        sqlx::query_as::<_, LogEntry>(&format!(
            r#"
            SELECT {COLS} FROM event_log
            WHERE event_id = $1 AND seq >= $2
            ORDER BY seq ASC
            LIMIT $3
            "#
        ))
        .bind(event_id)
        .bind(seq_start)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn read_by_type(
        &self,
        event_id: EventId,
        entry_type: &str,
        seq_start: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, QuestlineError> {
        sqlx::query_as::<_, LogEntry>(&format!(
            r#"
            SELECT {COLS} FROM event_log
            WHERE event_id = $1 AND entry_type = $2 AND seq >= $3
            ORDER BY seq ASC
            LIMIT $4
            "#
        ))
        .bind(event_id)
        .bind(entry_type)
        .bind(seq_start)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn read_by_team(
        &self,
        event_id: EventId,
        team_id: TeamId,
        seq_start: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, QuestlineError> {
        sqlx::query_as::<_, LogEntry>(&format!(
            r#"
            SELECT {COLS} FROM event_log
            WHERE event_id = $1 AND team_id = $2 AND seq >= $3
            ORDER BY seq ASC
            LIMIT $4
            "#
        ))
        .bind(event_id)
        .bind(team_id)
        .bind(seq_start)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn latest_seq(&self) -> Result<i64, QuestlineError> {
        let row = sqlx::query_as::<_, (Option<i64>,)>("SELECT MAX(seq) FROM event_log")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.0.unwrap_or(0))
    }
}

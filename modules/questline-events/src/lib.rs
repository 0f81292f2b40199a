//! Audit log — append-only fact trail for organizer review.
//!
//! A sink, not a source of truth: current state always comes from the state
//! store. Entries are never mutated or deleted, and reads are stable in
//! `(ts, seq)` order so the admin log stream never reorders under refresh.

pub mod memory;
pub mod postgres;
pub mod types;

use async_trait::async_trait;

use questline_common::{EventId, QuestlineError, TeamId};

pub use memory::MemoryAuditLog;
pub use postgres::PgAuditLog;
pub use types::{AppendEntry, LogEntry};

#[async_trait]
pub trait AuditLog: Send + Sync {
    /// Append one fact. The log assigns `seq` and `ts`.
    async fn append(&self, entry: AppendEntry) -> Result<LogEntry, QuestlineError>;

    /// Read facts for an event in sequence order starting from `seq_start`
    /// (inclusive).
    async fn read_from(
        &self,
        event_id: EventId,
        seq_start: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, QuestlineError>;

    /// Read facts of one type, in sequence order.
    async fn read_by_type(
        &self,
        event_id: EventId,
        entry_type: &str,
        seq_start: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, QuestlineError>;

    /// Read facts about one team, in sequence order.
    async fn read_by_team(
        &self,
        event_id: EventId,
        team_id: TeamId,
        seq_start: i64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, QuestlineError>;

    /// The latest committed sequence number, or 0 if the log is empty.
    async fn latest_seq(&self) -> Result<i64, QuestlineError>;
}

//! Postgres state store.
//!
//! Delivery uniqueness and rating uniqueness are unique indexes; score totals
//! are a single-statement atomic increment. Conflicting inserts come back as
//! `Inserted::Existing`, never as errors.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use questline_common::{
    ContentBlockId, EventId, PlayerId, QuestlineError, StationId, TeamId, ThreadId, VisitId,
};

use crate::entities::*;
use crate::{Inserted, StateStore};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and unique indexes if they don't exist yet.
    pub async fn ensure_schema(&self) -> Result<(), QuestlineError> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await.map_err(db_err)?;
        }
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id         BIGSERIAL   PRIMARY KEY,
        name       TEXT        NOT NULL,
        slug       TEXT        NOT NULL UNIQUE,
        starts_at  TIMESTAMPTZ,
        ends_at    TIMESTAMPTZ,
        config     JSONB       NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS teams (
        id                 BIGSERIAL        PRIMARY KEY,
        event_id           BIGINT           NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        name               TEXT             NOT NULL,
        status             TEXT             NOT NULL DEFAULT 'active',
        score_total        DOUBLE PRECISION NOT NULL DEFAULT 0,
        current_state      TEXT             NOT NULL DEFAULT 'free_roam',
        current_station_id BIGINT,
        progress           JSONB            NOT NULL DEFAULT '{}',
        scan_token         TEXT,
        created_at         TIMESTAMPTZ      NOT NULL DEFAULT now(),
        UNIQUE (event_id, name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS players (
        id          BIGSERIAL   PRIMARY KEY,
        event_id    BIGINT      NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        external_id TEXT        NOT NULL,
        team_id     BIGINT      REFERENCES teams(id) ON DELETE SET NULL,
        role        TEXT,
        progress    JSONB       NOT NULL DEFAULT '{}',
        flags       JSONB       NOT NULL DEFAULT '{}',
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (event_id, external_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stations (
        id         BIGSERIAL   PRIMARY KEY,
        event_id   BIGINT      NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        name       TEXT        NOT NULL,
        capacity   INTEGER     NOT NULL DEFAULT 1,
        config     JSONB       NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS station_visits (
        id             BIGSERIAL        PRIMARY KEY,
        event_id       BIGINT           NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        team_id        BIGINT           NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
        station_id     BIGINT           NOT NULL REFERENCES stations(id) ON DELETE CASCADE,
        state          TEXT             NOT NULL DEFAULT 'arrived',
        started_at     TIMESTAMPTZ,
        ended_at       TIMESTAMPTZ,
        points_awarded DOUBLE PRECISION NOT NULL DEFAULT 0,
        host_notes     TEXT,
        host_rating    INTEGER,
        created_at     TIMESTAMPTZ      NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_visits_active
        ON station_visits (team_id, station_id)
        WHERE state != 'finished'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS content_blocks (
        id         BIGSERIAL   PRIMARY KEY,
        event_id   BIGINT      NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        key        TEXT        NOT NULL,
        kind       TEXT        NOT NULL DEFAULT 'text',
        payload    JSONB       NOT NULL DEFAULT '{}',
        audience   TEXT        NOT NULL DEFAULT 'team',
        station_id BIGINT      REFERENCES stations(id) ON DELETE SET NULL,
        version    INTEGER     NOT NULL DEFAULT 1,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS deliveries (
        id               BIGSERIAL   PRIMARY KEY,
        event_id         BIGINT      NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        content_block_id BIGINT      NOT NULL REFERENCES content_blocks(id) ON DELETE CASCADE,
        team_id          BIGINT      NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
        player_id        BIGINT      REFERENCES players(id) ON DELETE CASCADE,
        delivered_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        seen_at          TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_deliveries_player
        ON deliveries (content_block_id, team_id, player_id)
        WHERE player_id IS NOT NULL
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_deliveries_team
        ON deliveries (content_block_id, team_id)
        WHERE player_id IS NULL
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dialogue_threads (
        id         BIGSERIAL   PRIMARY KEY,
        event_id   BIGINT      NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        key        TEXT        NOT NULL,
        kind       TEXT        NOT NULL DEFAULT 'leaked',
        title      TEXT        NOT NULL DEFAULT '',
        config     JSONB       NOT NULL DEFAULT '{}',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (event_id, key)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dialogue_messages (
        id               BIGSERIAL   PRIMARY KEY,
        event_id         BIGINT      NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        thread_id        BIGINT      NOT NULL REFERENCES dialogue_threads(id) ON DELETE CASCADE,
        content_block_id BIGINT      NOT NULL REFERENCES content_blocks(id) ON DELETE CASCADE,
        audience     TEXT        NOT NULL DEFAULT 'team',
        payload      JSONB       NOT NULL DEFAULT '{}',
        order_index  INTEGER     NOT NULL DEFAULT 0,
        gate_rules   JSONB,
        flag_effects JSONB,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ratings (
        id             BIGSERIAL   PRIMARY KEY,
        event_id       BIGINT      NOT NULL REFERENCES events(id) ON DELETE CASCADE,
        visit_id       BIGINT      NOT NULL REFERENCES station_visits(id) ON DELETE CASCADE,
        player_id      BIGINT      NOT NULL REFERENCES players(id) ON DELETE CASCADE,
        station_rating INTEGER     NOT NULL,
        host_rating    INTEGER     NOT NULL,
        comment        TEXT,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (visit_id, player_id)
    )
    "#,
];

fn db_err(e: sqlx::Error) -> QuestlineError {
    QuestlineError::Storage(e.to_string())
}

fn parse_col<T: FromStr>(raw: String, col: &str) -> Result<T, sqlx::Error> {
    raw.parse().map_err(|_| sqlx::Error::ColumnDecode {
        index: col.to_string(),
        source: format!("invalid value '{raw}' in column {col}").into(),
    })
}

// --- Row mappings ---

impl<'r> sqlx::FromRow<'r, PgRow> for Event {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Event {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            slug: row.try_get("slug")?,
            starts_at: row.try_get("starts_at")?,
            ends_at: row.try_get("ends_at")?,
            config: row.try_get("config")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Team {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Team {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            name: row.try_get("name")?,
            status: row.try_get("status")?,
            score_total: row.try_get("score_total")?,
            current_state: parse_col(row.try_get("current_state")?, "current_state")?,
            current_station_id: row.try_get("current_station_id")?,
            progress: row.try_get("progress")?,
            scan_token: row.try_get("scan_token")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Player {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let role: Option<String> = row.try_get("role")?;
        Ok(Player {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            external_id: row.try_get("external_id")?,
            team_id: row.try_get("team_id")?,
            role: role.map(|r| parse_col(r, "role")).transpose()?,
            progress: row.try_get("progress")?,
            flags: row.try_get("flags")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Station {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Station {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            name: row.try_get("name")?,
            capacity: row.try_get("capacity")?,
            config: row.try_get("config")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for StationVisit {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(StationVisit {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            team_id: row.try_get("team_id")?,
            station_id: row.try_get("station_id")?,
            state: parse_col(row.try_get("state")?, "state")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            points_awarded: row.try_get("points_awarded")?,
            host_notes: row.try_get("host_notes")?,
            host_rating: row.try_get("host_rating")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for ContentBlock {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ContentBlock {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            key: row.try_get("key")?,
            kind: row.try_get("kind")?,
            payload: row.try_get("payload")?,
            audience: parse_col(row.try_get("audience")?, "audience")?,
            station_id: row.try_get("station_id")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Delivery {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Delivery {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            content_block_id: row.try_get("content_block_id")?,
            team_id: row.try_get("team_id")?,
            player_id: row.try_get("player_id")?,
            delivered_at: row.try_get("delivered_at")?,
            seen_at: row.try_get("seen_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for DialogueThread {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DialogueThread {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            key: row.try_get("key")?,
            kind: parse_col(row.try_get("kind")?, "kind")?,
            title: row.try_get("title")?,
            config: row.try_get("config")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for DialogueMessage {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DialogueMessage {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            thread_id: row.try_get("thread_id")?,
            content_block_id: row.try_get("content_block_id")?,
            audience: parse_col(row.try_get("audience")?, "audience")?,
            payload: row.try_get("payload")?,
            order_index: row.try_get("order_index")?,
            gate_rules: row.try_get("gate_rules")?,
            flag_effects: row.try_get("flag_effects")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Rating {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Rating {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            visit_id: row.try_get("visit_id")?,
            player_id: row.try_get("player_id")?,
            station_rating: row.try_get("station_rating")?,
            host_rating: row.try_get("host_rating")?,
            comment: row.try_get("comment")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

const TEAM_COLS: &str = "id, event_id, name, status, score_total, current_state, \
                         current_station_id, progress, scan_token, created_at";
const VISIT_COLS: &str = "id, event_id, team_id, station_id, state, started_at, ended_at, \
                          points_awarded, host_notes, host_rating, created_at";

#[async_trait]
impl StateStore for PgStore {
    async fn create_event(&self, name: &str, slug: &str) -> Result<Event, QuestlineError> {
        sqlx::query_as::<_, Event>(
            "INSERT INTO events (name, slug) VALUES ($1, $2) RETURNING *",
        )
        .bind(name)
        .bind(slug)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn team(&self, id: TeamId) -> Result<Team, QuestlineError> {
        sqlx::query_as::<_, Team>(&format!("SELECT {TEAM_COLS} FROM teams WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| QuestlineError::NotFound(format!("team {id}")))
    }

    async fn teams_by_event(&self, event_id: EventId) -> Result<Vec<Team>, QuestlineError> {
        sqlx::query_as::<_, Team>(&format!(
            "SELECT {TEAM_COLS} FROM teams WHERE event_id = $1 ORDER BY id"
        ))
        .bind(event_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn create_team(&self, new: NewTeam) -> Result<Team, QuestlineError> {
        sqlx::query_as::<_, Team>(
            "INSERT INTO teams (event_id, name) VALUES ($1, $2) RETURNING *",
        )
        .bind(new.event_id)
        .bind(&new.name)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn update_team(&self, team: &Team) -> Result<(), QuestlineError> {
        let result = sqlx::query(
            r#"
            UPDATE teams
            SET name = $2, status = $3, current_state = $4, current_station_id = $5,
                progress = $6, scan_token = $7
            WHERE id = $1
            "#,
        )
        .bind(team.id)
        .bind(&team.name)
        .bind(&team.status)
        .bind(team.current_state.to_string())
        .bind(team.current_station_id)
        .bind(&team.progress)
        .bind(&team.scan_token)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(QuestlineError::NotFound(format!("team {}", team.id)));
        }
        Ok(())
    }

    async fn add_score(&self, team_id: TeamId, delta: f64) -> Result<f64, QuestlineError> {
        let row = sqlx::query_as::<_, (f64,)>(
            "UPDATE teams SET score_total = score_total + $2 WHERE id = $1 RETURNING score_total",
        )
        .bind(team_id)
        .bind(delta)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| QuestlineError::NotFound(format!("team {team_id}")))?;
        Ok(row.0)
    }

    async fn set_scan_token(&self, team_id: TeamId, token: &str) -> Result<(), QuestlineError> {
        let result = sqlx::query("UPDATE teams SET scan_token = $2 WHERE id = $1")
            .bind(team_id)
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(QuestlineError::NotFound(format!("team {team_id}")));
        }
        Ok(())
    }

    async fn player(&self, id: PlayerId) -> Result<Player, QuestlineError> {
        sqlx::query_as::<_, Player>("SELECT * FROM players WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| QuestlineError::NotFound(format!("player {id}")))
    }

    async fn players_by_team(&self, team_id: TeamId) -> Result<Vec<Player>, QuestlineError> {
        sqlx::query_as::<_, Player>("SELECT * FROM players WHERE team_id = $1 ORDER BY id")
            .bind(team_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn register_player(&self, new: NewPlayer) -> Result<Player, QuestlineError> {
        sqlx::query_as::<_, Player>(
            r#"
            INSERT INTO players (event_id, external_id, team_id, role)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (event_id, external_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(new.event_id)
        .bind(&new.external_id)
        .bind(new.team_id)
        .bind(new.role.map(|r| r.to_string()))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(QuestlineError::AlreadyRegistered)
    }

    async fn update_player_flags(
        &self,
        player_id: PlayerId,
        flags: Value,
    ) -> Result<(), QuestlineError> {
        let result = sqlx::query("UPDATE players SET flags = $2 WHERE id = $1")
            .bind(player_id)
            .bind(&flags)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(QuestlineError::NotFound(format!("player {player_id}")));
        }
        Ok(())
    }

    async fn station(&self, id: StationId) -> Result<Station, QuestlineError> {
        sqlx::query_as::<_, Station>("SELECT * FROM stations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| QuestlineError::NotFound(format!("station {id}")))
    }

    async fn create_station(&self, new: NewStation) -> Result<Station, QuestlineError> {
        sqlx::query_as::<_, Station>(
            "INSERT INTO stations (event_id, name, capacity) VALUES ($1, $2, $3) RETURNING *",
        )
        .bind(new.event_id)
        .bind(&new.name)
        .bind(new.capacity)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn visit(&self, id: VisitId) -> Result<StationVisit, QuestlineError> {
        sqlx::query_as::<_, StationVisit>(&format!(
            "SELECT {VISIT_COLS} FROM station_visits WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| QuestlineError::NotFound(format!("visit {id}")))
    }

    async fn active_visit(
        &self,
        team_id: TeamId,
        station_id: StationId,
    ) -> Result<Option<StationVisit>, QuestlineError> {
        sqlx::query_as::<_, StationVisit>(&format!(
            r#"
            SELECT {VISIT_COLS} FROM station_visits
            WHERE team_id = $1 AND station_id = $2 AND state != 'finished'
            LIMIT 1
            "#
        ))
        .bind(team_id)
        .bind(station_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn active_visit_count(&self, station_id: StationId) -> Result<i64, QuestlineError> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM station_visits WHERE station_id = $1 AND state != 'finished'",
        )
        .bind(station_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.0)
    }

    async fn create_visit(&self, new: NewVisit) -> Result<StationVisit, QuestlineError> {
        sqlx::query_as::<_, StationVisit>(
            r#"
            INSERT INTO station_visits (event_id, team_id, station_id, state)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(new.event_id)
        .bind(new.team_id)
        .bind(new.station_id)
        .bind(new.state.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn update_visit(&self, visit: &StationVisit) -> Result<(), QuestlineError> {
        let result = sqlx::query(
            r#"
            UPDATE station_visits
            SET state = $2, started_at = $3, ended_at = $4, points_awarded = $5,
                host_notes = $6, host_rating = $7
            WHERE id = $1
            "#,
        )
        .bind(visit.id)
        .bind(visit.state.to_string())
        .bind(visit.started_at)
        .bind(visit.ended_at)
        .bind(visit.points_awarded)
        .bind(&visit.host_notes)
        .bind(visit.host_rating)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(QuestlineError::NotFound(format!("visit {}", visit.id)));
        }
        Ok(())
    }

    async fn finished_station_ids(
        &self,
        team_id: TeamId,
    ) -> Result<Vec<StationId>, QuestlineError> {
        let rows = sqlx::query_as::<_, (i64,)>(
            r#"
            SELECT DISTINCT station_id FROM station_visits
            WHERE team_id = $1 AND state = 'finished'
            ORDER BY station_id
            "#,
        )
        .bind(team_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn content_block(&self, id: ContentBlockId) -> Result<ContentBlock, QuestlineError> {
        sqlx::query_as::<_, ContentBlock>("SELECT * FROM content_blocks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| QuestlineError::NotFound(format!("content block {id}")))
    }

    async fn create_content_block(
        &self,
        new: NewContentBlock,
    ) -> Result<ContentBlock, QuestlineError> {
        sqlx::query_as::<_, ContentBlock>(
            r#"
            INSERT INTO content_blocks (event_id, key, kind, payload, audience, station_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(new.event_id)
        .bind(&new.key)
        .bind(&new.kind)
        .bind(&new.payload)
        .bind(new.audience.to_string())
        .bind(new.station_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn insert_delivery(
        &self,
        new: NewDelivery,
    ) -> Result<Inserted<Delivery>, QuestlineError> {
        let inserted = sqlx::query_as::<_, Delivery>(
            r#"
            INSERT INTO deliveries (event_id, content_block_id, team_id, player_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT DO NOTHING
            RETURNING *
            "#,
        )
        .bind(new.event_id)
        .bind(new.content_block_id)
        .bind(new.team_id)
        .bind(new.player_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if let Some(delivery) = inserted {
            return Ok(Inserted::Created(delivery));
        }

        // Lost the race (or a retry): fetch the row that owns the key.
        let existing = sqlx::query_as::<_, Delivery>(
            r#"
            SELECT * FROM deliveries
            WHERE content_block_id = $1 AND team_id = $2 AND player_id IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(new.content_block_id)
        .bind(new.team_id)
        .bind(new.player_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Inserted::Existing(existing))
    }

    async fn deliveries_for_player(
        &self,
        team_id: TeamId,
        player_id: PlayerId,
    ) -> Result<Vec<Delivery>, QuestlineError> {
        sqlx::query_as::<_, Delivery>(
            r#"
            SELECT * FROM deliveries
            WHERE team_id = $1 AND (player_id IS NULL OR player_id = $2)
            ORDER BY delivered_at DESC, id DESC
            "#,
        )
        .bind(team_id)
        .bind(player_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn thread_by_key(
        &self,
        event_id: EventId,
        key: &str,
    ) -> Result<DialogueThread, QuestlineError> {
        sqlx::query_as::<_, DialogueThread>(
            "SELECT * FROM dialogue_threads WHERE event_id = $1 AND key = $2",
        )
        .bind(event_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| QuestlineError::NotFound(format!("dialogue thread '{key}'")))
    }

    async fn create_thread(&self, new: NewThread) -> Result<DialogueThread, QuestlineError> {
        sqlx::query_as::<_, DialogueThread>(
            r#"
            INSERT INTO dialogue_threads (event_id, key, kind, title, config)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(new.event_id)
        .bind(&new.key)
        .bind(new.kind.to_string())
        .bind(&new.title)
        .bind(&new.config)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn messages_by_thread(
        &self,
        thread_id: ThreadId,
    ) -> Result<Vec<DialogueMessage>, QuestlineError> {
        sqlx::query_as::<_, DialogueMessage>(
            "SELECT * FROM dialogue_messages WHERE thread_id = $1 ORDER BY order_index, id",
        )
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn create_message(&self, new: NewMessage) -> Result<DialogueMessage, QuestlineError> {
        sqlx::query_as::<_, DialogueMessage>(
            r#"
            INSERT INTO dialogue_messages
                (event_id, thread_id, content_block_id, audience, payload, order_index,
                 gate_rules, flag_effects)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(new.event_id)
        .bind(new.thread_id)
        .bind(new.content_block_id)
        .bind(new.audience.to_string())
        .bind(&new.payload)
        .bind(new.order_index)
        .bind(&new.gate_rules)
        .bind(&new.flag_effects)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn insert_rating(&self, new: NewRating) -> Result<Inserted<Rating>, QuestlineError> {
        let inserted = sqlx::query_as::<_, Rating>(
            r#"
            INSERT INTO ratings (event_id, visit_id, player_id, station_rating, host_rating, comment)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (visit_id, player_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(new.event_id)
        .bind(new.visit_id)
        .bind(new.player_id)
        .bind(new.station_rating)
        .bind(new.host_rating)
        .bind(&new.comment)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if let Some(rating) = inserted {
            return Ok(Inserted::Created(rating));
        }

        let existing = sqlx::query_as::<_, Rating>(
            "SELECT * FROM ratings WHERE visit_id = $1 AND player_id = $2",
        )
        .bind(new.visit_id)
        .bind(new.player_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(Inserted::Existing(existing))
    }
}

//! Relational + EAV store.
//!
//! Six tables: four structured (`api_meetings`, `api_races`, `api_runners`,
//! `api_results`) and two schema-on-read (`api_entities`, `api_kv`). Every
//! write is an upsert keyed on the table's primary key, so replaying the same
//! payload converges on the same rows.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::path::Path;
use tracing::info;

use crate::error::Result;
use crate::extract::{EntityRecord, Extracted, StructuredRow};
use crate::flatten::FactValue;

const TABLES: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS api_meetings (
        meeting_id TEXT PRIMARY KEY,
        meeting_date TEXT,
        country TEXT,
        venue TEXT,
        raw_json TEXT
    )",
    "CREATE TABLE IF NOT EXISTS api_races (
        race_id TEXT PRIMARY KEY,
        meeting_id TEXT,
        race_no INTEGER,
        scheduled_start_time TEXT,
        distance TEXT,
        class TEXT,
        raw_json TEXT
    )",
    "CREATE TABLE IF NOT EXISTS api_runners (
        runner_id TEXT PRIMARY KEY,
        race_id TEXT,
        runner_name TEXT,
        barrier INTEGER,
        weight TEXT,
        jockey TEXT,
        trainer TEXT,
        raw_json TEXT
    )",
    "CREATE TABLE IF NOT EXISTS api_results (
        race_id TEXT PRIMARY KEY,
        status TEXT,
        winner_runner_id TEXT,
        finish_order_json TEXT,
        raw_json TEXT
    )",
    "CREATE TABLE IF NOT EXISTS api_entities (
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        parent_id TEXT,
        meeting_date TEXT,
        country TEXT,
        raw_json TEXT,
        PRIMARY KEY (entity_type, entity_id)
    )",
    "CREATE TABLE IF NOT EXISTS api_kv (
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        k TEXT NOT NULL,
        v_text TEXT,
        v_num REAL,
        v_json TEXT,
        PRIMARY KEY (entity_type, entity_id, k)
    )",
];

const INDEXES: [&str; 8] = [
    "CREATE INDEX IF NOT EXISTS idx_api_meetings_date_country ON api_meetings(meeting_date, country)",
    "CREATE INDEX IF NOT EXISTS idx_api_races_meeting_id ON api_races(meeting_id)",
    "CREATE INDEX IF NOT EXISTS idx_api_races_start ON api_races(scheduled_start_time)",
    "CREATE INDEX IF NOT EXISTS idx_api_runners_race_id ON api_runners(race_id)",
    "CREATE INDEX IF NOT EXISTS idx_api_results_race_id ON api_results(race_id)",
    "CREATE INDEX IF NOT EXISTS idx_api_entities_date_country ON api_entities(meeting_date, country)",
    "CREATE INDEX IF NOT EXISTS idx_api_kv_entity_type_k ON api_kv(entity_type, k)",
    "CREATE INDEX IF NOT EXISTS idx_api_kv_entity_id ON api_kv(entity_id)",
];

/// Tables readable through [`Store::table_count`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Meetings,
    Races,
    Runners,
    Results,
    Entities,
    Facts,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Meetings => "api_meetings",
            Table::Races => "api_races",
            Table::Runners => "api_runners",
            Table::Results => "api_results",
            Table::Entities => "api_entities",
            Table::Facts => "api_kv",
        }
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the SQLite file and make sure the schema exists.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        info!("Opened store at {}", path.display());
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        for ddl in TABLES.iter().chain(INDEXES.iter()) {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn table_count(&self, table: Table) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    pub async fn fact(&self, entity_type: &str, entity_id: &str, key: &str) -> Result<Option<FactValue>> {
        let row = sqlx::query(
            "SELECT v_text, v_num, v_json FROM api_kv
             WHERE entity_type = ?1 AND entity_id = ?2 AND k = ?3",
        )
        .bind(entity_type)
        .bind(entity_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|row| {
            let text: Option<String> = row.get("v_text");
            let num: Option<f64> = row.get("v_num");
            let json: Option<String> = row.get("v_json");
            num.map(FactValue::Numeric)
                .or(text.map(FactValue::Text))
                .or(json.map(FactValue::Json))
        }))
    }

    pub async fn result_winner(&self, race_id: &str) -> Result<Option<String>> {
        let winner: Option<Option<String>> =
            sqlx::query_scalar("SELECT winner_runner_id FROM api_results WHERE race_id = ?1")
                .bind(race_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(winner.flatten())
    }

    pub async fn entity_parent(&self, entity_type: &str, entity_id: &str) -> Result<Option<String>> {
        let parent: Option<Option<String>> = sqlx::query_scalar(
            "SELECT parent_id FROM api_entities WHERE entity_type = ?1 AND entity_id = ?2",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(parent.flatten())
    }
}

/// Upsert one extracted object: structured row, entity row, then one fact
/// per flattened key. Returns the number of facts written.
///
/// Callers wrap a whole ingestion in one transaction so the three writes are
/// never observed apart.
pub async fn persist(conn: &mut SqliteConnection, item: &Extracted) -> Result<usize> {
    let raw_json = item.entity.raw.to_string();
    if let Some(row) = &item.row {
        upsert_row(conn, row, &raw_json).await?;
    }
    upsert_entity(conn, &item.entity, &raw_json).await?;
    upsert_facts(conn, &item.entity).await
}

async fn upsert_row(conn: &mut SqliteConnection, row: &StructuredRow, raw_json: &str) -> Result<()> {
    match row {
        StructuredRow::Meeting(m) => {
            sqlx::query(
                "INSERT INTO api_meetings (meeting_id, meeting_date, country, venue, raw_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(meeting_id) DO UPDATE SET
                    meeting_date = excluded.meeting_date,
                    country = excluded.country,
                    venue = excluded.venue,
                    raw_json = excluded.raw_json",
            )
            .bind(&m.meeting_id)
            .bind(&m.meeting_date)
            .bind(&m.country)
            .bind(&m.venue)
            .bind(raw_json)
            .execute(&mut *conn)
            .await?;
        }
        StructuredRow::Race(r) => {
            sqlx::query(
                "INSERT INTO api_races
                    (race_id, meeting_id, race_no, scheduled_start_time, distance, class, raw_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(race_id) DO UPDATE SET
                    meeting_id = excluded.meeting_id,
                    race_no = excluded.race_no,
                    scheduled_start_time = excluded.scheduled_start_time,
                    distance = excluded.distance,
                    class = excluded.class,
                    raw_json = excluded.raw_json",
            )
            .bind(&r.race_id)
            .bind(&r.meeting_id)
            .bind(r.race_no)
            .bind(&r.scheduled_start_time)
            .bind(&r.distance)
            .bind(&r.class)
            .bind(raw_json)
            .execute(&mut *conn)
            .await?;
        }
        StructuredRow::Runner(r) => {
            sqlx::query(
                "INSERT INTO api_runners
                    (runner_id, race_id, runner_name, barrier, weight, jockey, trainer, raw_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(runner_id) DO UPDATE SET
                    race_id = excluded.race_id,
                    runner_name = excluded.runner_name,
                    barrier = excluded.barrier,
                    weight = excluded.weight,
                    jockey = excluded.jockey,
                    trainer = excluded.trainer,
                    raw_json = excluded.raw_json",
            )
            .bind(&r.runner_id)
            .bind(&r.race_id)
            .bind(&r.runner_name)
            .bind(r.barrier)
            .bind(&r.weight)
            .bind(&r.jockey)
            .bind(&r.trainer)
            .bind(raw_json)
            .execute(&mut *conn)
            .await?;
        }
        StructuredRow::Result(r) => {
            sqlx::query(
                "INSERT INTO api_results (race_id, status, winner_runner_id, finish_order_json, raw_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(race_id) DO UPDATE SET
                    status = excluded.status,
                    winner_runner_id = excluded.winner_runner_id,
                    finish_order_json = excluded.finish_order_json,
                    raw_json = excluded.raw_json",
            )
            .bind(&r.race_id)
            .bind(&r.status)
            .bind(&r.winner_runner_id)
            .bind(&r.finish_order)
            .bind(raw_json)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

async fn upsert_entity(conn: &mut SqliteConnection, entity: &EntityRecord, raw_json: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO api_entities (entity_type, entity_id, parent_id, meeting_date, country, raw_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(entity_type, entity_id) DO UPDATE SET
            parent_id = excluded.parent_id,
            meeting_date = excluded.meeting_date,
            country = excluded.country,
            raw_json = excluded.raw_json",
    )
    .bind(entity.kind.as_str())
    .bind(&entity.id)
    .bind(&entity.parent_id)
    .bind(&entity.meeting_date)
    .bind(&entity.country)
    .bind(raw_json)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn upsert_facts(conn: &mut SqliteConnection, entity: &EntityRecord) -> Result<usize> {
    let facts = entity.facts();
    for (key, value) in &facts {
        let (text, num, json) = match value {
            FactValue::Text(s) => (Some(s.as_str()), None, None),
            FactValue::Numeric(n) => (None, Some(*n), None),
            FactValue::Json(s) => (None, None, Some(s.as_str())),
        };
        sqlx::query(
            "INSERT INTO api_kv (entity_type, entity_id, k, v_text, v_num, v_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(entity_type, entity_id, k) DO UPDATE SET
                v_text = excluded.v_text,
                v_num = excluded.v_num,
                v_json = excluded.v_json",
        )
        .bind(entity.kind.as_str())
        .bind(&entity.id)
        .bind(key)
        .bind(text)
        .bind(num)
        .bind(json)
        .execute(&mut *conn)
        .await?;
    }
    Ok(facts.len())
}

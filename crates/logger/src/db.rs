use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

use crate::message::EventRecord;

#[derive(Clone)]
pub struct EventStore {
    pool: Pool<Sqlite>,
}

/// How a record landed in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Write {
    /// New row, or an existing row with the same id replaced.
    Upserted,
    /// No id; appended unconditionally.
    Inserted,
}

impl EventStore {
    /// db_url examples:
    /// - "sqlite:/var/lib/irrigation/events.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let in_memory = db_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to ":memory:" is its own database, so tests get
        // exactly one connection that never expires.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    /// Insert-or-replace on the record id; plain insert without one.
    pub async fn upsert_event(&self, record: &EventRecord) -> Result<Write> {
        let payload = serde_json::to_string(&record.payload).context("serialize payload")?;
        let received_at = record.received_at_text();

        match &record.id {
            Some(id) => {
                sqlx::query(
                    r#"
                    INSERT INTO device_events (id, event_type, topic, payload, received_at)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(id) DO UPDATE SET
                      event_type=excluded.event_type,
                      topic=excluded.topic,
                      payload=excluded.payload,
                      received_at=excluded.received_at
                    "#,
                )
                .bind(id)
                .bind(&record.event_type)
                .bind(&record.topic)
                .bind(&payload)
                .bind(&received_at)
                .execute(&self.pool)
                .await
                .with_context(|| format!("upsert event id={id}"))?;
                Ok(Write::Upserted)
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO device_events (event_type, topic, payload, received_at)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(&record.event_type)
                .bind(&record.topic)
                .bind(&payload)
                .bind(&received_at)
                .execute(&self.pool)
                .await
                .context("insert event")?;
                Ok(Write::Inserted)
            }
        }
    }

    pub async fn count(&self) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM device_events")
            .fetch_one(&self.pool)
            .await
            .context("count events")?;
        Ok(n)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

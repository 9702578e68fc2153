//! SQLite implementation of the job cache.
//!
//! Two tables, each with a unique `(cache_name, entry_key)` constraint:
//! `cache_entry` holds the latest revision of every entry, `cache_ticket`
//! holds at most one ticket per key. Every ticket-open call sweeps expired
//! tickets first, so a stale ticket never blocks progress. All operations
//! are short transactions; after `add_entry` / `update_entry` returns the
//! write is committed and visible to any subsequent `query_key`.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tracing::debug;

use tracdap_kernel::cache::{
    validate_cache_key, CacheEntry, CacheError, CacheResult, CacheTicket, JobCache, TicketState,
};
use tracdap_kernel::config::CacheConfig;

/// SQL-backed job cache for one named cache.
pub struct SqlJobCache {
    pool: SqlitePool,
    cache_name: String,
    max_ticket_duration: Duration,
}

impl SqlJobCache {
    /// Connect and run migrations.
    pub async fn connect(cfg: &CacheConfig, cache_name: &str) -> CacheResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&cfg.database_url)
            .await
            .map_err(|e| CacheError::Storage(e.to_string()))?;

        let cache = Self {
            pool,
            cache_name: cache_name.to_string(),
            max_ticket_duration: Duration::seconds(cfg.max_ticket_duration_seconds as i64),
        };
        cache.run_migrations().await?;
        Ok(cache)
    }

    /// In-memory cache for tests and local runs.
    pub async fn in_memory(cache_name: &str) -> CacheResult<Self> {
        let cfg = CacheConfig {
            database_url: "sqlite::memory:".to_string(),
            max_ticket_duration_seconds: 300,
        };
        Self::connect(&cfg, cache_name).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> CacheResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entry (
                cache_pk INTEGER PRIMARY KEY AUTOINCREMENT,
                cache_name TEXT NOT NULL,
                entry_key TEXT NOT NULL,
                revision INTEGER NOT NULL,
                status TEXT NOT NULL,
                value_blob BLOB NOT NULL,
                UNIQUE (cache_name, entry_key)
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_ticket (
                ticket_pk INTEGER PRIMARY KEY AUTOINCREMENT,
                cache_name TEXT NOT NULL,
                entry_key TEXT NOT NULL,
                revision INTEGER NOT NULL,
                grant_time TEXT NOT NULL,
                expiry_time TEXT NOT NULL,
                UNIQUE (cache_name, entry_key)
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_cache_entry_status ON cache_entry(cache_name, status)")
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(())
    }

    /// Remove every expired ticket for this cache. Runs at the start of
    /// each ticket-open transaction, so expiry is enforced at open time.
    async fn sweep_expired(&self, tx: &mut Transaction<'_, Sqlite>, now: DateTime<Utc>)
    -> CacheResult<()> {
        sqlx::query("DELETE FROM cache_ticket WHERE cache_name = ? AND expiry_time < ?")
            .bind(&self.cache_name)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    fn check_duration(&self, duration: Duration) -> CacheResult<()> {
        if duration <= Duration::zero() {
            return Err(CacheError::IllegalArgument(
                "ticket duration must be positive".into(),
            ));
        }
        if duration > self.max_ticket_duration {
            return Err(CacheError::Ticket(format!(
                "requested ticket duration exceeds the policy maximum of {}s",
                self.max_ticket_duration.num_seconds()
            )));
        }
        Ok(())
    }

    /// A mutating operation is only permitted when the ticket was granted,
    /// has not expired, and is still registered in the ticket table.
    async fn check_ticket(&self, ticket: &CacheTicket) -> CacheResult<()> {
        let now = Utc::now();
        if ticket.state != TicketState::Valid {
            return Err(CacheError::Ticket(format!(
                "ticket for key '{}' is not valid (state {:?})",
                ticket.key, ticket.state
            )));
        }
        if now >= ticket.expiry_time {
            return Err(CacheError::Ticket(format!(
                "ticket for key '{}' has expired",
                ticket.key
            )));
        }

        let registered = sqlx::query(
            "SELECT 1 FROM cache_ticket
             WHERE cache_name = ? AND entry_key = ? AND revision = ? AND grant_time = ?",
        )
        .bind(&self.cache_name)
        .bind(&ticket.key)
        .bind(ticket.revision as i64)
        .bind(ticket.grant_time)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        if registered.is_none() {
            return Err(CacheError::Ticket(format!(
                "ticket for key '{}' is no longer registered",
                ticket.key
            )));
        }
        Ok(())
    }

    fn parse_entry(&self, row: &SqliteRow) -> CacheResult<CacheEntry> {
        Ok(CacheEntry {
            cache_name: self.cache_name.clone(),
            key: row.try_get("entry_key").map_err(storage_error)?,
            revision: row.try_get::<i64, _>("revision").map_err(storage_error)? as u32,
            status: row.try_get("status").map_err(storage_error)?,
            value: row.try_get("value_blob").map_err(storage_error)?,
        })
    }
}

fn storage_error(err: sqlx::Error) -> CacheError {
    CacheError::Storage(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error().is_some_and(|d| d.is_unique_violation())
}

#[async_trait]
impl JobCache for SqlJobCache {
    async fn open_new_ticket(&self, key: &str, duration: Duration) -> CacheResult<CacheTicket> {
        validate_cache_key(key)?;
        self.check_duration(duration)?;

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        self.sweep_expired(&mut tx, now).await?;

        let entry_exists = sqlx::query(
            "SELECT 1 FROM cache_entry WHERE cache_name = ? AND entry_key = ?",
        )
        .bind(&self.cache_name)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_error)?;

        if entry_exists.is_some() {
            tx.commit().await.map_err(storage_error)?;
            return Ok(CacheTicket::superseded(key, 0));
        }

        let ticket = CacheTicket::granted(key, 0, duration);
        let inserted = sqlx::query(
            "INSERT INTO cache_ticket (cache_name, entry_key, revision, grant_time, expiry_time)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&self.cache_name)
        .bind(key)
        .bind(0i64)
        .bind(ticket.grant_time)
        .bind(ticket.expiry_time)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await.map_err(storage_error)?;
                debug!(cache = %self.cache_name, key = key, "granted new-entry ticket");
                Ok(ticket)
            }
            Err(err) if is_unique_violation(&err) => {
                tx.commit().await.map_err(storage_error)?;
                Ok(CacheTicket::superseded(key, 0))
            }
            Err(err) => Err(storage_error(err)),
        }
    }

    async fn open_ticket(
        &self,
        key: &str,
        revision: u32,
        duration: Duration,
    ) -> CacheResult<CacheTicket> {
        validate_cache_key(key)?;
        self.check_duration(duration)?;
        if revision == 0 {
            return Err(CacheError::IllegalArgument(
                "revision must be at least 1 for an existing entry".into(),
            ));
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        self.sweep_expired(&mut tx, now).await?;

        let latest: Option<i64> = sqlx::query(
            "SELECT revision FROM cache_entry WHERE cache_name = ? AND entry_key = ?",
        )
        .bind(&self.cache_name)
        .bind(key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(storage_error)?
        .map(|row| row.try_get("revision"))
        .transpose()
        .map_err(storage_error)?;

        let outcome = match latest {
            None => Some(CacheTicket::missing(key, revision)),
            Some(latest) if latest < revision as i64 => Some(CacheTicket::missing(key, revision)),
            Some(latest) if latest > revision as i64 => {
                Some(CacheTicket::superseded(key, revision))
            }
            Some(_) => None,
        };
        if let Some(ticket) = outcome {
            tx.commit().await.map_err(storage_error)?;
            return Ok(ticket);
        }

        let ticket = CacheTicket::granted(key, revision, duration);
        let inserted = sqlx::query(
            "INSERT INTO cache_ticket (cache_name, entry_key, revision, grant_time, expiry_time)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&self.cache_name)
        .bind(key)
        .bind(revision as i64)
        .bind(ticket.grant_time)
        .bind(ticket.expiry_time)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await.map_err(storage_error)?;
                debug!(cache = %self.cache_name, key = key, revision = revision, "granted ticket");
                Ok(ticket)
            }
            Err(err) if is_unique_violation(&err) => {
                tx.commit().await.map_err(storage_error)?;
                Ok(CacheTicket::superseded(key, revision))
            }
            Err(err) => Err(storage_error(err)),
        }
    }

    async fn close_ticket(&self, ticket: &CacheTicket) -> CacheResult<()> {
        // Idempotent: closing an expired, superseded or unknown ticket is a
        // no-op, and writes made under the ticket stay committed.
        if ticket.state != TicketState::Valid {
            return Ok(());
        }
        sqlx::query(
            "DELETE FROM cache_ticket
             WHERE cache_name = ? AND entry_key = ? AND revision = ? AND grant_time = ?",
        )
        .bind(&self.cache_name)
        .bind(&ticket.key)
        .bind(ticket.revision as i64)
        .bind(ticket.grant_time)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn add_entry(
        &self,
        ticket: &CacheTicket,
        status: &str,
        value: Vec<u8>,
    ) -> CacheResult<u32> {
        self.check_ticket(ticket).await?;
        if ticket.revision != 0 {
            return Err(CacheError::Ticket(format!(
                "ticket for key '{}' is not a new-entry ticket",
                ticket.key
            )));
        }

        let inserted = sqlx::query(
            "INSERT INTO cache_entry (cache_name, entry_key, revision, status, value_blob)
             VALUES (?, ?, 1, ?, ?)",
        )
        .bind(&self.cache_name)
        .bind(&ticket.key)
        .bind(status)
        .bind(value)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(1),
            Err(err) if is_unique_violation(&err) => Err(CacheError::Duplicate(ticket.key.clone())),
            Err(err) => Err(storage_error(err)),
        }
    }

    async fn update_entry(
        &self,
        ticket: &CacheTicket,
        status: &str,
        value: Vec<u8>,
    ) -> CacheResult<u32> {
        self.check_ticket(ticket).await?;
        if ticket.revision == 0 {
            return Err(CacheError::Ticket(format!(
                "a new-entry ticket cannot update key '{}'",
                ticket.key
            )));
        }

        let result = sqlx::query(
            "UPDATE cache_entry SET revision = revision + 1, status = ?, value_blob = ?
             WHERE cache_name = ? AND entry_key = ? AND revision = ?",
        )
        .bind(status)
        .bind(value)
        .bind(&self.cache_name)
        .bind(&ticket.key)
        .bind(ticket.revision as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(CacheError::NotFound(ticket.key.clone()));
        }
        Ok(ticket.revision + 1)
    }

    async fn remove_entry(&self, ticket: &CacheTicket) -> CacheResult<()> {
        self.check_ticket(ticket).await?;

        let result = sqlx::query(
            "DELETE FROM cache_entry
             WHERE cache_name = ? AND entry_key = ? AND revision = ?",
        )
        .bind(&self.cache_name)
        .bind(&ticket.key)
        .bind(ticket.revision as i64)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        if result.rows_affected() == 0 {
            return Err(CacheError::NotFound(ticket.key.clone()));
        }
        Ok(())
    }

    async fn get_entry(&self, ticket: &CacheTicket) -> CacheResult<CacheEntry> {
        self.check_ticket(ticket).await?;

        let row = sqlx::query(
            "SELECT entry_key, revision, status, value_blob FROM cache_entry
             WHERE cache_name = ? AND entry_key = ?",
        )
        .bind(&self.cache_name)
        .bind(&ticket.key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        match row {
            Some(row) => self.parse_entry(&row),
            None => Err(CacheError::NotFound(ticket.key.clone())),
        }
    }

    async fn query_key(&self, key: &str) -> CacheResult<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT entry_key, revision, status, value_blob FROM cache_entry
             WHERE cache_name = ? AND entry_key = ?",
        )
        .bind(&self.cache_name)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.map(|r| self.parse_entry(&r)).transpose()
    }

    async fn query_status(
        &self,
        statuses: &[&str],
        include_open_tickets: bool,
    ) -> CacheResult<Vec<CacheEntry>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder = sqlx::QueryBuilder::<Sqlite>::new(
            "SELECT entry_key, revision, status, value_blob FROM cache_entry e
             WHERE e.cache_name = ",
        );
        builder.push_bind(&self.cache_name);
        builder.push(" AND e.status IN (");
        let mut separated = builder.separated(", ");
        for status in statuses {
            separated.push_bind(*status);
        }
        builder.push(")");

        if !include_open_tickets {
            builder.push(
                " AND NOT EXISTS (
                     SELECT 1 FROM cache_ticket t
                     WHERE t.cache_name = e.cache_name
                       AND t.entry_key = e.entry_key
                       AND t.expiry_time >= ",
            );
            builder.push_bind(Utc::now());
            builder.push(")");
        }
        builder.push(" ORDER BY e.entry_key");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        rows.iter().map(|r| self.parse_entry(r)).collect()
    }
}

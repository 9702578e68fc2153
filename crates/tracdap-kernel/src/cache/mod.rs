//! Job-cache contract: the ticket engine semantics.
//!
//! The cache is a persistent `key -> {revision, status, value}` map with
//! per-key exclusive write tickets. A ticket is the short-lived right to
//! create, update or delete one key at one specific revision; at most one
//! valid ticket exists per `(cache_name, key)` at any instant. Mutual
//! exclusion is enforced by the storage layer (a unique index), not by
//! application locks, so it survives process restarts and holds across
//! contending orchestrator workers.
//!
//! Values are opaque blobs; callers produce them through a [`ValueCodec`]
//! that knows which fields are transient (never persisted, read back as
//! their zero value).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Job-cache errors. These are surfaced to orchestrator workers and never
/// cross the client boundary.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    /// An entry already exists where one was being created.
    #[error("duplicate cache entry for key '{0}'")]
    Duplicate(String),

    /// No entry exists where one was expected.
    #[error("cache entry not found for key '{0}'")]
    NotFound(String),

    /// The ticket is expired, superseded, missing or otherwise unusable for
    /// the attempted operation.
    #[error("cache ticket error: {0}")]
    Ticket(String),

    /// The caller passed an invalid key, duration or value.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// A storage-layer failure (connection, SQL, serialization).
    #[error("cache storage error: {0}")]
    Storage(String),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tickets and entries
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of a ticket-open call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketState {
    /// The ticket grants the exclusive write right it was asked for.
    Valid,
    /// Another ticket is open, or the entry moved past the requested
    /// revision. The caller must not retry with the same revision.
    Superseded,
    /// No entry exists at the requested revision. The caller may retry as a
    /// new-entry ticket.
    Missing,
    /// The ticket's expiry time has passed.
    Expired,
}

/// A short-lived exclusive write right on one cache key at one revision.
///
/// A new-entry ticket holds revision 0; a regular ticket holds the revision
/// it was granted against. Tickets in any state other than [`TicketState::Valid`]
/// carry no right at all; they exist so callers can distinguish the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTicket {
    pub key: String,
    pub revision: u32,
    pub grant_time: DateTime<Utc>,
    pub expiry_time: DateTime<Utc>,
    pub state: TicketState,
}

impl CacheTicket {
    /// A granted ticket for `key` at `revision`, expiring after `duration`.
    pub fn granted(key: impl Into<String>, revision: u32, duration: Duration) -> Self {
        let grant_time = Utc::now();
        Self {
            key: key.into(),
            revision,
            grant_time,
            expiry_time: grant_time + duration,
            state: TicketState::Valid,
        }
    }

    /// A ticket denied because another ticket or a later revision exists.
    pub fn superseded(key: impl Into<String>, revision: u32) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            revision,
            grant_time: now,
            expiry_time: now,
            state: TicketState::Superseded,
        }
    }

    /// A ticket denied because no entry exists at the requested revision.
    pub fn missing(key: impl Into<String>, revision: u32) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            revision,
            grant_time: now,
            expiry_time: now,
            state: TicketState::Missing,
        }
    }

    /// True when the ticket was granted and has not passed its expiry.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.state == TicketState::Valid && now < self.expiry_time
    }
}

/// One cache entry at its latest revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub cache_name: String,
    pub key: String,
    /// Strictly monotonic per key, starting at 1.
    pub revision: u32,
    /// Caller-defined status string.
    pub status: String,
    /// Opaque serialized value.
    pub value: Vec<u8>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Key validation
// ─────────────────────────────────────────────────────────────────────────────

/// Reserved key prefixes. Keys starting with these are refused.
pub const RESERVED_KEY_PREFIXES: [&str; 2] = ["_", "trac_"];

/// Check a cache key: non-empty identifier (`[A-Za-z0-9_.-]`, starting with
/// an alphanumeric), not using a reserved prefix.
pub fn validate_cache_key(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        return Err(CacheError::IllegalArgument("cache key cannot be empty".into()));
    }
    for prefix in RESERVED_KEY_PREFIXES {
        if key.starts_with(prefix) {
            return Err(CacheError::IllegalArgument(format!(
                "cache key '{key}' uses the reserved prefix '{prefix}'"
            )));
        }
    }
    let mut chars = key.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_alphanumeric() {
        return Err(CacheError::IllegalArgument(format!(
            "cache key '{key}' is not a valid identifier"
        )));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.') {
        return Err(CacheError::IllegalArgument(format!(
            "cache key '{key}' is not a valid identifier"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache trait
// ─────────────────────────────────────────────────────────────────────────────

/// The ticket-engine contract.
///
/// Implementations serialize per-key operations through a unique constraint
/// on `(cache_name, key)` in the ticket store. After [`add_entry`] or
/// [`update_entry`] returns, [`query_key`] in any subsequent call observes
/// the new revision.
///
/// [`add_entry`]: JobCache::add_entry
/// [`update_entry`]: JobCache::update_entry
/// [`query_key`]: JobCache::query_key
#[async_trait]
pub trait JobCache: Send + Sync {
    /// Request the right to create `key`. Returns a ticket in state
    /// `Valid` (revision 0) or `Superseded`; fails `IllegalArgument` for a
    /// bad key or non-positive duration, `Ticket` when the duration exceeds
    /// the policy maximum.
    async fn open_new_ticket(&self, key: &str, duration: Duration) -> CacheResult<CacheTicket>;

    /// Request the right to update or delete `key` at exactly `revision`.
    /// Returns a ticket in state `Valid`, `Missing` (no entry, or latest
    /// revision below the request) or `Superseded` (latest revision above
    /// the request, or another ticket open).
    async fn open_ticket(&self, key: &str, revision: u32, duration: Duration)
    -> CacheResult<CacheTicket>;

    /// Release a ticket. Idempotent for expired or unknown tickets; never
    /// rolls back writes already made under the ticket.
    async fn close_ticket(&self, ticket: &CacheTicket) -> CacheResult<()>;

    /// Create the entry at revision 1. Valid only with a new-entry ticket.
    async fn add_entry(&self, ticket: &CacheTicket, status: &str, value: Vec<u8>)
    -> CacheResult<u32>;

    /// Write revision + 1. Valid only with a regular ticket on the exact
    /// current revision.
    async fn update_entry(&self, ticket: &CacheTicket, status: &str, value: Vec<u8>)
    -> CacheResult<u32>;

    /// Delete the entry, leaving no history.
    async fn remove_entry(&self, ticket: &CacheTicket) -> CacheResult<()>;

    /// Read the entry under a ticket.
    async fn get_entry(&self, ticket: &CacheTicket) -> CacheResult<CacheEntry>;

    /// Read the latest revision without a ticket.
    async fn query_key(&self, key: &str) -> CacheResult<Option<CacheEntry>>;

    /// Return all entries whose status is in `statuses`. With
    /// `include_open_tickets = false`, entries whose key has any open ticket
    /// are filtered out.
    async fn query_status(
        &self,
        statuses: &[&str],
        include_open_tickets: bool,
    ) -> CacheResult<Vec<CacheEntry>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Value codec
// ─────────────────────────────────────────────────────────────────────────────

/// Serializes cache values with an explicit list of transient fields.
///
/// Transient fields are stripped before persistence and read back as their
/// zero value (JSON `null`). The engine itself never inspects values.
pub trait ValueCodec: Send + Sync {
    /// Names of top-level fields that are never persisted.
    fn transient_fields(&self) -> &[String];

    fn encode(&self, value: &serde_json::Value) -> CacheResult<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> CacheResult<serde_json::Value>;
}

/// JSON value codec with declared transient fields.
#[derive(Debug, Clone, Default)]
pub struct JsonValueCodec {
    transient: Vec<String>,
}

impl JsonValueCodec {
    pub fn new(transient: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { transient: transient.into_iter().map(Into::into).collect() }
    }
}

impl ValueCodec for JsonValueCodec {
    fn transient_fields(&self) -> &[String] {
        &self.transient
    }

    fn encode(&self, value: &serde_json::Value) -> CacheResult<Vec<u8>> {
        let mut persisted = value.clone();
        if let serde_json::Value::Object(map) = &mut persisted {
            for field in &self.transient {
                map.remove(field);
            }
        }
        serde_json::to_vec(&persisted).map_err(|e| CacheError::Storage(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> CacheResult<serde_json::Value> {
        let mut value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| CacheError::Storage(e.to_string()))?;
        if let serde_json::Value::Object(map) = &mut value {
            for field in &self.transient {
                map.entry(field.clone()).or_insert(serde_json::Value::Null);
            }
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reserved_prefixes_rejected() {
        assert!(validate_cache_key("_hidden").is_err());
        assert!(validate_cache_key("trac_internal").is_err());
        assert!(validate_cache_key("job-1").is_ok());
    }

    #[test]
    fn empty_and_malformed_keys_rejected() {
        assert!(validate_cache_key("").is_err());
        assert!(validate_cache_key("-leading-dash").is_err());
        assert!(validate_cache_key("has space").is_err());
        assert!(validate_cache_key("job.v2_final-1").is_ok());
    }

    #[test]
    fn granted_ticket_is_valid_until_expiry() {
        let ticket = CacheTicket::granted("k1", 0, Duration::seconds(5));
        assert!(ticket.is_valid_at(Utc::now()));
        assert!(!ticket.is_valid_at(Utc::now() + Duration::seconds(6)));
    }

    #[test]
    fn superseded_ticket_is_never_valid() {
        let ticket = CacheTicket::superseded("k1", 2);
        assert!(!ticket.is_valid_at(Utc::now()));
    }

    #[test]
    fn codec_strips_transient_fields() {
        let codec = JsonValueCodec::new(["process_handle"]);
        let value = json!({ "job_key": "j1", "process_handle": 42 });

        let bytes = codec.encode(&value).unwrap();
        let persisted: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(persisted.get("process_handle").is_none());

        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded["job_key"], "j1");
        assert_eq!(decoded["process_handle"], serde_json::Value::Null);
    }
}

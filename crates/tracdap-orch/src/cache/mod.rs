//! The job cache: ticket engine over SQL storage.
//!
//! Semantics live in the kernel contract
//! ([`tracdap_kernel::cache::JobCache`]); this module provides the SQLite
//! implementation. The unique index on `(cache_name, entry_key)` in the
//! ticket table is the single source of mutual exclusion - there are no
//! application-level locks, so exclusivity holds across processes and
//! survives restarts.

mod sql;

pub use sql::SqlJobCache;

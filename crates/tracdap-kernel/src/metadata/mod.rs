//! Metadata DAL contract.
//!
//! The gateway and orchestrator consume metadata persistence through this
//! interface only; the SQL DAL behind it is an external collaborator.
//! Object definitions are carried as JSON values here - the contract does
//! not depend on generated message types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Metadata DAL errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetadataError {
    #[error("metadata item not found: {0}")]
    NotFound(String),

    #[error("metadata version mismatch: {0}")]
    WrongVersion(String),

    #[error("metadata access denied: {0}")]
    Access(String),

    #[error("metadata storage error: {0}")]
    Storage(String),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Object classes tracked by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectType {
    Data,
    Model,
    Flow,
    Job,
    File,
    Schema,
    Storage,
}

/// Identity of one object version + tag version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagHeader {
    pub object_type: ObjectType,
    pub object_id: Uuid,
    pub object_version: u32,
    pub tag_version: u32,
    pub object_timestamp: DateTime<Utc>,
    pub tag_timestamp: DateTime<Utc>,
}

/// Selector for a read: explicit versions or latest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectSelector {
    pub object_type: ObjectType,
    pub object_id: Uuid,
    /// Absent means latest object version.
    pub object_version: Option<u32>,
    /// Absent means latest tag version.
    pub tag_version: Option<u32>,
}

impl ObjectSelector {
    pub fn latest(object_type: ObjectType, object_id: Uuid) -> Self {
        Self { object_type, object_id, object_version: None, tag_version: None }
    }
}

/// One stored object: header, definition body, tag attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagRecord {
    pub header: TagHeader,
    /// Object definition as canonical JSON.
    pub definition: serde_json::Value,
    /// Tag attributes.
    pub attrs: BTreeMap<String, serde_json::Value>,
}

/// A search over one object type by attribute equality terms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub object_type: ObjectType,
    pub terms: Vec<(String, serde_json::Value)>,
}

/// Read/write interface over metadata persistence.
///
/// Implementations must be safe for concurrent use; each call is an
/// independent transaction against a consistent snapshot.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Read one object by selector.
    async fn read_object(&self, tenant: &str, selector: &ObjectSelector)
    -> MetadataResult<TagRecord>;

    /// Read a batch of objects; fails if any selector misses.
    async fn read_batch(
        &self,
        tenant: &str,
        selectors: &[ObjectSelector],
    ) -> MetadataResult<Vec<TagRecord>>;

    /// Save new objects or new versions, returning the assigned headers.
    async fn save_objects(&self, tenant: &str, records: Vec<TagRecord>)
    -> MetadataResult<Vec<TagHeader>>;

    /// Search by attribute terms.
    async fn search(&self, tenant: &str, query: &SearchQuery) -> MetadataResult<Vec<TagRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Minimal in-memory store, the kind of test double orchestrator
    /// tests plug in behind the contract.
    #[derive(Default)]
    struct InMemoryStore {
        objects: Mutex<HashMap<(String, Uuid), TagRecord>>,
    }

    #[async_trait]
    impl MetadataStore for InMemoryStore {
        async fn read_object(
            &self,
            tenant: &str,
            selector: &ObjectSelector,
        ) -> MetadataResult<TagRecord> {
            self.objects
                .lock()
                .unwrap()
                .get(&(tenant.to_string(), selector.object_id))
                .cloned()
                .ok_or_else(|| MetadataError::NotFound(selector.object_id.to_string()))
        }

        async fn read_batch(
            &self,
            tenant: &str,
            selectors: &[ObjectSelector],
        ) -> MetadataResult<Vec<TagRecord>> {
            let mut records = Vec::with_capacity(selectors.len());
            for selector in selectors {
                records.push(self.read_object(tenant, selector).await?);
            }
            Ok(records)
        }

        async fn save_objects(
            &self,
            tenant: &str,
            records: Vec<TagRecord>,
        ) -> MetadataResult<Vec<TagHeader>> {
            let mut objects = self.objects.lock().unwrap();
            let mut headers = Vec::with_capacity(records.len());
            for record in records {
                headers.push(record.header.clone());
                objects.insert((tenant.to_string(), record.header.object_id), record);
            }
            Ok(headers)
        }

        async fn search(
            &self,
            tenant: &str,
            query: &SearchQuery,
        ) -> MetadataResult<Vec<TagRecord>> {
            let objects = self.objects.lock().unwrap();
            Ok(objects
                .iter()
                .filter(|((t, _), record)| {
                    t == tenant
                        && record.header.object_type == query.object_type
                        && query.terms.iter().all(|(attr, value)| {
                            record.attrs.get(attr) == Some(value)
                        })
                })
                .map(|(_, record)| record.clone())
                .collect())
        }
    }

    fn record(object_id: Uuid, attr: (&str, &str)) -> TagRecord {
        let now = Utc::now();
        TagRecord {
            header: TagHeader {
                object_type: ObjectType::Job,
                object_id,
                object_version: 1,
                tag_version: 1,
                object_timestamp: now,
                tag_timestamp: now,
            },
            definition: serde_json::json!({ "jobType": "RUN_MODEL" }),
            attrs: [(attr.0.to_string(), serde_json::json!(attr.1))].into(),
        }
    }

    #[tokio::test]
    async fn save_read_and_search_through_the_contract() {
        let store = InMemoryStore::default();
        let id = Uuid::new_v4();

        let headers = store
            .save_objects("ACME", vec![record(id, ("trac_job_status", "SUCCEEDED"))])
            .await
            .unwrap();
        assert_eq!(headers.len(), 1);

        let read = store
            .read_object("ACME", &ObjectSelector::latest(ObjectType::Job, id))
            .await
            .unwrap();
        assert_eq!(read.header.object_id, id);

        let found = store
            .search(
                "ACME",
                &SearchQuery {
                    object_type: ObjectType::Job,
                    terms: vec![("trac_job_status".into(), serde_json::json!("SUCCEEDED"))],
                },
            )
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let missing = store
            .read_object("OTHER", &ObjectSelector::latest(ObjectType::Job, id))
            .await;
        assert!(matches!(missing, Err(MetadataError::NotFound(_))));
    }
}

//! In-memory document store.
//!
//! Backs tests and single-process deployments. All operations take a single
//! collection-map lock, so `transact` gets genuine read-decide-write
//! atomicity and `increment` never loses updates under concurrency.

use crate::error::{StoreError, StoreResult};
use crate::query::{compare_values, Query};
use crate::{Document, DocumentRecord, DocumentStore, TxnDecision, TxnFn, TxnOutcome};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

type Collections = HashMap<String, BTreeMap<String, Document>>;

/// Thread-safe in-memory [`DocumentStore`].
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<Collections>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection. Test and diagnostics helper.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .unwrap()
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    fn require_object(collection: &str, id: &str, doc: &Value) -> StoreResult<()> {
        if doc.is_object() {
            Ok(())
        } else {
            Err(StoreError::InvalidDocument {
                collection: collection.to_string(),
                id: id.to_string(),
            })
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        let collections = self.collections.read().unwrap();
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn set(&self, collection: &str, id: &str, doc: Document) -> StoreResult<()> {
        Self::require_object(collection, id, &doc)?;
        let mut collections = self.collections.write().unwrap();
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        Ok(())
    }

    async fn merge(&self, collection: &str, id: &str, patch: Document) -> StoreResult<()> {
        Self::require_object(collection, id, &patch)?;
        let mut collections = self.collections.write().unwrap();
        let docs = collections.entry(collection.to_string()).or_default();
        let entry = docs
            .entry(id.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        let Some(target) = entry.as_object_mut() else {
            return Err(StoreError::InvalidDocument {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        };
        if let Value::Object(fields) = patch {
            for (key, value) in fields {
                target.insert(key, value);
            }
        }
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        let mut collections = self.collections.write().unwrap();
        if let Some(docs) = collections.get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn delete_batch(&self, collection: &str, ids: &[String]) -> StoreResult<usize> {
        if ids.len() > crate::MAX_BATCH_SIZE {
            return Err(StoreError::BatchTooLarge(ids.len()));
        }
        let mut collections = self.collections.write().unwrap();
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut removed = 0;
        for id in ids {
            if docs.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn increment(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        delta: i64,
    ) -> StoreResult<i64> {
        let mut collections = self.collections.write().unwrap();
        let docs = collections.entry(collection.to_string()).or_default();
        let entry = docs
            .entry(id.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        let Some(target) = entry.as_object_mut() else {
            return Err(StoreError::InvalidDocument {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        };
        let current = match target.get(field) {
            None | Some(Value::Null) => 0,
            Some(value) => value.as_i64().ok_or_else(|| StoreError::NotAnInteger {
                collection: collection.to_string(),
                id: id.to_string(),
                field: field.to_string(),
            })?,
        };
        let next = current + delta;
        target.insert(field.to_string(), Value::from(next));
        Ok(next)
    }

    async fn query(&self, collection: &str, query: Query) -> StoreResult<Vec<DocumentRecord>> {
        let collections = self.collections.read().unwrap();
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut records: Vec<DocumentRecord> = docs
            .iter()
            .filter(|(_, doc)| {
                query
                    .filters
                    .iter()
                    .all(|filter| filter.matches(doc.get(filter.field())))
            })
            .map(|(id, doc)| DocumentRecord {
                id: id.clone(),
                doc: doc.clone(),
            })
            .collect();

        if let Some(order) = &query.order_by {
            records.sort_by(|a, b| {
                let ordering = match (a.doc.get(&order.field), b.doc.get(&order.field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        if let Some(limit) = query.limit {
            records.truncate(limit);
        }

        Ok(records)
    }

    async fn transact<'a>(
        &self,
        collection: &str,
        id: &str,
        mut op: TxnFn<'a>,
    ) -> StoreResult<TxnOutcome> {
        let mut collections = self.collections.write().unwrap();
        let docs = collections.entry(collection.to_string()).or_default();
        let current = docs.get(id);
        match op(current) {
            TxnDecision::Write(doc) => {
                Self::require_object(collection, id, &doc)?;
                docs.insert(id.to_string(), doc);
                Ok(TxnOutcome::Committed)
            }
            TxnDecision::Skip => Ok(TxnOutcome::Skipped),
            TxnDecision::Abort => Ok(TxnOutcome::Aborted),
        }
    }
}

//! Test doubles for the store contract.
//!
//! Shared across crates so the dispatch core can exercise its
//! storage-failure policies (fail-open breaker checks, fail-closed locks
//! and quota writes) without a real flaky backend.

use crate::error::{StoreError, StoreResult};
use crate::query::Query;
use crate::{Document, DocumentRecord, DocumentStore, TxnFn, TxnOutcome};
use async_trait::async_trait;

/// A store whose every operation fails with a backend error.
#[derive(Debug, Default)]
pub struct UnavailableStore;

impl UnavailableStore {
    pub fn new() -> Self {
        Self
    }

    fn err<T>() -> StoreResult<T> {
        Err(StoreError::Backend("store unavailable".to_string()))
    }
}

#[async_trait]
impl DocumentStore for UnavailableStore {
    async fn get(&self, _collection: &str, _id: &str) -> StoreResult<Option<Document>> {
        Self::err()
    }

    async fn set(&self, _collection: &str, _id: &str, _doc: Document) -> StoreResult<()> {
        Self::err()
    }

    async fn merge(&self, _collection: &str, _id: &str, _patch: Document) -> StoreResult<()> {
        Self::err()
    }

    async fn delete(&self, _collection: &str, _id: &str) -> StoreResult<()> {
        Self::err()
    }

    async fn delete_batch(&self, _collection: &str, _ids: &[String]) -> StoreResult<usize> {
        Self::err()
    }

    async fn increment(
        &self,
        _collection: &str,
        _id: &str,
        _field: &str,
        _delta: i64,
    ) -> StoreResult<i64> {
        Self::err()
    }

    async fn query(&self, _collection: &str, _query: Query) -> StoreResult<Vec<DocumentRecord>> {
        Self::err()
    }

    async fn transact<'a>(
        &self,
        _collection: &str,
        _id: &str,
        _op: TxnFn<'a>,
    ) -> StoreResult<TxnOutcome> {
        Self::err()
    }
}

//! Transactional document store abstraction.
//!
//! The dispatch core keeps all correctness-relevant state (quota counters,
//! circuit state, job status, locks) in a document database. This crate
//! defines the store contract the core programs against and ships an
//! in-memory implementation with real transaction atomicity.
//!
//! The core never branches on which implementation it is talking to; every
//! backend-specific concern lives behind [`DocumentStore`].
//!
//! ## Contract
//!
//! - `get`/`set`/`merge`/`delete`: single-document operations; `merge`
//!   patches top-level fields and creates the document if absent.
//! - `increment`: atomic integer field increment, creating the document
//!   and field as needed.
//! - `query`: equality and range filters with ordering and limit.
//! - `transact`: read-then-conditional-write on a single document. The
//!   closure sees the current document and decides to write, skip, or
//!   abort; the whole read-decide-write is atomic with respect to all
//!   other writers of that document.
//! - `delete_batch`: bounded multi-document delete (≤ [`MAX_BATCH_SIZE`]).

pub mod error;
pub mod memory;
pub mod query;
pub mod retry;
pub mod testing;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use query::{Filter, OrderBy, Query};

use async_trait::async_trait;
use serde_json::Value;

/// A stored document. Always a JSON object at the top level.
pub type Document = Value;

/// Maximum writes accepted by a single batch operation.
pub const MAX_BATCH_SIZE: usize = 500;

/// A document together with its id, as returned by queries.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: String,
    pub doc: Document,
}

/// Decision taken by a transaction closure after seeing the current document.
pub enum TxnDecision {
    /// Replace the document with this value.
    Write(Document),
    /// Leave the document untouched; the transaction succeeds without writing.
    Skip,
    /// Leave the document untouched; the precondition did not hold.
    Abort,
}

/// Outcome of a completed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    Committed,
    Skipped,
    Aborted,
}

impl TxnOutcome {
    pub fn committed(&self) -> bool {
        matches!(self, TxnOutcome::Committed)
    }
}

/// Boxed transaction closure. Runs under the store's single-document
/// atomicity guarantee; may be invoked more than once if the backend
/// retries on contention, so it must be free of external side effects.
pub type TxnFn<'a> = Box<dyn FnMut(Option<&Document>) -> TxnDecision + Send + 'a>;

/// Abstract transactional document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a single document.
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>>;

    /// Create or fully replace a document.
    async fn set(&self, collection: &str, id: &str, doc: Document) -> StoreResult<()>;

    /// Patch top-level fields, creating the document if it does not exist.
    async fn merge(&self, collection: &str, id: &str, patch: Document) -> StoreResult<()>;

    /// Delete a single document. Deleting a missing document is not an error.
    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()>;

    /// Delete up to [`MAX_BATCH_SIZE`] documents; returns how many existed.
    async fn delete_batch(&self, collection: &str, ids: &[String]) -> StoreResult<usize>;

    /// Atomically add `delta` to an integer field, returning the new value.
    /// Creates the document and field (starting from 0) as needed.
    async fn increment(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        delta: i64,
    ) -> StoreResult<i64>;

    /// Run a query against a collection.
    async fn query(&self, collection: &str, query: Query) -> StoreResult<Vec<DocumentRecord>>;

    /// Atomic read-then-conditional-write on a single document.
    async fn transact<'a>(
        &self,
        collection: &str,
        id: &str,
        op: TxnFn<'a>,
    ) -> StoreResult<TxnOutcome>;
}

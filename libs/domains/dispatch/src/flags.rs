//! Operational kill switch.
//!
//! A single flags document gates queue drains and disaster recovery.
//! When the system is suspended both loops return empty reports without
//! touching any job, so an operator can freeze sending instantly.

use crate::collections;
use crate::error::DispatchResult;
use docstore::DocumentStore;
use serde_json::json;

const FLAGS_DOC: &str = "runtime";
const SUSPENDED_FIELD: &str = "system_suspended";

/// Whether dispatch is operator-suspended. A missing flags document
/// means the system runs normally.
pub async fn system_suspended(store: &dyn DocumentStore) -> DispatchResult<bool> {
    let doc = store.get(collections::OPS_FLAGS, FLAGS_DOC).await?;
    Ok(doc
        .and_then(|d| d.get(SUSPENDED_FIELD).and_then(|v| v.as_bool()))
        .unwrap_or(false))
}

/// Flip the kill switch.
pub async fn set_suspended(store: &dyn DocumentStore, suspended: bool) -> DispatchResult<()> {
    store
        .merge(
            collections::OPS_FLAGS,
            FLAGS_DOC,
            json!({ SUSPENDED_FIELD: suspended }),
        )
        .await?;
    Ok(())
}

//! Dispatch API - Entry Point
//!
//! HTTP surface that triggers queue drains, disaster recovery sweeps
//! and health checks, and accepts new mail jobs.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dispatch_api::run().await
}

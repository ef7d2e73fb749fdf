//! Batch Worker Service - Entry Point
//!
//! Background worker that drains queued notifications in batches and
//! serves the queue admin API.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    batch_worker::run().await
}

// Background worker that ends live sessions once they have run their course.

use std::sync::Arc;
use std::time::Duration;

use crate::engine::live::{now_ms, LiveService};

/// Spawn the deadline sweep. Runs for the lifetime of the process.
pub fn spawn_deadline_worker(live: Arc<LiveService>, poll: Duration) {
    tokio::spawn(async move {
        tracing::info!("Deadline worker started (every {} ms)", poll.as_millis());
        loop {
            tokio::time::sleep(poll).await;
            match live.check_deadlines_at(now_ms()).await {
                Ok(ended) if !ended.is_empty() => {
                    tracing::info!("Deadline sweep ended sessions {ended:?}");
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Deadline sweep failed: {e}"),
            }
        }
    });
}

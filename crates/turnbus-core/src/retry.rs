//! Fixed-backoff retry for transient failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Classify;

/// Delays between ingest publish attempts. Six attempts total: one up
/// front, then one after each listed sleep.
pub const BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_millis(10),
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

/// Runs `op`, retrying on transient errors per [`BACKOFF_SCHEDULE`].
///
/// Non-transient errors surface immediately. The sleeps are await points,
/// so dropping the returned future cancels the schedule mid-flight.
pub async fn retry_transient<T, E, F, Fut>(mut op: F) -> Result<T, E>
where
    E: Classify + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < BACKOFF_SCHEDULE.len() => {
                let delay = BACKOFF_SCHEDULE[attempt];
                attempt += 1;
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "transient failure, backing off");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

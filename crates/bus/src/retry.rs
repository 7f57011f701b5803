//! Constant-wait retry for connecting to the bus.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Run `op` up to `attempts` times, sleeping `wait` between failures.
/// Returns the last error when every attempt fails.
pub async fn with_constant_wait<T, E, F, Fut>(
    attempts: u32,
    wait: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!(attempt, attempts, error = %err, "bus operation failed, retrying");
                attempt += 1;
                tokio::time::sleep(wait).await;
            }
            Err(err) => return Err(err),
        }
    }
}

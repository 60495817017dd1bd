//! Retry-until-true readiness polling.
//!
//! Used for "is the ssh port open yet" and "has the node left the booting
//! state". The probe is re-run on a fixed cadence; a probe that cannot
//! reach its target counts as "not ready", not as a failure. Callers that
//! must not wait forever pass a deadline, which turns an endless wait into
//! a reported timeout.

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{Error, Result};

/// Cadence used by the lifecycle pipelines between readiness probes.
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Cadence used while waiting for a freshly booted node to settle.
pub const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long a single TCP probe may take before counting as closed.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Re-run `probe` every `interval` until it reports ready.
///
/// A probe returning `Err` aborts the wait; probes should map "target not
/// reachable yet" to `Ok(false)` themselves. With `deadline` set, the wait
/// fails with [`Error::Timeout`] once the total elapsed time exceeds it.
pub async fn wait_until<F, Fut>(
    what: &str,
    interval: Duration,
    deadline: Option<Duration>,
    mut probe: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let started = Instant::now();

    loop {
        if probe().await? {
            return Ok(());
        }

        if let Some(limit) = deadline {
            if started.elapsed() >= limit {
                return Err(Error::Timeout {
                    what: what.to_string(),
                    after: limit,
                });
            }
        }

        debug!(what = %what, interval_secs = interval.as_secs(), "not ready, rechecking");
        tokio::time::sleep(interval).await;
    }
}

/// Probe whether a TCP port accepts connections.
///
/// Connection refused, unreachable hosts, and DNS failures all report
/// `false`; only an open port reports `true`.
pub async fn port_open(host: &str, port: u16) -> bool {
    let target = format!("{host}:{port}");

    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&target)).await,
        Ok(Ok(_))
    )
}

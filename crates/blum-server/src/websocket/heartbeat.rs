//! Heartbeat liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionLiveness;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No inbound activity within the timeout window.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Watch a connection's liveness until it times out or `cancel` fires.
///
/// Each `interval` tick consumes the alive flag. `timeout / interval`
/// consecutive silent ticks (at least one) mean the peer is gone. Pings
/// themselves are sent by the connection writer on the same interval.
pub async fn run_heartbeat(
    liveness: Arc<ConnectionLiveness>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut check_interval = time::interval(interval.max(MIN_INTERVAL));
    let mut missed: u32 = 0;
    let max_missed = max_missed(interval, timeout);

    loop {
        tokio::select! {
            _ = check_interval.tick() => {
                if liveness.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}

fn max_missed(interval: Duration, timeout: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    u32::try_from(timeout.as_millis() / interval_ms)
        .unwrap_or(u32::MAX)
        .max(1)
}

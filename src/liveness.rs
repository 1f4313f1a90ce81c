//! Heartbeat-based liveness monitor.
//!
//! Runs for the life of the process. Each tick removes peers whose last
//! heartbeat is older than the configured timeout and drops buffered signals
//! past their TTL.

use tokio::time::{Instant, MissedTickBehavior};

use crate::state::RelayState;

/// Sweep loop. Never returns.
pub async fn run(state: RelayState) {
    let period = state.config.sweep_interval();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        interval_secs = period.as_secs(),
        timeout_secs = state.config.heartbeat_timeout_secs,
        "Liveness monitor started"
    );

    loop {
        interval.tick().await;

        let removed = state.sweep(Instant::now());
        if removed > 0 {
            tracing::info!(count = removed, "Expired stale peers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::RelayConfig;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_monitor_removes_silent_peer() {
        let config = RelayConfig {
            heartbeat_timeout_secs: 0,
            sweep_interval_secs: 1,
            ..RelayConfig::default()
        };
        let state = RelayState::new(config);
        let (tx, _rx) = mpsc::unbounded_channel();
        state.register_peer("quiet", "Quiet", None, tx);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let monitor = tokio::spawn(run(state.clone()));

        let gone = tokio::time::timeout(Duration::from_secs(3), async {
            while state.is_registered("quiet") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        monitor.abort();

        assert!(gone.is_ok(), "peer was not expired");
        assert_eq!(state.online_count(), 0);
    }

    #[tokio::test]
    async fn test_monitor_keeps_fresh_peer() {
        let state = RelayState::new(RelayConfig {
            sweep_interval_secs: 1,
            ..RelayConfig::default()
        });
        let (tx, _rx) = mpsc::unbounded_channel();
        state.register_peer("lively", "Lively", None, tx);

        let monitor = tokio::spawn(run(state.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        monitor.abort();

        assert!(state.is_registered("lively"));
    }
}

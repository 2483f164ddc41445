//! TCP reachability probe feeding the connectivity monitor.

use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::debug;

use ocuscan_sync::ConnectivityMonitor;

use crate::config::ProbeConfig;

/// Whether a TCP connection to `address` opens within `limit`.
pub async fn reachable(address: &str, limit: Duration) -> bool {
    match timeout(limit, TcpStream::connect(address)).await {
        Ok(Ok(_)) => true,
        Ok(Err(e)) => {
            debug!("Probe to {} failed: {}", address, e);
            false
        }
        Err(_) => {
            debug!("Probe to {} timed out", address);
            false
        }
    }
}

/// Probe on every tick and report each reading to `monitor` until `shutdown`
/// resolves.
pub async fn run(monitor: ConnectivityMonitor, config: ProbeConfig, shutdown: impl Future) {
    let limit = Duration::from_millis(config.timeout_ms);
    let mut ticks = interval(Duration::from_secs(config.interval_secs.max(1)));
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticks.tick() => {
                let online = reachable(&config.address, limit).await;
                monitor.report(online);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reachable_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        assert!(reachable(&address, Duration::from_secs(1)).await);

        drop(listener);
        assert!(!reachable(&address, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_run_reports_and_stops() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ProbeConfig {
            address: listener.local_addr().unwrap().to_string(),
            interval_secs: 1,
            timeout_ms: 500,
        };
        let monitor = ConnectivityMonitor::new(false);
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let (went_online_tx, went_online_rx) = tokio::sync::oneshot::channel();
        let went_online_tx = std::sync::Mutex::new(Some(went_online_tx));
        let _sub = monitor.on_transition(move |online| {
            if online {
                if let Some(tx) = went_online_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            }
        });

        let task = tokio::spawn(run(monitor.clone(), config, async {
            let _ = stop_rx.await;
        }));

        // The first tick fires immediately.
        timeout(Duration::from_secs(5), went_online_rx)
            .await
            .unwrap()
            .unwrap();
        assert!(monitor.currently_online());

        stop_tx.send(()).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}

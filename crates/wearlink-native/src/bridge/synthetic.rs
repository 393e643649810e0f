//! Wall-clock pacing for simulated feeds
//!
//! [`Simulator`] produces samples on synthetic time; this drives it from a
//! tokio interval so consumers see the same cadence a real sensor would
//! give them.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use wearlink_core::simulation::Simulator;
use wearlink_core::types::Sample;

/// Emit one simulated sample per `tick` into `queue` until cancelled.
///
/// When `driver` is supplied, its latest heart rate replaces the random walk
/// before every sample.
pub(crate) async fn simulated_stream(
    mut simulator: Simulator,
    tick: Duration,
    queue: mpsc::Sender<Sample>,
    driver: Option<watch::Receiver<Option<u16>>>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }

        if let Some(driver) = &driver {
            simulator.set_driver(*driver.borrow());
        }
        let Some(sample) = simulator.next() else {
            return;
        };

        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            sent = queue.send(sample) => {
                if sent.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wearlink_core::simulation::SimulationConfig;
    use wearlink_core::types::Metric;

    fn simulator(metric: Metric) -> Simulator {
        Simulator::with_config(
            metric,
            None,
            SimulationConfig {
                seed: Some(1),
                ..Default::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_paced_by_tick() {
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(simulated_stream(
            simulator(Metric::Ecg),
            Duration::from_millis(100),
            tx,
            None,
            cancel.clone(),
        ));

        // First tick fires immediately
        assert!(rx.recv().await.is_some());
        let start = tokio::time::Instant::now();
        assert!(rx.recv().await.is_some());
        assert_eq!(start.elapsed(), Duration::from_millis(100));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_follows_driver() {
        let (tx, mut rx) = mpsc::channel(16);
        let (driver_tx, driver_rx) = watch::channel(Some(150));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(simulated_stream(
            simulator(Metric::Ppg),
            Duration::from_millis(10),
            tx,
            Some(driver_rx),
            cancel.clone(),
        ));

        let Some(Sample::Ppg(first)) = rx.recv().await else {
            panic!("expected PPG");
        };
        assert_eq!(first.derived_heart_rate, Some(150));

        driver_tx.send_replace(Some(55));
        // Drain anything produced before the update was seen
        let mut latest = None;
        for _ in 0..5 {
            if let Some(Sample::Ppg(s)) = rx.recv().await {
                latest = s.derived_heart_rate;
            }
        }
        assert_eq!(latest, Some(55));

        cancel.cancel();
        task.await.unwrap();
    }
}

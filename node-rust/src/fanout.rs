//! Frame fanout.
//!
//! Every decoded frame is multicast to N independent sinks. Each sink runs
//! on its own task behind a bounded queue (depth 256): a slow or dead sink
//! lags and sheds its own oldest frames, it never blocks the receiver or a
//! neighbor. Per-sink frame order matches production order; cross-sink
//! ordering is unspecified.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use vehicle_types::TelemetryFrame;

pub const SINK_QUEUE_DEPTH: usize = 256;

#[async_trait]
pub trait FrameSink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, frame: TelemetryFrame);
}

#[derive(Clone, Default)]
pub struct SinkStats {
    delivered: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl SinkStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct Fanout {
    tx: broadcast::Sender<TelemetryFrame>,
    stats: Mutex<HashMap<&'static str, SinkStats>>,
}

impl Fanout {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SINK_QUEUE_DEPTH);
        Self { tx, stats: Mutex::new(HashMap::new()) }
    }

    /// Hand one frame to every attached sink. Never blocks; with no sinks
    /// attached the frame is discarded.
    pub fn publish(&self, frame: TelemetryFrame) {
        let _ = self.tx.send(frame);
    }

    /// Spawn the delivery task for one sink.
    pub fn attach(
        &self,
        sink: Arc<dyn FrameSink>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut rx = self.tx.subscribe();
        let stats = self
            .stats
            .lock()
            .expect("fanout stats lock")
            .entry(sink.name())
            .or_default()
            .clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    msg = rx.recv() => match msg {
                        Ok(frame) => {
                            sink.deliver(frame).await;
                            stats.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            stats.dropped.fetch_add(n, Ordering::Relaxed);
                            warn!("Sink {}: dropped {n} frames under back-pressure", sink.name());
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("Sink {}: delivery task stopped", sink.name());
        })
    }

    pub fn stats(&self) -> Vec<(&'static str, u64, u64)> {
        self.stats
            .lock()
            .expect("fanout stats lock")
            .iter()
            .map(|(name, s)| (*name, s.delivered(), s.dropped()))
            .collect()
    }
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use vehicle_types::{Field, FieldValue};

    fn frame(n: i64) -> TelemetryFrame {
        TelemetryFrame {
            vin: "5YJ3E1EA1NF000000".into(),
            captured_at: n,
            fields: [(Field::Odometer, FieldValue::Float(n as f64))].into_iter().collect(),
        }
    }

    struct Recorder {
        name: &'static str,
        seen: Mutex<Vec<i64>>,
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl FrameSink for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn deliver(&self, frame: TelemetryFrame) {
            let permit = self.gate.acquire().await.expect("gate closed");
            permit.forget();
            self.seen.lock().unwrap().push(frame.captured_at);
        }
    }

    struct Panicker;

    #[async_trait]
    impl FrameSink for Panicker {
        fn name(&self) -> &'static str {
            "panicker"
        }
        async fn deliver(&self, _frame: TelemetryFrame) {
            panic!("sink failure must stay isolated");
        }
    }

    #[tokio::test]
    async fn sinks_see_frames_in_order_despite_a_panicking_neighbor() {
        let fanout = Fanout::new();
        let (_tx, shutdown) = watch::channel(false);

        let gate = Arc::new(Semaphore::new(1000));
        let recorder = Arc::new(Recorder { name: "recorder", seen: Mutex::new(Vec::new()), gate });
        let handle = fanout.attach(recorder.clone(), shutdown.clone());
        let _panicker = fanout.attach(Arc::new(Panicker), shutdown.clone());

        for n in 0..50 {
            fanout.publish(frame(n));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, (0..50).collect::<Vec<i64>>());
        assert!(!handle.is_finished());
    }

    #[tokio::test]
    async fn slow_sink_sheds_oldest_frames_without_blocking_publisher() {
        let fanout = Fanout::new();
        let (_tx, shutdown) = watch::channel(false);

        let gate = Arc::new(Semaphore::new(0));
        let recorder = Arc::new(Recorder { name: "slow", seen: Mutex::new(Vec::new()), gate: gate.clone() });
        fanout.attach(recorder.clone(), shutdown.clone());

        // First frame parks the sink inside deliver; the rest pile into the
        // queue and overflow it.
        let total = 600i64;
        for n in 0..total {
            fanout.publish(frame(n));
        }
        gate.add_permits(10_000);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(*seen.last().unwrap(), total - 1, "newest frame survives");
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "order preserved");

        let stats = fanout.stats();
        let (_, delivered, dropped) = stats.iter().find(|(n, _, _)| *n == "slow").unwrap();
        assert!(*dropped > 0, "overflow must be counted");
        assert_eq!(delivered + dropped, total as u64);
    }
}

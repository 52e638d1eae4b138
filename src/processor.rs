// ===============================
// src/processor.rs
// ===============================
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::{sync::watch, time::sleep};
use tracing::{debug, info};

use crate::config::ProcessorCfg;
use crate::dispatcher::Handler;
use crate::domain::{JobOutcome, OrderId, OrderStatus};
use crate::metrics::{
    MetricsSink, ORDERS_FAILED, ORDERS_PROCESSING_INTERRUPTED, ORDERS_SUCCESS, ORDER_PROCESSING_DURATION,
};
use crate::rng::Randomness;
use crate::store::{OrderStore, StoreError};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Catat durasi saat keluar scope: selesai normal, error, diinterupsi, atau panic.
struct DurationGuard<'a> {
    metrics: &'a dyn MetricsSink,
    started: Instant,
}

impl Drop for DurationGuard<'_> {
    fn drop(&mut self) {
        self.metrics.record_duration(ORDER_PROCESSING_DURATION, self.started.elapsed());
    }
}

/// Tunggu sampai sinyal cancel = true. Kalau sender sudah drop, tidak pernah selesai.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Satu unit kerja simulasi: delay acak, tentukan outcome, simpan, catat metric.
pub struct Processor {
    store: Arc<dyn OrderStore>,
    metrics: Arc<dyn MetricsSink>,
    rng: Arc<dyn Randomness>,
    cfg: ProcessorCfg,
}

impl Processor {
    pub fn new(
        store: Arc<dyn OrderStore>,
        metrics: Arc<dyn MetricsSink>,
        rng: Arc<dyn Randomness>,
        cfg: ProcessorCfg,
    ) -> Self {
        Self { store, metrics, rng, cfg }
    }

    pub async fn run(
        &self,
        order_id: OrderId,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<JobOutcome, ProcessError> {
        // 1) fetch
        let Some(mut order) = self.store.find_by_id(order_id).await? else {
            debug!(order_id, "order vanished before processing, skip");
            return Ok(JobOutcome::Missing);
        };
        if order.status.is_terminal() {
            debug!(order_id, status = %order.status, "order already terminal, skip");
            return Ok(JobOutcome::Skipped(order.status));
        }
        info!(order_id, item = %order.item, amount = order.amount, "processing order");

        let _timer = DurationGuard { metrics: self.metrics.as_ref(), started: Instant::now() };

        // 2) simulated latency, bisa diinterupsi
        let delay = self.rng.delay(self.cfg.min_delay, self.cfg.max_delay);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = cancelled(&mut cancel) => {
                info!(order_id, "order processing interrupted, status left unchanged");
                self.metrics.increment_counter(ORDERS_PROCESSING_INTERRUPTED);
                return Ok(JobOutcome::Interrupted);
            }
        }

        // 3) outcome
        order.status = if self.rng.fails(self.cfg.failure_probability) {
            OrderStatus::Failed
        } else {
            OrderStatus::Processed
        };

        // 4) persist (satu write penuh; last writer wins terhadap updateOrder)
        let saved = self.store.update(&order).await?;

        // 5) metrics
        match saved.status {
            OrderStatus::Failed => self.metrics.increment_counter(ORDERS_FAILED),
            _ => self.metrics.increment_counter(ORDERS_SUCCESS),
        }
        info!(order_id, status = %saved.status, delay_ms = delay.as_millis() as u64, "order processed");
        Ok(JobOutcome::Completed(saved.status))
    }
}

#[async_trait]
impl Handler for Processor {
    async fn handle(
        &self,
        order_id: OrderId,
        cancel: watch::Receiver<bool>,
    ) -> Result<JobOutcome, ProcessError> {
        self.run(order_id, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::rng::FixedRandom;
    use crate::store::MemoryStore;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        metrics: Arc<Metrics>,
    }

    fn processor(rng: FixedRandom) -> (Processor, Fixture) {
        let store = Arc::new(MemoryStore::new());
        let metrics = Arc::new(Metrics::default());
        let p = Processor::new(store.clone(), metrics.clone(), Arc::new(rng), ProcessorCfg::default());
        (p, Fixture { store, metrics })
    }

    fn no_cancel() -> watch::Receiver<bool> {
        // sender di-drop: sinyal cancel tidak akan pernah datang
        watch::channel(false).1
    }

    #[tokio::test]
    async fn success_path_marks_processed() {
        let (p, fx) = processor(FixedRandom::succeed(Duration::from_millis(2)));
        let o = fx.store.create("widget".into(), 9.99).await.unwrap();

        let out = p.run(o.id, no_cancel()).await.unwrap();
        assert_eq!(out, JobOutcome::Completed(OrderStatus::Processed));

        let saved = fx.store.find_by_id(o.id).await.unwrap().unwrap();
        assert_eq!(saved.status, OrderStatus::Processed);
        assert_eq!(saved.item, "widget");
        assert_eq!(saved.created_at, o.created_at);
        assert_eq!(fx.metrics.read_counter(ORDERS_SUCCESS), 1);
        assert_eq!(fx.metrics.read_counter(ORDERS_FAILED), 0);
        assert_eq!(fx.metrics.duration_summary(ORDER_PROCESSING_DURATION).unwrap().count, 1);
    }

    #[tokio::test]
    async fn failure_path_marks_failed() {
        let (p, fx) = processor(FixedRandom::fail(Duration::from_millis(1)));
        let o = fx.store.create("widget".into(), 1.0).await.unwrap();

        let out = p.run(o.id, no_cancel()).await.unwrap();
        assert_eq!(out, JobOutcome::Completed(OrderStatus::Failed));
        assert_eq!(fx.store.find_by_id(o.id).await.unwrap().unwrap().status, OrderStatus::Failed);
        assert_eq!(fx.metrics.read_counter(ORDERS_FAILED), 1);
        assert_eq!(fx.metrics.read_counter(ORDERS_SUCCESS), 0);
    }

    #[tokio::test]
    async fn missing_order_is_a_noop() {
        let (p, fx) = processor(FixedRandom::succeed(Duration::from_millis(1)));
        assert_eq!(p.run(404, no_cancel()).await.unwrap(), JobOutcome::Missing);
        assert!(fx.store.is_empty());
        assert!(fx.metrics.duration_summary(ORDER_PROCESSING_DURATION).is_none());
    }

    #[tokio::test]
    async fn terminal_order_is_not_touched() {
        let (p, fx) = processor(FixedRandom::fail(Duration::from_millis(1)));
        let mut o = fx.store.create("widget".into(), 1.0).await.unwrap();
        o.status = OrderStatus::Processed;
        fx.store.update(&o).await.unwrap();

        let out = p.run(o.id, no_cancel()).await.unwrap();
        assert_eq!(out, JobOutcome::Skipped(OrderStatus::Processed));
        assert_eq!(fx.store.find_by_id(o.id).await.unwrap().unwrap().status, OrderStatus::Processed);
        assert_eq!(fx.metrics.read_counter(ORDERS_FAILED), 0);
    }

    #[tokio::test]
    async fn interruption_leaves_status_and_counts_no_outcome() {
        let (p, fx) = processor(FixedRandom::succeed(Duration::from_secs(30)));
        let o = fx.store.create("widget".into(), 1.0).await.unwrap();
        let (tx, rx) = watch::channel(false);

        let fut = p.run(o.id, rx);
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send(true).unwrap();
        };
        let (out, _) = tokio::join!(fut, trigger);

        assert_eq!(out.unwrap(), JobOutcome::Interrupted);
        assert_eq!(fx.store.find_by_id(o.id).await.unwrap().unwrap().status, OrderStatus::Received);
        assert_eq!(fx.metrics.read_counter(ORDERS_SUCCESS), 0);
        assert_eq!(fx.metrics.read_counter(ORDERS_FAILED), 0);
        assert_eq!(fx.metrics.read_counter(ORDERS_PROCESSING_INTERRUPTED), 1);
        // durasi tetap dicatat
        assert_eq!(fx.metrics.duration_summary(ORDER_PROCESSING_DURATION).unwrap().count, 1);
    }
}

// ===============================
// src/dispatcher.rs (bounded worker pool)
// ===============================
//
// Pool dengan aturan core / max / queue:
// - worker < core            -> spawn worker baru, job langsung dikerjakan
// - backlog belum penuh      -> masuk backlog (worker idle ikut dihitung sebagai slot handoff);
//                               kalau belum ada worker sama sekali (core = 0), spawn satu
// - backlog penuh, < max     -> spawn burst worker
// - selain itu               -> DispatchError::Rejected
//
// Burst worker keluar setelah idle `keep_alive`. Satu worker = satu job pada satu waktu,
// jadi job yang jalan bersamaan tidak pernah > max_concurrency.
//
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::PoolCfg;
use crate::domain::{JobOutcome, OrderId};
use crate::metrics::{MetricsSink, ORDERS_PROCESSING_FAULTS, POOL_IN_FLIGHT, POOL_QUEUED, POOL_WORKERS};
use crate::processor::ProcessError;

/// Pekerjaan yang dijalankan worker untuk satu order id.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(
        &self,
        order_id: OrderId,
        cancel: watch::Receiver<bool>,
    ) -> Result<JobOutcome, ProcessError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("order {order_id} rejected: backlog full ({queued}/{capacity}) and {workers} workers at max")]
    Rejected { order_id: OrderId, queued: usize, capacity: usize, workers: usize },
    #[error("dispatcher not accepting jobs (order {0})")]
    NotRunning(OrderId),
    #[error("dispatcher must be started inside a tokio runtime")]
    NoRuntime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Running,
    /// shutdown(): tidak terima job baru, backlog tetap dihabiskan
    Draining,
    /// shutdown_now(): backlog dibuang, delay yang sedang jalan diinterupsi
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub idle: usize,
    pub in_flight: usize,
    pub queued: usize,
    pub peak_in_flight: usize,
    pub completed: u64,
    pub rejected: u64,
}

struct PoolState {
    phase: Phase,
    queue: VecDeque<OrderId>,
    workers: usize,
    idle: usize,
    runtime: Option<Handle>,
}

struct Inner {
    cfg: PoolCfg,
    handler: Arc<dyn Handler>,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<PoolState>,
    work_ready: Notify,
    terminated: Notify,
    cancel_tx: watch::Sender<bool>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    completed: AtomicU64,
    rejected: AtomicU64,
}

pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(cfg: PoolCfg, handler: Arc<dyn Handler>, metrics: Arc<dyn MetricsSink>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        let inner = Inner {
            cfg,
            handler,
            metrics,
            state: Mutex::new(PoolState {
                phase: Phase::Created,
                queue: VecDeque::new(),
                workers: 0,
                idle: 0,
                runtime: None,
            }),
            work_ready: Notify::new(),
            terminated: Notify::new(),
            cancel_tx,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Buka pool. Tidak ada prestart: worker di-spawn lazily saat job pertama masuk,
    /// di runtime tempat `start` dipanggil.
    pub fn start(&self) -> Result<(), DispatchError> {
        let handle = Handle::try_current().map_err(|_| DispatchError::NoRuntime)?;
        let mut st = self.inner.state.lock();
        if st.phase == Phase::Created {
            st.phase = Phase::Running;
            st.runtime = Some(handle);
            let c = &self.inner.cfg;
            info!(
                core = c.core_concurrency,
                max = c.max_concurrency,
                queue_capacity = c.queue_capacity,
                keep_alive_ms = c.keep_alive.as_millis() as u64,
                "dispatcher started"
            );
        }
        Ok(())
    }

    /// Submit job tanpa blocking. Tidak ada urutan antar job.
    pub fn enqueue(&self, order_id: OrderId) -> Result<(), DispatchError> {
        let inner = &self.inner;
        let cfg = &inner.cfg;
        let mut st = inner.state.lock();
        if st.phase != Phase::Running {
            return Err(DispatchError::NotRunning(order_id));
        }

        // (spawn worker baru?, job pertama untuk worker itu)
        let (spawn, first) = if st.workers < cfg.core_concurrency {
            (true, Some(order_id))
        } else if st.queue.len() < cfg.queue_capacity + st.idle {
            st.queue.push_back(order_id);
            // core = 0: backlog tanpa worker sama sekali tidak akan pernah diambil
            (st.workers == 0 && cfg.max_concurrency > 0, None)
        } else if st.workers < cfg.max_concurrency {
            (true, Some(order_id))
        } else {
            let err = DispatchError::Rejected {
                order_id,
                queued: st.queue.len(),
                capacity: cfg.queue_capacity,
                workers: st.workers,
            };
            drop(st);
            inner.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        };

        if spawn {
            st.workers += 1;
        }
        let handle = st.runtime.clone();
        inner.publish(&st);
        drop(st);

        if spawn {
            debug!(order_id, queued = first.is_none(), "dispatch: new worker");
            if let Some(h) = handle {
                h.spawn(worker_loop(inner.clone(), first));
            }
        } else {
            debug!(order_id, "dispatch: queued");
            inner.work_ready.notify_one();
        }
        Ok(())
    }

    /// Berhenti terima job, habiskan backlog, tunggu worker selesai sampai `grace`.
    /// Lewat `grace`: fallback ke `shutdown_now`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        {
            let mut st = self.inner.state.lock();
            if matches!(st.phase, Phase::Created | Phase::Running) {
                st.phase = Phase::Draining;
            }
            info!(queued = st.queue.len(), workers = st.workers, "dispatcher draining");
        }
        self.inner.work_ready.notify_waiters();
        if self.await_termination(grace).await {
            return true;
        }
        let dropped = self.shutdown_now();
        warn!(dropped, "dispatcher drain timed out, interrupted in-flight jobs");
        self.await_termination(grace).await
    }

    /// Berhenti sekarang: backlog dibuang (dikembalikan jumlahnya), delay yang jalan diinterupsi.
    pub fn shutdown_now(&self) -> usize {
        let dropped: Vec<OrderId> = {
            let mut st = self.inner.state.lock();
            st.phase = Phase::Stopped;
            let d = st.queue.drain(..).collect();
            self.inner.publish(&st);
            d
        };
        if !dropped.is_empty() {
            warn!(order_ids = ?dropped, "dispatcher dropped backlog");
        }
        self.inner.cancel_tx.send_replace(true);
        self.inner.work_ready.notify_waiters();
        dropped.len()
    }

    /// true kalau semua worker sudah keluar sebelum `limit`.
    pub async fn await_termination(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            let notified = self.inner.terminated.notified();
            {
                let st = self.inner.state.lock();
                if st.workers == 0 && st.phase != Phase::Running {
                    return true;
                }
            }
            if timeout(deadline.saturating_duration_since(Instant::now()), notified).await.is_err() {
                return self.inner.state.lock().workers == 0;
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.inner.state.lock();
        PoolStats {
            workers: st.workers,
            idle: st.idle,
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            queued: st.queue.len(),
            peak_in_flight: self.inner.peak_in_flight.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn publish(&self, st: &PoolState) {
        self.metrics.set_gauge(POOL_WORKERS, st.workers as i64);
        self.metrics.set_gauge(POOL_QUEUED, st.queue.len() as i64);
    }

    fn retire(&self, st: &mut PoolState) {
        st.workers -= 1;
        self.publish(st);
        if st.workers == 0 {
            self.terminated.notify_waiters();
        }
    }

    /// Ambil job berikutnya; None berarti worker ini harus keluar (sudah di-retire).
    async fn next_job(&self) -> Option<OrderId> {
        let mut timed_out = false;
        let mut waiting = false;
        loop {
            let notified = self.work_ready.notified();
            tokio::pin!(notified);
            let burst = {
                let mut st = self.state.lock();
                // lepas status idle di lock yang sama dengan pop, jadi slot handoff tidak bolong
                if std::mem::take(&mut waiting) {
                    st.idle -= 1;
                }
                if let Some(id) = st.queue.pop_front() {
                    self.publish(&st);
                    return Some(id);
                }
                if st.phase != Phase::Running {
                    self.retire(&mut st);
                    return None;
                }
                let burst = st.workers > self.cfg.core_concurrency;
                if burst && timed_out {
                    self.retire(&mut st);
                    debug!(workers = st.workers, "burst worker idle, exiting");
                    return None;
                }
                // daftar sebagai waiter sebelum lock dilepas, supaya notify_one tidak hilang
                notified.as_mut().enable();
                st.idle += 1;
                waiting = true;
                burst
            };

            if burst {
                timed_out = timeout(self.cfg.keep_alive, notified.as_mut()).await.is_err();
            } else {
                notified.as_mut().await;
            }
        }
    }

    async fn run_job(&self, order_id: OrderId) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        self.metrics.set_gauge(POOL_IN_FLIGHT, now as i64);

        let cancel = self.cancel_tx.subscribe();
        let res = AssertUnwindSafe(self.handler.handle(order_id, cancel)).catch_unwind().await;
        match res {
            Ok(Ok(outcome)) => debug!(order_id, ?outcome, "job finished"),
            Ok(Err(e)) => {
                error!(order_id, error = %e, "async processing failed");
                self.metrics.increment_counter(ORDERS_PROCESSING_FAULTS);
            }
            Err(panic) => {
                error!(order_id, panic = %panic_message(panic.as_ref()), "async processing panicked");
                self.metrics.increment_counter(ORDERS_PROCESSING_FAULTS);
            }
        }

        let left = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.set_gauge(POOL_IN_FLIGHT, left as i64);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }
}

async fn worker_loop(inner: Arc<Inner>, mut first: Option<OrderId>) {
    loop {
        let job = match first.take() {
            Some(id) => Some(id),
            None => inner.next_job().await,
        };
        let Some(order_id) = job else { break };
        inner.run_job(order_id).await;
    }
}

fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use tokio::time::sleep;

    /// Handler uji: tidur `hold`, catat konkurensi, panic untuk id tertentu.
    struct Probe {
        hold: Duration,
        active: AtomicUsize,
        peak: AtomicUsize,
        done: Mutex<Vec<OrderId>>,
        panic_on: Option<OrderId>,
    }

    impl Probe {
        fn new(hold: Duration) -> Self {
            Self { hold, active: AtomicUsize::new(0), peak: AtomicUsize::new(0), done: Mutex::new(Vec::new()), panic_on: None }
        }
    }

    #[async_trait]
    impl Handler for Probe {
        async fn handle(&self, order_id: OrderId, _cancel: watch::Receiver<bool>) -> Result<JobOutcome, ProcessError> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(self.hold).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if self.panic_on == Some(order_id) {
                panic!("boom on {order_id}");
            }
            self.done.lock().push(order_id);
            Ok(JobOutcome::Missing)
        }
    }

    fn pool(core: usize, max: usize, queue: usize, keep_alive_ms: u64) -> PoolCfg {
        PoolCfg {
            core_concurrency: core,
            max_concurrency: max,
            queue_capacity: queue,
            keep_alive: Duration::from_millis(keep_alive_ms),
        }
    }

    async fn wait_completed(d: &Dispatcher, n: u64) {
        for _ in 0..500 {
            if d.stats().completed >= n {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {n} completions: {:?}", d.stats());
    }

    #[tokio::test]
    async fn enqueue_before_start_is_refused() {
        let d = Dispatcher::new(pool(1, 1, 1, 100), Arc::new(Probe::new(Duration::ZERO)), Arc::new(Metrics::default()));
        assert_eq!(d.enqueue(1), Err(DispatchError::NotRunning(1)));
    }

    #[test]
    fn start_outside_runtime_fails() {
        let d = Dispatcher::new(pool(1, 1, 1, 100), Arc::new(Probe::new(Duration::ZERO)), Arc::new(Metrics::default()));
        assert_eq!(d.start(), Err(DispatchError::NoRuntime));
    }

    #[tokio::test]
    async fn start_does_not_prestart_workers() {
        let d = Dispatcher::new(pool(4, 10, 50, 1_000), Arc::new(Probe::new(Duration::ZERO)), Arc::new(Metrics::default()));
        d.start().unwrap();
        assert_eq!(d.stats().workers, 0);
        d.enqueue(1).unwrap();
        assert_eq!(d.stats().workers, 1);
        wait_completed(&d, 1).await;
    }

    #[tokio::test]
    async fn zero_core_still_drains_backlog() {
        let probe = Arc::new(Probe::new(Duration::from_millis(5)));
        let d = Dispatcher::new(pool(0, 4, 10, 50), probe.clone(), Arc::new(Metrics::default()));
        d.start().unwrap();

        d.enqueue(1).unwrap();
        let s = d.stats();
        assert_eq!((s.workers, s.queued), (1, 1));
        d.enqueue(2).unwrap();
        // backlog belum penuh dan sudah ada worker: tidak perlu worker kedua
        assert_eq!(d.stats().workers, 1);

        wait_completed(&d, 2).await;
        let mut done = probe.done.lock().clone();
        done.sort_unstable();
        assert_eq!(done, vec![1, 2]);

        // satu-satunya worker adalah burst worker, keluar setelah keep_alive
        sleep(Duration::from_millis(300)).await;
        assert_eq!(d.stats().workers, 0);

        // pool dingin lagi: job berikutnya tetap dapat worker
        d.enqueue(3).unwrap();
        wait_completed(&d, 3).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn idle_workers_take_back_to_back_jobs() {
        let probe = Arc::new(Probe::new(Duration::from_millis(1)));
        let d = Dispatcher::new(pool(2, 2, 0, 1_000), probe.clone(), Arc::new(Metrics::default()));
        d.start().unwrap();
        d.enqueue(1).unwrap();
        d.enqueue(2).unwrap();
        wait_completed(&d, 2).await;

        for round in 0..20u64 {
            // tunggu dua worker parkir idle
            for _ in 0..200 {
                if d.stats().idle == 2 {
                    break;
                }
                sleep(Duration::from_millis(1)).await;
            }
            assert_eq!(d.stats().idle, 2, "round {round}");
            let base = 10 + round * 2;
            // queue_capacity = 0: keduanya hanya diterima sebagai handoff ke worker idle
            d.enqueue(base).unwrap();
            d.enqueue(base + 1).unwrap();
            wait_completed(&d, 4 + round * 2).await;
        }
        assert_eq!(d.stats().rejected, 0);
        assert_eq!(d.stats().workers, 2);
    }

    #[tokio::test]
    async fn rejects_when_backlog_full_at_max() {
        let probe = Arc::new(Probe::new(Duration::from_millis(200)));
        let d = Dispatcher::new(pool(1, 2, 1, 1_000), probe.clone(), Arc::new(Metrics::default()));
        d.start().unwrap();

        // current_thread runtime: worker belum jalan selama kita tidak yield
        assert!(d.enqueue(1).is_ok()); // core worker
        assert!(d.enqueue(2).is_ok()); // backlog
        assert!(d.enqueue(3).is_ok()); // burst worker
        let err = d.enqueue(4).unwrap_err();
        assert!(matches!(err, DispatchError::Rejected { order_id: 4, queued: 1, capacity: 1, workers: 2 }));

        let s = d.stats();
        assert_eq!((s.workers, s.queued, s.rejected), (2, 1, 1));

        wait_completed(&d, 3).await;
        let mut done = probe.done.lock().clone();
        done.sort_unstable();
        assert_eq!(done, vec![1, 2, 3]);
        assert!(probe.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_max_concurrency() {
        let probe = Arc::new(Probe::new(Duration::from_millis(30)));
        let d = Dispatcher::new(pool(2, 4, 3, 1_000), probe.clone(), Arc::new(Metrics::default()));
        d.start().unwrap();

        let mut accepted = 0u64;
        for id in 1..=40 {
            if d.enqueue(id).is_ok() {
                accepted += 1;
            }
            if id % 4 == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        }
        wait_completed(&d, accepted).await;

        let s = d.stats();
        assert_eq!(s.completed + s.rejected, 40);
        assert!(probe.peak.load(Ordering::SeqCst) <= 4, "peak {}", probe.peak.load(Ordering::SeqCst));
        assert!(s.peak_in_flight <= 4);
        assert!(s.workers <= 4);
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_the_pool() {
        let mut probe = Probe::new(Duration::from_millis(1));
        probe.panic_on = Some(2);
        let probe = Arc::new(probe);
        let metrics = Arc::new(Metrics::default());
        let d = Dispatcher::new(pool(1, 1, 10, 1_000), probe.clone(), metrics.clone());
        d.start().unwrap();

        for id in 1..=3 {
            d.enqueue(id).unwrap();
        }
        wait_completed(&d, 3).await;
        assert_eq!(metrics.read_counter(ORDERS_PROCESSING_FAULTS), 1);

        d.enqueue(4).unwrap();
        wait_completed(&d, 4).await;
        let mut done = probe.done.lock().clone();
        done.sort_unstable();
        assert_eq!(done, vec![1, 3, 4]);
        assert_eq!(d.stats().workers, 1);
    }

    #[tokio::test]
    async fn burst_workers_idle_out() {
        let probe = Arc::new(Probe::new(Duration::from_millis(10)));
        let d = Dispatcher::new(pool(1, 3, 0, 50), probe, Arc::new(Metrics::default()));
        d.start().unwrap();
        for id in 1..=3 {
            d.enqueue(id).unwrap();
        }
        assert_eq!(d.stats().workers, 3);
        wait_completed(&d, 3).await;
        sleep(Duration::from_millis(300)).await;
        assert_eq!(d.stats().workers, 1);
    }

    #[tokio::test]
    async fn graceful_shutdown_drains_backlog() {
        let probe = Arc::new(Probe::new(Duration::from_millis(5)));
        let d = Dispatcher::new(pool(1, 1, 10, 1_000), probe.clone(), Arc::new(Metrics::default()));
        d.start().unwrap();
        for id in 1..=5 {
            d.enqueue(id).unwrap();
        }
        assert!(d.shutdown(Duration::from_secs(5)).await);
        assert_eq!(probe.done.lock().len(), 5);
        assert_eq!(d.stats().workers, 0);
        assert_eq!(d.enqueue(6), Err(DispatchError::NotRunning(6)));
    }

    #[tokio::test]
    async fn shutdown_now_drops_backlog() {
        let probe = Arc::new(Probe::new(Duration::from_millis(50)));
        let d = Dispatcher::new(pool(1, 1, 10, 1_000), probe, Arc::new(Metrics::default()));
        d.start().unwrap();
        for id in 1..=4 {
            d.enqueue(id).unwrap();
        }
        // id 1 dipegang worker langsung, 3 sisanya di backlog
        assert_eq!(d.shutdown_now(), 3);
        assert!(d.await_termination(Duration::from_secs(5)).await);
        assert_eq!(d.stats().completed, 1);
    }
}

// ===============================
// src/service.rs
// ===============================
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::dispatcher::{DispatchError, Dispatcher};
use crate::domain::{Order, OrderId, OrderRequest, Stats};
use crate::metrics::{MetricsSink, ORDERS_DISPATCH_REJECTED, ORDERS_RECEIVED};
use crate::store::{OrderStore, StoreError};

#[derive(Debug, Error, PartialEq)]
pub enum ServiceError {
    #[error("order {0} not found")]
    NotFound(OrderId),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ServiceError::NotFound(id),
            other => ServiceError::Store(other),
        }
    }
}

/// Entry point untuk caller: submit (persist + enqueue), update, read, stats.
#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn OrderStore>,
    metrics: Arc<dyn MetricsSink>,
    dispatcher: Arc<Dispatcher>,
}

impl OrderService {
    pub fn new(store: Arc<dyn OrderStore>, metrics: Arc<dyn MetricsSink>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, metrics, dispatcher }
    }

    /// Persist sebagai RECEIVED lalu enqueue; tidak menunggu processing.
    /// Validasi input tanggung jawab caller (lihat `OrderRequest::validate`).
    pub async fn submit(&self, req: OrderRequest) -> Result<Order, ServiceError> {
        let order = self.store.create(req.item, req.amount).await?;
        self.metrics.increment_counter(ORDERS_RECEIVED);
        info!(order_id = order.id, item = %order.item, amount = order.amount, "order received and persisted");

        // fire-and-forget: gagal dispatch hanya di-log, submit tetap sukses
        match self.dispatcher.enqueue(order.id) {
            Ok(()) => {}
            Err(e @ DispatchError::Rejected { .. }) => {
                warn!(order_id = order.id, error = %e, "dispatch rejected, order stays RECEIVED");
                self.metrics.increment_counter(ORDERS_DISPATCH_REJECTED);
            }
            // pool sedang shutdown / belum start: bukan overload, jangan dihitung sebagai reject
            Err(e) => warn!(order_id = order.id, error = %e, "dispatcher not running, order stays RECEIVED"),
        }
        Ok(order)
    }

    /// Ganti item & amount saja; status dan created_at tidak disentuh.
    /// Bisa balapan dengan processor untuk order yang sama (last writer wins).
    pub async fn update_order(&self, id: OrderId, req: OrderRequest) -> Result<Order, ServiceError> {
        let mut order = self.store.find_by_id(id).await?.ok_or(ServiceError::NotFound(id))?;
        order.item = req.item;
        order.amount = req.amount;
        let saved = self.store.update(&order).await?;
        info!(order_id = id, status = %saved.status, "order updated");
        Ok(saved)
    }

    pub async fn find_by_id(&self, id: OrderId) -> Result<Order, ServiceError> {
        self.store.find_by_id(id).await?.ok_or(ServiceError::NotFound(id))
    }

    pub fn stats(&self) -> Stats {
        let total_requests = self.metrics.read_counter(ORDERS_RECEIVED);
        info!(total_requests, "stats requested");
        Stats { total_requests, timestamp: Utc::now() }
    }

    pub fn dispatcher(&self) -> &Dispatcher { &self.dispatcher }
}

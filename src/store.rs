// ===============================
// src/store.rs
// ===============================
use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

use crate::domain::{Order, OrderId, OrderStatus};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("order {0} not found")]
    NotFound(OrderId),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Penyimpanan order berbasis key. Implementasi wajib aman untuk create/read/update paralel;
/// tidak ada transaksi lintas panggilan.
#[async_trait]
pub trait OrderStore: Send + Sync + 'static {
    /// Assign id, status RECEIVED, created_at = now.
    async fn create(&self, item: String, amount: f64) -> Result<Order, StoreError>;
    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError>;
    /// Overwrite seluruh record (last writer wins). `NotFound` kalau id belum ada.
    async fn update(&self, order: &Order) -> Result<Order, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    next_id: AtomicU64,
    orders: RwLock<HashMap<OrderId, Order>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.orders.read().len() }

    pub fn is_empty(&self) -> bool { self.orders.read().is_empty() }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn create(&self, item: String, amount: f64) -> Result<Order, StoreError> {
        // id mulai dari 1
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let order = Order { id, item, amount, status: OrderStatus::Received, created_at: Utc::now() };
        self.orders.write().insert(id, order.clone());
        Ok(order)
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.read().get(&id).cloned())
    }

    async fn update(&self, order: &Order) -> Result<Order, StoreError> {
        let mut map = self.orders.write();
        match map.get_mut(&order.id) {
            Some(slot) => {
                *slot = order.clone();
                Ok(order.clone())
            }
            None => Err(StoreError::NotFound(order.id)),
        }
    }
}

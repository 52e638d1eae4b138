// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type OrderId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus { Received, Processed, Failed }

impl OrderStatus {
    pub fn is_terminal(&self) -> bool { !matches!(self, OrderStatus::Received) }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Received => "RECEIVED",
            OrderStatus::Processed => "PROCESSED",
            OrderStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Satu record order. `id` dan `created_at` tidak pernah berubah setelah create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub item: String,
    pub amount: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

/// Body untuk POST /orders dan PUT /orders/{id}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest { pub item: String, pub amount: f64 }

impl OrderRequest {
    pub fn new(item: impl Into<String>, amount: f64) -> Self { Self { item: item.into(), amount } }

    /// Item tidak boleh kosong, amount harus > 0 (NaN/inf ditolak juga).
    pub fn validate(&self) -> Result<(), String> {
        if self.item.trim().is_empty() {
            return Err("item must not be blank".to_string());
        }
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(format!("amount must be positive, got {}", self.amount));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats { pub total_requests: u64, pub timestamp: DateTime<Utc> }

/// Hasil satu job di worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(OrderStatus),
    /// Order tidak ditemukan saat job mulai.
    Missing,
    /// Order sudah terminal, tidak disentuh lagi.
    Skipped(OrderStatus),
    /// Delay diinterupsi (shutdown_now); status tidak diubah.
    Interrupted,
}

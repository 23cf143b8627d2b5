//! Stock levels for the inventory subscriber.
//!
//! Reserve-then-commit: a sale reserves every line first and only then
//! decrements, so a partially stocked order never half-applies.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use loomerp_core::TenantId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StockError {
    #[error("insufficient stock for '{sku}': need {requested}, have {available}")]
    Insufficient {
        sku: String,
        requested: i64,
        available: i64,
    },
}

/// Stock storage, scoped per tenant and SKU. Updates run under the store's
/// own locking; re-applying the same order is the caller's idempotency
/// concern.
pub trait StockStore: Send + Sync {
    /// Atomically decrement every line, or fail without touching anything.
    fn decrement_all(&self, tenant_id: TenantId, lines: &[(String, i64)])
        -> Result<Vec<(String, i64)>, StockError>;

    /// Increment a SKU (purchase receipt), returning the new level.
    fn increment(&self, tenant_id: TenantId, sku: &str, quantity: i64) -> i64;

    fn level(&self, tenant_id: TenantId, sku: &str) -> i64;

    fn set_level(&self, tenant_id: TenantId, sku: &str, quantity: i64);
}

#[derive(Debug, Default)]
pub struct InMemoryStockStore {
    levels: Mutex<HashMap<(TenantId, String), i64>>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StockStore for InMemoryStockStore {
    fn decrement_all(
        &self,
        tenant_id: TenantId,
        lines: &[(String, i64)],
    ) -> Result<Vec<(String, i64)>, StockError> {
        let mut levels = self.levels.lock().unwrap_or_else(|p| p.into_inner());

        // Reserve: every line must be coverable before anything moves.
        for (sku, quantity) in lines {
            let available = *levels.get(&(tenant_id, sku.clone())).unwrap_or(&0);
            if available < *quantity {
                return Err(StockError::Insufficient {
                    sku: sku.clone(),
                    requested: *quantity,
                    available,
                });
            }
        }

        let mut remaining = Vec::with_capacity(lines.len());
        for (sku, quantity) in lines {
            let level = levels.entry((tenant_id, sku.clone())).or_insert(0);
            *level -= quantity;
            remaining.push((sku.clone(), *level));
        }
        Ok(remaining)
    }

    fn increment(&self, tenant_id: TenantId, sku: &str, quantity: i64) -> i64 {
        let mut levels = self.levels.lock().unwrap_or_else(|p| p.into_inner());
        let level = levels.entry((tenant_id, sku.to_string())).or_insert(0);
        *level += quantity;
        *level
    }

    fn level(&self, tenant_id: TenantId, sku: &str) -> i64 {
        *self
            .levels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(tenant_id, sku.to_string()))
            .unwrap_or(&0)
    }

    fn set_level(&self, tenant_id: TenantId, sku: &str, quantity: i64) {
        self.levels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert((tenant_id, sku.to_string()), quantity);
    }
}

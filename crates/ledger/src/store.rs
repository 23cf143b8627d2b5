//! Chain storage.
//!
//! The append protocol serializes writers per tenant with a *non-blocking*
//! exclusive lock on the chain tail: whoever fails to take the lock fails
//! fast with `Contention` instead of queueing up behind the holder.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use loomerp_core::TenantId;

use crate::record::{AuditRecord, RecordDraft};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The tenant's tail lock was unavailable; the caller may retry.
    #[error("ledger contention")]
    Contention,

    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// Append-only audit chain storage, one chain per tenant.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Lock the tenant's tail (NOWAIT), link the draft, insert, commit.
    async fn append(&self, tenant_id: TenantId, draft: RecordDraft)
        -> Result<AuditRecord, LedgerError>;

    /// Read records in sequence order, starting at `start_sequence`.
    async fn read_range(
        &self,
        tenant_id: TenantId,
        start_sequence: u64,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, LedgerError>;

    /// Total records in the tenant's chain.
    async fn chain_size(&self, tenant_id: TenantId) -> Result<u64, LedgerError>;

    /// The newest record, if the chain is non-empty.
    async fn tail(&self, tenant_id: TenantId) -> Result<Option<AuditRecord>, LedgerError>;
}

#[derive(Debug, Default)]
struct TenantChain {
    /// Stands in for the row lock: set while an append is in flight.
    appending: AtomicBool,
    records: Mutex<Vec<AuditRecord>>,
}

/// In-memory chain store (dev/tests).
///
/// The per-tenant `appending` flag plays the role of `FOR UPDATE NOWAIT`:
/// a busy tenant chain yields `Contention` immediately.
#[derive(Debug, Default)]
pub struct InMemoryChainStore {
    chains: Mutex<HashMap<TenantId, Arc<TenantChain>>>,
}

impl InMemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn chain(&self, tenant_id: TenantId) -> Arc<TenantChain> {
        self.chains
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(tenant_id)
            .or_default()
            .clone()
    }

    /// Hold a tenant's append lock until the returned guard drops (tests:
    /// provokes `Contention`).
    pub fn hold_append_lock(&self, tenant_id: TenantId) -> AppendLockGuard {
        let chain = self.chain(tenant_id);
        chain.appending.store(true, Ordering::SeqCst);
        AppendLockGuard { chain }
    }

    /// Mutate a stored record out of band (tests/tamper scenarios only; the
    /// write path never updates records).
    pub fn corrupt(&self, tenant_id: TenantId, sequence: u64, f: impl FnOnce(&mut AuditRecord)) {
        let chain = self.chain(tenant_id);
        let mut records = chain.records.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(record) = records.iter_mut().find(|r| r.sequence == sequence) {
            f(record);
        }
    }
}

/// Guard holding one tenant's append lock; released on drop.
pub struct AppendLockGuard {
    chain: Arc<TenantChain>,
}

impl Drop for AppendLockGuard {
    fn drop(&mut self) {
        self.chain.appending.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChainStore for InMemoryChainStore {
    async fn append(
        &self,
        tenant_id: TenantId,
        draft: RecordDraft,
    ) -> Result<AuditRecord, LedgerError> {
        let chain = self.chain(tenant_id);
        if chain.appending.swap(true, Ordering::SeqCst) {
            return Err(LedgerError::Contention);
        }
        // Flag cleared by the guard on every exit path.
        let _release = AppendLockGuard {
            chain: chain.clone(),
        };

        let mut records = chain.records.lock().unwrap_or_else(|p| p.into_inner());
        let tail = records.last().map(|r| (r.sequence, r.hash.as_str()));
        let record = AuditRecord::chained(tenant_id, tail, draft);
        records.push(record.clone());
        Ok(record)
    }

    async fn read_range(
        &self,
        tenant_id: TenantId,
        start_sequence: u64,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, LedgerError> {
        let chain = self.chain(tenant_id);
        let records = chain.records.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records
            .iter()
            .filter(|r| r.sequence >= start_sequence)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn chain_size(&self, tenant_id: TenantId) -> Result<u64, LedgerError> {
        let chain = self.chain(tenant_id);
        let records = chain.records.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records.len() as u64)
    }

    async fn tail(&self, tenant_id: TenantId) -> Result<Option<AuditRecord>, LedgerError> {
        let chain = self.chain(tenant_id);
        let records = chain.records.lock().unwrap_or_else(|p| p.into_inner());
        Ok(records.last().cloned())
    }
}

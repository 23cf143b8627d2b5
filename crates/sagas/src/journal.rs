//! Double-entry journal kept by the accounting subscriber.
//!
//! Amounts are integer cents; an entry that does not balance to the cent
//! cannot be constructed.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use loomerp_core::{Cents, DomainError, DomainResult, TenantId};

/// One side of a journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalLine {
    /// Account name, e.g. "Cash" or "Sales Revenue".
    pub account: String,
    /// Positive amount in cents.
    pub amount: Cents,
    /// true = debit, false = credit.
    pub is_debit: bool,
}

impl JournalLine {
    pub fn debit(account: impl Into<String>, amount: Cents) -> Self {
        Self {
            account: account.into(),
            amount,
            is_debit: true,
        }
    }

    pub fn credit(account: impl Into<String>, amount: Cents) -> Self {
        Self {
            account: account.into(),
            amount,
            is_debit: false,
        }
    }
}

/// A balanced journal entry. [`JournalEntry::balanced`] is the only
/// constructor, so `sum(debits) == sum(credits)` holds for every entry in
/// existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: Uuid,
    pub tenant_id: TenantId,
    /// Source reference (order number, payroll reference).
    pub reference: String,
    pub description: String,
    pub lines: Vec<JournalLine>,
    pub posted_at: DateTime<Utc>,
}

impl JournalEntry {
    pub fn balanced(
        tenant_id: TenantId,
        reference: impl Into<String>,
        description: impl Into<String>,
        lines: Vec<JournalLine>,
    ) -> DomainResult<Self> {
        if lines.is_empty() {
            return Err(DomainError::validation("journal entry needs lines"));
        }
        if lines.iter().any(|l| l.amount.0 <= 0) {
            return Err(DomainError::validation("journal amounts must be positive"));
        }
        let debits: i64 = lines.iter().filter(|l| l.is_debit).map(|l| l.amount.0).sum();
        let credits: i64 = lines.iter().filter(|l| !l.is_debit).map(|l| l.amount.0).sum();
        if debits != credits {
            return Err(DomainError::invariant(format!(
                "unbalanced entry: debits {debits} != credits {credits}"
            )));
        }
        Ok(Self {
            id: Uuid::now_v7(),
            tenant_id,
            reference: reference.into(),
            description: description.into(),
            lines,
            posted_at: Utc::now(),
        })
    }

    pub fn total_debits(&self) -> Cents {
        Cents(
            self.lines
                .iter()
                .filter(|l| l.is_debit)
                .map(|l| l.amount.0)
                .sum(),
        )
    }
}

pub trait JournalStore: Send + Sync {
    /// Post an entry; a duplicate `(tenant, reference)` is a no-op returning
    /// false (idempotency on the correlation key).
    fn post(&self, entry: JournalEntry) -> bool;

    fn has_reference(&self, tenant_id: TenantId, reference: &str) -> bool;

    /// Net balance of an account (debits minus credits), in cents.
    fn balance(&self, tenant_id: TenantId, account: &str) -> Cents;

    fn entries(&self, tenant_id: TenantId) -> Vec<JournalEntry>;
}

#[derive(Debug, Default)]
pub struct InMemoryJournalStore {
    entries: Mutex<Vec<JournalEntry>>,
    balances: Mutex<HashMap<(TenantId, String), i64>>,
}

impl InMemoryJournalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JournalStore for InMemoryJournalStore {
    fn post(&self, entry: JournalEntry) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries
            .iter()
            .any(|e| e.tenant_id == entry.tenant_id && e.reference == entry.reference)
        {
            return false;
        }

        let mut balances = self.balances.lock().unwrap_or_else(|p| p.into_inner());
        for line in &entry.lines {
            let balance = balances
                .entry((entry.tenant_id, line.account.clone()))
                .or_insert(0);
            if line.is_debit {
                *balance += line.amount.0;
            } else {
                *balance -= line.amount.0;
            }
        }
        entries.push(entry);
        true
    }

    fn has_reference(&self, tenant_id: TenantId, reference: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|e| e.tenant_id == tenant_id && e.reference == reference)
    }

    fn balance(&self, tenant_id: TenantId, account: &str) -> Cents {
        Cents(
            *self
                .balances
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .get(&(tenant_id, account.to_string()))
                .unwrap_or(&0),
        )
    }

    fn entries(&self, tenant_id: TenantId) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unbalanced_entries_cannot_exist() {
        let result = JournalEntry::balanced(
            TenantId::new(),
            "O-1",
            "sale",
            vec![
                JournalLine::debit("Cash", Cents(20000)),
                JournalLine::credit("Sales Revenue", Cents(19999)),
            ],
        );
        assert!(result.is_err());
    }

    #[test]
    fn posting_updates_balances_once() {
        let store = InMemoryJournalStore::new();
        let tenant = TenantId::new();
        let entry = JournalEntry::balanced(
            tenant,
            "O-1",
            "sale",
            vec![
                JournalLine::debit("Cash", Cents(20000)),
                JournalLine::credit("Sales Revenue", Cents(20000)),
            ],
        )
        .unwrap();

        assert!(store.post(entry.clone()));
        // Same reference again: no-op.
        assert!(!store.post(entry));

        assert_eq!(store.balance(tenant, "Cash"), Cents(20000));
        assert_eq!(store.balance(tenant, "Sales Revenue"), Cents(-20000));
        assert_eq!(store.entries(tenant).len(), 1);
    }

    proptest! {
        /// Any constructible entry balances to the cent.
        #[test]
        fn constructed_entries_always_balance(amount in 1i64..10_000_000) {
            let entry = JournalEntry::balanced(
                TenantId::new(),
                "R-1",
                "prop",
                vec![
                    JournalLine::debit("A", Cents(amount)),
                    JournalLine::credit("B", Cents(amount)),
                ],
            ).unwrap();
            let debits: i64 = entry.lines.iter().filter(|l| l.is_debit).map(|l| l.amount.0).sum();
            let credits: i64 = entry.lines.iter().filter(|l| !l.is_debit).map(|l| l.amount.0).sum();
            prop_assert_eq!(debits, credits);
        }
    }
}

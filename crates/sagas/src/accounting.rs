//! Accounting subscriber: sales and payroll land in the double-entry
//! journal, idempotent on the source reference.

use std::sync::Arc;

use tracing::{debug, warn};

use loomerp_bus::event::names;
use loomerp_bus::{Event, EventHandler, HandlerOutcome};
use loomerp_core::{Cents, TenantId};

use crate::journal::{JournalEntry, JournalLine, JournalStore};

pub struct AccountingSubscriber {
    journal: Arc<dyn JournalStore>,
}

impl AccountingSubscriber {
    pub fn new(journal: Arc<dyn JournalStore>) -> Self {
        Self { journal }
    }

    /// Dr Cash / Cr Sales Revenue for the sale's grand total.
    fn on_sale_closed(&self, event: &Event, tenant_id: TenantId) -> HandlerOutcome {
        let Some(reference) = event.field("order_number").and_then(|v| v.as_str()) else {
            return HandlerOutcome::Reject("sale without order_number".to_string());
        };
        let amount = match event
            .field("grand_total")
            .and_then(|v| v.as_str())
            .map(Cents::parse)
        {
            Some(Ok(amount)) if amount.0 > 0 => amount,
            _ => {
                return HandlerOutcome::Reject(format!(
                    "sale {reference} without a usable grand_total"
                ))
            }
        };

        let entry = match JournalEntry::balanced(
            tenant_id,
            reference,
            format!("POS sale {reference}"),
            vec![
                JournalLine::debit("Cash", amount),
                JournalLine::credit("Sales Revenue", amount),
            ],
        ) {
            Ok(entry) => entry,
            Err(e) => return HandlerOutcome::Reject(e.to_string()),
        };

        if self.journal.post(entry) {
            debug!(order = %reference, amount = %amount, "sale journal posted");
        }
        HandlerOutcome::Completed
    }

    /// Dr Salary Expense / Cr Salary Payable for the period's net pay.
    fn on_payroll_finalized(&self, event: &Event, tenant_id: TenantId) -> HandlerOutcome {
        let Some(reference) = event.field("payroll_reference").and_then(|v| v.as_str()) else {
            return HandlerOutcome::Reject("payroll without payroll_reference".to_string());
        };
        let amount = match event.field("net_pay").and_then(|v| v.as_str()).map(Cents::parse) {
            Some(Ok(amount)) if amount.0 > 0 => amount,
            _ => {
                return HandlerOutcome::Reject(format!(
                    "payroll {reference} without a usable net_pay"
                ))
            }
        };

        let entry = match JournalEntry::balanced(
            tenant_id,
            reference,
            format!("Payroll {reference}"),
            vec![
                JournalLine::debit("Salary Expense", amount),
                JournalLine::credit("Salary Payable", amount),
            ],
        ) {
            Ok(entry) => entry,
            Err(e) => return HandlerOutcome::Reject(e.to_string()),
        };

        if self.journal.post(entry) {
            debug!(payroll = %reference, amount = %amount, "payroll journal posted");
        }
        HandlerOutcome::Completed
    }
}

impl EventHandler for AccountingSubscriber {
    fn handle(&self, event: &Event) -> HandlerOutcome {
        let Some(tenant_id) = event.tenant_id else {
            return HandlerOutcome::Reject("accounting event without tenant_id".to_string());
        };
        match event.routing_key.as_str() {
            names::POS_SALE_CLOSED => self.on_sale_closed(event, tenant_id),
            names::HRMS_PAYROLL_FINALIZED => self.on_payroll_finalized(event, tenant_id),
            other => {
                warn!(routing_key = %other, "accounting subscriber got unexpected event");
                HandlerOutcome::Completed
            }
        }
    }
}

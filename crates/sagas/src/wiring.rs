//! Queue wiring: which handler consumes which routing keys.

use std::sync::Arc;

use loomerp_bus::{
    BindingPattern, ConsumerConfig, ConsumerHandle, ConsumerRuntime, EventPublisher,
    EVENTS_EXCHANGE,
};

use crate::accounting::AccountingSubscriber;
use crate::inventory::InventorySubscriber;
use crate::journal::JournalStore;
use crate::loyalty::LoyaltySubscriber;
use crate::pos_sale::{OrderStatusStore, PosSaleSaga};
use crate::purchase::{PoStatusStore, PurchaseReceiptSaga};
use crate::quality::{ManufacturingQualitySaga, ProductionOrderStore};
use crate::reporting::ReportingSubscriber;
use crate::saga::{SagaRunner, SagaStore};
use crate::stock::StockStore;

fn pattern(s: &str) -> BindingPattern {
    s.parse().expect("static binding pattern")
}

/// Everything the saga layer needs from its host process.
pub struct SagaWiring {
    pub runtime: Arc<ConsumerRuntime>,
    pub publisher: Arc<EventPublisher>,
    pub sagas: Arc<dyn SagaStore>,
    pub stock: Arc<dyn StockStore>,
    pub journal: Arc<dyn JournalStore>,
    pub orders: Arc<dyn OrderStatusStore>,
    pub purchase_orders: Arc<dyn PoStatusStore>,
    pub production_orders: Arc<dyn ProductionOrderStore>,
    /// Held by the host too, so point balances stay inspectable.
    pub loyalty: Arc<LoyaltySubscriber>,
    /// Held by the host too, so daily aggregates stay inspectable.
    pub reporting: Arc<ReportingSubscriber>,
}

impl SagaWiring {
    /// Spawn every subscriber and coordinator on its own durable queue.
    /// Returned handles drain in-flight messages on shutdown.
    pub fn spawn_all(&self) -> Vec<ConsumerHandle> {
        let mut handles = Vec::new();

        handles.push(self.runtime.spawn(
            ConsumerConfig::new("inventory.stock", EVENTS_EXCHANGE)
                .bind(pattern("pos.sale.closed"))
                .bind(pattern("purchase.order.received")),
            Arc::new(InventorySubscriber::new(
                self.stock.clone(),
                self.publisher.clone(),
            )),
        ));

        handles.push(self.runtime.spawn(
            ConsumerConfig::new("accounting.journal", EVENTS_EXCHANGE)
                .bind(pattern("pos.sale.closed"))
                .bind(pattern("hrms.payroll.finalized")),
            Arc::new(AccountingSubscriber::new(self.journal.clone())),
        ));

        handles.push(self.runtime.spawn(
            ConsumerConfig::new("loyalty.points", EVENTS_EXCHANGE).bind(pattern("pos.sale.closed")),
            self.loyalty.clone(),
        ));

        handles.push(self.runtime.spawn(
            ConsumerConfig::new("reporting.daily", EVENTS_EXCHANGE)
                .bind(pattern("pos.sale.closed")),
            self.reporting.clone(),
        ));

        handles.push(self.runtime.spawn(
            ConsumerConfig::new("saga.pos-sale", EVENTS_EXCHANGE)
                .bind(pattern("pos.sale.closed"))
                .bind(pattern("stock.update.*")),
            Arc::new(SagaRunner::new(
                PosSaleSaga::new(self.orders.clone()),
                self.sagas.clone(),
                self.publisher.clone(),
            )),
        ));

        handles.push(self.runtime.spawn(
            ConsumerConfig::new("saga.purchase-receipt", EVENTS_EXCHANGE)
                .bind(pattern("purchase.order.received"))
                .bind(pattern("stock.update.*")),
            Arc::new(SagaRunner::new(
                PurchaseReceiptSaga::new(self.purchase_orders.clone()),
                self.sagas.clone(),
                self.publisher.clone(),
            )),
        ));

        handles.push(self.runtime.spawn(
            ConsumerConfig::new("saga.manufacturing-quality", EVENTS_EXCHANGE)
                .bind(pattern("production.qc_requested"))
                .bind(pattern("quality.inspection.completed")),
            Arc::new(SagaRunner::new(
                ManufacturingQualitySaga::new(self.production_orders.clone()),
                self.sagas.clone(),
                self.publisher.clone(),
            )),
        ));

        handles
    }
}

//! `loomerp-sagas` — cross-service flows coordinated by exchanging events.
//!
//! Every flow follows one shape: an originator publishes a command event
//! carrying a correlation id, subscribers do their local transaction and
//! publish reply events echoing that id, and a coordinator drives the saga
//! record through its states. Compensations replace distributed rollback;
//! terminal states are sticky; everything is idempotent on
//! `(correlation_id, step_name)`.

pub mod accounting;
pub mod inventory;
pub mod journal;
pub mod loyalty;
pub mod pos_sale;
pub mod purchase;
pub mod quality;
pub mod reporting;
pub mod saga;
pub mod stock;
pub mod wiring;

pub use accounting::AccountingSubscriber;
pub use inventory::InventorySubscriber;
pub use journal::{InMemoryJournalStore, JournalEntry, JournalLine, JournalStore};
pub use loyalty::LoyaltySubscriber;
pub use pos_sale::{InMemoryOrderStatusStore, OrderStatusStore, PosSaleSaga};
pub use purchase::{InMemoryPoStatusStore, PoStatusStore, PurchaseReceiptSaga};
pub use quality::{InMemoryProductionOrderStore, ManufacturingQualitySaga, ProductionOrderStore};
pub use reporting::{DailyAggregate, ReportingSubscriber};
pub use saga::{
    InMemorySagaStore, Saga, SagaAction, SagaRecord, SagaRunner, SagaState, SagaStep, SagaStore,
};
pub use stock::{InMemoryStockStore, StockError, StockStore};
pub use wiring::SagaWiring;

//! Infrastructure wiring: broker, publisher, stores, engine workers, saga
//! consumers. Built once at startup; worker handles live here so background
//! threads survive for the process lifetime.

use std::sync::Arc;

use tracing::info;

use loomerp_bus::{
    BindingPattern, Broker, ConsumerConfig, ConsumerHandle, ConsumerRuntime, EventPublisher,
    InMemoryBroker, InMemoryDeadLetterSink, AUDIT_LOGS_EXCHANGE, EVENTS_EXCHANGE,
};
use loomerp_engine::{
    ActionError, ActionJobExecutor, ActionJobExecutorHandle, ActionJobStore, ActionLogStore,
    ActionRunner, Evaluator, InMemoryActionJobStore, InMemoryActionLogStore,
    InMemoryInstanceStore, InMemoryRuleStore, InMemoryWorkflowStore, InstanceStore, MailMessage,
    MailSettings, MailTransport, PlatformActionRunner, RuleStore, Scheduler, SchedulerHandle,
    WorkflowStore,
};
use loomerp_ledger::{ChainStore, InMemoryChainStore};
use loomerp_registry::ServiceRegistry;
use loomerp_sagas::{
    InMemoryJournalStore, InMemoryOrderStatusStore, InMemoryPoStatusStore,
    InMemoryProductionOrderStore, InMemorySagaStore, InMemoryStockStore, JournalStore,
    LoyaltySubscriber, OrderStatusStore, PoStatusStore, ProductionOrderStore, ReportingSubscriber,
    SagaStore, SagaWiring, StockStore,
};

use loomerp_core::TenantId;

/// Mail transport that records delivery intent in the service log; actual
/// SMTP submission belongs to the notification service.
struct LogMailTransport;

impl MailTransport for LogMailTransport {
    fn send(&self, tenant_id: TenantId, message: MailMessage) -> Result<(), ActionError> {
        info!(
            tenant_id = %tenant_id,
            to = %message.to,
            subject = %message.subject,
            "mail submitted to transport"
        );
        Ok(())
    }
}

/// Worker handles; dropping them would stop the background loops.
struct WorkerHandles {
    consumers: Vec<ConsumerHandle>,
    scheduler: Option<SchedulerHandle>,
    jobs: Option<ActionJobExecutorHandle>,
}

pub struct AppServices {
    pub broker: Arc<dyn Broker>,
    pub publisher: Arc<EventPublisher>,
    pub dead_letters: Arc<InMemoryDeadLetterSink>,
    pub chain: Arc<dyn ChainStore>,
    pub rules: Arc<dyn RuleStore>,
    pub workflows: Arc<dyn WorkflowStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub jobs: Arc<dyn ActionJobStore>,
    pub action_log: Arc<dyn ActionLogStore>,
    pub evaluator: Arc<Evaluator>,
    pub sagas: Arc<dyn SagaStore>,
    pub stock: Arc<dyn StockStore>,
    pub journal: Arc<dyn JournalStore>,
    pub orders: Arc<dyn OrderStatusStore>,
    pub purchase_orders: Arc<dyn PoStatusStore>,
    pub production_orders: Arc<dyn ProductionOrderStore>,
    pub loyalty: Arc<LoyaltySubscriber>,
    pub reporting: Arc<ReportingSubscriber>,
    handles: WorkerHandles,
}

impl AppServices {
    /// Stop every background worker, draining in-flight messages.
    pub fn shutdown(mut self) {
        for handle in self.handles.consumers.drain(..) {
            handle.shutdown();
        }
        if let Some(scheduler) = self.handles.scheduler.take() {
            scheduler.shutdown();
        }
        if let Some(jobs) = self.handles.jobs.take() {
            jobs.shutdown();
        }
    }
}

fn build_broker() -> Arc<dyn Broker> {
    #[cfg(feature = "redis")]
    if let Ok(url) = std::env::var("BROKER_URL") {
        match loomerp_bus::redis_streams::RedisBroker::connect(&url) {
            Ok(broker) => {
                info!(url = %url, "using redis streams broker");
                return Arc::new(broker);
            }
            Err(e) => {
                tracing::warn!(error = %e, "BROKER_URL unusable; falling back to in-memory broker");
            }
        }
    }
    Arc::new(InMemoryBroker::new())
}

/// Build the full service graph with in-process storage.
pub fn build_services() -> AppServices {
    let broker = build_broker();
    let _ = broker.declare_exchange(EVENTS_EXCHANGE);
    let _ = broker.declare_exchange(AUDIT_LOGS_EXCHANGE);

    let publisher = Arc::new(EventPublisher::new(broker.clone()));
    let dead_letters = Arc::new(InMemoryDeadLetterSink::new());
    let runtime = Arc::new(ConsumerRuntime::new(broker.clone(), dead_letters.clone()));

    let chain: Arc<dyn ChainStore> = Arc::new(InMemoryChainStore::new());

    // Engine state + the production action runner.
    let rules: Arc<dyn RuleStore> = Arc::new(InMemoryRuleStore::new());
    let workflows: Arc<dyn WorkflowStore> = Arc::new(InMemoryWorkflowStore::new());
    let instances: Arc<dyn InstanceStore> = Arc::new(InMemoryInstanceStore::new());
    let jobs: Arc<dyn ActionJobStore> = Arc::new(InMemoryActionJobStore::new());
    let action_log: Arc<dyn ActionLogStore> = Arc::new(InMemoryActionLogStore::new());
    let runner: Arc<dyn ActionRunner> = Arc::new(PlatformActionRunner::new(
        ServiceRegistry::global(),
        LogMailTransport,
        MailSettings::default(),
    ));

    let evaluator = Arc::new(Evaluator::new(
        rules.clone(),
        workflows.clone(),
        instances.clone(),
        jobs.clone(),
        runner.clone(),
    ));

    // Saga-side state.
    let sagas: Arc<dyn SagaStore> = Arc::new(InMemorySagaStore::new());
    let stock: Arc<dyn StockStore> = Arc::new(InMemoryStockStore::new());
    let journal: Arc<dyn JournalStore> = Arc::new(InMemoryJournalStore::new());
    let orders: Arc<dyn OrderStatusStore> = Arc::new(InMemoryOrderStatusStore::new());
    let purchase_orders: Arc<dyn PoStatusStore> = Arc::new(InMemoryPoStatusStore::new());
    let production_orders: Arc<dyn ProductionOrderStore> =
        Arc::new(InMemoryProductionOrderStore::new());
    let loyalty = Arc::new(LoyaltySubscriber::new());
    let reporting = Arc::new(ReportingSubscriber::new());

    let mut consumers = SagaWiring {
        runtime: runtime.clone(),
        publisher: publisher.clone(),
        sagas: sagas.clone(),
        stock: stock.clone(),
        journal: journal.clone(),
        orders: orders.clone(),
        purchase_orders: purchase_orders.clone(),
        production_orders: production_orders.clone(),
        loyalty: loyalty.clone(),
        reporting: reporting.clone(),
    }
    .spawn_all();

    // The engine listens to everything; rules/workflows filter by exact
    // trigger key themselves.
    consumers.push(runtime.spawn(
        ConsumerConfig::new("engine.evaluator", EVENTS_EXCHANGE)
            .bind("#".parse::<BindingPattern>().expect("static pattern")),
        evaluator.clone(),
    ));

    let scheduler = Scheduler::new(rules.clone(), jobs.clone()).spawn();
    let job_executor = ActionJobExecutor::new(jobs.clone(), runner, action_log.clone()).spawn();

    AppServices {
        broker,
        publisher,
        dead_letters,
        chain,
        rules,
        workflows,
        instances,
        jobs,
        action_log,
        evaluator,
        sagas,
        stock,
        journal,
        orders,
        purchase_orders,
        production_orders,
        loyalty,
        reporting,
        handles: WorkerHandles {
            consumers,
            scheduler: Some(scheduler),
            jobs: Some(job_executor),
        },
    }
}

//! Colaboradores compartidos por queue manager, runner y worker.
//!
//! `Services` se construye una vez con `ServicesBuilder` y se comparte vía
//! `Arc`. Los registros quedan congelados tras `build()`.
//!
//! ```ignore
//! let services = Services::builder(store)
//!     .clock(clock)
//!     .register_action("ListProcesses", ActionDescriptor::new(None, &["Process"]))
//!     .register_flow(FlowDescriptor::ordinary("ListProcesses", || Box::new(ListProcesses)))
//!     .build();
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::{to_micros, SharedClock, SystemClock};
use crate::config::{QueueConfig, WorkerConfig};
use crate::event::{EventPublisher, LogEventPublisher};
use crate::flow::WellKnownFlow;
use crate::model::SessionId;
use crate::registry::{ActionDescriptor, ActionRegistry, FlowDescriptor, FlowRegistry};
use crate::stats::Stats;
use crate::store::SharedDataStore;

pub struct Services {
    pub store: SharedDataStore,
    pub clock: SharedClock,
    pub queue_config: QueueConfig,
    pub worker_config: WorkerConfig,
    pub flows: FlowRegistry,
    pub actions: ActionRegistry,
    pub events: Arc<dyn EventPublisher>,
    pub stats: Arc<Stats>,
    shard_counters: DashMap<String, usize>,
    last_task_id: AtomicU64,
}

impl Services {
    pub fn builder(store: SharedDataStore) -> ServicesBuilder {
        ServicesBuilder { store,
                          clock: None,
                          queue_config: QueueConfig::default(),
                          worker_config: WorkerConfig::default(),
                          flows: FlowRegistry::new(),
                          actions: ActionRegistry::new(),
                          events: None,
                          stats: None }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Id de task monótono: nunca menor que el reloj en microsegundos ni
    /// repetido dentro del proceso.
    pub fn next_task_id(&self) -> u64 {
        let floor = to_micros(self.clock.now()).max(0) as u64;
        let prev = self.last_task_id
                       .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(floor.max(last + 1)))
                       .unwrap_or_else(|last| last);
        floor.max(prev + 1)
    }

    /// Shard de notificación para la próxima escritura (round robin).
    /// El shard 0 es la propia cola; el shard `i` es `<cola>/<i>`.
    pub fn notification_shard(&self, queue: &str) -> String {
        let shards = self.queue_config.num_notification_shards.max(1);
        let mut counter = self.shard_counters.entry(queue.to_string()).or_insert(0);
        *counter += 1;
        shard_subject(queue, *counter % shards)
    }

    pub fn all_notification_shards(&self, queue: &str) -> Vec<String> {
        (0..self.queue_config.num_notification_shards.max(1)).map(|i| shard_subject(queue, i)).collect()
    }
}

fn shard_subject(queue: &str, index: usize) -> String {
    if index == 0 {
        queue.to_string()
    } else {
        format!("{queue}/{index}")
    }
}

pub struct ServicesBuilder {
    store: SharedDataStore,
    clock: Option<SharedClock>,
    queue_config: QueueConfig,
    worker_config: WorkerConfig,
    flows: FlowRegistry,
    actions: ActionRegistry,
    events: Option<Arc<dyn EventPublisher>>,
    stats: Option<Arc<Stats>>,
}

impl ServicesBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue_config = config;
        self
    }

    pub fn worker_config(mut self, config: WorkerConfig) -> Self {
        self.worker_config = config;
        self
    }

    pub fn register_flow(mut self, descriptor: FlowDescriptor) -> Self {
        self.flows.register(descriptor);
        self
    }

    pub fn register_well_known(mut self, name: &str, session_id: SessionId, flow: Arc<dyn WellKnownFlow>) -> Self {
        self.flows.register_well_known(name, session_id, flow);
        self
    }

    pub fn register_action(mut self, name: &str, descriptor: ActionDescriptor) -> Self {
        self.actions.register(name, descriptor);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn build(self) -> Arc<Services> {
        Arc::new(Services { store: self.store,
                            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
                            queue_config: self.queue_config,
                            worker_config: self.worker_config,
                            flows: self.flows,
                            actions: self.actions,
                            events: self.events.unwrap_or_else(|| Arc::new(LogEventPublisher)),
                            stats: self.stats.unwrap_or_default(),
                            shard_counters: DashMap::new(),
                            last_task_id: AtomicU64::new(0) })
    }
}

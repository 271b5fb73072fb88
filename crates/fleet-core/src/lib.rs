//! fleet-core: control plane de flows sobre un key-value store con leases.
//!
//! Piezas, de abajo hacia arriba:
//! - `store`: contrato `DataStore` (celdas versionadas, locks con expiración)
//!   e implementación en memoria.
//! - `queue`: `QueueManager`, colas de tasks de cliente, estado de requests y
//!   notificaciones por shard.
//! - `flow`: definición de flows, collator de responses, runner y manager.
//! - `worker`: loop que consume notificaciones y ejecuta flows.
pub mod clock;
pub mod config;
pub mod constants;
pub mod errors;
pub mod event;
pub mod flow;
pub mod model;
pub mod queue;
pub mod registry;
pub mod services;
pub mod stats;
pub mod store;
pub mod testing;
pub mod worker;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{QueueConfig, WorkerConfig};
pub use errors::{classify_error, ErrorClass, FlowError, QueueError, StoreError};
pub use event::{Event, EventPublisher, InMemoryEventPublisher};
pub use flow::{ClientCall, Flow, FlowManager, FlowRunner, Responses, StartFlowRequest, WellKnownFlow};
pub use model::{AccessToken, ClientId, FlowState, FlowStateDict, Message, Priority, SessionId, Status, StatusCode};
pub use queue::QueueManager;
pub use registry::{ActionDescriptor, FlowDescriptor, FlowKind};
pub use services::{Services, ServicesBuilder};
pub use store::{DataStore, InMemoryDataStore, SharedDataStore};
pub use worker::Worker;

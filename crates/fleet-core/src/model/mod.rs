//! Modelo de datos del control plane (ids, mensajes, requests, contexto).

pub mod context;
pub mod ids;
pub mod message;
pub mod request;
pub mod state_dict;

pub use context::{AccessToken, ClientResources, FlowContext, FlowRunnerArgs, FlowState, PendingTermination};
pub use ids::{ClientId, SessionId};
pub use message::{AuthState, ClientIterator, CpuSeconds, IteratorState, Message, MessageKind, Priority, Status,
                  StatusCode, STATUS_TYPE};
pub use request::{Notification, PriorityBucket, RequestData, RequestState};
pub use state_dict::FlowStateDict;

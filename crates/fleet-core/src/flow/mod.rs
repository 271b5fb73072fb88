//! Máquina de estados de flows: definición, collator, runner y manager.

mod definition;
mod manager;
pub mod record;
mod responses;
mod runner;

pub use definition::{Flow, WellKnownFlow};
pub use manager::{is_lock_contention, FlowManager, StartFlowRequest};
pub use record::{FlowLogEntry, FlowRecord};
pub use responses::Responses;
pub use runner::{ClientCall, FlowRunner, StateInput};

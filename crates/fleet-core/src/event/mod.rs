//! Eventos de auditoría/status y trait EventPublisher.

mod store;
mod types;

pub use store::{EventPublisher, InMemoryEventPublisher, LogEventPublisher};
pub use types::{AuditAction, AuditEvent, Event, FlowStatusEvent};

//! Colas de tasks, estado de requests y notificaciones sobre el store.

pub mod layout;
mod manager;

pub use manager::{CompletedRequests, QueueManager};

//! RequestState y notificaciones.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{ClientId, Message, Priority, SessionId};

/// Datos opacos del llamador, devueltos tal cual junto a las responses.
pub type RequestData = BTreeMap<String, Value>;

/// Una llamada pendiente de un flow (a un cliente, a un flow hijo o a sí
/// mismo vía `CallState`).
///
/// Invariante: el par `(session_id, id)` es único y `id` crece de forma
/// monótona dentro del flow. El request y todas sus responses se borran
/// juntos una vez consumidos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestState {
    pub id: u64,
    pub session_id: SessionId,
    pub client_id: Option<ClientId>,
    pub next_state: String,
    #[serde(default)]
    pub data: RequestData,
    /// Task de cliente embebido cuando el request es un `CallClient`.
    pub request: Option<Message>,
    /// Responses emitidas hacia este request por un flow hijo.
    #[serde(default)]
    pub response_count: u64,
    #[serde(default)]
    pub transmission_count: u32,
}

impl RequestState {
    pub fn new(id: u64, session_id: SessionId, next_state: impl Into<String>) -> Self {
        Self { id,
               session_id,
               client_id: None,
               next_state: next_state.into(),
               data: RequestData::new(),
               request: None,
               response_count: 0,
               transmission_count: 0 }
    }
}

/// Aviso de que un flow tiene trabajo completado sin procesar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub session_id: SessionId,
    pub priority: Priority,
    /// Re-encolada por un flow que no terminó de drenar su backlog.
    #[serde(default)]
    pub in_progress: bool,
    pub first_queued: Option<DateTime<Utc>>,
    /// Pista de orden: ante conflicto por la misma clave gana la mayor.
    #[serde(default)]
    pub last_status: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl Notification {
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id,
               priority: Priority::Medium,
               in_progress: false,
               first_queued: None,
               last_status: 0,
               timestamp: None }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_last_status(mut self, last_status: u64) -> Self {
        self.last_status = last_status;
        self
    }

    pub fn in_progress(mut self) -> Self {
        self.in_progress = true;
        self
    }
}

/// Agrupación de notificaciones leídas. `Stuck` ordena por debajo de
/// cualquier prioridad normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PriorityBucket {
    Stuck,
    Level(Priority),
}

impl std::fmt::Display for PriorityBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stuck => f.write_str("stuck"),
            Self::Level(p) => write!(f, "{p:?}"),
        }
    }
}

//! Registro persistido de un flow: contexto, args del runner y token.
//!
//! Estos structs se serializan como JSON en el subject del flow y se
//! reconstruyen al abrirlo. Sólo el dueño del lease los modifica; el
//! marcador de terminación pendiente es la única excepción (escritura
//! ciega fuera del lock).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ClientId, CpuSeconds, Priority, RequestState, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FlowState {
    #[default]
    Created,
    Running,
    Terminated,
    Error,
}

impl FlowState {
    /// `Terminated` y `Error` son absorbentes.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Terminated | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ClientResources {
    pub cpu_usage: CpuSeconds,
    pub network_bytes_sent: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowContext {
    pub session_id: SessionId,
    pub state: FlowState,
    pub create_time: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub creator: String,
    pub current_state: String,
    pub next_outbound_id: u64,
    pub next_processed_request: u64,
    pub outstanding_requests: u64,
    pub client_resources: ClientResources,
    pub backtrace: Option<String>,
    /// Mensaje de estado visible para usuarios (`FlowRunner::status`).
    pub status: Option<String>,
    #[serde(default)]
    pub children: Vec<SessionId>,
}

impl FlowContext {
    pub fn new(session_id: SessionId, creator: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self { session_id,
               state: FlowState::Created,
               create_time: now,
               last_active: now,
               creator: creator.into(),
               current_state: String::new(),
               next_outbound_id: 1,
               next_processed_request: 1,
               outstanding_requests: 0,
               client_resources: ClientResources::default(),
               backtrace: None,
               status: None,
               children: Vec::new() }
    }
}

/// Configuración con la que se creó el runner de un flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRunnerArgs {
    pub flow_name: String,
    pub client_id: Option<ClientId>,
    pub queue: String,
    pub priority: Priority,
    pub cpu_limit: Option<f64>,
    pub network_bytes_limit: Option<u64>,
    pub start_time: Option<DateTime<Utc>>,
    /// Canal donde publicar el status final de un flow de primer nivel.
    pub notification_event: Option<String>,
    /// Request del padre al que reportar; `None` para flows de primer nivel.
    pub request_state: Option<RequestState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTermination {
    pub reason: String,
}

/// Identidad del llamador. Obligatoria para arrancar o terminar flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken {
    pub username: String,
    pub reason: Option<String>,
    pub supervisor: bool,
}

impl AccessToken {
    pub fn new(username: impl Into<String>) -> Self {
        Self { username: username.into(), reason: None, supervisor: false }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Copia del token con privilegios de supervisor.
    pub fn set_uid(&self) -> Self {
        Self { supervisor: true, ..self.clone() }
    }
}

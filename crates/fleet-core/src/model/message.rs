//! Mensajes intercambiados entre flows y clientes.
//!
//! Un `Message` cumple tres roles según dónde se guarda:
//! - task en la cola de un cliente (request saliente),
//! - response en el estado del flow (payload, status o iterator),
//! - mensaje directo a un well-known flow (`request_id == 0`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::MAX_TASK_TTL;
use crate::model::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MessageKind {
    #[default]
    Message,
    Status,
    Iterator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AuthState {
    #[default]
    Unauthenticated,
    Authenticated,
    Desynchronized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub session_id: SessionId,
    pub request_id: u64,
    pub response_id: u64,
    pub task_id: u64,
    /// Nombre de la acción de cliente (sólo en requests salientes).
    pub name: String,
    pub payload: Value,
    /// Tipo declarado del payload; se valida contra la acción de origen.
    pub args_type: Option<String>,
    pub kind: MessageKind,
    pub auth_state: AuthState,
    pub priority: Priority,
    /// Entregas restantes antes de descartar el task.
    pub ttl: u32,
    /// Subject de la cola destino (tasks de cliente).
    pub queue: Option<String>,
    /// Instante de visibilidad leído del store.
    pub eta: Option<DateTime<Utc>>,
    pub last_lease: Option<String>,
    pub source: Option<String>,
    pub cpu_limit: Option<f64>,
    pub network_bytes_limit: Option<u64>,
}

impl Message {
    pub fn new(session_id: SessionId) -> Self {
        Self { session_id,
               request_id: 0,
               response_id: 0,
               task_id: 0,
               name: String::new(),
               payload: Value::Null,
               args_type: None,
               kind: MessageKind::Message,
               auth_state: AuthState::Unauthenticated,
               priority: Priority::Medium,
               ttl: MAX_TASK_TTL,
               queue: None,
               eta: None,
               last_lease: None,
               source: None,
               cpu_limit: None,
               network_bytes_limit: None }
    }

    /// Response de tipo `Message` ya autenticada.
    pub fn response(session_id: SessionId, request_id: u64, response_id: u64, payload: Value) -> Self {
        let mut msg = Self::new(session_id);
        msg.request_id = request_id;
        msg.response_id = response_id;
        msg.payload = payload;
        msg.auth_state = AuthState::Authenticated;
        msg
    }

    /// Status terminal de un request.
    pub fn status(session_id: SessionId,
                  request_id: u64,
                  response_id: u64,
                  status: &Status)
                  -> Result<Self, serde_json::Error> {
        let mut msg = Self::response(session_id, request_id, response_id, serde_json::to_value(status)?);
        msg.kind = MessageKind::Status;
        msg.args_type = Some(STATUS_TYPE.to_string());
        Ok(msg)
    }

    pub fn with_args_type(mut self, args_type: impl Into<String>) -> Self {
        self.args_type = Some(args_type.into());
        self
    }

    pub fn with_auth_state(mut self, auth_state: AuthState) -> Self {
        self.auth_state = auth_state;
        self
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn is_status(&self) -> bool {
        self.kind == MessageKind::Status
    }

    pub fn status_payload(&self) -> Result<Status, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

pub const STATUS_TYPE: &str = "Status";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StatusCode {
    #[default]
    Ok,
    GenericError,
    IoError,
    CpuLimitExceeded,
    NetworkLimitExceeded,
    WorkerStuck,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct CpuSeconds {
    pub user: f64,
    pub system: f64,
}

impl CpuSeconds {
    pub fn new(user: f64, system: f64) -> Self {
        Self { user, system }
    }

    pub fn total(&self) -> f64 {
        self.user + self.system
    }
}

/// Resultado terminal de un request (cliente, flow hijo o CallState).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Status {
    pub code: StatusCode,
    pub error_message: Option<String>,
    pub backtrace: Option<String>,
    pub cpu_time_used: CpuSeconds,
    pub network_bytes_sent: u64,
    pub child_session_id: Option<SessionId>,
}

impl Status {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(code: StatusCode, message: impl Into<String>) -> Self {
        Self { code, error_message: Some(message.into()), ..Self::default() }
    }

    pub fn with_usage(mut self, cpu: CpuSeconds, network_bytes_sent: u64) -> Self {
        self.cpu_time_used = cpu;
        self.network_bytes_sent = network_bytes_sent;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IteratorState {
    #[default]
    Running,
    Finished,
}

/// Estado de paginación devuelto por acciones de cliente que trabajan por
/// tandas (p.ej. listados largos).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClientIterator {
    pub state: IteratorState,
    pub number: u64,
    pub skip: u64,
    pub client_state: Value,
}

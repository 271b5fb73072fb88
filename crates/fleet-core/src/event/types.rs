//! Eventos publicados por el control plane.
//!
//! - `AuditEvent`: arranque de flows de primer nivel y terminaciones
//!   manuales (canal `Audit`).
//! - `FlowStatusEvent`: status final de un flow de primer nivel que pidió
//!   ser notificado (`FlowRunnerArgs::notification_event`).
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{ClientId, FlowState, SessionId, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    RunFlow,
    TerminateFlow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub user: String,
    pub action: AuditAction,
    pub flow_name: String,
    pub session_id: SessionId,
    pub client_id: Option<ClientId>,
    pub description: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatusEvent {
    pub session_id: SessionId,
    pub flow_name: String,
    pub state: FlowState,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Audit(AuditEvent),
    FlowStatus(FlowStatusEvent),
}

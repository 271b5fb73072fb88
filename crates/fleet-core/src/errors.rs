//! Errores del control plane.
//!
//! Tres niveles, de abajo hacia arriba:
//! - `StoreError`: fallos del key-value store (lock, codec, backend).
//! - `QueueError`: uso incorrecto del queue manager o errores del store.
//! - `FlowError`: todo lo que puede abortar un state handler o un
//!   `StartFlow`/`TerminateFlow`.
//!
//! `classify_error` proyecta un `FlowError` a la taxonomía operativa
//! (`ErrorClass`) usada por el worker para decidir si reintentar.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum StoreError {
    #[error("subject {0} is locked by another owner")] LockContention(String),
    #[error("lock on subject {0} was lost or expired")] LockLost(String),
    #[error("not found: {0}")] NotFound(String),
    #[error("codec error: {0}")] Codec(String),
    #[error("transient store error: {0}")] Transient(String),
    #[error("store backend error: {0}")] Backend(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum QueueError {
    #[error("unbalanced unfreeze_timestamp call")] UnbalancedUnfreeze,
    #[error("invalid session id: {0}")] InvalidSessionId(String),
    #[error("task {0} has no destination queue")] MissingQueue(u64),
    #[error(transparent)] Store(#[from] StoreError),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum FlowError {
    #[error("unable to locate flow {0}")] UnknownFlow(String),
    #[error("unauthorized: {0}")] Unauthorized(String),
    #[error("invalid flow args: {0}")] InvalidArgs(String),
    #[error("flow {flow} has no state method {state}")] UnknownState { flow: String, state: String },
    #[error("unknown client action: {0}")] UnknownAction(String),
    #[error("desynchronized responses: {0}")] Desynchronized(String),
    #[error("schema mismatch: {0}")] SchemaMismatch(String),
    #[error("{0}")] ResourceLimitExceeded(String),
    #[error("lease expired on flow {0}")] LeaseExpired(String),
    #[error("flow {0} is not running")] NotRunning(String),
    #[error("flow {0} not found")] FlowNotFound(String),
    #[error("flow {session} failed: {reason}")] FlowFailed { session: String, reason: String },
    #[error("{0}")] Handler(String),
    #[error(transparent)] Queue(#[from] QueueError),
    #[error(transparent)] Store(#[from] StoreError),
    #[error("codec error: {0}")] Codec(String),
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl FlowError {
    /// Atajo para errores levantados desde el código de un handler.
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }
}

/// Clasificación operativa de un `FlowError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Respuestas sin status o incoherentes.
    Protocol,
    /// Tipo de payload distinto al declarado por la acción.
    Schema,
    /// Se superó el techo de CPU o red.
    ResourceLimit,
    /// Falta token o permisos; se rechaza antes de mutar estado.
    Authorization,
    /// Contención o fallos de store reintentables en la próxima iteración.
    Transient,
    Permanent,
}

pub fn classify_error(err: &FlowError) -> ErrorClass {
    match err {
        FlowError::Desynchronized(_) => ErrorClass::Protocol,
        FlowError::SchemaMismatch(_) | FlowError::UnknownAction(_) => ErrorClass::Schema,
        FlowError::ResourceLimitExceeded(_) => ErrorClass::ResourceLimit,
        FlowError::Unauthorized(_) => ErrorClass::Authorization,
        FlowError::Store(e) | FlowError::Queue(QueueError::Store(e)) => match e {
            StoreError::LockContention(_) | StoreError::Transient(_) => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        },
        _ => ErrorClass::Permanent,
    }
}

//! Identificadores de sesión (flows) y de cliente.
//!
//! Un `SessionId` tiene la forma `<cola>:<nombre>`; la parte antes de `:`
//! es la cola de notificaciones por la que el worker descubre trabajo para
//! ese flow. Los well-known flows usan un nombre fijo (`W:Foreground`); los
//! flows ordinarios un nombre aleatorio de 8 dígitos hexadecimales.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::QueueError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Genera un id nuevo en la cola indicada.
    pub fn new(queue: &str) -> Self {
        let raw = Uuid::new_v4().simple().to_string().to_uppercase();
        Self(format!("{queue}:{}", &raw[..8]))
    }

    pub fn well_known(queue: &str, name: &str) -> Self {
        Self(format!("{queue}:{name}"))
    }

    pub fn parse(raw: &str) -> Result<Self, QueueError> {
        match raw.split_once(':') {
            Some((queue, name)) if !queue.is_empty() && !name.is_empty() && !queue.contains('/') => {
                Ok(Self(raw.to_string()))
            }
            _ => Err(QueueError::InvalidSessionId(raw.to_string())),
        }
    }

    /// Cola de notificaciones a la que pertenece este flow.
    pub fn queue(&self) -> &str {
        self.0.split_once(':').map(|(q, _)| q).unwrap_or(&self.0)
    }

    pub fn flow_name(&self) -> &str {
        self.0.split_once(':').map(|(_, n)| n).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identificador de un agente remoto: `C.` seguido de 16 dígitos hex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn random() -> Self {
        let raw = Uuid::new_v4().simple().to_string();
        Self(format!("C.{}", &raw[..16]))
    }

    pub fn parse(raw: &str) -> Result<Self, QueueError> {
        let valid = raw.strip_prefix("C.")
                       .map(|hex| hex.len() == 16 && hex.chars().all(|c| c.is_ascii_hexdigit()))
                       .unwrap_or(false);
        if valid {
            Ok(Self(raw.to_lowercase()))
        } else {
            Err(QueueError::InvalidSessionId(raw.to_string()))
        }
    }

    /// Subject de la cola de tasks de este cliente.
    pub fn queue(&self) -> String {
        format!("{}/tasks", self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//! Contrato que implementa cada flow.
//!
//! Un flow es una máquina de estados con nombre: cada estado es un handler
//! que recibe las responses del request que lo invocó y puede emitir nuevas
//! llamadas a través del `FlowRunner`. Entre turnos el flow se reconstruye
//! desde su `FlowStateDict`, por eso `serialize`/`initialize` deben ser
//! simétricos.

use serde_json::Value;

use super::{FlowRunner, Responses};
use crate::constants::END_STATE;
use crate::errors::FlowError;
use crate::model::{FlowStateDict, Message};
use crate::services::Services;

pub trait Flow: Send {
    /// Reconstruye el estado del flow. Se llama al crearlo (con el dict
    /// vacío) y cada vez que se reabre (con el dict persistido).
    fn initialize(&mut self, _args: &Value, _state: &FlowStateDict) -> Result<(), FlowError> {
        Ok(())
    }

    /// Nombres de los estados invocables. `End` es implícito.
    fn states(&self) -> &'static [&'static str];

    fn handle_state(&mut self, state: &str, runner: &mut FlowRunner, responses: &Responses) -> Result<(), FlowError>;

    /// Vuelca el estado propio al dict antes de persistir.
    fn serialize(&self, _state: &mut FlowStateDict) -> Result<(), FlowError> {
        Ok(())
    }

    /// Si es `false`, el estado acepta responses no autenticadas.
    fn auth_required(&self, _state: &str) -> bool {
        true
    }

    fn validate_args(&self, _args: &Value) -> Result<(), FlowError> {
        Ok(())
    }

    fn has_state(&self, state: &str) -> bool {
        state == END_STATE || self.states().contains(&state)
    }
}

/// Flow con dirección fija que procesa mensajes sueltos, sin requests.
pub trait WellKnownFlow: Send + Sync {
    fn allow_unauthenticated(&self) -> bool {
        false
    }

    fn process_message(&self, message: &Message, services: &Services) -> Result<(), FlowError>;
}

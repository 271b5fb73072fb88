//! Nombres de subjects y columnas usados por las colas y el estado de flows.
//!
//! Los ids van en hexadecimal de ancho fijo para que el orden lexicográfico
//! de columnas coincida con el numérico.

use crate::constants::{NOTIFY_PREDICATE_PREFIX, TASK_PREDICATE_PREFIX, WELL_KNOWN_REQUEST_ID};
use crate::model::SessionId;

pub const REQUEST_PREFIX: &str = "flow:request:";
pub const STATUS_PREFIX: &str = "flow:status:";
pub const RESPONSE_PREFIX: &str = "flow:response:";

pub fn task_column(task_id: u64) -> String {
    format!("{TASK_PREDICATE_PREFIX}{task_id:020}")
}

pub fn notify_column(session_id: &SessionId) -> String {
    format!("{NOTIFY_PREDICATE_PREFIX}{session_id}")
}

/// Subject con requests, statuses y responses de un flow.
pub fn state_subject(session_id: &SessionId) -> String {
    format!("{session_id}/state")
}

pub fn request_column(request_id: u64) -> String {
    format!("{REQUEST_PREFIX}{request_id:08X}")
}

pub fn status_column(request_id: u64) -> String {
    format!("{STATUS_PREFIX}{request_id:08X}")
}

pub fn response_prefix(request_id: u64) -> String {
    format!("{RESPONSE_PREFIX}{request_id:08X}:")
}

pub fn response_column(request_id: u64, response_id: u64) -> String {
    format!("{}{response_id:08X}", response_prefix(request_id))
}

/// Los mensajes a well-known flows no tienen request; se indexan por task.
pub fn well_known_column(task_id: u64) -> String {
    format!("{}{task_id:016X}", response_prefix(WELL_KNOWN_REQUEST_ID))
}

pub fn logs_subject(session_id: &SessionId) -> String {
    format!("{session_id}/logs")
}

pub fn results_subject(session_id: &SessionId) -> String {
    format!("{session_id}/results")
}

/// Extrae los ids hexadecimales que siguen a `prefix` en una columna.
pub fn parse_ids(column: &str, prefix: &str) -> Option<Vec<u64>> {
    column.strip_prefix(prefix)?
          .split(':')
          .filter(|p| !p.is_empty())
          .map(|p| u64::from_str_radix(p, 16).ok())
          .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FLOW_STATE_PREFIX;

    #[test]
    fn columns_sort_numerically() {
        assert!(request_column(9) < request_column(10));
        assert!(response_column(1, 0xF) < response_column(1, 0x10));
        assert!(task_column(99) < task_column(100));
    }

    #[test]
    fn ids_roundtrip_through_columns() {
        assert_eq!(parse_ids(&response_column(3, 17), RESPONSE_PREFIX), Some(vec![3, 17]));
        assert_eq!(parse_ids(&request_column(42), REQUEST_PREFIX), Some(vec![42]));
        assert_eq!(parse_ids(&well_known_column(0xABC), RESPONSE_PREFIX), Some(vec![0, 0xABC]));
        assert_eq!(parse_ids("flow:request:zz", REQUEST_PREFIX), None);
        assert!(status_column(1).starts_with(FLOW_STATE_PREFIX));
    }
}

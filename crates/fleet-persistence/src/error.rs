//! Errores de persistencia.
//! Mapea errores de Diesel / pool a variantes semánticas y de ahí a
//! `StoreError`, que es lo que ve el control plane.

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use fleet_core::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unique violation: {0}")] UniqueViolation(String),
    #[error("check violation: {0}")] CheckViolation(String),
    #[error("not found")] NotFound,
    #[error("serialization conflict (retryable)")] SerializationConflict,
    #[error("transient IO / connection pool error: {0}")] TransientIo(String),
    #[error("configuration error: {0}")] Config(String),
    #[error("unknown database error: {0}")] Unknown(String),
}

impl From<DieselError> for PersistenceError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => Self::NotFound,
            DieselError::DatabaseError(kind, info) => match kind {
                DatabaseErrorKind::UniqueViolation => Self::UniqueViolation(info.message().to_string()),
                DatabaseErrorKind::CheckViolation => Self::CheckViolation(info.message().to_string()),
                DatabaseErrorKind::SerializationFailure => Self::SerializationConflict,
                DatabaseErrorKind::ClosedConnection => Self::TransientIo(info.message().to_string()),
                other => Self::Unknown(format!("db error kind {other:?}: {}", info.message())),
            },
            DieselError::BrokenTransactionManager => Self::TransientIo("broken transaction manager".into()),
            other => Self::Unknown(format!("unhandled diesel error: {other:?}")),
        }
    }
}

impl From<PersistenceError> for StoreError {
    fn from(err: PersistenceError) -> Self {
        match err {
            PersistenceError::NotFound => StoreError::NotFound("row".into()),
            PersistenceError::SerializationConflict | PersistenceError::TransientIo(_) => {
                StoreError::Transient(err.to_string())
            }
            other => StoreError::Backend(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_become_transient() {
        let e: StoreError = PersistenceError::SerializationConflict.into();
        assert!(matches!(e, StoreError::Transient(_)));
        let e: StoreError = PersistenceError::TransientIo("pool".into()).into();
        assert!(matches!(e, StoreError::Transient(_)));
    }

    #[test]
    fn other_errors_are_backend_errors() {
        let e: StoreError = PersistenceError::UniqueViolation("dup".into()).into();
        assert_eq!(e, StoreError::Backend("unique violation: dup".into()));
        let e: StoreError = PersistenceError::from(DieselError::NotFound).into();
        assert!(matches!(e, StoreError::NotFound(_)));
    }
}

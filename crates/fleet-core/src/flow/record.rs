//! Persistencia del registro de un flow, sus logs y sus resultados.
//!
//! El registro vive en el subject `<session_id>`; logs y resultados en
//! subjects propios para que su crecimiento no afecte a la carga del flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::FlowError;
use crate::model::{FlowContext, FlowRunnerArgs, FlowStateDict, PendingTermination, SessionId};
use crate::queue::layout::{logs_subject, results_subject};
use crate::store::{Cell, DataStore, MutationPool, TimeRange};

const CONTEXT_COLUMN: &str = "metadata:context";
const ARGS_COLUMN: &str = "metadata:args";
const RUNNER_ARGS_COLUMN: &str = "metadata:runner_args";
const STATE_DICT_COLUMN: &str = "metadata:state_dict";
const PENDING_TERMINATION_COLUMN: &str = "metadata:pending_termination";
const LOG_PREFIX: &str = "log:";
const RESULT_PREFIX: &str = "result:";

/// Todo lo necesario para reabrir un flow en otro proceso.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowRecord {
    pub context: FlowContext,
    pub args: Value,
    pub runner_args: FlowRunnerArgs,
    pub state_dict: FlowStateDict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowLogEntry {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

pub fn load_record(store: &dyn DataStore, session_id: &SessionId) -> Result<Option<FlowRecord>, FlowError> {
    let subject = session_id.as_str();
    let Some(context) = store.resolve(subject, CONTEXT_COLUMN)? else {
        return Ok(None);
    };
    let runner_args = store.resolve(subject, RUNNER_ARGS_COLUMN)?
                           .ok_or_else(|| FlowError::Codec(format!("flow {session_id} has no runner args")))?;
    let args = match store.resolve(subject, ARGS_COLUMN)? {
        Some(c) => serde_json::from_slice(&c.value)?,
        None => Value::Null,
    };
    let state_dict = match store.resolve(subject, STATE_DICT_COLUMN)? {
        Some(c) => serde_json::from_slice(&c.value)?,
        None => FlowStateDict::new(),
    };
    Ok(Some(FlowRecord { context: serde_json::from_slice(&context.value)?,
                         args,
                         runner_args: serde_json::from_slice(&runner_args.value)?,
                         state_dict }))
}

pub fn write_record(pool: &mut MutationPool, record: &FlowRecord, ts: DateTime<Utc>) -> Result<(), FlowError> {
    let subject = record.context.session_id.as_str();
    pool.set(subject, CONTEXT_COLUMN, serde_json::to_vec(&record.context)?, ts, true);
    pool.set(subject, ARGS_COLUMN, serde_json::to_vec(&record.args)?, ts, true);
    pool.set(subject, RUNNER_ARGS_COLUMN, serde_json::to_vec(&record.runner_args)?, ts, true);
    pool.set(subject, STATE_DICT_COLUMN, serde_json::to_vec(&record.state_dict)?, ts, true);
    Ok(())
}

pub fn read_pending_termination(store: &dyn DataStore,
                                session_id: &SessionId)
                                -> Result<Option<PendingTermination>, FlowError> {
    match store.resolve(session_id.as_str(), PENDING_TERMINATION_COLUMN)? {
        Some(c) => Ok(Some(serde_json::from_slice(&c.value)?)),
        None => Ok(None),
    }
}

/// Escritura ciega: no requiere el lease del flow.
pub fn write_pending_termination(store: &dyn DataStore,
                                 session_id: &SessionId,
                                 reason: &str,
                                 ts: DateTime<Utc>)
                                 -> Result<(), FlowError> {
    let marker = PendingTermination { reason: reason.to_string() };
    store.set(session_id.as_str(), PENDING_TERMINATION_COLUMN, serde_json::to_vec(&marker)?, ts, true)?;
    Ok(())
}

/// Las columnas llevan una secuencia monótona para conservar el orden de
/// inserción entre turnos distintos del mismo flow.
fn sequenced_column(prefix: &str, seq: u64) -> String {
    format!("{prefix}{seq:020}")
}

pub fn append_logs<F>(pool: &mut MutationPool,
                      session_id: &SessionId,
                      entries: &[FlowLogEntry],
                      mut next_seq: F)
                      -> Result<(), FlowError>
    where F: FnMut() -> u64
{
    let subject = logs_subject(session_id);
    for entry in entries {
        pool.set(&subject,
                 &sequenced_column(LOG_PREFIX, next_seq()),
                 serde_json::to_vec(entry)?,
                 entry.timestamp,
                 true);
    }
    Ok(())
}

pub fn append_results<F>(pool: &mut MutationPool,
                         session_id: &SessionId,
                         results: &[Value],
                         ts: DateTime<Utc>,
                         mut next_seq: F)
                         -> Result<(), FlowError>
    where F: FnMut() -> u64
{
    let subject = results_subject(session_id);
    for value in results {
        pool.set(&subject, &sequenced_column(RESULT_PREFIX, next_seq()), serde_json::to_vec(value)?, ts, true);
    }
    Ok(())
}

fn decode_all<T: serde::de::DeserializeOwned>(cells: Vec<Cell>) -> Result<Vec<T>, FlowError> {
    cells.into_iter().map(|c| serde_json::from_slice(&c.value).map_err(FlowError::from)).collect()
}

pub fn read_logs(store: &dyn DataStore, session_id: &SessionId) -> Result<Vec<FlowLogEntry>, FlowError> {
    decode_all(store.resolve_prefix(&logs_subject(session_id), LOG_PREFIX, TimeRange::all())?)
}

pub fn read_results(store: &dyn DataStore, session_id: &SessionId) -> Result<Vec<Value>, FlowError> {
    decode_all(store.resolve_prefix(&results_subject(session_id), RESULT_PREFIX, TimeRange::all())?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::model::Priority;
    use crate::store::InMemoryDataStore;

    fn record(now: DateTime<Utc>) -> FlowRecord {
        let sid = SessionId::well_known("W", "0000AAAA");
        let mut state_dict = FlowStateDict::new();
        state_dict.set("count", 3).unwrap();
        FlowRecord { context: FlowContext::new(sid, "alice", now),
                     args: json!({"path": "/tmp"}),
                     runner_args: FlowRunnerArgs { flow_name: "Demo".into(),
                                                   client_id: None,
                                                   queue: "W".into(),
                                                   priority: Priority::Medium,
                                                   cpu_limit: None,
                                                   network_bytes_limit: None,
                                                   start_time: None,
                                                   notification_event: None,
                                                   request_state: None },
                     state_dict }
    }

    #[test]
    fn record_survives_reload() {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = InMemoryDataStore::new(clock.clone());
        let rec = record(clock.now());
        let mut pool = MutationPool::new();
        write_record(&mut pool, &rec, clock.now()).unwrap();
        pool.flush(&store).unwrap();
        let loaded = load_record(&store, &rec.context.session_id).unwrap().unwrap();
        assert_eq!(loaded, rec);
        assert!(load_record(&store, &SessionId::well_known("W", "missing")).unwrap().is_none());
    }

    #[test]
    fn logs_keep_insertion_order() {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = InMemoryDataStore::new(clock.clone());
        let sid = SessionId::well_known("W", "0000BBBB");
        let entries: Vec<FlowLogEntry> = ["one", "two", "three"].iter()
                                                                 .map(|m| FlowLogEntry { session_id: sid.clone(),
                                                                                         timestamp: clock.now(),
                                                                                         message: m.to_string() })
                                                                 .collect();
        let mut pool = MutationPool::new();
        let mut seq = 0u64;
        append_logs(&mut pool, &sid, &entries, || {
            seq += 1;
            seq
        }).unwrap();
        pool.flush(&store).unwrap();
        let got: Vec<String> = read_logs(&store, &sid).unwrap().into_iter().map(|e| e.message).collect();
        assert_eq!(got, vec!["one", "two", "three"]);
    }
}

mod test_support;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use fleet_core::store::{Cell, LockToken, Mutation, TimeRange};
use fleet_core::{DataStore, FlowError, FlowManager, FlowState, InMemoryDataStore, ManualClock, QueueManager, Services,
                 SessionId, StartFlowRequest, StoreError, Worker};
use test_support::{client_id, mock_client, register_all, token, ProcessLister};

/// Store que registra cada lote y puede rechazar los que tocan colas o
/// las lecturas del estado de requests.
struct FaultyStore {
    inner: InMemoryDataStore,
    fail_queue_writes: AtomicBool,
    failing_state_scans: AtomicUsize,
    batches: Mutex<Vec<Vec<(String, String)>>>,
}

impl FaultyStore {
    fn new(clock: &Arc<ManualClock>) -> Self {
        Self { inner: InMemoryDataStore::new(clock.clone()),
               fail_queue_writes: AtomicBool::new(false),
               failing_state_scans: AtomicUsize::new(0),
               batches: Mutex::new(Vec::new()) }
    }

    fn batch_index(&self, column_prefix: &str) -> Option<usize> {
        self.batches.lock().unwrap().iter().position(|b| b.iter().any(|(_, c)| c.starts_with(column_prefix)))
    }

    fn subjects_with(&self, column: &str) -> Vec<String> {
        let mut out: Vec<String> = self.batches
                                       .lock()
                                       .unwrap()
                                       .iter()
                                       .flatten()
                                       .filter(|(_, c)| c == column)
                                       .map(|(s, _)| s.clone())
                                       .collect();
        out.dedup();
        out
    }
}

fn touches_queues(m: &Mutation) -> bool {
    matches!(m, Mutation::Set { column, .. } if column.starts_with("task:") || column.starts_with("notify:"))
}

impl DataStore for FaultyStore {
    fn apply(&self, mutations: Vec<Mutation>) -> Result<(), StoreError> {
        if self.fail_queue_writes.load(Ordering::SeqCst) && mutations.iter().any(touches_queues) {
            return Err(StoreError::Transient("injected failure".into()));
        }
        let columns = mutations.iter()
                               .filter_map(|m| match m {
                                   Mutation::Set { subject, column, .. } => Some((subject.clone(), column.clone())),
                                   _ => None,
                               })
                               .collect();
        self.batches.lock().unwrap().push(columns);
        self.inner.apply(mutations)
    }

    fn resolve_prefix(&self, subject: &str, prefix: &str, range: TimeRange) -> Result<Vec<Cell>, StoreError> {
        if prefix.starts_with("flow:")
           && self.failing_state_scans.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
        {
            return Err(StoreError::Transient("injected failure".into()));
        }
        self.inner.resolve_prefix(subject, prefix, range)
    }

    fn try_lock(&self, subject: &str, lease: Duration) -> Result<LockToken, StoreError> {
        self.inner.try_lock(subject, lease)
    }

    fn extend_lock(&self, token: &LockToken, lease: Duration) -> Result<LockToken, StoreError> {
        self.inner.extend_lock(token, lease)
    }

    fn unlock(&self, token: &LockToken) -> Result<(), StoreError> {
        self.inner.unlock(token)
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.now()
    }
}

fn setup_faulty() -> (Arc<FaultyStore>, Arc<Services>) {
    let clock = Arc::new(ManualClock::at_epoch());
    let store = Arc::new(FaultyStore::new(&clock));
    let services = register_all(Services::builder(store.clone()).clock(clock)).build();
    (store, services)
}

#[test]
fn flow_record_is_committed_before_its_messages() {
    let (store, services) = setup_faulty();
    let manager = FlowManager::new(Arc::clone(&services));
    manager.start_flow(StartFlowRequest::new("ListProcesses").client_id(client_id()).token(token())).unwrap();

    let record = store.batch_index("metadata:context").unwrap();
    let task = store.batch_index("task:").unwrap();
    let notify = store.batch_index("notify:");
    assert!(record < task);
    assert!(notify.is_none() || notify > Some(record));
}

#[test]
fn failed_message_flush_leaves_no_queued_work() {
    let (store, services) = setup_faulty();
    store.fail_queue_writes.store(true, Ordering::SeqCst);
    let manager = FlowManager::new(Arc::clone(&services));
    let err = manager.start_flow(StartFlowRequest::new("ListProcesses").client_id(client_id()).token(token()))
                     .unwrap_err();
    assert!(err.to_string().contains("injected failure"));

    let qm = QueueManager::new(Arc::clone(&services), "tester");
    assert!(qm.query(&client_id().queue(), 10, None).unwrap().is_empty());
    assert!(qm.get_notifications_for_all_shards("W").unwrap().is_empty());

    // The record made it; no request state did.
    let contexts = store.subjects_with("metadata:context");
    assert_eq!(contexts.len(), 1);
    let sid = SessionId::parse(&contexts[0]).unwrap();
    assert_eq!(manager.flow_context(&sid).unwrap().state, FlowState::Running);
    assert!(manager.get_flow_requests(&sid).unwrap().is_empty());

    // The lease was released when the runner went away.
    assert!(manager.open_with_lock(&sid, false, &token()).is_ok());
}

#[test]
fn store_error_mid_turn_requeues_instead_of_committing() {
    let (store, services) = setup_faulty();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(StartFlowRequest::new("ListProcesses").client_id(client_id()).token(token()))
                     .unwrap();
    assert!(mock_client(&services, ProcessLister::new(1)).next().unwrap());

    let qm = QueueManager::new(Arc::clone(&services), "tester");
    let before = qm.get_notifications_for_all_shards("W").unwrap();
    assert_eq!(before.len(), 1);

    store.failing_state_scans.store(1, Ordering::SeqCst);
    let mut worker = Worker::new(Arc::clone(&services));
    let err = worker.run_once().unwrap_err();
    assert!(matches!(err, FlowError::Queue(_) | FlowError::Store(_)), "unexpected error {err:?}");

    // Nothing committed and the notification is back with its first_queued.
    assert_eq!(manager.flow_context(&sid).unwrap().state, FlowState::Running);
    let after = qm.get_notifications_for_all_shards("W").unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].session_id, sid);
    assert_eq!(after[0].first_queued, before[0].first_queued);

    // The lease went away with the runner, so the next turn finishes the flow.
    assert_eq!(worker.run_once().unwrap(), 1);
    assert_eq!(manager.flow_context(&sid).unwrap().state, FlowState::Terminated);
    assert!(qm.get_notifications_for_all_shards("W").unwrap().is_empty());
}

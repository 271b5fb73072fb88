mod test_support;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::Duration;
use fleet_core::model::{CpuSeconds, Notification, Status};
use fleet_core::stats::REQUEST_RETRANSMISSION_COUNT;
use fleet_core::testing::run_flow_helper;
use fleet_core::{FlowError, FlowManager, FlowState, ManualClock, Message, QueueManager, StartFlowRequest, Worker,
                 WorkerConfig};
use serde_json::json;
use test_support::{builder, client_id, mock_client, setup, token, ProcessLister};

fn list_processes() -> StartFlowRequest {
    StartFlowRequest::new("ListProcesses").client_id(client_id()).token(token())
}

#[test]
fn busy_flow_keeps_its_notification() {
    let (_clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(list_processes()).unwrap();
    assert!(mock_client(&services, ProcessLister::new(1)).next().unwrap());

    let held = manager.open_with_lock(&sid, false, &token()).unwrap();
    let mut worker = Worker::new(Arc::clone(&services));
    assert_eq!(worker.run_once().unwrap(), 1);
    assert_eq!(manager.flow_context(&sid).unwrap().state, FlowState::Running);
    let qm = QueueManager::new(Arc::clone(&services), "tester");
    let pending = qm.get_notifications_for_all_shards("W").unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].session_id, sid);

    drop(held);
    assert_eq!(worker.run_once().unwrap(), 1);
    assert_eq!(manager.flow_context(&sid).unwrap().state, FlowState::Terminated);
    assert!(qm.get_notifications_for_all_shards("W").unwrap().is_empty());
}

#[test]
fn failed_flow_aborts_the_pass_when_checking_errors() {
    let clock = Arc::new(ManualClock::at_epoch());
    let config = WorkerConfig { check_flow_errors: true, ..WorkerConfig::default() };
    let services = builder(&clock).worker_config(config).build();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(list_processes().cpu_limit(0.5)).unwrap();
    assert!(mock_client(&services, ProcessLister::new(1).with_usage(CpuSeconds::new(1.0, 0.0), 0)).next().unwrap());

    let err = Worker::new(Arc::clone(&services)).run_once().unwrap_err();
    match err {
        FlowError::FlowFailed { session, reason } => {
            assert_eq!(session, sid.to_string());
            assert_eq!(reason, "CPU limit exceeded.");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn missing_responses_trigger_a_retransmission() {
    let (clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(list_processes()).unwrap();

    // A client that loses the middle response.
    let mut client = QueueManager::new(Arc::clone(&services), "lossy");
    let task = client.query_and_own(&client_id().queue(), Duration::seconds(600), 1).unwrap().remove(0);
    client.queue_response(Message::response(sid.clone(), task.request_id, 1, json!({"pid": 1})).with_args_type("Process"),
                          None);
    client.queue_response(Message::status(sid.clone(), task.request_id, 3, &Status::ok()).unwrap(), None);
    client.queue_notification(Notification::new(sid.clone()).with_last_status(task.request_id), None);
    client.flush().unwrap();

    Worker::new(Arc::clone(&services)).run_once().unwrap();
    assert_eq!(services.stats.counter(REQUEST_RETRANSMISSION_COUNT, &[]), 1);
    assert_eq!(manager.flow_context(&sid).unwrap().state, FlowState::Running);
    let requeued = client.query(&client_id().queue(), 10, None).unwrap();
    assert_eq!(requeued.len(), 1);
    assert_ne!(requeued[0].task_id, task.task_id);
    assert_eq!(requeued[0].request_id, task.request_id);

    let mut clients = [mock_client(&services, ProcessLister::new(2))];
    run_flow_helper(&services, &clock, &mut clients, &sid).unwrap();
    assert_eq!(manager.flow_results(&sid).unwrap().len(), 2);
}

#[test]
fn run_returns_once_stopped() {
    let (_clock, services) = setup();
    let stop = AtomicBool::new(true);
    Worker::new(services).run(&stop).unwrap();
}

mod test_support;

use std::sync::Arc;

use chrono::Duration;
use fleet_core::constants::AUDIT_CHANNEL;
use fleet_core::event::{AuditAction, Event};
use fleet_core::flow::record::load_record;
use fleet_core::model::CpuSeconds;
use fleet_core::stats::{FLOW_COMPLETIONS, FLOW_INVALID_FLOW_COUNT};
use fleet_core::testing::run_flow_helper;
use fleet_core::{FlowError, FlowManager, FlowState, InMemoryEventPublisher, ManualClock, StartFlowRequest, StatusCode,
                 Worker};
use serde_json::json;
use test_support::{builder, client_id, mock_client, setup, token, ProcessLister};

fn list_processes() -> StartFlowRequest {
    StartFlowRequest::new("ListProcesses").client_id(client_id()).token(token())
}

#[test]
fn list_processes_runs_to_completion() {
    let (clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(list_processes()).unwrap();
    assert_eq!(manager.flow_context(&sid).unwrap().state, FlowState::Running);

    let mut clients = [mock_client(&services, ProcessLister::new(3).with_usage(CpuSeconds::new(1.0, 0.5), 100))];
    run_flow_helper(&services, &clock, &mut clients, &sid).unwrap();

    let ctx = manager.flow_context(&sid).unwrap();
    assert_eq!(ctx.state, FlowState::Terminated);
    assert_eq!(ctx.outstanding_requests, 0);
    assert!((ctx.client_resources.cpu_usage.total() - 1.5).abs() < 1e-9);
    assert_eq!(ctx.client_resources.network_bytes_sent, 100);

    let results = manager.flow_results(&sid).unwrap();
    assert_eq!(results, vec![json!({"pid": 1}), json!({"pid": 2}), json!({"pid": 3})]);
    assert_eq!(services.stats.counter(FLOW_COMPLETIONS, &["ListProcesses"]), 1);

    let logs: Vec<String> = manager.flow_logs(&sid).unwrap().into_iter().map(|l| l.message).collect();
    assert!(logs.contains(&"got 3 processes".to_string()));
    assert_eq!(logs.last().map(String::as_str), Some("done"));

    let record = load_record(services.store.as_ref(), &sid).unwrap().unwrap();
    assert_eq!(record.state_dict.get::<u64>("count").unwrap(), Some(3));
    assert!(manager.get_flow_requests(&sid).unwrap().is_empty());
}

#[test]
fn cpu_limit_puts_flow_in_error() {
    let (clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(list_processes().cpu_limit(1.0)).unwrap();

    let mut clients = [mock_client(&services, ProcessLister::new(1).with_usage(CpuSeconds::new(1.0, 0.5), 0))];
    let err = run_flow_helper(&services, &clock, &mut clients, &sid).unwrap_err();
    assert!(matches!(err, FlowError::FlowFailed { .. }));

    let ctx = manager.flow_context(&sid).unwrap();
    assert_eq!(ctx.state, FlowState::Error);
    assert_eq!(ctx.backtrace.as_deref(), Some("CPU limit exceeded."));
    assert!(manager.flow_results(&sid).unwrap().is_empty());
}

#[test]
fn client_failure_reaches_the_handler() {
    let (clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(list_processes()).unwrap();

    let mut clients = [mock_client(&services, ProcessLister::new(0).failing("boom"))];
    assert!(run_flow_helper(&services, &clock, &mut clients, &sid).is_err());

    let ctx = manager.flow_context(&sid).unwrap();
    assert_eq!(ctx.state, FlowState::Error);
    assert_eq!(ctx.backtrace.as_deref(), Some("client failed: boom"));
}

#[test]
fn child_flow_reports_back_to_parent() {
    let (clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(StartFlowRequest::new("ParentFlow").client_id(client_id()).token(token())).unwrap();

    let children = manager.flow_context(&sid).unwrap().children;
    assert_eq!(children.len(), 1);
    assert_eq!(manager.flow_context(&children[0]).unwrap().state, FlowState::Running);

    let mut clients = [mock_client(&services, ProcessLister::new(3))];
    run_flow_helper(&services, &clock, &mut clients, &sid).unwrap();

    let record = load_record(services.store.as_ref(), &sid).unwrap().unwrap();
    assert_eq!(record.state_dict.get::<usize>("child_results").unwrap(), Some(3));
    assert_eq!(record.state_dict.get::<bool>("child_ok").unwrap(), Some(true));
    assert_eq!(manager.flow_results(&children[0]).unwrap().len(), 3);
}

#[test]
fn inline_call_state_finishes_inside_start_flow() {
    let (_clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(StartFlowRequest::new("InlineFlow").token(token())).unwrap();

    assert_eq!(manager.flow_context(&sid).unwrap().state, FlowState::Terminated);
    assert_eq!(manager.flow_results(&sid).unwrap(), vec![json!("a"), json!("b")]);
    assert!(manager.get_flow_requests(&sid).unwrap().is_empty());
}

#[test]
fn delayed_call_state_waits_for_its_start_time() {
    let (clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(StartFlowRequest::new("DelayedFlow").token(token())).unwrap();
    let mut worker = Worker::new(Arc::clone(&services));

    assert_eq!(worker.run_once().unwrap(), 0);
    clock.advance(Duration::seconds(3));
    assert_eq!(worker.run_once().unwrap(), 0);
    assert_eq!(manager.flow_context(&sid).unwrap().state, FlowState::Running);

    clock.advance(Duration::seconds(3));
    assert_eq!(worker.run_once().unwrap(), 1);
    let record = load_record(services.store.as_ref(), &sid).unwrap().unwrap();
    assert_eq!(record.context.state, FlowState::Terminated);
    assert_eq!(record.state_dict.get::<i64>("payload").unwrap(), Some(42));
    assert_eq!(record.state_dict.get::<String>("tag").unwrap(), Some("delayed".to_string()));
}

#[test]
fn async_start_runs_on_the_worker() {
    let (_clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(StartFlowRequest::new("InlineFlow").token(token()).sync(false)).unwrap();
    assert_eq!(manager.flow_context(&sid).unwrap().state, FlowState::Running);
    assert!(manager.flow_results(&sid).unwrap().is_empty());

    Worker::new(Arc::clone(&services)).run_once().unwrap();
    assert_eq!(manager.flow_context(&sid).unwrap().state, FlowState::Terminated);
    assert_eq!(manager.flow_results(&sid).unwrap().len(), 2);
}

#[test]
fn start_flow_rejects_invalid_requests() {
    let (_clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));

    let err = manager.start_flow(StartFlowRequest::new("ListProcesses").client_id(client_id())).unwrap_err();
    assert_eq!(err, FlowError::Unauthorized("A token must be specified.".into()));

    let err = manager.start_flow(StartFlowRequest::new("NoSuchFlow").token(token())).unwrap_err();
    assert_eq!(err, FlowError::UnknownFlow("NoSuchFlow".into()));
    assert_eq!(services.stats.counter(FLOW_INVALID_FLOW_COUNT, &[]), 1);

    let err = manager.start_flow(StartFlowRequest::new("ListProcesses").token(token())).unwrap_err();
    assert!(matches!(err, FlowError::InvalidArgs(_)));

    let err = manager.start_flow(StartFlowRequest::new("DelayedFlow").token(token()).args(json!({"bogus": 1})))
                     .unwrap_err();
    match err {
        FlowError::InvalidArgs(msg) => assert_eq!(msg, "Unknown parameters to StartFlow: bogus"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn audit_and_status_events_are_published() {
    let clock = Arc::new(ManualClock::at_epoch());
    let events = Arc::new(InMemoryEventPublisher::new());
    let services = builder(&clock).events(events.clone()).build();
    let manager = FlowManager::new(Arc::clone(&services));

    let sid = manager.start_flow(list_processes().notification_event("flow_status")).unwrap();
    let audit = events.events_on(AUDIT_CHANNEL);
    assert_eq!(audit.len(), 1);
    match &audit[0] {
        Event::Audit(e) => {
            assert_eq!(e.action, AuditAction::RunFlow);
            assert_eq!(e.user, "alice");
            assert_eq!(e.session_id, sid);
            assert_eq!(e.description.as_deref(), Some("testing"));
        }
        other => panic!("unexpected event {other:?}"),
    }

    let mut clients = [mock_client(&services, ProcessLister::new(1))];
    run_flow_helper(&services, &clock, &mut clients, &sid).unwrap();
    let status = events.events_on("flow_status");
    assert_eq!(status.len(), 1);
    match &status[0] {
        Event::FlowStatus(e) => {
            assert_eq!(e.session_id, sid);
            assert_eq!(e.state, FlowState::Terminated);
            assert_eq!(e.status.code, StatusCode::Ok);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

mod test_support;

use std::sync::Arc;

use fleet_core::constants::AUDIT_CHANNEL;
use fleet_core::event::{AuditAction, Event};
use fleet_core::flow::is_lock_contention;
use fleet_core::testing::run_flow_helper;
use fleet_core::{FlowError, FlowManager, FlowState, InMemoryEventPublisher, ManualClock, QueueManager,
                 StartFlowRequest, Worker};
use test_support::{builder, client_id, mock_client, setup, token, ProcessLister};

#[test]
fn terminating_a_parent_cascades_to_children() {
    let clock = Arc::new(ManualClock::at_epoch());
    let events = Arc::new(InMemoryEventPublisher::new());
    let services = builder(&clock).events(events.clone()).build();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(StartFlowRequest::new("ParentFlow").client_id(client_id()).token(token())).unwrap();
    let child = manager.flow_context(&sid).unwrap().children[0].clone();

    let qm = QueueManager::new(Arc::clone(&services), "tester");
    assert_eq!(qm.query(&client_id().queue(), 10, None).unwrap().len(), 1);

    manager.terminate_flow(&sid, None, None, Some(&token()), false).unwrap();

    let parent_ctx = manager.flow_context(&sid).unwrap();
    assert_eq!(parent_ctx.state, FlowState::Error);
    assert_eq!(parent_ctx.backtrace.as_deref(), Some("Manual termination by console."));
    let child_ctx = manager.flow_context(&child).unwrap();
    assert_eq!(child_ctx.state, FlowState::Error);
    assert_eq!(child_ctx.backtrace.as_deref(), Some("Parent flow terminated."));

    let logs: Vec<String> = manager.flow_logs(&sid).unwrap().into_iter().map(|l| l.message).collect();
    assert!(logs.contains(&"Terminated by user alice. Reason: Manual termination by console.".to_string()));
    assert!(qm.query(&client_id().queue(), 10, None).unwrap().is_empty());

    let terminations: Vec<_> = events.events_on(AUDIT_CHANNEL)
                                     .into_iter()
                                     .filter(|e| matches!(e, Event::Audit(a) if a.action == AuditAction::TerminateFlow))
                                     .collect();
    assert_eq!(terminations.len(), 2);

    // Worker leftovers for the dead parent are cleaned up without reviving it.
    Worker::new(Arc::clone(&services)).run_once().unwrap();
    assert_eq!(manager.flow_context(&sid).unwrap().state, FlowState::Error);
    assert!(manager.get_flow_requests(&sid).unwrap().is_empty());
}

#[test]
fn both_children_stop_with_their_parent() {
    let (_clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(StartFlowRequest::new("TwinParent").client_id(client_id()).token(token())).unwrap();
    let children = manager.flow_context(&sid).unwrap().children;
    assert_eq!(children.len(), 2);

    manager.terminate_flow(&sid, Some("enough"), None, Some(&token()), false).unwrap();
    for child in &children {
        assert_eq!(manager.flow_context(child).unwrap().state, FlowState::Error);
    }

    // Nothing is left for the client to pick up.
    let mut client = mock_client(&services, ProcessLister::new(1));
    assert!(!client.next().unwrap());
    Worker::new(Arc::clone(&services)).run_once().unwrap();
    for child in &children {
        assert_eq!(manager.flow_context(child).unwrap().state, FlowState::Error);
    }
}

#[test]
fn terminating_a_finished_flow_is_a_noop() {
    let (_clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(StartFlowRequest::new("InlineFlow").token(token())).unwrap();
    manager.terminate_flow(&sid, Some("late"), None, Some(&token()), false).unwrap();
    let ctx = manager.flow_context(&sid).unwrap();
    assert_eq!(ctx.state, FlowState::Terminated);
    assert_eq!(ctx.backtrace, None);
}

#[test]
fn termination_requires_a_token() {
    let (_clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(StartFlowRequest::new("ListProcesses").client_id(client_id()).token(token())).unwrap();
    let err = manager.terminate_flow(&sid, None, None, None, false).unwrap_err();
    assert!(matches!(err, FlowError::Unauthorized(_)));
    assert_eq!(manager.flow_context(&sid).unwrap().state, FlowState::Running);
}

#[test]
fn forced_termination_skips_the_lease() {
    let (_clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(StartFlowRequest::new("ListProcesses").client_id(client_id()).token(token())).unwrap();

    let held = manager.open_with_lock(&sid, false, &token()).unwrap();
    let err = manager.terminate_flow(&sid, Some("stop"), None, Some(&token()), false).unwrap_err();
    assert!(is_lock_contention(&err));

    manager.terminate_flow(&sid, Some("stop"), None, Some(&token()), true).unwrap();
    drop(held);
    let ctx = manager.flow_context(&sid).unwrap();
    assert_eq!(ctx.state, FlowState::Error);
    assert_eq!(ctx.backtrace.as_deref(), Some("stop"));
}

#[test]
fn marked_flow_stops_on_its_next_turn() {
    let (clock, services) = setup();
    let manager = FlowManager::new(Arc::clone(&services));
    let sid = manager.start_flow(StartFlowRequest::new("ListProcesses").client_id(client_id()).token(token())).unwrap();
    manager.mark_for_termination(&sid, "x").unwrap();
    assert_eq!(manager.flow_context(&sid).unwrap().state, FlowState::Running);

    let mut clients = [mock_client(&services, ProcessLister::new(2))];
    assert!(run_flow_helper(&services, &clock, &mut clients, &sid).is_err());

    let ctx = manager.flow_context(&sid).unwrap();
    assert_eq!(ctx.state, FlowState::Error);
    assert_eq!(ctx.backtrace.as_deref(), Some("x"));
    let logs: Vec<String> = manager.flow_logs(&sid).unwrap().into_iter().map(|l| l.message).collect();
    assert!(logs.contains(&"Pending termination: x".to_string()));
    assert!(manager.flow_results(&sid).unwrap().is_empty());
}

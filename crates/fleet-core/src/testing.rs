//! Utilidades para ejercitar flows de punta a punta sin agentes reales.
//!
//! `MockClient` consume la cola de tasks de un cliente y responde con lo que
//! devuelva su `ClientMock`; `run_flow_helper` alterna clientes y worker
//! sobre un `ManualClock` hasta que el flow termina.

use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;

use crate::clock::ManualClock;
use crate::constants::WELL_KNOWN_REQUEST_ID;
use crate::errors::FlowError;
use crate::flow::FlowManager;
use crate::model::{AuthState, ClientId, CpuSeconds, FlowState, Message, Notification, SessionId, Status, StatusCode};
use crate::queue::QueueManager;
use crate::services::{Services, ServicesBuilder};
use crate::store::InMemoryDataStore;
use crate::worker::Worker;

const MOCK_CLIENT_USER: &str = "MockClient";
const MAX_ROUNDS: usize = 1000;

#[derive(Debug, Clone, PartialEq)]
pub struct TypedPayload {
    pub args_type: String,
    pub payload: Value,
}

impl TypedPayload {
    pub fn new(args_type: &str, payload: Value) -> Self {
        Self { args_type: args_type.to_string(), payload }
    }
}

/// Comportamiento simulado de un cliente ante cada task.
pub trait ClientMock: Send {
    /// `Err` produce un status `GenericError` con ese mensaje.
    fn execute(&mut self, task: &Message) -> Result<Vec<TypedPayload>, String>;

    /// CPU y bytes de red que se reportan en el status.
    fn resource_usage(&self, _task: &Message) -> (CpuSeconds, u64) {
        (CpuSeconds::default(), 0)
    }
}

pub struct MockClient {
    client_id: ClientId,
    services: Arc<Services>,
    mock: Box<dyn ClientMock>,
}

impl MockClient {
    pub fn new(client_id: ClientId, services: Arc<Services>, mock: Box<dyn ClientMock>) -> Self {
        Self { client_id, services, mock }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Atiende un task. `Ok(false)` si la cola estaba vacía.
    pub fn next(&mut self) -> Result<bool, FlowError> {
        let mut qm = QueueManager::new(Arc::clone(&self.services), MOCK_CLIENT_USER);
        let Some(task) = qm.query_and_own(&self.client_id.queue(), Duration::seconds(10_000), 1)?
                           .into_iter()
                           .next()
        else {
            return Ok(false);
        };

        let (payloads, status) = match self.mock.execute(&task) {
            Ok(payloads) => (payloads, Status::ok()),
            Err(msg) => (Vec::new(), Status::error(StatusCode::GenericError, msg)),
        };
        let (cpu, network) = self.mock.resource_usage(&task);
        let status = status.with_usage(cpu, network);

        let count = payloads.len() as u64;
        for (i, p) in payloads.into_iter().enumerate() {
            let msg = Message::response(task.session_id.clone(), task.request_id, i as u64 + 1, p.payload)
                .with_args_type(p.args_type);
            qm.queue_response(msg, None);
        }
        qm.queue_response(Message::status(task.session_id.clone(), task.request_id, count + 1, &status)?, None);
        let notification =
            Notification::new(task.session_id.clone()).with_priority(task.priority).with_last_status(task.request_id);
        qm.queue_notification(notification, None);
        qm.flush()?;
        Ok(true)
    }
}

/// Deja un mensaje para un well-known flow y lo notifica.
pub fn send_to_well_known(services: &Arc<Services>,
                          session_id: &SessionId,
                          payload: Value,
                          auth_state: AuthState)
                          -> Result<u64, FlowError> {
    let mut qm = QueueManager::new(Arc::clone(services), MOCK_CLIENT_USER);
    let mut msg = Message::new(session_id.clone()).with_auth_state(auth_state);
    msg.request_id = WELL_KNOWN_REQUEST_ID;
    msg.task_id = services.next_task_id();
    msg.payload = payload;
    let task_id = msg.task_id;
    qm.queue_response(msg, None);
    qm.queue_notification(Notification::new(session_id.clone()), None);
    qm.flush()?;
    Ok(task_id)
}

/// Alterna clientes y worker, avanzando el reloj un segundo por ronda,
/// hasta que el flow termina y no queda trabajo.
pub fn run_flow_helper(services: &Arc<Services>,
                       clock: &ManualClock,
                       clients: &mut [MockClient],
                       session_id: &SessionId)
                       -> Result<(), FlowError> {
    let mut worker = Worker::new(Arc::clone(services));
    let manager = FlowManager::new(Arc::clone(services));
    for _ in 0..MAX_ROUNDS {
        let mut work = 0;
        for client in clients.iter_mut() {
            while client.next()? {
                work += 1;
            }
        }
        work += worker.run_once()?;
        clock.advance(Duration::seconds(1));
        if work == 0 && manager.flow_context(session_id)?.state.is_final() {
            break;
        }
    }
    check_flow_errors(services, session_id)
}

/// Falla si el flow o alguno de sus hijos no terminó limpiamente.
pub fn check_flow_errors(services: &Arc<Services>, session_id: &SessionId) -> Result<(), FlowError> {
    let manager = FlowManager::new(Arc::clone(services));
    let context = manager.flow_context(session_id)?;
    if context.state != FlowState::Terminated {
        let reason = context.backtrace.unwrap_or_else(|| format!("flow ended in state {:?}", context.state));
        return Err(FlowError::FlowFailed { session: session_id.to_string(), reason });
    }
    for child in &context.children {
        check_flow_errors(services, child)?;
    }
    Ok(())
}

/// Builder de `Services` sobre un store en memoria con reloj manual.
pub fn test_services(clock: Arc<ManualClock>) -> ServicesBuilder {
    Services::builder(Arc::new(InMemoryDataStore::new(clock.clone()))).clock(clock)
}

//! Flows de demostración usados por el binario y los tests de punta a punta.
//!
//! `Echo` le pide a un cliente que repita una lista de palabras y reenvía
//! cada respuesta como resultado; `EchoAgent` es el agente simulado que
//! contesta esas peticiones.

use std::sync::Arc;

use chrono::Utc;
use fleet_core::model::{FlowStateDict, Message};
use fleet_core::registry::{ActionDescriptor, FlowDescriptor};
use fleet_core::testing::{run_flow_helper, ClientMock, MockClient, TypedPayload};
use fleet_core::{AccessToken, ClientId, Flow, FlowError, FlowManager, FlowRunner, FlowState, InMemoryDataStore,
                 ManualClock, Responses, Services, ServicesBuilder, SessionId, SharedDataStore, StartFlowRequest};
use log::info;
use serde::Serialize;
use serde_json::{json, Value};

use crate::config::AppConfig;
use crate::errors::AppError;

pub const DEMO_CLIENT: &str = "C.00000000000000e0";
pub const ECHO_ACTION: &str = "Echo";

#[derive(Default)]
pub struct Echo {
    echoed: u64,
}

impl Flow for Echo {
    fn initialize(&mut self, _args: &Value, state: &FlowStateDict) -> Result<(), FlowError> {
        self.echoed = state.get_or("echoed", 0)?;
        Ok(())
    }

    fn states(&self) -> &'static [&'static str] {
        &["Start", "Echoed", "End"]
    }

    fn validate_args(&self, args: &Value) -> Result<(), FlowError> {
        match args.get("words") {
            Some(Value::Array(_)) | None => Ok(()),
            Some(_) => Err(FlowError::InvalidArgs("words must be a list".into())),
        }
    }

    fn handle_state(&mut self, state: &str, runner: &mut FlowRunner, responses: &Responses) -> Result<(), FlowError> {
        match state {
            "Start" => {
                let words = runner.args().get("words").cloned().unwrap_or_else(|| json!([]));
                runner.call_client(ECHO_ACTION, json!({ "words": words }), "EchoArgs", "Echoed")?;
            }
            "Echoed" => {
                if !responses.success() {
                    let msg = responses.status().and_then(|s| s.error_message.clone()).unwrap_or_default();
                    return Err(FlowError::handler(format!("echo failed: {msg}")));
                }
                for payload in responses.payloads() {
                    runner.send_reply(payload.clone())?;
                    self.echoed += 1;
                }
            }
            "End" => runner.log(format!("echoed {} words", self.echoed)),
            _ => {}
        }
        Ok(())
    }

    fn serialize(&self, state: &mut FlowStateDict) -> Result<(), FlowError> {
        state.set("echoed", self.echoed)
    }
}

/// Agente simulado: devuelve cada palabra pedida como un `EchoReply`.
pub struct EchoAgent;

impl ClientMock for EchoAgent {
    fn execute(&mut self, task: &Message) -> Result<Vec<TypedPayload>, String> {
        let words = task.payload.get("words").and_then(Value::as_array).cloned().unwrap_or_default();
        Ok(words.into_iter().map(|w| TypedPayload::new("EchoReply", json!({ "word": w }))).collect())
    }
}

/// Registra `Echo` y su acción.
pub fn register_demo(builder: ServicesBuilder) -> ServicesBuilder {
    builder.register_action(ECHO_ACTION, ActionDescriptor::new(Some("EchoArgs"), &["EchoReply"]))
           .register_flow(FlowDescriptor::ordinary("Echo", || Box::new(Echo::default())).with_args(&["words"]))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DemoReport {
    pub session_id: SessionId,
    pub state: FlowState,
    pub results: Vec<Value>,
    pub logs: Vec<String>,
}

/// Corre `Echo` de punta a punta sobre `store` con un agente simulado.
pub fn run_echo(store: SharedDataStore,
                clock: Arc<ManualClock>,
                config: &AppConfig,
                words: &[&str])
                -> Result<DemoReport, AppError> {
    let services = register_demo(Services::builder(store).clock(clock.clone())
                                                         .queue_config(config.queue.clone())
                                                         .worker_config(config.worker.clone())).build();
    let client_id = ClientId::parse(DEMO_CLIENT).map_err(FlowError::from)?;
    let manager = FlowManager::new(Arc::clone(&services));
    let request = StartFlowRequest::new("Echo").client_id(client_id.clone())
                                               .args(json!({ "words": words }))
                                               .token(AccessToken::new("demo").with_reason("demo run"));
    let session_id = manager.start_flow(request)?;
    info!("started {session_id}");

    let mut clients = [MockClient::new(client_id, Arc::clone(&services), Box::new(EchoAgent))];
    run_flow_helper(&services, &clock, &mut clients, &session_id)?;

    let state = manager.flow_context(&session_id)?.state;
    let results = manager.flow_results(&session_id)?;
    let logs = manager.flow_logs(&session_id)?.into_iter().map(|l| l.message).collect();
    Ok(DemoReport { session_id, state, results, logs })
}

/// `Echo` sobre el store en memoria.
pub fn run_in_memory(config: &AppConfig, words: &[&str]) -> Result<DemoReport, AppError> {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let store: SharedDataStore = Arc::new(InMemoryDataStore::new(clock.clone()));
    run_echo(store, clock, config, words)
}

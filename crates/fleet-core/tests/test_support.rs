#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Duration;
use fleet_core::model::{CpuSeconds, FlowStateDict, Message, RequestData};
use fleet_core::registry::{ActionDescriptor, FlowDescriptor};
use fleet_core::testing::{test_services, ClientMock, MockClient, TypedPayload};
use fleet_core::{AccessToken, ClientId, Flow, FlowError, FlowRunner, ManualClock, Responses, Services,
                 ServicesBuilder, WellKnownFlow};
use serde_json::{json, Value};

pub const CLIENT: &str = "C.1000000000000000";

pub fn client_id() -> ClientId {
    ClientId::parse(CLIENT).unwrap()
}

pub fn token() -> AccessToken {
    AccessToken::new("alice").with_reason("testing")
}

/// Lista procesos del cliente y reenvía cada uno como resultado.
#[derive(Default)]
pub struct ListProcesses {
    count: u64,
}

impl Flow for ListProcesses {
    fn initialize(&mut self, _args: &Value, state: &FlowStateDict) -> Result<(), FlowError> {
        self.count = state.get_or("count", 0)?;
        Ok(())
    }

    fn states(&self) -> &'static [&'static str] {
        &["Start", "Process", "End"]
    }

    fn handle_state(&mut self, state: &str, runner: &mut FlowRunner, responses: &Responses) -> Result<(), FlowError> {
        match state {
            "Start" => {
                runner.call_client("ListProcesses", json!({"filter": ""}), "ListProcessesArgs", "Process")?;
            }
            "Process" => {
                if !responses.success() {
                    let msg = responses.status().and_then(|s| s.error_message.clone()).unwrap_or_default();
                    return Err(FlowError::handler(format!("client failed: {msg}")));
                }
                for payload in responses.payloads() {
                    runner.send_reply(payload.clone())?;
                    self.count += 1;
                }
                runner.log(format!("got {} processes", responses.len()));
            }
            "End" => runner.log("done"),
            _ => {}
        }
        Ok(())
    }

    fn serialize(&self, state: &mut FlowStateDict) -> Result<(), FlowError> {
        state.set("count", self.count)
    }
}

/// Lanza `ListProcesses` como hijo y cuenta lo que devuelve.
#[derive(Default)]
pub struct ParentFlow;

impl Flow for ParentFlow {
    fn states(&self) -> &'static [&'static str] {
        &["Start", "ChildDone"]
    }

    fn handle_state(&mut self, state: &str, runner: &mut FlowRunner, responses: &Responses) -> Result<(), FlowError> {
        match state {
            "Start" => {
                runner.call_flow("ListProcesses", "ChildDone", json!({}), RequestData::new())?;
            }
            "ChildDone" => {
                runner.state_mut().set("child_results", responses.len())?;
                runner.state_mut().set("child_ok", responses.success())?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Lanza dos `ListProcesses` en paralelo.
#[derive(Default)]
pub struct TwinParent;

impl Flow for TwinParent {
    fn states(&self) -> &'static [&'static str] {
        &["Start", "ChildDone"]
    }

    fn handle_state(&mut self, state: &str, runner: &mut FlowRunner, _responses: &Responses) -> Result<(), FlowError> {
        if state == "Start" {
            for _ in 0..2 {
                runner.call_flow("ListProcesses", "ChildDone", json!({}), RequestData::new())?;
            }
        }
        Ok(())
    }
}

/// Se llama a sí mismo en el mismo turno.
#[derive(Default)]
pub struct InlineFlow;

impl Flow for InlineFlow {
    fn states(&self) -> &'static [&'static str] {
        &["Start", "Next"]
    }

    fn handle_state(&mut self, state: &str, runner: &mut FlowRunner, responses: &Responses) -> Result<(), FlowError> {
        match state {
            "Start" => runner.call_state("Next", vec![json!("a"), json!("b")], RequestData::new(), None),
            "Next" => {
                for p in responses.payloads() {
                    runner.send_reply(p.clone())?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Se programa a sí mismo cinco segundos en el futuro.
#[derive(Default)]
pub struct DelayedFlow;

impl Flow for DelayedFlow {
    fn states(&self) -> &'static [&'static str] {
        &["Start", "Later"]
    }

    fn handle_state(&mut self, state: &str, runner: &mut FlowRunner, responses: &Responses) -> Result<(), FlowError> {
        match state {
            "Start" => {
                let at = runner.services().now() + Duration::seconds(5);
                let mut data = RequestData::new();
                data.insert("tag".into(), json!("delayed"));
                runner.call_state("Later", vec![json!(42)], data, Some(at))
            }
            "Later" => {
                runner.state_mut().set("payload", responses.first().map(|m| m.payload.clone()))?;
                runner.state_mut().set("tag", responses.request_data().get("tag").cloned())?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Responde con `n` procesos y reporta consumo fijo.
pub struct ProcessLister {
    pub n: usize,
    pub cpu: CpuSeconds,
    pub network: u64,
    pub fail: Option<String>,
}

impl ProcessLister {
    pub fn new(n: usize) -> Self {
        Self { n, cpu: CpuSeconds::default(), network: 0, fail: None }
    }

    pub fn with_usage(mut self, cpu: CpuSeconds, network: u64) -> Self {
        self.cpu = cpu;
        self.network = network;
        self
    }

    pub fn failing(mut self, msg: &str) -> Self {
        self.fail = Some(msg.to_string());
        self
    }
}

impl ClientMock for ProcessLister {
    fn execute(&mut self, _task: &Message) -> Result<Vec<TypedPayload>, String> {
        if let Some(msg) = &self.fail {
            return Err(msg.clone());
        }
        Ok((0..self.n).map(|i| TypedPayload::new("Process", json!({"pid": i + 1}))).collect())
    }

    fn resource_usage(&self, _task: &Message) -> (CpuSeconds, u64) {
        (self.cpu, self.network)
    }
}

/// Well-known flow que sólo cuenta mensajes.
#[derive(Default)]
pub struct CountingWellKnown {
    pub seen: AtomicUsize,
    pub allow_unauthenticated: bool,
    pub fail: bool,
}

impl WellKnownFlow for CountingWellKnown {
    fn allow_unauthenticated(&self) -> bool {
        self.allow_unauthenticated
    }

    fn process_message(&self, _message: &Message, _services: &Services) -> Result<(), FlowError> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(FlowError::handler("well-known failure"));
        }
        Ok(())
    }
}

/// Registra los flows y acciones de prueba.
pub fn register_all(builder: ServicesBuilder) -> ServicesBuilder {
    builder.register_action("ListProcesses", ActionDescriptor::new(Some("ListProcessesArgs"), &["Process"]))
           .register_flow(FlowDescriptor::ordinary("ListProcesses", || Box::new(ListProcesses::default())))
           .register_flow(FlowDescriptor::ordinary("ParentFlow", || Box::new(ParentFlow)))
           .register_flow(FlowDescriptor::ordinary("TwinParent", || Box::new(TwinParent)))
           .register_flow(FlowDescriptor::global("InlineFlow", || Box::new(InlineFlow)))
           .register_flow(FlowDescriptor::global("DelayedFlow", || Box::new(DelayedFlow)).with_args(&["when"]))
}

/// Builder en memoria con todos los flows y acciones de prueba.
pub fn builder(clock: &Arc<ManualClock>) -> ServicesBuilder {
    register_all(test_services(Arc::clone(clock)))
}

pub fn setup() -> (Arc<ManualClock>, Arc<Services>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let clock = Arc::new(ManualClock::at_epoch());
    let services = builder(&clock).build();
    (clock, services)
}

pub fn mock_client(services: &Arc<Services>, mock: ProcessLister) -> MockClient {
    MockClient::new(client_id(), Arc::clone(services), Box::new(mock))
}

//! Processor protocol over TCP
//!
//! A scheduling service on a loopback port, a processor agent connected to
//! it through `SchedulingClient`, and commands dispatched by the remote
//! scheduler.

use async_trait::async_trait;
use serde_json::Value;
use stagehand::context::Context;
use stagehand::errors::{Result, StagehandError, ToolError};
use stagehand::scheduling::agent::{CommandHandler, ProcessorAgent, UpdateSink};
use stagehand::scheduling::remote::RemoteScheduler;
use stagehand::scheduling::transport::{SchedulingClient, ServerHandle};
use stagehand::scheduling::{
    ClientPool, CommandRequest, ExecutionContext, Processor, ProcessorQuery, ProcessorStatus,
    SchedulerSet, SchedulingService,
};
use stagehand::tools::{Action, ActionChild, Command, Socket, ToolStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Doubles the `frames` input; `hang` never finishes on its own.
struct FrameHandler;

#[async_trait]
impl CommandHandler for FrameHandler {
    async fn discover(&self) -> Vec<String> {
        vec!["double".to_string(), "hang".to_string()]
    }

    async fn run(
        &self,
        request: CommandRequest,
        updates: UpdateSink,
    ) -> Result<BTreeMap<String, Value>> {
        if request.name == "hang" {
            tokio::time::sleep(Duration::from_secs(60)).await;
            return Err(ToolError::Cancelled { name: request.name }.into());
        }
        let frames = request
            .inputs
            .get("frames")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        updates.log(format!("doubling {frames}"));
        Ok(BTreeMap::from([(
            "frames".to_string(),
            serde_json::json!(frames * 2),
        )]))
    }
}

struct Harness {
    service: SchedulingService,
    server: ServerHandle,
    shutdown_tx: watch::Sender<bool>,
    agent: tokio::task::JoinHandle<Result<()>>,
}

impl Harness {
    async fn start() -> Self {
        let service = SchedulingService::default();
        let server = ServerHandle::bind(service.clone(), "127.0.0.1:0")
            .await
            .unwrap();
        let client = SchedulingClient::new(server.address().to_string(), Duration::from_secs(5));

        let mut processor = Processor::new("nuke");
        processor.id = "nuke-1".to_string();
        let mut agent = ProcessorAgent::start(
            Arc::new(client),
            Arc::new(FrameHandler),
            processor,
            "127.0.0.1:0",
        )
        .await;
        assert!(agent.is_connected());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let agent = tokio::spawn(async move { agent.serve(shutdown_rx).await });
        Self {
            service,
            server,
            shutdown_tx,
            agent,
        }
    }

    fn exec(&self) -> ExecutionContext {
        let scheduler = RemoteScheduler::new(self.service.clone(), ClientPool::new())
            .with_registration_timeout(Duration::from_millis(500));
        ExecutionContext::new(
            Context::default(),
            SchedulerSet::new("remote").with(Arc::new(scheduler)),
            4,
        )
    }

    async fn stop(self) {
        self.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.agent)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        self.server.stop().await;
    }
}

fn remote_command(name: &str) -> Command {
    let mut command = Command::new(name);
    command.scheduler.processor = Some(ProcessorQuery::by_name("nuke"));
    command
}

async fn wait_for_status(service: &SchedulingService, id: &str, status: ProcessorStatus) {
    for _ in 0..100 {
        if let Some(entry) = service.processors().get(id).await {
            if entry.processor.status == status {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("processor {id} never reached {status}");
}

#[tokio::test]
async fn test_processor_registers_as_idle_with_commands() {
    let harness = Harness::start().await;
    let entry = harness.service.processors().get("nuke-1").await.unwrap();
    assert_eq!(entry.processor.status, ProcessorStatus::Idle);
    assert_eq!(entry.processor.metadata["commands"], "double,hang");
    harness.stop().await;
}

#[tokio::test]
async fn test_action_runs_on_remote_processor() {
    let harness = Harness::start().await;
    let exec = harness.exec();

    let mut first = remote_command("double");
    first
        .base
        .inputs
        .insert("frames".to_string(), Socket::new(serde_json::json!(12)));
    let mut second = remote_command("double").with_upstream("first");
    second
        .base
        .inputs
        .insert("frames".to_string(), Socket::new(serde_json::json!(5)));
    let action = Action::new("comp")
        .with_child("first", ActionChild::Command(first))
        .with_child("second", ActionChild::Command(second));

    tokio::time::timeout(Duration::from_secs(10), action.execute(&exec))
        .await
        .unwrap()
        .unwrap();

    let outputs: Vec<Value> = action
        .commands()
        .iter()
        .map(|c| c.base.outputs()["frames"].value.clone())
        .collect();
    assert_eq!(outputs, vec![serde_json::json!(24), serde_json::json!(10)]);
    assert_eq!(action.commands()[0].base.logs(), vec!["doubling 12"]);
    assert_eq!(action.base.status(), ToolStatus::Completed);

    wait_for_status(&harness.service, "nuke-1", ProcessorStatus::Idle).await;
    harness.stop().await;
}

#[tokio::test]
async fn test_cancel_reaches_remote_processor() {
    let harness = Harness::start().await;
    let exec = harness.exec();
    let command = remote_command("hang");

    let run = command.execute(&exec);
    let cancel = async {
        wait_for_status(&harness.service, "nuke-1", ProcessorStatus::Processing).await;
        command.cancel(&exec).await.unwrap();
    };
    let (outcome, ()) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(run, cancel)
    })
    .await
    .unwrap();

    assert!(outcome.unwrap_err().is_cancelled());
    assert_eq!(command.base.status(), ToolStatus::Cancelled);
    harness.stop().await;
}

#[tokio::test]
async fn test_shutdown_is_reported_to_core() {
    let harness = Harness::start().await;
    let service = harness.service.clone();
    harness.stop().await;

    let entry = service.processors().get("nuke-1").await.unwrap();
    assert_eq!(entry.processor.status, ProcessorStatus::ShutDown);
}

#[tokio::test]
async fn test_unknown_processor_query_fails_without_program() {
    let harness = Harness::start().await;
    let exec = harness.exec();
    let mut command = Command::new("double");
    command.scheduler.processor = Some(ProcessorQuery::by_name("houdini"));

    let err = command.execute(&exec).await.unwrap_err();
    assert!(matches!(err, StagehandError::Scheduling(_)));
    harness.stop().await;
}

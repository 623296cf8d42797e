//! Processor side of the scheduling protocol.
//!
//! A [`ProcessorAgent`] registers with the core in two phases, first as
//! `Starting` so the core learns its address, then as `Idle` once its
//! commands are discovered. It then pulls command requests, runs each on its
//! own task through a [`CommandHandler`] and streams the results back.
//! Registration failures leave the agent in a disconnected mode where it
//! keeps running without receiving work.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::processor::{Processor, ProcessorRegistration};
use super::protocol::{CommandRequest, CommandStatus, CommandUpdate};
use super::remote::PROCESSOR_ID_VAR;
use super::service::{receiver_stream, CommandScheduling};
use super::status::ProcessorStatus;
use crate::errors::Result;
use crate::observability::sanitize_for_log;

/// Metadata key listing the commands a processor discovered.
pub const COMMANDS_METADATA_KEY: &str = "commands";

/// Runs the commands a processor receives.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Names of the commands this processor can run.
    async fn discover(&self) -> Vec<String> {
        Vec::new()
    }

    /// Run one command to completion and return its outputs. Returning a
    /// cancellation error reports the command as cancelled.
    async fn run(
        &self,
        request: CommandRequest,
        updates: UpdateSink,
    ) -> Result<BTreeMap<String, Value>>;
}

/// Lets a running command report progress and logs.
#[derive(Clone)]
pub struct UpdateSink {
    request: CommandRequest,
    tx: mpsc::UnboundedSender<CommandUpdate>,
}

impl UpdateSink {
    pub fn progress(&self, fraction: f32) {
        let mut update = CommandUpdate::new(&self.request, CommandStatus::Running);
        update.progress = Some(fraction.clamp(0.0, 1.0));
        let _ = self.tx.send(update);
    }

    pub fn log(&self, line: impl Into<String>) {
        let mut update = CommandUpdate::new(&self.request, CommandStatus::Running);
        update.logs.push(line.into());
        let _ = self.tx.send(update);
    }
}

pub struct ProcessorAgent {
    scheduling: Arc<dyn CommandScheduling>,
    handler: Arc<dyn CommandHandler>,
    processor: Processor,
    host: String,
    connected: bool,
}

impl ProcessorAgent {
    /// Register with the core and discover commands. Never fails: when the
    /// core can't be reached the agent comes up disconnected.
    pub async fn start(
        scheduling: Arc<dyn CommandScheduling>,
        handler: Arc<dyn CommandHandler>,
        mut processor: Processor,
        host: impl Into<String>,
    ) -> Self {
        if processor.id.is_empty() {
            if let Ok(id) = std::env::var(PROCESSOR_ID_VAR) {
                processor.id = id;
            }
        }
        let mut agent = Self {
            scheduling,
            handler,
            processor,
            host: host.into(),
            connected: false,
        };

        agent.connected = agent.register(ProcessorStatus::Starting).await;

        let commands = agent.handler.discover().await;
        debug!(count = commands.len(), "Discovered commands");
        agent
            .processor
            .metadata
            .insert(COMMANDS_METADATA_KEY.to_string(), commands.join(","));

        if agent.connected {
            agent.connected = agent.register(ProcessorStatus::Idle).await;
        } else {
            agent.processor.status = ProcessorStatus::Idle;
        }
        agent
    }

    async fn register(&mut self, status: ProcessorStatus) -> bool {
        let mut processor = self.processor.clone();
        processor.status = status;
        let registration = ProcessorRegistration {
            processor,
            host: self.host.clone(),
        };
        match self.scheduling.register_processor(registration).await {
            Ok(canonical) => {
                info!(id = canonical.id.as_str(), status = %canonical.status, "Registered with core");
                self.processor = canonical;
                true
            }
            Err(e) => {
                warn!(
                    name = %sanitize_for_log(&self.processor.name),
                    status = %status,
                    error = %e,
                    "Registration failed, running disconnected"
                );
                self.processor.status = status;
                false
            }
        }
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Run commands until `shutdown` signals true or the core closes the
    /// request stream, then report the shutdown to the core.
    pub async fn serve(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if !self.connected {
            warn!("Not connected to a core, no commands will be received");
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
            return Ok(());
        }

        let id = self.processor.id.clone();
        let mut requests = self.scheduling.get_command_requests(&id).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inbound = self
            .scheduling
            .get_and_send_command_updates(&id, receiver_stream(rx))
            .await?;

        let mut tasks: JoinSet<String> = JoinSet::new();
        let mut running: HashMap<String, AbortHandle> = HashMap::new();
        let mut inbound_open = true;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = requests.next() => match next {
                    Some(request) => {
                        info!(
                            command = %sanitize_for_log(&request.name),
                            id = request.id.as_str(),
                            execution = %request.execution,
                            "Command received"
                        );
                        let command_id = request.id.clone();
                        let handle = tasks.spawn(run_command(self.handler.clone(), request, tx.clone()));
                        running.insert(command_id, handle);
                    }
                    None => {
                        warn!("Request stream closed by the core");
                        break;
                    }
                },
                update = inbound.next(), if inbound_open => match update {
                    Some(update) if update.status == CommandStatus::CancelRequested => {
                        if let Some(handle) = running.remove(&update.id) {
                            handle.abort();
                            info!(id = update.id.as_str(), "Command cancelled");
                            let _ = tx.send(CommandUpdate {
                                id: update.id.clone(),
                                name: update.name.clone(),
                                status: CommandStatus::Cancelled,
                                ..Default::default()
                            });
                        }
                    }
                    Some(update) => {
                        debug!(id = %sanitize_for_log(&update.id), status = ?update.status, "Ignoring update");
                    }
                    None => inbound_open = false,
                },
                Some(finished) = tasks.join_next() => match finished {
                    Ok(command_id) => {
                        running.remove(&command_id);
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => error!(error = %e, "Command task panicked"),
                },
            }
        }

        self.shutdown(tasks).await;
        Ok(())
    }

    async fn shutdown(&mut self, mut tasks: JoinSet<String>) {
        if self.connected {
            self.register(ProcessorStatus::ShuttingDown).await;
        }
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
        if self.connected {
            self.register(ProcessorStatus::ShutDown).await;
        }
        info!(id = self.processor.id.as_str(), "Processor stopped");
    }
}

async fn run_command(
    handler: Arc<dyn CommandHandler>,
    request: CommandRequest,
    tx: mpsc::UnboundedSender<CommandUpdate>,
) -> String {
    let _ = tx.send(CommandUpdate::new(&request, CommandStatus::Running));
    let sink = UpdateSink {
        request: request.clone(),
        tx: tx.clone(),
    };
    let update = match handler.run(request.clone(), sink).await {
        Ok(outputs) => {
            let mut update = CommandUpdate::new(&request, CommandStatus::Completed);
            update.outputs = outputs;
            update
        }
        Err(e) if e.is_cancelled() => CommandUpdate::new(&request, CommandStatus::Cancelled),
        Err(e) => {
            warn!(command = %sanitize_for_log(&request.name), error = %e, "Command failed");
            CommandUpdate::new(&request, CommandStatus::Failed).with_message(e.to_string())
        }
    };
    let _ = tx.send(update);
    request.id
}

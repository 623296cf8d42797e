//! Subprocess-backed scheduler.
//!
//! Each command runs the launch template of a program from the context as a
//! one-shot process. The command id, name, execution kind and inputs reach
//! the process through the environment.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::client::{ClientPool, LaunchOptions, LocalClientQuery};
use super::protocol::{CommandStatus, ExecutionKind};
use super::Scheduler;
use crate::context::Context;
use crate::errors::{ClientError, Result, SchedulingError, StagehandError, ToolError};
use crate::tools::Command;

pub const COMMAND_ID_VAR: &str = "STAGEHAND_COMMAND_ID";
pub const COMMAND_NAME_VAR: &str = "STAGEHAND_COMMAND_NAME";
pub const COMMAND_EXECUTION_VAR: &str = "STAGEHAND_COMMAND_EXECUTION";
pub const COMMAND_INPUTS_VAR: &str = "STAGEHAND_COMMAND_INPUTS";

/// Output lines starting with this prefix carry a JSON object of outputs.
pub const OUTPUT_PREFIX: &str = "STAGEHAND_OUTPUT ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEntry {
    pub name: String,
    pub execution: ExecutionKind,
    pub status: CommandStatus,
    pub pid: Option<u32>,
}

/// Commands scheduled locally, keyed by command id. Scheduling a command
/// again under the same id overwrites its entry.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    entries: Arc<RwLock<HashMap<String, CommandEntry>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, id: &str, entry: CommandEntry) {
        self.entries.write().await.insert(id.to_string(), entry);
    }

    pub async fn get(&self, id: &str) -> Option<CommandEntry> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn update(&self, id: &str, apply: impl FnOnce(&mut CommandEntry)) {
        if let Some(entry) = self.entries.write().await.get_mut(id) {
            apply(entry);
        }
    }
}

pub struct LocalScheduler {
    name: String,
    registry: CommandRegistry,
    clients: ClientPool,
}

impl LocalScheduler {
    pub fn new(registry: CommandRegistry, clients: ClientPool) -> Self {
        Self {
            name: "local".to_string(),
            registry,
            clients,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    async fn cancel_requested(&self, id: &str) -> bool {
        self.registry
            .get(id)
            .await
            .is_some_and(|entry| entry.status == CommandStatus::CancelRequested)
    }

    /// Run a command whose registry entry is already recorded. Any error
    /// before the process exits leaves the entry `Failed`.
    async fn run_recorded(
        &self,
        command: &Command,
        execution: ExecutionKind,
        context: &Context,
    ) -> Result<()> {
        let id = command.base.id.as_str();
        if self.cancel_requested(id).await {
            self.registry
                .update(id, |entry| entry.status = CommandStatus::Cancelled)
                .await;
            return Err(ToolError::Cancelled {
                name: command.base.name.clone(),
            }
            .into());
        }

        let pid = match self.launch(command, execution, context).await {
            Ok(pid) => pid,
            Err(e) => {
                self.registry
                    .update(id, |entry| entry.status = CommandStatus::Failed)
                    .await;
                return Err(e);
            }
        };

        let mut cancelled = false;
        self.registry
            .update(id, |entry| {
                entry.pid = Some(pid);
                if entry.status == CommandStatus::CancelRequested {
                    cancelled = true;
                } else {
                    entry.status = CommandStatus::Running;
                }
            })
            .await;
        if cancelled {
            warn!(command = command.base.name.as_str(), pid = pid, "Cancelled while starting, killing");
            self.clients.kill(pid, false).await?;
        } else {
            info!(command = command.base.name.as_str(), pid = pid, "Command started locally");
        }

        let code = match self.clients.wait(pid).await {
            Ok(code) => code,
            Err(e) => {
                self.registry
                    .update(id, |entry| entry.status = CommandStatus::Failed)
                    .await;
                return Err(e.into());
            }
        };
        let logs = self
            .clients
            .remove(pid)
            .await
            .map(|client| client.logs)
            .unwrap_or_default();
        for line in logs {
            match line.strip_prefix(OUTPUT_PREFIX) {
                Some(payload) => match serde_json::from_str::<serde_json::Value>(payload) {
                    Ok(serde_json::Value::Object(outputs)) => {
                        for (key, value) in outputs {
                            command.base.set_output(key, value);
                        }
                    }
                    _ => warn!(command = command.base.name.as_str(), "Ignoring malformed output line"),
                },
                None => command.base.log(line),
            }
        }

        let status = match (self.cancel_requested(id).await, code) {
            (true, _) => CommandStatus::Cancelled,
            (false, Some(0)) => CommandStatus::Completed,
            _ => CommandStatus::Failed,
        };
        self.registry.update(id, |entry| entry.status = status).await;

        match status {
            CommandStatus::Completed => Ok(()),
            CommandStatus::Cancelled => Err(ToolError::Cancelled {
                name: command.base.name.clone(),
            }
            .into()),
            _ => Err(SchedulingError::CommandFailed {
                name: command.base.name.clone(),
                message: format!("process exited with code {}", code.unwrap_or(-1)),
            }
            .into()),
        }
    }

    /// Spawn the command's program and return its pid.
    async fn launch(
        &self,
        command: &Command,
        execution: ExecutionKind,
        context: &Context,
    ) -> Result<u32> {
        let id = command.base.id.clone();
        let query = Self::program_query(command);
        let program_name = query.program_name.clone().unwrap_or_default();
        let program = context
            .find_program(&program_name)
            .ok_or_else(|| ClientError::NoMatch {
                query: query.to_string(),
            })?
            .clone();

        let inputs = serde_json::to_string(&command.base.input_values())
            .map_err(|e| StagehandError::Other(e.into()))?;
        let mut variables = BTreeMap::new();
        variables.insert("command".to_string(), command.base.name.clone());
        variables.insert("id".to_string(), id.clone());
        variables.insert("execution".to_string(), execution.to_string());
        let options = LaunchOptions {
            as_client: false,
            metadata: query.client_metadata.clone(),
            extra_env: BTreeMap::from([
                (COMMAND_ID_VAR.to_string(), id),
                (COMMAND_NAME_VAR.to_string(), command.base.name.clone()),
                (COMMAND_EXECUTION_VAR.to_string(), execution.to_string()),
                (COMMAND_INPUTS_VAR.to_string(), inputs),
            ]),
            variables,
        };

        let client = self.clients.start(&program, context, options).await?;
        let pid = client.pid.ok_or_else(|| ClientError::Spawn {
            program: program.name.clone(),
            message: "no pid".to_string(),
        })?;
        Ok(pid)
    }

    fn program_query(command: &Command) -> LocalClientQuery {
        let mut query = command.scheduler.client.clone().unwrap_or_default();
        if query.program_name.is_none() {
            query.program_name = Some(command.base.name.clone());
        }
        query
    }
}

#[async_trait]
impl Scheduler for LocalScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn schedule_command(
        &self,
        command: &Command,
        execution: ExecutionKind,
        context: &Context,
    ) -> Result<()> {
        self.registry
            .record(
                &command.base.id,
                CommandEntry {
                    name: command.base.name.clone(),
                    execution,
                    status: CommandStatus::Pending,
                    pid: None,
                },
            )
            .await;
        self.run_recorded(command, execution, context).await
    }

    async fn cancel_command(&self, command: &Command) -> Result<()> {
        let id = &command.base.id;
        let mut known = false;
        let mut pid = None;
        // Check and flag under one lock so a pid recorded concurrently is seen.
        self.registry
            .update(id, |entry| {
                known = true;
                if !entry.status.is_terminal() {
                    entry.status = CommandStatus::CancelRequested;
                    pid = entry.pid;
                }
            })
            .await;
        if !known {
            return Err(SchedulingError::UnknownCommand { id: id.clone() }.into());
        }
        if let Some(pid) = pid {
            self.clients.kill(pid, false).await?;
        }
        Ok(())
    }
}

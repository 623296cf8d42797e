//! Leaf work unit handed to a scheduler.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::base::{ToolBase, ToolStatus};
use super::catalog::ToolCatalog;
use crate::errors::{Result, StagehandError, ToolError};
use crate::observability::telemetry::track_command_execution;
use crate::scheduling::{
    CommandRequest, ExecutionContext, ExecutionKind, LocalClientQuery, ProcessorQuery,
};

/// Which scheduler receives the command and where it should land.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerBinding {
    /// Scheduler name; the default scheduler when absent
    #[serde(default)]
    pub name: Option<String>,
    /// Remote processor selection
    #[serde(default)]
    pub processor: Option<ProcessorQuery>,
    /// Local program or client selection
    #[serde(default)]
    pub client: Option<LocalClientQuery>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    #[serde(flatten)]
    pub base: ToolBase,
    /// Sibling that must complete first when used inside an action
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default)]
    pub scheduler: SchedulerBinding,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            base: ToolBase::new(name),
            upstream: None,
            scheduler: SchedulerBinding::default(),
        }
    }

    pub fn with_upstream(mut self, upstream: impl Into<String>) -> Self {
        self.upstream = Some(upstream.into());
        self
    }

    pub fn with_scheduler(mut self, name: impl Into<String>) -> Self {
        self.scheduler.name = Some(name.into());
        self
    }

    /// Fresh instance of the catalog command called `name`.
    pub fn resolve(name: &str, catalog: &ToolCatalog) -> Result<Self> {
        let mut command = catalog
            .command(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound {
                name: name.to_string(),
            })?;
        command.base.id = uuid::Uuid::new_v4().to_string();
        command.base.set_status(ToolStatus::Initialized);
        Ok(command)
    }

    /// Payload sent to a processor.
    pub fn to_request(&self, execution: ExecutionKind) -> CommandRequest {
        CommandRequest {
            id: self.base.id.clone(),
            name: self.base.name.clone(),
            execution,
            inputs: self.base.input_values(),
            processor_id: None,
        }
    }

    /// Hand the command to its scheduler and wait for the outcome.
    pub async fn run(&self, execution: ExecutionKind, exec: &ExecutionContext) -> Result<()> {
        let scheduler = match exec.schedulers.for_command(self) {
            Ok(scheduler) => scheduler,
            Err(e) => {
                self.base.set_status(ToolStatus::Invalid);
                return Err(e);
            }
        };
        let _permit = exec
            .permits
            .acquire()
            .await
            .map_err(|e| StagehandError::Other(e.into()))?;

        self.base.set_status(ToolStatus::Running);
        debug!(
            command = self.base.name.as_str(),
            scheduler = scheduler.name(),
            execution = %execution,
            "Scheduling command"
        );
        let outcome = track_command_execution(&self.base.name, || {
            scheduler.schedule_command(self, execution, &exec.context)
        })
        .await;

        self.base.set_status(match &outcome {
            Ok(()) => ToolStatus::Completed,
            Err(e) if e.is_cancelled() => ToolStatus::Cancelled,
            Err(_) => ToolStatus::Error,
        });
        outcome
    }

    pub async fn execute(&self, exec: &ExecutionContext) -> Result<()> {
        self.run(ExecutionKind::Execute, exec).await
    }

    pub async fn undo(&self, exec: &ExecutionContext) -> Result<()> {
        self.run(ExecutionKind::Undo, exec).await
    }

    pub async fn test(&self, exec: &ExecutionContext) -> Result<()> {
        self.run(ExecutionKind::Test, exec).await
    }

    /// Ask the scheduler to stop the command. Commands not running are left
    /// alone.
    pub async fn cancel(&self, exec: &ExecutionContext) -> Result<()> {
        if self.base.status() != ToolStatus::Running {
            debug!(
                command = self.base.name.as_str(),
                status = ?self.base.status(),
                "Command not running, nothing to cancel"
            );
            return Ok(());
        }
        let scheduler = exec.schedulers.for_command(self)?;
        scheduler.cancel_command(self).await
    }
}

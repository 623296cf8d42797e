//! Scheduler that hands commands to registered processors.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use super::client::{ClientPool, LaunchOptions};
use super::processor::{Processor, ProcessorQuery};
use super::protocol::{CommandStatus, CommandUpdate, ExecutionKind};
use super::service::SchedulingService;
use super::Scheduler;
use crate::context::{Context, CoreAddress, CORE_HOST_VAR, CORE_PORT_VAR};
use crate::errors::{Result, SchedulingError, ToolError};
use crate::tools::Command;

/// Identity a started processor must register under.
pub const PROCESSOR_ID_VAR: &str = "STAGEHAND_PROCESSOR_ID";

pub struct RemoteScheduler {
    name: String,
    service: SchedulingService,
    clients: ClientPool,
    core: Option<CoreAddress>,
    registration_timeout: Duration,
}

impl RemoteScheduler {
    pub fn new(service: SchedulingService, clients: ClientPool) -> Self {
        Self {
            name: "remote".to_string(),
            service,
            clients,
            core: None,
            registration_timeout: Duration::from_secs(60),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Address handed to processors started on demand.
    pub fn with_core_address(mut self, core: CoreAddress) -> Self {
        self.core = Some(core);
        self
    }

    pub fn with_registration_timeout(mut self, timeout: Duration) -> Self {
        self.registration_timeout = timeout;
        self
    }

    /// A registered processor matching `query`, or one started from the
    /// context's programs.
    pub async fn processor_for(&self, query: &ProcessorQuery, context: &Context) -> Result<Processor> {
        if let Some(processor) = self.service.processors().find(query).await {
            return Ok(processor);
        }
        self.start_processor(query, context).await
    }

    async fn start_processor(&self, query: &ProcessorQuery, context: &Context) -> Result<Processor> {
        let no_processor = || SchedulingError::NoProcessor {
            query: query.to_string(),
        };
        let program = query
            .name
            .as_deref()
            .and_then(|name| context.find_program(name))
            .ok_or_else(no_processor)?
            .clone();

        let id = uuid::Uuid::new_v4().to_string();
        let registered = self.service.processors().expect_registration(&id).await;

        let mut extra_env = BTreeMap::from([(PROCESSOR_ID_VAR.to_string(), id.clone())]);
        if let Some(core) = self.core.as_ref().or(context.core.as_ref()) {
            extra_env.insert(CORE_HOST_VAR.to_string(), core.host.clone());
            extra_env.insert(CORE_PORT_VAR.to_string(), core.port.to_string());
        }
        let options = LaunchOptions {
            as_client: true,
            metadata: query.metadata.clone(),
            extra_env,
            variables: BTreeMap::from([("processor_id".to_string(), id.clone())]),
        };

        info!(program = program.name.as_str(), id = id.as_str(), "Starting processor");
        let client = match self.clients.start(&program, context, options).await {
            Ok(client) => client,
            Err(e) => {
                drop(registered);
                self.service.processors().prune_waiters(&id).await;
                return Err(e.into());
            }
        };

        match tokio::time::timeout(self.registration_timeout, registered).await {
            Ok(Ok(processor)) => Ok(processor),
            Ok(Err(_)) => Err(no_processor().into()),
            Err(_) => {
                warn!(id = id.as_str(), "Processor did not register in time, stopping it");
                self.service.processors().prune_waiters(&id).await;
                if let Some(pid) = client.pid {
                    let _ = self.clients.kill(pid, true).await;
                }
                Err(SchedulingError::RegistrationTimeout {
                    id,
                    seconds: self.registration_timeout.as_secs(),
                }
                .into())
            }
        }
    }
}

fn apply_update(command: &Command, update: &CommandUpdate) {
    for (key, value) in &update.outputs {
        command.base.set_output(key.clone(), value.clone());
    }
    for line in &update.logs {
        command.base.log(line.clone());
    }
}

#[async_trait]
impl Scheduler for RemoteScheduler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn schedule_command(
        &self,
        command: &Command,
        execution: ExecutionKind,
        context: &Context,
    ) -> Result<()> {
        let query = command.scheduler.processor.clone().unwrap_or_default();
        let processor = self.processor_for(&query, context).await?;

        let mut updates = self
            .service
            .submit(&processor.id, command.to_request(execution))
            .await?;

        while let Some(update) = updates.recv().await {
            apply_update(command, &update);
            match update.status {
                CommandStatus::Completed => return Ok(()),
                CommandStatus::Cancelled => {
                    return Err(ToolError::Cancelled {
                        name: command.base.name.clone(),
                    }
                    .into())
                }
                CommandStatus::Failed => {
                    return Err(SchedulingError::CommandFailed {
                        name: command.base.name.clone(),
                        message: update
                            .message
                            .unwrap_or_else(|| "no message".to_string()),
                    }
                    .into())
                }
                _ => {}
            }
        }

        Err(SchedulingError::StreamClosed {
            id: command.base.id.clone(),
        }
        .into())
    }

    async fn cancel_command(&self, command: &Command) -> Result<()> {
        self.service.request_cancel(&command.base.id).await
    }
}

//! Command scheduling
//!
//! A [`Scheduler`] receives the commands an action graph produces. The
//! [`local::LocalScheduler`] runs them as subprocesses; the
//! [`remote::RemoteScheduler`] hands them to registered processors through
//! the [`service::SchedulingService`], starting one from the context's
//! programs when none is running.

pub mod agent;
pub mod client;
pub mod local;
pub mod processor;
pub mod protocol;
pub mod remote;
pub mod service;
pub mod status;
pub mod transport;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::context::Context;
use crate::errors::{Result, ToolError};
use crate::tools::Command;

pub use client::{Client, ClientPool, LocalClientQuery, Program};
pub use processor::{Processor, ProcessorPool, ProcessorQuery, ProcessorRegistration};
pub use protocol::{CommandRequest, CommandStatus, CommandUpdate, ExecutionKind};
pub use service::{CommandScheduling, SchedulingService};
pub use status::{ClientStatus, ProcessorStatus};

/// Dispatch target for commands.
#[async_trait]
pub trait Scheduler: Send + Sync {
    fn name(&self) -> &str;

    /// Run `command` to completion. Outputs and logs are written back onto
    /// the command.
    async fn schedule_command(
        &self,
        command: &Command,
        execution: ExecutionKind,
        context: &Context,
    ) -> Result<()>;

    async fn cancel_command(&self, command: &Command) -> Result<()>;
}

/// Schedulers by name, with a fallback for unbound commands.
#[derive(Clone)]
pub struct SchedulerSet {
    schedulers: HashMap<String, Arc<dyn Scheduler>>,
    default: String,
}

impl SchedulerSet {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            schedulers: HashMap::new(),
            default: default.into(),
        }
    }

    pub fn register(&mut self, scheduler: Arc<dyn Scheduler>) {
        self.schedulers
            .insert(scheduler.name().to_string(), scheduler);
    }

    pub fn with(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.register(scheduler);
        self
    }

    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// The scheduler bound to `command`, or the default one.
    pub fn for_command(&self, command: &Command) -> Result<Arc<dyn Scheduler>> {
        let name = command
            .scheduler
            .name
            .as_deref()
            .unwrap_or(self.default.as_str());
        self.schedulers.get(name).cloned().ok_or_else(|| {
            ToolError::MissingScheduler {
                command: command.base.name.clone(),
                scheduler: name.to_string(),
            }
            .into()
        })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schedulers.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

/// What a graph traversal needs to run commands.
#[derive(Clone)]
pub struct ExecutionContext {
    pub context: Arc<Context>,
    pub schedulers: SchedulerSet,
    /// Bounds how many commands run at once
    pub permits: Arc<Semaphore>,
}

impl ExecutionContext {
    pub fn new(context: Context, schedulers: SchedulerSet, max_concurrency: usize) -> Self {
        Self {
            context: Arc::new(context),
            schedulers,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }
}

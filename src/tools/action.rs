//! Composite work unit and its dependency-ordered traversal.
//!
//! An action holds named children, each a command or another action. A
//! child may name one sibling as its `upstream`; it starts only once that
//! sibling has completed. Children whose dependencies are met run
//! concurrently.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use tracing::{debug, error, warn};

use super::base::{ToolBase, ToolStatus};
use super::catalog::ToolCatalog;
use super::command::Command;
use crate::errors::{Result, ToolError};
use crate::scheduling::{ExecutionContext, ExecutionKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionChild {
    Command(Command),
    Action(Action),
}

impl ActionChild {
    pub fn base(&self) -> &ToolBase {
        match self {
            ActionChild::Command(command) => &command.base,
            ActionChild::Action(action) => &action.base,
        }
    }

    pub fn upstream(&self) -> Option<&str> {
        match self {
            ActionChild::Command(command) => command.upstream.as_deref(),
            ActionChild::Action(action) => action.upstream.as_deref(),
        }
    }

    fn walk<'a>(&'a self, visitor: &'a dyn ToolVisitor) -> BoxFuture<'a, Result<()>> {
        match self {
            ActionChild::Command(command) => visitor.visit(ToolNode::Command(command)),
            ActionChild::Action(action) => action.walk(visitor),
        }
    }
}

/// A node handed to a [`ToolVisitor`].
#[derive(Debug, Clone, Copy)]
pub enum ToolNode<'a> {
    Action(&'a Action),
    Command(&'a Command),
}

impl ToolNode<'_> {
    pub fn base(&self) -> &ToolBase {
        match self {
            ToolNode::Action(action) => &action.base,
            ToolNode::Command(command) => &command.base,
        }
    }
}

/// Work applied to every node of a traversal. Called concurrently.
#[async_trait]
pub trait ToolVisitor: Send + Sync {
    async fn visit(&self, node: ToolNode<'_>) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    #[serde(flatten)]
    pub base: ToolBase,
    /// Catalog actions layered under this one, earliest first
    #[serde(default)]
    pub inherit: Vec<String>,
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default)]
    pub children: BTreeMap<String, ActionChild>,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            base: ToolBase::new(name),
            inherit: Vec::new(),
            upstream: None,
            children: BTreeMap::new(),
        }
    }

    pub fn with_child(mut self, key: impl Into<String>, child: ActionChild) -> Self {
        self.children.insert(key.into(), child);
        self
    }

    pub fn with_upstream(mut self, upstream: impl Into<String>) -> Self {
        self.upstream = Some(upstream.into());
        self
    }

    /// Fresh instance of the catalog action called `name`.
    pub fn resolve(name: &str, catalog: &ToolCatalog) -> Result<Self> {
        let mut action = catalog
            .action(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound {
                name: name.to_string(),
            })?;
        action.renew_ids();
        Ok(action)
    }

    /// Load an action definition file, layered over the catalog actions it
    /// inherits from. The file stem names the action when the file doesn't.
    pub fn load(path: &Path, catalog: &ToolCatalog) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| ToolError::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut value: serde_json::Value =
            serde_json::from_str(&raw).map_err(|e| ToolError::Load {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        if let Some(object) = value.as_object_mut() {
            if !object.contains_key("name") {
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                object.insert("name".to_string(), serde_json::Value::String(stem));
            }
        }

        let layered = catalog.layer_action(value)?;
        let action: Action = serde_json::from_value(layered).map_err(|e| ToolError::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        action.validate()?;
        Ok(action)
    }

    fn renew_ids(&mut self) {
        self.base.id = uuid::Uuid::new_v4().to_string();
        self.base.set_status(ToolStatus::Initialized);
        for child in self.children.values_mut() {
            match child {
                ActionChild::Command(command) => {
                    command.base.id = uuid::Uuid::new_v4().to_string();
                    command.base.set_status(ToolStatus::Initialized);
                }
                ActionChild::Action(action) => action.renew_ids(),
            }
        }
    }

    /// Check upstream edges of this action and every nested one: each must
    /// name another sibling, and following them must not loop.
    pub fn validate(&self) -> std::result::Result<(), ToolError> {
        let invalid = |reason: String| ToolError::InvalidGraph {
            action: self.base.name.clone(),
            reason,
        };

        for (key, child) in &self.children {
            if let Some(upstream) = child.upstream() {
                if upstream == key {
                    return Err(invalid(format!("child '{key}' depends on itself")));
                }
                if !self.children.contains_key(upstream) {
                    return Err(invalid(format!(
                        "child '{key}' depends on unknown sibling '{upstream}'"
                    )));
                }
            }
        }

        for key in self.children.keys() {
            let mut seen = HashSet::new();
            let mut current = key.as_str();
            while let Some(upstream) = self.children.get(current).and_then(|c| c.upstream()) {
                if !seen.insert(current) {
                    return Err(invalid(format!(
                        "upstream dependencies of '{key}' form a cycle"
                    )));
                }
                current = upstream;
            }
        }

        for child in self.children.values() {
            if let ActionChild::Action(action) = child {
                action.validate()?;
            }
        }
        Ok(())
    }

    /// Apply `visitor` to this action, then to every descendant in
    /// dependency order.
    ///
    /// A child that fails still counts as completed so its dependents run;
    /// failures are collected into [`ToolError::ChildrenFailed`]. A cancelled
    /// child is never completed, so its dependents never start.
    pub async fn traverse(&self, visitor: &dyn ToolVisitor) -> Result<()> {
        self.validate()?;
        self.walk(visitor).await
    }

    fn walk<'a>(&'a self, visitor: &'a dyn ToolVisitor) -> BoxFuture<'a, Result<()>> {
        async move {
            visitor.visit(ToolNode::Action(self)).await?;

            let mut pending: Vec<&str> = self.children.keys().map(String::as_str).collect();
            let mut completed: HashSet<&str> = HashSet::new();
            let mut running = FuturesUnordered::new();
            let mut failures: Vec<String> = Vec::new();

            loop {
                let (ready, waiting): (Vec<&str>, Vec<&str>) =
                    pending.into_iter().partition(|key| {
                        match self.children.get(*key).and_then(|c| c.upstream()) {
                            Some(upstream) => completed.contains(upstream),
                            None => true,
                        }
                    });
                pending = waiting;

                for key in ready {
                    if let Some(child) = self.children.get(key) {
                        debug!(action = self.base.name.as_str(), child = key, "Launching child");
                        running.push(async move { (key, child.walk(visitor).await) });
                    }
                }

                let Some((key, outcome)) = running.next().await else {
                    break;
                };
                match outcome {
                    Ok(()) => {
                        completed.insert(key);
                    }
                    Err(e) if e.is_cancelled() => {
                        error!(
                            action = self.base.name.as_str(),
                            child = key,
                            "Child was cancelled, its dependents will not run"
                        );
                    }
                    Err(e) => {
                        warn!(
                            action = self.base.name.as_str(),
                            child = key,
                            error = %e,
                            "Child failed"
                        );
                        failures.push(format!("{key}: {e}"));
                        completed.insert(key);
                    }
                }
            }

            if !pending.is_empty() {
                warn!(
                    action = self.base.name.as_str(),
                    stalled = ?pending,
                    "Children left waiting on a cancelled upstream"
                );
            }

            if failures.is_empty() {
                Ok(())
            } else {
                Err(ToolError::ChildrenFailed {
                    action: self.base.name.clone(),
                    failures: failures.join("\n"),
                }
                .into())
            }
        }
        .boxed()
    }

    /// Run every command of the graph.
    pub async fn run(&self, execution: ExecutionKind, exec: &ExecutionContext) -> Result<()> {
        self.validate()?;
        self.base.set_status(ToolStatus::Running);
        let visitor = ExecuteVisitor {
            exec: exec.clone(),
            execution,
        };
        let outcome = self.walk(&visitor).await;
        self.settle_status();
        outcome
    }

    pub async fn execute(&self, exec: &ExecutionContext) -> Result<()> {
        self.run(ExecutionKind::Execute, exec).await
    }

    pub async fn undo(&self, exec: &ExecutionContext) -> Result<()> {
        self.run(ExecutionKind::Undo, exec).await
    }

    /// Cancel every running command of the graph.
    pub async fn cancel(&self, exec: &ExecutionContext) -> Result<()> {
        let visitor = CancelVisitor { exec: exec.clone() };
        self.traverse(&visitor).await
    }

    /// Derive action statuses from their children once a run is over.
    fn settle_status(&self) -> ToolStatus {
        let statuses: Vec<ToolStatus> = self
            .children
            .values()
            .map(|child| match child {
                ActionChild::Command(command) => command.base.status(),
                ActionChild::Action(action) => action.settle_status(),
            })
            .collect();

        let status = if statuses.contains(&ToolStatus::Error)
            || statuses.contains(&ToolStatus::Invalid)
        {
            ToolStatus::Error
        } else if statuses.contains(&ToolStatus::Cancelled) {
            ToolStatus::Cancelled
        } else if statuses.iter().all(|s| *s == ToolStatus::Completed) {
            ToolStatus::Completed
        } else {
            ToolStatus::Initialized
        };
        self.base.set_status(status);
        status
    }

    /// Every command of the graph, depth first in key order.
    pub fn commands(&self) -> Vec<&Command> {
        let mut commands = Vec::new();
        for child in self.children.values() {
            match child {
                ActionChild::Command(command) => commands.push(command),
                ActionChild::Action(action) => commands.extend(action.commands()),
            }
        }
        commands
    }
}

struct ExecuteVisitor {
    exec: ExecutionContext,
    execution: ExecutionKind,
}

#[async_trait]
impl ToolVisitor for ExecuteVisitor {
    async fn visit(&self, node: ToolNode<'_>) -> Result<()> {
        match node {
            ToolNode::Action(action) => {
                action.base.set_status(ToolStatus::Running);
                Ok(())
            }
            ToolNode::Command(command) => command.run(self.execution, &self.exec).await,
        }
    }
}

struct CancelVisitor {
    exec: ExecutionContext,
}

#[async_trait]
impl ToolVisitor for CancelVisitor {
    async fn visit(&self, node: ToolNode<'_>) -> Result<()> {
        match node {
            ToolNode::Action(_) => Ok(()),
            ToolNode::Command(command) => command.cancel(&self.exec).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::errors::StagehandError;
    use crate::scheduling::{Scheduler, SchedulerSet};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn command(name: &str) -> ActionChild {
        ActionChild::Command(Command::new(name))
    }

    fn command_after(name: &str, upstream: &str) -> ActionChild {
        ActionChild::Command(Command::new(name).with_upstream(upstream))
    }

    /// Records start and end of every command visit.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        cancel: HashSet<String>,
        fail: HashSet<String>,
    }

    #[async_trait]
    impl ToolVisitor for Recorder {
        async fn visit(&self, node: ToolNode<'_>) -> Result<()> {
            let name = node.base().name.clone();
            self.events.lock().push(format!("start:{name}"));
            if let ToolNode::Command(_) = node {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.events.lock().push(format!("end:{name}"));
            if self.cancel.contains(&name) {
                return Err(ToolError::Cancelled { name }.into());
            }
            if self.fail.contains(&name) {
                return Err(StagehandError::Other(anyhow::anyhow!("{name} broke")));
            }
            Ok(())
        }
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().clone()
        }

        fn position(&self, event: &str) -> usize {
            self.events()
                .iter()
                .position(|e| e == event)
                .unwrap_or_else(|| panic!("{event} not recorded"))
        }
    }

    #[tokio::test]
    async fn test_upstream_completes_before_dependent_starts() {
        let action = Action::new("publish")
            .with_child("export", command("export"))
            .with_child("render", command_after("render", "export"))
            .with_child("upload", command_after("upload", "render"));
        let recorder = Recorder::default();
        action.traverse(&recorder).await.unwrap();

        assert_eq!(recorder.events()[0], "start:publish");
        assert!(recorder.position("end:export") < recorder.position("start:render"));
        assert!(recorder.position("end:render") < recorder.position("start:upload"));
    }

    #[tokio::test]
    async fn test_independent_siblings_overlap() {
        let action = Action::new("build")
            .with_child("a", command("a"))
            .with_child("b", command("b"));
        let recorder = Recorder::default();
        action.traverse(&recorder).await.unwrap();

        // Both started before either finished.
        assert!(recorder.position("start:b") < recorder.position("end:a"));
        assert!(recorder.position("start:a") < recorder.position("end:b"));
    }

    #[tokio::test]
    async fn test_nested_action_waits_for_upstream() {
        let nested = Action::new("lighting")
            .with_upstream("layout")
            .with_child("bake", command("bake"));
        let action = Action::new("shot")
            .with_child("layout", command("layout"))
            .with_child("lighting", ActionChild::Action(nested));
        let recorder = Recorder::default();
        action.traverse(&recorder).await.unwrap();

        assert!(recorder.position("end:layout") < recorder.position("start:lighting"));
        assert!(recorder.position("start:lighting") < recorder.position("start:bake"));
    }

    #[tokio::test]
    async fn test_cancelled_child_stalls_dependents() {
        let action = Action::new("publish")
            .with_child("export", command("export"))
            .with_child("render", command_after("render", "export"))
            .with_child("notes", command("notes"));
        let recorder = Recorder {
            cancel: HashSet::from(["export".to_string()]),
            ..Default::default()
        };
        action.traverse(&recorder).await.unwrap();

        let events = recorder.events();
        assert!(!events.contains(&"start:render".to_string()));
        assert!(events.contains(&"end:notes".to_string()));
    }

    #[tokio::test]
    async fn test_failed_child_is_reported_and_dependents_still_run() {
        let action = Action::new("publish")
            .with_child("export", command("export"))
            .with_child("render", command_after("render", "export"));
        let recorder = Recorder {
            fail: HashSet::from(["export".to_string()]),
            ..Default::default()
        };
        let err = action.traverse(&recorder).await.unwrap_err();

        assert!(matches!(
            err,
            StagehandError::Tool(ToolError::ChildrenFailed { .. })
        ));
        assert!(err.to_string().contains("export broke"));
        assert!(recorder.events().contains(&"end:render".to_string()));
    }

    #[test]
    fn test_validate_rejects_bad_edges() {
        let unknown = Action::new("a").with_child("x", command_after("x", "ghost"));
        assert!(matches!(
            unknown.validate(),
            Err(ToolError::InvalidGraph { .. })
        ));

        let itself = Action::new("a").with_child("x", command_after("x", "x"));
        assert!(itself.validate().is_err());

        let cycle = Action::new("a")
            .with_child("x", command_after("x", "y"))
            .with_child("y", command_after("y", "x"));
        let err = cycle.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));

        let nested = Action::new("a").with_child(
            "inner",
            ActionChild::Action(Action::new("inner").with_child("x", command_after("x", "ghost"))),
        );
        assert!(nested.validate().is_err());
    }

    #[test]
    fn test_deserialize_tagged_children() {
        let action: Action = serde_json::from_str(
            r#"{
                "name": "publish",
                "children": {
                    "export": {"type": "command", "name": "export_alembic"},
                    "review": {
                        "type": "action",
                        "name": "review",
                        "upstream": "export",
                        "children": {"notify": {"type": "command", "name": "notify"}}
                    }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(action.children.len(), 2);
        assert_eq!(action.children["review"].upstream(), Some("export"));
        let names: Vec<&str> = action.commands().iter().map(|c| c.base.name.as_str()).collect();
        assert_eq!(names, vec!["export_alembic", "notify"]);
    }

    struct CountingScheduler {
        in_flight: Mutex<usize>,
        peak: Mutex<usize>,
    }

    #[async_trait]
    impl Scheduler for CountingScheduler {
        fn name(&self) -> &str {
            "counting"
        }

        async fn schedule_command(
            &self,
            _command: &Command,
            _execution: ExecutionKind,
            _context: &Context,
        ) -> Result<()> {
            {
                let mut in_flight = self.in_flight.lock();
                *in_flight += 1;
                let mut peak = self.peak.lock();
                *peak = (*peak).max(*in_flight);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            *self.in_flight.lock() -= 1;
            Ok(())
        }

        async fn cancel_command(&self, _command: &Command) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_execute_respects_concurrency_limit_and_settles_status() {
        let scheduler = Arc::new(CountingScheduler {
            in_flight: Mutex::new(0),
            peak: Mutex::new(0),
        });
        let exec = ExecutionContext::new(
            Context::default(),
            SchedulerSet::new("counting").with(scheduler.clone()),
            2,
        );
        let mut action = Action::new("batch");
        for key in ["a", "b", "c", "d"] {
            action = action.with_child(key, command(key));
        }

        action.execute(&exec).await.unwrap();
        assert_eq!(*scheduler.peak.lock(), 2);
        assert_eq!(action.base.status(), ToolStatus::Completed);
        assert!(action
            .commands()
            .iter()
            .all(|c| c.base.status() == ToolStatus::Completed));
    }
}

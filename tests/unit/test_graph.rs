//! Action graphs run through schedulers
//!
//! Tests cover:
//! - Upstream ordering over a nested graph
//! - Concurrency of independent siblings
//! - Cancellation through the traversal
//! - Loading an action and its commands from a plugin on disk

use async_trait::async_trait;
use stagehand::context::Context;
use stagehand::errors::Result;
use stagehand::scheduling::{ExecutionContext, ExecutionKind, Scheduler, SchedulerSet};
use stagehand::tools::{Action, ActionChild, Command, ToolStatus};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Start(String),
    End(String),
}

/// Records start and end of every command; sleeps a little in between.
#[derive(Default)]
struct RecordingScheduler {
    events: Mutex<Vec<Event>>,
}

impl RecordingScheduler {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn position(&self, event: &Event) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("{event:?} not recorded"))
    }
}

#[async_trait]
impl Scheduler for RecordingScheduler {
    fn name(&self) -> &str {
        "recording"
    }

    async fn schedule_command(
        &self,
        command: &Command,
        _execution: ExecutionKind,
        _context: &Context,
    ) -> Result<()> {
        let name = command.base.name.clone();
        self.events.lock().unwrap().push(Event::Start(name.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.events.lock().unwrap().push(Event::End(name));
        Ok(())
    }

    async fn cancel_command(&self, _command: &Command) -> Result<()> {
        Ok(())
    }
}

fn exec_with(scheduler: Arc<RecordingScheduler>) -> ExecutionContext {
    ExecutionContext::new(
        Context::default(),
        SchedulerSet::new("recording").with(scheduler),
        8,
    )
}

fn command(name: &str) -> ActionChild {
    ActionChild::Command(Command::new(name))
}

fn command_after(name: &str, upstream: &str) -> ActionChild {
    ActionChild::Command(Command::new(name).with_upstream(upstream))
}

/// ingest -> (render: [lighting -> comp]) -> publish, with notify running
/// alongside ingest.
fn pipeline() -> Action {
    let render = Action::new("render")
        .with_child("lighting", command("lighting"))
        .with_child("comp", command_after("comp", "lighting"))
        .with_upstream("ingest");
    Action::new("shot")
        .with_child("ingest", command("ingest"))
        .with_child("notify", command("notify"))
        .with_child("render", ActionChild::Action(render))
        .with_child("publish", command_after("publish", "render"))
}

#[tokio::test]
async fn test_upstream_ends_before_dependent_subtree_starts() {
    let scheduler = Arc::new(RecordingScheduler::default());
    let action = pipeline();
    action.execute(&exec_with(scheduler.clone())).await.unwrap();

    let end = |name: &str| scheduler.position(&Event::End(name.to_string()));
    let start = |name: &str| scheduler.position(&Event::Start(name.to_string()));

    assert!(end("ingest") < start("lighting"));
    assert!(end("ingest") < start("comp"));
    assert!(end("lighting") < start("comp"));
    assert!(end("comp") < start("publish"));
    assert!(end("lighting") < start("publish"));
    assert_eq!(scheduler.events().len(), 10);
}

#[tokio::test]
async fn test_independent_siblings_are_in_flight_together() {
    let scheduler = Arc::new(RecordingScheduler::default());
    pipeline().execute(&exec_with(scheduler.clone())).await.unwrap();

    let start_notify = scheduler.position(&Event::Start("notify".to_string()));
    let end_ingest = scheduler.position(&Event::End("ingest".to_string()));
    assert!(start_notify < end_ingest);
}

#[tokio::test]
async fn test_statuses_settle_after_execution() {
    let scheduler = Arc::new(RecordingScheduler::default());
    let action = pipeline();
    action.execute(&exec_with(scheduler)).await.unwrap();

    assert_eq!(action.base.status(), ToolStatus::Completed);
    assert!(action
        .commands()
        .iter()
        .all(|c| c.base.status() == ToolStatus::Completed));
}

/// Holds every command until cancelled.
#[derive(Default)]
struct BlockingScheduler {
    cancelled: tokio::sync::Notify,
}

#[async_trait]
impl Scheduler for BlockingScheduler {
    fn name(&self) -> &str {
        "blocking"
    }

    async fn schedule_command(
        &self,
        command: &Command,
        _execution: ExecutionKind,
        _context: &Context,
    ) -> Result<()> {
        self.cancelled.notified().await;
        Err(stagehand::errors::ToolError::Cancelled {
            name: command.base.name.clone(),
        }
        .into())
    }

    async fn cancel_command(&self, _command: &Command) -> Result<()> {
        self.cancelled.notify_one();
        Ok(())
    }
}

#[tokio::test]
async fn test_cancel_stops_running_commands_and_stalls_dependents() {
    let scheduler = Arc::new(BlockingScheduler::default());
    let exec = ExecutionContext::new(
        Context::default(),
        SchedulerSet::new("blocking").with(scheduler),
        8,
    );
    let action = Action::new("shot")
        .with_child("render", command("render"))
        .with_child("publish", command_after("publish", "render"));

    let run = action.execute(&exec);
    let cancel = async {
        for _ in 0..100 {
            let running = action
                .commands()
                .iter()
                .any(|c| c.base.status() == ToolStatus::Running);
            if running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        action.cancel(&exec).await.unwrap();
    };
    let (_outcome, ()) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(run, cancel)
    })
    .await
    .unwrap();

    let statuses: Vec<(String, ToolStatus)> = action
        .commands()
        .iter()
        .map(|c| (c.base.name.clone(), c.base.status()))
        .collect();
    assert!(statuses.contains(&("render".to_string(), ToolStatus::Cancelled)));
    assert!(!statuses.contains(&("publish".to_string(), ToolStatus::Completed)));
    assert!(!statuses.contains(&("publish".to_string(), ToolStatus::Running)));
}

#[cfg(unix)]
mod on_disk {
    use super::*;
    use stagehand::config::PluginsConfig;
    use stagehand::scheduling::local::{CommandRegistry, LocalScheduler};
    use stagehand::scheduling::ClientPool;
    use stagehand::tools::ToolCatalog;
    use std::fs;

    #[tokio::test]
    async fn test_action_file_runs_plugin_programs() {
        let repo = tempfile::tempdir().unwrap();
        let plugin_dir = repo.path().join("shell@1.0");
        fs::create_dir_all(plugin_dir.join("commands")).unwrap();
        fs::write(
            plugin_dir.join("stagehand-plugin.json"),
            serde_json::json!({
                "tools": {"commands": ["commands"]},
                "env": {"SHOT_ROOT": {"set": "/shows/demo"}},
                "programs": [
                    {
                        "name": "render",
                        "launch_template": ["sh", "-c", "echo \"STAGEHAND_OUTPUT {\\\"root\\\": \\\"$SHOT_ROOT\\\"}\""]
                    },
                    {
                        "name": "publish",
                        "launch_template": ["sh", "-c", "echo published $STAGEHAND_COMMAND_EXECUTION"]
                    }
                ]
            })
            .to_string(),
        )
        .unwrap();
        fs::write(
            plugin_dir.join("commands/render.json"),
            serde_json::json!({"tooltip": "Render frames"}).to_string(),
        )
        .unwrap();

        let action_file = repo.path().join("shot.json");
        fs::write(
            &action_file,
            serde_json::json!({
                "children": {
                    "render": {"type": "command", "name": "render"},
                    "publish": {"type": "command", "name": "publish", "upstream": "render"}
                }
            })
            .to_string(),
        )
        .unwrap();

        let config = PluginsConfig {
            repos: vec![repo.path().to_path_buf()],
            default_require: vec![],
        };
        let context = Context::resolve("shell==1.0", &config).unwrap();
        let catalog = ToolCatalog::discover(&context);
        assert_eq!(
            catalog.command("render").unwrap().base.tooltip,
            "Render frames"
        );

        let action = Action::load(&action_file, &catalog).unwrap();
        assert_eq!(action.base.name, "shot");

        let registry = CommandRegistry::new();
        let scheduler = LocalScheduler::new(registry.clone(), ClientPool::new());
        let exec = ExecutionContext::new(
            context,
            SchedulerSet::new("local").with(Arc::new(scheduler)),
            4,
        );
        action.execute(&exec).await.unwrap();

        let commands = action.commands();
        let render = commands.iter().find(|c| c.base.name == "render").unwrap();
        let publish = commands.iter().find(|c| c.base.name == "publish").unwrap();
        assert_eq!(
            render.base.outputs()["root"].value,
            serde_json::json!("/shows/demo")
        );
        assert_eq!(publish.base.logs(), vec!["published execute"]);
        assert_eq!(registry.len().await, 2);
    }
}

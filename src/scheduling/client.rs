//! Programs and the live client processes started from them.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::status::ClientStatus;
use crate::context::Context;
use crate::errors::ClientError;

/// Maximum number of output lines kept per client
const MAX_LOG_LINES: usize = 500;

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn default_template() -> Vec<String> {
    vec!["{name}".to_string()]
}

/// An installed program and how to launch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Other program names this one can stand in for
    #[serde(default)]
    pub subsets: Vec<String>,
    /// Argument template for one-shot command runs
    #[serde(default = "default_template")]
    pub launch_template: Vec<String>,
    /// Argument template for long-running clients and processors
    #[serde(default = "default_template")]
    pub launch_client_template: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Program {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            version: None,
            subsets: Vec::new(),
            launch_template: default_template(),
            launch_client_template: default_template(),
            metadata: BTreeMap::new(),
        }
    }

    /// Whether `name` is this program or one of its subsets.
    pub fn answers_to(&self, name: &str) -> bool {
        self.name == name || self.subsets.iter().any(|subset| subset == name)
    }

    /// Placeholder values for template rendering.
    pub fn template_variables(
        &self,
        context: &Context,
        metadata: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut variables = BTreeMap::new();
        variables.insert("name".to_string(), self.name.clone());
        variables.insert(
            "label".to_string(),
            self.label.clone().unwrap_or_else(|| self.name.clone()),
        );
        if let Some(plugin) = context.plugin_for_program(self) {
            variables.insert("path".to_string(), plugin.root().to_string_lossy().into_owned());
            variables.insert("version".to_string(), plugin.version.clone());
        }
        if let Some(version) = &self.version {
            variables.insert("version".to_string(), version.clone());
        }
        for (key, value) in self.metadata.iter().chain(metadata.iter()) {
            variables.insert(format!("metadata.{key}"), value.clone());
        }
        variables
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_.\-]*)\}").expect("invalid placeholder regex")
    })
}

/// Substitute `{placeholder}`s in every template argument.
pub fn render_template(
    program: &str,
    template: &[String],
    variables: &BTreeMap<String, String>,
) -> Result<Vec<String>, ClientError> {
    let mut argv = Vec::with_capacity(template.len());
    for argument in template {
        let mut rendered = String::with_capacity(argument.len());
        let mut last = 0;
        for captures in placeholder_pattern().captures_iter(argument) {
            let (Some(whole), Some(key)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let value = variables.get(key.as_str()).ok_or_else(|| ClientError::Template {
                program: program.to_string(),
                message: format!("unknown placeholder '{{{}}}'", key.as_str()),
            })?;
            rendered.push_str(&argument[last..whole.start()]);
            rendered.push_str(value);
            last = whole.end();
        }
        rendered.push_str(&argument[last..]);
        argv.push(rendered);
    }

    if argv.first().map(|a| a.trim().is_empty()).unwrap_or(true) {
        return Err(ClientError::Template {
            program: program.to_string(),
            message: "empty launch template".to_string(),
        });
    }
    Ok(argv)
}

/// A running program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub program: Program,
    pub pid: Option<u32>,
    pub status: ClientStatus,
    pub metadata: BTreeMap<String, String>,
    #[serde(skip)]
    pub logs: Vec<String>,
    pub exit_code: Option<i32>,
}

/// Selects one client among the running ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalClientQuery {
    #[serde(default)]
    pub program_name: Option<String>,
    #[serde(default)]
    pub client_pid: Option<u32>,
    #[serde(default)]
    pub client_metadata: BTreeMap<String, String>,
}

impl LocalClientQuery {
    pub fn by_program(name: impl Into<String>) -> Self {
        Self {
            program_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, client: &Client) -> bool {
        if let Some(name) = &self.program_name {
            if !client.program.answers_to(name) {
                return false;
            }
        }
        if let Some(pid) = self.client_pid {
            if client.pid != Some(pid) {
                return false;
            }
        }
        self.client_metadata
            .iter()
            .all(|(key, value)| client.metadata.get(key) == Some(value))
    }
}

impl std::fmt::Display for LocalClientQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{program: {:?}, pid: {:?}, metadata: {:?}}}",
            self.program_name, self.client_pid, self.client_metadata
        )
    }
}

/// How to launch a program.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Use `launch_client_template` instead of `launch_template`
    pub as_client: bool,
    pub metadata: BTreeMap<String, String>,
    /// Variables added on top of the context environment
    pub extra_env: BTreeMap<String, String>,
    /// Extra template placeholders
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
enum StopMode {
    Graceful,
    Force,
}

struct ClientEntry {
    client: Client,
    stop: mpsc::UnboundedSender<StopMode>,
    exit: watch::Receiver<Option<i32>>,
}

/// Running clients by pid.
#[derive(Clone, Default)]
pub struct ClientPool {
    clients: Arc<RwLock<HashMap<u32, ClientEntry>>>,
}

impl ClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `program` with the context environment and track it.
    pub async fn start(
        &self,
        program: &Program,
        context: &Context,
        options: LaunchOptions,
    ) -> Result<Client, ClientError> {
        let mut variables = program.template_variables(context, &options.metadata);
        variables.extend(options.variables.clone());
        let template = if options.as_client {
            &program.launch_client_template
        } else {
            &program.launch_template
        };
        let argv = render_template(&program.name, template, &variables)?;

        let mut environment = context.build_environment(true);
        environment.extend(options.extra_env.clone());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env_clear()
            .envs(&environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        info!(program = %program.name, argv = ?argv, "Starting client");
        let mut child = cmd.spawn().map_err(|e| ClientError::Spawn {
            program: program.name.clone(),
            message: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| ClientError::Spawn {
            program: program.name.clone(),
            message: "process exited before its pid could be read".to_string(),
        })?;

        let mut metadata = program.metadata.clone();
        metadata.extend(options.metadata);
        let client = Client {
            id: uuid::Uuid::new_v4().to_string(),
            program: program.clone(),
            pid: Some(pid),
            status: ClientStatus::Starting,
            metadata,
            logs: Vec::new(),
            exit_code: None,
        };

        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        {
            let mut clients = self.clients.write().await;
            clients.insert(
                pid,
                ClientEntry {
                    client: client.clone(),
                    stop: stop_tx,
                    exit: exit_rx,
                },
            );
        }

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(collect_output(self.clients.clone(), pid, stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(collect_output(self.clients.clone(), pid, stderr)));
        }
        tokio::spawn(monitor_client(
            self.clients.clone(),
            pid,
            child,
            readers,
            stop_rx,
            exit_tx,
        ));

        Ok(client)
    }

    /// First running client matching `query`.
    pub async fn find(&self, query: &LocalClientQuery) -> Option<Client> {
        let clients = self.clients.read().await;
        let mut matching: Vec<&Client> = clients
            .values()
            .map(|entry| &entry.client)
            .filter(|client| !client.status.is_terminal() && query.matches(client))
            .collect();
        matching.sort_by_key(|client| client.pid);
        matching.first().map(|client| (*client).clone())
    }

    /// Reuse a running client matching `query`, or start one from the
    /// context's programs.
    pub async fn client_from_query(
        &self,
        query: &LocalClientQuery,
        context: &Context,
        options: LaunchOptions,
    ) -> Result<Client, ClientError> {
        if let Some(client) = self.find(query).await {
            debug!(pid = ?client.pid, "Reusing running client");
            return Ok(client);
        }
        if query.client_pid.is_some() {
            return Err(ClientError::NoMatch {
                query: query.to_string(),
            });
        }

        let program = query
            .program_name
            .as_deref()
            .and_then(|name| context.find_program(name))
            .ok_or_else(|| ClientError::NoMatch {
                query: query.to_string(),
            })?
            .clone();

        let mut options = options;
        options.as_client = true;
        options.metadata.extend(query.client_metadata.clone());
        self.start(&program, context, options).await
    }

    pub async fn get(&self, pid: u32) -> Option<Client> {
        let clients = self.clients.read().await;
        clients.get(&pid).map(|entry| entry.client.clone())
    }

    pub async fn list(&self) -> Vec<Client> {
        let clients = self.clients.read().await;
        clients.values().map(|entry| entry.client.clone()).collect()
    }

    pub async fn set_status(&self, pid: u32, status: ClientStatus) {
        let mut clients = self.clients.write().await;
        if let Some(entry) = clients.get_mut(&pid) {
            if entry.client.status.can_transition_to(status) {
                entry.client.status = status;
            }
        }
    }

    /// Wait for the client to exit and return its exit code.
    pub async fn wait(&self, pid: u32) -> Result<Option<i32>, ClientError> {
        let mut exit = {
            let clients = self.clients.read().await;
            clients
                .get(&pid)
                .map(|entry| entry.exit.clone())
                .ok_or(ClientError::NotFound { pid })?
        };
        loop {
            if let Some(code) = *exit.borrow_and_update() {
                return Ok(Some(code));
            }
            if exit.changed().await.is_err() {
                // The monitor is gone: the process ended without an exit code.
                return Ok(*exit.borrow());
            }
        }
    }

    /// Terminate a client. Graceful sends SIGTERM on unix.
    pub async fn kill(&self, pid: u32, force: bool) -> Result<(), ClientError> {
        let mut clients = self.clients.write().await;
        let entry = clients.get_mut(&pid).ok_or(ClientError::NotFound { pid })?;
        if entry.client.status.is_terminal() {
            return Ok(());
        }
        info!(pid = pid, force = force, "Stopping client");
        entry.client.status = ClientStatus::ShuttingDown;
        let mode = if force { StopMode::Force } else { StopMode::Graceful };
        let _ = entry.stop.send(mode);
        Ok(())
    }

    /// Stop tracking a client, returning its last known state.
    pub async fn remove(&self, pid: u32) -> Option<Client> {
        self.clients.write().await.remove(&pid).map(|entry| entry.client)
    }

    /// Drop clients that have shut down.
    pub async fn evict_finished(&self) -> usize {
        let mut clients = self.clients.write().await;
        let before = clients.len();
        clients.retain(|_, entry| !entry.client.status.is_terminal());
        before - clients.len()
    }

    pub async fn logs(&self, pid: u32) -> Vec<String> {
        let clients = self.clients.read().await;
        clients
            .get(&pid)
            .map(|entry| entry.client.logs.clone())
            .unwrap_or_default()
    }
}

async fn collect_output<R: tokio::io::AsyncRead + Unpin>(
    clients: Arc<RwLock<HashMap<u32, ClientEntry>>>,
    pid: u32,
    reader: R,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(pid = pid, "{}", crate::observability::sanitize_for_log(&line));
        let mut clients = clients.write().await;
        if let Some(entry) = clients.get_mut(&pid) {
            entry.client.logs.push(line);
            if entry.client.logs.len() > MAX_LOG_LINES {
                entry.client.logs.remove(0);
            }
        }
    }
}

/// Own the child until it exits, honouring stop requests.
async fn monitor_client(
    clients: Arc<RwLock<HashMap<u32, ClientEntry>>>,
    pid: u32,
    mut child: Child,
    readers: Vec<JoinHandle<()>>,
    mut stop: mpsc::UnboundedReceiver<StopMode>,
    exit: watch::Sender<Option<i32>>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status.ok(),
            Some(mode) = stop.recv() => match mode {
                StopMode::Force => {
                    let _ = child.start_kill();
                }
                StopMode::Graceful => {
                    #[cfg(unix)]
                    {
                        use nix::sys::signal::{kill, Signal};
                        use nix::unistd::Pid;
                        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                    }
                    #[cfg(not(unix))]
                    {
                        let _ = child.start_kill();
                    }
                }
            },
        }
    };

    // Let the readers drain what the process wrote before reporting the
    // exit. A leftover grandchild may hold the pipes open.
    for reader in readers {
        let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
    }

    let code = status.and_then(|s| s.code());
    match code {
        Some(0) => debug!(pid = pid, "Client exited"),
        _ => warn!(pid = pid, code = ?code, "Client exited abnormally"),
    }

    {
        let mut clients = clients.write().await;
        if let Some(entry) = clients.get_mut(&pid) {
            entry.client.status = ClientStatus::ShutDown;
            entry.client.exit_code = code;
        }
    }
    let _ = exit.send(Some(code.unwrap_or(-1)));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_render_template_substitutes_placeholders() {
        let template = vec![
            "{path}/bin/{name}".to_string(),
            "--shot={metadata.shot}".to_string(),
            "-batch".to_string(),
        ];
        let argv = render_template(
            "nuke",
            &template,
            &vars(&[
                ("name", "nuke"),
                ("path", "/opt/nuke"),
                ("metadata.shot", "sh0010"),
            ]),
        )
        .unwrap();
        assert_eq!(argv, vec!["/opt/nuke/bin/nuke", "--shot=sh0010", "-batch"]);
    }

    #[test]
    fn test_render_template_unknown_placeholder() {
        let err = render_template("nuke", &["{nope}".to_string()], &vars(&[])).unwrap_err();
        assert!(matches!(err, ClientError::Template { .. }));
    }

    #[test]
    fn test_render_template_empty() {
        assert!(render_template("nuke", &[], &vars(&[])).is_err());
    }

    #[test]
    fn test_program_answers_to_subsets() {
        let mut program = Program::new("mayapy");
        program.subsets = vec!["python".to_string()];
        assert!(program.answers_to("mayapy"));
        assert!(program.answers_to("python"));
        assert!(!program.answers_to("nuke"));
    }

    #[test]
    fn test_program_deserialize_defaults() {
        let program: Program = serde_json::from_str(r#"{"name": "blender"}"#).unwrap();
        assert_eq!(program.launch_template, vec!["{name}"]);
        assert_eq!(program.launch_client_template, vec!["{name}"]);
        assert!(program.subsets.is_empty());
    }

    #[test]
    fn test_local_client_query_matching() {
        let mut program = Program::new("maya");
        program.subsets = vec!["dcc".to_string()];
        let client = Client {
            id: "c1".to_string(),
            program,
            pid: Some(42),
            status: ClientStatus::Idle,
            metadata: vars(&[("shot", "sh0010"), ("user", "ana")]),
            logs: vec![],
            exit_code: None,
        };

        assert!(LocalClientQuery::default().matches(&client));
        assert!(LocalClientQuery::by_program("dcc").matches(&client));
        assert!(!LocalClientQuery::by_program("nuke").matches(&client));

        let by_pid = LocalClientQuery {
            client_pid: Some(42),
            ..Default::default()
        };
        assert!(by_pid.matches(&client));

        let by_metadata = LocalClientQuery {
            client_metadata: vars(&[("shot", "sh0010")]),
            ..Default::default()
        };
        assert!(by_metadata.matches(&client));

        let wrong_metadata = LocalClientQuery {
            client_metadata: vars(&[("shot", "sh0020")]),
            ..Default::default()
        };
        assert!(!wrong_metadata.matches(&client));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_wait_and_logs() {
        let mut program = Program::new("sh");
        program.launch_template = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo $STAGEHAND_TEST_VALUE".to_string(),
        ];
        let pool = ClientPool::new();
        let mut options = LaunchOptions::default();
        options
            .extra_env
            .insert("STAGEHAND_TEST_VALUE".to_string(), "hello".to_string());

        let client = pool
            .start(&program, &Context::default(), options)
            .await
            .unwrap();
        let pid = client.pid.unwrap();
        assert_eq!(pool.wait(pid).await.unwrap(), Some(0));
        assert_eq!(pool.logs(pid).await, vec!["hello"]);
        assert_eq!(pool.get(pid).await.unwrap().status, ClientStatus::ShutDown);
        assert_eq!(pool.evict_finished().await, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_running_client() {
        let mut program = Program::new("sleep");
        program.launch_client_template = vec!["sleep".to_string(), "30".to_string()];
        let pool = ClientPool::new();

        let client = pool
            .client_from_query(
                &LocalClientQuery::by_program("sleep"),
                &Context::new(vec![plugin_with_program(program)]),
                LaunchOptions::default(),
            )
            .await
            .unwrap();
        let pid = client.pid.unwrap();
        assert!(pool.find(&LocalClientQuery::by_program("sleep")).await.is_some());

        pool.kill(pid, false).await.unwrap();
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), pool.wait(pid))
            .await
            .unwrap()
            .unwrap();
        assert!(code.is_some());
        assert!(pool.find(&LocalClientQuery::by_program("sleep")).await.is_none());
    }

    #[tokio::test]
    async fn test_client_from_query_without_program() {
        let pool = ClientPool::new();
        let err = pool
            .client_from_query(
                &LocalClientQuery::by_program("houdini"),
                &Context::default(),
                LaunchOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NoMatch { .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut program = Program::new("missing");
        program.launch_template = vec!["/nonexistent/stagehand/binary".to_string()];
        let err = ClientPool::new()
            .start(&program, &Context::default(), LaunchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Spawn { .. }));
    }

    fn plugin_with_program(program: Program) -> crate::plugin::Plugin {
        let mut plugin = crate::plugin::Plugin::bare("/repo/tools@1.0/stagehand-plugin.json");
        plugin.programs.push(program);
        plugin
    }
}

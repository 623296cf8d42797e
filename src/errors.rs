use std::path::PathBuf;
use thiserror::Error;

/// The central error type for Stagehand.
///
/// Each subsystem owns its own error enum; this one unifies them so the CLI
/// and the scheduling service can map failures to exit codes and wire
/// replies without string matching.
#[derive(Error, Debug)]
pub enum StagehandError {
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Scheduling error: {0}")]
    Scheduling(#[from] SchedulingError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StagehandError {
    /// Whether this error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StagehandError::Tool(ToolError::Cancelled { .. }))
    }
}

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("Could not read plugin declaration {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Invalid plugin declaration {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Unhandled plugin declaration type: {path}")]
    UnsupportedFormat { path: PathBuf },

    #[error("Invalid version query '{query}': {reason}")]
    InvalidQuery { query: String, reason: String },

    #[error("No consistent plugin set satisfies the query '{query}'")]
    Unresolvable { query: String },
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool '{name}' was cancelled")]
    Cancelled { name: String },

    #[error("Tool '{name}' not found")]
    NotFound { name: String },

    #[error("Invalid graph in action '{action}': {reason}")]
    InvalidGraph { action: String, reason: String },

    #[error("Could not load tool definition {path}: {message}")]
    Load { path: PathBuf, message: String },

    #[error("One or more children of action '{action}' failed:\n{failures}")]
    ChildrenFailed { action: String, failures: String },

    #[error("No scheduler named '{scheduler}' for command '{command}'")]
    MissingScheduler { command: String, scheduler: String },
}

#[derive(Error, Debug)]
pub enum SchedulingError {
    #[error("Command '{id}' not found")]
    UnknownCommand { id: String },

    #[error("Processor '{id}' not registered")]
    UnknownProcessor { id: String },

    #[error("No running or startable processor satisfies the query {query}")]
    NoProcessor { query: String },

    #[error("Processor '{id}' did not register within {seconds} seconds")]
    RegistrationTimeout { id: String, seconds: u64 },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Command '{name}' failed: {message}")]
    CommandFailed { name: String, message: String },

    #[error("Update stream for command '{id}' closed before completion")]
    StreamClosed { id: String },
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Invalid launch template for program '{program}': {message}")]
    Template { program: String, message: String },

    #[error("Failed to spawn program '{program}': {message}")]
    Spawn { program: String, message: String },

    #[error("No running client or available program satisfies the query {query}")]
    NoMatch { query: String },

    #[error("Client with pid {pid} not found")]
    NotFound { pid: u32 },
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Connection to {address} failed: {message}")]
    Connect { address: String, message: String },

    #[error("Malformed frame: {0}")]
    Frame(String),

    #[error("Remote call failed: {0}")]
    Remote(String),

    #[error("Call timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Connection closed unexpectedly")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StagehandError>;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_RESOLUTION_ERROR: u8 = 3;
pub const EXIT_NETWORK_ERROR: u8 = 4;
pub const EXIT_SCHEDULING_ERROR: u8 = 5;

/// Determine the appropriate process exit code for an error.
pub fn get_exit_code(e: &anyhow::Error) -> u8 {
    if let Some(err) = e.downcast_ref::<StagehandError>() {
        return match err {
            StagehandError::Config(_) => EXIT_CONFIG_ERROR,
            StagehandError::Plugin(PluginError::Unresolvable { .. }) => EXIT_RESOLUTION_ERROR,
            StagehandError::Protocol(_) => EXIT_NETWORK_ERROR,
            StagehandError::Scheduling(_) | StagehandError::Client(_) => EXIT_SCHEDULING_ERROR,
            _ => EXIT_ERROR,
        };
    }

    if let Some(PluginError::Unresolvable { .. }) = e.downcast_ref::<PluginError>() {
        return EXIT_RESOLUTION_ERROR;
    }
    if e.downcast_ref::<ProtocolError>().is_some() {
        return EXIT_NETWORK_ERROR;
    }
    if e.downcast_ref::<SchedulingError>().is_some() || e.downcast_ref::<ClientError>().is_some() {
        return EXIT_SCHEDULING_ERROR;
    }

    EXIT_ERROR
}

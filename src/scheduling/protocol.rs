//! Scheduling protocol messages and framing.
//!
//! Every message is one JSON document terminated by a newline. A connection
//! carries a single call: the first frame is an [`RpcCall`], the rest depend
//! on the method.
//!
//! | method                         | client sends        | server sends                |
//! |--------------------------------|---------------------|-----------------------------|
//! | `register_processor`           | call                | one `processor` reply       |
//! | `get_command`                  | call                | one `command_request` reply |
//! | `get_command_requests`         | call                | `command_request` stream    |
//! | `get_and_send_command_updates` | call, then updates  | `command_update` stream     |
//!
//! Errors are reported with an `error` reply and the connection is closed.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::processor::{Processor, ProcessorRegistration};
use crate::errors::ProtocolError;

/// Upper bound on a single frame
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Which entry point of a command to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    #[default]
    Execute,
    Undo,
    Test,
}

impl std::fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionKind::Execute => "execute",
            ExecutionKind::Undo => "undo",
            ExecutionKind::Test => "test",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// Sent by the core to ask a processor to stop a command
    CancelRequested,
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed | CommandStatus::Failed | CommandStatus::Cancelled
        )
    }
}

/// A command assigned to a processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub execution: ExecutionKind,
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub processor_id: Option<String>,
}

/// Progress or result of a command, in either direction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandUpdate {
    pub id: String,
    pub name: String,
    pub status: CommandStatus,
    /// Between 0 and 1
    #[serde(default)]
    pub progress: Option<f32>,
    #[serde(default)]
    pub outputs: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl CommandUpdate {
    pub fn new(request: &CommandRequest, status: CommandStatus) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            status,
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RpcCall {
    RegisterProcessor { registration: ProcessorRegistration },
    GetCommand { id: String },
    GetCommandRequests { processor_id: String },
    GetAndSendCommandUpdates { processor_id: String },
}

impl RpcCall {
    pub fn method(&self) -> &'static str {
        match self {
            RpcCall::RegisterProcessor { .. } => "register_processor",
            RpcCall::GetCommand { .. } => "get_command",
            RpcCall::GetCommandRequests { .. } => "get_command_requests",
            RpcCall::GetAndSendCommandUpdates { .. } => "get_and_send_command_updates",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcReply {
    Processor { processor: Processor },
    CommandRequest { request: CommandRequest },
    CommandUpdate { update: CommandUpdate },
    Error { message: String },
}

/// Write one newline-terminated frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line =
        serde_json::to_vec(message).map_err(|e| ProtocolError::Frame(e.to_string()))?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|_| ProtocolError::Closed)?;
    writer.flush().await.map_err(|_| ProtocolError::Closed)
}

/// Read one frame. `Ok(None)` means the peer closed the connection.
///
/// At most `MAX_FRAME_BYTES + 1` bytes are buffered per line.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        let read = (&mut *reader)
            .take(MAX_FRAME_BYTES as u64 + 1)
            .read_line(&mut line)
            .await
            .map_err(|e| ProtocolError::Frame(e.to_string()))?;
        if read == 0 {
            return Ok(None);
        }
        if line.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::Frame(format!(
                "frame exceeds the {MAX_FRAME_BYTES} byte limit"
            )));
        }
        if !line.trim().is_empty() {
            break;
        }
    }
    serde_json::from_str(line.trim_end())
        .map(Some)
        .map_err(|e| ProtocolError::Frame(e.to_string()))
}

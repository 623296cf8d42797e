//! Header shared by every tool: identity, status, sockets and logs.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::plugin::derive_label;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    Command,
    Action,
    Hook,
    Widget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    #[default]
    Initializing,
    Initialized,
    Running,
    Paused,
    Error,
    Invalid,
    Completed,
    Cancelled,
}

impl ToolStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ToolStatus::Completed | ToolStatus::Cancelled | ToolStatus::Error
        )
    }
}

/// A named input or output value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Socket {
    #[serde(default)]
    pub value: Value,
    /// Declared value type, informative only
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub cast: Option<String>,
}

impl Socket {
    pub fn new(value: Value) -> Self {
        Self { value, cast: None }
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_tooltip() -> String {
    "No tooltip available".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolBase {
    #[serde(default = "new_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(skip)]
    status: RwLock<ToolStatus>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Socket>,
    #[serde(skip)]
    outputs: RwLock<BTreeMap<String, Socket>>,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default = "default_tooltip")]
    pub tooltip: String,
    #[serde(skip)]
    logs: Mutex<Vec<String>>,
}

impl Clone for ToolBase {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            label: self.label.clone(),
            status: RwLock::new(self.status()),
            inputs: self.inputs.clone(),
            outputs: RwLock::new(self.outputs()),
            hidden: self.hidden,
            tooltip: self.tooltip.clone(),
            logs: Mutex::new(self.logs()),
        }
    }
}

impl ToolBase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            label: None,
            status: RwLock::new(ToolStatus::Initialized),
            inputs: BTreeMap::new(),
            outputs: RwLock::new(BTreeMap::new()),
            hidden: false,
            tooltip: default_tooltip(),
            logs: Mutex::new(Vec::new()),
        }
    }

    /// Explicit label, or one derived from the name.
    pub fn label(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| derive_label(&self.name))
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = Some(label.into());
    }

    pub fn status(&self) -> ToolStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ToolStatus) {
        *self.status.write() = status;
    }

    /// Input values as plain JSON.
    pub fn input_values(&self) -> BTreeMap<String, Value> {
        self.inputs
            .iter()
            .map(|(key, socket)| (key.clone(), socket.value.clone()))
            .collect()
    }

    pub fn outputs(&self) -> BTreeMap<String, Socket> {
        self.outputs.read().clone()
    }

    pub fn set_output(&self, key: impl Into<String>, value: Value) {
        self.outputs.write().insert(key.into(), Socket::new(value));
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().clone()
    }

    pub fn log(&self, line: impl Into<String>) {
        self.logs.lock().push(line.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_fills_defaults() {
        let base: ToolBase = serde_json::from_str(
            r#"{"name": "publish_render", "inputs": {"frames": {"value": [1, 2], "type": "list"}}}"#,
        )
        .unwrap();
        assert!(!base.id.is_empty());
        assert_eq!(base.label(), "Publish Render");
        assert_eq!(base.status(), ToolStatus::Initializing);
        assert_eq!(base.tooltip, "No tooltip available");
        assert_eq!(base.input_values()["frames"], serde_json::json!([1, 2]));
        assert_eq!(base.inputs["frames"].cast.as_deref(), Some("list"));
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(ToolBase::new("a").id, ToolBase::new("a").id);
    }

    #[test]
    fn test_clone_copies_runtime_state() {
        let base = ToolBase::new("render");
        base.set_status(ToolStatus::Running);
        base.set_output("path", serde_json::json!("/tmp/out.exr"));
        base.log("started");

        let copy = base.clone();
        assert_eq!(copy.status(), ToolStatus::Running);
        assert_eq!(copy.outputs()["path"].value, serde_json::json!("/tmp/out.exr"));
        assert_eq!(copy.logs(), vec!["started"]);
        assert_eq!(copy.id, base.id);
    }
}

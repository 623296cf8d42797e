//! Tool definitions discovered in the plugins' tool directories.

use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::action::Action;
use super::command::Command;
use super::{Hook, Tool, ToolType, Widget};
use crate::context::Context;
use crate::errors::ToolError;

/// Name-keyed definitions of every tool the context's plugins expose.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    commands: BTreeMap<String, Command>,
    actions: BTreeMap<String, Action>,
    hooks: BTreeMap<String, Hook>,
    widgets: BTreeMap<String, Widget>,
    /// Raw action definitions, used as inheritance layers
    action_layers: BTreeMap<String, Value>,
}

/// Directories scanned for each tool type.
#[derive(Debug, Clone, Default)]
pub struct ToolDirs {
    pub commands: Vec<PathBuf>,
    pub actions: Vec<PathBuf>,
    pub hooks: Vec<PathBuf>,
    pub widgets: Vec<PathBuf>,
}

impl ToolDirs {
    pub fn from_context(context: &Context) -> Self {
        let mut dirs = Self::default();
        for plugin in &context.plugins {
            dirs.commands.extend(plugin.tools.commands.iter().cloned());
            dirs.actions.extend(plugin.tools.actions.iter().cloned());
            dirs.hooks.extend(plugin.tools.hooks.iter().cloned());
            dirs.widgets.extend(plugin.tools.widgets.iter().cloned());
        }
        dirs
    }
}

fn definition_files(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for dir in dirs {
        for entry in WalkDir::new(dir)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if entry.file_type().is_file()
                && path.extension().and_then(|e| e.to_str()) == Some("json")
            {
                files.push(path.to_path_buf());
            }
        }
    }
    files
}

/// Read a definition, defaulting its name to the file stem and its type to
/// the directory it was found in.
fn read_definition(path: &Path, kind: ToolType) -> Result<Value, ToolError> {
    let load_error = |message: String| ToolError::Load {
        path: path.to_path_buf(),
        message,
    };
    let raw = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
    let mut value: Value = serde_json::from_str(&raw).map_err(|e| load_error(e.to_string()))?;
    let object = value
        .as_object_mut()
        .ok_or_else(|| load_error("definition is not an object".to_string()))?;

    if !object.contains_key("name") {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        object.insert("name".to_string(), Value::String(stem));
    }
    if !object.contains_key("type") {
        let tag = serde_json::to_value(kind).map_err(|e| load_error(e.to_string()))?;
        object.insert("type".to_string(), tag);
    }
    Ok(value)
}

/// Merge `overlay` into `base`: objects key by key, anything else replaced.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every tool definition of the context's plugins.
    pub fn discover(context: &Context) -> Self {
        Self::from_dirs(&ToolDirs::from_context(context))
    }

    /// Load definitions from explicit directories. Unreadable definitions are
    /// skipped with a warning.
    pub fn from_dirs(dirs: &ToolDirs) -> Self {
        let mut catalog = Self::new();
        let sources = [
            (ToolType::Command, &dirs.commands),
            (ToolType::Action, &dirs.actions),
            (ToolType::Hook, &dirs.hooks),
            (ToolType::Widget, &dirs.widgets),
        ];

        let mut raw = Vec::new();
        for (kind, kind_dirs) in sources {
            for path in definition_files(kind_dirs) {
                match read_definition(&path, kind) {
                    Ok(value) => raw.push((path, value)),
                    Err(e) => warn!(error = %e, "Skipping tool definition"),
                }
            }
        }

        // Actions first so any later definition can inherit from them.
        for (_, value) in &raw {
            if value.get("type").and_then(Value::as_str) == Some("action") {
                if let Some(name) = value.get("name").and_then(Value::as_str) {
                    catalog.action_layers.insert(name.to_string(), value.clone());
                }
            }
        }

        for (path, value) in raw {
            let layered = match catalog.layer_action(value) {
                Ok(layered) => layered,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping tool definition");
                    continue;
                }
            };
            match serde_json::from_value::<Tool>(layered) {
                Ok(tool) => {
                    debug!(path = %path.display(), name = tool.base().name.as_str(), "Loaded tool");
                    catalog.insert(tool);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Invalid tool definition"),
            }
        }
        catalog
    }

    pub fn insert(&mut self, tool: Tool) {
        match tool {
            Tool::Command(command) => {
                self.commands.insert(command.base.name.clone(), command);
            }
            Tool::Action(action) => {
                self.actions.insert(action.base.name.clone(), action);
            }
            Tool::Hook(hook) => {
                self.hooks.insert(hook.base.name.clone(), hook);
            }
            Tool::Widget(widget) => {
                self.widgets.insert(widget.base.name.clone(), widget);
            }
        }
    }

    /// Register a raw action definition usable as an inheritance layer.
    pub fn insert_layer(&mut self, name: impl Into<String>, definition: Value) {
        self.action_layers.insert(name.into(), definition);
    }

    /// Merge the layers named by `definition`'s `inherit` list under it.
    /// Layers inherit recursively; earlier layers are overridden by later
    /// ones and the definition itself comes last.
    pub fn layer_action(&self, definition: Value) -> Result<Value, ToolError> {
        let mut visiting = HashSet::new();
        self.layer_with(definition, &mut visiting)
    }

    fn layer_with(
        &self,
        definition: Value,
        visiting: &mut HashSet<String>,
    ) -> Result<Value, ToolError> {
        let name = definition
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let inherit: Vec<String> = definition
            .get("inherit")
            .and_then(Value::as_array)
            .map(|layers| {
                layers
                    .iter()
                    .filter_map(|l| l.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if inherit.is_empty() {
            return Ok(definition);
        }

        visiting.insert(name.clone());
        let mut merged = Value::Object(serde_json::Map::new());
        for layer_name in &inherit {
            if visiting.contains(layer_name) {
                return Err(ToolError::InvalidGraph {
                    action: name,
                    reason: format!("inheritance of '{layer_name}' loops back"),
                });
            }
            let layer = self
                .action_layers
                .get(layer_name)
                .cloned()
                .ok_or_else(|| ToolError::NotFound {
                    name: layer_name.clone(),
                })?;
            let layer = self.layer_with(layer, visiting)?;
            deep_merge(&mut merged, layer);
        }
        visiting.remove(&name);

        deep_merge(&mut merged, definition);
        Ok(merged)
    }

    pub fn command(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.get(name)
    }

    pub fn hook(&self, name: &str) -> Option<&Hook> {
        self.hooks.get(name)
    }

    pub fn widget(&self, name: &str) -> Option<&Widget> {
        self.widgets.get(name)
    }

    /// Names of every tool of one type.
    pub fn names(&self, kind: ToolType) -> Vec<&str> {
        match kind {
            ToolType::Command => self.commands.keys().map(String::as_str).collect(),
            ToolType::Action => self.actions.keys().map(String::as_str).collect(),
            ToolType::Hook => self.hooks.keys().map(String::as_str).collect(),
            ToolType::Widget => self.widgets.keys().map(String::as_str).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.commands.len() + self.actions.len() + self.hooks.len() + self.widgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

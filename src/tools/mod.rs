//! Tools: the units of work plugins expose.
//!
//! Every tool shares a [`ToolBase`] header. Commands are leaves run by a
//! scheduler, actions compose commands and other actions into a dependency
//! graph, hooks and widgets are declared by plugins for the surfaces that
//! consume them.

pub mod action;
pub mod base;
pub mod catalog;
pub mod command;

use serde::{Deserialize, Serialize};

pub use action::{Action, ActionChild, ToolNode, ToolVisitor};
pub use base::{Socket, ToolBase, ToolStatus, ToolType};
pub use catalog::{ToolCatalog, ToolDirs};
pub use command::{Command, SchedulerBinding};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    #[serde(flatten)]
    pub base: ToolBase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Widget {
    #[serde(flatten)]
    pub base: ToolBase,
}

/// Any tool definition, tagged by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Tool {
    Command(Command),
    Action(Action),
    Hook(Hook),
    Widget(Widget),
}

impl Tool {
    pub fn base(&self) -> &ToolBase {
        match self {
            Tool::Command(command) => &command.base,
            Tool::Action(action) => &action.base,
            Tool::Hook(hook) => &hook.base,
            Tool::Widget(widget) => &widget.base,
        }
    }

    pub fn tool_type(&self) -> ToolType {
        match self {
            Tool::Command(_) => ToolType::Command,
            Tool::Action(_) => ToolType::Action,
            Tool::Hook(_) => ToolType::Hook,
            Tool::Widget(_) => ToolType::Widget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_tagging() {
        let tool: Tool =
            serde_json::from_str(r#"{"type": "widget", "name": "shot_browser"}"#).unwrap();
        assert_eq!(tool.tool_type(), ToolType::Widget);
        assert_eq!(tool.base().label(), "Shot Browser");

        let json = serde_json::to_value(Tool::Command(Command::new("render"))).unwrap();
        assert_eq!(json["type"], "command");
        assert_eq!(json["name"], "render");
    }
}

//! Execution context
//!
//! A [`Context`] is the resolved plugin set a piece of work runs under. It
//! builds the environment handed to every spawned client or processor and
//! exposes the programs and tool directories the plugins declare.

pub mod provider;

use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::config::PluginsConfig;
use crate::errors::{PluginError, Result};
use crate::plugin::{resolve_plugins, Plugin};
use crate::scheduling::client::Program;

pub use provider::{ContextProvider, Entity, EntityContext};

#[cfg(windows)]
pub const PATH_LIST_SEPARATOR: char = ';';
#[cfg(not(windows))]
pub const PATH_LIST_SEPARATOR: char = ':';

pub const PLUGINS_VAR: &str = "STAGEHAND_PLUGINS";
pub const COMMANDS_VAR: &str = "STAGEHAND_COMMANDS";
pub const ACTIONS_VAR: &str = "STAGEHAND_ACTIONS";
pub const HOOKS_VAR: &str = "STAGEHAND_HOOKS";
pub const WIDGETS_VAR: &str = "STAGEHAND_WIDGETS";
pub const CORE_HOST_VAR: &str = "STAGEHAND_CORE_HOST";
pub const CORE_PORT_VAR: &str = "STAGEHAND_CORE_PORT";

/// Address of a running scheduling service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreAddress {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct Context {
    /// Query the plugins were resolved from
    pub query: String,
    /// Resolved plugins in load order
    pub plugins: Vec<Plugin>,
    /// Set while the scheduling service is reachable
    pub core: Option<CoreAddress>,
}

impl Context {
    pub fn new(plugins: Vec<Plugin>) -> Self {
        Self {
            plugins,
            ..Default::default()
        }
    }

    /// Resolve `query` plus the configured default requirements.
    pub fn resolve(query: &str, config: &PluginsConfig) -> Result<Self> {
        let full_query = std::iter::once(query)
            .chain(config.default_require.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        let full_query = full_query.trim().to_string();

        if full_query.is_empty() {
            return Ok(Self::default());
        }

        let plugins = resolve_plugins(&full_query, &config.repos);
        if plugins.is_empty() {
            return Err(PluginError::Unresolvable { query: full_query }.into());
        }

        info!(
            query = full_query.as_str(),
            plugins = plugins.len(),
            "Resolved plugin context"
        );
        Ok(Self {
            query: full_query,
            plugins,
            core: None,
        })
    }

    pub fn with_core_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.core = Some(CoreAddress {
            host: host.into(),
            port,
        });
        self
    }

    /// Environment for processes started under this context.
    ///
    /// Per plugin and variable: prepend entries are pushed one by one in
    /// front of the current value (so they end up reversed), append entries
    /// are added behind it, and `set` replaces it.
    pub fn build_environment(&self, include_current: bool) -> BTreeMap<String, String> {
        let mut environment: BTreeMap<String, String> = if include_current {
            std::env::vars().collect()
        } else {
            BTreeMap::new()
        };

        for plugin in &self.plugins {
            apply_plugin_env(&mut environment, plugin);
        }

        environment.insert(
            PLUGINS_VAR.to_string(),
            join_list(self.plugins.iter().map(|p| p.path.to_string_lossy().into_owned())),
        );
        let tool_vars: [(&str, fn(&Plugin) -> &Vec<PathBuf>); 4] = [
            (COMMANDS_VAR, |p| &p.tools.commands),
            (ACTIONS_VAR, |p| &p.tools.actions),
            (HOOKS_VAR, |p| &p.tools.hooks),
            (WIDGETS_VAR, |p| &p.tools.widgets),
        ];
        for (key, select) in tool_vars {
            let dirs: Vec<String> = self
                .plugins
                .iter()
                .flat_map(|p| select(p).iter())
                .map(|d| d.to_string_lossy().into_owned())
                .collect();
            if !dirs.is_empty() {
                environment.insert(key.to_string(), join_list(dirs));
            }
        }

        if let Some(core) = &self.core {
            environment.insert(CORE_HOST_VAR.to_string(), core.host.clone());
            environment.insert(CORE_PORT_VAR.to_string(), core.port.to_string());
        }

        debug!(variables = environment.len(), "Built context environment");
        environment
    }

    /// Environment as `KEY=VALUE` strings.
    pub fn environ(&self, include_current: bool) -> Vec<String> {
        self.build_environment(include_current)
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }

    /// Every program declared by the context's plugins.
    pub fn available_programs(&self) -> Vec<&Program> {
        self.plugins.iter().flat_map(|p| p.programs.iter()).collect()
    }

    /// First program answering to `name`, directly or through a subset.
    pub fn find_program(&self, name: &str) -> Option<&Program> {
        self.available_programs()
            .into_iter()
            .find(|program| program.answers_to(name))
    }

    /// The plugin that declares `program`, used for template substitution.
    pub fn plugin_for_program(&self, program: &Program) -> Option<&Plugin> {
        self.plugins.iter().find(|p| p.programs.contains(program))
    }
}

fn join_list<I: IntoIterator<Item = String>>(items: I) -> String {
    items
        .into_iter()
        .collect::<Vec<_>>()
        .join(&PATH_LIST_SEPARATOR.to_string())
}

/// Apply one plugin's environment rules over `environment`.
pub fn apply_plugin_env(environment: &mut BTreeMap<String, String>, plugin: &Plugin) {
    for (key, rule) in &plugin.env {
        for entry in &rule.prepend {
            let value = match environment.get(key) {
                Some(current) => format!(
                    "{entry}{PATH_LIST_SEPARATOR}{}",
                    current.trim_matches(PATH_LIST_SEPARATOR)
                ),
                None => entry.clone(),
            };
            environment.insert(key.clone(), value);
        }
        for entry in &rule.append {
            let value = match environment.get(key) {
                Some(current) => format!(
                    "{}{PATH_LIST_SEPARATOR}{entry}",
                    current.trim_matches(PATH_LIST_SEPARATOR)
                ),
                None => entry.clone(),
            };
            environment.insert(key.clone(), value);
        }
        if let Some(set) = &rule.set {
            environment.insert(key.clone(), set.clone());
        }
    }
}

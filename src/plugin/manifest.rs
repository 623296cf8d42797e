//! Plugin declarations and their bare/full load states.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use tracing::warn;

use super::version::{compare_versions, component_count, VersionQuery};
use crate::errors::PluginError;
use crate::scheduling::client::Program;

/// File stem of a plugin declaration placed inside a `name@version` directory.
pub const DECLARATION_STEM: &str = "stagehand-plugin";
pub const DECLARATION_EXTENSIONS: [&str; 3] = ["json", "yaml", "yml"];
pub const VERSION_SEPARATOR: char = '@';
pub const DEFAULT_VERSION: &str = "0.0.0";

/// Environment contribution for one variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginEnv {
    pub set: Option<String>,
    pub append: Vec<String>,
    pub prepend: Vec<String>,
}

/// Directories holding tool definitions, grouped by tool kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginTools {
    pub commands: Vec<PathBuf>,
    pub actions: Vec<PathBuf>,
    pub hooks: Vec<PathBuf>,
    pub widgets: Vec<PathBuf>,
}

impl PluginTools {
    fn all_mut(&mut self) -> impl Iterator<Item = &mut PathBuf> {
        self.commands
            .iter_mut()
            .chain(self.actions.iter_mut())
            .chain(self.hooks.iter_mut())
            .chain(self.widgets.iter_mut())
    }
}

/// A named external launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub name: String,
    pub path: PathBuf,
}

/// On-disk shape of a declaration. Every field is optional so that absent
/// fields keep the values derived from the path.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PluginDeclaration {
    name: Option<String>,
    version: Option<String>,
    label: Option<String>,
    require: Option<Vec<String>>,
    env: Option<BTreeMap<String, PluginEnv>>,
    tools: Option<PluginTools>,
    clients: Option<Vec<ClientConfig>>,
    programs: Option<Vec<Program>>,
}

/// A versioned bundle of tools, environment rules and launchable programs.
///
/// Identity is `(name, version, path, label)`; the remaining fields are only
/// populated by a full load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plugin {
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    pub label: String,
    #[serde(default)]
    pub require: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, PluginEnv>,
    #[serde(default)]
    pub tools: PluginTools,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
    #[serde(default)]
    pub programs: Vec<Program>,
}

impl PartialEq for Plugin {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.path == other.path
            && self.label == other.label
    }
}

impl Eq for Plugin {}

impl Hash for Plugin {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.version.hash(state);
        self.path.hash(state);
        self.label.hash(state);
    }
}

/// `"my_plugin"` becomes `"My Plugin"`.
pub fn derive_label(name: &str) -> String {
    name.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Whether `path` is a plugin declaration file.
pub fn is_declaration(path: &Path) -> bool {
    let extension_ok = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| DECLARATION_EXTENSIONS.contains(&e))
        .unwrap_or(false);
    if !extension_ok {
        return false;
    }
    match path.file_stem().and_then(|s| s.to_str()) {
        Some(DECLARATION_STEM) => true,
        Some(stem) => stem.contains(VERSION_SEPARATOR),
        None => false,
    }
}

/// The declaration file directly inside `dir`, if any.
pub fn declaration_in(dir: &Path) -> Option<PathBuf> {
    DECLARATION_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{DECLARATION_STEM}.{ext}")))
        .find(|candidate| candidate.is_file())
}

impl Plugin {
    /// Build a plugin from its path alone, without opening the file.
    ///
    /// `<dir>/foo@1.2/stagehand-plugin.json` and `<dir>/foo@1.2.json` both
    /// give `foo` at `1.2`; a name without `@` gets the default version.
    pub fn bare(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let identity = if stem == DECLARATION_STEM {
            path.parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string()
        } else {
            stem.to_string()
        };

        let (name, version) = match identity.split(VERSION_SEPARATOR).collect::<Vec<_>>()[..] {
            [name, version] => (name.to_string(), version.to_string()),
            _ => (identity.clone(), DEFAULT_VERSION.to_string()),
        };

        Self {
            label: derive_label(&name),
            name,
            version,
            path,
            ..Default::default()
        }
    }

    /// Load the declaration at `path`, merged over the bare plugin.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, PluginError> {
        let mut plugin = Self::bare(path);
        let content = std::fs::read_to_string(&plugin.path).map_err(|e| PluginError::Read {
            path: plugin.path.clone(),
            message: e.to_string(),
        })?;
        let declaration = parse_declaration(&plugin.path, &content)?;
        plugin.merge(declaration);
        plugin.init_defaults();
        Ok(plugin)
    }

    /// Full load of this plugin, falling back to the bare instance when the
    /// declaration can't be read or parsed.
    pub fn load_full(&self) -> Self {
        match Self::load(&self.path) {
            Ok(plugin) => plugin,
            Err(e) => {
                warn!(error = %e, "Falling back to bare plugin");
                let mut bare = Self::bare(&self.path);
                bare.init_defaults();
                bare
            }
        }
    }

    /// Re-derive this plugin from disk.
    pub fn reload(&self) -> Self {
        self.load_full()
    }

    /// Directory relative paths are resolved against.
    pub fn root(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }

    /// Fold a parsed declaration in. Name and version stay the ones from the
    /// `name@version` path, which is what candidates are matched on.
    fn merge(&mut self, declaration: PluginDeclaration) {
        if let Some(name) = declaration.name.filter(|name| *name != self.name) {
            warn!(
                path = %self.path.display(),
                declared = %name,
                name = %self.name,
                "Ignoring declared plugin name that disagrees with its path"
            );
        }
        if let Some(version) = declaration.version.filter(|version| *version != self.version) {
            warn!(
                path = %self.path.display(),
                declared = %version,
                version = %self.version,
                "Ignoring declared plugin version that disagrees with its path"
            );
        }
        match declaration.label {
            Some(label) => self.label = label,
            None => self.label = derive_label(&self.name),
        }
        if let Some(require) = declaration.require {
            self.require = require;
        }
        if let Some(env) = declaration.env {
            self.env = env;
        }
        if let Some(tools) = declaration.tools {
            self.tools = tools;
        }
        if let Some(clients) = declaration.clients {
            self.clients = clients;
        }
        if let Some(programs) = declaration.programs {
            self.programs = programs;
        }
    }

    fn init_defaults(&mut self) {
        if self.label.is_empty() {
            self.label = derive_label(&self.name);
        }

        let root = self.root().to_path_buf();
        for tool_path in self.tools.all_mut() {
            if tool_path.is_relative() {
                *tool_path = root.join(&*tool_path);
            }
        }
        for rule in self.env.values_mut() {
            for entry in rule.append.iter_mut().chain(rule.prepend.iter_mut()) {
                if Path::new(entry.as_str()).is_relative() {
                    *entry = root.join(entry.as_str()).to_string_lossy().into_owned();
                }
            }
        }
        for client in &mut self.clients {
            if client.path.is_relative() {
                client.path = root.join(&client.path);
            }
        }

        let name = self.name.clone();
        self.require
            .retain(|requirement| VersionQuery::parse(requirement).name != name);
    }

    /// Order two plugins by version.
    pub fn cmp_version(&self, other: &Self) -> Ordering {
        compare_versions(&self.version, &other.version)
    }

    pub fn version_components(&self) -> usize {
        component_count(&self.version)
    }
}

fn parse_declaration(path: &Path, content: &str) -> Result<PluginDeclaration, PluginError> {
    let parse_error = |message: String| PluginError::Parse {
        path: path.to_path_buf(),
        message,
    };
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(content).map_err(|e| parse_error(e.to_string())),
        Some("yaml") | Some("yml") => {
            serde_yaml::from_str(content).map_err(|e| parse_error(e.to_string()))
        }
        _ => Err(PluginError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

//! Plugin discovery and version resolution
//!
//! A plugin is a `name@version` bundle declared by a `stagehand-plugin.json`
//! (or `.yaml`) file. Resolution turns a space-separated constraint query
//! such as `"maya>=2024 arnold==7.2"` into one plugin per name, following
//! each chosen plugin's own requirements.

pub mod manifest;
pub mod resolver;
pub mod version;

pub use manifest::{derive_label, ClientConfig, Plugin, PluginEnv, PluginTools};
pub use resolver::{
    combine_candidates, get_all_plugin_versions, get_matching_plugins_from_query,
    get_preferred_plugin_version, resolve_plugins, CandidateMap,
};
pub use version::{compare_versions, VersionOperator, VersionQuery};

//! Resolution against plugin repositories on disk
//!
//! Tests cover:
//! - Query matching across versions
//! - Backtracking resolution with requirements
//! - Impossible resolutions
//! - Idempotence and default requirements
//! - Environment built from resolved declarations

use stagehand::config::PluginsConfig;
use stagehand::context::{Context, PATH_LIST_SEPARATOR};
use stagehand::errors::{PluginError, StagehandError};
use stagehand::plugin::{get_all_plugin_versions, get_matching_plugins_from_query, resolve_plugins};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn declare(root: &Path, identity: &str, declaration: serde_json::Value) {
    let dir = root.join(identity);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("stagehand-plugin.json"), declaration.to_string()).unwrap();
}

/// foo 3.0/3.2/4.0, bar 2.3, baz 3.1/5.0. baz 5.0 needs a plugin that does
/// not exist, so only baz 3.1 is consistent.
fn repository() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    declare(root, "foo@3.0", serde_json::json!({}));
    declare(
        root,
        "foo@3.2",
        serde_json::json!({"require": ["bar==2.3", "baz<=5.6"]}),
    );
    declare(root, "foo@4.0", serde_json::json!({"require": ["bar>=9.0"]}));
    declare(root, "bar@2.3", serde_json::json!({}));
    declare(root, "baz@3.1", serde_json::json!({}));
    declare(root, "baz@5.0", serde_json::json!({"require": ["qux>=1.0"]}));
    dir
}

fn identities(plugins: &[stagehand::plugin::Plugin]) -> BTreeMap<String, String> {
    plugins
        .iter()
        .map(|p| (p.name.clone(), p.version.clone()))
        .collect()
}

fn expected(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(name, version)| (name.to_string(), version.to_string()))
        .collect()
}

mod query_tests {
    use super::*;

    #[test]
    fn test_all_versions_are_found() {
        let repo = repository();
        let roots = vec![repo.path().to_path_buf()];
        assert_eq!(get_all_plugin_versions("foo", &roots).len(), 3);
    }

    #[test]
    fn test_at_most_matches_lower_versions_only() {
        let repo = repository();
        let roots = vec![repo.path().to_path_buf()];
        let candidates = get_matching_plugins_from_query("foo<=3.5", &roots);
        let mut versions: Vec<&str> = candidates
            .get("foo")
            .unwrap()
            .iter()
            .map(|p| p.version.as_str())
            .collect();
        versions.sort();
        assert_eq!(versions, vec!["3.0", "3.2"]);
    }
}

mod resolution_tests {
    use super::*;

    #[test]
    fn test_resolves_consistent_set() {
        let repo = repository();
        let roots = vec![repo.path().to_path_buf()];
        let resolved = resolve_plugins("foo>=3.0 bar==2.3 baz<=5.6", &roots);
        assert_eq!(
            identities(&resolved),
            expected(&[("foo", "3.2"), ("bar", "2.3"), ("baz", "3.1")])
        );
    }

    #[test]
    fn test_same_name_constraints_intersect() {
        let repo = repository();
        let roots = vec![repo.path().to_path_buf()];
        let resolved = resolve_plugins("foo>=3.2 foo<=3.8", &roots);
        assert_eq!(
            identities(&resolved),
            expected(&[("foo", "3.2"), ("bar", "2.3"), ("baz", "3.1")])
        );
    }

    #[test]
    fn test_missing_requirement_is_empty_not_error() {
        let dir = tempfile::tempdir().unwrap();
        declare(dir.path(), "foo@1.0", serde_json::json!({"require": ["bar==7.0"]}));
        declare(dir.path(), "bar@6.0", serde_json::json!({}));
        let roots = vec![dir.path().to_path_buf()];
        assert!(resolve_plugins("foo==1.0", &roots).is_empty());
    }

    #[test]
    fn test_declared_identity_mismatch_resolves_by_path() {
        let dir = tempfile::tempdir().unwrap();
        declare(
            dir.path(),
            "foo@1.0",
            serde_json::json!({"name": "other", "version": "9.9", "require": ["bar>=1.0"]}),
        );
        declare(dir.path(), "bar@1.2", serde_json::json!({"name": "bar"}));
        let roots = vec![dir.path().to_path_buf()];

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(resolve_plugins("foo==1.0", &roots));
        });
        let resolved = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("resolution did not terminate");
        assert_eq!(
            identities(&resolved),
            expected(&[("foo", "1.0"), ("bar", "1.2")])
        );
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let repo = repository();
        let roots = vec![repo.path().to_path_buf()];
        let first = resolve_plugins("foo>=3.0 bar==2.3 baz<=5.6", &roots);
        let second = resolve_plugins("foo>=3.0 bar==2.3 baz<=5.6", &roots);
        assert_eq!(first, second);
    }

    #[test]
    fn test_roots_are_searched_together() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        declare(first.path(), "foo@1.0", serde_json::json!({"require": ["bar>=1.0"]}));
        declare(second.path(), "bar@1.5", serde_json::json!({}));
        let roots: Vec<PathBuf> = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        assert_eq!(
            identities(&resolve_plugins("foo==1.0", &roots)),
            expected(&[("foo", "1.0"), ("bar", "1.5")])
        );
    }
}

mod context_tests {
    use super::*;

    #[test]
    fn test_context_applies_default_requirements() {
        let repo = repository();
        let config = PluginsConfig {
            repos: vec![repo.path().to_path_buf()],
            default_require: vec!["bar==2.3".to_string()],
        };
        let context = Context::resolve("foo==3.0", &config).unwrap();
        assert_eq!(
            identities(&context.plugins),
            expected(&[("foo", "3.0"), ("bar", "2.3")])
        );
    }

    #[test]
    fn test_unresolvable_context_is_resolution_error() {
        let repo = repository();
        let config = PluginsConfig {
            repos: vec![repo.path().to_path_buf()],
            default_require: vec![],
        };
        let err = Context::resolve("foo>=9.0", &config).unwrap_err();
        assert!(matches!(
            err,
            StagehandError::Plugin(PluginError::Unresolvable { .. })
        ));
    }

    #[test]
    fn test_environment_from_declarations() {
        let dir = tempfile::tempdir().unwrap();
        declare(
            dir.path(),
            "maya@2024",
            serde_json::json!({
                "require": ["arnold>=7.0"],
                "env": {"PATH": {"prepend": ["/opt/maya/bin"]}, "MAYA_VERSION": {"set": "2024"}}
            }),
        );
        declare(
            dir.path(),
            "arnold@7.2",
            serde_json::json!({"env": {"PATH": {"prepend": ["/opt/arnold/bin", "/opt/arnold/lib"]}}}),
        );
        let config = PluginsConfig {
            repos: vec![dir.path().to_path_buf()],
            default_require: vec![],
        };

        let context = Context::resolve("maya==2024", &config).unwrap();
        let environment = context.build_environment(false);
        assert_eq!(environment["MAYA_VERSION"], "2024");

        // maya is loaded first, arnold's prepends land in front reversed.
        let path: Vec<&str> = environment["PATH"].split(PATH_LIST_SEPARATOR).collect();
        assert_eq!(
            path,
            vec!["/opt/arnold/lib", "/opt/arnold/bin", "/opt/maya/bin"]
        );
    }
}

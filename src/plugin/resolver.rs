//! Backtracking plugin resolution.
//!
//! Resolution keeps a candidate map (`name -> candidate plugins`) and an
//! explicit stack of frames, one per name being decided. Each frame owns the
//! candidates not tried yet and a snapshot of the map taken before the
//! choice, so undoing a failed choice is a matter of popping the frame.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::manifest::{declaration_in, is_declaration, Plugin};
use super::version::{split_query, VersionQuery};

/// Candidate plugins per name, iterated in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateMap {
    entries: Vec<(String, Vec<Plugin>)>,
}

impl CandidateMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Vec<Plugin>> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, plugins)| plugins)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Vec<Plugin>> {
        self.entries
            .iter_mut()
            .find(|(entry, _)| entry == name)
            .map(|(_, plugins)| plugins)
    }

    /// Replace the set for `name`, keeping its original position.
    pub fn insert(&mut self, name: impl Into<String>, plugins: Vec<Plugin>) {
        let name = name.into();
        match self.get_mut(&name) {
            Some(existing) => *existing = plugins,
            None => self.entries.push((name, plugins)),
        }
    }

    /// Add plugins to the set for `name`, skipping ones already present.
    pub fn extend(&mut self, name: &str, plugins: impl IntoIterator<Item = Plugin>) {
        if self.get(name).is_none() {
            self.entries.push((name.to_string(), Vec::new()));
        }
        if let Some(existing) = self.get_mut(name) {
            for plugin in plugins {
                if !existing.contains(&plugin) {
                    existing.push(plugin);
                }
            }
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Plugin])> {
        self.entries
            .iter()
            .map(|(name, plugins)| (name.as_str(), plugins.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First name whose candidate set is empty.
    pub fn first_empty(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, plugins)| plugins.is_empty())
            .map(|(name, _)| name.as_str())
    }
}

/// Every declaration file under `roots`, in path-sorted order.
///
/// A directory holding a `stagehand-plugin.*` file is a plugin root and its
/// subdirectories are not scanned.
pub fn find_declarations(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for root in roots {
        let mut walker = WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(root = %root.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                if let Some(declaration) = declaration_in(entry.path()) {
                    found.push(declaration);
                    walker.skip_current_dir();
                }
            } else if entry.file_type().is_file()
                && is_declaration(entry.path())
                && !found.iter().any(|f: &PathBuf| f == entry.path())
            {
                found.push(entry.into_path());
            }
        }
    }
    found
}

/// All versions of the plugin `name` found under `roots`, bare-loaded.
pub fn get_all_plugin_versions(name: &str, roots: &[PathBuf]) -> Vec<Plugin> {
    let mut versions: Vec<Plugin> = Vec::new();
    for path in find_declarations(roots) {
        let plugin = Plugin::bare(path);
        if plugin.name == name && !versions.contains(&plugin) {
            versions.push(plugin);
        }
    }
    versions
}

/// Candidates for every constraint of `query`. Constraints naming the same
/// plugin are unioned; a name with no match still gets an empty entry.
pub fn get_matching_plugins_from_query(query: &str, roots: &[PathBuf]) -> CandidateMap {
    let mut candidates = CandidateMap::new();
    for token in split_query(query) {
        let version_query = VersionQuery::parse(token);
        let matching = get_all_plugin_versions(&version_query.name, roots)
            .into_iter()
            .filter(|plugin| version_query.matches(plugin));
        candidates.extend(&version_query.name, matching);
    }
    candidates
}

/// Candidates satisfying every constraint of `query` at once.
fn constrained_candidates<S: AsRef<str>>(constraints: &[S], roots: &[PathBuf]) -> CandidateMap {
    constraints
        .iter()
        .fold(CandidateMap::new(), |candidates, constraint| {
            combine_candidates(
                &candidates,
                &get_matching_plugins_from_query(constraint.as_ref(), roots),
            )
        })
}

/// Merge two candidate maps: names present on both sides keep the
/// intersection, names present on one side keep that side's set.
pub fn combine_candidates(current: &CandidateMap, new: &CandidateMap) -> CandidateMap {
    let mut combined = current.clone();
    for (name, plugins) in new.iter() {
        match combined.get_mut(name) {
            Some(existing) => existing.retain(|plugin| plugins.contains(plugin)),
            None => combined.insert(name, plugins.to_vec()),
        }
    }
    combined
}

/// Highest version among `candidates`. Equal versions prefer the one with
/// more components, then the first one seen.
pub fn get_preferred_plugin_version(candidates: &[Plugin]) -> Option<&Plugin> {
    candidates.iter().fold(None, |best: Option<&Plugin>, plugin| match best {
        None => Some(plugin),
        Some(current) => match plugin.cmp_version(current) {
            std::cmp::Ordering::Greater => Some(plugin),
            std::cmp::Ordering::Equal
                if plugin.version_components() > current.version_components() =>
            {
                Some(plugin)
            }
            _ => Some(current),
        },
    })
}

/// One decision point of the search.
#[derive(Debug)]
struct Frame {
    name: String,
    remaining: Vec<Plugin>,
    saved_candidates: CandidateMap,
    completed_before: Vec<(String, Plugin)>,
}

impl Frame {
    /// Try the remaining candidates, best first, until one leaves every name
    /// with at least one candidate.
    fn next_choice(&mut self, roots: &[PathBuf]) -> Option<(CandidateMap, Plugin)> {
        while let Some(preferred) = get_preferred_plugin_version(&self.remaining).cloned() {
            self.remaining.retain(|plugin| plugin != &preferred);

            let full = preferred.load_full();
            let requirements = constrained_candidates(&full.require, roots);
            let mut combined = combine_candidates(&self.saved_candidates, &requirements);
            combined.insert(self.name.clone(), vec![preferred.clone()]);

            if let Some(empty) = combined.first_empty() {
                debug!(
                    plugin = %self.name,
                    version = %preferred.version,
                    conflict = empty,
                    "Rejecting plugin version: no candidates left"
                );
                continue;
            }

            debug!(plugin = %self.name, version = %preferred.version, "Selected plugin version");
            return Some((combined, full));
        }
        None
    }
}

/// Resolve `query` into one plugin per required name.
///
/// Returns an empty list when no consistent set exists.
pub fn resolve_plugins(query: &str, roots: &[PathBuf]) -> Vec<Plugin> {
    let constraints: Vec<&str> = split_query(query).collect();
    let mut candidates = constrained_candidates(&constraints, roots);
    // Keyed by candidate name, not by the loaded plugin's own name.
    let mut completed: Vec<(String, Plugin)> = Vec::new();
    let mut stack: Vec<Frame> = Vec::new();

    loop {
        let next = candidates
            .names()
            .find(|name| !completed.iter().any(|(done, _)| done == name))
            .map(str::to_string);
        let Some(name) = next else {
            return completed.into_iter().map(|(_, plugin)| plugin).collect();
        };

        stack.push(Frame {
            remaining: candidates.get(&name).cloned().unwrap_or_default(),
            name,
            saved_candidates: candidates.clone(),
            completed_before: completed.clone(),
        });

        loop {
            let Some(frame) = stack.last_mut() else {
                warn!(query = query, "Plugin resolution impossible");
                return Vec::new();
            };
            match frame.next_choice(roots) {
                Some((combined, chosen)) => {
                    candidates = combined;
                    completed = frame.completed_before.clone();
                    completed.push((frame.name.clone(), chosen));
                    break;
                }
                None => {
                    debug!(plugin = %frame.name, "No candidate left, backtracking");
                    stack.pop();
                }
            }
        }
    }
}

/// `resolve_plugins` over a single root.
pub fn resolve_plugins_in(query: &str, root: &Path) -> Vec<Plugin> {
    resolve_plugins(query, &[root.to_path_buf()])
}

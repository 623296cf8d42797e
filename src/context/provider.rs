//! Production entity context.
//!
//! The tracking backend is an external collaborator: it is reached through
//! [`ContextProvider`] and flattened into an [`EntityContext`] that commands
//! can read metadata from.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

/// A node of the project → episode → sequence → shot → range hierarchy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    pub label: String,
    #[serde(skip)]
    pub parent: Option<Arc<Entity>>,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

pub type Project = Entity;
pub type Episode = Entity;
pub type Sequence = Entity;
pub type Shot = Entity;
pub type Range = Entity;

impl Entity {
    /// Ancestors from the root down to this entity.
    pub fn parent_hierarchy(&self) -> Vec<&Entity> {
        let mut hierarchy = vec![self];
        let mut current = self.parent.as_deref();
        while let Some(parent) = current {
            hierarchy.insert(0, parent);
            current = parent.parent.as_deref();
        }
        hierarchy
    }

    /// Data of the whole hierarchy, children overriding parents.
    pub fn flattened_data(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut flattened = serde_json::Map::new();
        for entity in self.parent_hierarchy() {
            for (key, value) in &entity.data {
                flattened.insert(key.clone(), value.clone());
            }
        }
        flattened
    }
}

/// Source of production entities.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn get_project(&self) -> Option<Project>;
    async fn get_episodes(&self, project: &Project) -> Option<Vec<Episode>>;
    async fn get_sequences(&self, episode: &Episode) -> Option<Vec<Sequence>>;
    async fn get_shots(&self, sequence: &Sequence) -> Option<Vec<Shot>>;
    async fn get_ranges(&self, shot: &Shot) -> Option<Vec<Range>>;
}

/// Entities a unit of work is bound to.
#[derive(Debug, Clone, Default)]
pub struct EntityContext {
    pub project: Project,
    pub episodes: Vec<Episode>,
    pub sequences: Vec<Sequence>,
    pub shots: Vec<Shot>,
    pub ranges: Vec<Range>,
}

impl EntityContext {
    /// Walk the provider's hierarchy. Missing levels become empty lists; a
    /// missing project means no context at all.
    pub async fn build_with_provider(provider: &dyn ContextProvider) -> Option<Self> {
        let Some(project) = provider.get_project().await else {
            error!(
                provider = provider.name(),
                "Could not build context: project could not be resolved"
            );
            return None;
        };

        let episodes = provider.get_episodes(&project).await.unwrap_or_default();
        let mut sequences = Vec::new();
        for episode in &episodes {
            sequences.extend(provider.get_sequences(episode).await.unwrap_or_default());
        }
        let mut shots = Vec::new();
        for sequence in &sequences {
            shots.extend(provider.get_shots(sequence).await.unwrap_or_default());
        }
        let mut ranges = Vec::new();
        for shot in &shots {
            ranges.extend(provider.get_ranges(shot).await.unwrap_or_default());
        }

        Some(Self {
            project,
            episodes,
            sequences,
            shots,
            ranges,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str, parent: Option<&Entity>) -> Entity {
        Entity {
            id: id.to_string(),
            name: id.to_string(),
            label: id.to_uppercase(),
            parent: parent.map(|p| Arc::new(p.clone())),
            data: serde_json::Map::new(),
        }
    }

    struct StaticProvider {
        with_project: bool,
    }

    #[async_trait]
    impl ContextProvider for StaticProvider {
        fn name(&self) -> &str {
            "static"
        }

        async fn get_project(&self) -> Option<Project> {
            self.with_project.then(|| entity("show", None))
        }

        async fn get_episodes(&self, project: &Project) -> Option<Vec<Episode>> {
            Some(vec![entity("ep01", Some(project)), entity("ep02", Some(project))])
        }

        async fn get_sequences(&self, episode: &Episode) -> Option<Vec<Sequence>> {
            if episode.id == "ep01" {
                Some(vec![entity("sq010", Some(episode))])
            } else {
                None
            }
        }

        async fn get_shots(&self, sequence: &Sequence) -> Option<Vec<Shot>> {
            Some(vec![
                entity("sh0010", Some(sequence)),
                entity("sh0020", Some(sequence)),
            ])
        }

        async fn get_ranges(&self, _shot: &Shot) -> Option<Vec<Range>> {
            None
        }
    }

    #[tokio::test]
    async fn test_build_with_provider_flattens_hierarchy() {
        let provider = StaticProvider { with_project: true };
        let context = EntityContext::build_with_provider(&provider).await.unwrap();
        assert_eq!(context.project.id, "show");
        assert_eq!(context.episodes.len(), 2);
        assert_eq!(context.sequences.len(), 1);
        assert_eq!(context.shots.len(), 2);
        assert!(context.ranges.is_empty());
    }

    #[tokio::test]
    async fn test_build_without_project_is_none() {
        let provider = StaticProvider {
            with_project: false,
        };
        assert!(EntityContext::build_with_provider(&provider).await.is_none());
    }

    #[test]
    fn test_flattened_data_children_override() {
        let mut project = entity("show", None);
        project.data.insert("fps".into(), serde_json::json!(24));
        project.data.insert("resolution".into(), serde_json::json!("2k"));
        let mut shot = entity("sh0010", Some(&project));
        shot.data.insert("fps".into(), serde_json::json!(48));

        let data = shot.flattened_data();
        assert_eq!(data["fps"], serde_json::json!(48));
        assert_eq!(data["resolution"], serde_json::json!("2k"));
        assert_eq!(shot.parent_hierarchy().len(), 2);
    }
}

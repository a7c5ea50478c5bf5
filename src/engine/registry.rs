//! Workflow registry.
//!
//! Catalog of immutable workflow definitions keyed by id. Stats are a pure
//! projection over the current map.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::WorkflowDefinition;

/// Errors raised by the registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Workflow '{0}' not found")]
    NotFound(String),

    #[error("Workflow '{workflow}' declares stage '{stage}' more than once")]
    DuplicateStage { workflow: String, stage: String },

    #[error("Stage '{stage}' of '{workflow}' runs '{target}', which is not in its subWorkflows list")]
    UndeclaredSubWorkflow {
        workflow: String,
        stage: String,
        target: String,
    },

    #[error("Workflow '{workflow}' is not an orchestrator and cannot run sub-workflows (stage '{stage}')")]
    SubWorkflowNotAllowed { workflow: String, stage: String },

    #[error("Workflow '{workflow}' has no stages")]
    NoStages { workflow: String },
}

/// Aggregate counts over registered workflows
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub by_category: BTreeMap<String, usize>,
    pub by_trigger: BTreeMap<String, usize>,
    pub orchestrators: usize,
}

/// In-memory workflow catalog
#[derive(Debug, Default)]
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under `id`. An existing entry is replaced.
    pub fn register(&self, id: impl Into<String>, definition: WorkflowDefinition) -> Result<(), RegistryError> {
        let id = id.into();
        validate(&definition)?;

        let mut workflows = self.workflows.write().unwrap_or_else(|e| e.into_inner());
        if workflows.insert(id.clone(), Arc::new(definition)).is_some() {
            debug!(workflow = %id, "Replaced workflow definition");
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<WorkflowDefinition>, RegistryError> {
        let workflows = self.workflows.read().unwrap_or_else(|e| e.into_inner());
        workflows
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        let workflows = self.workflows.read().unwrap_or_else(|e| e.into_inner());
        workflows.contains_key(id)
    }

    /// All definitions, sorted by id
    pub fn list(&self) -> Vec<Arc<WorkflowDefinition>> {
        let workflows = self.workflows.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = workflows.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Definitions in one category, sorted by id
    pub fn get_by_category(&self, category: &str) -> Vec<Arc<WorkflowDefinition>> {
        self.list()
            .into_iter()
            .filter(|w| w.category == category)
            .collect()
    }

    /// Recompute totals from the current map
    pub fn stats(&self) -> RegistryStats {
        let workflows = self.workflows.read().unwrap_or_else(|e| e.into_inner());
        let mut stats = RegistryStats {
            total: workflows.len(),
            ..Default::default()
        };

        for workflow in workflows.values() {
            *stats.by_category.entry(workflow.category.clone()).or_insert(0) += 1;
            for kind in workflow.triggers.kinds() {
                *stats.by_trigger.entry(kind.to_string()).or_insert(0) += 1;
            }
            if workflow.is_orchestrator {
                stats.orchestrators += 1;
            }
        }
        stats
    }

    /// Load every `*.yaml` / `*.yml` definition in a directory.
    /// Returns the number of workflows registered.
    pub fn load_dir(&self, dir: &Path) -> anyhow::Result<usize> {
        let mut loaded = 0;

        for ext in ["yaml", "yml"] {
            let pattern = dir.join(format!("*.{}", ext));
            let pattern = pattern.to_string_lossy();

            for entry in glob::glob(&pattern).with_context(|| format!("Invalid glob: {}", pattern))? {
                let path = entry.context("Failed to read workflow directory entry")?;
                let definition = WorkflowDefinition::from_file(&path)?;
                let id = definition.id.clone();
                self.register(id.clone(), definition)
                    .with_context(|| format!("Rejected workflow file: {}", path.display()))?;
                debug!(workflow = %id, path = %path.display(), "Loaded workflow");
                loaded += 1;
            }
        }

        info!(count = loaded, dir = %dir.display(), "Workflows loaded");
        Ok(loaded)
    }
}

/// Structural checks applied at registration
fn validate(definition: &WorkflowDefinition) -> Result<(), RegistryError> {
    if definition.stages.is_empty() {
        return Err(RegistryError::NoStages {
            workflow: definition.id.clone(),
        });
    }

    let mut seen = HashSet::new();
    for stage in &definition.stages {
        if !seen.insert(stage.id.as_str()) {
            return Err(RegistryError::DuplicateStage {
                workflow: definition.id.clone(),
                stage: stage.id.clone(),
            });
        }

        if let Some(ref target) = stage.workflow {
            if !definition.is_orchestrator {
                return Err(RegistryError::SubWorkflowNotAllowed {
                    workflow: definition.id.clone(),
                    stage: stage.id.clone(),
                });
            }
            if !definition.sub_workflows.iter().any(|w| w == target) {
                return Err(RegistryError::UndeclaredSubWorkflow {
                    workflow: definition.id.clone(),
                    stage: stage.id.clone(),
                    target: target.clone(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(yaml: &str) -> WorkflowDefinition {
        WorkflowDefinition::from_yaml(yaml).unwrap()
    }

    const PACING: &str = r#"
id: pacing-check
name: Pacing Check
category: optimization
triggers: { manual: true, schedule: "0 9 * * *" }
stages:
  - { id: pull, name: Pull Delivery, agent: pacing }
"#;

    #[test]
    fn test_register_and_get() {
        let registry = WorkflowRegistry::new();
        registry.register("pacing-check", workflow(PACING)).unwrap();

        assert_eq!(registry.get("pacing-check").unwrap().name, "Pacing Check");
        assert!(matches!(registry.get("missing"), Err(RegistryError::NotFound(_))));
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = WorkflowRegistry::new();
        registry.register("pacing-check", workflow(PACING)).unwrap();

        let mut renamed = workflow(PACING);
        renamed.name = "Pacing Check v2".to_string();
        registry.register("pacing-check", renamed).unwrap();

        assert_eq!(registry.get("pacing-check").unwrap().name, "Pacing Check v2");
        assert_eq!(registry.stats().total, 1);
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let registry = WorkflowRegistry::new();
        let yaml = r#"
id: dup
name: Dup
stages:
  - { id: a, name: A }
  - { id: a, name: Again }
"#;
        assert!(matches!(
            registry.register("dup", workflow(yaml)),
            Err(RegistryError::DuplicateStage { .. })
        ));
    }

    #[test]
    fn test_sub_workflow_must_be_declared() {
        let registry = WorkflowRegistry::new();
        let yaml = r#"
id: parent
name: Parent
isOrchestrator: true
subWorkflows: [pacing-check]
stages:
  - { id: child, name: Child, workflow: brand-safety }
"#;
        assert!(matches!(
            registry.register("parent", workflow(yaml)),
            Err(RegistryError::UndeclaredSubWorkflow { .. })
        ));
    }

    #[test]
    fn test_stats_projection() {
        let registry = WorkflowRegistry::new();
        registry.register("pacing-check", workflow(PACING)).unwrap();
        registry
            .register(
                "launch",
                workflow(
                    r#"
id: launch
name: Launch
category: campaign
isOrchestrator: true
triggers: { manual: false, events: [brief_approved] }
stages:
  - { id: s, name: S }
"#,
                ),
            )
            .unwrap();

        let stats = registry.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_category["optimization"], 1);
        assert_eq!(stats.by_category["campaign"], 1);
        assert_eq!(stats.by_trigger["manual"], 1);
        assert_eq!(stats.by_trigger["scheduled"], 1);
        assert_eq!(stats.by_trigger["event"], 1);
        assert_eq!(stats.orchestrators, 1);

        assert_eq!(registry.get_by_category("campaign").len(), 1);
    }
}

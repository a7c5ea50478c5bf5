//! Stage executor contract.
//!
//! Stage executors are the external collaborators that do a stage's actual
//! work. Given the accumulated context they settle to a `StageOutcome` or
//! return an error, which the orchestrator turns into a failed stage.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::{Artifact, StageStatus};

/// Everything an executor gets to see
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageContext {
    pub execution_id: Uuid,
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub stage_id: String,
    pub stage_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,

    /// Effective run input
    pub input: Map<String, Value>,

    /// Outputs of earlier stages, keyed by stage id
    pub previous: Map<String, Value>,

    /// Fan-out branch label, when running one branch of a fan-out stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
}

impl StageContext {
    /// Same context narrowed to one fan-out branch
    pub fn for_branch(&self, branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            ..self.clone()
        }
    }
}

/// How an executor says a stage went
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    Warning,
}

impl From<OutcomeStatus> for StageStatus {
    fn from(status: OutcomeStatus) -> Self {
        match status {
            OutcomeStatus::Completed => StageStatus::Completed,
            OutcomeStatus::Failed => StageStatus::Failed,
            OutcomeStatus::Warning => StageStatus::Warning,
        }
    }
}

/// Settled result of one stage (or branch)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub status: OutcomeStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl StageOutcome {
    pub fn completed(output: Value) -> Self {
        Self {
            status: OutcomeStatus::Completed,
            output: Some(output),
            error: None,
            artifacts: Vec::new(),
        }
    }

    pub fn warning(output: Value, error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Warning,
            output: Some(output),
            error: Some(error.into()),
            artifacts: Vec::new(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            output: None,
            error: Some(error.into()),
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Interpret a collaborator's JSON response.
    ///
    /// A body shaped like an outcome (`{status, output?, error?}`) is taken
    /// as-is; anything else is the output of a completed stage.
    pub fn from_response(body: Value) -> Self {
        let looks_like_outcome = body
            .as_object()
            .map(|o| o.contains_key("status"))
            .unwrap_or(false);

        if looks_like_outcome {
            if let Ok(outcome) = serde_json::from_value::<StageOutcome>(body.clone()) {
                return outcome;
            }
        }
        Self::completed(body)
    }
}

/// Trait for stage executors
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Run a stage (or one branch of it, when `ctx.branch` is set)
    async fn execute(&self, ctx: &StageContext) -> Result<StageOutcome>;
}

/// Lookup table from stages to executors
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    by_stage: HashMap<(String, String), Arc<dyn StageExecutor>>,
    by_agent: HashMap<String, Arc<dyn StageExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor for every stage owned by `agent`
    pub fn register_agent(&mut self, agent: impl Into<String>, executor: Arc<dyn StageExecutor>) {
        self.by_agent.insert(agent.into(), executor);
    }

    /// Executor for one specific stage, taking precedence over the agent's
    pub fn register_stage(
        &mut self,
        workflow_id: impl Into<String>,
        stage_id: impl Into<String>,
        executor: Arc<dyn StageExecutor>,
    ) {
        self.by_stage
            .insert((workflow_id.into(), stage_id.into()), executor);
    }

    pub fn resolve(&self, workflow_id: &str, stage_id: &str, agent: Option<&str>) -> Option<Arc<dyn StageExecutor>> {
        self.by_stage
            .get(&(workflow_id.to_string(), stage_id.to_string()))
            .or_else(|| agent.and_then(|a| self.by_agent.get(a)))
            .cloned()
    }

    pub fn agents(&self) -> Vec<&str> {
        let mut agents: Vec<&str> = self.by_agent.keys().map(String::as_str).collect();
        agents.sort_unstable();
        agents
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("stages", &self.by_stage.len())
            .field("agents", &self.agents())
            .finish()
    }
}

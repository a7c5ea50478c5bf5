//! Workflow definitions.
//!
//! A workflow is an immutable, versioned template: trigger metadata, an input
//! schema, declared outputs and an ordered list of stages. Definitions are
//! written in YAML and registered once at startup.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A complete workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Workflow id (registry key)
    pub id: String,

    /// Human-readable name
    pub name: String,

    /// Category used for grouping in the dashboard
    #[serde(default)]
    pub category: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// How the workflow may be triggered
    #[serde(default)]
    pub triggers: TriggerSpec,

    /// Connectors that must be configured for the workflow to run
    #[serde(default)]
    pub required_connectors: Vec<String>,

    #[serde(default)]
    pub optional_connectors: Vec<String>,

    /// Input schema (field name -> field spec)
    #[serde(default)]
    pub inputs: BTreeMap<String, InputField>,

    /// Fields this workflow promises in its result
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Ordered list of stages to execute
    pub stages: Vec<StageDefinition>,

    /// Free-form estimate shown to operators (e.g. "5-10 min")
    #[serde(default)]
    pub estimated_duration: Option<String>,

    /// Orchestrator workflows may run other workflows as stages
    #[serde(default)]
    pub is_orchestrator: bool,

    /// Workflows an orchestrator is allowed to invoke
    #[serde(default)]
    pub sub_workflows: Vec<String>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl WorkflowDefinition {
    /// Load a workflow from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid workflow file: {}", path.display()))
    }

    /// Parse a workflow from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse workflow YAML")
    }

    /// Get a stage by id
    pub fn stage(&self, id: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.id == id)
    }

    /// Check params against the input schema.
    ///
    /// Returns the effective input (params plus declared defaults) or every
    /// problem found. A missing required field is always a problem; a type
    /// mismatch is only reported for the primitive JSON type names.
    pub fn validate_input(&self, params: &Map<String, Value>) -> Result<Map<String, Value>, Vec<InputProblem>> {
        let mut effective = params.clone();
        let mut problems = Vec::new();

        for (name, field) in &self.inputs {
            match params.get(name) {
                None | Some(Value::Null) => {
                    if field.required {
                        problems.push(InputProblem::Missing { field: name.clone() });
                    } else if let Some(default) = &field.default {
                        effective.insert(name.clone(), default.clone());
                    }
                }
                Some(value) => {
                    if !field.accepts(value) {
                        problems.push(InputProblem::WrongType {
                            field: name.clone(),
                            expected: field.field_type.clone(),
                            found: json_type_name(value).to_string(),
                        });
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(effective)
        } else {
            Err(problems)
        }
    }
}

/// Trigger metadata for a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    #[serde(default = "default_manual")]
    pub manual: bool,

    /// Cron-like schedule expression
    #[serde(default)]
    pub schedule: Option<String>,

    /// Names of events that trigger this workflow
    #[serde(default)]
    pub events: Vec<String>,
}

fn default_manual() -> bool {
    true
}

impl Default for TriggerSpec {
    fn default() -> Self {
        Self {
            manual: true,
            schedule: None,
            events: Vec::new(),
        }
    }
}

impl TriggerSpec {
    /// Trigger kinds this spec enables ("manual", "scheduled", "event")
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds = Vec::new();
        if self.manual {
            kinds.push("manual");
        }
        if self.schedule.is_some() {
            kinds.push("scheduled");
        }
        if !self.events.is_empty() {
            kinds.push("event");
        }
        kinds
    }
}

/// Schema entry for a single input field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputField {
    #[serde(rename = "type", default = "default_field_type")]
    pub field_type: String,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub description: Option<String>,
}

fn default_field_type() -> String {
    "string".to_string()
}

impl InputField {
    fn accepts(&self, value: &Value) -> bool {
        match self.field_type.as_str() {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            // Domain types (date, currency, ...) are the executor's concern
            _ => true,
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A single problem found while validating workflow input
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputProblem {
    #[error("missing required input '{field}'")]
    Missing { field: String },

    #[error("input '{field}' should be {expected}, got {found}")]
    WrongType {
        field: String,
        expected: String,
        found: String,
    },
}

/// A single stage of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageDefinition {
    /// Stage id (unique within the workflow)
    pub id: String,

    /// Display name
    pub name: String,

    /// Agent that owns this stage
    #[serde(default)]
    pub agent: Option<String>,

    /// Run another workflow as this stage (orchestrator workflows only)
    #[serde(default)]
    pub workflow: Option<String>,

    /// Launch one branch per item and join them
    #[serde(default)]
    pub fan_out: Option<FanOutSpec>,

    /// Ceiling enforced by the orchestrator on top of the executor's own
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl StageDefinition {
    pub fn kind(&self) -> StageKind {
        if self.workflow.is_some() {
            StageKind::SubWorkflow
        } else if self.fan_out.is_some() {
            StageKind::FanOut
        } else {
            StageKind::Single
        }
    }
}

/// How a stage is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Single,
    FanOut,
    SubWorkflow,
}

/// Branch source for a fan-out stage
///
/// Supports two YAML forms:
/// - Static: `fanOut: { branches: [ttd, dv360] }`
/// - From input: `fanOut: { branchesFrom: platforms }`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanOutSpec {
    #[serde(default)]
    pub branches: Vec<String>,

    #[serde(default)]
    pub branches_from: Option<String>,
}

impl FanOutSpec {
    /// Resolve branch labels against the run input. Falls back to the static
    /// list when the input field is absent or not an array.
    pub fn resolve(&self, input: &Map<String, Value>) -> Vec<String> {
        let from_input = self
            .branches_from
            .as_ref()
            .and_then(|field| input.get(field))
            .and_then(Value::as_array);

        match from_input {
            Some(items) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            None => self.branches.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CAMPAIGN_YAML: &str = r#"
id: campaign-launch
name: Campaign Launch
category: campaign
triggers:
  manual: true
  events: [brief_approved]
inputs:
  campaignName:
    type: string
    required: true
  budget:
    type: number
    required: true
  platforms:
    type: array
    default: [ttd, dv360]
outputs: [launched]
stages:
  - id: brief
    name: Validate Brief
    agent: media-planner
  - id: launch
    name: Launch on DSPs
    agent: trader
    fanOut:
      branchesFrom: platforms
"#;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_workflow_parsing() {
        let wf = WorkflowDefinition::from_yaml(CAMPAIGN_YAML).unwrap();

        assert_eq!(wf.id, "campaign-launch");
        assert_eq!(wf.version, "1.0.0");
        assert_eq!(wf.stages.len(), 2);
        assert_eq!(wf.stages[1].kind(), StageKind::FanOut);
        assert_eq!(wf.triggers.kinds(), vec!["manual", "event"]);
        assert!(!wf.is_orchestrator);
    }

    #[test]
    fn test_missing_required_input() {
        let wf = WorkflowDefinition::from_yaml(CAMPAIGN_YAML).unwrap();
        let problems = wf
            .validate_input(&params(json!({ "campaignName": "Q3" })))
            .unwrap_err();

        assert_eq!(
            problems,
            vec![InputProblem::Missing {
                field: "budget".to_string()
            }]
        );
    }

    #[test]
    fn test_defaults_applied() {
        let wf = WorkflowDefinition::from_yaml(CAMPAIGN_YAML).unwrap();
        let input = wf
            .validate_input(&params(json!({ "campaignName": "Q3", "budget": 5000 })))
            .unwrap();

        assert_eq!(input["platforms"], json!(["ttd", "dv360"]));
    }

    #[test]
    fn test_wrong_type_reported() {
        let wf = WorkflowDefinition::from_yaml(CAMPAIGN_YAML).unwrap();
        let problems = wf
            .validate_input(&params(json!({ "campaignName": "Q3", "budget": "lots" })))
            .unwrap_err();

        assert!(matches!(
            &problems[0],
            InputProblem::WrongType { field, .. } if field == "budget"
        ));
    }

    #[test]
    fn test_fan_out_resolution() {
        let spec = FanOutSpec {
            branches: vec!["fallback".to_string()],
            branches_from: Some("platforms".to_string()),
        };

        let from_input = spec.resolve(&params(json!({ "platforms": ["ttd", "amazon", "dv360"] })));
        assert_eq!(from_input, vec!["ttd", "amazon", "dv360"]);

        let fallback = spec.resolve(&params(json!({})));
        assert_eq!(fallback, vec!["fallback"]);
    }
}

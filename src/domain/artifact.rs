//! Artifacts produced by workflow stages.
//!
//! Stage executors may hand back artifacts (reports, trafficking sheets,
//! links to external documents); the orchestrator appends them to the
//! execution record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An artifact produced by a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Stage that produced this artifact (filled in by the orchestrator)
    #[serde(default)]
    pub stage_id: String,

    pub name: String,

    #[serde(default)]
    pub artifact_type: ArtifactType,

    /// Where the artifact lives (URL or path), if external
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(name: impl Into<String>, artifact_type: ArtifactType) -> Self {
        Self {
            stage_id: String::new(),
            name: name.into(),
            artifact_type,
            location: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// Kinds of artifacts a stage can produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactType {
    Report,

    Document,

    /// Creative asset (banner, video, design frame)
    Creative,

    /// Structured data export
    Data,

    /// Reference to an item in an external system (task, ticket, file)
    ExternalReference,
}

impl Default for ArtifactType {
    fn default() -> Self {
        Self::Document
    }
}

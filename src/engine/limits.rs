//! Run limits and enforcement.
//!
//! Prevents runaway execution through configurable limits on:
//! - Sub-workflow nesting depth
//! - Fan-out branch count
//! - Serialized input size

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Limits applied to every run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLimits {
    /// Maximum sub-workflow nesting (default: 3)
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Maximum branches per fan-out stage (default: 32)
    #[serde(default = "default_max_branches")]
    pub max_branches: usize,

    /// Maximum serialized input size in bytes (default: 1MB)
    #[serde(default = "default_max_input_bytes")]
    pub max_input_bytes: u64,
}

fn default_max_depth() -> u32 {
    3
}
fn default_max_branches() -> usize {
    32
}
fn default_max_input_bytes() -> u64 {
    1024 * 1024
} // 1MB

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            max_branches: default_max_branches(),
            max_input_bytes: default_max_input_bytes(),
        }
    }
}

impl RunLimits {
    /// Validate run params against the size limit
    pub fn check_input(&self, params: &Map<String, Value>) -> Result<(), LimitViolation> {
        // A Map always serializes
        let size = serde_json::to_vec(params).map(|b| b.len() as u64).unwrap_or(0);
        if size > self.max_input_bytes {
            return Err(LimitViolation::MaxInputBytes {
                actual: size,
                limit: self.max_input_bytes,
            });
        }
        Ok(())
    }

    /// Check nesting depth before running a sub-workflow at `depth`
    pub fn check_depth(&self, depth: u32) -> Result<(), LimitViolation> {
        if depth > self.max_depth {
            return Err(LimitViolation::MaxDepth {
                actual: depth,
                limit: self.max_depth,
            });
        }
        Ok(())
    }

    pub fn check_branches(&self, count: usize) -> Result<(), LimitViolation> {
        if count > self.max_branches {
            return Err(LimitViolation::MaxBranches {
                actual: count,
                limit: self.max_branches,
            });
        }
        Ok(())
    }
}

/// Limit violation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitViolation {
    #[error("Maximum sub-workflow depth exceeded: {actual} > {limit}")]
    MaxDepth { actual: u32, limit: u32 },

    #[error("Maximum fan-out branches exceeded: {actual} > {limit}")]
    MaxBranches { actual: usize, limit: usize },

    #[error("Maximum input bytes exceeded: {actual} > {limit}")]
    MaxInputBytes { actual: u64, limit: u64 },
}

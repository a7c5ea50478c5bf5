//! Adapters for external collaborators.
//!
//! Connectors configured per agent become stage executors:
//! - `command`: subprocess speaking JSON over stdin/stdout
//! - `http`: JSON POST to an agent endpoint
//!
//! HTTP connectors can also receive inter-agent messages.

pub mod command;
pub mod http;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{CommunicationBus, ExecutorRegistry};

pub use command::CommandExecutor;
pub use http::{message_forwarder, HttpExecutor};

/// How to reach one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectorConfig {
    Http {
        url: String,

        /// Environment variable holding a bearer token
        #[serde(default)]
        token_env: Option<String>,

        #[serde(default = "default_timeout")]
        timeout_seconds: u64,

        /// Also forward inter-agent messages addressed to this agent
        #[serde(default)]
        receive_messages: bool,
    },
    Command {
        command: String,

        #[serde(default)]
        args: Vec<String>,

        #[serde(default = "default_timeout")]
        timeout_seconds: u64,
    },
}

fn default_timeout() -> u64 {
    300
} // 5 min

impl ConnectorConfig {
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Http { timeout_seconds, .. } | Self::Command { timeout_seconds, .. } => {
                Duration::from_secs(*timeout_seconds)
            }
        }
    }
}

/// Build one executor per configured agent
pub fn build_executors(connectors: &BTreeMap<String, ConnectorConfig>) -> Result<ExecutorRegistry> {
    let mut registry = ExecutorRegistry::new();

    for (agent, connector) in connectors {
        match connector {
            ConnectorConfig::Http { url, token_env, .. } => {
                let token = match token_env {
                    Some(var) => Some(
                        std::env::var(var)
                            .with_context(|| format!("{} environment variable required for agent '{}'", var, agent))?,
                    ),
                    None => None,
                };
                let executor = HttpExecutor::new(agent.clone(), url.clone(), connector.timeout()).with_token(token);
                registry.register_agent(agent.clone(), Arc::new(executor));
            }
            ConnectorConfig::Command { command, args, .. } => {
                let executor = CommandExecutor::new(agent.clone(), command.clone(), args.clone(), connector.timeout());
                registry.register_agent(agent.clone(), Arc::new(executor));
            }
        }
        debug!(%agent, "Connector registered");
    }

    Ok(registry)
}

/// Subscribe every message-receiving HTTP connector to the bus.
/// Returns the agent ids subscribed.
pub fn subscribe_agents(bus: &CommunicationBus, connectors: &BTreeMap<String, ConnectorConfig>) -> Vec<String> {
    let mut subscribed = Vec::new();

    for (agent, connector) in connectors {
        if let ConnectorConfig::Http {
            url,
            receive_messages: true,
            ..
        } = connector
        {
            let handler = message_forwarder(format!("{}/messages", url.trim_end_matches('/')), connector.timeout());
            bus.subscribe(agent.clone(), move |message| handler(message));
            subscribed.push(agent.clone());
        }
    }
    subscribed
}

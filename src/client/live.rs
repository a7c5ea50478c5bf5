//! Live SSE client.
//!
//! Follows one execution over `/api/stream`. The channel is a tail with no
//! replay, so every (re)connect opens the stream first, then pulls the
//! authoritative snapshot and only then applies live events on top of it.

use anyhow::{Context, Result};
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::{ExecutionRecord, LiveFrame};

use super::backoff::{Backoff, ReconnectPolicy};
use super::view::ExecutionView;

/// Incremental parser for `text/event-stream` bodies.
///
/// Chunks may split lines anywhere, including inside a multi-byte character,
/// so raw bytes are buffered and only complete lines are decoded. Complete
/// events are returned as their joined `data:` payloads. Comments and other
/// fields are ignored.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: impl AsRef<[u8]>) -> Vec<String> {
        self.buffer.extend_from_slice(chunk.as_ref());
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = match String::from_utf8(raw) {
                Ok(line) => line,
                Err(e) => {
                    debug!(error = %e, "Dropping non UTF-8 stream line");
                    continue;
                }
            };
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(self.data.join("\n"));
                    self.data.clear();
                }
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        events
    }
}

/// Client for a running adops server
#[derive(Debug, Clone)]
pub struct LiveClient {
    http: reqwest::Client,
    base_url: String,
    policy: ReconnectPolicy,
}

impl LiveClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            policy: ReconnectPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Fetch the authoritative record
    pub async fn snapshot(&self, workflow_id: &str, execution_id: Uuid) -> Result<ExecutionRecord> {
        let url = format!(
            "{}/api/workflows/{}/executions/{}",
            self.base_url, workflow_id, execution_id
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?
            .error_for_status()
            .with_context(|| format!("Execution {} not available", execution_id))?;

        response
            .json()
            .await
            .context("Failed to decode execution record")
    }

    /// Follow an execution until it reaches a terminal status.
    ///
    /// `on_update` sees the view after every resync and every applied event.
    pub async fn watch<F>(&self, workflow_id: &str, execution_id: Uuid, mut on_update: F) -> Result<ExecutionRecord>
    where
        F: FnMut(&ExecutionView),
    {
        // Unknown executions fail fast instead of retrying forever
        let first = self.snapshot(workflow_id, execution_id).await?;
        let mut view = ExecutionView::from_snapshot(first);
        on_update(&view);
        if view.is_terminal() {
            return Ok(view.into_record());
        }

        let mut backoff = Backoff::new(self.policy.clone());
        loop {
            match self.follow(workflow_id, &mut view, &mut backoff, &mut on_update).await {
                Ok(true) => return Ok(view.into_record()),
                Ok(false) => debug!(%execution_id, "Live stream closed"),
                Err(e) => warn!(%execution_id, error = %format!("{:#}", e), "Live stream dropped"),
            }

            let delay = backoff.next_delay();
            info!(attempt = backoff.attempts(), delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::time::sleep(delay).await;
        }
    }

    /// One connection: returns Ok(true) once the view is terminal, Ok(false)
    /// if the server closed the stream.
    async fn follow<F>(
        &self,
        workflow_id: &str,
        view: &mut ExecutionView,
        backoff: &mut Backoff,
        on_update: &mut F,
    ) -> Result<bool>
    where
        F: FnMut(&ExecutionView),
    {
        let url = format!("{}/api/stream", self.base_url);
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .with_context(|| format!("Failed to connect to {}", url))?
            .error_for_status()?;

        // Stream is open: anything emitted from here on reaches us, so the
        // snapshot can't miss an event in between
        view.resync(self.snapshot(workflow_id, view.execution_id()).await?);
        backoff.reset();
        on_update(view);
        if view.is_terminal() {
            return Ok(true);
        }

        let mut parser = SseParser::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("Live stream read failed")?;
            for data in parser.push(&chunk) {
                let frame: LiveFrame = match serde_json::from_str(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(error = %e, "Ignoring unparsable frame");
                        continue;
                    }
                };
                if let LiveFrame::Event(event) = frame {
                    if view.apply(&event) {
                        on_update(view);
                    }
                }
                if view.is_terminal() {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_handles_split_chunks() {
        let mut parser = SseParser::new();

        assert!(parser.push("data: {\"a\":").is_empty());
        assert!(parser.push("1}\n").is_empty());
        assert_eq!(parser.push("\n"), vec!["{\"a\":1}"]);
    }

    #[test]
    fn test_parser_ignores_keep_alive_comments() {
        let mut parser = SseParser::new();
        let events = parser.push(":\n\ndata: one\n\n: ping\n\ndata: two\r\n\r\n");

        assert_eq!(events, vec!["one", "two"]);
    }

    #[test]
    fn test_parser_keeps_characters_split_across_chunks() {
        let frame = serde_json::to_string(&serde_json::json!({
            "type": "agent_message",
            "data": { "payload": "café budget" },
        }))
        .unwrap();
        let wire = format!("data: {}\n\n", frame).into_bytes();
        let split = wire.iter().position(|&b| b == 0xC3).unwrap() + 1;

        let mut parser = SseParser::new();
        assert!(parser.push(&wire[..split]).is_empty());
        let events = parser.push(&wire[split..]);

        assert_eq!(events.len(), 1);
        let decoded: serde_json::Value = serde_json::from_str(&events[0]).unwrap();
        assert_eq!(decoded["data"]["payload"], "café budget");
    }

    #[test]
    fn test_parser_joins_multiline_data() {
        let mut parser = SseParser::new();
        assert_eq!(parser.push("data: a\ndata: b\n\n"), vec!["a\nb"]);
    }
}

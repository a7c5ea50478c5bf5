//! HTTP Surface Integration Tests
//!
//! Serves the router on an ephemeral port and drives it over real HTTP:
//! run requests, snapshots, the SSE tail via `LiveClient`, and agent
//! messaging with session budgets.

use std::sync::Arc;
use std::time::Duration;

use adops::client::{LiveClient, ReconnectPolicy};
use adops::domain::{ExecutionRecord, ExecutionStatus, StageStatus, WorkflowDefinition};
use adops::engine::{
    CommunicationBus, EventBus, ExecutionStore, ExecutorRegistry, Orchestrator, StageContext, StageExecutor,
    StageOutcome, WorkflowRegistry,
};
use adops::server::{self, AppState};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

const PACING_CHECK: &str = r#"
id: pacing-check
name: Daily Pacing Check
category: optimization
inputs:
  campaignId:
    type: string
    required: true
stages:
  - id: pull
    name: Pull Delivery
    agent: pacing
  - id: analyze
    name: Analyze Pacing
    agent: analyst
"#;

/// Takes long enough for a watcher to attach mid-run
struct Delayed;

#[async_trait]
impl StageExecutor for Delayed {
    fn name(&self) -> &str {
        "delayed"
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutcome> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(StageOutcome::completed(json!({ "stage": ctx.stage_id })))
    }
}

struct TestServer {
    _temp: TempDir,
    base_url: String,
    http: reqwest::Client,
}

async fn spawn_server() -> TestServer {
    let temp = TempDir::new().unwrap();
    let events = Arc::new(EventBus::open(temp.path().join("events.jsonl"), 256).unwrap());
    let messages = Arc::new(
        CommunicationBus::open(temp.path().join("messages.jsonl"), 10)
            .unwrap()
            .with_events(events.clone()),
    );

    let registry = Arc::new(WorkflowRegistry::new());
    registry
        .register("pacing-check", WorkflowDefinition::from_yaml(PACING_CHECK).unwrap())
        .unwrap();
    let mut executors = ExecutorRegistry::new();
    executors.register_agent("pacing", Arc::new(Delayed));
    executors.register_agent("analyst", Arc::new(Delayed));

    let orchestrator = Orchestrator::new(registry, Arc::new(ExecutionStore::new()), events.clone(), executors);
    let app = server::app(AppState::new(orchestrator, events, messages));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        _temp: temp,
        base_url: format!("http://{}", addr),
        http: reqwest::Client::new(),
    }
}

impl TestServer {
    async fn get(&self, path: &str) -> reqwest::Response {
        self.http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.http
            .post(format!("{}{}", self.base_url, path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_health_and_catalog() {
    let server = spawn_server().await;

    let health: Value = server.get("/api/health").await.json().await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["workflows"], 1);

    let workflows: Value = server.get("/api/workflows").await.json().await.unwrap();
    assert_eq!(workflows[0]["id"], "pacing-check");

    let stats: Value = server.get("/api/workflows/stats").await.json().await.unwrap();
    assert_eq!(stats["byCategory"]["optimization"], 1);

    assert_eq!(server.get("/api/workflows/nope").await.status(), 404);
}

#[tokio::test]
async fn test_invalid_input_returns_400_with_execution_id() {
    let server = spawn_server().await;

    let response = server
        .post("/api/workflows/run", json!({ "workflowId": "pacing-check", "params": {} }))
        .await;
    assert_eq!(response.status(), 400);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    let execution_id = body["executionId"].as_str().unwrap();

    let record: ExecutionRecord = server
        .get(&format!("/api/workflows/pacing-check/executions/{}", execution_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(record.status, ExecutionStatus::Failed);
    assert!(record.stages.is_empty());
}

#[tokio::test]
async fn test_unknown_workflow_returns_404() {
    let server = spawn_server().await;

    let response = server
        .post("/api/workflows/run", json!({ "workflowId": "nope", "params": {} }))
        .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_run_and_watch_over_sse() {
    let server = spawn_server().await;

    let response = server
        .post(
            "/api/workflows/run",
            json!({ "workflowId": "pacing-check", "params": { "campaignId": "cmp-1" } }),
        )
        .await;
    assert_eq!(response.status(), 202);
    let accepted: Value = response.json().await.unwrap();
    assert_eq!(accepted["eventsUrl"], "/api/stream");
    let execution_id: Uuid = serde_json::from_value(accepted["executionId"].clone()).unwrap();

    let client = LiveClient::new(&server.base_url).with_policy(ReconnectPolicy {
        initial_delay_ms: 50,
        max_delay_ms: 200,
        multiplier: 2.0,
    });
    let mut updates = 0;
    let watched = tokio::time::timeout(
        Duration::from_secs(10),
        client.watch("pacing-check", execution_id, |_| updates += 1),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(watched.status, ExecutionStatus::Completed);
    assert!(updates >= 2);

    let snapshot: ExecutionRecord = server
        .get(&format!("/api/workflows/pacing-check/executions/{}", execution_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot.status, ExecutionStatus::Completed);
    let stage_statuses: Vec<_> = watched.stages.iter().map(|s| s.status).collect();
    assert_eq!(stage_statuses, vec![StageStatus::Completed, StageStatus::Completed]);
    assert_eq!(
        stage_statuses,
        snapshot.stages.iter().map(|s| s.status).collect::<Vec<_>>()
    );

    let history: Vec<ExecutionRecord> = server
        .get("/api/workflows/pacing-check/executions?limit=5")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(history.len(), 1);

    let stats: Value = server.get("/api/events/stats").await.json().await.unwrap();
    assert_eq!(stats["byType"]["execution_completed"], 1);
}

#[tokio::test]
async fn test_agent_messages_and_session_budget() {
    let server = spawn_server().await;

    let created = server
        .post("/api/agents/sessions", json!({ "queryId": "q-7", "maxMessages": 2 }))
        .await;
    assert_eq!(created.status(), 201);

    for text in ["first", "second"] {
        let response = server
            .post(
                "/api/agents/messages",
                json!({ "from": "pacing", "to": "analyst", "message": text, "queryId": "q-7" }),
            )
            .await;
        assert_eq!(response.status(), 200);
        let sent: Value = response.json().await.unwrap();
        assert_eq!(sent["delivered"], false);
        assert_eq!(sent["message"]["payload"], text);
    }

    let over = server
        .post(
            "/api/agents/messages",
            json!({ "from": "pacing", "to": "analyst", "message": "third", "queryId": "q-7" }),
        )
        .await;
    assert_eq!(over.status(), 429);

    let logged: Vec<Value> = server
        .get("/api/agents/messages?queryId=q-7")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(logged.len(), 2);

    let ended: Value = server
        .http
        .delete(format!("{}/api/agents/sessions/q-7", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(ended["count"], 2);
    assert_eq!(server.get("/api/agents/sessions/q-7").await.status(), 404);
}

//! `POST /api/<category>/rpc/<Method>`: JSON in, `{"result": ...}` or
//! `{"error": {...}}` out.
//!
//! `internal` methods serve the dashboard; `apps` methods are what app code
//! calls to use topics and spawn helper processes.

use std::{collections::BTreeMap, path::PathBuf, time::Instant};

use axum::{
    Extension, Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kestrel_agent::error::Classify;
use kestrel_process::{HealthCheckSpec, Identity, ProcessConfig};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::Instrument;

use crate::{error::ApiError, request_meta::RequestMeta, state::AppState};

pub const INTERNAL: &str = "internal";
pub const APPS: &str = "apps";

/// Category under which app-spawned helper processes live.
const APP_SPAWNED: &str = "app-spawned";

type RpcResult = Result<Response, ApiError>;

#[derive(Serialize)]
struct Envelope<T> {
    result: T,
}

fn ok<T: Serialize>(result: T) -> RpcResult {
    Ok(Json(Envelope { result }).into_response())
}

fn fail<E>(err: E) -> ApiError
where
    E: Classify + std::error::Error + 'static,
{
    ApiError::classified(&err)
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| ApiError::invalid_input(format!("invalid input: {e}")))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessIdInput {
    process_id: Identity,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppIdInput {
    app_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunAppMethodInput {
    app_id: String,
    server_file: String,
    method_name: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct TopicInput {
    id: Identity,
}

#[derive(Deserialize)]
struct PublishInput {
    id: Identity,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppProcessInput {
    app_id: String,
    process_key: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartProcessInput {
    app_id: String,
    process_key: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    work_dir: Option<PathBuf>,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    health_check: Option<HealthCheckSpec>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpawnedProcess {
    process_id: Identity,
    pid: u32,
    already_running: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessHealth {
    process_id: Identity,
    is_alive: bool,
    is_healthy: bool,
}

fn app_process_id(app_id: &str, process_key: &str) -> Result<Identity, ApiError> {
    if app_id.trim().is_empty() {
        return Err(ApiError::invalid_input("appId is required"));
    }
    if process_key.trim().is_empty() {
        return Err(ApiError::invalid_input("processKey is required"));
    }
    Ok(Identity::from_parts([APP_SPAWNED, app_id], process_key))
}

/// The daemon answers `{"type": "success", "result": ...}` or
/// `{"type": "error", "error": "..."}`.
fn app_method_result(status_code: u16, body: &str) -> RpcResult {
    let parsed = serde_json::from_str::<Value>(body).ok();
    if status_code == 200 {
        let result = match parsed {
            Some(Value::Object(mut map)) if map.contains_key("result") => map.remove("result").unwrap_or(Value::Null),
            Some(other) => other,
            None => Value::String(body.to_string()),
        };
        return ok(result);
    }
    let message = parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string());
    Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "app_error", message)
        .with_hint(format!("app server answered with status {status_code}")))
}

async fn internal(state: &AppState, method: &str, body: &[u8]) -> RpcResult {
    match method {
        "ListProcesses" => ok(state.processes.statuses().await),
        "GetProcessLogs" => {
            let input: ProcessIdInput = parse(body)?;
            ok(state.processes.log_snapshot(&input.process_id).await.map_err(fail)?)
        }
        "KillProcess" => {
            let input: ProcessIdInput = parse(body)?;
            state.processes.kill(&input.process_id).await.map_err(fail)?;
            ok(serde_json::json!({}))
        }
        "GetTopicInfo" => ok(state.topics.snapshot()),
        "GetApps" => ok(state.compiler.list_apps().await.map_err(fail)?),
        "GetAppById" => {
            let input: AppIdInput = parse(body)?;
            ok(state.compiler.load_app(&input.app_id).await.map_err(fail)?)
        }
        "RestartApp" => {
            let input: AppIdInput = parse(body)?;
            state.compiler.restart_app(&input.app_id).await.map_err(fail)?;
            ok(serde_json::json!({}))
        }
        "StopApp" => {
            let input: AppIdInput = parse(body)?;
            state.compiler.stop_server(&input.app_id).await.map_err(fail)?;
            ok(serde_json::json!({}))
        }
        "ResetAppCache" => {
            let input: AppIdInput = parse(body)?;
            let reset = state.compiler.reset_app_cache(&input.app_id);
            ok(serde_json::json!({ "reset": reset }))
        }
        "RunAppMethod" => {
            let input: RunAppMethodInput = parse(body)?;
            let resp = state
                .compiler
                .run_app_method(&input.app_id, &input.server_file, &input.method_name, input.data)
                .await
                .map_err(fail)?;
            app_method_result(resp.status_code, &resp.body)
        }
        other => Err(ApiError::unknown_method(INTERNAL, other)),
    }
}

async fn apps(state: &AppState, method: &str, body: &[u8]) -> RpcResult {
    match method {
        "GetTopics" => {
            let snapshot = state.topics.snapshot();
            let ids: Vec<Identity> = snapshot
                .topics
                .into_values()
                .filter(|t| !t.closed)
                .map(|t| t.id)
                .collect();
            ok(ids)
        }
        "CreateTopic" => {
            let input: TopicInput = parse(body)?;
            let topic = state.topics.create_topic::<Value>(&input.id).map_err(fail)?;
            ok(topic.info())
        }
        "PublishTopic" => {
            let input: PublishInput = parse(body)?;
            let topic = state.topics.topic::<Value>(&input.id).map_err(fail)?;
            // Publishing to a closed topic is a no-op.
            topic.publish(input.data).await;
            ok(topic.info())
        }
        "StartProcess" => {
            let input: StartProcessInput = parse(body)?;
            let id = app_process_id(&input.app_id, &input.process_key)?;
            let mut config = ProcessConfig::new(id, input.command);
            config.args = input.args;
            config.env = input.env;
            config.work_dir = input.work_dir;
            config.port = input.port;
            config.health_check = input.health_check;

            let outcome = state.processes.spawn_from_path_var(config).await.map_err(fail)?;
            let already_running = outcome.already_running();
            let record = outcome.into_record();
            ok(SpawnedProcess {
                process_id: record.id,
                pid: record.pid,
                already_running,
            })
        }
        "StopProcess" => {
            let input: AppProcessInput = parse(body)?;
            let id = app_process_id(&input.app_id, &input.process_key)?;
            state.processes.kill(&id).await.map_err(fail)?;
            ok(serde_json::json!({}))
        }
        "CheckProcessHealth" => {
            let input: AppProcessInput = parse(body)?;
            let id = app_process_id(&input.app_id, &input.process_key)?;
            let is_alive = state.processes.is_alive(&id).await;
            let is_healthy = is_alive && state.processes.check_health(&id).await;
            ok(ProcessHealth {
                process_id: id,
                is_alive,
                is_healthy,
            })
        }
        other => Err(ApiError::unknown_method(APPS, other)),
    }
}

pub async fn call(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    Path((category, method)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let span = tracing::info_span!(
        "rpc",
        request_id = %meta.request_id,
        category = %category,
        method = %method,
    );
    async move {
        let started = Instant::now();
        let result = match category.as_str() {
            INTERNAL => internal(&state, &method, &body).await,
            APPS => apps(&state, &method, &body).await,
            other => Err(ApiError::unknown_method(other, &method)),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(resp) => {
                tracing::debug!(elapsed_ms, "rpc ok");
                resp
            }
            Err(e) => {
                if e.status.is_server_error() {
                    tracing::warn!(elapsed_ms, code = %e.body.code, message = %e.body.message, "rpc failed");
                } else {
                    tracing::debug!(elapsed_ms, code = %e.body.code, "rpc rejected");
                }
                e.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use tower::ServiceExt;

    use super::*;
    use crate::test_support;

    async fn post(app: &axum::Router, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = app
            .clone()
            .oneshot(
                Request::post(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn unknown_methods_are_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = crate::router(test_support::state(dir.path()).await);

        let (status, body) = post(&app, "/api/internal/rpc/Nope", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "unknown_method");

        let (status, _) = post(&app, "/api/bogus/rpc/GetTopics", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_input_is_400() {
        let dir = tempfile::tempdir().unwrap();
        let app = crate::router(test_support::state(dir.path()).await);
        let (status, body) = post(
            &app,
            "/api/internal/rpc/KillProcess",
            serde_json::json!({ "processId": "not an object" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_input");
    }

    #[tokio::test]
    async fn topic_lifecycle_over_rpc() {
        let dir = tempfile::tempdir().unwrap();
        let app = crate::router(test_support::state(dir.path()).await);
        let id = serde_json::json!({ "category": "/app-topics/todo", "key": "events" });

        let (status, body) = post(&app, "/api/apps/rpc/CreateTopic", serde_json::json!({ "id": id })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["closed"], false);

        let (status, body) = post(&app, "/api/apps/rpc/CreateTopic", serde_json::json!({ "id": id })).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "already_exists");

        let (status, body) = post(
            &app,
            "/api/apps/rpc/PublishTopic",
            serde_json::json!({ "id": id, "data": { "n": 1 } }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["counter"], 1);

        let (_, body) = post(&app, "/api/apps/rpc/GetTopics", serde_json::json!({})).await;
        assert!(body["result"].as_array().unwrap().contains(&id));

        let (_, body) = post(&app, "/api/internal/rpc/GetTopicInfo", Value::Null).await;
        assert_eq!(body["result"]["globalCounter"], 1);

        let reserved = serde_json::json!({ "id": { "category": "/topics", "key": "mine" } });
        let (status, _) = post(&app, "/api/apps/rpc/CreateTopic", reserved).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let missing = serde_json::json!({ "id": { "category": "/x", "key": "y" }, "data": 1 });
        let (status, _) = post(&app, "/api/apps/rpc/PublishTopic", missing).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn killing_unknown_process_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = crate::router(test_support::state(dir.path()).await);
        let (status, body) = post(
            &app,
            "/api/internal/rpc/KillProcess",
            serde_json::json!({ "processId": { "category": "/app-spawned/todo", "key": "db" } }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "not_found");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn app_processes_start_check_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let app = crate::router(test_support::state(dir.path()).await);
        let start = serde_json::json!({
            "appId": "todo",
            "processKey": "sleeper",
            "command": "sh",
            "args": ["-c", "sleep 30"],
            "healthCheck": { "type": "process" },
        });

        let (status, body) = post(&app, "/api/apps/rpc/StartProcess", start.clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["alreadyRunning"], false);
        assert_eq!(body["result"]["processId"]["category"], "/app-spawned/todo");

        let (_, body) = post(&app, "/api/apps/rpc/StartProcess", start).await;
        assert_eq!(body["result"]["alreadyRunning"], true);

        let key = serde_json::json!({ "appId": "todo", "processKey": "sleeper" });
        let (_, body) = post(&app, "/api/apps/rpc/CheckProcessHealth", key.clone()).await;
        assert_eq!(body["result"]["isAlive"], true);
        assert_eq!(body["result"]["isHealthy"], true);

        let (_, body) = post(&app, "/api/internal/rpc/ListProcesses", serde_json::json!({})).await;
        assert_eq!(body["result"][0]["state"], "running");

        let (status, _) = post(&app, "/api/apps/rpc/StopProcess", key.clone()).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = post(&app, "/api/apps/rpc/StopProcess", key.clone()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = post(&app, "/api/apps/rpc/CheckProcessHealth", key).await;
        assert_eq!(body["result"]["isAlive"], false);
    }

    #[tokio::test]
    async fn app_processes_need_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let app = crate::router(test_support::state(dir.path()).await);
        let (status, _) = post(
            &app,
            "/api/apps/rpc/CheckProcessHealth",
            serde_json::json!({ "appId": "todo", "processKey": " " }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_app_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = crate::router(test_support::state(dir.path()).await);
        let (status, _) = post(&app, "/api/internal/rpc/GetAppById", serde_json::json!({ "appId": "nope" })).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = post(&app, "/api/internal/rpc/GetApps", serde_json::json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], serde_json::json!([]));
    }

    #[test]
    fn app_method_results_unwrap_the_envelope() {
        let resp = app_method_result(200, r#"{"type":"success","result":[1,2]}"#).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let err = app_method_result(500, r#"{"type":"error","error":"Error: boom"}"#).unwrap_err();
        assert_eq!(err.body.code, "app_error");
        assert_eq!(err.body.message, "Error: boom");

        let err = app_method_result(502, "bad gateway").unwrap_err();
        assert_eq!(err.body.message, "bad gateway");
    }
}

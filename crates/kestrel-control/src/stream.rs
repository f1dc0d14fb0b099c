//! `GET /api/websocket`: long-lived method calls multiplexed over one socket.
//!
//! The client sends `{"id", "kind": "call" | "cancel", "method", "data"}`.
//! Every call answers `methodStarted`, then any number of `methodOutput`
//! frames, then `methodDone` or `error`. Closing the socket cancels every
//! call still in flight.

use std::{collections::HashMap, time::Duration};

use axum::{
    Extension,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use kestrel_agent::error::format_error_chain;
use kestrel_process::Identity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{sync::mpsc, task::AbortHandle};
use tracing::Instrument;

use crate::{request_meta::RequestMeta, state::AppState};

const OUTBOUND_BUFFER: usize = 64;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct Inbound {
    #[serde(default)]
    id: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    method: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Outbound<'a> {
    #[serde(skip_serializing_if = "is_blank")]
    id: &'a str,
    kind: &'static str,
    #[serde(skip_serializing_if = "is_blank")]
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn is_blank(s: &&str) -> bool {
    s.is_empty()
}

impl Outbound<'_> {
    fn into_message(self) -> Message {
        let text = serde_json::to_string(&self).unwrap_or_else(|e| {
            format!(r#"{{"kind":"error","error":"failed to encode frame: {e}"}}"#)
        });
        Message::Text(text)
    }
}

fn error_frame(id: &str, method: &str, error: impl Into<String>) -> Message {
    Outbound {
        id,
        kind: "error",
        method,
        data: None,
        error: Some(error.into()),
    }
    .into_message()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamMethod {
    SubscribeTopic,
    SubscribeProcessLogs,
    Heartbeat,
}

impl StreamMethod {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "SubscribeTopic" => Some(Self::SubscribeTopic),
            "SubscribeProcessLogs" => Some(Self::SubscribeProcessLogs),
            "Heartbeat" => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// The sending side of one call.
struct CallSink {
    id: String,
    method: String,
    out: mpsc::Sender<Message>,
}

impl CallSink {
    async fn send(&self, kind: &'static str, data: Option<Value>, error: Option<String>) -> bool {
        let frame = Outbound {
            id: &self.id,
            kind,
            method: &self.method,
            data,
            error,
        };
        self.out.send(frame.into_message()).await.is_ok()
    }

    /// False once the socket writer is gone.
    async fn output(&self, data: Value) -> bool {
        self.send("methodOutput", Some(data), None).await
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProcessLogsInput {
    process_id: Identity,
}

fn decode<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, String> {
    // A call without data decodes like an empty object.
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|e| format!("invalid input: {e}"))
}

/// Runs one call to completion. `Err` carries the message of the final
/// `error` frame.
async fn run_method(state: &AppState, method: StreamMethod, data: Value, sink: &CallSink) -> Result<(), String> {
    match method {
        StreamMethod::SubscribeTopic => {
            let id: Identity = decode(data)?;
            let mut sub = state
                .topics
                .subscribe_any(&id)
                .map_err(|e| format_error_chain(&e))?;
            while let Some(msg) = sub.recv().await {
                let payload = serde_json::to_value(&msg).map_err(|e| e.to_string())?;
                if !sink.output(payload).await {
                    break;
                }
            }
            Ok(())
        }
        StreamMethod::SubscribeProcessLogs => {
            let input: ProcessLogsInput = decode(data)?;
            // Subscribe before reading the file so no line falls in between.
            let mut sub = state
                .processes
                .subscribe_logs(&input.process_id)
                .await
                .map_err(|e| format_error_chain(&e))?;
            let snapshot = state
                .processes
                .log_snapshot(&input.process_id)
                .await
                .map_err(|e| format_error_chain(&e))?;
            let first = serde_json::json!({
                "type": "snapshot",
                "text": snapshot.text,
                "counter": snapshot.counter,
            });
            if !sink.output(first).await {
                return Ok(());
            }
            while let Some(msg) = sub.recv().await {
                // Already part of the snapshot text.
                if msg.counter < snapshot.counter {
                    continue;
                }
                let line = serde_json::json!({
                    "type": "line",
                    "counter": msg.counter,
                    "line": msg.data,
                });
                if !sink.output(line).await {
                    break;
                }
            }
            Ok(())
        }
        StreamMethod::Heartbeat => {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                if !sink.output(serde_json::json!({ "ok": true })).await {
                    return Ok(());
                }
            }
        }
    }
}

async fn run_call(state: AppState, method: StreamMethod, data: Value, sink: CallSink) {
    if !sink.send("methodStarted", None, None).await {
        return;
    }
    match run_method(&state, method, data, &sink).await {
        Ok(()) => {
            sink.send("methodDone", None, None).await;
        }
        Err(message) => {
            tracing::debug!(call_id = %sink.id, method = %sink.method, error = %message, "stream call failed");
            sink.send("error", None, Some(message)).await;
        }
    }
}

/// Per-socket bookkeeping of running calls.
struct Session {
    state: AppState,
    out: mpsc::Sender<Message>,
    done: mpsc::UnboundedSender<(String, u64)>,
    in_flight: HashMap<String, (u64, AbortHandle)>,
    generation: u64,
}

impl Session {
    async fn reply(&self, frame: Message) {
        let _ = self.out.send(frame).await;
    }

    async fn handle_text(&mut self, text: &str) {
        let frame: Inbound = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.reply(error_frame("", "", format!("failed to parse frame: {e}"))).await;
                return;
            }
        };
        match frame.kind.as_str() {
            "call" => self.start(frame).await,
            "cancel" => self.cancel(&frame.id, &frame.method).await,
            other => {
                self.reply(error_frame(&frame.id, &frame.method, format!("invalid kind {other:?}")))
                    .await;
            }
        }
    }

    async fn start(&mut self, frame: Inbound) {
        if frame.id.is_empty() {
            self.reply(error_frame("", &frame.method, "call is missing an id")).await;
            return;
        }
        if self.in_flight.contains_key(&frame.id) {
            self.reply(error_frame(&frame.id, &frame.method, "id is already in use")).await;
            return;
        }
        let Some(method) = StreamMethod::parse(&frame.method) else {
            self.reply(error_frame(
                &frame.id,
                &frame.method,
                format!("unknown method {:?}", frame.method),
            ))
            .await;
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        let sink = CallSink {
            id: frame.id.clone(),
            method: frame.method,
            out: self.out.clone(),
        };
        let span = tracing::debug_span!("stream_call", call_id = %sink.id, method = %sink.method);
        let done = self.done.clone();
        let state = self.state.clone();
        let id = frame.id.clone();
        let task = tokio::spawn(
            async move {
                run_call(state, method, frame.data, sink).await;
                let _ = done.send((id, generation));
            }
            .instrument(span),
        );
        self.in_flight.insert(frame.id, (generation, task.abort_handle()));
    }

    async fn cancel(&mut self, id: &str, method: &str) {
        match self.in_flight.remove(id) {
            // Aborting drops the call's subscription, which unsubscribes it.
            Some((_, handle)) => handle.abort(),
            None => self.reply(error_frame(id, method, "no call with that id")).await,
        }
    }

    fn finished(&mut self, id: String, generation: u64) {
        if self.in_flight.get(&id).is_some_and(|(g, _)| *g == generation) {
            self.in_flight.remove(&id);
        }
    }

    fn abort_all(&mut self) {
        for (_, (_, handle)) in self.in_flight.drain() {
            handle.abort();
        }
    }
}

pub async fn websocket(
    State(state): State<AppState>,
    Extension(meta): Extension<RequestMeta>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(state, socket, meta.request_id))
}

async fn serve_socket(state: AppState, socket: WebSocket, request_id: String) {
    let span = tracing::info_span!("stream", request_id = %request_id);
    async move {
        tracing::debug!("stream opened");
        let (mut sender, mut receiver) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if sender.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut session = Session {
            state,
            out: out_tx,
            done: done_tx,
            in_flight: HashMap::new(),
            generation: 0,
        };

        loop {
            tokio::select! {
                Some((id, generation)) = done_rx.recv() => session.finished(id, generation),
                incoming = receiver.next() => {
                    let Some(Ok(msg)) = incoming else { break };
                    match msg {
                        Message::Text(text) => session.handle_text(&text).await,
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            }
        }

        let open_calls = session.in_flight.len();
        session.abort_all();
        drop(session);
        writer.abort();
        tracing::debug!(open_calls, "stream closed");
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn sink() -> (CallSink, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (
            CallSink {
                id: "c1".to_string(),
                method: "SubscribeTopic".to_string(),
                out: tx,
            },
            rx,
        )
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Message>) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame in time")
            .expect("writer open");
        match msg {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn outbound_frames_omit_empty_fields() {
        let Message::Text(text) = error_frame("", "", "bad") else {
            panic!("text frame expected");
        };
        assert_eq!(text, r#"{"kind":"error","error":"bad"}"#);
    }

    #[test]
    fn method_names_parse() {
        assert_eq!(StreamMethod::parse("Heartbeat"), Some(StreamMethod::Heartbeat));
        assert_eq!(StreamMethod::parse("heartbeat"), None);
    }

    #[tokio::test]
    async fn topic_subscription_streams_until_close() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path()).await;
        let id = Identity::new("/app-topics/todo", "events").unwrap();
        let topic = state.topics.create_topic::<Value>(&id).unwrap();

        let (sink, mut rx) = sink();
        let call = tokio::spawn(run_call(
            state.clone(),
            StreamMethod::SubscribeTopic,
            serde_json::to_value(&id).unwrap(),
            sink,
        ));

        assert_eq!(next_frame(&mut rx).await["kind"], "methodStarted");
        // Wait until the call has subscribed.
        while topic.info().subscriber_count == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        topic.publish(serde_json::json!({ "n": 1 })).await;
        let out = next_frame(&mut rx).await;
        assert_eq!(out["kind"], "methodOutput");
        assert_eq!(out["id"], "c1");
        assert_eq!(out["data"]["counter"], 0);
        assert_eq!(out["data"]["data"]["n"], 1);

        topic.close();
        assert_eq!(next_frame(&mut rx).await["kind"], "methodDone");
        call.await.unwrap();
    }

    #[tokio::test]
    async fn missing_topic_ends_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path()).await;
        let (sink, mut rx) = sink();
        run_call(
            state,
            StreamMethod::SubscribeTopic,
            serde_json::json!({ "category": "/nope", "key": "x" }),
            sink,
        )
        .await;
        assert_eq!(next_frame(&mut rx).await["kind"], "methodStarted");
        let err = next_frame(&mut rx).await;
        assert_eq!(err["kind"], "error");
        assert!(err["error"].as_str().unwrap().contains("does not exist"));
    }

    #[tokio::test]
    async fn aborting_a_call_unsubscribes() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path()).await;
        let id = Identity::new("/app-topics/todo", "events").unwrap();
        let topic = state.topics.create_topic::<Value>(&id).unwrap();

        let (sink, mut rx) = sink();
        let call = tokio::spawn(run_call(
            state.clone(),
            StreamMethod::SubscribeTopic,
            serde_json::to_value(&id).unwrap(),
            sink,
        ));
        next_frame(&mut rx).await;
        while topic.info().subscriber_count == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        call.abort();
        let _ = call.await;
        assert_eq!(topic.info().subscriber_count, 0);
    }

    #[tokio::test]
    async fn heartbeat_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path()).await;
        let (sink, mut rx) = sink();
        let call = tokio::spawn(run_call(state, StreamMethod::Heartbeat, Value::Null, sink));
        assert_eq!(next_frame(&mut rx).await["kind"], "methodStarted");
        for _ in 0..3 {
            let out = next_frame(&mut rx).await;
            assert_eq!(out["data"]["ok"], true);
        }
        call.abort();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_logs_continue_where_the_snapshot_ends() {
        use kestrel_process::ProcessConfig;

        let dir = tempfile::tempdir().unwrap();
        let state = test_support::state(dir.path()).await;
        let id = Identity::new("/app-spawned/todo", "echo").unwrap();
        let mut config = ProcessConfig::new(id.clone(), "sh");
        config.args = vec!["-c".into(), "echo first; echo second; sleep 0.5; echo third".into()];
        state.processes.spawn_from_path_var(config).await.unwrap();

        // Let the first lines reach the log file.
        for _ in 0..100 {
            let snap = state.processes.log_snapshot(&id).await.unwrap();
            if snap.text.contains("second") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let (mut sink, mut rx) = sink();
        sink.method = "SubscribeProcessLogs".to_string();
        let call = tokio::spawn(run_call(
            state.clone(),
            StreamMethod::SubscribeProcessLogs,
            serde_json::json!({ "processId": id }),
            sink,
        ));
        assert_eq!(next_frame(&mut rx).await["kind"], "methodStarted");
        let first = next_frame(&mut rx).await;
        assert_eq!(first["data"]["type"], "snapshot");
        let mut seen = first["data"]["text"].as_str().unwrap().to_string();
        assert!(seen.starts_with("first\nsecond\n"), "{seen}");
        let mut expected_counter = first["data"]["counter"].as_i64().unwrap();

        // The process exits, which ends the stream.
        loop {
            let frame = next_frame(&mut rx).await;
            if frame["kind"] == "methodDone" {
                break;
            }
            assert_eq!(frame["data"]["type"], "line");
            assert_eq!(frame["data"]["counter"].as_i64().unwrap(), expected_counter);
            expected_counter += 1;
            seen.push_str(frame["data"]["line"].as_str().unwrap());
            seen.push('\n');
        }
        assert_eq!(seen, "first\nsecond\nthird\n");
        call.await.unwrap();
    }
}

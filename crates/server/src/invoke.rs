use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use agenthost_agent::{AgentRuntime, DispatchOptions, DispatchStream};
use agenthost_core::errors::{ErrorCode, InterfaceError};
use agenthost_core::message::Msg;

#[derive(Debug)]
pub struct InvokeRequest {
    pub session_id: String,
    pub message: Msg,
    pub metadata: Map<String, Value>,
    /// Start a fresh session when none is stored. Defaults to true.
    pub create_session: bool,
}

fn invalid(message: impl Into<String>) -> InterfaceError {
    InterfaceError::new(ErrorCode::InvalidRequest, message)
}

/// Validates an `/invoke` body without touching the runtime.
pub fn parse_request(body: &[u8]) -> Result<InvokeRequest, InterfaceError> {
    let payload: Value =
        serde_json::from_slice(body).map_err(|error| invalid(format!("invalid JSON: {error}")))?;
    let Value::Object(mut payload) = payload else {
        return Err(invalid("request body must be a JSON object"));
    };

    let session_id = match payload.remove("session_id") {
        Some(Value::String(session_id)) if !session_id.trim().is_empty() => session_id,
        _ => return Err(invalid("session_id is required")),
    };

    let message = match payload.remove("message") {
        Some(message @ Value::Object(_)) => serde_json::from_value::<Msg>(message)
            .map_err(|error| invalid(format!("invalid message: {error}")))?,
        _ => return Err(invalid("message must be an object")),
    };

    let metadata = match payload.remove("metadata") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(metadata)) => metadata,
        Some(_) => return Err(invalid("metadata must be an object")),
    };

    let create_session = match payload.remove("create_session") {
        None | Some(Value::Null) => true,
        Some(Value::Bool(create)) => create,
        Some(_) => return Err(invalid("create_session must be a boolean")),
    };

    Ok(InvokeRequest { session_id, message, metadata, create_session })
}

pub fn error_response(error: InterfaceError) -> Response {
    let status = StatusCode::from_u16(error.code.http_status())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(error.to_body())).into_response()
}

fn frame(json: &str) -> Bytes {
    Bytes::from(format!("data: {json}\n\n"))
}

/// One `data:` frame per reply, an error frame if the turn failed, then the done marker.
pub fn event_frames(
    mut replies: DispatchStream,
    correlation_id: String,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    async_stream::stream! {
        while let Some(reply) = replies.next().await {
            match reply {
                Ok(msg) => {
                    let line = serde_json::to_string(&msg).unwrap_or_else(|_| {
                        json!({ "name": "system", "role": "assistant", "content": "<serialization-error>" })
                            .to_string()
                    });
                    yield Ok(frame(&line));
                }
                Err(error) => {
                    warn!(
                        event_name = "http.invoke.stream_failed",
                        correlation_id = %correlation_id,
                        code = error.code().as_str(),
                        error = %error,
                        "invoke stream ended with an error"
                    );
                    let body = InterfaceError::new(error.code(), error.to_string()).to_body();
                    yield Ok(frame(&body.to_string()));
                    break;
                }
            }
        }
        yield Ok(frame(&Msg::done_marker().to_string()));
    }
}

pub fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    let headers = [
        (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
        (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
        (header::CONNECTION, HeaderValue::from_static("keep-alive")),
    ];
    (headers, Body::from_stream(stream)).into_response()
}

/// `POST /invoke`
pub async fn invoke(State(runtime): State<Arc<AgentRuntime>>, body: Bytes) -> Response {
    let correlation_id = uuid::Uuid::new_v4().to_string();

    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(error) => {
            debug!(
                event_name = "http.invoke.rejected",
                correlation_id = %correlation_id,
                error = %error,
                "invalid invoke request"
            );
            return error_response(error.with_correlation_id(correlation_id));
        }
    };

    let options = DispatchOptions { allow_missing: request.create_session };
    match runtime.dispatch(&request.session_id, request.message, request.metadata, options).await {
        Ok(replies) => {
            debug!(
                event_name = "http.invoke.accepted",
                correlation_id = %correlation_id,
                session_id = %request.session_id,
                "streaming invoke replies"
            );
            sse_response(event_frames(replies, correlation_id))
        }
        Err(error) => {
            warn!(
                event_name = "http.invoke.failed",
                correlation_id = %correlation_id,
                session_id = %request.session_id,
                code = error.code().as_str(),
                error = %error,
                "invoke could not be dispatched"
            );
            error_response(
                InterfaceError::new(error.code(), error.to_string()).with_correlation_id(correlation_id),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use futures::StreamExt;
    use serde_json::{json, Map, Value};
    use tower::ServiceExt;

    use agenthost_agent::mcp::McpConnector;
    use agenthost_agent::{
        AgentApp, AgentRuntime, ConfigSource, DispatchOptions, MessageStream, ProviderTable,
        RequestContext, Resources,
    };
    use agenthost_core::config::{RuntimeConfig, SessionBackendKind, SessionConcurrency};
    use agenthost_core::message::Msg;

    use super::parse_request;
    use crate::bootstrap::router;

    /// Echoes the message, or fails after one reply when asked to.
    struct ScriptedApp;

    #[async_trait]
    impl AgentApp for ScriptedApp {
        fn handle(self: Arc<Self>, msg: Msg, _ctx: RequestContext) -> MessageStream {
            async_stream::stream! {
                yield Ok(Msg::assistant(format!("echo: {}", msg.text())));
                if msg.text() == "explode" {
                    yield Err(anyhow::anyhow!("tool call blew up"));
                }
            }
            .boxed()
        }
    }

    fn runtime() -> Arc<AgentRuntime> {
        let factory = |_: &Resources| -> anyhow::Result<Arc<dyn AgentApp>> { Ok(Arc::new(ScriptedApp)) };
        Arc::new(AgentRuntime::new(factory, ProviderTable::empty(), Arc::new(McpConnector::default())))
    }

    async fn ready_runtime(concurrency: SessionConcurrency) -> Arc<AgentRuntime> {
        let runtime = runtime();
        let mut config = RuntimeConfig::default();
        config.session.backend = SessionBackendKind::Memory;
        config.session.concurrency = concurrency;
        runtime.initialize(ConfigSource::Resolved(config)).await.expect("initialize");
        runtime
    }

    async fn post(runtime: Arc<AgentRuntime>, body: &str) -> Response {
        let request = Request::builder()
            .method("POST")
            .uri("/invoke")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request");
        router(runtime).oneshot(request).await.expect("response")
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        String::from_utf8(bytes.to_vec()).expect("utf8")
    }

    fn frames(body: &str) -> Vec<Value> {
        body.split("\n\n")
            .filter(|frame| !frame.is_empty())
            .map(|frame| {
                let data = frame.strip_prefix("data: ").expect("data frame");
                serde_json::from_str(data).expect("json frame")
            })
            .collect()
    }

    async fn error_code(response: Response) -> String {
        let body: Value = serde_json::from_str(&body_text(response).await).expect("json body");
        body["error"]["code"].as_str().unwrap_or_default().to_string()
    }

    #[test]
    fn request_validation_rejects_malformed_bodies() {
        let cases = [
            ("{not json", "invalid JSON"),
            ("[1, 2]", "JSON object"),
            (r#"{"message": {"name": "u", "role": "user", "content": "hi"}}"#, "session_id"),
            (r#"{"session_id": "", "message": {"name": "u", "role": "user"}}"#, "session_id"),
            (r#"{"session_id": "s1", "message": "hi"}"#, "message must be an object"),
            (r#"{"session_id": "s1", "message": {"role": "user"}}"#, "invalid message"),
            (r#"{"session_id": "s1", "message": {"name": "u", "role": "robot"}}"#, "invalid message"),
            (
                r#"{"session_id": "s1", "message": {"name": "u", "role": "user"}, "metadata": [1]}"#,
                "metadata must be an object",
            ),
        ];

        for (body, expected) in cases {
            let error = parse_request(body.as_bytes()).expect_err(body);
            assert_eq!(error.code.as_str(), "INVALID_REQUEST");
            assert!(error.message.contains(expected), "{body}: {}", error.message);
        }
    }

    #[test]
    fn null_metadata_is_empty_and_sessions_are_created_by_default() {
        let request = parse_request(
            br#"{"session_id": "s1", "message": {"name": "u", "role": "user", "content": "hi"}, "metadata": null}"#,
        )
        .expect("valid");

        assert!(request.metadata.is_empty());
        assert!(request.create_session);
        assert_eq!(request.message.text(), "hi");
    }

    #[tokio::test]
    async fn missing_session_id_is_bad_request() {
        let response = post(ready_runtime(SessionConcurrency::Queue).await, r#"{"message": {}}"#).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn invoke_before_ready_is_unavailable() {
        let response = post(
            runtime(),
            r#"{"session_id": "s1", "message": {"name": "u", "role": "user", "content": "hi"}}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error_code(response).await, "NOT_READY");
    }

    #[tokio::test]
    async fn successful_invoke_streams_replies_then_done_marker() {
        let response = post(
            ready_runtime(SessionConcurrency::Queue).await,
            r#"{"session_id": "s1", "message": {"name": "u", "role": "user", "content": "hi"}, "metadata": {"trace": 1}}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
        let frames = frames(&body_text(response).await);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["content"], "echo: hi");
        assert_eq!(frames[0]["role"], "assistant");
        assert_eq!(frames[1], Msg::done_marker());
    }

    #[tokio::test]
    async fn app_failure_emits_error_frame_before_done_marker() {
        let response = post(
            ready_runtime(SessionConcurrency::Queue).await,
            r#"{"session_id": "s1", "message": {"name": "u", "role": "user", "content": "explode"}}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let frames = frames(&body_text(response).await);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["content"], "echo: explode");
        assert_eq!(frames[1]["error"]["code"], "APP_ERROR");
        assert!(frames[1]["error"]["message"].as_str().unwrap_or_default().contains("tool call blew up"));
        assert_eq!(frames[2], json!({"name": "assistant", "role": "assistant", "content": "", "metadata": {"done": true}}));
    }

    #[tokio::test]
    async fn contended_session_is_conflict_under_reject_policy() {
        let runtime = ready_runtime(SessionConcurrency::Reject).await;
        let held = runtime
            .dispatch("s1", Msg::user("hold"), Map::new(), DispatchOptions::allow_missing())
            .await
            .expect("first dispatch");

        let response = post(
            Arc::clone(&runtime),
            r#"{"session_id": "s1", "message": {"name": "u", "role": "user", "content": "hi"}}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(error_code(response).await, "SESSION_BUSY");
        drop(held);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found_when_creation_disabled() {
        let response = post(
            ready_runtime(SessionConcurrency::Queue).await,
            r#"{"session_id": "ghost", "create_session": false, "message": {"name": "u", "role": "user", "content": "hi"}}"#,
        )
        .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_code(response).await, "NOT_FOUND");
    }
}

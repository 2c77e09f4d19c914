//! Axum handlers for the webhook path.

use std::sync::Arc;

use {
    axum::{
        Router,
        extract::{Query, State},
        http::{StatusCode, header},
        response::{IntoResponse, Response},
        routing::get,
    },
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use wecom_metrics::{counter, wecom as wecom_names};

use crate::{
    codec::{DecodeOutcome, Decoded, Inbound, InboundEvent, InboundMessage, StreamReply, WebhookQuery},
    error::Result,
    inbound,
    lifecycle::FinishReason,
    preview,
    state::Shared,
};

/// Finished reply for polls of streams that were already cleaned up.
pub const EXPIRED_MESSAGE: &str = "会话已过期";

const ENTER_CHAT: &str = "enter_chat";

pub(crate) fn router(shared: Arc<Shared>) -> Router {
    let path = shared.config.webhook_path.clone();
    Router::new()
        .route(&path, get(verify).post(receive))
        .with_state(shared)
}

async fn verify(State(shared): State<Arc<Shared>>, Query(query): Query<WebhookQuery>) -> Response {
    match shared.codec.verify_challenge(&query) {
        Some(echo) => {
            info!(account_id = %shared.account_id, "webhook URL verified");
            (StatusCode::OK, echo).into_response()
        },
        None => {
            warn!(account_id = %shared.account_id, "webhook verification failed");
            (StatusCode::FORBIDDEN, "forbidden").into_response()
        },
    }
}

async fn receive(
    State(shared): State<Arc<Shared>>,
    Query(query): Query<WebhookQuery>,
    body: String,
) -> Response {
    let Decoded {
        inbound,
        timestamp,
        nonce,
    } = match shared.codec.decode(&query, &body) {
        DecodeOutcome::Decoded(decoded) => decoded,
        DecodeOutcome::Duplicate => {
            debug!("duplicate webhook delivery acknowledged");
            #[cfg(feature = "metrics")]
            counter!(wecom_names::DUPLICATES_TOTAL).increment(1);
            return (StatusCode::OK, "success").into_response();
        },
        DecodeOutcome::Invalid { reason } => {
            warn!(reason = %reason, "rejected webhook request");
            return (StatusCode::BAD_REQUEST, reason).into_response();
        },
    };

    let reply = match inbound {
        Inbound::Message(message) => on_message(&shared, message, &timestamp, &nonce),
        Inbound::StreamRefresh { stream_id } => on_refresh(&shared, &stream_id, &timestamp, &nonce),
        Inbound::Event(event) => on_event(&shared, event, &timestamp, &nonce),
    };
    reply.unwrap_or_else(|e| {
        error!(error = %e, "failed to build webhook reply");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    })
}

fn encoded(shared: &Shared, reply: &StreamReply<'_>) -> Result<Response> {
    let body = shared.codec.build_stream_response(reply)?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], body).into_response())
}

fn new_stream_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

/// Create the stream and answer with the placeholder before any processing.
fn on_message(
    shared: &Arc<Shared>,
    message: InboundMessage,
    timestamp: &str,
    nonce: &str,
) -> Result<Response> {
    let stream_id = new_stream_id("stream");
    shared.streams.create(&stream_id)?;
    debug!(
        stream_id = %stream_id,
        msg_id = %message.msg_id,
        msg_type = %message.msg_type,
        sender = %message.from_user,
        content = %preview(&message.content),
        "inbound message"
    );
    inbound::accept(shared, message, &stream_id);
    encoded(shared, &StreamReply {
        stream_id: &stream_id,
        content: shared.placeholder(),
        finished: false,
        timestamp,
        nonce,
        media: &[],
    })
}

fn on_refresh(shared: &Shared, stream_id: &str, timestamp: &str, nonce: &str) -> Result<Response> {
    shared.lifecycle.poll(stream_id);
    let Some(stream) = shared.streams.get(stream_id) else {
        debug!(stream_id, "refresh for unknown stream");
        return encoded(shared, &StreamReply {
            stream_id,
            content: EXPIRED_MESSAGE,
            finished: true,
            timestamp,
            nonce,
            media: &[],
        });
    };
    if stream.finished {
        shared.lifecycle.schedule_cleanup(stream_id);
    }
    let media = if stream.finished {
        stream.queued_media.as_slice()
    } else {
        &[]
    };
    encoded(shared, &StreamReply {
        stream_id,
        content: &stream.content,
        finished: stream.finished,
        timestamp,
        nonce,
        media,
    })
}

fn on_event(
    shared: &Shared,
    event: InboundEvent,
    timestamp: &str,
    nonce: &str,
) -> Result<Response> {
    if event.event_type != ENTER_CHAT {
        debug!(event_type = %event.event_type, "event acknowledged");
        return Ok((StatusCode::OK, "success").into_response());
    }
    let stream_id = new_stream_id("welcome");
    shared.streams.create(&stream_id)?;
    shared
        .streams
        .replace_if_placeholder(&stream_id, &shared.config.welcome_message, shared.placeholder());
    shared.lifecycle.finalize(&stream_id, FinishReason::Welcome);
    info!(user = ?event.from_user, "sent welcome message");
    encoded(shared, &StreamReply {
        stream_id: &stream_id,
        content: &shared.config.welcome_message,
        finished: true,
        timestamp,
        nonce,
        media: &[],
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use {
        axum::{
            body::{Body, to_bytes},
            http::Request,
        },
        serde_json::{Value, json},
        tower::ServiceExt,
        wecom_common::types::ReplyPayload,
    };

    use {
        super::*,
        crate::{
            agent::DeliveryKind,
            channel::{
                WecomChannel,
                tests::{ScriptedRuntime, harness, post, send, test_config},
            },
            config::DEFAULT_WELCOME_MESSAGE,
        },
    };

    async fn call(channel: &WecomChannel, method: &str, query: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(format!("{}?{query}", channel.webhook_path()))
            .body(Body::empty())
            .unwrap();
        let response = channel.router().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    async fn refresh(channel: &WecomChannel, id: &str) -> Value {
        let (status, body) = post(channel, json!({ "refresh": id })).await;
        assert_eq!(status, StatusCode::OK);
        serde_json::from_str(&body).unwrap()
    }

    fn dm(content: &str) -> Value {
        json!({ "from_user": "alice", "content": content })
    }

    #[tokio::test]
    async fn challenge_verification() {
        let (channel, _) = harness(test_config(), ScriptedRuntime::echo());

        let (status, body) = call(&channel, "GET", "msg_signature=valid&echostr=hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "hello");

        let (status, _) = call(&channel, "GET", "msg_signature=forged&echostr=hello").await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unsupported_method_is_rejected() {
        let (channel, _) = harness(test_config(), ScriptedRuntime::echo());
        let (status, _) = call(&channel, "PUT", "").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn duplicates_and_invalid_bodies() {
        let runtime = ScriptedRuntime::echo();
        let (channel, _) = harness(test_config(), runtime.clone());

        let (status, body) = post(&channel, json!({ "duplicate": true })).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "success");

        let (status, _) = post(&channel, json!({ "nonsense": 1 })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(runtime.contexts().is_empty());
    }

    #[tokio::test]
    async fn refresh_of_unknown_stream_is_expired() {
        let (channel, _) = harness(test_config(), ScriptedRuntime::echo());
        let reply = refresh(&channel, "stream_gone").await;
        assert_eq!(reply["content"], EXPIRED_MESSAGE);
        assert_eq!(reply["finished"], true);
    }

    #[tokio::test]
    async fn enter_chat_gets_welcome() {
        let (channel, _) = harness(test_config(), ScriptedRuntime::echo());

        let (status, body) = post(&channel, json!({ "event": { "event_type": "enter_chat" } })).await;
        assert_eq!(status, StatusCode::OK);
        let reply: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(reply["content"], DEFAULT_WELCOME_MESSAGE);
        assert_eq!(reply["finished"], true);
        assert!(reply["id"].as_str().unwrap().starts_with("welcome_"));

        let (_, body) = post(&channel, json!({ "event": { "event_type": "leave_chat" } })).await;
        assert_eq!(body, "success");
    }

    #[tokio::test(start_paused = true)]
    async fn polls_close_idle_stream_and_release_media() {
        let runtime = ScriptedRuntime::new(|_, sink| {
            Box::pin(async move {
                sink.deliver(ReplyPayload::text("done\nMEDIA: /tmp/report.png"), DeliveryKind::Final)
                    .await;
                anyhow::Ok(())
            })
        });
        let (channel, _) = harness(test_config(), runtime);

        let id = send(&channel, dm("report please")).await;
        tokio::time::sleep(Duration::from_millis(2_100)).await;

        let reply = refresh(&channel, &id).await;
        assert_eq!(reply["content"], "done");
        assert_eq!(reply["finished"], false);
        assert_eq!(reply["media"], json!([]));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(refresh(&channel, &id).await["finished"], false);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let reply = refresh(&channel, &id).await;
        assert_eq!(reply["finished"], true);
        assert_eq!(reply["media"], json!(["/tmp/report.png"]));

        // Deleted once the cleanup grace period passes.
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(channel.stream(&id).is_none());
        assert_eq!(refresh(&channel, &id).await["content"], EXPIRED_MESSAGE);
    }
}

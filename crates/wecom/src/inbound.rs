//! Inbound processing: debounce, gating, media and the serialized dispatch.

use std::{path::PathBuf, sync::Arc};

use {
    async_trait::async_trait,
    tracing::{debug, error, info, warn},
    wecom_common::types::{ChatType, ReplyPayload},
};

#[cfg(feature = "metrics")]
use wecom_metrics::{counter, histogram, wecom as wecom_names};

use crate::{
    CHANNEL_ID,
    agent::{DeliveryKind, InboundContext, ReplySink, RouteRequest},
    codec::InboundMessage,
    commands::{
        MENTION_REQUIRED_MESSAGE, MentionGate, check_command, command_authorized,
        dynamic_agent_id, gate_mention, is_admin,
    },
    debounce::Pending,
    lifecycle::{DISPATCH_ERROR_MESSAGE, FinishReason},
    media::guess_mime_type,
    preview,
    scope::DeliveryScope,
    state::Shared,
};

/// Shown on the streams of messages folded into an earlier one.
pub const MERGED_NOTICE: &str = "消息已合并到第一条回复中。";

/// Entry point for a decoded message whose stream was just created.
///
/// Commands skip the debounce window; everything else is buffered per
/// conversation.
pub(crate) fn accept(shared: &Arc<Shared>, message: InboundMessage, stream_id: &str) {
    let key = message.conversation_key();
    #[cfg(feature = "metrics")]
    counter!(wecom_names::MESSAGES_RECEIVED_TOTAL).increment(1);

    if let Some(url) = message.response_url.as_deref() {
        shared.slots.save(&key, url);
    }

    if message.is_command() {
        debug!(stream_key = %key, stream_id, "command bypasses debounce");
        enqueue(shared, message, stream_id.to_string());
        return;
    }
    shared.debounce.push(&key, message, stream_id);
}

/// Debounce flush: the first message absorbs the rest of the burst.
pub(crate) fn flush(shared: &Arc<Shared>, key: String, batch: Vec<Pending<InboundMessage>>) {
    let Some(merged) = merge_batch(batch) else {
        return;
    };
    if !merged.secondaries.is_empty() {
        info!(
            stream_key = %key,
            primary = %merged.stream_id,
            merged = merged.secondaries.len(),
            "merged buffered messages"
        );
        #[cfg(feature = "metrics")]
        counter!(wecom_names::MESSAGES_MERGED_TOTAL).increment(merged.secondaries.len() as u64);
    }
    for stream_id in &merged.secondaries {
        shared
            .streams
            .replace_if_placeholder(stream_id, MERGED_NOTICE, shared.placeholder());
        shared.lifecycle.finalize(stream_id, FinishReason::Merged);
        shared.active.unregister(&key, stream_id);
    }
    enqueue(shared, merged.message, merged.stream_id);
}

/// Result of folding a debounce batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedBatch {
    pub message: InboundMessage,
    pub stream_id: String,
    /// Streams of the folded messages, in arrival order.
    pub secondaries: Vec<String>,
}

/// Fold a batch into its first message: bodies joined with `\n`, image lists
/// concatenated, the first single-image and file attachments kept.
#[must_use]
pub fn merge_batch(batch: Vec<Pending<InboundMessage>>) -> Option<MergedBatch> {
    let mut batch = batch.into_iter();
    let Pending {
        message: mut primary,
        stream_id,
    } = batch.next()?;
    let rest: Vec<Pending<InboundMessage>> = batch.collect();
    if rest.is_empty() {
        return Some(MergedBatch {
            message: primary,
            stream_id,
            secondaries: Vec::new(),
        });
    }

    let mut bodies: Vec<String> = Vec::with_capacity(rest.len() + 1);
    let mut images = primary.image_refs();
    if !primary.content.trim().is_empty() {
        bodies.push(primary.content.clone());
    }
    let mut secondaries = Vec::with_capacity(rest.len());
    for Pending { message, stream_id } in rest {
        if !message.content.trim().is_empty() {
            bodies.push(message.content.clone());
        }
        for url in message.image_refs() {
            if !images.contains(&url) {
                images.push(url);
            }
        }
        if primary.image_url.as_deref().is_none_or(str::is_empty) {
            primary.image_url = message.image_url.filter(|u| !u.is_empty());
        }
        if primary.file_url.as_deref().is_none_or(str::is_empty)
            && message.file_url.as_deref().is_some_and(|u| !u.is_empty())
        {
            primary.file_url = message.file_url;
            primary.file_name = message.file_name;
        }
        secondaries.push(stream_id);
    }
    primary.content = bodies.join("\n");
    primary.image_urls = images;

    Some(MergedBatch {
        message: primary,
        stream_id,
        secondaries,
    })
}

fn enqueue(shared: &Arc<Shared>, message: InboundMessage, stream_id: String) {
    let key = message.conversation_key();
    let task = {
        let shared = Arc::clone(shared);
        let stream_id = stream_id.clone();
        async move { process(&shared, message, &stream_id).await }
    };
    let shared = Arc::clone(shared);
    let failed_key = key.clone();
    shared.serializer.enqueue(&key, task, {
        let shared = Arc::clone(&shared);
        move |err| {
            error!(stream_id = %stream_id, stream_key = %failed_key, error = %err, "message processing failed");
            shared
                .lifecycle
                .fail(&stream_id, &failed_key, DISPATCH_ERROR_MESSAGE);
        }
    });
}

/// Terminal outcome before any dispatch.
fn finish_early(shared: &Shared, stream_id: &str, key: &str, reason: FinishReason) {
    shared.lifecycle.finalize(stream_id, reason);
    shared.active.unregister(key, stream_id);
}

async fn process(
    shared: &Arc<Shared>,
    message: InboundMessage,
    stream_id: &str,
) -> anyhow::Result<()> {
    let config = &shared.config;
    let key = message.conversation_key();
    let sender = message.from_user.clone();
    shared.active.register(&key, stream_id);

    let body = match gate_mention(&message.content, message.is_group(), config.group.mention_mode)
    {
        MentionGate::Pass(body) => body,
        MentionGate::MentionRequired => {
            debug!(stream_key = %key, sender = %sender, "group message ignored (no mention)");
            shared.streams.replace_if_placeholder(
                stream_id,
                MENTION_REQUIRED_MESSAGE,
                shared.placeholder(),
            );
            finish_early(shared, stream_id, &key, FinishReason::MentionRequired);
            return Ok(());
        },
        MentionGate::Ignore => {
            debug!(stream_key = %key, "group replies disabled");
            finish_early(shared, stream_id, &key, FinishReason::MentionRequired);
            return Ok(());
        },
    };

    if body.trim().is_empty() && !message.has_attachments() {
        debug!(stream_id, "empty message, skipping");
        finish_early(shared, stream_id, &key, FinishReason::EmptyMessage);
        return Ok(());
    }

    let admin = is_admin(&sender, config);
    let command = check_command(&body, &config.commands);
    if command.is_command && !command.allowed {
        if !admin {
            warn!(
                command = ?command.command,
                sender = %sender,
                chat_type = %message.chat_type,
                "blocked command"
            );
            shared.streams.replace_if_placeholder(
                stream_id,
                &config.commands.block_message,
                shared.placeholder(),
            );
            finish_early(shared, stream_id, &key, FinishReason::CommandBlocked);
            return Ok(());
        }
        info!(command = ?command.command, sender = %sender, "admin bypassed command allowlist");
    }

    let peer_kind = if message.is_group() {
        ChatType::Group
    } else {
        ChatType::Dm
    };
    info!(
        sender = %sender,
        chat_type = %peer_kind,
        peer_id = %key,
        stream_id,
        content = %preview(&body),
        is_command = command.is_command,
        "processing message"
    );

    let mut route = shared.runtime.resolve_route(&RouteRequest {
        channel: CHANNEL_ID,
        account_id: shared.account_id.clone(),
        peer_kind,
        peer_id: key.clone(),
    });
    if admin {
        debug!(sender = %sender, "admin routed to the default agent");
    } else if let Some(agent_id) = dynamic_agent_id(peer_kind, &key, &config.dynamic_agents) {
        debug!(agent_id = %agent_id, chat_type = %peer_kind, peer_id = %key, "using dynamic agent");
        route = route.isolated(agent_id, peer_kind, &key);
    }

    let mut ctx = InboundContext {
        body: body.clone(),
        raw_body: body.clone(),
        command_body: body.clone(),
        from: format!("{CHANNEL_ID}:{sender}"),
        to: match message.group_id() {
            Some(chat_id) => format!("{CHANNEL_ID}:group:{chat_id}"),
            None => format!("{CHANNEL_ID}:{sender}"),
        },
        session_key: route.session_key,
        account_id: route.account_id,
        agent_id: route.agent_id,
        chat_type: peer_kind,
        conversation_label: match message.group_id() {
            Some(chat_id) => format!("Group {chat_id}"),
            None => sender.clone(),
        },
        sender_id: sender.clone(),
        group_id: message.group_id().map(str::to_string),
        command_authorized: command_authorized(&sender, &config.allow_from),
        ..Default::default()
    };
    attach_media(shared, &message, &mut ctx).await;

    let sink: Arc<dyn ReplySink> = Arc::new(StreamReplySink {
        shared: Arc::clone(shared),
        stream_id: stream_id.to_string(),
        stream_key: key.clone(),
    });

    let started = std::time::Instant::now();
    let outcome = DeliveryScope::new(stream_id, key.as_str())
        .run(shared.runtime.dispatch(ctx, sink))
        .await;
    #[cfg(feature = "metrics")]
    histogram!(wecom_names::DISPATCH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    debug!(stream_id, elapsed_ms = started.elapsed().as_millis() as u64, "dispatch returned");
    outcome?;

    if shared.streams.is_open(stream_id) {
        shared.lifecycle.arm_safety_net(stream_id, &key);
    } else {
        shared.active.unregister(&key, stream_id);
    }
    Ok(())
}

/// Download attachments into the context. Fetch failures drop the
/// attachment; undecryptable ones are passed on by URL.
async fn attach_media(shared: &Shared, message: &InboundMessage, ctx: &mut InboundContext) {
    let images = message.image_refs();
    for url in &images {
        match shared.media.fetch_image(url).await {
            Ok(saved) => {
                ctx.media_paths.push(saved.path);
                ctx.media_types.push(saved.mime_type);
            },
            Err(e) if e.is_decrypt() => {
                warn!(error = %e, url = %preview(url), "image decryption failed, using URL fallback");
                ctx.media_urls.push(url.clone());
                ctx.media_types.push("image/jpeg".into());
            },
            Err(e) => warn!(error = %e, url = %preview(url), "image download failed, skipping"),
        }
    }
    if !images.is_empty() {
        info!(
            decrypted = ctx.media_paths.len(),
            fallback = ctx.media_urls.len(),
            "image attachments prepared"
        );
        if ctx.raw_body.trim().is_empty() {
            ctx.body = if images.len() > 1 {
                format!("[用户发送了{}张图片]", images.len())
            } else {
                "[用户发送了一张图片]".into()
            };
            ctx.raw_body = "[图片]".into();
            ctx.command_body = String::new();
        }
    }

    let Some(file_url) = message.file_url.as_deref().filter(|u| !u.is_empty()) else {
        return;
    };
    let mut file_name = message.file_name.clone().filter(|n| !n.is_empty());
    match shared.media.fetch_file(file_url, file_name.as_deref()).await {
        Ok(saved) => {
            info!(path = %saved.path.display(), name = ?saved.file_name, "file attachment prepared");
            ctx.media_paths.push(saved.path);
            ctx.media_types.push(saved.mime_type);
            file_name = saved.file_name;
        },
        Err(e) if e.is_decrypt() => {
            warn!(error = %e, "file decryption failed, using URL fallback");
            ctx.media_urls.push(file_url.to_string());
            ctx.media_types
                .push(guess_mime_type(file_name.as_deref().unwrap_or_default()).into());
        },
        Err(e) => warn!(error = %e, "file download failed, skipping"),
    }
    if ctx.raw_body.trim().is_empty() && images.is_empty() {
        let label = match &file_name {
            Some(name) => format!("[文件: {name}]"),
            None => "[文件]".into(),
        };
        ctx.body = format!("[用户发送了文件] {label}");
        ctx.raw_body = label;
        ctx.command_body = String::new();
    }
}

/// `MEDIA: /abs/path` directive on a line of its own.
#[must_use]
pub fn parse_media_line(line: &str) -> Option<PathBuf> {
    let path = line.trim().strip_prefix("MEDIA:")?.trim();
    path.starts_with('/').then(|| PathBuf::from(path))
}

/// Bridges the runtime's callbacks onto the dispatch's stream.
pub(crate) struct StreamReplySink {
    shared: Arc<Shared>,
    stream_id: String,
    stream_key: String,
}

impl StreamReplySink {
    /// Queue `MEDIA:` paths on the stream and drop the lines that were queued.
    fn take_media_lines(&self, text: &str) -> String {
        if !text.contains("MEDIA:") {
            return text.to_string();
        }
        let kept: Vec<&str> = text
            .lines()
            .filter(|line| match parse_media_line(line) {
                Some(path) if self.shared.streams.queue_media(&self.stream_id, &path) => {
                    info!(stream_id = %self.stream_id, path = %path.display(), "queued media from reply");
                    false
                },
                _ => true,
            })
            .collect();
        kept.join("\n").trim().to_string()
    }
}

#[async_trait]
impl ReplySink for StreamReplySink {
    async fn deliver(&self, payload: ReplyPayload, kind: DeliveryKind) {
        debug!(
            stream_id = %self.stream_id,
            kind = kind.as_str(),
            preview = %preview(&payload.text),
            "reply delivered"
        );
        let text = self.take_media_lines(&payload.text);
        let router = &self.shared.router;
        if let Some(media) = &payload.media {
            router
                .deliver_media(&self.stream_key, Some(self.stream_id.as_str()), &text, &media.url)
                .await;
        } else if text.trim().is_empty() {
            debug!(stream_id = %self.stream_id, "empty block after processing, skipping");
        } else {
            router
                .deliver_text(&self.stream_key, Some(self.stream_id.as_str()), &text)
                .await;
        }

        if kind == DeliveryKind::Final {
            self.shared.lifecycle.mark_main_done(&self.stream_id);
        }
    }

    async fn on_error(&self, error: &anyhow::Error, kind: DeliveryKind) {
        error!(stream_id = %self.stream_id, kind = kind.as_str(), error = %error, "reply failed");
        self.shared
            .lifecycle
            .fail(&self.stream_id, &self.stream_key, DISPATCH_ERROR_MESSAGE);
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Inbound message orchestration.
//!
//! Per session key, messages are processed strictly in FIFO order: an
//! inbound arriving while a turn is running joins that session's follow-up
//! queue, and the running turn may interrupt itself at the next tool
//! boundary via the steering callback. Cross-session work proceeds in
//! parallel on independent tasks.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use nanobot_bus::{InboundMessage, MessageBus, OutboundMessage};
use nanobot_memory::MemoryStore;
use nanobot_model::{provider::ChatProvider, ChatMessage, ContentBlock, MessageContent, Role};
use nanobot_sessions::{Session, SessionStore};
use nanobot_tools::{MessageTool, SpawnTool, ToolRegistry};

use crate::commands::SessionCommandHandler;
use crate::context::ContextBuilder;
use crate::coordinator::ConsolidationCoordinator;
use crate::runner::{ProgressFn, SteerDecision, SteerFn, TurnHooks, TurnRunner};

const TOOL_RESULT_HISTORY_MAX_CHARS: usize = 500;
const ASSISTANT_HISTORY_MAX_CHARS: usize = 300;
const FOLLOWUP_QUEUE_MAX: usize = 10;
const FOLLOWUP_PREVIEW_CHARS: usize = 80;

const GENERIC_ERROR_REPLY: &str = "Sorry, I encountered an error. Please try again.";
const EMPTY_FINAL_REPLY: &str = "I've completed processing but have no response to give.";

#[derive(Default)]
struct SessionActivity {
    queue: Mutex<VecDeque<InboundMessage>>,
}

/// Dependencies the orchestrator drives a turn with.
pub struct MessageProcessor {
    sessions: Arc<SessionStore>,
    context: Arc<ContextBuilder>,
    tools: Arc<ToolRegistry>,
    bus: Arc<MessageBus>,
    commands: SessionCommandHandler,
    coordinator: Arc<ConsolidationCoordinator>,
    memory: Arc<MemoryStore>,
    provider: Arc<dyn ChatProvider>,
    runner: TurnRunner,
    model: String,
    memory_window: usize,
    send_progress: bool,
    message_tool: Option<Arc<MessageTool>>,
    spawn_tool: Option<Arc<SpawnTool>>,
    active: Mutex<HashMap<String, Arc<SessionActivity>>>,
    last_processed_at: Arc<Mutex<Option<String>>>,
}

impl MessageProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<SessionStore>,
        context: Arc<ContextBuilder>,
        tools: Arc<ToolRegistry>,
        bus: Arc<MessageBus>,
        commands: SessionCommandHandler,
        coordinator: Arc<ConsolidationCoordinator>,
        memory: Arc<MemoryStore>,
        provider: Arc<dyn ChatProvider>,
        runner: TurnRunner,
        model: String,
        memory_window: usize,
        send_progress: bool,
        message_tool: Option<Arc<MessageTool>>,
        spawn_tool: Option<Arc<SpawnTool>>,
    ) -> Self {
        Self {
            sessions,
            context,
            tools,
            bus,
            commands,
            coordinator,
            memory,
            provider,
            runner,
            model,
            memory_window,
            send_progress,
            message_tool,
            spawn_tool,
            active: Mutex::new(HashMap::new()),
            last_processed_at: Arc::new(Mutex::new(None)),
        }
    }

    pub fn last_processed_at(&self) -> Arc<Mutex<Option<String>>> {
        Arc::clone(&self.last_processed_at)
    }

    fn ordering_key(msg: &InboundMessage) -> String {
        if msg.channel == "system" {
            let (channel, chat_id) = Self::split_system_chat_id(&msg.chat_id);
            format!("{channel}:{chat_id}")
        } else {
            msg.session_key()
        }
    }

    fn split_system_chat_id(chat_id: &str) -> (String, String) {
        match chat_id.split_once(':') {
            Some((channel, chat)) => (channel.to_string(), chat.to_string()),
            None => ("cli".to_string(), chat_id.to_string()),
        }
    }

    /// Entry point from the consume loop: enqueue as a follow-up when a turn
    /// is already running for this session, otherwise start a session worker.
    pub fn handle_inbound(self: Arc<Self>, msg: InboundMessage) {
        let key = Self::ordering_key(&msg);
        let activity = {
            let mut active = self.active.lock().unwrap();
            if let Some(activity) = active.get(&key) {
                let mut queue = activity.queue.lock().unwrap();
                if queue.len() >= FOLLOWUP_QUEUE_MAX {
                    warn!(session_key = %key, "follow-up queue full; dropping inbound message");
                } else {
                    debug!(session_key = %key, queued = queue.len() + 1, "queued follow-up");
                    queue.push_back(msg);
                }
                return;
            }
            let activity = Arc::new(SessionActivity::default());
            active.insert(key.clone(), activity.clone());
            activity
        };

        let this = self;
        tokio::spawn(async move {
            let mut next = msg;
            loop {
                this.dispatch_one(&next, &activity).await;
                *this.last_processed_at.lock().unwrap() =
                    Some(Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true));

                let upcoming = {
                    let mut active = this.active.lock().unwrap();
                    let mut queue = activity.queue.lock().unwrap();
                    match queue.pop_front() {
                        Some(m) => Some(m),
                        None => {
                            active.remove(&key);
                            None
                        }
                    }
                };
                match upcoming {
                    Some(m) => next = m,
                    None => break,
                }
            }
        });
    }

    /// Process one message and publish its outcome; errors never escape.
    async fn dispatch_one(&self, msg: &InboundMessage, activity: &Arc<SessionActivity>) {
        match self.process(msg, None, Some(activity)).await {
            Ok(Some(response)) => self.bus.publish_outbound(response),
            Ok(None) => {
                // CLI adapters need a reply for prompt sequencing even when
                // the message tool already answered.
                if msg.channel == "cli" {
                    self.bus.publish_outbound(
                        OutboundMessage::new(&msg.channel, &msg.chat_id, "")
                            .with_metadata(msg.metadata.clone()),
                    );
                }
            }
            Err(e) => {
                error!(
                    error_type = "turn_failure",
                    error = %e,
                    channel = %msg.channel,
                    sender_id = %msg.sender_id,
                    session_key = %Self::ordering_key(msg),
                    "error processing message"
                );
                self.bus.publish_outbound(OutboundMessage::new(
                    &msg.channel,
                    &msg.chat_id,
                    GENERIC_ERROR_REPLY,
                ));
            }
        }
    }

    /// Process a single inbound message and return the response.
    pub async fn process(
        &self,
        msg: &InboundMessage,
        session_key: Option<&str>,
        activity: Option<&Arc<SessionActivity>>,
    ) -> anyhow::Result<Option<OutboundMessage>> {
        if msg.channel == "system" {
            return self.process_system(msg).await.map(Some);
        }
        self.process_regular(msg, session_key, activity).await
    }

    async fn process_system(&self, msg: &InboundMessage) -> anyhow::Result<OutboundMessage> {
        let (channel, chat_id) = Self::split_system_chat_id(&msg.chat_id);
        let key = format!("{channel}:{chat_id}");
        info!(channel = %channel, session_key = %key, sender_id = %msg.sender_id, "processing system message");

        let session_slot = self.sessions.get_or_create(&key);
        self.set_tool_context(&channel, &chat_id, msg.message_id());

        let (initial, skip) = {
            let session = session_slot.lock().await;
            let history = session.history(self.memory_window);
            let initial = self.context.build_messages(
                history,
                &msg.content,
                &[],
                &self.tools,
                &self.memory,
                Some(&channel),
                Some(&chat_id),
            );
            let skip = initial.len() - 1;
            (initial, skip)
        };

        let hooks = self.build_hooks(msg, None);
        let outcome = self.runner.run(initial, &hooks).await?;
        {
            let mut session = session_slot.lock().await;
            save_turn(&mut session, &outcome.messages, skip);
            self.sessions.save(&session)?;
        }
        Ok(OutboundMessage::new(
            &channel,
            &chat_id,
            outcome
                .final_content
                .unwrap_or_else(|| "Background task completed.".to_string()),
        ))
    }

    async fn process_regular(
        &self,
        msg: &InboundMessage,
        session_key: Option<&str>,
        activity: Option<&Arc<SessionActivity>>,
    ) -> anyhow::Result<Option<OutboundMessage>> {
        let key = session_key
            .map(str::to_string)
            .unwrap_or_else(|| msg.session_key());
        let preview: String = msg.content.chars().take(FOLLOWUP_PREVIEW_CHARS).collect();
        info!(
            channel = %msg.channel,
            sender_id = %msg.sender_id,
            session_key = %key,
            chat_id = %msg.chat_id,
            preview = %preview,
            "processing message"
        );

        let session_slot = self.sessions.get_or_create(&key);

        if let Some(response) = self.commands.handle(msg, &session_slot).await {
            return Ok(Some(response));
        }

        let message_count = session_slot.lock().await.messages.len();
        if message_count > self.memory_window {
            self.schedule_background_consolidation(&key, &session_slot);
        }

        self.set_tool_context(&msg.channel, &msg.chat_id, msg.message_id());
        if let Some(message_tool) = &self.message_tool {
            message_tool.start_turn();
        }

        let (initial, skip) = {
            let session = session_slot.lock().await;
            let history = session.history(self.memory_window);
            let initial = self.context.build_messages(
                history,
                &msg.content,
                &msg.media,
                &self.tools,
                &self.memory,
                Some(&msg.channel),
                Some(&msg.chat_id),
            );
            // initial = [system, compacted history…, current user]; persist
            // the current user message and everything the turn appends.
            let skip = initial.len() - 1;
            (initial, skip)
        };

        let hooks = self.build_hooks(msg, activity);
        let outcome = self.runner.run(initial, &hooks).await?;
        let final_content = outcome
            .final_content
            .clone()
            .unwrap_or_else(|| EMPTY_FINAL_REPLY.to_string());
        let reply_preview: String = final_content.chars().take(120).collect();
        info!(preview = %reply_preview, "response ready");

        {
            let mut session = session_slot.lock().await;
            save_turn(&mut session, &outcome.messages, skip);
            self.sessions.save(&session)?;
        }

        if let Some(message_tool) = &self.message_tool {
            if message_tool.sent_in_turn() {
                return Ok(None);
            }
        }

        Ok(Some(
            OutboundMessage::new(&msg.channel, &msg.chat_id, final_content)
                .with_metadata(msg.metadata.clone()),
        ))
    }

    /// Direct entry point for CLI/cron usage.
    pub async fn process_direct(
        &self,
        content: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
    ) -> anyhow::Result<String> {
        let msg = InboundMessage::new(channel, "user", chat_id, content);
        let response = self.process(&msg, Some(session_key), None).await?;
        Ok(response.map(|r| r.content).unwrap_or_default())
    }

    fn set_tool_context(&self, channel: &str, chat_id: &str, message_id: Option<String>) {
        if let Some(message_tool) = &self.message_tool {
            message_tool.set_context(channel, chat_id, message_id);
        }
        if let Some(spawn_tool) = &self.spawn_tool {
            spawn_tool.set_context(channel, chat_id);
        }
    }

    fn build_hooks(&self, msg: &InboundMessage, activity: Option<&Arc<SessionActivity>>) -> TurnHooks {
        let context = Arc::clone(&self.context);
        let guard = Arc::new(move |messages, start, aggressive| {
            context.guard_loop_messages(messages, start, aggressive)
        });

        let on_progress: Option<ProgressFn> = if self.send_progress {
            let bus = Arc::clone(&self.bus);
            let channel = msg.channel.clone();
            let chat_id = msg.chat_id.clone();
            let base_metadata = msg.metadata.clone();
            Some(Arc::new(move |content: &str, is_tool_hint: bool| {
                let mut metadata = base_metadata.clone();
                metadata.insert("_progress".into(), json!(true));
                metadata.insert("_tool_hint".into(), json!(is_tool_hint));
                bus.publish_outbound(
                    OutboundMessage::new(&channel, &chat_id, content).with_metadata(metadata),
                );
            }))
        } else {
            None
        };

        let should_interrupt = activity.map(|activity| {
            let activity = Arc::clone(activity);
            let steer: SteerFn = Arc::new(move || {
                let queue = activity.queue.lock().unwrap();
                if queue.is_empty() {
                    return None;
                }
                let preview = queue.front().map(|m| {
                    let mut p: String =
                        m.content.chars().take(FOLLOWUP_PREVIEW_CHARS).collect();
                    if m.content.chars().count() > FOLLOWUP_PREVIEW_CHARS {
                        p.push_str("...");
                    }
                    p
                });
                Some(SteerDecision {
                    interrupt: true,
                    reason: Some("pending_followup".into()),
                    pending_followup_count: Some(queue.len()),
                    next_followup_preview: preview,
                })
            });
            steer
        });

        TurnHooks {
            guard,
            on_progress,
            on_event: None,
            event_source: "turn_runner".into(),
            should_interrupt_after_tool: should_interrupt,
        }
    }

    /// Single-flight background consolidation for a session that grew past
    /// the memory window. Works on a snapshot clone so the session lock is
    /// not held across provider calls; only the watermark is written back.
    fn schedule_background_consolidation(
        &self,
        key: &str,
        session_slot: &Arc<tokio::sync::Mutex<Session>>,
    ) {
        let memory = Arc::clone(&self.memory);
        let sessions = Arc::clone(&self.sessions);
        let provider = Arc::clone(&self.provider);
        let model = self.model.clone();
        let memory_window = self.memory_window;
        let session_slot = Arc::clone(session_slot);
        let key_owned = key.to_string();

        self.coordinator.start_background(key, async move {
            let mut working = { session_slot.lock().await.clone() };
            let ok = memory
                .consolidate(&mut working, provider.as_ref(), &model, false, memory_window)
                .await;
            if !ok {
                warn!(session_key = %key_owned, "background consolidation failed");
                return;
            }
            let mut session = session_slot.lock().await;
            session.last_consolidated = working.last_consolidated.min(session.messages.len());
            if let Err(e) = sessions.save(&session) {
                warn!(session_key = %key_owned, error = %e, "failed to save session after consolidation");
            }
        });
    }
}

/// Persist new-turn messages into the session: drop reasoning content,
/// replace image payloads with placeholders, truncate long bodies, stamp
/// timestamps.
pub fn save_turn(session: &mut Session, messages: &[ChatMessage], skip: usize) {
    let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    for m in &messages[skip.min(messages.len())..] {
        let mut entry = m.clone();
        entry.reasoning_content = None;
        entry.content = strip_images_from_content(entry.content);

        if let MessageContent::Text(text) = &entry.content {
            let cap = match entry.role {
                Role::Assistant => Some(ASSISTANT_HISTORY_MAX_CHARS),
                Role::Tool => Some(TOOL_RESULT_HISTORY_MAX_CHARS),
                _ => None,
            };
            if let Some(cap) = cap {
                if text.len() > cap {
                    let mut cut = cap;
                    while !text.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    entry.content =
                        MessageContent::Text(format!("{}\n... (truncated)", &text[..cut]));
                }
            }
        }
        if entry.timestamp.is_none() {
            entry.timestamp = Some(now.clone());
        }
        session.messages.push(entry);
    }
    session.updated_at = Utc::now();
}

/// Replace base64 image blocks with a lightweight placeholder; collapse to a
/// plain string when only text remains.
fn strip_images_from_content(content: MessageContent) -> MessageContent {
    let MessageContent::Blocks(blocks) = content else {
        return content;
    };
    let stripped: Vec<ContentBlock> = blocks
        .into_iter()
        .map(|block| match block {
            ContentBlock::ImageUrl { .. } => ContentBlock::text("[image]"),
            other => other,
        })
        .collect();
    let texts: Vec<&str> = stripped
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if texts.len() == stripped.len() {
        MessageContent::Text(texts.join(" "))
    } else {
        MessageContent::Blocks(stripped)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Construction and the main consume loop.
//!
//! `AgentLoop::new` wires the session store, memory store, context builder,
//! tool registry, subagent pool, command handler, and message processor
//! from the loaded configuration. `run` serially pulls inbound messages and
//! dispatches them to per-session workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use nanobot_bus::MessageBus;
use nanobot_config::Config;
use nanobot_memory::MemoryStore;
use nanobot_model::provider::{ChatOptions, ChatProvider};
use nanobot_sessions::{Session, SessionStore};
use nanobot_tools::{
    build_standard_registry, MessageTool, SpawnHandler, SpawnTool, StandardToolOptions,
};

use crate::commands::{ArchiveFn, CancelTasksFn, SessionCommandHandler};
use crate::context::ContextBuilder;
use crate::coordinator::ConsolidationCoordinator;
use crate::processor::MessageProcessor;
use crate::runner::TurnRunner;
use crate::subagent::SubagentManager;

pub struct AgentLoop {
    bus: Arc<MessageBus>,
    processor: Arc<MessageProcessor>,
    subagents: Arc<SubagentManager>,
    running: Arc<AtomicBool>,
    stop_signal: Arc<tokio::sync::Notify>,
    channels_config: nanobot_config::ChannelsConfig,
    provider_streaming: bool,
}

impl AgentLoop {
    pub fn new(
        config: &Config,
        provider: Arc<dyn ChatProvider>,
        provider_streaming: bool,
        bus: Arc<MessageBus>,
    ) -> anyhow::Result<Self> {
        let workspace = &config.agent.workspace;
        std::fs::create_dir_all(workspace)
            .with_context(|| format!("creating workspace {}", workspace.display()))?;

        let sessions = Arc::new(SessionStore::new(workspace).context("opening session store")?);
        let memory = Arc::new(
            MemoryStore::new(workspace)
                .context("opening memory store")?
                .with_policies(
                    &config.memory.daily_sections_mode,
                    &config.memory.preference_conflict_strategy,
                    &config.memory.preference_conflict_keys,
                ),
        );
        let context = Arc::new(ContextBuilder::new(
            workspace,
            config.agent.max_context_tokens,
        ));

        let model = provider.default_model().to_string();
        let opts = ChatOptions {
            model: model.clone(),
            max_tokens: config.agent.max_tokens,
            temperature: config.agent.temperature,
        };

        let tool_options = StandardToolOptions {
            restrict_to_workspace: config.tools.filesystem.restrict_to_workspace,
            max_read_bytes: config.tools.filesystem.max_read_bytes,
            exec_timeout: Duration::from_secs(config.tools.exec.timeout_secs),
            exec_max_output_bytes: config.tools.exec.max_output_bytes,
            brave_api_key: config.tools.web.brave_api_key.clone(),
            web_search_max_results: config.tools.web.search_max_results,
            web_fetch_timeout: Duration::from_secs(config.tools.web.fetch_timeout_secs),
            web_fetch_max_bytes: config.tools.web.fetch_max_bytes,
            web_fetch_max_redirects: config.tools.web.fetch_max_redirects,
            audit: config.tools.audit_tool_calls,
        };

        let subagents = SubagentManager::new(
            Arc::clone(&provider),
            workspace.clone(),
            Arc::clone(&bus),
            opts.clone(),
            tool_options.clone(),
            config.agent.subagents.max_concurrent,
            Duration::from_secs(config.agent.subagents.timeout_secs),
            config.agent.subagents.max_iterations,
        );

        // The full registry: leaf tools plus message/spawn. Keep direct
        // handles to the two routing-aware tools for per-turn context.
        let mut registry = build_standard_registry(workspace, &tool_options, None, None);
        let message_tool = Arc::new(MessageTool::new(Arc::clone(&bus)));
        registry.register(message_tool.clone());
        let spawn_tool = Arc::new(SpawnTool::new(
            Arc::clone(&subagents) as Arc<dyn SpawnHandler>
        ));
        registry.register(spawn_tool.clone());
        let tools = Arc::new(registry);

        let coordinator = Arc::new(ConsolidationCoordinator::new());

        let archive_snapshot: ArchiveFn = {
            let memory = Arc::clone(&memory);
            let provider = Arc::clone(&provider);
            let model = model.clone();
            let memory_window = config.agent.memory_window;
            Arc::new(move |mut snapshot: Session| {
                let memory = Arc::clone(&memory);
                let provider = Arc::clone(&provider);
                let model = model.clone();
                Box::pin(async move {
                    memory
                        .consolidate(&mut snapshot, provider.as_ref(), &model, true, memory_window)
                        .await
                })
            })
        };
        let cancel_session_tasks: CancelTasksFn = {
            let subagents = Arc::clone(&subagents);
            Arc::new(move |session_key: String| {
                let subagents = Arc::clone(&subagents);
                Box::pin(async move { subagents.cancel_by_session(&session_key).await })
            })
        };
        let commands = SessionCommandHandler::new(
            Arc::clone(&sessions),
            Arc::clone(&coordinator),
            archive_snapshot,
            Some(cancel_session_tasks),
        );

        let runner = TurnRunner::new(
            Arc::clone(&provider),
            Arc::clone(&tools),
            opts,
            config.agent.max_iterations,
            config.agent.llm_retry_max,
        );

        let processor = Arc::new(MessageProcessor::new(
            sessions,
            context,
            tools,
            Arc::clone(&bus),
            commands,
            coordinator,
            memory,
            provider,
            runner,
            model,
            config.agent.memory_window,
            config.channels.send_progress,
            Some(message_tool),
            Some(spawn_tool),
        ));

        Ok(Self {
            bus,
            processor,
            subagents,
            running: Arc::new(AtomicBool::new(false)),
            stop_signal: Arc::new(tokio::sync::Notify::new()),
            channels_config: config.channels.clone(),
            provider_streaming,
        })
    }

    /// Run the consume loop until [`stop`] is called.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!("agent loop started");
        loop {
            tokio::select! {
                msg = self.bus.consume_inbound() => {
                    Arc::clone(&self.processor).handle_inbound(msg);
                }
                _ = self.stop_signal.notified() => break,
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!("agent loop stopped");
    }

    /// Signal the consume loop to stop after the current dispatch.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_signal.notify_waiters();
        info!("agent loop stopping");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        Arc::clone(&self.bus)
    }

    pub fn subagents(&self) -> Arc<SubagentManager> {
        Arc::clone(&self.subagents)
    }

    pub fn last_processed_at(&self) -> Arc<Mutex<Option<String>>> {
        self.processor.last_processed_at()
    }

    pub fn channels_config(&self) -> &nanobot_config::ChannelsConfig {
        &self.channels_config
    }

    pub fn provider_streaming_supported(&self) -> bool {
        self.provider_streaming
    }

    /// Process a message directly (CLI or cron usage), bypassing the bus.
    pub async fn process_direct(
        &self,
        content: &str,
        session_key: &str,
        channel: &str,
        chat_id: &str,
    ) -> anyhow::Result<String> {
        self.processor
            .process_direct(content, session_key, channel, chat_id)
            .await
    }
}

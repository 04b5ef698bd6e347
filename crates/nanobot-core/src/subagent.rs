// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded background task pool running focused subagent turns.
//!
//! Each subagent gets a fresh runner with a restricted tool registry (no
//! `message`, no `spawn`), a hard timeout, and a tighter iteration bound.
//! Results are announced back to the origin chat as a synthetic inbound
//! message on the `system` channel so the main agent narrates the outcome.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use tracing::{error, info, warn};

use nanobot_bus::{InboundMessage, MessageBus};
use nanobot_model::{provider::ChatOptions, ChatMessage, ChatProvider};
use nanobot_tools::{build_standard_registry, SpawnHandler, StandardToolOptions};

use crate::runner::{TurnHooks, TurnRunner};

pub struct SubagentManager {
    provider: Arc<dyn ChatProvider>,
    workspace: PathBuf,
    bus: Arc<MessageBus>,
    opts: ChatOptions,
    tool_options: StandardToolOptions,
    max_concurrent: usize,
    timeout: Duration,
    max_iterations: u32,
    running: Mutex<HashMap<String, tokio::task::AbortHandle>>,
    session_tasks: Mutex<HashMap<String, HashSet<String>>>,
    /// Self-handle so spawned tasks can call back into the manager.
    weak_self: Weak<SubagentManager>,
}

impl SubagentManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        workspace: PathBuf,
        bus: Arc<MessageBus>,
        opts: ChatOptions,
        tool_options: StandardToolOptions,
        max_concurrent: usize,
        timeout: Duration,
        max_iterations: u32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            provider,
            workspace,
            bus,
            opts,
            tool_options,
            max_concurrent,
            timeout,
            max_iterations,
            running: Mutex::new(HashMap::new()),
            session_tasks: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().unwrap().len()
    }

    /// Cancel every running subagent for a session. Returns the count.
    pub async fn cancel_by_session(&self, session_key: &str) -> usize {
        let task_ids: Vec<String> = self
            .session_tasks
            .lock()
            .unwrap()
            .get(session_key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        let mut cancelled = 0usize;
        for task_id in &task_ids {
            if let Some(handle) = self.running.lock().unwrap().remove(task_id) {
                handle.abort();
                cancelled += 1;
            }
        }
        self.session_tasks.lock().unwrap().remove(session_key);
        cancelled
    }

    fn cleanup(&self, task_id: &str, session_key: Option<&str>) {
        self.running.lock().unwrap().remove(task_id);
        if let Some(key) = session_key {
            let mut session_tasks = self.session_tasks.lock().unwrap();
            if let Some(ids) = session_tasks.get_mut(key) {
                ids.remove(task_id);
                if ids.is_empty() {
                    session_tasks.remove(key);
                }
            }
        }
    }

    fn build_subagent_prompt(&self, _task: &str) -> String {
        let now = Local::now().format("%Y-%m-%d %H:%M (%A)");
        let workspace = self.workspace.display();
        format!(
            "# Subagent\n\n\
             ## Current Time\n{now}\n\n\
             You are a subagent spawned by the main agent to complete a specific task.\n\n\
             ## Rules\n\
             1. Stay focused - complete only the assigned task, nothing else\n\
             2. Your final response will be reported back to the main agent\n\
             3. Do not initiate conversations or take on side tasks\n\
             4. Be concise but informative in your findings\n\n\
             ## What You Can Do\n\
             - Read and write files in the workspace\n\
             - Execute shell commands\n\
             - Search the web and fetch web pages\n\
             - Complete the task thoroughly\n\n\
             ## What You Cannot Do\n\
             - Send messages directly to users (no message tool available)\n\
             - Spawn other subagents\n\
             - Access the main agent's conversation history\n\n\
             ## Workspace\n\
             Your workspace is at: {workspace}\n\n\
             When you have completed the task, provide a clear summary of your findings or actions."
        )
    }

    fn announcement_content(label: &str, task: &str, result: &str, ok: bool) -> String {
        let status_text = if ok { "completed successfully" } else { "failed" };
        format!(
            "[Subagent '{label}' {status_text}]\n\n\
             Task: {task}\n\n\
             Result:\n{result}\n\n\
             Summarize this naturally for the user. Keep it brief (1-2 sentences). \
             Do not mention technical details like \"subagent\" or task IDs."
        )
    }

    async fn announce(&self, task_id: &str, label: &str, task: &str, result: &str, ok: bool, origin_channel: &str, origin_chat_id: &str) {
        let msg = InboundMessage::new(
            "system",
            "subagent",
            format!("{origin_channel}:{origin_chat_id}"),
            Self::announcement_content(label, task, result, ok),
        );
        self.bus.publish_inbound(msg);
        info!(task_id, channel = origin_channel, chat_id = origin_chat_id, "subagent announced result");
    }

    async fn run_subagent(self: Arc<Self>, task_id: String, task: String, label: String, origin_channel: String, origin_chat_id: String) {
        info!(task_id = %task_id, label = %label, "subagent starting task");
        let tools = Arc::new(build_standard_registry(
            &self.workspace,
            &self.tool_options,
            None,
            None,
        ));
        let runner = TurnRunner::new(
            self.provider.clone(),
            tools,
            self.opts.clone(),
            self.max_iterations,
            1,
        );
        let messages = vec![
            ChatMessage::system(self.build_subagent_prompt(&task)),
            ChatMessage::user(task.clone()),
        ];
        let hooks = TurnHooks::passthrough("subagent");

        let outcome = tokio::time::timeout(self.timeout, runner.run(messages, &hooks)).await;
        match outcome {
            Err(_) => {
                warn!(task_id = %task_id, "subagent timed out");
                self.announce(
                    &task_id,
                    &label,
                    &task,
                    &format!("Error: task timed out after {}s", self.timeout.as_secs()),
                    false,
                    &origin_channel,
                    &origin_chat_id,
                )
                .await;
            }
            Ok(Err(e)) => {
                error!(task_id = %task_id, error = %e, "subagent failed");
                self.announce(
                    &task_id,
                    &label,
                    &task,
                    &format!("Error: {e}"),
                    false,
                    &origin_channel,
                    &origin_chat_id,
                )
                .await;
            }
            Ok(Ok(outcome)) => {
                let result = outcome
                    .final_content
                    .unwrap_or_else(|| "Task completed but no final response was generated.".into());
                info!(task_id = %task_id, "subagent completed successfully");
                self.announce(&task_id, &label, &task, &result, true, &origin_channel, &origin_chat_id)
                    .await;
            }
        }
    }
}

#[async_trait]
impl SpawnHandler for SubagentManager {
    async fn spawn(
        &self,
        task: &str,
        label: Option<&str>,
        origin_channel: &str,
        origin_chat_id: &str,
        session_key: Option<&str>,
    ) -> String {
        if self.running_count() >= self.max_concurrent {
            return format!(
                "Cannot spawn subagent: limit of {} concurrent subagents reached. \
                 Wait for one to finish.",
                self.max_concurrent
            );
        }

        let task_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let display_label = label.map(str::to_string).unwrap_or_else(|| {
            let mut short: String = task.chars().take(30).collect();
            if task.chars().count() > 30 {
                short.push_str("...");
            }
            short
        });

        let Some(manager) = self.weak_self.upgrade() else {
            return "Cannot spawn subagent: the manager is shutting down.".to_string();
        };

        let session_key_owned = session_key.map(str::to_string);
        let task_owned = task.to_string();
        let label_owned = display_label.clone();
        let channel = origin_channel.to_string();
        let chat_id = origin_chat_id.to_string();
        let id_for_task = task_id.clone();
        let cleanup_manager = manager.clone();
        let session_key_for_cleanup = session_key_owned.clone();

        // The task waits for registration so its cleanup cannot race the
        // bookkeeping inserts below.
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = ready_rx.await;
            manager
                .clone()
                .run_subagent(id_for_task.clone(), task_owned, label_owned, channel, chat_id)
                .await;
            cleanup_manager.cleanup(&id_for_task, session_key_for_cleanup.as_deref());
        });

        self.running
            .lock()
            .unwrap()
            .insert(task_id.clone(), handle.abort_handle());
        if let Some(key) = session_key {
            self.session_tasks
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .insert(task_id.clone());
        }
        let _ = ready_tx.send(());

        info!(task_id = %task_id, label = %display_label, session_key = ?session_key, "spawned subagent");
        format!(
            "Subagent [{display_label}] started (id: {task_id}). I'll notify you when it completes."
        )
    }
}

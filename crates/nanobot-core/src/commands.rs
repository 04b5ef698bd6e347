// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Slash commands operating on conversation sessions.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::{debug, error, warn};

use nanobot_bus::{InboundMessage, OutboundMessage};
use nanobot_sessions::{Session, SessionStore};

use crate::coordinator::ConsolidationCoordinator;

/// Archive a snapshot session into long-term memory (archive-all mode).
pub type ArchiveFn = Arc<dyn Fn(Session) -> BoxFuture<'static, bool> + Send + Sync>;
/// Cancel running subagents for a session key; returns the count.
pub type CancelTasksFn = Arc<dyn Fn(String) -> BoxFuture<'static, usize> + Send + Sync>;

const HELP_TEXT: &str = "nanobot commands:\n\
    /new — Archive and start a new conversation\n\
    /new! — Force new conversation (clear even if archival fails)\n\
    /stop — Stop running background tasks for this conversation\n\
    /help — Show available commands";

const ARCHIVE_SUMMARY_EVERY: u64 = 10;

#[derive(Default)]
struct ArchiveStats {
    count: u64,
    ok: u64,
    failed: u64,
    errored: u64,
    elapsed_ms_total: f64,
}

impl ArchiveStats {
    fn record(&mut self, ok: bool, elapsed_ms: f64) {
        self.count += 1;
        self.elapsed_ms_total += elapsed_ms;
        if ok {
            self.ok += 1;
        } else {
            self.failed += 1;
        }
        if self.count % ARCHIVE_SUMMARY_EVERY == 0 {
            debug!(
                total = self.count,
                ok = self.ok,
                failed = self.failed,
                errored = self.errored,
                avg_elapsed_ms = self.elapsed_ms_total / self.count as f64,
                "/new background archival summary"
            );
        }
    }
}

/// Handles `/help`, `/stop`, and `/new` (plus forced variants).
pub struct SessionCommandHandler {
    sessions: Arc<SessionStore>,
    coordinator: Arc<ConsolidationCoordinator>,
    archive_snapshot: ArchiveFn,
    cancel_session_tasks: Option<CancelTasksFn>,
    stats: Arc<Mutex<ArchiveStats>>,
}

impl SessionCommandHandler {
    pub fn new(
        sessions: Arc<SessionStore>,
        coordinator: Arc<ConsolidationCoordinator>,
        archive_snapshot: ArchiveFn,
        cancel_session_tasks: Option<CancelTasksFn>,
    ) -> Self {
        Self {
            sessions,
            coordinator,
            archive_snapshot,
            cancel_session_tasks,
            stats: Arc::new(Mutex::new(ArchiveStats::default())),
        }
    }

    /// Return the command response when `msg` is a command, else None.
    pub async fn handle(
        &self,
        msg: &InboundMessage,
        session_slot: &Arc<tokio::sync::Mutex<Session>>,
    ) -> Option<OutboundMessage> {
        let cmd = msg.content.trim().to_lowercase();
        let force_new = matches!(cmd.as_str(), "/new!" | "/new --force" | "/new -f");

        if cmd == "/new" || force_new {
            return Some(self.handle_new(msg, session_slot, force_new).await);
        }
        if cmd == "/help" {
            return Some(OutboundMessage::new(&msg.channel, &msg.chat_id, HELP_TEXT));
        }
        if cmd == "/stop" {
            return Some(self.handle_stop(msg, session_slot).await);
        }
        None
    }

    async fn handle_stop(
        &self,
        msg: &InboundMessage,
        session_slot: &Arc<tokio::sync::Mutex<Session>>,
    ) -> OutboundMessage {
        let session_key = session_slot.lock().await.key.clone();
        let content = match &self.cancel_session_tasks {
            Some(cancel) => {
                let cancelled = cancel(session_key).await;
                if cancelled > 0 {
                    format!("Stopped {cancelled} task(s).")
                } else {
                    "No active task to stop.".to_string()
                }
            }
            None => "No active task to stop.".to_string(),
        };
        OutboundMessage::new(&msg.channel, &msg.chat_id, content)
    }

    async fn handle_new(
        &self,
        msg: &InboundMessage,
        session_slot: &Arc<tokio::sync::Mutex<Session>>,
        force_new: bool,
    ) -> OutboundMessage {
        let session_key = session_slot.lock().await.key.clone();
        self.coordinator.cancel_inflight(&session_key).await;

        let snapshot: Vec<_> = {
            let session = session_slot.lock().await;
            session.messages[session.last_consolidated.min(session.messages.len())..].to_vec()
        };

        if !snapshot.is_empty() {
            let mut temp = Session::new(&session_key);
            let snapshot_len = snapshot.len();
            temp.messages = snapshot;

            let archive = self.archive_snapshot.clone();
            let stats = Arc::clone(&self.stats);
            let key_for_log = session_key.clone();
            let scheduled = self.coordinator.start_background(&session_key, async move {
                let started = Instant::now();
                let ok = archive(temp).await;
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                stats.lock().unwrap().record(ok, elapsed_ms);
                if ok {
                    debug!(
                        session_key = %key_for_log,
                        force_new,
                        elapsed_ms,
                        snapshot_len,
                        "/new background archival done"
                    );
                } else {
                    warn!(
                        session_key = %key_for_log,
                        force_new,
                        elapsed_ms,
                        snapshot_len,
                        "/new background archival failed"
                    );
                }
            });
            if scheduled.is_none() {
                debug!(session_key = %session_key, "/new background archival skipped (already in progress)");
            }
        }

        {
            let mut session = session_slot.lock().await;
            session.clear();
            if let Err(e) = self.sessions.save(&session) {
                error!(session_key = %session.key, error = %e, "failed to save cleared session");
            }
        }
        self.sessions.invalidate(&session_key);

        let content = if force_new {
            "New session started (forced). Memory archival may have failed."
        } else {
            "New session started."
        };
        OutboundMessage::new(&msg.channel, &msg.chat_id, content)
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Append-only JSONL session persistence.
//!
//! One file per session key under `<workspace>/sessions/`. The first line is
//! a `_type: "metadata"` record; every following line is one message in
//! order. Messages are never rewritten in place — consolidation only
//! advances `last_consolidated` in the metadata line.
//!
//! Saves are elided when the session signature is unchanged, so the frequent
//! save-after-turn path does not touch disk for idle sessions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use nanobot_model::{sorted_json, ChatMessage};

/// A conversation session.
///
/// `last_consolidated` is the index of the first message NOT yet summarized
/// into long-term memory; invariant `0 ≤ last_consolidated ≤ messages.len()`.
#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub last_consolidated: usize,
}

impl Session {
    pub fn new(key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: serde_json::Map::new(),
            last_consolidated: 0,
        }
    }

    /// Recent messages in provider format: role/content plus tool-protocol
    /// keys, with internal persistence fields left behind.
    pub fn history(&self, max_messages: usize) -> Vec<ChatMessage> {
        let start = self.messages.len().saturating_sub(max_messages);
        self.messages[start..]
            .iter()
            .map(|m| {
                let mut entry = ChatMessage {
                    role: m.role,
                    content: m.content.clone(),
                    ..ChatMessage::user("")
                };
                entry.tool_calls = m.tool_calls.clone();
                entry.tool_call_id = m.tool_call_id.clone();
                entry.name = m.name.clone();
                entry
            })
            .collect()
    }

    /// Reset to the initial state (used by `/new`).
    pub fn clear(&mut self) {
        self.messages.clear();
        self.last_consolidated = 0;
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataLine {
    #[serde(rename = "_type")]
    record_type: String,
    key: String,
    created_at: String,
    updated_at: String,
    #[serde(default)]
    metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    last_consolidated: usize,
}

/// Summary row returned by [`SessionStore::list_sessions`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub key: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub path: PathBuf,
}

#[derive(Default)]
struct StoreState {
    cache: HashMap<String, Arc<tokio::sync::Mutex<Session>>>,
    persisted_signatures: HashMap<String, String>,
    save_writes: u64,
    save_skips: u64,
}

/// Session persistence with an in-memory cache slot per key.
pub struct SessionStore {
    sessions_dir: PathBuf,
    legacy_sessions_dir: PathBuf,
    state: Mutex<StoreState>,
}

impl SessionStore {
    pub fn new(workspace: &Path) -> std::io::Result<Self> {
        let sessions_dir = workspace.join("sessions");
        std::fs::create_dir_all(&sessions_dir)?;
        let legacy_sessions_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nanobot")
            .join("sessions");
        Ok(Self {
            sessions_dir,
            legacy_sessions_dir,
            state: Mutex::new(StoreState::default()),
        })
    }

    fn session_path(&self, key: &str) -> PathBuf {
        self.sessions_dir
            .join(format!("{}.jsonl", safe_filename(key)))
    }

    fn legacy_session_path(&self, key: &str) -> PathBuf {
        self.legacy_sessions_dir
            .join(format!("{}.jsonl", safe_filename(key)))
    }

    /// Get the cached session for `key`, loading from disk (including a
    /// one-time legacy-path migration) or creating a fresh one.
    pub fn get_or_create(&self, key: &str) -> Arc<tokio::sync::Mutex<Session>> {
        if let Some(cached) = self.state.lock().unwrap().cache.get(key) {
            return Arc::clone(cached);
        }

        let loaded = self.load(key);
        let mut state = self.state.lock().unwrap();
        // Another caller may have raced the load; the first insert wins.
        if let Some(cached) = state.cache.get(key) {
            return Arc::clone(cached);
        }
        if let Some(session) = &loaded {
            state
                .persisted_signatures
                .insert(key.to_string(), persist_signature(session));
        }
        let session = Arc::new(tokio::sync::Mutex::new(
            loaded.unwrap_or_else(|| Session::new(key)),
        ));
        state.cache.insert(key.to_string(), Arc::clone(&session));
        session
    }

    fn load(&self, key: &str) -> Option<Session> {
        let path = self.session_path(key);
        if !path.exists() {
            let legacy = self.legacy_session_path(key);
            if legacy.exists() {
                match std::fs::rename(&legacy, &path)
                    .or_else(|_| std::fs::copy(&legacy, &path).map(|_| ()))
                {
                    Ok(()) => info!(session_key = key, "migrated session from legacy path"),
                    Err(e) => {
                        warn!(session_key = key, error = %e, "failed to migrate session")
                    }
                }
            }
        }
        if !path.exists() {
            return None;
        }

        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) => {
                warn!(session_key = key, error = %e, "failed to read session");
                return None;
            }
        };

        let mut session = Session::new(key);
        let mut have_metadata = false;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !have_metadata {
                if let Ok(meta) = serde_json::from_str::<MetadataLine>(line) {
                    if meta.record_type == "metadata" {
                        session.metadata = meta.metadata;
                        session.last_consolidated = meta.last_consolidated;
                        if let Ok(t) = DateTime::parse_from_rfc3339(&meta.created_at) {
                            session.created_at = t.with_timezone(&Utc);
                        }
                        if let Ok(t) = DateTime::parse_from_rfc3339(&meta.updated_at) {
                            session.updated_at = t.with_timezone(&Utc);
                        }
                        have_metadata = true;
                        continue;
                    }
                }
            }
            match serde_json::from_str::<ChatMessage>(line) {
                Ok(msg) => session.messages.push(msg),
                Err(e) => {
                    warn!(session_key = key, error = %e, "skipping unparseable session line")
                }
            }
        }
        Some(session)
    }

    /// Save the session snapshot, skipping the write when nothing changed.
    pub fn save(&self, session: &Session) -> std::io::Result<()> {
        let path = self.session_path(&session.key);
        let signature = persist_signature(session);

        {
            let mut state = self.state.lock().unwrap();
            if path.exists()
                && state.persisted_signatures.get(&session.key) == Some(&signature)
            {
                state.save_skips += 1;
                debug!(
                    session_key = %session.key,
                    message_count = session.messages.len(),
                    save_writes = state.save_writes,
                    save_skips = state.save_skips,
                    "session save skipped"
                );
                return Ok(());
            }
        }

        write_session_file(&path, session)?;

        let mut state = self.state.lock().unwrap();
        state.save_writes += 1;
        state
            .persisted_signatures
            .insert(session.key.clone(), signature);
        debug!(
            session_key = %session.key,
            message_count = session.messages.len(),
            last_consolidated = session.last_consolidated,
            save_writes = state.save_writes,
            save_skips = state.save_skips,
            "session save written"
        );
        Ok(())
    }

    /// Drop the cache slot and persisted signature for `key`.
    pub fn invalidate(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.cache.remove(key);
        state.persisted_signatures.remove(key);
    }

    /// List sessions by reading only each file's metadata line.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.sessions_dir) else {
            return out;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            let Some(first) = text.lines().next() else {
                continue;
            };
            if let Ok(meta) = serde_json::from_str::<MetadataLine>(first) {
                if meta.record_type == "metadata" {
                    out.push(SessionInfo {
                        key: meta.key,
                        created_at: Some(meta.created_at),
                        updated_at: Some(meta.updated_at),
                        path,
                    });
                }
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    /// (writes, skips) counters for periodic logging.
    pub fn save_counters(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.save_writes, state.save_skips)
    }
}

/// Compact signature of the persisted content; equal signatures elide writes.
fn persist_signature(session: &Session) -> String {
    let metadata_json = sorted_json(&serde_json::Value::Object(session.metadata.clone()));
    let last_msg_json = session
        .messages
        .last()
        .and_then(|m| serde_json::to_value(m).ok())
        .map(|v| sorted_json(&v))
        .unwrap_or_default();
    format!(
        "{}|{}|{}|{}|{}|{}|{}",
        session.key,
        session.created_at.to_rfc3339(),
        session.updated_at.to_rfc3339(),
        session.last_consolidated,
        session.messages.len(),
        metadata_json,
        last_msg_json,
    )
}

/// Write the full JSONL snapshot via temp file + rename.
fn write_session_file(path: &Path, session: &Session) -> std::io::Result<()> {
    use std::io::Write;

    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    let metadata = MetadataLine {
        record_type: "metadata".into(),
        key: session.key.clone(),
        created_at: session.created_at.to_rfc3339(),
        updated_at: session.updated_at.to_rfc3339(),
        metadata: session.metadata.clone(),
        last_consolidated: session.last_consolidated,
    };
    writeln!(tmp, "{}", serde_json::to_string(&metadata)?)?;
    for msg in &session.messages {
        writeln!(tmp, "{}", serde_json::to_string(msg)?)?;
    }
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

fn safe_filename(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_model::ChatMessage;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let (_dir, store) = store();
        {
            let slot = store.get_or_create("telegram:42");
            let mut session = slot.lock().await;
            session.messages.push(ChatMessage::user("hi"));
            session.messages.push(ChatMessage::assistant("hello"));
            session.last_consolidated = 1;
            session
                .metadata
                .insert("lang".into(), serde_json::json!("en"));
            store.save(&session).unwrap();
        }
        store.invalidate("telegram:42");

        let slot = store.get_or_create("telegram:42");
        let session = slot.lock().await;
        assert_eq!(session.key, "telegram:42");
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].text(), "hi");
        assert_eq!(session.last_consolidated, 1);
        assert_eq!(session.metadata["lang"], serde_json::json!("en"));
    }

    #[tokio::test]
    async fn unchanged_save_does_not_touch_the_file() {
        let (_dir, store) = store();
        let slot = store.get_or_create("cli:direct");
        let session = {
            let mut s = slot.lock().await;
            s.messages.push(ChatMessage::user("x"));
            s.clone()
        };
        store.save(&session).unwrap();
        let path = store.session_path("cli:direct");
        let mtime_before = std::fs::metadata(&path).unwrap().modified().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(30));
        store.save(&session).unwrap();
        let mtime_after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(mtime_before, mtime_after, "elided save must not rewrite");
        let (writes, skips) = store.save_counters();
        assert_eq!((writes, skips), (1, 1));
    }

    #[tokio::test]
    async fn changed_message_count_forces_write() {
        let (_dir, store) = store();
        let slot = store.get_or_create("cli:direct");
        let mut session = {
            let mut s = slot.lock().await;
            s.messages.push(ChatMessage::user("x"));
            s.clone()
        };
        store.save(&session).unwrap();
        session.messages.push(ChatMessage::assistant("y"));
        store.save(&session).unwrap();
        assert_eq!(store.save_counters().0, 2);
    }

    #[tokio::test]
    async fn history_strips_internal_fields_but_keeps_protocol_keys() {
        let (_dir, store) = store();
        let slot = store.get_or_create("cli:direct");
        let mut session = slot.lock().await;
        let mut tool_msg = ChatMessage::tool_result("c1", "exec", "out");
        tool_msg.timestamp = Some("2026-01-01T00:00:00Z".into());
        tool_msg.tool_details = Some(serde_json::json!({"schema_version": 1}));
        session.messages.push(ChatMessage::user("run it"));
        session.messages.push(tool_msg);

        let history = session.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].tool_call_id.as_deref(), Some("c1"));
        assert!(history[1].timestamp.is_none());
        assert!(history[1].tool_details.is_none());
    }

    #[tokio::test]
    async fn history_respects_max_messages_window() {
        let (_dir, store) = store();
        let slot = store.get_or_create("cli:direct");
        let mut session = slot.lock().await;
        for i in 0..10 {
            session.messages.push(ChatMessage::user(format!("m{i}")));
        }
        let history = session.history(3);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].text(), "m7");
    }

    #[tokio::test]
    async fn list_sessions_reads_metadata_line() {
        let (_dir, store) = store();
        let slot = store.get_or_create("telegram:1");
        store.save(&slot.lock().await.clone()).unwrap();
        let listed = store.list_sessions();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "telegram:1");
    }

    #[test]
    fn safe_filename_replaces_separator() {
        assert_eq!(safe_filename("telegram:42"), "telegram_42");
        assert_eq!(safe_filename("a/b\\c"), "a_b_c");
    }

    #[tokio::test]
    async fn clear_resets_messages_and_watermark() {
        let (_dir, store) = store();
        let slot = store.get_or_create("cli:direct");
        let mut session = slot.lock().await;
        session.messages.push(ChatMessage::user("x"));
        session.last_consolidated = 1;
        session.clear();
        assert!(session.messages.is_empty());
        assert_eq!(session.last_consolidated, 0);
    }
}

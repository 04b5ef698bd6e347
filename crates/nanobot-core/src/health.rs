// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Lightweight HTTP health endpoint (no web framework).
//!
//! `GET /health` returns agent-loop state, channel statuses, queue depths,
//! and the last-processed timestamp. `?debug=events` adds the turn-event
//! capabilities manifest; `?debug=stream` adds streaming diagnostics.
//! Non-GET requests get 405; unknown paths 404.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

use nanobot_bus::MessageBus;

use crate::agent::AgentLoop;
use crate::events::turn_event_capabilities;

const HTTP_200: &str = "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n";
const HTTP_404: &str =
    "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nNot Found";
const HTTP_405: &str = "HTTP/1.1 405 Method Not Allowed\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nMethod Not Allowed";

/// Channel adapters register their live status here.
pub type ChannelStatuses = Arc<Mutex<HashMap<String, Value>>>;

pub struct HealthServer {
    agent: Arc<AgentLoop>,
    bus: Arc<MessageBus>,
    channels: ChannelStatuses,
    host: String,
    port: u16,
}

impl HealthServer {
    pub fn new(
        agent: Arc<AgentLoop>,
        bus: Arc<MessageBus>,
        channels: ChannelStatuses,
        host: &str,
        port: u16,
    ) -> Self {
        Self {
            agent,
            bus,
            channels,
            host: host.to_string(),
            port,
        }
    }

    fn stream_diagnostics(&self) -> Value {
        let config = self.agent.channels_config();
        let stream_mode = config.stream_mode.trim().to_lowercase();
        let effective_stream_enabled = match stream_mode.as_str() {
            "off" => false,
            "force" => true,
            _ => config.stream_enabled,
        };
        let provider_stream_supported = self.agent.provider_streaming_supported();
        let llm_stream_ready = effective_stream_enabled && provider_stream_supported;
        let progress_path_ready = config.send_progress || effective_stream_enabled;
        let stream_effective = llm_stream_ready && progress_path_ready;

        let mut reasons: Vec<&str> = Vec::new();
        if effective_stream_enabled && !provider_stream_supported {
            reasons.push("provider_missing_stream_chat");
        }
        if effective_stream_enabled && !progress_path_ready {
            reasons.push("progress_path_disabled");
        }
        if !effective_stream_enabled {
            reasons.push("stream_disabled");
        }
        if stream_effective {
            reasons.push("ok");
        }

        json!({
            "stream_mode": stream_mode,
            "stream_enabled": config.stream_enabled,
            "effective_stream_enabled": effective_stream_enabled,
            "send_progress": config.send_progress,
            "provider_stream_supported": provider_stream_supported,
            "llm_stream_ready": llm_stream_ready,
            "progress_path_ready": progress_path_ready,
            "stream_effective": stream_effective,
            "reason": reasons,
        })
    }

    fn build_payload(&self, debug: Option<&str>) -> Value {
        let last_processed_at = self.agent.last_processed_at().lock().unwrap().clone();
        let channels: Value = {
            let map = self.channels.lock().unwrap();
            json!(map.clone())
        };
        let mut payload = json!({
            "status": "ok",
            "agent_loop": {"running": self.agent.is_running()},
            "channels": channels,
            "queue": {
                "inbound_depth": self.bus.inbound_depth(),
                "outbound_depth": self.bus.outbound_depth(),
            },
            "last_processed_at": last_processed_at,
        });
        match debug {
            Some("events") => {
                payload["debug"] = json!({
                    "turn_event_capabilities": turn_event_capabilities(),
                    "stream_diagnostics": self.stream_diagnostics(),
                });
            }
            Some("stream") => {
                payload["debug"] = json!({
                    "stream_diagnostics": self.stream_diagnostics(),
                });
            }
            _ => {}
        }
        payload
    }

    async fn handle(&self, stream: tokio::net::TcpStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut request_line = String::new();
        let read = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            reader.read_line(&mut request_line),
        )
        .await;
        if !matches!(read, Ok(Ok(n)) if n > 0) {
            return;
        }

        // Drain remaining headers.
        loop {
            let mut line = String::new();
            let read = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                reader.read_line(&mut line),
            )
            .await;
            match read {
                Ok(Ok(n)) if n > 0 && line.trim() != "" => continue,
                _ => break,
            }
        }

        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("");
        let target = parts.next().unwrap_or("");
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (target, None),
        };

        let response = if method != "GET" {
            HTTP_405.to_string()
        } else if path == "/health" {
            let debug = query.and_then(|q| {
                q.split('&')
                    .find_map(|pair| pair.strip_prefix("debug=").map(str::to_string))
            });
            let body = serde_json::to_string_pretty(&self.build_payload(debug.as_deref()))
                .unwrap_or_else(|_| "{}".into());
            format!("{HTTP_200}{body}")
        } else {
            HTTP_404.to_string()
        };

        let _ = write_half.write_all(response.as_bytes()).await;
        let _ = write_half.shutdown().await;
    }

    /// Bind and serve until the process exits.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port)).await?;
        info!(host = %self.host, port = self.port, "health server started");
        self.serve(listener).await
    }

    /// Serve on an already-bound listener (lets tests use an ephemeral port).
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move { server.handle(stream).await });
                }
                Err(e) => warn!(error = %e, "health accept failed"),
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

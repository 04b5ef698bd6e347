// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

fn default_workspace() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nanobot")
        .join("workspace")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Model identifier forwarded to the provider API.
    pub model: String,
    /// Environment variable that holds the API key (read at runtime).
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files so secrets stay
    /// out of version-controlled files.
    pub api_key: Option<String>,
    /// Base URL of an OpenAI-compatible endpoint, ending before
    /// `/chat/completions` (e.g. `https://openrouter.ai/api/v1`).
    pub base_url: Option<String>,
    /// Mark the static system block and tool definitions cacheable
    /// (providers that support prompt caching honour this; others ignore it).
    #[serde(default = "default_true")]
    pub prompt_caching: bool,
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: "anthropic/claude-opus-4-5".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            prompt_caching: true,
            resilience: ResilienceConfig::default(),
        }
    }
}

impl ProviderConfig {
    /// Resolve the effective API key: explicit value wins, then the
    /// configured environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.api_key {
            if !k.is_empty() {
                return Some(k.clone());
            }
        }
        self.api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|k| !k.is_empty())
    }
}

/// Timeout / retry / circuit-breaker settings for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Per-request timeout in seconds. A hard safety-net timeout of
    /// `timeout + 30` is applied around the whole call.
    pub timeout_secs: u64,
    /// Transport-level retries performed inside the driver.
    pub max_retries: u32,
    /// Consecutive failures before the circuit opens. 0 disables the breaker.
    pub circuit_breaker_threshold: u32,
    /// Cooldown in seconds while the circuit is open.
    pub circuit_breaker_cooldown_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            max_retries: 2,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Workspace root: memory/, sessions/, and the sandbox for tools.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    pub max_iterations: u32,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Hard context budget in tokens for prompt assembly.
    pub max_context_tokens: usize,
    /// Session length at which background consolidation is scheduled; also
    /// the history window handed to the context builder.
    pub memory_window: usize,
    /// Provider-exception retries in the turn loop.
    pub llm_retry_max: u32,
    #[serde(default)]
    pub subagents: SubagentConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            max_iterations: 40,
            temperature: 0.1,
            max_tokens: 4096,
            max_context_tokens: 30_000,
            memory_window: 100,
            llm_retry_max: 2,
            subagents: SubagentConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentConfig {
    pub max_concurrent: usize,
    pub timeout_secs: u64,
    pub max_iterations: u32,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            timeout_secs: 300,
            max_iterations: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// "compatible" | "preferred" | "required" — see daily routing policy.
    pub daily_sections_mode: String,
    /// "keep_new" | "keep_old" | "ask_user" | "merge"
    pub preference_conflict_strategy: String,
    /// Preference keys checked for conflicts.
    pub preference_conflict_keys: Vec<String>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            daily_sections_mode: "compatible".into(),
            preference_conflict_strategy: "keep_new".into(),
            preference_conflict_keys: vec!["language".into(), "communication_style".into()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Publish intermediate progress messages on the outbound bus.
    #[serde(default = "default_true")]
    pub send_progress: bool,
    /// "auto" | "off" | "force"
    pub stream_mode: String,
    #[serde(default)]
    pub stream_enabled: bool,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            send_progress: true,
            stream_mode: "auto".into(),
            stream_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".into(),
            port: 8765,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub exec: ExecToolConfig,
    #[serde(default)]
    pub filesystem: FilesystemToolConfig,
    #[serde(default)]
    pub web: WebToolConfig,
    /// Emit tool_call audit events.
    #[serde(default = "default_true")]
    pub audit_tool_calls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecToolConfig {
    pub timeout_secs: u64,
    /// Maximum bytes of combined stdout+stderr returned to the model.
    pub max_output_bytes: usize,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            max_output_bytes: 32_768,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemToolConfig {
    /// Refuse paths that resolve outside the workspace root.
    #[serde(default = "default_true")]
    pub restrict_to_workspace: bool,
    pub max_read_bytes: usize,
}

impl Default for FilesystemToolConfig {
    fn default() -> Self {
        Self {
            restrict_to_workspace: true,
            max_read_bytes: 262_144,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebToolConfig {
    /// Brave Search API key; web_search is unregistered when absent.
    pub brave_api_key: Option<String>,
    pub search_max_results: usize,
    pub fetch_timeout_secs: u64,
    pub fetch_max_bytes: usize,
    /// Maximum redirect hops followed by web_fetch (each hop is re-validated).
    pub fetch_max_redirects: usize,
}

impl Default for WebToolConfig {
    fn default() -> Self {
        Self {
            brave_api_key: None,
            search_max_results: 5,
            fetch_timeout_secs: 15,
            fetch_max_bytes: 524_288,
            fetch_max_redirects: 4,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

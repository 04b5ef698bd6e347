// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Standard tool-registry assembly for the main agent and subagents.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use nanobot_bus::MessageBus;

use crate::fs::{EditFileTool, FsToolConfig, ListDirTool, ReadFileTool, WriteFileTool};
use crate::message::MessageTool;
use crate::registry::ToolRegistry;
use crate::shell::ExecTool;
use crate::spawn::{SpawnHandler, SpawnTool};
use crate::web::{WebFetchTool, WebSearchTool};

/// Knobs for [`build_standard_registry`]; mirrors the tools config section.
#[derive(Clone)]
pub struct StandardToolOptions {
    pub restrict_to_workspace: bool,
    pub max_read_bytes: usize,
    pub exec_timeout: Duration,
    pub exec_max_output_bytes: usize,
    pub brave_api_key: Option<String>,
    pub web_search_max_results: usize,
    pub web_fetch_timeout: Duration,
    pub web_fetch_max_bytes: usize,
    pub web_fetch_max_redirects: usize,
    pub audit: bool,
}

impl Default for StandardToolOptions {
    fn default() -> Self {
        Self {
            restrict_to_workspace: true,
            max_read_bytes: 262_144,
            exec_timeout: Duration::from_secs(60),
            exec_max_output_bytes: 32_768,
            brave_api_key: None,
            web_search_max_results: 5,
            web_fetch_timeout: Duration::from_secs(15),
            web_fetch_max_bytes: 524_288,
            web_fetch_max_redirects: 4,
            audit: true,
        }
    }
}

/// Build the standard registry: filesystem + shell + web, plus `message`
/// and `spawn` when the caller provides a bus / spawn handler. Subagents
/// pass neither, which is what restricts their tool set.
pub fn build_standard_registry(
    workspace: &Path,
    options: &StandardToolOptions,
    bus: Option<Arc<MessageBus>>,
    spawn_handler: Option<Arc<dyn SpawnHandler>>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new(options.audit);
    let fs_config = Arc::new(FsToolConfig::new(
        workspace,
        options.restrict_to_workspace,
        options.max_read_bytes,
        options.audit,
    ));

    registry.register(Arc::new(ReadFileTool::new(fs_config.clone())));
    registry.register(Arc::new(WriteFileTool::new(fs_config.clone())));
    registry.register(Arc::new(EditFileTool::new(fs_config.clone())));
    registry.register(Arc::new(ListDirTool::new(fs_config)));
    registry.register(Arc::new(ExecTool::new(
        workspace.to_path_buf(),
        options.exec_timeout,
        options.exec_max_output_bytes,
        options.audit,
    )));
    if let Some(api_key) = options.brave_api_key.clone().filter(|k| !k.is_empty()) {
        registry.register(Arc::new(WebSearchTool::new(
            api_key,
            options.web_search_max_results,
            options.web_fetch_timeout,
        )));
    }
    registry.register(Arc::new(WebFetchTool::new(
        options.web_fetch_timeout,
        options.web_fetch_max_bytes,
        options.web_fetch_max_redirects,
    )));
    if let Some(bus) = bus {
        registry.register(Arc::new(MessageTool::new(bus)));
    }
    if let Some(handler) = spawn_handler {
        registry.register(Arc::new(SpawnTool::new(handler)));
    }
    registry
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_registry_has_message_and_spawn() {
        struct NullHandler;
        #[async_trait::async_trait]
        impl SpawnHandler for NullHandler {
            async fn spawn(&self, _: &str, _: Option<&str>, _: &str, _: &str, _: Option<&str>) -> String {
                "ok".into()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let registry = build_standard_registry(
            dir.path(),
            &StandardToolOptions::default(),
            Some(Arc::new(MessageBus::new())),
            Some(Arc::new(NullHandler)),
        );
        for name in ["read_file", "write_file", "edit_file", "list_dir", "exec", "web_fetch", "message", "spawn"] {
            assert!(registry.has(name), "missing {name}");
        }
        assert!(!registry.has("web_search"), "no key → no search tool");
    }

    #[test]
    fn subagent_registry_lacks_message_and_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = StandardToolOptions::default();
        options.brave_api_key = Some("key".into());
        let registry = build_standard_registry(dir.path(), &options, None, None);
        assert!(!registry.has("message"));
        assert!(!registry.has("spawn"));
        assert!(registry.has("web_search"));
        assert!(registry.has("exec"));
    }
}

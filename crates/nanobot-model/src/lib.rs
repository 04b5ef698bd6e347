// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Chat message types, the provider trait, and the OpenAI-compatible driver.
//!
//! The on-wire message shape is the OpenAI chat-completions JSON object;
//! in-process, messages are a tagged struct (`role` enum + `content` union)
//! so compaction and persistence code cannot produce malformed records.

pub mod errors;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod stream;
pub mod types;

pub use errors::{is_context_length_error, is_fatal_provider_error, is_retryable_error, mask_secret};
pub use openai::OpenAiProvider;
pub use provider::{ChatProvider, StreamEventStream};
pub use stream::{StreamAssembler, StreamEvent};
pub use types::{
    sorted_json, ChatMessage, ChatResponse, ContentBlock, FunctionCall, ImageUrl, MessageContent,
    Role, ToolCallRecord, ToolCallRequest, Usage,
};

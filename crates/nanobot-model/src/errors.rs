// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Error-text classification for provider failures, plus secret masking.
//!
//! The pattern sets are data: extending retry behavior means adding a string
//! here, not touching the turn loop.

/// Errors that must never be retried (credentials / authorization).
pub const FATAL_PROVIDER_PATTERNS: &[&str] = &[
    "invalid api key",
    "invalid_api_key",
    "unauthorized",
    "permission denied",
    "authentication failed",
    "forbidden",
];

/// Context-window overflow signatures across providers.
pub const CONTEXT_LENGTH_PATTERNS: &[&str] = &[
    "maximum context length",
    "exceeds the model's maximum context length",
    "input tokens exceeds",
    "context length",
];

/// Transient `finish_reason == "error"` content worth retrying.
pub const RETRYABLE_ERROR_PATTERNS: &[&str] = &[
    "service unavailable",
    "try again later",
    "rate limit",
    "overloaded",
    "temporarily",
    "timed out",
    "timeout",
    "connection reset",
];

fn matches_any(text: &str, patterns: &[&str]) -> bool {
    let lower = text.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

/// True when an exception message indicates a non-retryable provider failure.
pub fn is_fatal_provider_error(text: &str) -> bool {
    matches_any(text, FATAL_PROVIDER_PATTERNS)
}

/// True when error content indicates the prompt exceeded the context window.
pub fn is_context_length_error(text: &str) -> bool {
    matches_any(text, CONTEXT_LENGTH_PATTERNS)
}

/// True when error content is worth a bounded retry.
pub fn is_retryable_error(text: &str) -> bool {
    matches_any(text, RETRYABLE_ERROR_PATTERNS)
}

/// Mask an API key for logs: keep a short prefix and suffix, hide the rest.
pub fn mask_secret(secret: &str) -> String {
    if secret.len() <= 8 {
        return "***".to_string();
    }
    format!("{}…{}", &secret[..4], &secret[secret.len() - 4..])
}

/// Replace occurrences of `secret` in `text` with its masked form.
/// Error strings pass through this before they reach logs or channels.
pub fn redact_secret(text: &str, secret: Option<&str>) -> String {
    match secret {
        Some(s) if !s.is_empty() && text.contains(s) => text.replace(s, &mask_secret(s)),
        _ => text.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

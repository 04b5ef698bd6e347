// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Web tools: `web_search` (Brave Search API) and `web_fetch`.
//!
//! SSRF contract for web_fetch: http(s) only, the hostname (and every DNS
//! answer for it) must not fall in a private/reserved range, and redirects
//! are followed manually so every hop is re-validated.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::details::{details_with_op, OP_WEB_FETCH, OP_WEB_SEARCH};
use crate::tool::{JsonMap, Tool, ToolCapability, ToolExecutionResult};

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_7_2) AppleWebKit/537.36";

/// True when the address belongs to a private/reserved network that the
/// fetch tool must never reach.
fn is_private_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || o[0] == 0
                // Carrier-grade NAT 100.64.0.0/10
                || (o[0] == 100 && (o[1] & 0xC0) == 64)
                // 192.0.0.0/24 protocol assignments
                || (o[0] == 192 && o[1] == 0 && o[2] == 0)
                // 198.18.0.0/15 benchmarking
                || (o[0] == 198 && (o[1] & 0xFE) == 18)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                // fe80::/10 link local
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
        }
    }
}

/// Validate scheme and target of one URL hop. Returns the refusal reason.
async fn check_url_ssrf(url: &str) -> Result<reqwest::Url, String> {
    let parsed = reqwest::Url::parse(url).map_err(|e| format!("Invalid URL: {e}"))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => return Err(format!("Only http/https allowed, got '{other}'")),
    }
    let Some(host) = parsed.host_str() else {
        return Err("URL has no hostname".into());
    };

    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(format!("Access to private/reserved IP {host} is blocked"));
        }
        return Ok(parsed);
    }

    let port = parsed.port_or_known_default().unwrap_or(443);
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| format!("Could not resolve hostname: {host}"))?
        .map(|sa| sa.ip())
        .collect();
    if addrs.is_empty() {
        return Err(format!("Could not resolve hostname: {host}"));
    }
    for addr in addrs {
        if is_private_ip(addr) {
            return Err(format!(
                "Hostname {host} resolves to private/reserved IP {addr}"
            ));
        }
    }
    Ok(parsed)
}

// ─── web_search ───────────────────────────────────────────────────────────────

pub struct WebSearchTool {
    api_key: String,
    max_results: usize,
    client: reqwest::Client,
}

impl WebSearchTool {
    pub fn new(api_key: String, max_results: usize, timeout: Duration) -> Self {
        Self {
            api_key,
            max_results,
            client: reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(USER_AGENT)
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }
    fn description(&self) -> &str {
        "Search the web. Returns titles, URLs, and snippets."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "count": {"type": "integer", "minimum": 1, "maximum": 10,
                          "description": "Results (1-10)"},
            },
            "required": ["query"],
        })
    }
    fn capability(&self) -> ToolCapability {
        ToolCapability::Web
    }

    async fn execute(&self, params: &JsonMap) -> anyhow::Result<ToolExecutionResult> {
        let query = params.get("query").and_then(Value::as_str).unwrap_or("");
        let count = params
            .get("count")
            .and_then(Value::as_u64)
            .map(|c| c as usize)
            .unwrap_or(self.max_results)
            .clamp(1, 10);

        let response = self
            .client
            .get("https://api.search.brave.com/res/v1/web/search")
            .query(&[("q", query), ("count", &count.to_string())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .send()
            .await;
        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                return Ok(ToolExecutionResult::err(format!(
                    "Error: search request failed with status {}",
                    r.status()
                )))
            }
            Err(e) => {
                return Ok(ToolExecutionResult::err(format!(
                    "Error: search request failed: {e}"
                )))
            }
        };

        let body: Value = match response.json().await {
            Ok(b) => b,
            Err(e) => {
                return Ok(ToolExecutionResult::err(format!(
                    "Error: could not parse search response: {e}"
                )))
            }
        };
        let empty = vec![];
        let results = body["web"]["results"].as_array().unwrap_or(&empty);
        if results.is_empty() {
            let details = details_with_op(OP_WEB_SEARCH, &[("result_count", json!(0))]);
            return Ok(ToolExecutionResult::ok_with_details(
                format!("No results for: {query}"),
                details,
            ));
        }

        let mut lines = Vec::new();
        for item in results.iter().take(count) {
            let title = item["title"].as_str().unwrap_or("(untitled)");
            let url = item["url"].as_str().unwrap_or("");
            lines.push(format!("{title}\n{url}"));
            if let Some(desc) = item["description"].as_str() {
                lines.push(format!("{desc}\n"));
            } else {
                lines.push(String::new());
            }
        }
        let details = details_with_op(
            OP_WEB_SEARCH,
            &[("result_count", json!(results.len().min(count)))],
        );
        Ok(ToolExecutionResult::ok_with_details(lines.join("\n"), details))
    }
}

// ─── web_fetch ────────────────────────────────────────────────────────────────

pub struct WebFetchTool {
    max_bytes: usize,
    max_redirects: usize,
    client: Arc<reqwest::Client>,
}

impl WebFetchTool {
    pub fn new(timeout: Duration, max_bytes: usize, max_redirects: usize) -> Self {
        Self {
            max_bytes,
            max_redirects,
            // Redirects are followed manually so each hop is re-validated.
            client: Arc::new(
                reqwest::Client::builder()
                    .timeout(timeout)
                    .user_agent(USER_AGENT)
                    .redirect(reqwest::redirect::Policy::none())
                    .build()
                    .unwrap_or_default(),
            ),
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }
    fn description(&self) -> &str {
        "Fetch a URL and extract readable text content."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "URL to fetch"},
            },
            "required": ["url"],
        })
    }
    fn capability(&self) -> ToolCapability {
        ToolCapability::Web
    }
    fn risk_note(&self) -> Option<&str> {
        Some("fetches external URLs; private/reserved addresses are refused")
    }

    async fn execute(&self, params: &JsonMap) -> anyhow::Result<ToolExecutionResult> {
        let url = params.get("url").and_then(Value::as_str).unwrap_or("");
        let mut current = url.to_string();

        for _hop in 0..=self.max_redirects {
            let validated = match check_url_ssrf(&current).await {
                Ok(u) => u,
                Err(reason) => {
                    warn!(target: "nanobot::audit", url = %current, reason = %reason, "web_fetch_blocked");
                    let details = details_with_op(OP_WEB_FETCH, &[("blocked", json!(true))]);
                    return Ok(ToolExecutionResult::err_with_details(
                        format!("Error: {reason}"),
                        details,
                    ));
                }
            };

            let response = match self.client.get(validated.clone()).send().await {
                Ok(r) => r,
                Err(e) => {
                    return Ok(ToolExecutionResult::err(format!("Error fetching {current}: {e}")))
                }
            };

            if response.status().is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Ok(ToolExecutionResult::err(format!(
                        "Error: redirect from {current} without a Location header"
                    )));
                };
                current = validated
                    .join(location)
                    .map(|u| u.to_string())
                    .unwrap_or_else(|_| location.to_string());
                continue;
            }

            if !response.status().is_success() {
                return Ok(ToolExecutionResult::err(format!(
                    "Error: fetch failed with status {}",
                    response.status()
                )));
            }

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = match response.text().await {
                Ok(b) => b,
                Err(e) => {
                    return Ok(ToolExecutionResult::err(format!(
                        "Error reading response body: {e}"
                    )))
                }
            };

            let mut text = if content_type.contains("html") || looks_like_html(&body) {
                html2text::from_read(body.as_bytes(), 100)
            } else {
                body
            };
            let mut truncated = false;
            if text.len() > self.max_bytes {
                let mut cut = self.max_bytes;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
                text.push_str("\n... (truncated)");
                truncated = true;
            }

            let details = details_with_op(
                OP_WEB_FETCH,
                &[
                    ("url", json!(current)),
                    ("content_length", json!(text.len())),
                    ("truncated", json!(truncated)),
                ],
            );
            return Ok(ToolExecutionResult::ok_with_details(text, details));
        }

        Ok(ToolExecutionResult::err(format!(
            "Error: too many redirects fetching {url}"
        )))
    }
}

fn looks_like_html(body: &str) -> bool {
    let mut end = body.len().min(512);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    let head = body[..end].to_lowercase();
    head.contains("<html") || head.contains("<!doctype html")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

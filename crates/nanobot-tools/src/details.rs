// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shared constants/helpers for structured tool result details.

use std::path::Path;

use serde_json::{json, Value};

use crate::tool::JsonMap;

pub const OP_READ_FILE: &str = "read_file";
pub const OP_WRITE_FILE: &str = "write_file";
pub const OP_EDIT_FILE: &str = "edit_file";
pub const OP_LIST_DIR: &str = "list_dir";
pub const OP_EXEC: &str = "exec";
pub const OP_MESSAGE: &str = "message";
pub const OP_SPAWN: &str = "spawn";
pub const OP_WEB_SEARCH: &str = "web_search";
pub const OP_WEB_FETCH: &str = "web_fetch";

/// Build a structured details payload with a normalized `op` field.
pub fn details_with_op(op: &str, fields: &[(&str, Value)]) -> JsonMap {
    let mut map = JsonMap::new();
    map.insert("op".into(), json!(op));
    for (key, value) in fields {
        map.insert((*key).to_string(), value.clone());
    }
    map
}

/// Common structured metadata fields for filesystem tools.
pub fn file_details_base(op: &str, file_path: &Path, requested_path: &str) -> JsonMap {
    details_with_op(
        op,
        &[
            ("path", json!(file_path.display().to_string())),
            ("requested_path", json!(requested_path)),
        ],
    )
}

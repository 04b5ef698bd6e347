// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent tools: the trait, the auditing registry, and the built-in leaf
//! tools (filesystem, shell, web, messaging, spawn).

pub mod details;
pub mod factory;
pub mod fs;
pub mod message;
pub mod registry;
pub mod shell;
pub mod spawn;
pub mod tool;
pub mod web;

pub use details::{details_with_op, OP_EXEC, OP_MESSAGE, OP_SPAWN};
pub use factory::{build_standard_registry, StandardToolOptions};
pub use message::MessageTool;
pub use registry::ToolRegistry;
pub use spawn::{SpawnHandler, SpawnTool};
pub use tool::{JsonMap, Tool, ToolCapability, ToolExecutionResult};

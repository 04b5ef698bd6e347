// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "nanobot", about = "A multi-channel personal AI agent with long-term memory")]
pub struct Cli {
    /// Path to an explicit config file (merged over discovered configs).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr at debug level (overrides NANOBOT_LOG).
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the agent loop with the health endpoint.
    Agent,

    /// Send one message to the agent and print the reply.
    Chat {
        /// The message text; reads stdin when omitted.
        message: Vec<String>,
        /// Session key to converse under.
        #[arg(long, default_value = "cli:direct")]
        session: String,
    },

    /// List stored sessions.
    Sessions,

    /// Print the effective merged configuration and exit.
    ShowConfig,
}

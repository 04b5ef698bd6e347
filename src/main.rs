// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use nanobot_bus::MessageBus;
use nanobot_config::Config;
use nanobot_core::{AgentLoop, ChannelStatuses, HealthServer};
use nanobot_model::{openai::Resilience, ChatProvider, OpenAiProvider};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = nanobot_config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Agent) {
        Commands::Agent => run_agent(config).await,
        Commands::Chat { message, session } => run_chat(config, message, &session).await,
        Commands::Sessions => list_sessions(config),
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("nanobot=debug,nanobot_core=debug,nanobot_memory=debug,info")
    } else {
        EnvFilter::try_from_env("NANOBOT_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn build_provider(config: &Config) -> Arc<dyn ChatProvider> {
    let resilience = Resilience {
        timeout: std::time::Duration::from_secs(config.provider.resilience.timeout_secs),
        max_retries: config.provider.resilience.max_retries,
        circuit_breaker_threshold: config.provider.resilience.circuit_breaker_threshold,
        circuit_breaker_cooldown: std::time::Duration::from_secs(
            config.provider.resilience.circuit_breaker_cooldown_secs,
        ),
    };
    Arc::new(OpenAiProvider::new(
        config.provider.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL),
        config.provider.resolve_api_key(),
        config.provider.model.clone(),
        config.provider.prompt_caching,
        resilience,
    ))
}

async fn run_agent(config: Config) -> anyhow::Result<()> {
    let bus = Arc::new(MessageBus::new());
    let provider = build_provider(&config);
    let agent = Arc::new(
        AgentLoop::new(&config, provider, true, Arc::clone(&bus))
            .context("building agent loop")?,
    );

    if config.health.enabled {
        let channels: ChannelStatuses = Arc::new(Mutex::new(HashMap::new()));
        let server = Arc::new(HealthServer::new(
            Arc::clone(&agent),
            Arc::clone(&bus),
            channels,
            &config.health.host,
            config.health.port,
        ));
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!(error = %e, "health server failed");
            }
        });
    }

    // Until channel adapters attach, outbound messages are drained to the
    // log so the loop never backs up.
    {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            loop {
                let msg = bus.consume_outbound().await;
                info!(channel = %msg.channel, chat_id = %msg.chat_id, content = %msg.content, "outbound");
            }
        });
    }

    let runner = Arc::clone(&agent);
    let loop_task = tokio::spawn(async move { runner.run().await });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown requested");
    agent.stop();
    loop_task.await.ok();
    Ok(())
}

async fn run_chat(config: Config, message: Vec<String>, session: &str) -> anyhow::Result<()> {
    let content = if message.is_empty() {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        buffer.trim().to_string()
    } else {
        message.join(" ")
    };
    if content.is_empty() {
        anyhow::bail!("empty message");
    }

    let bus = Arc::new(MessageBus::new());
    let provider = build_provider(&config);
    let agent = Arc::new(
        AgentLoop::new(&config, provider, true, Arc::clone(&bus))
            .context("building agent loop")?,
    );

    // Print anything the model sends through the message tool as well.
    {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            loop {
                let msg = bus.consume_outbound().await;
                if !msg.content.is_empty() {
                    println!("{}", msg.content);
                }
            }
        });
    }

    let (channel, chat_id) = session.split_once(':').unwrap_or(("cli", "direct"));
    let reply = agent
        .process_direct(&content, session, channel, chat_id)
        .await?;
    if !reply.is_empty() {
        println!("{reply}");
    }
    Ok(())
}

fn list_sessions(config: Config) -> anyhow::Result<()> {
    let store = nanobot_sessions::SessionStore::new(&config.agent.workspace)?;
    let sessions = store.list_sessions();
    if sessions.is_empty() {
        println!("No sessions stored.");
        return Ok(());
    }
    for info in sessions {
        println!(
            "{}\t(updated {})",
            info.key,
            info.updated_at.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}

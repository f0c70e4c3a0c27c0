use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchboard_coop::{
    CooperationManager, InMemorySessionStore, RoundOutcome, SessionSummary, format_message,
    parse_message_content,
};
use switchboard_core::{
    AgentMessage, EventHub, InMemoryDirectory, MessageRouter, MessageSink, MessageType, RuleStore,
    StrategyKind,
};
use switchboard_scheduler::DeliveryScheduler;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::SwitchboardConfig;

#[derive(Parser)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "Switchboard: message routing and turn-taking for cooperating agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory and default config
    Init,

    /// Show current configuration
    Config,

    /// List routing rules in evaluation order
    Rules,

    /// Show how a message would be routed, without delivering it
    Route {
        /// Sender agent id
        from: String,
        /// Receiver agent id
        to: String,
        /// Message content
        content: String,
        /// text, code, tool_call, tool_result or error
        #[arg(short = 't', long = "type", default_value = "text")]
        message_type: String,
    },

    /// Run a cooperation session between the configured agents
    Run {
        /// Initial task (defaults to cooperation.initial_message)
        message: Option<String>,
        /// Override cooperation.strategy
        #[arg(short, long)]
        strategy: Option<String>,
        /// Override cooperation.max_rounds
        #[arg(short, long)]
        rounds: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Rules => cmd_rules(&cli.config).await,
        Commands::Route {
            from,
            to,
            content,
            message_type,
        } => cmd_route(&cli.config, &from, &to, &content, &message_type).await,
        Commands::Run {
            message,
            strategy,
            rounds,
        } => cmd_run(&cli.config, message, strategy, rounds).await,
    }
}

/// Stand-in intake for configured agents: logs what it receives
struct ConsoleAgent {
    name: String,
}

#[async_trait]
impl MessageSink for ConsoleAgent {
    async fn deliver(&self, message: &AgentMessage) -> Result<()> {
        info!(
            "{} received {} from {} ({} chars)",
            self.name,
            message.message_type,
            message.sender_id,
            message.content.len()
        );
        Ok(())
    }
}

/// Everything a command needs, wired from the config
struct Runtime {
    directory: Arc<InMemoryDirectory>,
    rules: Arc<RuleStore>,
    router: Arc<MessageRouter>,
    events: Arc<EventHub>,
}

impl Runtime {
    async fn build(cfg: &SwitchboardConfig) -> Result<Self> {
        let directory = Arc::new(InMemoryDirectory::new());
        for info in cfg.agent_infos() {
            let sink = Arc::new(ConsoleAgent {
                name: info.name.clone(),
            });
            directory.register(info, sink).await;
        }

        let rules = Arc::new(if cfg.routing.default_rules {
            RuleStore::with_default_rules().await
        } else {
            RuleStore::new()
        });
        for entry in &cfg.rules {
            rules.add_rule(entry.to_rule()).await;
        }

        let router = Arc::new(MessageRouter::new(
            rules.clone(),
            directory.clone(),
            Arc::new(cfg.matrix()),
        ));
        let events = Arc::new(EventHub::new(cfg.cooperation.event_capacity));
        info!(
            "Loaded {} agents and {} routing rules",
            directory.count().await,
            rules.len().await
        );

        Ok(Self {
            directory,
            rules,
            router,
            events,
        })
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        info!("Created default config at {}", config_path.display());
    }

    println!("Switchboard initialized at {}", config_dir.display());
    println!("Edit {} to configure agents and routing rules.", config_path.display());
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = SwitchboardConfig::load(config_path)?;
    println!("{}", toml::to_string_pretty(&cfg)?);
    Ok(())
}

async fn cmd_rules(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = SwitchboardConfig::load(config_path)?;
    let runtime = Runtime::build(&cfg).await?;

    for (i, rule) in runtime.rules.rules().await.iter().enumerate() {
        let mut filters = Vec::new();
        if let Some(role) = rule.sender_role {
            filters.push(format!("from {}", role));
        }
        if let Some(role) = rule.receiver_role {
            filters.push(format!("to {}", role));
        }
        if let Some(kind) = rule.message_type {
            filters.push(format!("type {}", kind));
        }
        if !rule.keywords.is_empty() {
            filters.push(format!("keywords {:?}", rule.keywords));
        }

        let mut effects = Vec::new();
        if rule.intercept_original {
            effects.push("intercept".to_string());
        }
        match (&rule.forward_target_id, rule.forward_target_role) {
            (Some(id), _) => effects.push(format!("forward to '{}'", id)),
            (None, Some(role)) => effects.push(format!("forward to every {}", role)),
            (None, None) => {}
        }

        println!(
            "{:>2}. [{}]{} {} — {}",
            i + 1,
            rule.priority,
            if rule.enabled { "" } else { " (disabled)" },
            rule.id,
            rule.description
        );
        println!(
            "      when: {}",
            if filters.is_empty() { "any message".to_string() } else { filters.join(", ") }
        );
        if !effects.is_empty() {
            println!("      then: {}", effects.join(", "));
        }
    }
    Ok(())
}

async fn cmd_route(
    config_path: &Option<PathBuf>,
    from: &str,
    to: &str,
    content: &str,
    message_type: &str,
) -> Result<()> {
    let cfg = SwitchboardConfig::load(config_path)?;
    let runtime = Runtime::build(&cfg).await?;

    let message = AgentMessage::new(from, to, content, MessageType::from_string(message_type));
    let outcome = runtime.router.route(message).await;

    println!(
        "Matched rules: {}",
        if outcome.applied_rule_ids.is_empty() {
            "none".to_string()
        } else {
            outcome.applied_rule_ids.join(", ")
        }
    );
    if outcome.intercepted {
        println!("Original delivery intercepted");
    }
    for routed in &outcome.messages {
        let kind = if routed.message.is_forwarded() { "forward" } else { "original" };
        println!(
            "  {:<8} [{}] {} -> {}: {}",
            kind,
            routed.priority,
            routed.message.sender_id,
            routed.message.receiver_id,
            format_message(&routed.message)
        );
    }
    if outcome.messages.is_empty() {
        println!("Nothing would be delivered");
    }

    let parsed = parse_message_content(content);
    for block in &parsed.code {
        println!("Code block: {} ({} lines)", block.language, block.content.lines().count());
    }
    for call in &parsed.tool_calls {
        println!("Tool call: {} {}", call.name, call.params);
    }
    Ok(())
}

async fn cmd_run(
    config_path: &Option<PathBuf>,
    message: Option<String>,
    strategy: Option<String>,
    rounds: Option<u32>,
) -> Result<()> {
    let cfg = SwitchboardConfig::load(config_path)?;
    let strategy: StrategyKind = match strategy {
        Some(s) => s.parse()?,
        None => cfg.cooperation.strategy,
    };
    let max_rounds = rounds.unwrap_or(cfg.cooperation.max_rounds);
    let task = message.unwrap_or_else(|| cfg.cooperation.initial_message.clone());
    if cfg.agents.is_empty() {
        bail!("No agents configured. Add [[agents]] entries to the config.");
    }

    let runtime = Runtime::build(&cfg).await?;
    let scheduler = Arc::new(DeliveryScheduler::with_config(
        runtime.directory.clone(),
        runtime.events.clone(),
        cfg.scheduler.to_scheduler_config(),
    ));
    let store = Arc::new(InMemorySessionStore::new());
    let manager = CooperationManager::new(
        runtime.router.clone(),
        scheduler.clone(),
        runtime.events.clone(),
    )
    .with_store(store.clone());

    let session_id = format!("session-{}", chrono::Utc::now().format("%Y%m%d-%H%M%S"));
    manager
        .create_session(&session_id, cfg.agent_infos(), max_rounds)
        .await
        .context("Failed to create session")?;

    let _transcript = manager
        .on_message(&session_id, |m| {
            println!("{} -> {}: {}", m.sender_id, m.receiver_id, format_message(&m));
        })
        .await;

    scheduler.start().await;

    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, ending session...");
            cancel_on_signal.cancel();
        }
    });

    if !manager.start_cooperation(&session_id, strategy, &task).await? {
        let state = manager.session_state(&session_id).await;
        let reason = state
            .and_then(|s| s.error)
            .unwrap_or_else(|| "session was not idle".to_string());
        scheduler.stop().await;
        bail!("Could not start {} cooperation: {}", strategy, reason);
    }
    println!("Session {} started ({} strategy, {} rounds)", session_id, strategy, max_rounds);

    let period = Duration::from_millis(cfg.cooperation.round_interval_ms.max(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                manager.end_cooperation(&session_id).await?;
                break;
            }
            _ = interval.tick() => {
                match manager.next_round(&session_id).await? {
                    RoundOutcome::Advanced { round, active_agent_id } => {
                        info!(
                            "Round {}/{}: {} has the turn",
                            round,
                            max_rounds,
                            active_agent_id.as_deref().unwrap_or("nobody")
                        );
                    }
                    RoundOutcome::Completed { rounds } => {
                        info!("Session completed after {} rounds", rounds);
                        break;
                    }
                    RoundOutcome::Skipped { status } => {
                        warn!("Session is {}, stopping", status);
                        break;
                    }
                }
            }
        }
    }

    scheduler.wait_idle().await;
    scheduler.stop().await;

    let state = manager.close_session(&session_id).await?;
    let summary = SessionSummary::from_state(&state);
    let stats = scheduler.stats();
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!(
        "Delivered {} messages ({} dropped, {} failed, {} duplicates)",
        stats.delivered, stats.dropped, stats.failed, stats.duplicates
    );
    Ok(())
}

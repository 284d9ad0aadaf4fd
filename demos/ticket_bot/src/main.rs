//! Ticket Bot Example
//!
//! Plays one support-ticket conversation through Tether without a chat
//! platform attached:
//!
//! ```text
//! /ticket topic:<typing…>   autocomplete request  -> instance created (autocomplete stage)
//! /ticket topic:billing     command               -> same instance, promoted
//! [Escalate] button         component interaction -> routed back by message id
//! (silence)                 idle timeout          -> on_destroy, observers dropped
//! ```
//!
//! # Usage
//!
//! ```bash
//! cargo run --package ticket-bot -- --idle-secs 2
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use clap::Parser;
use tether::prelude::*;
use tether::runtime::config::{DefinitionConfig, TetherConfig};
use tokio::sync::Mutex;
use tracing::info;

const TICKET: &str = "ticket";

#[derive(Parser, Debug)]
#[command(name = "ticket-bot", about = "Simulated ticket conversation")]
struct Args {
    /// Configuration file (defaults to tether.toml / config.toml lookup).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Idle timeout of ticket instances, in seconds.
    #[arg(long, default_value_t = 3)]
    idle_secs: u64,

    /// How long a ticket may stay in the autocomplete stage, in seconds.
    #[arg(long, default_value_t = 2)]
    autocomplete_secs: u64,

    /// How long the escalate button stays usable, in seconds.
    #[arg(long, default_value_t = 10)]
    button_secs: u64,

    /// Button clicks to simulate.
    #[arg(long, default_value_t = 2)]
    clicks: usize,
}

// ============================================================================
// Handler
// ============================================================================

/// One support ticket being filed.
#[derive(Default)]
struct Ticket {
    suggestions_served: AtomicUsize,
    escalations: AtomicUsize,
    topic: Mutex<Option<String>>,
}

#[async_trait]
impl ScopedHandler for Ticket {
    async fn on_destroy(&self) -> Result<()> {
        let topic = self.topic.lock().await.take();
        info!(
            topic = topic.as_deref().unwrap_or("<none>"),
            suggestions = self.suggestions_served.load(Ordering::SeqCst),
            escalations = self.escalations.load(Ordering::SeqCst),
            "Ticket closed"
        );
        Ok(())
    }
}

impl Ticket {
    fn suggest(&self, typed: &str) -> Vec<&'static str> {
        self.suggestions_served.fetch_add(1, Ordering::SeqCst);
        ["billing", "bug report", "feature request"]
            .into_iter()
            .filter(|topic| topic.starts_with(typed))
            .collect()
    }

    async fn open(&self, topic: &str) {
        *self.topic.lock().await = Some(topic.to_string());
    }

    fn escalate(&self) -> usize {
        self.escalations.fetch_add(1, Ordering::SeqCst) + 1
    }
}

// ============================================================================
// Simulated Events
// ============================================================================

async fn autocomplete(runtime: &TetherRuntime, user: UserId, server: ServerId) -> Result<()> {
    let ctx = ConversationContext::new(user, Some(server), EventKind::AutoComplete);
    runtime
        .dispatch(ctx, async {
            let ticket = runtime.manager().get(TICKET, || Ok(Ticket::default()))?;
            let choices = ticket.suggest("b");
            info!(
                instance = %ticket.instance_id,
                fresh = ticket.fresh,
                ?choices,
                "Served autocomplete"
            );
            Ok::<_, anyhow::Error>(())
        })
        .await
}

async fn command(
    runtime: &TetherRuntime,
    user: UserId,
    server: ServerId,
    reply: MessageId,
    button_ttl: Duration,
) -> Result<InstanceId> {
    let ctx = ConversationContext::new(user, Some(server), EventKind::Interaction);
    runtime
        .dispatch(ctx, async {
            let ticket = runtime.manager().get(TICKET, || Ok(Ticket::default()))?;
            ticket.open("billing").await;
            info!(instance = %ticket.instance_id, fresh = ticket.fresh, "Ticket opened");

            // the platform answered with a message carrying the buttons
            runtime
                .manager()
                .set_message_id_for_instance(&ticket.instance_id, reply);
            runtime.observers().register_button_observer(
                reply,
                ticket.instance_id.clone(),
                button_ttl,
                move || async move {
                    info!(message = %reply, "Escalate button expired, disabling it");
                    Ok(())
                },
                ObserverOptions::default().allow_user(user).stay_active(),
            );
            Ok::<_, anyhow::Error>(ticket.instance_id.clone())
        })
        .await
}

async fn click(
    runtime: &TetherRuntime,
    user: UserId,
    server: ServerId,
    message: MessageId,
) -> Result<()> {
    let ctx = ConversationContext::new(user, Some(server), EventKind::Interaction)
        .with_message_id(message);
    let key = ObserverKey::Message(message);
    let Some(ctx) = runtime.correlate(ObserverKind::Button, key, user, ctx) else {
        bail!("button on message {message} is no longer active");
    };

    runtime
        .dispatch(ctx, async {
            let ticket = runtime.manager().get(TICKET, || Ok(Ticket::default()))?;
            let level = ticket.escalate();
            info!(instance = %ticket.instance_id, fresh = ticket.fresh, level, "Ticket escalated");
            Ok::<_, anyhow::Error>(())
        })
        .await
}

async fn conversation(runtime: &TetherRuntime, args: &Args) -> Result<()> {
    let user = UserId(4242);
    let server = ServerId(7);
    let reply = MessageId(9001);

    autocomplete(runtime, user, server).await?;
    autocomplete(runtime, user, server).await?;

    let id = command(runtime, user, server, reply, Duration::from_secs(args.button_secs)).await?;
    for _ in 0..args.clicks {
        click(runtime, user, server, reply).await?;
    }
    info!(stats = ?runtime.stats(), "Conversation in progress");

    let idle = Duration::from_secs(args.idle_secs + 1);
    info!(wait_secs = idle.as_secs(), "Waiting for the ticket to go idle");
    tokio::time::sleep(idle).await;

    info!(
        still_live = runtime.manager().contains_instance(&id),
        stats = ?runtime.stats(),
        "After idle timeout"
    );
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut defaults = TetherConfig::default();
    defaults.scope.idle_timeout_secs = args.idle_secs;
    defaults.scope.autocomplete_timeout_secs = args.autocomplete_secs.min(args.idle_secs);
    defaults
        .scope
        .definitions
        .insert(
            TICKET.to_string(),
            DefinitionConfig {
                call_destroy_on_evict: Some(true),
                ..Default::default()
            },
        );

    let mut builder = TetherRuntime::builder().merge(defaults);
    if let Some(path) = &args.config {
        builder = builder.config_file(path);
    }
    let runtime = builder.build()?;

    let mut outcome = Ok(());
    runtime
        .run_until(async {
            outcome = conversation(&runtime, &args).await;
        })
        .await;
    outcome
}

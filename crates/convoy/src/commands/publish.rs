//! Publish command - sends one command to the fleet.
//!
//! Optionally stays subscribed to `worker-response` for a while and prints
//! every reply, which is how `get-worker-status` and `get-worker-id` are
//! answered.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use serde_json::Value;
use tracing::debug;

use convoy_pubsub::{PubSubEventBus, Publisher, Subscriber};
use convoy_types::{Channel, CommandKind, InstanceIdentity, OutboundCommand, ResponseKind};

use super::Context;

/// Arguments for the publish command.
#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Command name, e.g. reload-license or get-worker-status
    pub command: CommandKind,

    /// JSON payload
    #[arg(long)]
    pub payload: Option<String>,

    /// Only these host ids act on the command (repeatable)
    #[arg(long = "target")]
    pub targets: Vec<String>,

    /// Print worker responses received within this many milliseconds
    #[arg(long, value_name = "MS")]
    pub listen: Option<u64>,

    /// Pub/sub broker URL (overrides config)
    #[arg(long, env = "CONVOY_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Path to config file (overrides default discovery)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Run the publish command.
pub async fn run(args: PublishArgs, ctx: &Context) -> Result<()> {
    let config = super::load(args.config.as_deref())?.config;
    let mut scaling = config.scaling();
    if let Some(url) = args.redis_url {
        scaling.redis_url = url;
        scaling.enabled = true;
    }
    if !scaling.enabled {
        bail!("scaling is disabled; there is no fleet to publish to (set [scaling] enabled = true or pass --redis-url)");
    }

    let payload: Option<Value> = args
        .payload
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .context("--payload is not valid JSON")?;

    let identity = InstanceIdentity::new(config.instance().instance_type).shared();
    let transport =
        convoy_pubsub::connect_publisher(&scaling.redis_url, &scaling.key_prefix).await?;
    let publisher = Publisher::new(Arc::clone(&identity), Some(transport), true);

    // Subscribe before publishing so no early reply is missed.
    let listener = match args.listen {
        Some(ms) => {
            let bus = PubSubEventBus::new();
            let json_output = ctx.json_output;
            for kind in [
                ResponseKind::ResponseToGetWorkerStatus,
                ResponseKind::ResponseToGetWorkerId,
            ] {
                bus.on(kind.as_str(), move |payload: &Value| {
                    if json_output {
                        println!("{}", serde_json::json!({ "response": kind, "payload": payload }));
                    } else {
                        println!("{kind}: {payload}");
                    }
                });
            }
            let transport =
                convoy_pubsub::connect_subscriber(&scaling.redis_url, &scaling.key_prefix)?;
            let subscriber = Subscriber::new(Arc::clone(&identity), transport, bus);
            subscriber.subscribe(Channel::WorkerResponse).await;
            Some((subscriber, Duration::from_millis(ms)))
        }
        None => None,
    };

    let mut outbound = OutboundCommand::new(args.command);
    if let Some(payload) = payload {
        outbound = outbound.with_payload(payload);
    }
    if !args.targets.is_empty() {
        outbound = outbound.with_targets(args.targets);
    }
    publisher.publish_command(outbound).await?;
    debug!(command = %args.command, sender_id = %identity.host_id(), "published");

    if !ctx.json_output {
        println!("Published {}", args.command);
    }

    if let Some((subscriber, wait)) = listener {
        tokio::time::sleep(wait).await;
        subscriber.shutdown();
    }
    Ok(())
}

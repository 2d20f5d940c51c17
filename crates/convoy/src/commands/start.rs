//! Start command - boots one fleet instance and runs until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use convoy_config::ConvoyConfig;
use convoy_pubsub::{
    HandlerFilter, HandlerRegistry, LEADER_STEPDOWN_EVENT, LEADER_TAKEOVER_EVENT, LeaderElection,
    PubSubEventBus, Publisher, Subscriber,
};
use convoy_tasks::{BrokerSettings, LocalTaskRequester, TaskBroker};
use convoy_types::{
    CommandKind, InstanceIdentity, InstanceType, ResponseKind, SharedIdentity, WorkerId,
    WorkerResponse, WorkerStatus,
};

use super::Context;
use crate::status::StatusReporter;

/// Arguments for the start command.
///
/// CLI arguments override config file values.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Instance type: main, worker, or webhook (overrides config)
    #[arg(long = "type", value_name = "TYPE")]
    pub instance_type: Option<InstanceType>,

    /// Fixed host id (overrides config; generated when absent)
    #[arg(long)]
    pub host_id: Option<String>,

    /// Enable scaling mode (shared pub/sub broker)
    #[arg(long)]
    pub scaling: bool,

    /// Pub/sub broker URL (overrides config)
    #[arg(long, env = "CONVOY_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Enable leader election between main instances
    #[arg(long)]
    pub multi_main: bool,

    /// Path to config file (overrides default discovery)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl StartArgs {
    fn apply(&self, config: &mut ConvoyConfig) {
        let mut instance = config.instance();
        if let Some(instance_type) = self.instance_type {
            instance.instance_type = instance_type;
        }
        if let Some(host_id) = &self.host_id {
            instance.host_id = Some(host_id.clone());
        }
        config.instance = Some(instance);

        let mut scaling = config.scaling();
        scaling.enabled |= self.scaling;
        if let Some(url) = &self.redis_url {
            scaling.redis_url = url.clone();
        }
        config.scaling = Some(scaling);

        let mut multi_main = config.multi_main();
        multi_main.enabled |= self.multi_main;
        config.multi_main = Some(multi_main);
    }
}

/// Run the start command.
pub async fn run(args: StartArgs, ctx: &Context) -> Result<()> {
    // ── Load configuration ──────────────────────────────────────────────

    let mut config = super::load(args.config.as_deref())?.config;
    args.apply(&mut config);
    config.validate()?;

    let instance = config.instance();
    let scaling = config.scaling();
    let multi_main = config.multi_main();

    let identity = match instance.host_id {
        Some(host_id) => InstanceIdentity::with_host_id(host_id, instance.instance_type),
        None => InstanceIdentity::new(instance.instance_type),
    }
    .shared();

    info!(
        host_id = %identity.host_id(),
        instance_type = %identity.instance_type(),
        scaling = scaling.enabled,
        "starting instance"
    );

    // ── Fleet bus ───────────────────────────────────────────────────────

    let bus = PubSubEventBus::new();
    let registry = HandlerRegistry::new(Arc::clone(&identity), bus.clone());

    let publisher = if scaling.enabled {
        let transport =
            convoy_pubsub::connect_publisher(&scaling.redis_url, &scaling.key_prefix).await?;
        Publisher::new(Arc::clone(&identity), Some(transport), true)
    } else {
        Publisher::disabled(Arc::clone(&identity))
    };

    declare_handlers(&registry, &publisher, &identity);
    let bound = registry.init();
    debug!(bound, events = ?registry.bound_events(), "handlers bound");

    let subscriber = if scaling.enabled {
        let transport = convoy_pubsub::connect_subscriber(&scaling.redis_url, &scaling.key_prefix)?;
        let subscriber = Subscriber::new(Arc::clone(&identity), transport, bus.clone())
            .with_debounce(scaling.debounce());
        subscriber.start().await;
        Some(subscriber)
    } else {
        None
    };

    // ── Main-only services ──────────────────────────────────────────────

    let mut election = None;
    let mut tasks = None;
    if identity.is_main() {
        bus.on(LEADER_TAKEOVER_EVENT, |payload: &Value| {
            info!(%payload, "this instance is now the leader");
        });
        bus.on(LEADER_STEPDOWN_EVENT, |payload: &Value| {
            warn!(%payload, "this instance stepped down to follower");
        });

        let leader = Arc::new(
            LeaderElection::new(
                Arc::clone(&identity),
                publisher.clone(),
                registry.clone(),
                bus.clone(),
            )
            .with_ttl(multi_main.leader_ttl())
            .with_check_interval(multi_main.check_interval()),
        );
        if multi_main.enabled && scaling.enabled {
            let handle = Arc::clone(&leader).spawn();
            election = Some((leader, handle));
        } else {
            if multi_main.enabled {
                warn!("multi-main requires scaling mode; running as sole leader");
            }
            leader.assume_leadership();
        }

        let broker_config = config.broker();
        let broker = TaskBroker::new(BrokerSettings {
            offer_validity: broker_config.offer_validity(),
            default_task_timeout: broker_config.default_task_timeout(),
        });
        let requester =
            LocalTaskRequester::with_id(broker.clone(), format!("{}-engine", identity.host_id()));
        info!(
            requester_id = %requester.id(),
            offer_validity_ms = broker_config.offer_validity_ms,
            "task broker ready"
        );
        tasks = Some((broker, requester));
    }

    if ctx.verbose {
        eprintln!(
            "convoy {} running as {} (role: {}); press Ctrl-C to stop",
            identity.host_id(),
            identity.instance_type(),
            identity
                .role()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }

    // ── Run until interrupted ───────────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!(host_id = %identity.host_id(), "shutting down");

    if let Some(subscriber) = &subscriber {
        subscriber.shutdown();
    }
    if let Some((leader, handle)) = election {
        if let Err(e) = leader.shutdown().await {
            error!(error = %e, "failed to release leadership");
        }
        handle.abort();
    }
    if let Some((broker, requester)) = tasks {
        if let Err(e) = requester.abort_all("instance shutting down") {
            error!(error = %e, "failed to abort outstanding tasks");
        }
        debug!(stats = ?broker.stats(), "task broker stopped");
    }
    Ok(())
}

/// Declare the handlers this binary reacts to.
///
/// Workers answer status and id queries; mains log the answers. Every instance
/// logs the remaining fleet commands it receives.
fn declare_handlers(registry: &HandlerRegistry, publisher: &Publisher, identity: &SharedIdentity) {
    let reporter = StatusReporter::new(identity.host_id());
    let worker = HandlerFilter::instance(InstanceType::Worker);
    let main = HandlerFilter::instance(InstanceType::Main);

    let status_publisher = publisher.clone();
    registry.on_command(CommandKind::GetWorkerStatus, worker, move |_| {
        let status = reporter.snapshot(Vec::new());
        respond(
            &status_publisher,
            ResponseKind::ResponseToGetWorkerStatus,
            serde_json::to_value(status),
        );
    });

    let id_publisher = publisher.clone();
    let worker_id = identity.host_id().to_string();
    registry.on_command(CommandKind::GetWorkerId, worker, move |_| {
        let id = WorkerId {
            worker_id: worker_id.clone(),
        };
        respond(
            &id_publisher,
            ResponseKind::ResponseToGetWorkerId,
            serde_json::to_value(id),
        );
    });

    registry.on_response(ResponseKind::ResponseToGetWorkerStatus, main, |payload| {
        match serde_json::from_value::<WorkerStatus>(payload.clone()) {
            Ok(status) => info!(
                worker = %status.sender_id,
                running_jobs = status.running_jobs.len(),
                free_memory_bytes = status.free_memory_bytes,
                uptime_secs = status.uptime_secs,
                "worker status"
            ),
            Err(e) => warn!(error = %e, "unreadable worker status"),
        }
    });
    registry.on_response(ResponseKind::ResponseToGetWorkerId, main, |payload| {
        info!(%payload, "worker id");
    });

    // Trigger activation is owned by the leader.
    for kind in [
        CommandKind::AddWebhooksTriggersAndPollers,
        CommandKind::RemoveTriggersAndPollers,
    ] {
        registry.on_command(kind, HandlerFilter::leader(), move |payload| {
            info!(command = %kind, %payload, "trigger change");
        });
    }

    for kind in CommandKind::ALL {
        if matches!(
            kind,
            CommandKind::GetWorkerStatus
                | CommandKind::GetWorkerId
                | CommandKind::AddWebhooksTriggersAndPollers
                | CommandKind::RemoveTriggersAndPollers
        ) {
            continue;
        }
        registry.on_command(kind, HandlerFilter::any(), move |payload| {
            info!(command = %kind, %payload, "fleet command received");
        });
    }
}

/// Publish a worker response in the background; handlers run synchronously.
fn respond(publisher: &Publisher, kind: ResponseKind, payload: serde_json::Result<Value>) {
    let payload = match payload {
        Ok(payload) => payload,
        Err(e) => {
            error!(response = %kind, error = %e, "failed to encode worker response");
            return;
        }
    };
    let publisher = publisher.clone();
    tokio::spawn(async move {
        let response = WorkerResponse::new(kind, payload);
        if let Err(e) = publisher.publish_worker_response(response).await {
            error!(response = %kind, error = %e, "failed to publish worker response");
        }
    });
}

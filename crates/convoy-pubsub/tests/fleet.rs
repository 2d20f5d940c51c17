//! Integration tests for fleet messaging.
//!
//! Several simulated instances share one in-process broker. Each has its own
//! publish connection, subscribe connection, event bus, and subscriber, wired
//! the way the `convoy start` command wires a real instance.

use std::sync::Arc;
use std::time::Duration;

use convoy_pubsub::{
    HandlerFilter, HandlerRegistry, MemoryHub, MessageHandler, PubSubEventBus, Publisher,
    Subscriber, Transport,
};
use convoy_types::{
    Channel, Command, CommandKind, InstanceIdentity, InstanceRole, InstanceType, OutboundCommand,
    ResponseKind, SharedIdentity, WorkerResponse,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::Instant;

type Log = Arc<Mutex<Vec<(String, Value, Instant)>>>;

struct Instance {
    identity: SharedIdentity,
    publisher: Publisher,
    subscriber: Subscriber,
    bus: PubSubEventBus,
    log: Log,
}

impl Instance {
    async fn boot(hub: &MemoryHub, host_id: &str, instance_type: InstanceType) -> Self {
        let identity = InstanceIdentity::with_host_id(host_id, instance_type).shared();
        let bus = PubSubEventBus::new();
        let publisher = Publisher::new(Arc::clone(&identity), Some(Arc::new(hub.connect())), true);
        let subscriber = Subscriber::new(Arc::clone(&identity), Arc::new(hub.connect()), bus.clone())
            .with_debounce(Duration::from_millis(300));
        subscriber.start().await;

        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let events = CommandKind::ALL
            .iter()
            .map(|k| k.as_str())
            .chain([
                ResponseKind::ResponseToGetWorkerStatus.as_str(),
                ResponseKind::ResponseToGetWorkerId.as_str(),
            ]);
        for event in events {
            let sink = Arc::clone(&log);
            bus.on(event, move |payload| {
                sink.lock()
                    .push((event.to_string(), payload.clone(), Instant::now()));
            });
        }

        Self {
            identity,
            publisher,
            subscriber,
            bus,
            log,
        }
    }

    fn dispatched(&self) -> Vec<String> {
        self.log.lock().iter().map(|(e, _, _)| e.clone()).collect()
    }

    fn dispatched_count(&self, command: CommandKind) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|(e, _, _)| e == command.as_str())
            .count()
    }
}

async fn publish(instance: &Instance, command: OutboundCommand) {
    instance.publisher.publish_command(command).await.unwrap();
}

/// Let every debounce window close.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(350)).await;
    tokio::task::yield_now().await;
}

// ─────────────────────────────────────────────────────────────────────────────
// Filtering
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_reload_license_skips_sender() {
    let hub = MemoryHub::new();
    let a = Instance::boot(&hub, "main-a", InstanceType::Main).await;
    let b = Instance::boot(&hub, "main-b", InstanceType::Main).await;

    publish(&a, OutboundCommand::new(CommandKind::ReloadLicense)).await;
    settle().await;

    assert_eq!(b.dispatched(), vec!["reload-license"]);
    assert!(a.dispatched().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sender_never_dispatches_own_non_self_send_commands() {
    let hub = MemoryHub::new();
    let a = Instance::boot(&hub, "main-a", InstanceType::Main).await;

    for kind in CommandKind::ALL
        .into_iter()
        .filter(|k| !k.policy().self_send)
    {
        publish(&a, OutboundCommand::new(kind)).await;
    }
    settle().await;

    assert!(a.dispatched().is_empty());
    assert_eq!(a.subscriber.pending_dispatches(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_targets_limit_receivers() {
    let hub = MemoryHub::new();
    let main = Instance::boot(&hub, "main-a", InstanceType::Main).await;
    let w1 = Instance::boot(&hub, "worker-1", InstanceType::Worker).await;
    let w2 = Instance::boot(&hub, "worker-2", InstanceType::Worker).await;

    publish(
        &main,
        OutboundCommand::new(CommandKind::GetWorkerStatus).with_targets(["worker-1"]),
    )
    .await;
    publish(
        &main,
        OutboundCommand::new(CommandKind::RemoveTriggersAndPollers).with_targets(["worker-2"]),
    )
    .await;
    settle().await;

    assert_eq!(w1.dispatched(), vec!["get-worker-status"]);
    assert_eq!(w2.dispatched(), vec!["remove-triggers-and-pollers"]);
    // Self-send does not override an explicit target list
    assert!(main.dispatched().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_worker_responses_are_not_filtered() {
    let hub = MemoryHub::new();
    let main = Instance::boot(&hub, "main-a", InstanceType::Main).await;
    let worker = Instance::boot(&hub, "worker-1", InstanceType::Worker).await;

    worker
        .publisher
        .publish_worker_response(WorkerResponse::new(
            ResponseKind::ResponseToGetWorkerId,
            json!({"workerId": worker.identity.host_id()}),
        ))
        .await
        .unwrap();

    // Delivered immediately, including to the sender
    assert_eq!(main.dispatched(), vec!["response-to-get-worker-id"]);
    assert_eq!(worker.dispatched(), vec!["response-to-get-worker-id"]);
    assert_eq!(main.log.lock()[0].1, json!({"workerId": "worker-1"}));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_messages_are_dropped() {
    let hub = MemoryHub::new();
    let b = Instance::boot(&hub, "main-b", InstanceType::Main).await;
    let raw = hub.connect();

    raw.publish(Channel::Commands, "not json".into()).await.unwrap();
    raw.publish(Channel::Commands, r#"{"command":"self-destruct"}"#.into())
        .await
        .unwrap();
    raw.publish(Channel::WorkerResponse, "[]".into()).await.unwrap();

    // The channel keeps working afterwards
    let good = OutboundCommand::new(CommandKind::ClearTestWebhooks).into_command("main-a");
    raw.publish(Channel::Commands, serde_json::to_string(&good).unwrap())
        .await
        .unwrap();

    assert_eq!(b.dispatched(), vec!["clear-test-webhooks"]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Debounce
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_self_send_dispatches_immediately_everywhere() {
    let hub = MemoryHub::new();
    let a = Instance::boot(&hub, "main-a", InstanceType::Main).await;
    let b = Instance::boot(&hub, "main-b", InstanceType::Main).await;

    let published_at = Instant::now();
    publish(
        &a,
        OutboundCommand::new(CommandKind::AddWebhooksTriggersAndPollers)
            .with_payload(json!({"workflowId": "wf-1"})),
    )
    .await;

    for instance in [&a, &b] {
        let log = instance.log.lock();
        assert_eq!(log.len(), 1);
        let (event, payload, at) = &log[0];
        assert_eq!(event, "add-webhooks-triggers-and-pollers");
        assert_eq!(payload["workflowId"], "wf-1");
        assert!(at.duration_since(published_at) < Duration::from_millis(5));
    }
}

#[tokio::test(start_paused = true)]
async fn test_debounce_coalesces_to_last_payload() {
    let hub = MemoryHub::new();
    let a = Instance::boot(&hub, "main-a", InstanceType::Main).await;
    let b = Instance::boot(&hub, "main-b", InstanceType::Main).await;

    for n in 1..=5 {
        publish(
            &a,
            OutboundCommand::new(CommandKind::ReloadLicense).with_payload(json!({"n": n})),
        )
        .await;
        if n < 5 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
    let last_publish = Instant::now();

    // Still inside the trailing window
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(b.dispatched_count(CommandKind::ReloadLicense), 0);
    assert_eq!(b.subscriber.pending_dispatches(), 1);

    settle().await;
    let log = b.log.lock();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].1, json!({"n": 5}));
    assert!(log[0].2.duration_since(last_publish) >= Duration::from_millis(300));
}

#[tokio::test(start_paused = true)]
async fn test_debounce_is_per_command_kind() {
    let hub = MemoryHub::new();
    let a = Instance::boot(&hub, "main-a", InstanceType::Main).await;
    let b = Instance::boot(&hub, "main-b", InstanceType::Main).await;

    publish(&a, OutboundCommand::new(CommandKind::ReloadLicense)).await;
    publish(&a, OutboundCommand::new(CommandKind::RestartEventBus)).await;
    publish(&a, OutboundCommand::new(CommandKind::ReloadLicense)).await;
    settle().await;

    assert_eq!(b.dispatched_count(CommandKind::ReloadLicense), 1);
    assert_eq!(b.dispatched_count(CommandKind::RestartEventBus), 1);
}

#[tokio::test(start_paused = true)]
async fn test_immediate_command_overtakes_pending_debounce() {
    let hub = MemoryHub::new();
    let a = Instance::boot(&hub, "main-a", InstanceType::Main).await;
    let b = Instance::boot(&hub, "main-b", InstanceType::Main).await;

    publish(&a, OutboundCommand::new(CommandKind::DisplayWorkflowActivation)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    publish(&a, OutboundCommand::new(CommandKind::RemoveTriggersAndPollers)).await;
    settle().await;

    assert_eq!(
        b.dispatched(),
        vec!["remove-triggers-and-pollers", "display-workflow-activation"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_relayed_events_are_never_coalesced() {
    let hub = MemoryHub::new();
    let a = Instance::boot(&hub, "main-a", InstanceType::Main).await;
    let b = Instance::boot(&hub, "main-b", InstanceType::Main).await;

    for id in ["exec-1", "exec-2", "exec-3"] {
        publish(
            &a,
            OutboundCommand::new(CommandKind::RelayExecutionLifecycleEvent)
                .with_payload(json!({"executionId": id, "type": "nodeExecuteAfter"})),
        )
        .await;
    }

    let ids: Vec<Value> = b
        .log
        .lock()
        .iter()
        .map(|(_, p, _)| p["executionId"].clone())
        .collect();
    assert_eq!(ids, vec![json!("exec-1"), json!("exec-2"), json!("exec-3")]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire format
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_command_round_trips_through_broker() {
    let hub = MemoryHub::new();
    let a = Instance::boot(&hub, "main-a", InstanceType::Main).await;

    let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let tap: MessageHandler = Arc::new(move |_, raw: &str| sink.lock().push(raw.to_string()));
    hub.connect().subscribe(Channel::Commands, tap).await.unwrap();

    let outbound = OutboundCommand::new(CommandKind::CommunityPackageInstall)
        .with_payload(json!({
            "packageName": "n8n-nodes-extra",
            "packageVersion": "1.2.3",
            "nested": {"list": [1, 2, null], "flag": true},
        }))
        .with_targets(["main-b", "main-c"]);
    publish(&a, outbound.clone()).await;

    let raw = received.lock().pop().unwrap();
    let command: Command = serde_json::from_str(&raw).unwrap();
    assert_eq!(command, outbound.into_command("main-a"));
    assert_eq!(
        serde_json::to_value(&command).unwrap(),
        serde_json::from_str::<Value>(&raw).unwrap()
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler registry
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_registry_handlers_react_to_fleet_commands() {
    let hub = MemoryHub::new();
    let a = Instance::boot(&hub, "main-a", InstanceType::Main).await;
    let b = Instance::boot(&hub, "main-b", InstanceType::Main).await;
    b.identity.set_role(InstanceRole::Follower);

    let registry = HandlerRegistry::new(Arc::clone(&b.identity), b.bus.clone());
    let activated = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&activated);
    registry.on_command(
        CommandKind::AddWebhooksTriggersAndPollers,
        HandlerFilter::leader(),
        move |payload| sink.lock().push(payload["workflowId"].clone()),
    );
    registry.on_command(
        CommandKind::GetWorkerStatus,
        HandlerFilter::instance(InstanceType::Worker),
        |_| panic!("worker-only handler bound on a main instance"),
    );

    let first = registry.init();
    assert_eq!(registry.init(), first);
    assert_eq!(first, 1);

    publish(
        &a,
        OutboundCommand::new(CommandKind::AddWebhooksTriggersAndPollers)
            .with_payload(json!({"workflowId": "wf-1"})),
    )
    .await;
    assert!(activated.lock().is_empty());

    b.identity.set_role(InstanceRole::Leader);
    registry.reconfigure();
    publish(
        &a,
        OutboundCommand::new(CommandKind::AddWebhooksTriggersAndPollers)
            .with_payload(json!({"workflowId": "wf-2"})),
    )
    .await;
    publish(&a, OutboundCommand::new(CommandKind::GetWorkerStatus)).await;
    settle().await;

    assert_eq!(*activated.lock(), vec![json!("wf-2")]);
}

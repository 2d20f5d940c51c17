//! Declarative binding of business handlers to the local event bus.
//!
//! Handlers are declared once at startup with an optional instance filter and
//! bound by [`HandlerRegistry::init`]. Binding is filtered by instance type;
//! the role filter is re-checked on every dispatch because leader election can
//! flip the role between two `init` calls.

use std::sync::Arc;

use convoy_types::{CommandKind, InstanceRole, InstanceType, ResponseKind, SharedIdentity};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, trace};

use crate::bus::{EventHandler, HandlerId, PubSubEventBus};

/// Which instances a handler runs on. `None` fields match anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerFilter {
    pub instance_type: Option<InstanceType>,
    pub instance_role: Option<InstanceRole>,
}

impl HandlerFilter {
    /// Runs on every instance.
    pub fn any() -> Self {
        Self::default()
    }

    /// Runs on instances of one type.
    pub fn instance(instance_type: InstanceType) -> Self {
        Self {
            instance_type: Some(instance_type),
            instance_role: None,
        }
    }

    /// Runs only on the leading main instance.
    pub fn leader() -> Self {
        Self {
            instance_type: Some(InstanceType::Main),
            instance_role: Some(InstanceRole::Leader),
        }
    }

    pub fn with_role(mut self, role: InstanceRole) -> Self {
        self.instance_role = Some(role);
        self
    }

    fn matches_type(&self, instance_type: InstanceType) -> bool {
        self.instance_type.is_none_or(|t| t == instance_type)
    }
}

struct Declaration {
    event: String,
    filter: HandlerFilter,
    handler: EventHandler,
}

struct RegistryInner {
    identity: SharedIdentity,
    bus: PubSubEventBus,
    declarations: Mutex<Vec<Declaration>>,
    bound: Mutex<Vec<(String, HandlerId)>>,
}

/// Table of declared handlers and the bus bindings built from it.
#[derive(Clone)]
pub struct HandlerRegistry {
    inner: Arc<RegistryInner>,
}

impl HandlerRegistry {
    pub fn new(identity: SharedIdentity, bus: PubSubEventBus) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                identity,
                bus,
                declarations: Mutex::new(Vec::new()),
                bound: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Declare a handler for `event`. Takes effect on the next [`init`](Self::init).
    pub fn register<F>(&self, event: impl Into<String>, filter: HandlerFilter, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let event = event.into();
        trace!(event = %event, ?filter, "declared handler");
        self.inner.declarations.lock().push(Declaration {
            event,
            filter,
            handler: Arc::new(handler),
        });
    }

    /// Declare a handler for a fleet command.
    pub fn on_command<F>(&self, command: CommandKind, filter: HandlerFilter, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(command.as_str(), filter, handler);
    }

    /// Declare a handler for a worker response.
    pub fn on_response<F>(&self, response: ResponseKind, filter: HandlerFilter, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(response.as_str(), filter, handler);
    }

    /// Unbind everything, then bind every declaration whose type filter matches
    /// this instance. Returns the number of bound handlers.
    ///
    /// Safe to call repeatedly; the bound set after two calls equals the set
    /// after one.
    pub fn init(&self) -> usize {
        // Held for the whole rebind so concurrent calls cannot interleave.
        let mut bound = self.inner.bound.lock();
        for (event, id) in bound.drain(..) {
            self.inner.bus.off(&event, id);
        }

        let instance_type = self.inner.identity.instance_type();
        let declarations = self.inner.declarations.lock();
        for decl in declarations
            .iter()
            .filter(|d| d.filter.matches_type(instance_type))
        {
            let id = self
                .inner
                .bus
                .on_shared(&decl.event, self.wrap(decl));
            bound.push((decl.event.clone(), id));
        }

        debug!(
            instance_type = %instance_type,
            role = ?self.inner.identity.role(),
            bound = bound.len(),
            declared = declarations.len(),
            "handler registry initialized"
        );
        bound.len()
    }

    /// Rebind after a role change.
    pub fn reconfigure(&self) -> usize {
        info!(
            host_id = %self.inner.identity.host_id(),
            role = ?self.inner.identity.role(),
            "reconfiguring handlers"
        );
        self.init()
    }

    /// Number of handlers currently bound to the bus.
    pub fn bound_count(&self) -> usize {
        self.inner.bound.lock().len()
    }

    /// Events with at least one bound handler, in binding order.
    pub fn bound_events(&self) -> Vec<String> {
        self.inner
            .bound
            .lock()
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    fn wrap(&self, decl: &Declaration) -> EventHandler {
        let identity = Arc::clone(&self.inner.identity);
        let handler = Arc::clone(&decl.handler);
        let required_role = decl.filter.instance_role;
        let event = decl.event.clone();
        Arc::new(move |payload: &Value| {
            if let Some(role) = required_role
                && identity.role() != Some(role)
            {
                trace!(event = %event, required = %role, "skipping handler for current role");
                return;
            }
            handler(payload);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_types::InstanceIdentity;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Value) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move |_: &Value| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_type_filter_applied_at_init() {
        let identity = InstanceIdentity::with_host_id("worker-1", InstanceType::Worker).shared();
        let bus = PubSubEventBus::new();
        let registry = HandlerRegistry::new(identity, bus.clone());

        let (worker_calls, worker_handler) = counter();
        let (main_calls, main_handler) = counter();
        registry.on_command(
            CommandKind::GetWorkerStatus,
            HandlerFilter::instance(InstanceType::Worker),
            worker_handler,
        );
        registry.on_command(
            CommandKind::GetWorkerStatus,
            HandlerFilter::instance(InstanceType::Main),
            main_handler,
        );

        assert_eq!(registry.init(), 1);
        bus.emit("get-worker-status", &json!({}));
        assert_eq!(worker_calls.load(Ordering::SeqCst), 1);
        assert_eq!(main_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_init_twice_does_not_double_bind() {
        let identity = InstanceIdentity::with_host_id("main-1", InstanceType::Main).shared();
        let bus = PubSubEventBus::new();
        let registry = HandlerRegistry::new(identity, bus.clone());
        let (calls, handler) = counter();
        registry.on_command(CommandKind::ReloadLicense, HandlerFilter::any(), handler);

        registry.init();
        let first = registry.bound_events();
        registry.init();
        assert_eq!(registry.bound_events(), first);
        assert_eq!(bus.handler_count("reload-license"), 1);

        bus.emit("reload-license", &json!({}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_role_rechecked_at_dispatch() {
        let identity = InstanceIdentity::with_host_id("main-1", InstanceType::Main).shared();
        identity.set_role(InstanceRole::Follower);
        let bus = PubSubEventBus::new();
        let registry = HandlerRegistry::new(Arc::clone(&identity), bus.clone());
        let (calls, handler) = counter();
        registry.on_command(
            CommandKind::AddWebhooksTriggersAndPollers,
            HandlerFilter::leader(),
            handler,
        );
        registry.init();

        bus.emit("add-webhooks-triggers-and-pollers", &json!({}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // No re-init: the wrapped handler reads the live role
        identity.set_role(InstanceRole::Leader);
        bus.emit("add-webhooks-triggers-and-pollers", &json!({}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_late_declaration_bound_on_reconfigure() {
        let identity = InstanceIdentity::with_host_id("main-1", InstanceType::Main).shared();
        let bus = PubSubEventBus::new();
        let registry = HandlerRegistry::new(identity, bus.clone());
        registry.init();
        assert_eq!(registry.bound_count(), 0);

        registry.on_response(
            ResponseKind::ResponseToGetWorkerStatus,
            HandlerFilter::any(),
            |_| {},
        );
        assert_eq!(registry.reconfigure(), 1);
        assert_eq!(bus.handler_count("response-to-get-worker-status"), 1);
    }
}

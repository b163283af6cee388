//! Per-device namespace handlers
//!
//! A handler binds one namespace to one device: its polling cadence, the
//! running estimate of how big its replies are (which feeds the multiplexer's
//! packing budget) and the parse callback the entity layer registered for it.
//! Handlers are created lazily the first time a namespace is seen for the
//! device and live as long as the session.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::trace;

use crate::protocol::message::Request;
use crate::protocol::namespaces::Namespace;

/// Callback receiving the decoded payload of every reply/push for one
/// namespace.
pub type ParseFn = Box<dyn FnMut(&Value) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingPolicy {
    /// Never polled; refreshed by pushes only.
    None,
    /// Polled on a fixed period.
    Always,
    /// Polled on a period, but skipped when the cycle's cloud-request quota
    /// is spent and stretched to a longer period on cloud paths.
    Smart,
    /// Only rides along in a batch with spare capacity, oldest first.
    Lazy,
    /// Queried once after the device comes online, then never again.
    Once,
}

struct PollingDefaults {
    policy: PollingPolicy,
    period: Duration,
    cloud_period: Duration,
    base_size: usize,
    item_size: usize,
}

/// Cadence and size defaults for the namespaces worth polling. Anything not
/// listed relies on pushes when it has them, else gets a slow lazy poll.
fn polling_defaults(ns: &Namespace) -> PollingDefaults {
    let fixed = |policy, period, cloud_period, base_size, item_size| PollingDefaults {
        policy,
        period: Duration::from_secs(period),
        cloud_period: Duration::from_secs(cloud_period),
        base_size,
        item_size,
    };
    match ns.name.as_str() {
        // batch container, never polled on its own
        "Appliance.Control.Multiple" => fixed(PollingPolicy::None, 0, 0, 0, 0),
        "Appliance.Control.Electricity" => fixed(PollingPolicy::Smart, 30, 120, 320, 53),
        "Appliance.Control.ConsumptionX" => fixed(PollingPolicy::Smart, 60, 300, 320, 53),
        "Appliance.System.Runtime" => fixed(PollingPolicy::Lazy, 300, 600, 330, 0),
        "Appliance.System.DNDMode" => fixed(PollingPolicy::Lazy, 300, 600, 320, 0),
        "Appliance.System.Debug" => fixed(PollingPolicy::Once, 0, 0, 1900, 0),
        "Appliance.Hub.Battery" => fixed(PollingPolicy::Lazy, 3600, 7200, 320, 40),
        "Appliance.Hub.Sensor.All" => fixed(PollingPolicy::Smart, 120, 300, 320, 250),
        "Appliance.Hub.Mts100.All" => fixed(PollingPolicy::Smart, 120, 300, 320, 350),
        "Appliance.RollerShutter.State" => fixed(PollingPolicy::Always, 30, 120, 320, 40),
        "Appliance.RollerShutter.Position" => fixed(PollingPolicy::Always, 30, 120, 320, 40),
        _ if ns.has_push => fixed(PollingPolicy::None, 0, 0, ns.name.len() + 320, 0),
        _ => fixed(
            PollingPolicy::Lazy,
            300,
            600,
            ns.name.len() + 320,
            0,
        ),
    }
}

pub struct NamespaceHandler {
    pub namespace: Arc<Namespace>,
    pub policy: PollingPolicy,
    pub period: Duration,
    pub cloud_period: Duration,
    pub response_base_size: usize,
    pub response_item_size: usize,
    response_size: usize,
    pub last_request: Option<Instant>,
    pub last_response: Option<Instant>,
    next_poll: Option<Instant>,
    parser: Option<ParseFn>,
}

impl NamespaceHandler {
    pub fn new(namespace: Arc<Namespace>) -> Self {
        let defaults = polling_defaults(&namespace);
        Self {
            namespace,
            policy: defaults.policy,
            period: defaults.period,
            cloud_period: defaults.cloud_period,
            response_base_size: defaults.base_size,
            response_item_size: defaults.item_size,
            response_size: defaults.base_size,
            last_request: None,
            last_response: None,
            next_poll: None,
            parser: None,
        }
    }

    pub fn set_parser(&mut self, parser: ParseFn) {
        self.parser = Some(parser);
    }

    /// The request used to poll this namespace.
    pub fn polling_request(&self) -> Request {
        Request::poll(self.namespace.clone())
    }

    /// Current estimate of this namespace's reply size on the wire.
    pub fn response_estimate(&self) -> usize {
        self.response_size
    }

    /// Due for a poll under its own cadence (policy aside).
    pub fn is_due(&self, now: Instant) -> bool {
        match self.next_poll {
            None => true,
            Some(next) => next <= now,
        }
    }

    /// Bookkeeping for an issued poll; enforces monotonic cadence.
    pub fn mark_requested(&mut self, now: Instant) {
        self.last_request = Some(now);
        self.next_poll = Some(now + self.period);
    }

    /// Feeds a decoded reply/push payload to the registered parser and
    /// refreshes the size estimate from the observed item count.
    pub fn handle(&mut self, payload: &Value) {
        self.last_response = Some(Instant::now());
        if let Some(items) = payload
            .get(&self.namespace.payload_key)
            .and_then(Value::as_array)
        {
            self.response_size = self.response_base_size + items.len() * self.response_item_size;
        }
        trace!(namespace = %self.namespace.name, "payload dispatched");
        if let Some(parser) = &mut self.parser {
            parser(payload);
        }
    }

    /// Saw a fresh value within the current period (via push or poll).
    pub fn recently_refreshed(&self, now: Instant) -> bool {
        match self.last_response {
            Some(at) => now.duration_since(at) < self.period,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::namespaces::NamespaceRegistry;
    use crate::protocol::Method;
    use serde_json::json;
    use std::sync::mpsc;

    fn handler_for(name: &str) -> NamespaceHandler {
        NamespaceHandler::new(NamespaceRegistry::new().resolve(name))
    }

    #[test]
    fn cadence_bookkeeping() {
        let mut handler = handler_for("Appliance.Control.Electricity");
        assert_eq!(handler.policy, PollingPolicy::Smart);
        let now = Instant::now();
        assert!(handler.is_due(now));
        handler.mark_requested(now);
        assert!(!handler.is_due(now));
        assert!(handler.is_due(now + handler.period));
    }

    #[test]
    fn parser_receives_payload_and_size_adapts() {
        let mut handler = handler_for("Appliance.Control.ToggleX");
        let base = handler.response_base_size;
        let (tx, rx) = mpsc::channel();
        handler.set_parser(Box::new(move |payload| {
            let _ = tx.send(payload.clone());
        }));
        let payload = json!({ "togglex": [
            { "channel": 0, "onoff": 1 }, { "channel": 1, "onoff": 0 }
        ]});
        handler.response_item_size = 50;
        handler.handle(&payload);
        assert_eq!(rx.try_recv().unwrap(), payload);
        assert_eq!(handler.response_estimate(), base + 100);
        assert!(handler.last_response.is_some());
    }

    #[test]
    fn push_backed_namespaces_default_to_no_polling() {
        let handler = handler_for("Appliance.Control.ToggleX");
        assert_eq!(handler.policy, PollingPolicy::None);
        let handler = handler_for("Appliance.System.Runtime");
        assert_eq!(handler.policy, PollingPolicy::Lazy);
    }

    #[test]
    fn polling_request_follows_grammar() {
        let handler = handler_for("Appliance.Control.ToggleX");
        let request = handler.polling_request();
        assert_eq!(request.method, Method::Get);
        assert_eq!(request.payload, json!({ "togglex": [] }));
    }
}

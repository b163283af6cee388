//! Request multiplexing into `Appliance.Control.Multiple`
//!
//! Devices answer a batch of namespace requests in one wire call, but their
//! embedded HTTP server has a hard output-buffer limit and some firmwares
//! drop oversized batches entirely instead of truncating. The packing budget
//! therefore tracks an adaptive `[size_min, size_max]` estimate of what the
//! device can actually return: it grows toward observed reply sizes and
//! shrinks on truncation or total batch failure. The exact curve is a tuned
//! policy, not device gospel.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::protocol::message::{self, DeviceKey, Message};

pub use crate::protocol::message::Request;

pub const MULTIPLE_NAMESPACE: &str = "Appliance.Control.Multiple";

/// Initial budget per command slot the device advertises.
const SIZE_PER_COMMAND: usize = 800;
/// Floor below which the budget never shrinks.
const SIZE_FLOOR: usize = 1000;

/// Accumulation buffer for one polling cycle plus the adaptive size budget.
pub struct Multiplexer {
    buffer: Vec<Request>,
    estimate: usize,
    pub size_min: usize,
    pub size_max: usize,
    pub max_commands: usize,
}

impl Multiplexer {
    pub fn new(max_commands: usize) -> Self {
        Self {
            buffer: Vec::new(),
            estimate: 0,
            size_min: SIZE_FLOOR,
            size_max: SIZE_FLOOR.max(max_commands * SIZE_PER_COMMAND),
            max_commands,
        }
    }

    /// Re-derives the budget when the device advertises its batch limit.
    pub fn set_max_commands(&mut self, max_commands: usize) {
        self.max_commands = max_commands.max(1);
        self.size_max = self
            .size_max
            .max(SIZE_FLOOR.max(self.max_commands * SIZE_PER_COMMAND));
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn fits(&self, estimate: usize) -> bool {
        self.buffer.len() < self.max_commands && self.estimate + estimate <= self.size_max
    }

    /// Greedy packing: accepts while the running estimate stays within the
    /// budget and the command-count limit.
    pub fn try_push(&mut self, request: Request, estimate: usize) -> bool {
        if !self.fits(estimate) {
            return false;
        }
        self.estimate += estimate;
        self.buffer.push(request);
        true
    }

    pub fn drain(&mut self) -> Vec<Request> {
        self.estimate = 0;
        std::mem::take(&mut self.buffer)
    }

    /// Grows the window toward reply sizes the device demonstrably produces.
    pub fn observe_response_size(&mut self, len: usize) {
        if len > self.size_min {
            self.size_min = len;
        }
        if len > self.size_max {
            debug!(len, "observed reply larger than budget, growing");
            self.size_max = len;
        }
    }

    /// A reply came back truncated at `received` bytes.
    pub fn shrink_truncated(&mut self, received: usize) {
        self.size_max = self.size_min.max(received * 9 / 10);
        warn!(size_max = self.size_max, "budget shrunk after truncation");
    }

    /// The device returned nothing at all for a batch: halve the gap to the
    /// last known-good minimum.
    pub fn shrink_failed(&mut self) {
        self.size_max = self.size_min.max((self.size_max + self.size_min) / 2);
        warn!(size_max = self.size_max, "budget shrunk after batch failure");
    }
}

/// Builds the batched payload: each sub-request is a complete signed envelope
/// under the `multiple` key.
pub fn pack(requests: &[Request], key: &str, from: &str) -> Value {
    let seed = DeviceKey::Shared(key.to_owned());
    let subs: Vec<Value> = requests
        .iter()
        .filter_map(|request| {
            let message = message::build(
                &request.namespace.name,
                request.method,
                request.payload.clone(),
                &seed,
                from,
            );
            serde_json::to_value(message).ok()
        })
        .collect();
    json!({ "multiple": subs })
}

/// Splits a batch reply into its sub-messages, in device order.
pub fn unpack(payload: &Value) -> Vec<Message> {
    let Some(subs) = payload.get("multiple").and_then(Value::as_array) else {
        return Vec::new();
    };
    subs.iter()
        .filter_map(|sub| match serde_json::from_value(sub.clone()) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(error = %err, "dropping malformed sub-reply");
                None
            }
        })
        .collect()
}

/// Matches a batch's sub-replies back to its requests: returns the replies to
/// dispatch (in device order) and the namespaces that did not come back.
pub fn reconcile(requests: &[Request], replies: Vec<Message>) -> (Vec<Message>, Vec<String>) {
    let mut missing: Vec<String> = requests
        .iter()
        .map(|request| request.namespace.name.clone())
        .collect();
    let mut dispatch = Vec::with_capacity(replies.len());
    for reply in replies {
        if let Some(pos) = missing.iter().position(|name| *name == reply.header.namespace) {
            missing.remove(pos);
        }
        dispatch.push(reply);
    }
    (dispatch, missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::namespaces::NamespaceRegistry;
    use crate::protocol::Method;
    use serde_json::json;

    fn poll_request(registry: &NamespaceRegistry, name: &str) -> Request {
        Request::poll(registry.resolve(name))
    }

    #[test]
    fn budget_packs_greedily() {
        let registry = NamespaceRegistry::new();
        let mut mux = Multiplexer::new(10);
        mux.size_max = 300;
        let mut deferred = 0;
        for i in 0..10 {
            let request = poll_request(&registry, &format!("Appliance.Fake.Ns{i}"));
            if !mux.try_push(request, 50) {
                deferred += 1;
            }
        }
        // exactly one batch of six, four left for the next cycle
        assert_eq!(mux.len(), 6);
        assert_eq!(deferred, 4);
        assert_eq!(mux.drain().len(), 6);
        assert!(mux.is_empty());
    }

    #[test]
    fn command_count_limit_applies() {
        let registry = NamespaceRegistry::new();
        let mut mux = Multiplexer::new(2);
        mux.size_max = 10_000;
        assert!(mux.try_push(poll_request(&registry, "Appliance.A.B"), 10));
        assert!(mux.try_push(poll_request(&registry, "Appliance.C.D"), 10));
        assert!(!mux.try_push(poll_request(&registry, "Appliance.E.F"), 10));
    }

    #[test]
    fn budget_adapts_in_both_directions() {
        let mut mux = Multiplexer::new(5);
        let initial_max = mux.size_max;
        mux.observe_response_size(initial_max + 500);
        assert_eq!(mux.size_max, initial_max + 500);
        assert_eq!(mux.size_min, initial_max + 500);

        mux.size_min = 1000;
        mux.shrink_truncated(2000);
        assert_eq!(mux.size_max, 1800);
        mux.shrink_failed();
        assert_eq!(mux.size_max, 1400);
        // never below the known-good minimum
        mux.shrink_truncated(100);
        assert_eq!(mux.size_max, 1000);
    }

    #[test]
    fn pack_and_unpack_round_trip() {
        let registry = NamespaceRegistry::new();
        let requests = vec![
            poll_request(&registry, "Appliance.System.Runtime"),
            poll_request(&registry, "Appliance.Control.ToggleX"),
        ];
        let payload = pack(&requests, "key", "Meross");
        let subs = payload["multiple"].as_array().unwrap();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0]["header"]["namespace"], "Appliance.System.Runtime");
        assert_eq!(subs[0]["header"]["method"], "GET");
        // each sub-message carries its own signed header
        assert!(subs[1]["header"]["sign"].as_str().is_some());

        let messages = unpack(&payload);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].header.namespace, "Appliance.Control.ToggleX");
        assert!(unpack(&json!({})).is_empty());
    }

    #[test]
    fn reconcile_partial_batch() {
        let registry = NamespaceRegistry::new();
        let requests: Vec<Request> = (0..5)
            .map(|i| poll_request(&registry, &format!("Appliance.Fake.Ns{i}")))
            .collect();
        let replies = unpack(&pack(&requests[..3].to_vec(), "key", "Meross"));
        let (dispatch, missing) = reconcile(&requests, replies);
        assert_eq!(dispatch.len(), 3);
        assert_eq!(missing, vec!["Appliance.Fake.Ns3", "Appliance.Fake.Ns4"]);
    }

    #[test]
    fn reconcile_full_batch_has_no_missing() {
        let registry = NamespaceRegistry::new();
        let requests = vec![
            poll_request(&registry, "Appliance.System.Runtime"),
            poll_request(&registry, "Appliance.Control.ToggleX"),
        ];
        let replies = unpack(&pack(&requests, "key", "Meross"));
        let (dispatch, missing) = reconcile(&requests, replies);
        assert_eq!(dispatch.len(), 2);
        assert!(missing.is_empty());
    }
}

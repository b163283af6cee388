//! Namespace grammar catalogue
//!
//! Every control/state surface of a device is addressed by a dotted namespace
//! name (`Appliance.Control.ToggleX`). The grammar of its payload (root key,
//! dict vs list, how list items are indexed) is not self-describing, so the
//! registry pre-registers the well-known namespaces and infers a best-effort
//! definition for anything unknown, first from the name alone and then from
//! the first observed message. Inferred definitions are memoized for the
//! process lifetime.
//!
//! Hub namespaces (`Appliance.Hub.*`) address sub-devices behind a hub and
//! index their list payloads by `id`/`subId` instead of `channel`; the
//! registry keeps those in an explicit override map consulted before the
//! default one.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use tracing::debug;

use super::Method;

/// Field used to index items of a list payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKey {
    Channel,
    Id,
    SubId,
}

impl ChannelKey {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKey::Channel => "channel",
            ChannelKey::Id => "id",
            ChannelKey::SubId => "subId",
        }
    }
}

/// Shape of the value under the payload root key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// A single object, no channel addressing.
    Dict,
    /// A single object carrying the channel field.
    DictChannel,
    /// A list of objects without per-item addressing.
    List,
    /// A list of objects indexed by the channel key.
    ListChannel,
}

impl PayloadShape {
    fn empty_value(self) -> Value {
        match self {
            PayloadShape::Dict | PayloadShape::DictChannel => json!({}),
            PayloadShape::List | PayloadShape::ListChannel => json!([]),
        }
    }
}

/// Immutable descriptor of one namespace's payload grammar.
#[derive(Debug, Clone)]
pub struct Namespace {
    pub name: String,
    /// Root key of the payload object.
    pub payload_key: String,
    pub channel_key: ChannelKey,
    pub payload_shape: PayloadShape,
    pub has_get: bool,
    pub has_set: bool,
    pub has_push: bool,
    /// Namespace is queried by sending an empty PUSH instead of a GET.
    pub push_query: bool,
}

impl Namespace {
    fn new(
        name: &str,
        payload_key: Option<&str>,
        channel_key: ChannelKey,
        payload_shape: PayloadShape,
        has_get: bool,
        has_set: bool,
        has_push: bool,
        push_query: bool,
    ) -> Self {
        Self {
            name: name.to_owned(),
            payload_key: payload_key
                .map(str::to_owned)
                .unwrap_or_else(|| payload_key_from_name(name)),
            channel_key,
            payload_shape,
            has_get,
            has_set,
            has_push,
            push_query,
        }
    }

    /// Best-effort definition derived from the dotted name alone.
    fn inferred(name: &str) -> Self {
        let (channel_key, payload_shape) = if name.starts_with("Appliance.Hub.Sensor")
            || name.starts_with("Appliance.Hub.Mts")
        {
            (ChannelKey::SubId, PayloadShape::ListChannel)
        } else if name.starts_with("Appliance.Hub.") {
            (ChannelKey::Id, PayloadShape::ListChannel)
        } else if name.contains("RollerShutter") {
            (ChannelKey::Channel, PayloadShape::List)
        } else if name.contains("Thermostat") || name.contains("Control.Sensor") {
            (ChannelKey::Channel, PayloadShape::ListChannel)
        } else {
            (ChannelKey::Channel, PayloadShape::Dict)
        };
        Self::new(
            name,
            None,
            channel_key,
            payload_shape,
            true,
            false,
            true,
            false,
        )
    }

    /// Definition refined from the first observed message for this name.
    fn from_observed(name: &str, method: Method, payload: &Value) -> Self {
        let mut ns = Self::inferred(name);
        if let Some((key, value)) = payload.as_object().and_then(|map| map.iter().next()) {
            ns.payload_key = key.clone();
            ns.payload_shape = match value {
                Value::Array(items) => {
                    let channel = items.first().and_then(Value::as_object).and_then(|item| {
                        [ChannelKey::Channel, ChannelKey::Id, ChannelKey::SubId]
                            .into_iter()
                            .find(|ck| item.contains_key(ck.as_str()))
                    });
                    match channel {
                        Some(ck) => {
                            ns.channel_key = ck;
                            PayloadShape::ListChannel
                        }
                        None => PayloadShape::List,
                    }
                }
                Value::Object(map) if map.contains_key(ns.channel_key.as_str()) => {
                    PayloadShape::DictChannel
                }
                _ => PayloadShape::Dict,
            };
        }
        match method {
            Method::GetAck => ns.has_get = true,
            Method::SetAck => ns.has_set = true,
            Method::Push => ns.has_push = true,
            _ => {}
        }
        ns
    }

    /// Default payload for a GET query: `{key: {}}` or `{key: []}`.
    pub fn default_get_payload(&self) -> Value {
        json!({ &self.payload_key: self.payload_shape.empty_value() })
    }

    /// Default payload for a PUSH query (push-only namespaces).
    pub fn default_push_payload(&self) -> Value {
        json!({})
    }

    /// The verb used to poll this namespace.
    pub fn query_method(&self) -> Method {
        if self.push_query {
            Method::Push
        } else {
            Method::Get
        }
    }

    pub fn query_payload(&self) -> Value {
        match self.query_method() {
            Method::Push => self.default_push_payload(),
            _ => self.default_get_payload(),
        }
    }
}

/// `ToggleX` -> `togglex`, `Toggle` -> `toggle`.
fn payload_key_from_name(name: &str) -> String {
    let slug = match name.rsplit('.').next() {
        Some(slug) => slug,
        None => name,
    };
    let mut chars = slug.chars();
    let mut key = String::with_capacity(slug.len());
    if let Some(first) = chars.next() {
        key.extend(first.to_lowercase());
        let rest = chars.as_str();
        if let Some(stripped) = rest.strip_suffix('X') {
            key.push_str(stripped);
            key.push('x');
        } else {
            key.push_str(rest);
        }
    }
    key
}

struct RegistryInner {
    entries: HashMap<String, Arc<Namespace>>,
    /// Names whose grammar came from the static table or an observed message,
    /// as opposed to a blind name-only inference.
    confirmed: HashSet<String>,
}

/// Process-wide namespace catalogue. Read-mostly and append-only; shared
/// between sessions behind an [`Arc`].
pub struct NamespaceRegistry {
    inner: RwLock<RegistryInner>,
    hub_overrides: HashMap<String, Arc<Namespace>>,
}

impl NamespaceRegistry {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        let mut confirmed = HashSet::new();
        for ns in builtin_namespaces() {
            confirmed.insert(ns.name.clone());
            entries.insert(ns.name.clone(), Arc::new(ns));
        }
        let mut hub_overrides = HashMap::new();
        for ns in builtin_hub_overrides() {
            hub_overrides.insert(ns.name.clone(), Arc::new(ns));
        }
        Self {
            inner: RwLock::new(RegistryInner { entries, confirmed }),
            hub_overrides,
        }
    }

    /// Looks up `name`, inferring and memoizing a definition when unknown.
    /// Never fails.
    pub fn resolve(&self, name: &str) -> Arc<Namespace> {
        if let Some(ns) = self
            .inner
            .read()
            .ok()
            .and_then(|inner| inner.entries.get(name).cloned())
        {
            return ns;
        }
        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(ns) = inner.entries.get(name) {
            return ns.clone();
        }
        debug!(namespace = name, "inferring unknown namespace from name");
        let ns = Arc::new(Namespace::inferred(name));
        inner.entries.insert(name.to_owned(), ns.clone());
        ns
    }

    /// Hub-scoped lookup: explicit hub override first, else the default map.
    pub fn resolve_for_hub(&self, name: &str) -> Arc<Namespace> {
        if let Some(ns) = self.hub_overrides.get(name) {
            return ns.clone();
        }
        self.resolve(name)
    }

    /// Refines an unconfirmed definition from the first observed message.
    /// Idempotent: once a name is confirmed, later observations are ignored
    /// and the memoized definition is returned.
    pub fn register_observed(&self, name: &str, method: Method, payload: &Value) -> Arc<Namespace> {
        let mut inner = match self.inner.write() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inner.confirmed.contains(name) {
            if let Some(ns) = inner.entries.get(name) {
                return ns.clone();
            }
        }
        let ns = Arc::new(Namespace::from_observed(name, method, payload));
        debug!(
            namespace = name,
            key = %ns.payload_key,
            shape = ?ns.payload_shape,
            "registered namespace grammar from observed message"
        );
        inner.confirmed.insert(name.to_owned());
        inner.entries.insert(name.to_owned(), ns.clone());
        ns
    }
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_namespaces() -> Vec<Namespace> {
    use ChannelKey::*;
    use PayloadShape::*;
    // (name, key override, channel key, shape, get, set, push, push-query)
    let table: &[(
        &str,
        Option<&str>,
        ChannelKey,
        PayloadShape,
        bool,
        bool,
        bool,
        bool,
    )] = &[
        ("Appliance.System.Ability", None, Channel, Dict, true, false, false, false),
        ("Appliance.System.All", None, Channel, Dict, true, false, false, false),
        ("Appliance.System.Clock", None, Channel, Dict, false, false, true, false),
        ("Appliance.System.Debug", None, Channel, Dict, true, false, false, false),
        ("Appliance.System.DNDMode", Some("DNDMode"), Channel, Dict, true, true, false, false),
        ("Appliance.System.Hardware", None, Channel, Dict, true, false, false, false),
        ("Appliance.System.Firmware", None, Channel, Dict, true, false, false, false),
        ("Appliance.System.Online", None, Channel, Dict, true, false, true, false),
        ("Appliance.System.Report", None, Channel, List, false, false, true, false),
        ("Appliance.System.Runtime", None, Channel, Dict, true, false, false, false),
        ("Appliance.System.Time", None, Channel, Dict, true, false, true, false),
        ("Appliance.Config.Info", None, Channel, Dict, true, false, false, false),
        ("Appliance.Control.Bind", None, Channel, Dict, false, false, true, false),
        ("Appliance.Control.ConsumptionX", None, Channel, List, true, false, false, false),
        ("Appliance.Control.Electricity", None, Channel, DictChannel, true, false, false, false),
        ("Appliance.Control.Light", None, Channel, DictChannel, true, true, true, false),
        ("Appliance.Control.Multiple", None, Channel, List, false, true, false, false),
        ("Appliance.Control.Spray", None, Channel, DictChannel, true, true, true, false),
        ("Appliance.Control.Toggle", None, Channel, DictChannel, true, true, true, false),
        ("Appliance.Control.ToggleX", None, Channel, ListChannel, true, true, true, false),
        ("Appliance.Control.TriggerX", None, Channel, List, true, true, true, false),
        ("Appliance.Control.Unbind", None, Channel, Dict, false, false, true, false),
        ("Appliance.Control.Thermostat.Mode", None, Channel, ListChannel, true, true, true, false),
        ("Appliance.Control.Thermostat.Calibration", None, Channel, ListChannel, true, true, false, false),
        ("Appliance.GarageDoor.State", None, Channel, Dict, true, true, true, false),
        ("Appliance.RollerShutter.State", None, Channel, List, true, false, true, false),
        ("Appliance.RollerShutter.Position", None, Channel, List, true, true, true, false),
        ("Appliance.Digest.TimerX", None, Channel, List, true, false, false, false),
        ("Appliance.Hub.Battery", None, Id, ListChannel, true, false, false, false),
        ("Appliance.Hub.Exception", None, Id, ListChannel, false, false, true, false),
        ("Appliance.Hub.Online", None, Id, ListChannel, true, false, true, false),
        ("Appliance.Hub.Sensor.All", None, SubId, ListChannel, true, false, true, false),
        ("Appliance.Hub.Sensor.Adjust", None, SubId, ListChannel, false, false, true, true),
        ("Appliance.Hub.Mts100.All", None, SubId, ListChannel, true, false, false, false),
        ("Appliance.Hub.Mts100.Mode", None, SubId, ListChannel, true, true, true, false),
    ];
    table
        .iter()
        .map(|&(name, key, channel, shape, get, set, push, push_query)| {
            Namespace::new(name, key, channel, shape, get, set, push, push_query)
        })
        .collect()
}

/// Namespaces whose grammar differs when addressed through a hub.
fn builtin_hub_overrides() -> Vec<Namespace> {
    use ChannelKey::*;
    use PayloadShape::*;
    vec![
        Namespace::new(
            "Appliance.Control.ToggleX",
            None,
            Id,
            ListChannel,
            true,
            true,
            true,
            false,
        ),
        Namespace::new(
            "Appliance.System.All",
            None,
            Id,
            ListChannel,
            true,
            false,
            false,
            false,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_key_derivation() {
        assert_eq!(payload_key_from_name("Appliance.Control.ToggleX"), "togglex");
        assert_eq!(payload_key_from_name("Appliance.Control.Toggle"), "toggle");
        assert_eq!(
            payload_key_from_name("Appliance.Control.Electricity"),
            "electricity"
        );
    }

    #[test]
    fn resolve_never_fails_and_memoizes() {
        let registry = NamespaceRegistry::new();
        let a = registry.resolve("Appliance.Made.Up");
        let b = registry.resolve("Appliance.Made.Up");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.payload_key, "up");
        assert_eq!(a.payload_shape, PayloadShape::Dict);
    }

    #[test]
    fn observed_grammar_round_trips() {
        let registry = NamespaceRegistry::new();
        let payload = json!({ "strange": [{ "channel": 2, "value": 10 }] });
        let ns = registry.register_observed("Appliance.Control.Strange", Method::GetAck, &payload);
        assert_eq!(ns.payload_key, "strange");
        assert_eq!(ns.payload_shape, PayloadShape::ListChannel);
        assert_eq!(ns.channel_key, ChannelKey::Channel);
        assert!(ns.has_get);
        // the generated default query matches the observed shape
        assert_eq!(ns.default_get_payload(), json!({ "strange": [] }));

        // idempotent: a second observation does not replace the definition
        let again = registry.register_observed(
            "Appliance.Control.Strange",
            Method::GetAck,
            &json!({ "other": {} }),
        );
        assert!(Arc::ptr_eq(&ns, &again));
    }

    #[test]
    fn observed_dict_shape() {
        let registry = NamespaceRegistry::new();
        let ns = registry.register_observed(
            "Appliance.Control.Odd",
            Method::Push,
            &json!({ "odd": { "mode": 1 } }),
        );
        assert_eq!(ns.payload_shape, PayloadShape::Dict);
        assert_eq!(ns.default_get_payload(), json!({ "odd": {} }));
        let ns2 = registry.resolve("Appliance.Control.Odd");
        assert!(Arc::ptr_eq(&ns, &ns2));
    }

    #[test]
    fn hub_override_falls_back_to_default() {
        let registry = NamespaceRegistry::new();
        let hub = registry.resolve_for_hub("Appliance.Control.ToggleX");
        assert_eq!(hub.channel_key, ChannelKey::Id);
        let plain = registry.resolve("Appliance.Control.ToggleX");
        assert_eq!(plain.channel_key, ChannelKey::Channel);
        // no override registered: falls back to the default map
        let other = registry.resolve_for_hub("Appliance.Control.Electricity");
        assert_eq!(other.channel_key, ChannelKey::Channel);
    }

    #[test]
    fn push_only_namespaces_query_via_push() {
        let registry = NamespaceRegistry::new();
        let ns = registry.resolve("Appliance.Hub.Sensor.Adjust");
        assert_eq!(ns.query_method(), Method::Push);
        assert_eq!(ns.query_payload(), json!({}));
        let ns = registry.resolve("Appliance.Control.ToggleX");
        assert_eq!(ns.query_method(), Method::Get);
    }
}

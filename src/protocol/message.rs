//! Envelope building, signing and validation
//!
//! Requests carry a fresh random `messageId` and unix `timestamp`, signed as
//! `md5(messageId + key + timestamp)`. Replies echo the request's header
//! fields, which enables the "reply key" fallback: a device that rejects our
//! signature still answers with a header signed by itself, and reusing that
//! header verbatim as the seed of the next request gets accepted without ever
//! knowing the real key.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::namespaces::Namespace;
use super::{uuid_from_topic, HostAddress, Method, ProtocolError, ERROR_CODE_INVALID_KEY};

pub(crate) fn md5_hex(parts: &[&str]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(32);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Header signature: `md5(messageId + key + timestamp)` as lowercase hex.
pub fn sign(message_id: &str, key: &str, timestamp: i64) -> String {
    md5_hex(&[message_id, key, &timestamp.to_string()])
}

/// AES key for the encrypted HTTP body variant, derived from device identity.
pub fn encryption_key(uuid: &str, key: &str, mac: &str) -> String {
    fn slice(s: &str, range: std::ops::Range<usize>) -> &str {
        s.get(range).unwrap_or("")
    }
    md5_hex(&[
        slice(uuid, 3..22),
        slice(key, 1..9),
        mac,
        slice(key, 10..28),
    ])
}

/// Fresh random 32-hex message id.
pub fn new_message_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    #[serde(rename = "messageId")]
    pub message_id: String,
    pub namespace: String,
    pub method: Method,
    #[serde(rename = "payloadVersion")]
    pub payload_version: u32,
    pub from: String,
    pub timestamp: i64,
    #[serde(rename = "timestampMs", default)]
    pub timestamp_ms: u32,
    pub sign: String,
    #[serde(rename = "triggerSrc", default, skip_serializing_if = "Option::is_none")]
    pub trigger_src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: Header,
    pub payload: Value,
}

impl Message {
    pub fn decode(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn verify(&self, key: &str) -> bool {
        self.header.sign == sign(&self.header.message_id, key, self.header.timestamp)
    }

    /// Device identity of the sender, from the explicit header field or the
    /// origin topic in `from`.
    pub fn source_uuid(&self) -> Option<&str> {
        self.header
            .uuid
            .as_deref()
            .or_else(|| uuid_from_topic(&self.header.from))
    }

    /// Error code of an `ERROR` reply payload.
    pub fn error_code(&self) -> Option<i64> {
        self.payload.get("error")?.get("code")?.as_i64()
    }
}

/// Signing seed for outgoing requests.
///
/// `Shared` is the normal configured device key. `Reply` is the cached header
/// of a previous device reply, replayed verbatim (the key-hack: works over
/// HTTP, not over brokered MQTT).
#[derive(Debug, Clone)]
pub enum DeviceKey {
    Shared(String),
    Reply(Header),
}

impl DeviceKey {
    pub fn shared(key: Option<&str>) -> Self {
        DeviceKey::Shared(key.unwrap_or_default().to_owned())
    }
}

/// Builds a signed request envelope.
pub fn build(
    namespace: &str,
    method: Method,
    payload: Value,
    key: &DeviceKey,
    from: &str,
) -> Message {
    let (message_id, timestamp, signature) = match key {
        DeviceKey::Shared(key) => {
            let message_id = new_message_id();
            let timestamp = Utc::now().timestamp();
            let signature = sign(&message_id, key, timestamp);
            (message_id, timestamp, signature)
        }
        DeviceKey::Reply(header) => (
            header.message_id.clone(),
            header.timestamp,
            header.sign.clone(),
        ),
    };
    Message {
        header: Header {
            message_id,
            namespace: namespace.to_owned(),
            method,
            payload_version: 1,
            from: from.to_owned(),
            timestamp,
            timestamp_ms: 0,
            sign: signature,
            trigger_src: None,
            uuid: None,
        },
        payload,
    }
}

/// Builds a reply to a device PUSH by replaying the pushed header, the way
/// the vendor broker answers those messages.
pub fn build_push_reply(mut header: Header, payload: Value) -> Message {
    header.uuid = None;
    header.trigger_src = Some("CloudControl".to_owned());
    Message { header, payload }
}

/// Checks a reply header against the configured key; on mismatch returns the
/// header itself for the reply-key scheme.
pub fn reply_key(header: &Header, key: Option<&str>) -> DeviceKey {
    if let Some(key) = key {
        if sign(&header.message_id, key, header.timestamp) == header.sign {
            return DeviceKey::Shared(key.to_owned());
        }
    }
    DeviceKey::Reply(header.clone())
}

/// Formal check of a reply: rejects `ERROR` replies with a typed error.
pub fn check_strict(message: Message) -> Result<Message, ProtocolError> {
    if message.header.method == Method::Error {
        let code = message.error_code().unwrap_or_default();
        if code == ERROR_CODE_INVALID_KEY {
            return Err(ProtocolError::Signature);
        }
        return Err(ProtocolError::Device {
            code,
            detail: message.payload.to_string(),
        });
    }
    Ok(message)
}

/// One pollable namespace request; message ids and signatures are minted at
/// send time, never carried in the request itself.
#[derive(Debug, Clone)]
pub struct Request {
    pub namespace: Arc<Namespace>,
    pub method: Method,
    pub payload: Value,
}

impl Request {
    pub fn new(namespace: Arc<Namespace>, method: Method, payload: Value) -> Self {
        Self {
            namespace,
            method,
            payload,
        }
    }

    /// The default query request for a namespace: a shaped GET, or an empty
    /// PUSH for push-only namespaces.
    pub fn poll(namespace: Arc<Namespace>) -> Self {
        let method = namespace.query_method();
        let payload = namespace.query_payload();
        Self::new(namespace, method, payload)
    }
}

/// Static identity and capability description of a device, parsed from an
/// `Appliance.System.All` reply.
#[derive(Debug, Clone, Default)]
pub struct DeviceDescriptor {
    pub uuid: String,
    pub device_type: String,
    pub hardware_version: String,
    pub firmware_version: String,
    pub mac: String,
    pub inner_ip: Option<String>,
    pub broker: Option<HostAddress>,
    pub user_id: Option<String>,
    pub time: Option<i64>,
    pub ability: HashMap<String, Value>,
    pub digest: Value,
}

impl DeviceDescriptor {
    pub fn parse(all_payload: &Value) -> Result<Self, ProtocolError> {
        let all = all_payload
            .get("all")
            .ok_or_else(|| ProtocolError::Malformed("missing 'all' in payload".to_owned()))?;
        let system = all.get("system").unwrap_or(&Value::Null);
        let hardware = system.get("hardware").unwrap_or(&Value::Null);
        let firmware = system.get("firmware").unwrap_or(&Value::Null);

        let text = |v: &Value, key: &str| -> String {
            v.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };

        let uuid = text(hardware, "uuid");
        if uuid.is_empty() {
            return Err(ProtocolError::Malformed(
                "missing hardware uuid".to_owned(),
            ));
        }
        let broker = match firmware.get("server").and_then(Value::as_str) {
            Some(server) if !server.is_empty() => {
                let port = firmware
                    .get("port")
                    .and_then(Value::as_u64)
                    .and_then(|p| u16::try_from(p).ok())
                    .unwrap_or(HostAddress::DEFAULT_MQTT_PORT);
                Some(HostAddress::new(server, port))
            }
            _ => None,
        };
        Ok(Self {
            uuid,
            device_type: text(hardware, "type"),
            hardware_version: text(hardware, "version"),
            firmware_version: text(firmware, "version"),
            mac: text(hardware, "macAddress"),
            inner_ip: firmware
                .get("innerIp")
                .and_then(Value::as_str)
                .map(str::to_owned),
            broker,
            user_id: firmware.get("userId").map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            time: system
                .get("time")
                .and_then(|t| t.get("timestamp"))
                .and_then(Value::as_i64),
            ability: HashMap::new(),
            digest: all.get("digest").cloned().unwrap_or(Value::Null),
        })
    }

    /// Merges the ability map from an `Appliance.System.Ability` reply.
    pub fn update_ability(&mut self, payload: &Value) {
        if let Some(ability) = payload.get("ability").and_then(Value::as_object) {
            self.ability = ability.clone().into_iter().collect();
        }
    }

    pub fn supports(&self, namespace: &str) -> bool {
        self.ability.contains_key(namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const KEY: &str = "meross-device-key";

    #[test]
    fn sign_is_deterministic() {
        let a = sign("abc", KEY, 1700000000);
        let b = sign("abc", KEY, 1700000000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, sign("abc", "other", 1700000000));
    }

    #[test]
    fn built_messages_verify_with_their_key() {
        let msg = build(
            "Appliance.Control.ToggleX",
            Method::Get,
            json!({ "togglex": [] }),
            &DeviceKey::Shared(KEY.to_owned()),
            super::super::MANUFACTURER,
        );
        assert!(msg.verify(KEY));
        assert!(!msg.verify("wrong-key"));
        assert_eq!(msg.header.payload_version, 1);
        assert_eq!(msg.header.message_id.len(), 32);
    }

    #[test]
    fn fresh_ids_per_build() {
        let key = DeviceKey::Shared(KEY.to_owned());
        let a = build("Appliance.System.All", Method::Get, json!({}), &key, "x");
        let b = build("Appliance.System.All", Method::Get, json!({}), &key, "x");
        assert_ne!(a.header.message_id, b.header.message_id);
    }

    #[test]
    fn header_wire_names() {
        let msg = build(
            "Appliance.System.All",
            Method::Get,
            json!({ "all": {} }),
            &DeviceKey::Shared(KEY.to_owned()),
            "/app/1-a/subscribe",
        );
        let encoded = msg.encode().unwrap();
        assert!(encoded.contains("\"messageId\""));
        assert!(encoded.contains("\"payloadVersion\":1"));
        assert!(encoded.contains("\"timestampMs\":0"));
        assert!(!encoded.contains("triggerSrc"));
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn reply_key_falls_back_to_header() {
        let msg = build(
            "Appliance.System.All",
            Method::Get,
            json!({}),
            &DeviceKey::Shared(KEY.to_owned()),
            "x",
        );
        match reply_key(&msg.header, Some(KEY)) {
            DeviceKey::Shared(k) => assert_eq!(k, KEY),
            other => panic!("expected shared key, got {other:?}"),
        }
        match reply_key(&msg.header, Some("wrong")) {
            DeviceKey::Reply(h) => assert_eq!(h.message_id, msg.header.message_id),
            other => panic!("expected reply header, got {other:?}"),
        }
        // replaying the cached header reuses its id/timestamp/sign verbatim
        let seed = reply_key(&msg.header, None);
        let replay = build("Appliance.System.All", Method::Get, json!({}), &seed, "x");
        assert_eq!(replay.header.message_id, msg.header.message_id);
        assert_eq!(replay.header.sign, msg.header.sign);
    }

    #[test]
    fn strict_check_maps_error_codes() {
        let mut msg = build(
            "Appliance.System.All",
            Method::Get,
            json!({ "error": { "code": 5001 } }),
            &DeviceKey::Shared(KEY.to_owned()),
            "x",
        );
        msg.header.method = Method::Error;
        assert!(matches!(
            check_strict(msg.clone()),
            Err(ProtocolError::Signature)
        ));
        msg.payload = json!({ "error": { "code": 5000 } });
        assert!(matches!(
            check_strict(msg.clone()),
            Err(ProtocolError::Device { code: 5000, .. })
        ));
        msg.header.method = Method::GetAck;
        assert!(check_strict(msg).is_ok());
    }

    #[test]
    fn descriptor_from_system_all() {
        let payload = json!({
            "all": {
                "system": {
                    "hardware": {
                        "type": "mss310", "uuid": "9109182170548290882048e1e9522946",
                        "macAddress": "48:e1:e9:52:29:46", "version": "6.0.0"
                    },
                    "firmware": {
                        "version": "6.1.8", "innerIp": "10.0.0.17",
                        "server": "iot.meross.com", "port": 443, "userId": 12345
                    },
                    "time": { "timestamp": 1700000000 }
                },
                "digest": { "togglex": [ { "channel": 0, "onoff": 1 } ] }
            }
        });
        let mut desc = DeviceDescriptor::parse(&payload).unwrap();
        assert_eq!(desc.uuid, "9109182170548290882048e1e9522946");
        assert_eq!(desc.device_type, "mss310");
        assert_eq!(desc.inner_ip.as_deref(), Some("10.0.0.17"));
        assert_eq!(desc.broker, Some(HostAddress::new("iot.meross.com", 443)));
        assert_eq!(desc.time, Some(1700000000));
        assert!(desc.digest.get("togglex").is_some());

        desc.update_ability(&json!({ "ability": { "Appliance.Control.ToggleX": {} } }));
        assert!(desc.supports("Appliance.Control.ToggleX"));
        assert!(!desc.supports("Appliance.Control.Light"));

        assert!(DeviceDescriptor::parse(&json!({})).is_err());
    }

    #[test]
    fn encryption_key_shape() {
        let k = encryption_key(
            "9109182170548290882048e1e9522946",
            "0123456789abcdef0123456789ab",
            "48:e1:e9:52:29:46",
        );
        assert_eq!(k.len(), 32);
        assert!(k.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

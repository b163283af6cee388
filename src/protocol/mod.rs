//! Wire protocol for Meross appliances
//!
//! Every exchange, over HTTP or MQTT, is a JSON envelope of a signed header
//! plus a namespaced payload:
//!
//! ```text
//! {
//!   "header": {
//!     "messageId": "<32-hex>", "namespace": "Appliance.Control.ToggleX",
//!     "method": "GET", "payloadVersion": 1, "from": "<topic-or-tag>",
//!     "timestamp": 1700000000, "timestampMs": 0, "sign": "<md5 hex>"
//!   },
//!   "payload": { "togglex": [ { "channel": 0, "onoff": 1 } ] }
//! }
//! ```
//!
//! [`namespaces`] catalogues the namespace grammar (payload key, channel key,
//! payload shape, supported verbs) and infers definitions for namespaces it
//! has never seen. [`message`] builds, signs and validates the envelopes.

pub mod message;
pub mod namespaces;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag used in the `from` header field when no broker topic applies.
pub const MANUFACTURER: &str = "Meross";

/// Device error code signalling a signature/key mismatch.
pub const ERROR_CODE_INVALID_KEY: i64 = 5001;

/// Broker wildcard topic where devices announce themselves.
pub const TOPIC_DISCOVERY: &str = "/appliance/+/publish";

/// Topic a device listens on for requests.
pub fn device_request_topic(uuid: &str) -> String {
    format!("/appliance/{uuid}/subscribe")
}

/// Topic a device publishes replies and pushes on.
pub fn device_response_topic(uuid: &str) -> String {
    format!("/appliance/{uuid}/publish")
}

/// Topic identifying an app session on a cloud broker.
pub fn app_topic(user_id: &str, app_id: &str) -> String {
    format!("/app/{user_id}-{app_id}/subscribe")
}

/// Extracts the device uuid from a broker topic (`/appliance/{uuid}/publish`).
pub fn uuid_from_topic(topic: &str) -> Option<&str> {
    let mut parts = topic.split('/');
    let _ = parts.next()?;
    let _ = parts.next()?;
    let uuid = parts.next()?;
    parts.next()?;
    if uuid.is_empty() {
        None
    } else {
        Some(uuid)
    }
}

/// Message verb carried in the envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "GETACK")]
    GetAck,
    #[serde(rename = "SET")]
    Set,
    #[serde(rename = "SETACK")]
    SetAck,
    #[serde(rename = "PUSH")]
    Push,
    #[serde(rename = "ERROR")]
    Error,
}

impl Method {
    /// The acknowledgement method correlated to this verb, if any.
    pub fn ack(self) -> Option<Method> {
        match self {
            Method::Get => Some(Method::GetAck),
            Method::Set => Some(Method::SetAck),
            _ => None,
        }
    }

    pub fn expects_ack(self) -> bool {
        self.ack().is_some()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::GetAck => "GETACK",
            Method::Set => "SET",
            Method::SetAck => "SETACK",
            Method::Push => "PUSH",
            Method::Error => "ERROR",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `host[:port]` broker address as reported by devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
}

impl HostAddress {
    pub const DEFAULT_MQTT_PORT: u16 = 8883;

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host` or `host:port`, falling back to `default_port`.
    pub fn parse(address: &str, default_port: u16) -> Result<Self, ProtocolError> {
        let (host, port) = match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ProtocolError::Malformed(format!("bad port in {address:?}")))?;
                (host, port)
            }
            None => (address, default_port),
        };
        if host.is_empty() {
            return Err(ProtocolError::Malformed(format!(
                "empty host in {address:?}"
            )));
        }
        Ok(Self::new(host, port))
    }
}

impl FromStr for HostAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s, Self::DEFAULT_MQTT_PORT)
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("message signature does not match the configured key")]
    Signature,
    #[error("reply identity {received} does not match device {expected}")]
    IdentityMismatch { expected: String, received: String },
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("device reported error code {code}: {detail}")]
    Device { code: i64, detail: String },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_uuid_extraction() {
        let topic = device_response_topic("9109182170548290882048e1e9522946");
        assert_eq!(
            uuid_from_topic(&topic),
            Some("9109182170548290882048e1e9522946")
        );
        assert_eq!(uuid_from_topic("/app/0-abc/subscribe"), Some("0-abc"));
        assert_eq!(uuid_from_topic("nonsense"), None);
    }

    #[test]
    fn host_address_parsing() {
        let addr: HostAddress = "mqtt.local:1883".parse().unwrap();
        assert_eq!(addr, HostAddress::new("mqtt.local", 1883));
        let addr: HostAddress = "10.0.0.5".parse().unwrap();
        assert_eq!(addr.port, HostAddress::DEFAULT_MQTT_PORT);
        assert!("".parse::<HostAddress>().is_err());
        assert!("host:notaport".parse::<HostAddress>().is_err());
    }

    #[test]
    fn method_ack_mapping() {
        assert_eq!(Method::Get.ack(), Some(Method::GetAck));
        assert_eq!(Method::Set.ack(), Some(Method::SetAck));
        assert_eq!(Method::Push.ack(), None);
        assert!(Method::Get.expects_ack());
        assert!(!Method::Error.expects_ack());
    }
}

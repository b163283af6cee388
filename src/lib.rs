//! Client-side protocol engine for Meross smart-home appliances.
//!
//! Talks the vendor's namespace-based RPC over two interchangeable
//! transports: plain HTTP against the device's embedded server and MQTT
//! through a broker (local or cloud). The layers stack bottom-up:
//!
//! * [`protocol`]: the signed JSON envelope and the namespace grammar.
//! * [`transport`]: HTTP and MQTT wire paths plus broker rate limiting.
//! * [`device`]: per-device session tasks with adaptive polling and
//!   request multiplexing.
//! * [`config`]: the toml configuration the demo binary loads.
//!
//! The entry point for callers is [`DeviceSessionHandle::spawn`]: it owns
//! transport selection, the online/offline state machine and the polling
//! cadence, and hands decoded payloads to registered parse callbacks.

pub mod config;
pub mod device;
pub mod protocol;
pub mod transport;

pub use config::{BrokerConfig, DeviceConfig, EngineConfig, TransportPreference};
pub use device::session::{DeviceSessionHandle, SessionState};
pub use device::{Capability, DeviceError};
pub use protocol::message::{DeviceDescriptor, Message};
pub use protocol::namespaces::NamespaceRegistry;
pub use protocol::Method;
pub use transport::http::HttpTransport;
pub use transport::mqtt::{MqttIdentity, MqttTransport};
pub use transport::{TransportError, TransportKind};

//! Per-device session engine
//!
//! One long-lived task per device ties everything together:
//!
//! ```text
//!              ┌────────────── session task ──────────────┐
//!  commands ──►│ poll timer ─► [polling] ─► [multiplex] ──┼─► transports
//!  mqtt push ─►│                  │                       │
//!              │   handler table ◄┴── dispatch ◄──────────┼─◄ replies/pushes
//!              └──────────────────────────────────────────┘
//! ```
//!
//! [`polling`] decides which namespace handlers are due, [`multiplex`] packs
//! them into batched wire calls, [`session`] owns the online/offline state
//! machine and transport selection. Everything the task owns is mutated only
//! from inside it; the outside world talks through the command channel.

pub mod handlers;
pub mod multiplex;
pub mod polling;
pub mod session;

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("device session closed")]
    Closed,
    #[error("device offline")]
    Offline,
}

/// One optional feature module of a device (thermostat, diffuser, hub...).
///
/// A session holds an ordered list of these; each is initialized from the
/// device's ability map and fed the digest of every full state refresh.
pub trait Capability: Send {
    fn name(&self) -> &str;
    fn init(&mut self, ability: &HashMap<String, Value>);
    fn parse_digest(&mut self, digest: &Value);
}

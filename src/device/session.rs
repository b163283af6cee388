//! Device session state machine
//!
//! One tokio task per device owns everything mutable about it and is fed by a
//! single command channel: the polling timer, inbound transport messages,
//! configuration updates and external requests all arrive as messages into
//! the same loop.
//!
//! # State machine
//!
//! ```text
//!            probe ok                preferred healthy
//! Offline ──► Probing ──► Online(t) ──► Switching ──► Online(t')
//!    ▲           │            │
//!    └───────────┴────────────┘ repeated failure / identity mismatch
//!
//! any state ──► Shutdown (terminal)
//! ```
//!
//! A single namespace failing inside a cycle is isolated to its handler, but
//! repeated transport failures (or a whole heartbeat period of silence)
//! demote the device to a fresh identity check, and from there to offline
//! with backoff. Message ids and signatures are minted per send, so a
//! transport switch never replays a stale header.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{DeviceConfig, TransportPreference};
use crate::protocol::message::{self, DeviceDescriptor, Message, Request};
use crate::protocol::namespaces::{Namespace, NamespaceRegistry};
use crate::protocol::{Method, ProtocolError, ERROR_CODE_INVALID_KEY, MANUFACTURER};
use crate::transport::http::HttpTransport;
use crate::transport::mqtt::MqttTransport;
use crate::transport::{TransportError, TransportKind};

use super::handlers::{NamespaceHandler, ParseFn, PollingPolicy};
use super::multiplex::{self, Multiplexer, MULTIPLE_NAMESPACE};
use super::polling::{CycleEnv, Decision, PollingScheduler, CLOUD_QUOTA_PER_CYCLE};
use super::{Capability, DeviceError};

/// Ceiling for the offline backoff; also the slowest heartbeat cadence.
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(295);

const IDENTITY_NAMESPACE: &str = "Appliance.System.All";
const ABILITY_NAMESPACE: &str = "Appliance.System.Ability";
const ENCRYPTION_ABILITY: &str = "Appliance.Encrypt.ECDHE";
/// Batch limit assumed until the device advertises `maxCmdNum`.
const DEFAULT_BATCH_LIMIT: usize = 5;
/// Consecutive transport failures an online device gets before it is
/// demoted and re-probed.
const MAX_SEND_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Offline,
    Probing,
    Online(TransportKind),
    Switching {
        from: TransportKind,
        to: TransportKind,
    },
    Shutdown,
}

enum SessionCommand {
    Inbound(Message),
    Configure(DeviceConfig),
    Request {
        namespace: String,
        method: Method,
        payload: Value,
        respond: oneshot::Sender<Result<Message, DeviceError>>,
    },
    RegisterParser {
        namespace: String,
        parser: ParseFn,
    },
    Shutdown,
}

/// Owner-facing handle of one session task.
pub struct DeviceSessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<SessionState>,
    task: Option<JoinHandle<()>>,
}

impl DeviceSessionHandle {
    /// Builds the transports from `config` and spawns the session task.
    pub fn spawn(
        config: DeviceConfig,
        registry: Arc<NamespaceRegistry>,
        mqtt: Option<MqttTransport>,
        capabilities: Vec<Box<dyn Capability>>,
    ) -> Result<Self, DeviceError> {
        let http = match &config.host {
            Some(host) => Some(HttpTransport::new(host, config.key.clone())?),
            None => None,
        };
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(SessionState::Offline);
        let polling_delay = Duration::from_secs(config.polling_period_secs.max(1));
        info!(device = %config.device_id, "spawning device session");
        let session = DeviceSession {
            config,
            registry,
            http,
            mqtt,
            state_tx,
            state: SessionState::Offline,
            handlers: HashMap::new(),
            handler_order: Vec::new(),
            scheduler: PollingScheduler::new(CLOUD_QUOTA_PER_CYCLE),
            mux: Multiplexer::new(DEFAULT_BATCH_LIMIT),
            retry_queue: Vec::new(),
            capabilities,
            descriptor: None,
            polling_delay,
            time_delta: 0,
            consecutive_failures: 0,
            last_activity: Instant::now(),
            inbound_tx,
            inbound_rx,
            commands_rx,
        };
        let task = tokio::spawn(session.run());
        Ok(Self {
            commands: commands_tx,
            state_rx,
            task: Some(task),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Issues one request over whatever transport is viable and returns the
    /// validated reply.
    pub async fn request(
        &self,
        namespace: &str,
        method: Method,
        payload: Value,
    ) -> Result<Message, DeviceError> {
        let (respond, reply) = oneshot::channel();
        self.commands
            .send(SessionCommand::Request {
                namespace: namespace.to_owned(),
                method,
                payload,
                respond,
            })
            .await
            .map_err(|_| DeviceError::Closed)?;
        reply.await.map_err(|_| DeviceError::Closed)?
    }

    /// Registers the parse callback receiving every decoded payload for
    /// `namespace`.
    pub async fn register_parser(
        &self,
        namespace: &str,
        parser: ParseFn,
    ) -> Result<(), DeviceError> {
        self.commands
            .send(SessionCommand::RegisterParser {
                namespace: namespace.to_owned(),
                parser,
            })
            .await
            .map_err(|_| DeviceError::Closed)
    }

    /// Applies an updated configuration without tearing the session down.
    pub async fn configure(&self, config: DeviceConfig) -> Result<(), DeviceError> {
        self.commands
            .send(SessionCommand::Configure(config))
            .await
            .map_err(|_| DeviceError::Closed)
    }

    /// Feeds an out-of-band inbound message into the session, the way the
    /// MQTT connection delivers pushes.
    pub async fn deliver(&self, message: Message) -> Result<(), DeviceError> {
        self.commands
            .send(SessionCommand::Inbound(message))
            .await
            .map_err(|_| DeviceError::Closed)
    }

    pub async fn shutdown(&mut self) {
        let _ = self.commands.send(SessionCommand::Shutdown).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

struct DeviceSession {
    config: DeviceConfig,
    registry: Arc<NamespaceRegistry>,
    http: Option<HttpTransport>,
    mqtt: Option<MqttTransport>,
    state_tx: watch::Sender<SessionState>,
    state: SessionState,
    handlers: HashMap<String, NamespaceHandler>,
    /// Registration order; cycles iterate handlers in this order.
    handler_order: Vec<String>,
    scheduler: PollingScheduler,
    mux: Multiplexer,
    /// Namespaces missing from a partial batch reply, re-issued next flush.
    retry_queue: Vec<String>,
    capabilities: Vec<Box<dyn Capability>>,
    descriptor: Option<DeviceDescriptor>,
    polling_delay: Duration,
    /// Device clock minus ours, from reply timestamps.
    time_delta: i64,
    /// Transport failures since the last message that got through.
    consecutive_failures: u32,
    /// Last time the device demonstrably answered or pushed.
    last_activity: Instant,
    inbound_tx: mpsc::Sender<Message>,
    inbound_rx: mpsc::Receiver<Message>,
    commands_rx: mpsc::Receiver<SessionCommand>,
}

impl DeviceSession {
    async fn run(mut self) {
        if let Some(mqtt) = self.mqtt.clone() {
            if let Err(err) = mqtt
                .attach(&self.config.device_id, self.inbound_tx.clone())
                .await
            {
                warn!(error = %err, "mqtt attach failed");
            }
        }
        let mut next_cycle = tokio::time::Instant::now();
        loop {
            tokio::select! {
                command = self.commands_rx.recv() => match command {
                    None | Some(SessionCommand::Shutdown) => break,
                    Some(SessionCommand::Inbound(message)) => self.receive(message),
                    Some(SessionCommand::Configure(config)) => self.reconfigure(config),
                    Some(SessionCommand::RegisterParser { namespace, parser }) => {
                        self.handler_entry(&namespace).set_parser(parser);
                    }
                    Some(SessionCommand::Request { namespace, method, payload, respond }) => {
                        let result = self.send_request(&namespace, method, payload).await;
                        let _ = respond.send(result);
                    }
                },
                message = self.inbound_rx.recv() => {
                    if let Some(message) = message {
                        self.receive(message);
                    }
                }
                _ = tokio::time::sleep_until(next_cycle) => {
                    self.poll_cycle().await;
                    next_cycle = tokio::time::Instant::now() + self.polling_delay;
                }
            }
        }
        self.finish().await;
    }

    async fn finish(mut self) {
        if let Some(mqtt) = &self.mqtt {
            mqtt.detach(&self.config.device_id).await;
        }
        self.set_state(SessionState::Shutdown);
        info!(device = %self.config.device_id, "session closed");
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(device = %self.config.device_id, from = ?self.state, to = ?state, "state change");
            self.state = state;
            let _ = self.state_tx.send(state);
        }
    }

    fn is_online(&self) -> bool {
        matches!(
            self.state,
            SessionState::Online(_) | SessionState::Switching { .. }
        )
    }

    fn current_transport(&self) -> Option<TransportKind> {
        match self.state {
            SessionState::Online(kind) => Some(kind),
            SessionState::Switching { to, .. } => Some(to),
            _ => None,
        }
    }

    fn preferred_kind(&self) -> TransportKind {
        match self.config.transport {
            TransportPreference::Http => TransportKind::Http,
            TransportPreference::Mqtt => TransportKind::Mqtt,
            TransportPreference::Auto => {
                if self.http.is_some() {
                    TransportKind::Http
                } else {
                    TransportKind::Mqtt
                }
            }
        }
    }

    fn transport_present(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Http => self.http.is_some(),
            TransportKind::Mqtt => self.mqtt.is_some(),
        }
    }

    fn transport_healthy(&self, kind: TransportKind) -> bool {
        match kind {
            TransportKind::Http => self.http.is_some(),
            TransportKind::Mqtt => self.mqtt.as_ref().is_some_and(MqttTransport::is_connected),
        }
    }

    fn other(kind: TransportKind) -> TransportKind {
        match kind {
            TransportKind::Http => TransportKind::Mqtt,
            TransportKind::Mqtt => TransportKind::Http,
        }
    }

    /// The transport order identity probes walk: preferred first.
    fn probe_order(&self) -> Vec<TransportKind> {
        let preferred = self.preferred_kind();
        [preferred, Self::other(preferred)]
            .into_iter()
            .filter(|kind| self.transport_present(*kind))
            .collect()
    }

    fn alternate(&self, kind: TransportKind) -> Option<TransportKind> {
        let other = Self::other(kind);
        self.transport_healthy(other).then_some(other)
    }

    fn mqtt_push_active(&self) -> bool {
        matches!(self.current_transport(), Some(TransportKind::Mqtt))
            && self.mqtt.as_ref().is_some_and(MqttTransport::is_connected)
    }

    fn cloud_path(&self) -> bool {
        self.mqtt_push_active() && self.mqtt.as_ref().is_some_and(MqttTransport::is_cloud)
    }

    fn force_offline(&mut self) {
        self.retry_queue.clear();
        self.mux.drain();
        self.set_state(SessionState::Offline);
    }

    fn switch_transport(&mut self, to: TransportKind) {
        if let SessionState::Online(from) = self.state {
            info!(device = %self.config.device_id, %from, %to, "switching transport");
            self.set_state(SessionState::Switching { from, to });
            self.set_state(SessionState::Online(to));
        }
    }

    fn maybe_switch_to_preferred(&mut self) {
        if let SessionState::Online(current) = self.state {
            let preferred = self.preferred_kind();
            if preferred != current && self.transport_healthy(preferred) {
                self.switch_transport(preferred);
            }
        }
    }

    fn handler_entry(&mut self, name: &str) -> &mut NamespaceHandler {
        let namespace = device_namespace(&self.registry, self.descriptor.as_ref(), name);
        match self.handlers.entry(name.to_owned()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                debug!(namespace = name, "handler created");
                self.handler_order.push(name.to_owned());
                entry.insert(NamespaceHandler::new(namespace))
            }
        }
    }

    // ---- sending ---------------------------------------------------------

    async fn send_on(
        &mut self,
        kind: TransportKind,
        namespace: &str,
        method: Method,
        payload: Value,
    ) -> Result<Message, DeviceError> {
        match kind {
            TransportKind::Http => {
                let (message, body_size, recovered) = {
                    let http = self.http.as_ref().ok_or(TransportError::Unavailable)?;
                    let response = http.request_strict(namespace, method, payload).await?;
                    (response.message, response.body_size, response.recovered)
                };
                if recovered {
                    self.mux.shrink_truncated(body_size);
                } else {
                    self.mux.observe_response_size(body_size);
                }
                Ok(message)
            }
            TransportKind::Mqtt => {
                let mqtt = self.mqtt.clone().ok_or(TransportError::Unavailable)?;
                let key = self.config.key.clone().unwrap_or_default();
                let reply = mqtt
                    .request(&self.config.device_id, namespace, method, payload, &key)
                    .await?;
                Ok(message::check_strict(reply)?)
            }
        }
    }

    /// Sends a request and validates the reply before handing it out; the
    /// failure bookkeeping feeding the online/offline demotion lives here.
    async fn send_request(
        &mut self,
        namespace: &str,
        method: Method,
        payload: Value,
    ) -> Result<Message, DeviceError> {
        let result = self.send_with_fallback(namespace, method, payload).await;
        match &result {
            Ok(_) => {}
            Err(DeviceError::Transport(err)) if err.is_recoverable() => {
                self.note_failure();
                return result;
            }
            // the device answered, just not usefully
            Err(_) => {
                self.last_activity = Instant::now();
                return result;
            }
        }
        let message = result?;
        self.validate_inbound(&message)?;
        self.note_success();
        Ok(message)
    }

    fn note_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_activity = Instant::now();
    }

    fn note_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.is_online() && self.consecutive_failures >= MAX_SEND_FAILURES {
            warn!(
                device = %self.config.device_id,
                failures = self.consecutive_failures,
                "repeated transport failures, re-checking identity"
            );
            self.consecutive_failures = 0;
            self.set_state(SessionState::Probing);
        }
    }

    /// Sends on the current transport with fallback to the alternate when
    /// the failure is recoverable; a successful fallback becomes the new
    /// current transport.
    async fn send_with_fallback(
        &mut self,
        namespace: &str,
        method: Method,
        payload: Value,
    ) -> Result<Message, DeviceError> {
        let primary = match self.current_transport() {
            Some(kind) => kind,
            None => *self
                .probe_order()
                .first()
                .ok_or(TransportError::Unavailable)?,
        };
        match self.send_on(primary, namespace, method, payload.clone()).await {
            Ok(message) => Ok(message),
            Err(DeviceError::Transport(err)) if err.is_recoverable() => {
                let Some(alternate) = self.alternate(primary) else {
                    return Err(err.into());
                };
                info!(
                    device = %self.config.device_id,
                    from = %primary,
                    to = %alternate,
                    error = %err,
                    "transport failed, falling back"
                );
                let message = self.send_on(alternate, namespace, method, payload).await?;
                if self.current_transport() == Some(primary) {
                    self.switch_transport(alternate);
                }
                Ok(message)
            }
            Err(err) => Err(err),
        }
    }

    async fn send_single(&mut self, request: Request) {
        let namespace = request.namespace.name.clone();
        match self
            .send_request(&namespace, request.method, request.payload)
            .await
        {
            Ok(reply) => self.receive(reply),
            Err(err) => warn!(namespace = %namespace, error = %err, "request failed"),
        }
    }

    // ---- polling cycle ---------------------------------------------------

    async fn poll_cycle(&mut self) {
        if let Some(mqtt) = &self.mqtt {
            mqtt.sweep_transactions();
        }
        match self.state {
            SessionState::Shutdown => return,
            SessionState::Offline | SessionState::Probing => {
                self.probe().await;
                return;
            }
            SessionState::Online(_) | SessionState::Switching { .. } => {}
        }
        if Instant::now().duration_since(self.last_activity) >= HEARTBEAT_PERIOD {
            debug!(
                device = %self.config.device_id,
                "nothing heard within a heartbeat period, re-checking identity"
            );
            self.probe().await;
            return;
        }
        self.maybe_switch_to_preferred();
        self.scheduler.begin_cycle();
        let env = CycleEnv {
            mqtt_push_active: self.mqtt_push_active(),
            cloud_path: self.cloud_path(),
        };
        let now = Instant::now();

        // namespaces a partial batch reply left unanswered go first
        for name in std::mem::take(&mut self.retry_queue) {
            if !self.is_online() {
                break;
            }
            self.queue_poll(&name).await;
        }

        let order = self.handler_order.clone();
        for name in order {
            if !self.is_online() {
                // offline mid-cycle: stop iterating, still flush below
                break;
            }
            let decision = match self.handlers.get(&name) {
                Some(handler) => self.scheduler.decide(handler, now, &env),
                None => continue,
            };
            match decision {
                Decision::Poll => self.queue_poll(&name).await,
                Decision::Lazy => {
                    if let Some(handler) = self.handlers.get(&name) {
                        self.scheduler.enqueue_lazy(&name, handler.last_request);
                    }
                }
                Decision::Skip => {}
            }
        }

        // lazy handlers ride along while the batch has spare capacity
        while self.is_online() {
            let Some(name) = self.scheduler.pop_lazy() else { break };
            let estimate = match self.handlers.get(&name) {
                Some(handler) => handler.response_estimate(),
                None => continue,
            };
            if !self.mux.fits(estimate) && !self.mux.is_empty() {
                break;
            }
            self.queue_poll(&name).await;
        }

        self.flush().await;
    }

    async fn queue_poll(&mut self, name: &str) {
        let (request, estimate) = {
            let handler = self.handler_entry(name);
            (handler.polling_request(), handler.response_estimate())
        };
        if !self.mux.fits(estimate) {
            self.flush().await;
        }
        if !self.mux.try_push(request.clone(), estimate) {
            // bigger than any batch could carry: issue it alone
            self.send_single(request).await;
        }
        if let Some(handler) = self.handlers.get_mut(name) {
            handler.mark_requested(Instant::now());
        }
    }

    async fn flush(&mut self) {
        let requests = self.mux.drain();
        match requests.len() {
            0 => {}
            1 => {
                if let Some(request) = requests.into_iter().next() {
                    self.send_single(request).await;
                }
            }
            _ => self.flush_batch(requests).await,
        }
    }

    async fn flush_batch(&mut self, requests: Vec<Request>) {
        let key = self.config.key.clone().unwrap_or_default();
        let payload = multiplex::pack(&requests, &key, MANUFACTURER);
        match self
            .send_request(MULTIPLE_NAMESPACE, Method::Set, payload)
            .await
        {
            Ok(reply) => {
                let replies = multiplex::unpack(&reply.payload);
                if replies.is_empty() {
                    warn!(
                        count = requests.len(),
                        "batch returned nothing, shrinking budget and replaying singly"
                    );
                    self.mux.shrink_failed();
                    self.replay_singly(requests).await;
                    return;
                }
                let (dispatch, missing) = multiplex::reconcile(&requests, replies);
                for sub in dispatch {
                    self.receive(sub);
                }
                if !missing.is_empty() {
                    debug!(missing = missing.len(), "partial batch reply, re-queueing");
                    self.retry_queue.extend(missing);
                }
            }
            Err(DeviceError::Transport(TransportError::Truncated { size })) => {
                self.mux.shrink_truncated(size);
                self.retry_queue
                    .extend(requests.iter().map(|request| request.namespace.name.clone()));
            }
            Err(err) => {
                warn!(error = %err, "batch failed, shrinking budget and replaying singly");
                self.mux.shrink_failed();
                self.replay_singly(requests).await;
            }
        }
    }

    async fn replay_singly(&mut self, requests: Vec<Request>) {
        for request in requests {
            if !self.is_online() {
                break;
            }
            self.send_single(request).await;
        }
    }

    /// Identity probe: the first transport answering `Appliance.System.All`
    /// takes the device online.
    async fn probe(&mut self) {
        self.set_state(SessionState::Probing);
        for kind in self.probe_order() {
            debug!(device = %self.config.device_id, transport = %kind, "probing identity");
            match self
                .send_on(kind, IDENTITY_NAMESPACE, Method::Get, json!({ "all": {} }))
                .await
            {
                Ok(reply) => {
                    if !self.apply_descriptor(&reply.payload) {
                        if matches!(self.state, SessionState::Offline) {
                            // identity mismatch: do not keep probing
                            return;
                        }
                        continue;
                    }
                    self.note_success();
                    self.set_state(SessionState::Online(kind));
                    self.polling_delay =
                        Duration::from_secs(self.config.polling_period_secs.max(1));
                    info!(device = %self.config.device_id, transport = %kind, "device online");
                    match self
                        .send_on(kind, ABILITY_NAMESPACE, Method::Get, json!({ "ability": {} }))
                        .await
                    {
                        Ok(abilities) => self.apply_ability(&abilities.payload),
                        Err(err) => debug!(error = %err, "ability query failed"),
                    }
                    return;
                }
                Err(err) => debug!(transport = %kind, error = %err, "probe failed"),
            }
        }
        self.set_state(SessionState::Offline);
        self.polling_delay = (self.polling_delay * 2).min(HEARTBEAT_PERIOD);
        debug!(
            device = %self.config.device_id,
            delay_secs = self.polling_delay.as_secs(),
            "device unreachable, backing off"
        );
    }

    // ---- inbound ---------------------------------------------------------

    /// Identity and signature gate every inbound message passes before it is
    /// returned to a caller or dispatched.
    fn validate_inbound(&mut self, message: &Message) -> Result<(), DeviceError> {
        if let Some(received) = message.source_uuid() {
            if received != self.config.device_id {
                error!(
                    expected = %self.config.device_id,
                    received = %received,
                    "reply identity mismatch, discarding and going offline"
                );
                let received = received.to_owned();
                self.force_offline();
                return Err(ProtocolError::IdentityMismatch {
                    expected: self.config.device_id.clone(),
                    received,
                }
                .into());
            }
        }
        if let Some(key) = &self.config.key {
            if message.header.method != Method::Error && !message.verify(key) {
                warn!(
                    namespace = %message.header.namespace,
                    "dropping message with bad signature"
                );
                return Err(ProtocolError::Signature.into());
            }
        }
        Ok(())
    }

    /// Entry point for every reply and push: identity check, signature
    /// check, drift bookkeeping, dispatch.
    fn receive(&mut self, message: Message) {
        if self.validate_inbound(&message).is_err() {
            return;
        }
        self.note_success();
        self.time_delta = message.header.timestamp - Utc::now().timestamp();
        if self.time_delta.abs() > 30 {
            debug!(
                device = %self.config.device_id,
                drift_secs = self.time_delta,
                "device clock drift"
            );
        }
        self.dispatch_message(message);
    }

    fn dispatch_message(&mut self, message: Message) {
        if message.header.method == Method::Error {
            let code = message.error_code().unwrap_or_default();
            if code == ERROR_CODE_INVALID_KEY {
                warn!(device = %self.config.device_id, "device rejected our key");
            } else {
                warn!(
                    namespace = %message.header.namespace,
                    code,
                    "device reported error"
                );
            }
            return;
        }
        if message.header.namespace == MULTIPLE_NAMESPACE {
            // sub-replies carry their own headers and go through the same gate
            for sub in multiplex::unpack(&message.payload) {
                self.receive(sub);
            }
            return;
        }
        self.dispatch_payload(message);
    }

    fn dispatch_payload(&mut self, message: Message) {
        let namespace = message.header.namespace.clone();
        match namespace.as_str() {
            IDENTITY_NAMESPACE => {
                self.apply_descriptor(&message.payload);
            }
            ABILITY_NAMESPACE => {
                self.apply_ability(&message.payload);
            }
            _ => {
                self.registry
                    .register_observed(&namespace, message.header.method, &message.payload);
                self.handler_entry(&namespace).handle(&message.payload);
            }
        }
    }

    /// Parses a full state reply; returns false when it could not be used.
    fn apply_descriptor(&mut self, payload: &Value) -> bool {
        let descriptor = match DeviceDescriptor::parse(payload) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(error = %err, "unusable identity reply");
                return false;
            }
        };
        if descriptor.uuid != self.config.device_id {
            error!(
                expected = %self.config.device_id,
                received = %descriptor.uuid,
                "descriptor identity mismatch, going offline"
            );
            self.force_offline();
            return false;
        }
        if let Some(device_time) = descriptor.time {
            self.time_delta = device_time - Utc::now().timestamp();
        }
        for capability in &mut self.capabilities {
            capability.parse_digest(&descriptor.digest);
        }
        // keep a previously learned ability map across refreshes
        let ability = self
            .descriptor
            .take()
            .map(|old| old.ability)
            .unwrap_or_default();
        let mut descriptor = descriptor;
        descriptor.ability = ability;
        self.descriptor = Some(descriptor);
        true
    }

    fn apply_ability(&mut self, payload: &Value) {
        let (ability, uuid, mac) = match self.descriptor.as_mut() {
            Some(descriptor) => {
                descriptor.update_ability(payload);
                (
                    descriptor.ability.clone(),
                    descriptor.uuid.clone(),
                    descriptor.mac.clone(),
                )
            }
            None => return,
        };
        let batch_limit = match ability.get(MULTIPLE_NAMESPACE) {
            Some(params) => params
                .get("maxCmdNum")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_BATCH_LIMIT as u64) as usize,
            None => 1,
        };
        self.mux.set_max_commands(batch_limit);
        if ability.contains_key(ENCRYPTION_ABILITY) {
            if let (Some(key), Some(http)) = (self.config.key.clone(), self.http.as_mut()) {
                http.enable_encryption(&uuid, &key, &mac);
            }
        }
        for capability in &mut self.capabilities {
            capability.init(&ability);
        }
        self.seed_handlers(ability.keys().cloned().collect());
    }

    /// Creates handlers for the advertised namespaces worth polling; the
    /// rest appear lazily when their first push arrives.
    fn seed_handlers(&mut self, names: Vec<String>) {
        for name in names {
            if self.handlers.contains_key(&name) {
                continue;
            }
            let namespace = device_namespace(&self.registry, self.descriptor.as_ref(), &name);
            let handler = NamespaceHandler::new(namespace);
            if handler.policy != PollingPolicy::None {
                self.handler_order.push(name.clone());
                self.handlers.insert(name, handler);
            }
        }
    }

    fn reconfigure(&mut self, config: DeviceConfig) {
        info!(device = %config.device_id, "applying configuration update");
        if config.host != self.config.host || config.key != self.config.key {
            self.http = match &config.host {
                Some(host) => match HttpTransport::new(host, config.key.clone()) {
                    Ok(http) => Some(http),
                    Err(err) => {
                        warn!(error = %err, "http transport rebuild failed");
                        None
                    }
                },
                None => None,
            };
        }
        let period = Duration::from_secs(config.polling_period_secs.max(1));
        if self.is_online() {
            self.polling_delay = period;
        } else {
            // offline: keep whichever delay retries sooner
            self.polling_delay = self.polling_delay.min(period);
        }
        self.config = config;
        // transport preference is re-evaluated on the next cycle
    }
}

/// Namespace grammar as seen by this device: hubs get the override map.
fn device_namespace(
    registry: &NamespaceRegistry,
    descriptor: Option<&DeviceDescriptor>,
    name: &str,
) -> Arc<Namespace> {
    let is_hub = descriptor.is_some_and(|descriptor| descriptor.device_type.starts_with("msh"));
    if is_hub {
        registry.resolve_for_hub(name)
    } else {
        registry.resolve(name)
    }
}

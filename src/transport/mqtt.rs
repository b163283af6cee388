//! MQTT transport
//!
//! One connection per broker, shared by every device routed through it.
//! Requests are published on `/appliance/{uuid}/subscribe` and replies and
//! pushes arrive on `/appliance/{uuid}/publish`; correlation is by messageId
//! through a pending-transaction table. Incoming publishes are dispatched in
//! order: matching transaction first, then the session-management namespaces
//! the broker handshake uses, then the attached device's inbound queue.
//!
//! Every publish consults the connection's [`RateLimiter`]; a rejection fails
//! the call immediately and the caller decides whether to fall back to HTTP.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::message::{self, md5_hex, DeviceKey, Message};
use crate::protocol::{
    app_topic, device_request_topic, device_response_topic, uuid_from_topic, HostAddress, Method,
};

use super::ratelimit::RateLimiter;
use super::TransportError;

/// How long a single RPC waits for its correlated reply.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Hard ceiling after which an unanswered transaction is swept.
const TRANSACTION_TTL: Duration = Duration::from_secs(15);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Disconnected,
}

/// Credentials of an app session on a broker.
#[derive(Debug, Clone)]
pub struct MqttIdentity {
    pub user_id: String,
    pub app_id: String,
    pub key: String,
}

impl MqttIdentity {
    pub fn client_id(&self) -> String {
        format!("app:{}", self.app_id)
    }

    /// Broker password: `md5(userId + key)` hex.
    pub fn password(&self) -> String {
        md5_hex(&[&self.user_id, &self.key])
    }

    /// The `from` header topic identifying this session.
    pub fn from_topic(&self) -> String {
        app_topic(&self.user_id, &self.app_id)
    }
}

struct PendingTransaction {
    uuid: String,
    namespace: String,
    sender: oneshot::Sender<Message>,
    created: Instant,
}

struct MqttShared {
    client: AsyncClient,
    from_topic: String,
    /// Cloud brokers throttle accounts; local ones do not.
    cloud: bool,
    limiter: RateLimiter,
    transactions: Mutex<HashMap<String, PendingTransaction>>,
    devices: Mutex<HashMap<String, mpsc::Sender<Message>>>,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MqttShared {
    /// Routes one inbound publish: transaction match, session namespaces,
    /// then the attached device.
    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(_) => {
                warn!(topic, "dropping non-utf8 publish");
                return;
            }
        };
        let message = match Message::decode(text) {
            Ok(message) => message,
            Err(err) => {
                debug!(topic, error = %err, "dropping malformed publish");
                return;
            }
        };

        if let Some(transaction) = lock(&self.transactions).remove(&message.header.message_id) {
            debug!(
                namespace = %transaction.namespace,
                uuid = %transaction.uuid,
                "reply matched pending transaction"
            );
            let _ = transaction.sender.send(message);
            return;
        }

        match message.header.namespace.as_str() {
            "Appliance.System.Clock" => {
                self.handle_clock(&message, topic);
                return;
            }
            "Appliance.Control.Bind" => {
                info!(topic, "device bind announcement");
            }
            _ => {}
        }

        let uuid = message
            .source_uuid()
            .map(str::to_owned)
            .or_else(|| uuid_from_topic(topic).map(str::to_owned));
        if let Some(uuid) = uuid {
            if let Some(inbound) = lock(&self.devices).get(&uuid) {
                if inbound.try_send(message).is_err() {
                    warn!(uuid, "device inbound queue full, push dropped");
                }
                return;
            }
        }
        debug!(
            topic,
            namespace = %message.header.namespace,
            "unmatched publish dropped"
        );
    }

    /// Local-broker handshake: devices push their clock and expect the header
    /// and payload echoed back.
    fn handle_clock(&self, message: &Message, topic: &str) {
        let Some(uuid) = uuid_from_topic(topic) else {
            return;
        };
        let reply = message::build_push_reply(message.header.clone(), message.payload.clone());
        match reply.encode() {
            Ok(body) => {
                if let Err(err) = self.client.try_publish(
                    device_request_topic(uuid),
                    QoS::AtLeastOnce,
                    false,
                    body,
                ) {
                    warn!(uuid, error = %err, "clock echo failed");
                }
            }
            Err(err) => warn!(uuid, error = %err, "clock echo failed"),
        }
    }

    /// Drops pending transactions on connection loss so callers fail fast
    /// instead of waiting out their deadline.
    fn fail_transactions(&self) {
        let dropped = lock(&self.transactions).drain().count();
        if dropped > 0 {
            warn!(count = dropped, "cancelled pending transactions");
        }
    }

    async fn resubscribe(&self) {
        let topics: Vec<String> = lock(&self.devices)
            .keys()
            .map(|uuid| device_response_topic(uuid))
            .collect();
        for topic in topics {
            if let Err(err) = self.client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                warn!(topic, error = %err, "resubscribe failed");
            }
        }
    }
}

async fn run_event_loop(shared: Arc<MqttShared>, mut event_loop: EventLoop) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt broker session established");
                    let _ = shared.state_tx.send(ConnectionState::Connected);
                    shared.resubscribe().await;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    shared.dispatch(&publish.topic, &publish.payload);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "mqtt connection lost, backing off");
                    let _ = shared.state_tx.send(ConnectionState::Reconnecting);
                    shared.fail_transactions();
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
            }
        }
    }
    shared.fail_transactions();
    let _ = shared.state_tx.send(ConnectionState::Disconnected);
}

/// Cheap-to-clone handle to one broker connection.
#[derive(Clone)]
pub struct MqttTransport {
    shared: Arc<MqttShared>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl MqttTransport {
    /// Opens the broker connection and spawns its event loop task.
    pub fn connect(broker: &HostAddress, identity: &MqttIdentity, cloud: bool) -> Self {
        let mut options = MqttOptions::new(identity.client_id(), &broker.host, broker.port);
        options.set_credentials(&identity.user_id, identity.password());
        options.set_keep_alive(Duration::from_secs(30));
        let (client, event_loop) = AsyncClient::new(options, 100);
        let transport = Self::with_client(client, identity.from_topic(), cloud);
        info!(broker = %broker, "connecting mqtt transport");
        let task = tokio::spawn(run_event_loop(transport.shared.clone(), event_loop));
        *lock(&transport.shared.task) = Some(task);
        transport
    }

    pub(crate) fn with_client(client: AsyncClient, from_topic: String, cloud: bool) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(MqttShared {
            client,
            from_topic,
            cloud,
            limiter: RateLimiter::default(),
            transactions: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
            state_tx,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        });
        Self { shared, state_rx }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_cloud(&self) -> bool {
        self.shared.cloud
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.shared.limiter
    }

    /// Registers a device on this connection and subscribes its reply topic.
    pub async fn attach(
        &self,
        uuid: &str,
        inbound: mpsc::Sender<Message>,
    ) -> Result<(), TransportError> {
        lock(&self.shared.devices).insert(uuid.to_owned(), inbound);
        self.shared
            .client
            .subscribe(device_response_topic(uuid), QoS::AtLeastOnce)
            .await?;
        debug!(uuid, "device attached to mqtt connection");
        Ok(())
    }

    pub async fn detach(&self, uuid: &str) {
        lock(&self.shared.devices).remove(uuid);
        lock(&self.shared.transactions).retain(|_, tx| tx.uuid != uuid);
        let _ = self
            .shared
            .client
            .unsubscribe(device_response_topic(uuid))
            .await;
        debug!(uuid, "device detached from mqtt connection");
    }

    /// Publishes one request and awaits its correlated reply (for verbs that
    /// expect an acknowledgement).
    pub async fn request(
        &self,
        uuid: &str,
        namespace: &str,
        method: Method,
        payload: Value,
        key: &str,
    ) -> Result<Message, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Connection("broker not connected".into()));
        }
        self.shared.limiter.try_acquire(uuid)?;

        let message = message::build(
            namespace,
            method,
            payload,
            &DeviceKey::Shared(key.to_owned()),
            &self.shared.from_topic,
        );
        let body = message.encode()?;

        let waiter = if method.expects_ack() {
            let (sender, receiver) = oneshot::channel();
            lock(&self.shared.transactions).insert(
                message.header.message_id.clone(),
                PendingTransaction {
                    uuid: uuid.to_owned(),
                    namespace: namespace.to_owned(),
                    sender,
                    created: Instant::now(),
                },
            );
            Some((message.header.message_id.clone(), receiver))
        } else {
            None
        };

        let publish = self
            .shared
            .client
            .publish(device_request_topic(uuid), QoS::AtLeastOnce, false, body)
            .await;
        if let Err(err) = publish {
            if let Some((id, _)) = &waiter {
                lock(&self.shared.transactions).remove(id);
            }
            return Err(err.into());
        }

        let Some((id, receiver)) = waiter else {
            // fire-and-forget verbs have no correlated reply
            return Ok(message);
        };
        let deadline = RESPONSE_TIMEOUT + self.shared.limiter.safe_delay(uuid);
        match tokio::time::timeout(deadline, receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::Connection("transaction cancelled".into())),
            Err(_) => {
                lock(&self.shared.transactions).remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Drops transactions past their hard ceiling. Called from the session's
    /// polling cycle.
    pub fn sweep_transactions(&self) {
        let now = Instant::now();
        let mut transactions = lock(&self.shared.transactions);
        let before = transactions.len();
        transactions.retain(|_, tx| now.duration_since(tx.created) < TRANSACTION_TTL);
        let swept = before - transactions.len();
        if swept > 0 {
            warn!(count = swept, "swept stale mqtt transactions");
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.shared.state_tx.send(ConnectionState::Disconnecting);
        self.shared.cancel.cancel();
        let _ = self.shared.client.disconnect().await;
        let task = lock(&self.shared.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.shared.fail_transactions();
    }
}

//! Reliable request/acknowledge messaging between nodes.
//!
//! Every command goes into the node's [`MessageGroup`] before it reaches the
//! transport, so a crash or a lost packet never loses it: the housekeeping
//! tick resends whatever is still unacknowledged once it is older than
//! [`MessagingConfig::resend_age`], and drops it after
//! [`MessagingConfig::max_resends`] attempts.
//!
//! # Invariants
//!
//! - A message is persisted before it is handed to the transport.
//! - An ACK removes its message from the log before any continuation runs.
//! - ACKs themselves are never persisted or acknowledged.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use rand::seq::IndexedRandom;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::context::NodeContext;
use crate::cache::system_cache::CacheError;
use crate::config::MessagingConfig;
use crate::messaging::callbacks::CallbackRegistry;
use crate::messaging::envelope::{Message, PING_NODE};
use crate::messaging::transport::{Transport, TransportError, check_scheme};
use crate::replication::group::GroupError;
use crate::replication::message_group::MessageGroup;
use crate::time::TimeSource;

/// Handles one named command.
pub type Handler = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), MessagingError>> + Send + Sync>;

/// The node's messaging endpoint.
///
/// # Invariants
///
/// - Every command sent through the layer is in the message log until its
///   ACK arrives or housekeeping drops it after `max_resends` resends
/// - ACKs are never logged
/// - `rpc_callbacks` only holds request ids that are still in the log
/// - At most one handler is registered per command name
pub struct MessagingLayer {
    transport: Arc<dyn Transport>,
    message_group: Arc<MessageGroup>,
    handlers: RwLock<HashMap<String, Handler>>,
    callbacks: CallbackRegistry,
    rpc_callbacks: Mutex<HashMap<Uuid, oneshot::Sender<Message>>>,
    config: MessagingConfig,
    time: Arc<dyn TimeSource>,
}

impl fmt::Debug for MessagingLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagingLayer")
            .field("address", &self.transport.address())
            .field("message_group", &self.message_group)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

impl MessagingLayer {
    /// Wire `transport` and `message_group` together.
    ///
    /// Registers the transport's receive callback, the group's housekeeping
    /// callback and the built-in `PING_NODE` handler. All three hold only a
    /// weak reference, so dropping the returned `Arc` stops them.
    pub fn new(
        transport: Arc<dyn Transport>,
        message_group: Arc<MessageGroup>,
        config: MessagingConfig,
        time: Arc<dyn TimeSource>,
    ) -> Result<Arc<Self>, MessagingError> {
        let layer = Arc::new(Self {
            transport,
            message_group,
            handlers: RwLock::new(HashMap::new()),
            callbacks: CallbackRegistry::new(),
            rpc_callbacks: Mutex::new(HashMap::new()),
            config,
            time,
        });

        let weak = Arc::downgrade(&layer);
        layer.transport.register_callback(Arc::new(move |message: Message| {
            let Some(layer) = weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                let name = message.message_name.clone();
                if let Err(e) = layer.dispatch(message).await {
                    tracing::warn!(%name, "failed to handle message: {e}");
                }
            });
        }))?;

        let weak = Arc::downgrade(&layer);
        layer.message_group.set_house_keeping_callback(Arc::new(move || {
            let weak = Weak::clone(&weak);
            async move {
                if let Some(layer) = weak.upgrade()
                    && let Err(e) = layer.house_keeping().await
                {
                    tracing::warn!("message housekeeping failed: {e}");
                }
            }
            .boxed()
        }))?;

        let weak = Arc::downgrade(&layer);
        layer.listen_for(PING_NODE, move |message| {
            let weak = Weak::clone(&weak);
            async move {
                let layer = weak.upgrade().ok_or(MessagingError::Closed)?;
                layer.reply(&message, json!({})).await
            }
        })?;

        Ok(layer)
    }

    /// The local address, as put in `source` of outbound messages.
    #[must_use]
    pub fn address(&self) -> &str {
        self.transport.address()
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    #[must_use]
    pub fn message_group(&self) -> &Arc<MessageGroup> {
        &self.message_group
    }

    /// Named continuations for [`send_message_to_node`](Self::send_message_to_node).
    #[must_use]
    pub const fn callbacks(&self) -> &CallbackRegistry {
        &self.callbacks
    }

    #[must_use]
    pub const fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// A fresh command from this node.
    #[must_use]
    pub fn create_command(&self, name: &str, data: Value) -> Message {
        Message::command(name, data, self.address())
    }

    /// The ACK answering `message`.
    #[must_use]
    pub fn create_ack_for(&self, message: &Message, result: Value) -> Message {
        message.ack(result, self.address())
    }

    /// Route commands named `name` to `handler`, replacing any earlier one.
    pub fn listen_for<F, Fut>(&self, name: &str, handler: F) -> Result<(), MessagingError>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MessagingError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |message: Message| handler(message).boxed());
        self.handlers
            .write()
            .map_err(|_| MessagingError::LockPoisoned)?
            .insert(name.to_owned(), handler);
        Ok(())
    }

    /// Persist `message` and send it to `destination`.
    ///
    /// `callback`, if given, names a continuation in
    /// [`callbacks`](Self::callbacks) that runs with `context` when the ACK
    /// arrives. A failed transmission is not an error: the message stays in
    /// the log and housekeeping resends it.
    ///
    /// # Pre-conditions
    ///
    /// - `message.request_id` is not already in the log
    ///
    /// # Post-conditions
    ///
    /// - On `Ok`, the message is logged with zero resends and one
    ///   transmission has been attempted
    /// - On `Err`, nothing was logged or sent
    ///
    /// # Errors
    ///
    /// Fails if no transport handles `destination`, if `callback` is not
    /// registered, or if the message cannot be persisted.
    pub async fn send_message_to_node(
        &self,
        message: Message,
        destination: &str,
        context: Value,
        callback: Option<&str>,
    ) -> Result<(), MessagingError> {
        check_scheme(self.transport.as_ref(), destination)?;
        if let Some(name) = callback
            && !self.callbacks.contains(name)
        {
            return Err(MessagingError::UnknownCallback(name.to_owned()));
        }

        self.message_group
            .save_message(&message, destination, &context, callback)
            .await?;

        if let Err(e) = self.transport.transport_message(&message, destination).await {
            tracing::debug!(
                destination,
                name = %message.message_name,
                "send failed, leaving for resend: {e}"
            );
        }
        Ok(())
    }

    /// Send `message` and wait for its ACK.
    ///
    /// The message is persisted like any other, so it is resent while the
    /// caller waits.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::RpcTimeout`] if no ACK arrives within
    /// [`MessagingConfig::rpc_timeout`], and [`MessagingError::RpcCancelled`]
    /// if the message is dropped or the layer closes first.
    pub async fn send_rpc(
        &self,
        message: Message,
        destination: &str,
        context: Value,
        callback: Option<&str>,
    ) -> Result<Message, MessagingError> {
        let request_id = message.request_id;
        let (tx, rx) = oneshot::channel();
        self.rpc_callbacks
            .lock()
            .map_err(|_| MessagingError::LockPoisoned)?
            .insert(request_id, tx);

        if let Err(e) = self
            .send_message_to_node(message, destination, context, callback)
            .await
        {
            self.forget_rpc(request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.rpc_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(MessagingError::RpcCancelled),
            Err(_) => {
                self.forget_rpc(request_id);
                Err(MessagingError::RpcTimeout(destination.to_owned()))
            }
        }
    }

    fn forget_rpc(&self, request_id: Uuid) {
        if let Ok(mut pending) = self.rpc_callbacks.lock() {
            pending.remove(&request_id);
        }
    }

    /// Send `message` to one member of raft group `group_id`, chosen at
    /// random, resolving addresses through `context`.
    pub async fn send_message_to_raft_group(
        &self,
        context: &NodeContext,
        message: Message,
        callback_context: Value,
        callback: Option<&str>,
        group_id: &str,
    ) -> Result<(), MessagingError> {
        let group = context
            .raft_groups()
            .get_raft_group_by_id(group_id)
            .await?
            .ok_or_else(|| MessagingError::UnknownGroup(group_id.to_owned()))?;

        let member = group
            .member_ids()
            .choose(&mut rand::rng())
            .cloned()
            .ok_or_else(|| MessagingError::NoGroupMembers(group_id.to_owned()))?;
        let node = context
            .nodes()
            .get_node_by_id(&member)
            .await?
            .ok_or_else(|| MessagingError::UnknownNode(member.clone()))?;

        self.send_message_to_node(message, &node.external_address, callback_context, callback)
            .await
    }

    /// Send a fresh `name` command carrying `data` to every destination.
    pub async fn broadcast(&self, name: &str, data: &Value, destinations: &[String]) -> Result<(), MessagingError> {
        for destination in destinations {
            let message = self.create_command(name, data.clone());
            self.send_message_to_node(message, destination, Value::Null, None)
                .await?;
        }
        Ok(())
    }

    /// Acknowledge `message` with `result`. ACKs bypass the message log.
    pub async fn reply(&self, message: &Message, result: Value) -> Result<(), MessagingError> {
        let ack = self.create_ack_for(message, result);
        self.transport.transport_message(&ack, &message.source).await?;
        Ok(())
    }

    /// Round-trip time of a `PING_NODE` to `address`.
    pub async fn ping_node(&self, address: &str) -> Result<Duration, MessagingError> {
        let started = Instant::now();
        self.send_rpc(self.create_command(PING_NODE, json!({})), address, Value::Null, None)
            .await?;
        Ok(started.elapsed())
    }

    /// Route one incoming message.
    ///
    /// # Errors
    ///
    /// Returns [`MessagingError::NoHandler`] for a command nobody listens
    /// for, or whatever its handler returns.
    pub async fn dispatch(&self, message: Message) -> Result<(), MessagingError> {
        if message.is_ack() {
            return self.receive_ack(message).await;
        }

        let handler = self
            .handlers
            .read()
            .map_err(|_| MessagingError::LockPoisoned)?
            .get(&message.message_name)
            .cloned()
            .ok_or_else(|| MessagingError::NoHandler(message.message_name.clone()))?;
        handler(message).await
    }

    /// Remove the acknowledged message, then resume whoever waits for it:
    /// a pending [`send_rpc`](Self::send_rpc) first, otherwise the stored
    /// named callback. Duplicate ACKs only hit the log.
    pub async fn receive_ack(&self, ack: Message) -> Result<(), MessagingError> {
        let original = ack
            .original_request_id
            .ok_or(MessagingError::MissingOriginalRequest)?;
        let message_id = original.to_string();

        let persisted = self
            .message_group
            .find_message_by_message_id(&message_id)
            .await?;
        let removed = self
            .message_group
            .remove_message_by_message_id(&message_id)
            .await?;

        let waiting = self
            .rpc_callbacks
            .lock()
            .map_err(|_| MessagingError::LockPoisoned)?
            .remove(&original);
        if let Some(waiting) = waiting {
            // The caller may have timed out in the meantime.
            let _ = waiting.send(ack);
            return Ok(());
        }

        if !removed {
            tracing::debug!(%message_id, "duplicate ack");
            return Ok(());
        }

        if let Some(persisted) = persisted
            && let Some(callback) = persisted.callback.as_deref()
        {
            let context = persisted.context_value()?;
            self.callbacks.invoke(callback, context, ack).await?;
        }
        Ok(())
    }

    /// Drop exhausted messages and resend aged ones.
    ///
    /// Runs on every tick of the message group while this node leads it.
    ///
    /// # Post-conditions
    ///
    /// - No logged message has more than `max_resends` resends
    /// - Every message older than `resend_age` was retransmitted once and
    ///   its resend count incremented
    /// - Rows whose payload cannot be decoded are removed
    pub async fn house_keeping(&self) -> Result<(), MessagingError> {
        for message in self.message_group.get_exhausted_messages().await? {
            tracing::warn!(
                message_id = %message.message_id,
                name = %message.message_name,
                destination = %message.destination,
                resends = message.resends,
                "dropping unacknowledged message"
            );
            self.message_group
                .remove_message_by_message_id(&message.message_id)
                .await?;
            if let Ok(id) = Uuid::parse_str(&message.message_id) {
                self.forget_rpc(id);
            }
        }

        let now = self.time.now_ms();
        let resend_age = u64::try_from(self.config.resend_age.as_millis()).unwrap_or(u64::MAX);
        for message in self.message_group.get_unacknowledged_messages().await? {
            if now.saturating_sub(message.creation_time) < resend_age {
                continue;
            }
            let envelope = match message.envelope() {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(message_id = %message.message_id, "removing unreadable message: {e}");
                    self.message_group
                        .remove_message_by_message_id(&message.message_id)
                        .await?;
                    continue;
                }
            };
            tracing::debug!(
                message_id = %message.message_id,
                destination = %message.destination,
                resends = message.resends,
                "resending message"
            );
            if let Err(e) = self
                .transport
                .transport_message(&envelope, &message.destination)
                .await
            {
                tracing::debug!(destination = %message.destination, "resend failed: {e}");
            }
            self.message_group
                .increment_resends_for_message(&message.message_id)
                .await?;
        }
        Ok(())
    }

    /// Fail pending RPCs, then close the transport and the message group.
    pub async fn close(&self) -> Result<(), MessagingError> {
        self.rpc_callbacks
            .lock()
            .map_err(|_| MessagingError::LockPoisoned)?
            .clear();
        self.transport.close().await?;
        self.message_group.close().await?;
        Ok(())
    }
}

/// Errors returned by the messaging layer.
#[derive(Debug)]
pub enum MessagingError {
    /// No handler is registered for the command.
    NoHandler(String),
    /// No callback is registered under the name.
    UnknownCallback(String),
    /// An ACK without `originalRequestId`.
    MissingOriginalRequest,
    /// No reply arrived from the destination in time.
    RpcTimeout(String),
    /// The RPC's message was dropped or the layer closed.
    RpcCancelled,
    /// The raft group is not in the cache.
    UnknownGroup(String),
    /// The node is not in the cache.
    UnknownNode(String),
    /// The raft group has no members.
    NoGroupMembers(String),
    /// A peer answered with an error.
    Remote(String),
    /// The layer was dropped.
    Closed,
    Transport(TransportError),
    Group(GroupError),
    Cache(Box<CacheError>),
    Codec(serde_json::Error),
    /// An internal lock was poisoned.
    LockPoisoned,
}

impl fmt::Display for MessagingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoHandler(name) => write!(f, "no handler for message: {name}"),
            Self::UnknownCallback(name) => write!(f, "no callback named: {name}"),
            Self::MissingOriginalRequest => write!(f, "ack without originalRequestId"),
            Self::RpcTimeout(destination) => write!(f, "no reply from {destination}"),
            Self::RpcCancelled => write!(f, "request cancelled before a reply arrived"),
            Self::UnknownGroup(id) => write!(f, "unknown raft group: {id}"),
            Self::UnknownNode(id) => write!(f, "unknown node: {id}"),
            Self::NoGroupMembers(id) => write!(f, "raft group has no members: {id}"),
            Self::Remote(message) => write!(f, "remote error: {message}"),
            Self::Closed => write!(f, "messaging layer closed"),
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Group(e) => write!(f, "message group error: {e}"),
            Self::Cache(e) => write!(f, "cache error: {e}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::LockPoisoned => write!(f, "messaging lock poisoned"),
        }
    }
}

impl std::error::Error for MessagingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::Group(e) => Some(e),
            Self::Cache(e) => Some(e.as_ref()),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for MessagingError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<GroupError> for MessagingError {
    fn from(e: GroupError) -> Self {
        Self::Group(e)
    }
}

impl From<CacheError> for MessagingError {
    fn from(e: CacheError) -> Self {
        Self::Cache(Box::new(e))
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::transport::MemoryNetwork;
    use crate::replication::executor::{Query, ReplicatedExecutor};
    use crate::replication::group::ReplicatedGroup;
    use crate::replication::sqlite::SqliteExecutor;
    use crate::time::ManualTimeSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Peer {
        layer: Arc<MessagingLayer>,
        time: Arc<ManualTimeSource>,
    }

    async fn peer(network: &Arc<MemoryNetwork>, name: &str) -> Peer {
        let transport = network.transport(name);
        let executor = Arc::new(SqliteExecutor::open_in_memory().expect("open")) as Arc<dyn ReplicatedExecutor>;
        let group = ReplicatedGroup::new(format!("messages-{name}"), [transport.address().to_owned()], executor)
            .expect("group");
        let config = MessagingConfig {
            housekeeping_interval: Duration::from_secs(3600),
            rpc_timeout: Duration::from_millis(500),
            ..MessagingConfig::default()
        };
        let time = Arc::new(ManualTimeSource::new(10_000));
        let message_group = MessageGroup::open(group, &config, Arc::clone(&time) as Arc<dyn TimeSource>)
            .await
            .expect("message group");
        let layer = MessagingLayer::new(transport, message_group, config, Arc::clone(&time) as Arc<dyn TimeSource>)
            .expect("layer");
        Peer { layer, time }
    }

    async fn pending(layer: &MessagingLayer) -> usize {
        layer
            .message_group()
            .get_unacknowledged_messages()
            .await
            .expect("scan")
            .len()
    }

    #[tokio::test]
    async fn test_ping_round_trip_clears_log() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a").await;
        let _b = peer(&network, "b").await;

        a.layer.ping_node("mem://b").await.expect("ping");
        assert_eq!(pending(&a.layer).await, 0);
    }

    #[tokio::test]
    async fn test_rpc_returns_handler_reply() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a").await;
        let b = peer(&network, "b").await;
        let weak = Arc::downgrade(&b.layer);
        b.layer
            .listen_for("DOUBLE", move |message| {
                let weak = Weak::clone(&weak);
                async move {
                    let layer = weak.upgrade().ok_or(MessagingError::Closed)?;
                    let n = message.data["n"].as_i64().unwrap_or_default();
                    layer.reply(&message, json!({"n": n * 2})).await
                }
            })
            .expect("listen");

        let ack = a
            .layer
            .send_rpc(a.layer.create_command("DOUBLE", json!({"n": 21})), "mem://b", Value::Null, None)
            .await
            .expect("rpc");
        assert_eq!(ack.data, json!({"n": 42}));
        assert_eq!(ack.source, "mem://b");
    }

    #[tokio::test]
    async fn test_unhandled_command_is_reported() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a").await;
        let message = a.layer.create_command("NOBODY_LISTENS", json!({}));
        assert!(matches!(
            a.layer.dispatch(message).await,
            Err(MessagingError::NoHandler(name)) if name == "NOBODY_LISTENS"
        ));
    }

    #[tokio::test]
    async fn test_named_callback_runs_with_context() {
        #[derive(serde::Deserialize)]
        struct Tag {
            tag: String,
        }

        let network = MemoryNetwork::new();
        let a = peer(&network, "a").await;
        let b = peer(&network, "b").await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        a.layer
            .callbacks()
            .register("remember", move |context: Tag, ack: Message| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().expect("lock").push((context.tag, ack.source));
                    Ok(())
                }
            })
            .expect("register");

        network.set_blocked("mem://b", true).expect("block");
        let message = a.layer.create_command(PING_NODE, json!({}));
        a.layer
            .send_message_to_node(message.clone(), "mem://b", json!({"tag": "x"}), Some("remember"))
            .await
            .expect("send");

        // Deliver the ACK by hand, twice.
        let ack = b.layer.create_ack_for(&message, json!({}));
        a.layer.receive_ack(ack.clone()).await.expect("ack");
        a.layer.receive_ack(ack).await.expect("duplicate ack");

        assert_eq!(
            seen.lock().expect("lock").as_slice(),
            &[("x".to_owned(), "mem://b".to_owned())]
        );
        assert_eq!(pending(&a.layer).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_callback_is_refused_before_persisting() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a").await;
        let message = a.layer.create_command(PING_NODE, json!({}));
        assert!(matches!(
            a.layer
                .send_message_to_node(message, "mem://b", Value::Null, Some("missing"))
                .await,
            Err(MessagingError::UnknownCallback(_))
        ));
        assert_eq!(pending(&a.layer).await, 0);
    }

    #[tokio::test]
    async fn test_resend_until_exhausted_then_drop() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a").await;
        let b = peer(&network, "b").await;
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        b.layer
            .listen_for("COUNT", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .expect("listen");

        // Delivered but never acknowledged.
        let message = a.layer.create_command("COUNT", json!({}));
        a.layer
            .send_message_to_node(message, "mem://b", Value::Null, None)
            .await
            .expect("send");

        // Too young to resend.
        a.layer.house_keeping().await.expect("tick");
        let max = a.layer.message_group().max_resends();
        let transmissions = 1 + usize::try_from(max).expect("fits");
        for _ in 0..max {
            a.time.advance(2_000);
            a.layer.house_keeping().await.expect("tick");
        }
        assert_eq!(pending(&a.layer).await, 0);
        assert_eq!(
            a.layer
                .message_group()
                .get_exhausted_messages()
                .await
                .expect("scan")
                .len(),
            1
        );

        a.layer.house_keeping().await.expect("tick");
        assert!(
            a.layer
                .message_group()
                .get_exhausted_messages()
                .await
                .expect("scan")
                .is_empty()
        );

        tokio::time::timeout(Duration::from_secs(5), async {
            while received.load(Ordering::SeqCst) < transmissions {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("every transmission delivered");
    }

    #[tokio::test]
    async fn test_unreadable_row_is_removed_without_stalling_resends() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a").await;
        let b = peer(&network, "b").await;
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        b.layer
            .listen_for("COUNT", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .expect("listen");

        a.layer
            .message_group()
            .group()
            .execute(&Query::with_params(
                "INSERT INTO messages (messageId, messageName, context, callback, creationTime, \
                 resends, destination, payload) VALUES (?, ?, '{}', NULL, 0, 0, ?, ?)",
                vec![json!("garbled"), json!("COUNT"), json!("mem://b"), json!("{not json")],
            ))
            .await
            .expect("insert");
        let message = a.layer.create_command("COUNT", json!({}));
        let message_id = message.request_id.to_string();
        a.layer
            .send_message_to_node(message, "mem://b", Value::Null, None)
            .await
            .expect("send");

        a.time.advance(2_000);
        a.layer.house_keeping().await.expect("tick");

        let group = a.layer.message_group();
        assert_eq!(group.find_message_by_message_id("garbled").await.expect("find"), None);
        let resent = group
            .find_message_by_message_id(&message_id)
            .await
            .expect("find")
            .expect("still logged");
        assert_eq!(resent.resends, 1);
        tokio::time::timeout(Duration::from_secs(5), async {
            while received.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("original and resend delivered");
    }

    #[tokio::test]
    async fn test_rpc_to_silent_peer_times_out() {
        let network = MemoryNetwork::new();
        let a = peer(&network, "a").await;
        let _b = peer(&network, "b").await;
        network.set_blocked("mem://b", true).expect("block");

        assert!(matches!(
            a.layer.ping_node("mem://b").await,
            Err(MessagingError::RpcTimeout(destination)) if destination == "mem://b"
        ));
        // Still logged for resend.
        assert_eq!(pending(&a.layer).await, 1);
    }
}

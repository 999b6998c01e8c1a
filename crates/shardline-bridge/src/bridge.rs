//! Shard Coordination Bridge.
//!
//! Broadcasts events to sibling shards and fans requests out to every shard,
//! collecting the answers under a per-request timeout.
//!
//! # Lifecycle
//!
//! [`ShardBridge::start`] subscribes to the three channels and spawns the
//! listener. With one shard, no transport, or a transport that cannot
//! subscribe, the bridge runs local-only for the rest of the process: a
//! fan-out request is answered by the local handler alone and broadcasts go
//! nowhere.
//!
//! # Fan-out
//!
//! A request is published with a fresh request id and a pending entry
//! expecting `total_shards` answers. Every shard, the requester included,
//! runs its handler for the request type and publishes a response. The
//! requester returns as soon as all answers are in, or at the timeout with
//! whatever arrived. Missing shards are unknown, never zero.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt as _;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::BridgeError;
use crate::message::{Channel, ChannelNames, DEFAULT_CHANNEL_PREFIX, ShardMessage};
use crate::transport::{Envelope, MessageStream, PubSubTransport};

/// Default wait for fan-out responses.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Buffered local events per subscriber.
const EVENT_CAPACITY: usize = 256;

/// Bridge settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// This shard.
    pub shard_id: u32,
    /// Shards in the deployment.
    pub total_shards: u32,
    /// Channel name prefix.
    pub channel_prefix: String,
    /// Wait for fan-out responses.
    pub request_timeout: Duration,
}

impl BridgeConfig {
    /// Settings for `shard_id` of `total_shards` with default prefix and
    /// timeout.
    pub fn new(shard_id: u32, total_shards: u32) -> Self {
        Self {
            shard_id,
            total_shards,
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_owned(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Set the channel prefix.
    #[must_use]
    pub fn with_channel_prefix(mut self, prefix: &str) -> Self {
        prefix.clone_into(&mut self.channel_prefix);
        self
    }

    /// Set the fan-out timeout.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// One shard's answer to a fan-out request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardResponse {
    /// Answering shard.
    pub shard_id: u32,
    /// Handler result (`null` on failure).
    pub data: Value,
    /// Handler failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ShardResponse {
    /// Whether the handler succeeded.
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    fn from_result(shard_id: u32, result: Result<Value, BridgeError>) -> Self {
        match result {
            Ok(data) => Self {
                shard_id,
                data,
                error: None,
            },
            Err(e) => Self {
                shard_id,
                data: Value::Null,
                error: Some(e.to_string()),
            },
        }
    }
}

impl From<ShardMessage> for ShardResponse {
    fn from(message: ShardMessage) -> Self {
        Self {
            shard_id: message.shard_id,
            data: message.data,
            error: message.error,
        }
    }
}

/// A broadcast received from another shard, re-emitted locally.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeEvent {
    /// Local event name, `broadcast:<type>`.
    pub name: String,
    /// Broadcast type.
    pub kind: String,
    /// Sending shard.
    pub shard_id: u32,
    /// Payload.
    pub data: Value,
}

/// Answers one request type on this shard.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produce this shard's answer for `data`.
    async fn handle(&self, data: Value) -> Result<Value, BridgeError>;
}

#[async_trait]
impl<F, Fut> RequestHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BridgeError>> + Send,
{
    async fn handle(&self, data: Value) -> Result<Value, BridgeError> {
        (self)(data).await
    }
}

struct PendingRequest {
    responses: Vec<ShardResponse>,
    expected: usize,
    done: Option<oneshot::Sender<()>>,
}

/// Cross-shard broadcast and request/response.
pub struct ShardBridge {
    config: BridgeConfig,
    channels: ChannelNames,
    transport: Option<Arc<dyn PubSubTransport>>,
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
    events: broadcast::Sender<BridgeEvent>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ShardBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardBridge")
            .field("shard_id", &self.config.shard_id)
            .field("total_shards", &self.config.total_shards)
            .field("transport", &self.transport.as_ref().map(|t| t.name()))
            .finish_non_exhaustive()
    }
}

impl ShardBridge {
    fn build(config: BridgeConfig, transport: Option<Arc<dyn PubSubTransport>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            channels: ChannelNames::new(&config.channel_prefix),
            config,
            transport,
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            events,
            listener: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// A bridge that never touches a transport.
    pub fn local_only(config: BridgeConfig) -> Self {
        Self::build(config, None)
    }

    /// Subscribe and start listening.
    ///
    /// Falls back to local-only mode, permanently, when there is a single
    /// shard, no transport, or the subscription fails.
    pub async fn start(
        config: BridgeConfig,
        transport: Option<Arc<dyn PubSubTransport>>,
    ) -> Arc<Self> {
        if config.total_shards <= 1 {
            info!(shard_id = config.shard_id, "single shard, bridge is local-only");
            return Arc::new(Self::local_only(config));
        }
        let Some(transport) = transport else {
            warn!(shard_id = config.shard_id, "no pub/sub transport configured, bridge is local-only");
            return Arc::new(Self::local_only(config));
        };

        let channels = ChannelNames::new(&config.channel_prefix);
        match transport.subscribe(&channels.all()).await {
            Ok(stream) => {
                let bridge = Arc::new(Self::build(config, Some(Arc::clone(&transport))));
                let handle = Self::spawn_listener(&bridge, stream);
                *bridge.listener_slot() = Some(handle);
                info!(
                    shard_id = bridge.config.shard_id,
                    total_shards = bridge.config.total_shards,
                    transport = transport.name(),
                    "shard bridge started"
                );
                bridge
            }
            Err(e) => {
                warn!(
                    error = %e,
                    transport = transport.name(),
                    "pub/sub unavailable, bridge is local-only for this process"
                );
                Arc::new(Self::local_only(config))
            }
        }
    }

    /// This shard's id.
    pub const fn shard_id(&self) -> u32 {
        self.config.shard_id
    }

    /// Shards in the deployment.
    pub const fn total_shards(&self) -> u32 {
        self.config.total_shards
    }

    /// Whether fan-out is answered locally only.
    pub const fn is_local_only(&self) -> bool {
        self.transport.is_none()
    }

    /// Register the handler for request type `kind`, replacing any previous one.
    pub fn register_handler<H: RequestHandler + 'static>(&self, kind: &str, handler: H) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.to_owned(), Arc::new(handler));
        debug!(kind, "registered shard request handler");
    }

    /// Receive `broadcast:<type>` events from other shards.
    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Publish an event to every other shard. No acknowledgment.
    pub async fn broadcast(&self, kind: &str, data: Value) -> Result<(), BridgeError> {
        self.ensure_open()?;
        let Some(transport) = &self.transport else {
            debug!(kind, "local-only bridge, broadcast dropped");
            return Ok(());
        };
        let raw = ShardMessage::broadcast(kind, self.config.shard_id, data).encode()?;
        transport.publish(&self.channels.name(Channel::Broadcast), raw).await
    }

    /// Ask every shard for its answer to `kind` and collect the responses.
    ///
    /// Resolves when all shards have answered or the request timeout passes,
    /// whichever is first. Responses are ordered by shard id. Only a failure
    /// to publish the request is an error.
    pub async fn request_all(&self, kind: &str, data: Value) -> Result<Vec<ShardResponse>, BridgeError> {
        self.ensure_open()?;
        let Some(transport) = &self.transport else {
            let result = self.handle_locally(kind, data).await;
            return Ok(vec![ShardResponse::from_result(self.config.shard_id, result)]);
        };

        let request_id = Uuid::new_v4();
        let expected = usize::try_from(self.config.total_shards).unwrap_or(usize::MAX);
        let (done, finished) = oneshot::channel();
        self.pending_requests().insert(
            request_id,
            PendingRequest {
                responses: Vec::new(),
                expected,
                done: Some(done),
            },
        );

        let message = ShardMessage::request(kind, self.config.shard_id, request_id, data);
        let published = match message.encode() {
            Ok(raw) => transport.publish(&self.channels.name(Channel::Request), raw).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            self.pending_requests().remove(&request_id);
            return Err(e);
        }

        let completed = tokio::time::timeout(self.config.request_timeout, finished)
            .await
            .is_ok();
        let mut responses = self
            .pending_requests()
            .remove(&request_id)
            .map(|pending| pending.responses)
            .unwrap_or_default();
        responses.sort_by_key(|r| r.shard_id);

        if completed {
            debug!(kind, %request_id, received = responses.len(), "fan-out request complete");
        } else {
            warn!(
                kind,
                %request_id,
                received = responses.len(),
                expected,
                "fan-out request timed out, returning partial responses"
            );
        }
        Ok(responses)
    }

    /// Run the local handler for `kind`.
    pub(crate) async fn handle_locally(&self, kind: &str, data: Value) -> Result<Value, BridgeError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned();
        let Some(handler) = handler else {
            return Err(BridgeError::Handler {
                kind: kind.to_owned(),
                message: "no handler registered".to_owned(),
            });
        };
        handler.handle(data).await
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    fn spawn_listener(bridge: &Arc<Self>, mut stream: MessageStream) -> JoinHandle<()> {
        let bridge = Arc::downgrade(bridge);
        tokio::spawn(async move {
            while let Some(envelope) = stream.next().await {
                let Some(bridge) = bridge.upgrade() else {
                    break;
                };
                bridge.dispatch(&envelope);
            }
            debug!("shard bridge listener stopped");
        })
    }

    fn dispatch(self: &Arc<Self>, envelope: &Envelope) {
        let Some(channel) = self.channels.parse(&envelope.channel) else {
            return;
        };
        let message = match ShardMessage::decode(&envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %envelope.channel, error = %e, "dropping undecodable shard message");
                return;
            }
        };
        match channel {
            Channel::Broadcast => self.on_broadcast(message),
            Channel::Request => {
                let bridge = Arc::clone(self);
                tokio::spawn(async move { bridge.answer(message).await });
            }
            Channel::Response => self.on_response(message),
        }
    }

    fn on_broadcast(&self, message: ShardMessage) {
        if message.shard_id == self.config.shard_id {
            return;
        }
        debug!(kind = %message.kind, from = message.shard_id, "broadcast received");
        let event = BridgeEvent {
            name: format!("broadcast:{}", message.kind),
            kind: message.kind,
            shard_id: message.shard_id,
            data: message.data,
        };
        // No local listeners is fine.
        let _ = self.events.send(event);
    }

    async fn answer(&self, mut request: ShardMessage) {
        if request.request_id.is_none() {
            return;
        }
        let Some(transport) = &self.transport else {
            return;
        };
        let shard_id = self.config.shard_id;
        let response = match self.handle_locally(&request.kind, std::mem::take(&mut request.data)).await {
            Ok(data) => ShardMessage::response(&request, shard_id, data),
            Err(e) => {
                warn!(kind = %request.kind, error = %e, "shard request handler failed");
                ShardMessage::failure(&request, shard_id, &e)
            }
        };
        let published = match response.encode() {
            Ok(raw) => transport.publish(&self.channels.name(Channel::Response), raw).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            warn!(kind = %request.kind, error = %e, "failed to publish shard response");
        }
    }

    fn on_response(&self, message: ShardMessage) {
        let Some(request_id) = message.request_id else {
            return;
        };
        let mut pending = self.pending_requests();
        let Some(request) = pending.get_mut(&request_id) else {
            debug!(%request_id, from = message.shard_id, "response for unknown or finished request");
            return;
        };
        if request.responses.iter().any(|r| r.shard_id == message.shard_id) {
            return;
        }
        request.responses.push(ShardResponse::from(message));
        if request.responses.len() >= request.expected
            && let Some(done) = request.done.take()
        {
            let _ = done.send(());
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stop listening and release the transport.
    ///
    /// Outstanding requests resolve immediately with the responses they
    /// already have. Later calls fail with [`BridgeError::Closed`].
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = self.listener_slot().take() {
            listener.abort();
        }
        for request in self.pending_requests().values_mut() {
            if let Some(done) = request.done.take() {
                let _ = done.send(());
            }
        }
        if let Some(transport) = &self.transport {
            transport.close().await;
        }
        info!(shard_id = self.config.shard_id, "shard bridge shut down");
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BridgeError::Closed)
        } else {
            Ok(())
        }
    }

    fn pending_requests(&self) -> MutexGuard<'_, HashMap<Uuid, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

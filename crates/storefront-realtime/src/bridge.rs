//! Realtime bridge.
//!
//! A single actor owns both push channels, the subscription registry and the
//! pending request table. Callers talk to it through [`BridgeHandle`].
//! Inbound events are turned into [`InvalidationEvent`]s for the shared sink;
//! the bridge never touches view state itself.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use serde_json::{Value, json};
use storefront_core::{
    ActorChannels, ChannelSubscription, EventStream, InvalidationEvent, InvalidationSink,
    QueryReply, SessionEvent,
};
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc, oneshot,
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::BridgeConfig,
    error::RealtimeError,
    push::{ChannelKind, ChannelSignal, PushChannel, PushFrame},
};

/// Source of the current access token, read at connect time.
pub trait AccessTokenProvider: Send + Sync {
    fn access_token(&self) -> Option<String>;
}

impl<F> AccessTokenProvider for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn access_token(&self) -> Option<String> {
        self()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    ChannelUp { kind: ChannelKind },
    ChannelDown { kind: ChannelKind, reason: String },
    /// The authenticated channel is unavailable; running broadcast-only.
    Degraded { reason: String },
    Invalidated(InvalidationEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BridgeStatus {
    pub broadcast_connected: bool,
    pub authenticated_connected: bool,
    pub degraded: bool,
    /// Wire-level subscriptions, one per distinct channel name.
    pub active_channels: Vec<String>,
    pub handles: usize,
    pub pending_requests: usize,
}

/// Receipt for one registered subscription.
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    id: u64,
    channel_name: String,
    active: bool,
}

impl SubscriptionHandle {
    fn inactive(channel_name: String) -> Self {
        Self {
            id: 0,
            channel_name,
            active: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    /// False when the subscription needed a session that did not exist.
    pub fn is_active(&self) -> bool {
        self.active
    }
}

enum BridgeCommand {
    Subscribe {
        subscription: ChannelSubscription,
        reply: oneshot::Sender<SubscriptionHandle>,
    },
    Unsubscribe {
        id: u64,
    },
    Request {
        event: String,
        payload: Value,
        response_event: String,
        reply: oneshot::Sender<Result<QueryReply, RealtimeError>>,
    },
    Status {
        reply: oneshot::Sender<BridgeStatus>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Everything the bridge is wired to.
pub struct BridgeWiring {
    pub broadcast: Arc<dyn PushChannel>,
    pub authenticated: Option<Arc<dyn PushChannel>>,
    pub sink: Arc<dyn InvalidationSink>,
    pub tokens: Arc<dyn AccessTokenProvider>,
    /// Session lifecycle signals; the authenticated connection follows them.
    pub session_events: Option<EventStream<SessionEvent>>,
}

#[derive(Clone)]
pub struct BridgeHandle {
    channels: ActorChannels<BridgeCommand, BridgeEvent>,
    request_timeout: Duration,
}

impl BridgeHandle {
    pub fn events(&self) -> EventStream<BridgeEvent> {
        self.channels.subscribe()
    }

    pub async fn subscribe(
        &self,
        subscription: ChannelSubscription,
    ) -> Result<SubscriptionHandle, RealtimeError> {
        let (reply, receipt) = oneshot::channel();
        self.channels
            .send_command(BridgeCommand::Subscribe {
                subscription,
                reply,
            })
            .await?;
        receipt.await.map_err(|_| RealtimeError::ChannelClosed)
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), RealtimeError> {
        if !handle.active {
            return Ok(());
        }
        self.channels
            .send_command(BridgeCommand::Unsubscribe { id: handle.id })
            .await?;
        Ok(())
    }

    /// Non-async release for drop paths.
    pub fn release(&self, handle: &SubscriptionHandle) {
        if !handle.active {
            return;
        }
        if let Err(err) = self
            .channels
            .try_send_command(BridgeCommand::Unsubscribe { id: handle.id })
        {
            warn!(channel = %handle.channel_name, error = %err, "failed to release subscription");
        }
    }

    /// Emit `event` on the authenticated channel and wait for `response_event`.
    ///
    /// A newer request for the same `response_event` supersedes this one.
    pub async fn request(
        &self,
        event: &str,
        payload: Value,
        response_event: &str,
    ) -> Result<QueryReply, RealtimeError> {
        let (reply, receipt) = oneshot::channel();
        self.channels
            .send_command(BridgeCommand::Request {
                event: event.to_owned(),
                payload,
                response_event: response_event.to_owned(),
                reply,
            })
            .await?;
        tokio::time::timeout(self.request_timeout, receipt)
            .await
            .map_err(|_| RealtimeError::Timeout)?
            .map_err(|_| RealtimeError::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<BridgeStatus, RealtimeError> {
        let (reply, receipt) = oneshot::channel();
        self.channels
            .send_command(BridgeCommand::Status { reply })
            .await?;
        receipt.await.map_err(|_| RealtimeError::ChannelClosed)
    }

    /// Close both channels and stop the actor.
    pub async fn shutdown(&self) -> Result<(), RealtimeError> {
        let (done, finished) = oneshot::channel();
        self.channels
            .send_command(BridgeCommand::Shutdown { done })
            .await?;
        finished.await.map_err(|_| RealtimeError::ChannelClosed)
    }
}

pub fn spawn_bridge(config: &BridgeConfig, wiring: BridgeWiring) -> BridgeHandle {
    let (channels, commands) = ActorChannels::new(config.command_buffer, config.event_buffer);
    let runtime = BridgeRuntime::new(channels.clone(), commands, wiring);
    tokio::spawn(runtime.run());

    BridgeHandle {
        channels,
        request_timeout: config.request_timeout,
    }
}

struct PendingRequest {
    request_id: u64,
    reply: oneshot::Sender<Result<QueryReply, RealtimeError>>,
}

struct BridgeRuntime {
    channels: ActorChannels<BridgeCommand, BridgeEvent>,
    commands: mpsc::Receiver<BridgeCommand>,
    broadcast: Arc<dyn PushChannel>,
    authenticated: Option<Arc<dyn PushChannel>>,
    sink: Arc<dyn InvalidationSink>,
    tokens: Arc<dyn AccessTokenProvider>,
    session_events: Option<EventStream<SessionEvent>>,
    registrations: BTreeMap<u64, ChannelSubscription>,
    next_handle: u64,
    next_request_id: u64,
    pending: HashMap<String, PendingRequest>,
    broadcast_up: bool,
    authenticated_up: bool,
    degraded: bool,
}

impl BridgeRuntime {
    fn new(
        channels: ActorChannels<BridgeCommand, BridgeEvent>,
        commands: mpsc::Receiver<BridgeCommand>,
        wiring: BridgeWiring,
    ) -> Self {
        Self {
            channels,
            commands,
            broadcast: wiring.broadcast,
            authenticated: wiring.authenticated,
            sink: wiring.sink,
            tokens: wiring.tokens,
            session_events: wiring.session_events,
            registrations: BTreeMap::new(),
            next_handle: 0,
            next_request_id: 0,
            pending: HashMap::new(),
            broadcast_up: false,
            authenticated_up: false,
            degraded: false,
        }
    }

    async fn run(mut self) {
        let mut broadcast_signals = Some(self.broadcast.signals());
        let mut authenticated_signals = self.authenticated.as_ref().map(|channel| channel.signals());
        let mut session_events = self.session_events.take();

        if let Err(err) = self.broadcast.connect(None).await {
            warn!(error = %err, "broadcast channel failed to start");
        }
        self.connect_authenticated().await;

        loop {
            // Signals first so commands observe every event delivered before them.
            tokio::select! {
                biased;
                signal = next_optional(&mut broadcast_signals) => match signal {
                    Ok(signal) => self.on_signal(ChannelKind::Broadcast, signal).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bridge lagged behind the broadcast channel");
                    }
                    Err(RecvError::Closed) => broadcast_signals = None,
                },
                signal = next_optional(&mut authenticated_signals) => match signal {
                    Ok(signal) => self.on_signal(ChannelKind::Authenticated, signal).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bridge lagged behind the authenticated channel");
                    }
                    Err(RecvError::Closed) => authenticated_signals = None,
                },
                event = next_optional(&mut session_events) => match event {
                    Ok(event) => self.on_session_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bridge missed session events; resyncing");
                        self.connect_authenticated().await;
                    }
                    Err(RecvError::Closed) => session_events = None,
                },
                command = self.commands.recv() => match command {
                    Some(BridgeCommand::Shutdown { done }) => {
                        self.teardown().await;
                        let _ = done.send(());
                        return;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }

        self.teardown().await;
    }

    async fn handle_command(&mut self, command: BridgeCommand) {
        match command {
            BridgeCommand::Subscribe {
                subscription,
                reply,
            } => {
                let handle = self.handle_subscribe(subscription).await;
                let _ = reply.send(handle);
            }
            BridgeCommand::Unsubscribe { id } => self.handle_unsubscribe(id).await,
            BridgeCommand::Request {
                event,
                payload,
                response_event,
                reply,
            } => {
                self.handle_request(event, payload, response_event, reply)
                    .await;
            }
            BridgeCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // Handled in the run loop.
            BridgeCommand::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    async fn handle_subscribe(&mut self, subscription: ChannelSubscription) -> SubscriptionHandle {
        let kind = kind_of(&subscription);
        if kind == ChannelKind::Authenticated {
            if self.authenticated.is_none() {
                info!(channel = %subscription.channel_name, "no authenticated channel configured; subscription inactive");
                return SubscriptionHandle::inactive(subscription.channel_name);
            }
            if self.tokens.access_token().is_none() {
                info!(channel = %subscription.channel_name, "no session; authenticated subscription inactive");
                return SubscriptionHandle::inactive(subscription.channel_name);
            }
        }

        self.next_handle += 1;
        let id = self.next_handle;
        let channel_name = subscription.channel_name.clone();
        let already_wired = self.is_registered(&channel_name, kind);
        self.registrations.insert(id, subscription);

        if !already_wired && self.is_up(kind) {
            self.wire_subscribe(kind, &channel_name).await;
        }
        debug!(id, channel = %channel_name, ?kind, "subscription registered");

        SubscriptionHandle {
            id,
            channel_name,
            active: true,
        }
    }

    async fn handle_unsubscribe(&mut self, id: u64) {
        let Some(subscription) = self.registrations.remove(&id) else {
            trace!(id, "unsubscribe for unknown handle ignored");
            return;
        };
        let kind = kind_of(&subscription);
        if self.is_registered(&subscription.channel_name, kind) || !self.is_up(kind) {
            return;
        }
        if let Some(channel) = self.channel(kind)
            && let Err(err) = channel.unsubscribe(&subscription.channel_name).await
        {
            warn!(channel = %subscription.channel_name, error = %err, "wire unsubscribe failed");
        }
    }

    async fn handle_request(
        &mut self,
        event: String,
        payload: Value,
        response_event: String,
        reply: oneshot::Sender<Result<QueryReply, RealtimeError>>,
    ) {
        let channel = match &self.authenticated {
            Some(channel) if self.authenticated_up => Arc::clone(channel),
            _ => {
                let _ = reply.send(Err(RealtimeError::NotConnected));
                return;
            }
        };

        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let previous = self.pending.insert(
            response_event.clone(),
            PendingRequest { request_id, reply },
        );
        if let Some(previous) = previous {
            debug!(
                response_event = %response_event,
                superseded = previous.request_id,
                request_id,
                "newer request supersedes pending one"
            );
            let _ = previous.reply.send(Err(RealtimeError::Superseded));
        }

        if let Err(err) = channel
            .emit(&event, stamp_request_id(payload, request_id))
            .await
        {
            warn!(event = %event, error = %err, "request emit failed");
            if let Some(pending) = self.pending.remove(&response_event) {
                let _ = pending.reply.send(Err(err));
            }
        }
    }

    async fn on_signal(&mut self, kind: ChannelKind, signal: ChannelSignal) {
        match signal {
            ChannelSignal::Connected => {
                self.set_up(kind, true);
                if kind == ChannelKind::Authenticated {
                    self.degraded = false;
                }
                info!(?kind, "push channel up; restoring subscriptions");
                self.channels.emit(BridgeEvent::ChannelUp { kind });
                for name in self.wired_channels(kind) {
                    self.wire_subscribe(kind, &name).await;
                }
            }
            ChannelSignal::Disconnected { reason } => {
                self.set_up(kind, false);
                if kind == ChannelKind::Authenticated {
                    self.fail_pending(RealtimeError::ChannelClosed);
                }
                self.channels.emit(BridgeEvent::ChannelDown { kind, reason });
            }
            ChannelSignal::AuthRejected { reason } => {
                self.set_up(kind, false);
                self.fail_pending(RealtimeError::AuthRejected(reason.clone()));
                self.degrade(reason);
            }
            ChannelSignal::Event(frame) => self.on_frame(kind, frame),
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Established | SessionEvent::Refreshed => {
                // The reconnect replaces the socket without a Disconnected
                // signal; replies owed on the old one never arrive.
                if self.authenticated.is_some() {
                    self.authenticated_up = false;
                    self.fail_pending(RealtimeError::ChannelClosed);
                }
                self.connect_authenticated().await;
            }
            SessionEvent::Invalidated | SessionEvent::LoggedOut => {
                self.drop_authenticated("session ended").await;
            }
        }
    }

    fn on_frame(&mut self, kind: ChannelKind, frame: PushFrame) {
        if kind == ChannelKind::Authenticated && self.complete_request(&frame) {
            return;
        }

        let tags: BTreeSet<String> = self
            .registrations
            .values()
            .filter(|subscription| kind_of(subscription) == kind)
            .filter(|subscription| {
                frame
                    .channel
                    .as_deref()
                    .is_none_or(|channel| channel == subscription.channel_name)
            })
            .filter(|subscription| subscription.accepts(&frame.event))
            .map(|subscription| subscription.resource_tag().to_owned())
            .collect();

        if tags.is_empty() {
            trace!(event = %frame.event, "push event without a matching subscription");
            return;
        }
        for tag in tags {
            let event = InvalidationEvent::new(tag, frame.data.clone());
            debug!(resource_tag = %event.resource_tag, event = %frame.event, "invalidating");
            self.sink.invalidate(event.clone());
            self.channels.emit(BridgeEvent::Invalidated(event));
        }
    }

    /// Deliver a response frame to its pending request. Returns whether the
    /// frame was a response at all.
    fn complete_request(&mut self, frame: &PushFrame) -> bool {
        let Some(pending) = self.pending.get(&frame.event) else {
            return false;
        };
        let echoed = frame.data.get("requestId").and_then(Value::as_u64);
        if let Some(echoed) = echoed
            && echoed != pending.request_id
        {
            debug!(
                event = %frame.event,
                echoed,
                current = pending.request_id,
                "discarding stale response"
            );
            return true;
        }
        if let Some(pending) = self.pending.remove(&frame.event) {
            let _ = pending.reply.send(decode_reply(frame.data.clone()));
        }
        true
    }

    async fn connect_authenticated(&mut self) {
        let Some(channel) = self.authenticated.clone() else {
            return;
        };
        match self.tokens.access_token() {
            Some(token) => {
                if let Err(err) = channel.connect(Some(token)).await {
                    self.degrade(err.to_string());
                }
            }
            None => self.degrade("no active session".to_owned()),
        }
    }

    /// Close the authenticated connection and forget everything opened under
    /// the ended session.
    async fn drop_authenticated(&mut self, reason: &str) {
        let Some(channel) = self.authenticated.clone() else {
            return;
        };
        channel.close().await;
        self.authenticated_up = false;

        let before = self.registrations.len();
        self.registrations
            .retain(|_, subscription| !subscription.auth_required);
        self.fail_pending(RealtimeError::ChannelClosed);
        info!(
            released = before - self.registrations.len(),
            reason, "authenticated channel closed"
        );
        self.channels.emit(BridgeEvent::ChannelDown {
            kind: ChannelKind::Authenticated,
            reason: reason.to_owned(),
        });
    }

    fn degrade(&mut self, reason: String) {
        if !self.degraded {
            warn!(%reason, "authenticated channel unavailable; running broadcast-only");
        }
        self.degraded = true;
        self.channels.emit(BridgeEvent::Degraded { reason });
    }

    async fn wire_subscribe(&self, kind: ChannelKind, channel_name: &str) {
        let Some(channel) = self.channel(kind) else {
            return;
        };
        if let Err(err) = channel.subscribe(channel_name).await {
            warn!(channel = %channel_name, ?kind, error = %err, "wire subscribe failed");
        }
    }

    fn fail_pending(&mut self, error: RealtimeError) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(error.clone()));
        }
    }

    async fn teardown(&mut self) {
        self.broadcast.close().await;
        if let Some(channel) = &self.authenticated {
            channel.close().await;
        }
        self.broadcast_up = false;
        self.authenticated_up = false;
        self.registrations.clear();
        self.fail_pending(RealtimeError::ChannelClosed);
        info!("realtime bridge stopped");
    }

    fn status(&self) -> BridgeStatus {
        let mut active_channels: Vec<String> = [ChannelKind::Broadcast, ChannelKind::Authenticated]
            .into_iter()
            .flat_map(|kind| self.wired_channels(kind))
            .collect();
        active_channels.sort();
        BridgeStatus {
            broadcast_connected: self.broadcast_up,
            authenticated_connected: self.authenticated_up,
            degraded: self.degraded,
            active_channels,
            handles: self.registrations.len(),
            pending_requests: self.pending.len(),
        }
    }

    fn channel(&self, kind: ChannelKind) -> Option<&Arc<dyn PushChannel>> {
        match kind {
            ChannelKind::Broadcast => Some(&self.broadcast),
            ChannelKind::Authenticated => self.authenticated.as_ref(),
        }
    }

    fn is_up(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Broadcast => self.broadcast_up,
            ChannelKind::Authenticated => self.authenticated_up,
        }
    }

    fn set_up(&mut self, kind: ChannelKind, up: bool) {
        match kind {
            ChannelKind::Broadcast => self.broadcast_up = up,
            ChannelKind::Authenticated => self.authenticated_up = up,
        }
    }

    fn is_registered(&self, channel_name: &str, kind: ChannelKind) -> bool {
        self.registrations.values().any(|subscription| {
            subscription.channel_name == channel_name && kind_of(subscription) == kind
        })
    }

    fn wired_channels(&self, kind: ChannelKind) -> BTreeSet<String> {
        self.registrations
            .values()
            .filter(|subscription| kind_of(subscription) == kind)
            .map(|subscription| subscription.channel_name.clone())
            .collect()
    }
}

fn kind_of(subscription: &ChannelSubscription) -> ChannelKind {
    if subscription.auth_required {
        ChannelKind::Authenticated
    } else {
        ChannelKind::Broadcast
    }
}

async fn next_optional<T: Clone>(
    receiver: &mut Option<broadcast::Receiver<T>>,
) -> Result<T, RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn stamp_request_id(payload: Value, request_id: u64) -> Value {
    match payload {
        Value::Object(mut fields) => {
            fields.insert("requestId".to_owned(), json!(request_id));
            Value::Object(fields)
        }
        Value::Null => json!({ "requestId": request_id }),
        other => json!({ "requestId": request_id, "payload": other }),
    }
}

fn decode_reply(data: Value) -> Result<QueryReply, RealtimeError> {
    let reply: QueryReply = serde_json::from_value(data)
        .map_err(|err| RealtimeError::Protocol(format!("malformed reply: {err}")))?;
    if reply.success {
        Ok(reply)
    } else {
        Err(RealtimeError::Remote(
            reply
                .error
                .unwrap_or_else(|| "request failed without a message".to_owned()),
        ))
    }
}

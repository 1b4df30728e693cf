use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use storefront_core::{InvalidationEvent, InvalidationSink};
use tokio::sync::broadcast;

use crate::{
    error::RealtimeError,
    push::{ChannelKind, ChannelSignal, PushChannel, PushFrame},
};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Connect(Option<String>),
    Subscribe(String),
    Unsubscribe(String),
    Emit(String, Value),
    Close,
}

/// Push channel double that records calls and lets tests inject signals.
pub(crate) struct FakePushChannel {
    kind: ChannelKind,
    reject_auth: bool,
    connected: AtomicBool,
    signals: broadcast::Sender<ChannelSignal>,
    calls: Mutex<Vec<Call>>,
}

impl FakePushChannel {
    pub(crate) fn new(kind: ChannelKind) -> Arc<Self> {
        Self::build(kind, false)
    }

    pub(crate) fn rejecting(kind: ChannelKind) -> Arc<Self> {
        Self::build(kind, true)
    }

    fn build(kind: ChannelKind, reject_auth: bool) -> Arc<Self> {
        let (signals, _) = broadcast::channel(64);
        Arc::new(Self {
            kind,
            reject_auth,
            connected: AtomicBool::new(false),
            signals,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls").clone()
    }

    pub(crate) fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| predicate(call)).count()
    }

    pub(crate) fn push(&self, channel: Option<&str>, event: &str, data: Value) {
        let _ = self.signals.send(ChannelSignal::Event(PushFrame {
            channel: channel.map(str::to_owned),
            event: event.to_owned(),
            data,
        }));
    }

    pub(crate) fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.signals.send(ChannelSignal::Disconnected {
            reason: "socket reset".to_owned(),
        });
    }

    pub(crate) fn restore_connection(&self) {
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.signals.send(ChannelSignal::Connected);
    }

    /// Wait until a recorded call matches.
    pub(crate) async fn wait_for(&self, predicate: impl Fn(&Call) -> bool) -> Call {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(call) = self.calls().into_iter().find(|call| predicate(call)) {
                    return call;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("expected call was not recorded")
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("calls").push(call);
    }

    fn require_connected(&self) -> Result<(), RealtimeError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RealtimeError::NotConnected)
        }
    }
}

#[async_trait]
impl PushChannel for FakePushChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn connect(&self, token: Option<String>) -> Result<(), RealtimeError> {
        self.record(Call::Connect(token));
        if self.reject_auth {
            let _ = self.signals.send(ChannelSignal::AuthRejected {
                reason: "upgrade refused with 401 Unauthorized".to_owned(),
            });
        } else {
            self.restore_connection();
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), RealtimeError> {
        self.require_connected()?;
        self.record(Call::Subscribe(channel.to_owned()));
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), RealtimeError> {
        self.require_connected()?;
        self.record(Call::Unsubscribe(channel.to_owned()));
        Ok(())
    }

    async fn emit(&self, event: &str, data: Value) -> Result<(), RealtimeError> {
        self.require_connected()?;
        self.record(Call::Emit(event.to_owned(), data));
        Ok(())
    }

    fn signals(&self) -> broadcast::Receiver<ChannelSignal> {
        self.signals.subscribe()
    }

    async fn close(&self) {
        self.record(Call::Close);
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Sink double keeping every invalidation it receives.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<InvalidationEvent>>,
}

impl RecordingSink {
    pub(crate) fn tags(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("events")
            .iter()
            .map(|event| event.resource_tag.clone())
            .collect()
    }

    pub(crate) fn events(&self) -> Vec<InvalidationEvent> {
        self.events.lock().expect("events").clone()
    }
}

impl InvalidationSink for RecordingSink {
    fn invalidate(&self, event: InvalidationEvent) {
        self.events.lock().expect("events").push(event);
    }
}

//! WebSocket push channel with automatic reconnect.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::{
    net::TcpStream,
    sync::{Mutex, broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    config::ChannelConfig,
    error::RealtimeError,
    protocol::{AuthenticatedProtocol, BroadcastProtocol, Inbound, WireProtocol},
    push::{ChannelKind, ChannelSignal, PushChannel},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type LiveSender = Arc<StdMutex<Option<mpsc::Sender<String>>>>;

struct Worker {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

pub struct WsPushChannel<P: WireProtocol> {
    config: ChannelConfig,
    protocol: Arc<P>,
    signals: broadcast::Sender<ChannelSignal>,
    live: LiveSender,
    worker: Mutex<Option<Worker>>,
}

impl WsPushChannel<BroadcastProtocol> {
    pub fn broadcast(config: ChannelConfig) -> Self {
        Self::with_protocol(config, BroadcastProtocol)
    }
}

impl WsPushChannel<AuthenticatedProtocol> {
    pub fn authenticated(config: ChannelConfig) -> Self {
        Self::with_protocol(config, AuthenticatedProtocol)
    }
}

impl<P: WireProtocol> WsPushChannel<P> {
    pub fn with_protocol(config: ChannelConfig, protocol: P) -> Self {
        let (signals, _) = broadcast::channel(256);
        Self {
            config,
            protocol: Arc::new(protocol),
            signals,
            live: Arc::new(StdMutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    async fn send_frame(&self, frame: String) -> Result<(), RealtimeError> {
        let sender = self
            .live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RealtimeError::NotConnected)?;
        sender
            .send(frame)
            .await
            .map_err(|_| RealtimeError::NotConnected)
    }

    async fn stop_worker(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.stop.cancel();
            let _ = worker.task.await;
        }
    }
}

#[async_trait]
impl<P: WireProtocol> PushChannel for WsPushChannel<P> {
    fn kind(&self) -> ChannelKind {
        self.protocol.kind()
    }

    async fn connect(&self, token: Option<String>) -> Result<(), RealtimeError> {
        if self.protocol.kind() == ChannelKind::Authenticated && token.is_none() {
            return Err(RealtimeError::AuthRejected("no access token".to_owned()));
        }
        self.stop_worker().await;

        let stop = CancellationToken::new();
        let task = tokio::spawn(run_connection(
            self.config.clone(),
            Arc::clone(&self.protocol),
            token,
            self.signals.clone(),
            Arc::clone(&self.live),
            stop.child_token(),
        ));
        *self.worker.lock().await = Some(Worker { stop, task });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), RealtimeError> {
        self.send_frame(self.protocol.subscribe_frame(channel)).await
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), RealtimeError> {
        self.send_frame(self.protocol.unsubscribe_frame(channel)).await
    }

    async fn emit(&self, event: &str, data: Value) -> Result<(), RealtimeError> {
        let frame = self.protocol.emit_frame(event, &data)?;
        self.send_frame(frame).await
    }

    fn signals(&self) -> broadcast::Receiver<ChannelSignal> {
        self.signals.subscribe()
    }

    async fn close(&self) {
        self.stop_worker().await;
    }
}

enum Closed {
    Stopped,
    Dropped(String),
}

async fn run_connection<P: WireProtocol>(
    config: ChannelConfig,
    protocol: Arc<P>,
    token: Option<String>,
    signals: broadcast::Sender<ChannelSignal>,
    live: LiveSender,
    stop: CancellationToken,
) {
    let kind = protocol.kind();
    let mut attempt: u32 = 0;

    loop {
        let opened = tokio::select! {
            _ = stop.cancelled() => break,
            opened = open_socket(&config, token.as_deref()) => opened,
        };

        match opened {
            Ok(socket) => {
                info!(?kind, url = %config.url, "push channel connected");
                attempt = 0;
                match pump(socket, protocol.as_ref(), &signals, &live, &stop).await {
                    Closed::Stopped => break,
                    Closed::Dropped(reason) => {
                        warn!(?kind, %reason, "push channel dropped");
                        let _ = signals.send(ChannelSignal::Disconnected { reason });
                    }
                }
            }
            Err(RealtimeError::AuthRejected(reason)) => {
                warn!(?kind, %reason, "push channel rejected credentials; not retrying");
                let _ = signals.send(ChannelSignal::AuthRejected { reason });
                break;
            }
            Err(err) => {
                warn!(?kind, error = %err, attempt, "push channel connect failed");
                let _ = signals.send(ChannelSignal::Disconnected {
                    reason: err.to_string(),
                });
            }
        }

        let delay = config.retry.delay_for_attempt(attempt);
        attempt = attempt.saturating_add(1);
        debug!(?kind, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    *live.lock().unwrap_or_else(PoisonError::into_inner) = None;
}

async fn open_socket(config: &ChannelConfig, token: Option<&str>) -> Result<Socket, RealtimeError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|err| RealtimeError::Connect(err.to_string()))?;
    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| RealtimeError::AuthRejected("token is not a valid header value".to_owned()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (socket, _) = tokio::time::timeout(config.connect_timeout, connect_async(request))
        .await
        .map_err(|_| RealtimeError::Connect("connect timed out".to_owned()))?
        .map_err(map_connect_error)?;
    Ok(socket)
}

fn map_connect_error(err: tungstenite::Error) -> RealtimeError {
    match err {
        tungstenite::Error::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            RealtimeError::AuthRejected(format!("upgrade refused with {}", response.status()))
        }
        other => RealtimeError::Connect(other.to_string()),
    }
}

/// Shuttle frames until the socket drops or the loop is stopped.
async fn pump<P: WireProtocol>(
    socket: Socket,
    protocol: &P,
    signals: &broadcast::Sender<ChannelSignal>,
    live: &LiveSender,
    stop: &CancellationToken,
) -> Closed {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
    *live.lock().unwrap_or_else(PoisonError::into_inner) = Some(outbound_tx);
    let _ = signals.send(ChannelSignal::Connected);

    let closed = loop {
        tokio::select! {
            _ = stop.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break Closed::Stopped;
            }
            Some(frame) = outbound_rx.recv() => {
                trace!(bytes = frame.len(), "push frame out");
                if let Err(err) = sink.send(Message::Text(frame.into())).await {
                    break Closed::Dropped(err.to_string());
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match protocol.decode(text.as_str()) {
                    Inbound::Frame(frame) => {
                        let _ = signals.send(ChannelSignal::Event(frame));
                    }
                    Inbound::Reply(reply) => {
                        if let Err(err) = sink.send(Message::Text(reply.into())).await {
                            break Closed::Dropped(err.to_string());
                        }
                    }
                    Inbound::Ignore => {}
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|frame| frame.reason.to_string())
                        .filter(|reason| !reason.is_empty())
                        .unwrap_or_else(|| "closed by server".to_owned());
                    break Closed::Dropped(reason);
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break Closed::Dropped(err.to_string()),
                None => break Closed::Dropped("stream ended".to_owned()),
            }
        }
    };

    *live.lock().unwrap_or_else(PoisonError::into_inner) = None;
    closed
}

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Broadcast event stream handed to subscribers.
pub type EventStream<E> = broadcast::Receiver<E>;

/// Errors returned by channel operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The command receiver side is closed.
    #[error("command channel is closed")]
    CommandChannelClosed,
}

/// Fan-out event bus. Emission is best-effort; lagged subscribers are
/// handled by `broadcast`.
#[derive(Debug)]
pub struct EventBus<E> {
    event_tx: broadcast::Sender<E>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            event_tx: self.event_tx.clone(),
        }
    }
}

impl<E: Clone> EventBus<E> {
    pub fn new(buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(buffer.max(1));
        Self { event_tx }
    }

    pub fn subscribe(&self) -> EventStream<E> {
        self.event_tx.subscribe()
    }

    pub fn emit(&self, event: E) {
        let _ = self.event_tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}

/// Command/event channel pair used by actor-style runtimes.
#[derive(Debug)]
pub struct ActorChannels<C, E> {
    command_tx: mpsc::Sender<C>,
    events: EventBus<E>,
}

impl<C, E> Clone for ActorChannels<C, E> {
    fn clone(&self) -> Self {
        Self {
            command_tx: self.command_tx.clone(),
            events: self.events.clone(),
        }
    }
}

impl<C, E: Clone> ActorChannels<C, E> {
    /// Create a new channel set and return it with the command receiver.
    pub fn new(command_buffer: usize, event_buffer: usize) -> (Self, mpsc::Receiver<C>) {
        let (command_tx, command_rx) = mpsc::channel(command_buffer.max(1));
        (
            Self {
                command_tx,
                events: EventBus::new(event_buffer),
            },
            command_rx,
        )
    }

    pub fn events(&self) -> &EventBus<E> {
        &self.events
    }

    pub fn subscribe(&self) -> EventStream<E> {
        self.events.subscribe()
    }

    pub async fn send_command(&self, command: C) -> Result<(), ChannelError> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| ChannelError::CommandChannelClosed)
    }

    /// Enqueue without waiting; used from `Drop` paths.
    pub fn try_send_command(&self, command: C) -> Result<(), ChannelError> {
        self.command_tx
            .try_send(command)
            .map_err(|_| ChannelError::CommandChannelClosed)
    }

    pub fn emit(&self, event: E) {
        self.events.emit(event);
    }
}

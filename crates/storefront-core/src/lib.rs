//! Core client contract shared by the transport, session and realtime crates.
//!
//! This crate defines the failure taxonomy, the request/session/invalidation
//! data model, multipart encoding for query-language requests, the per-request
//! retry state machine and the invalidation cache. It performs no I/O.

/// Query result cache fed by invalidation events.
pub mod cache;
/// Async command/event channel primitives.
pub mod channel;
/// Caller-facing error taxonomy and HTTP classification helpers.
pub mod error;
/// Multipart encoding of query-language requests with attachments.
pub mod multipart;
/// Query-language response normalization.
pub mod normalization;
/// Backoff policy used by reconnect loops.
pub mod retry;
/// Per-request retry state machine.
pub mod state_machine;
/// Session, envelope, subscription and invalidation types.
pub mod types;
/// Tagged-union input model carrying binary attachments.
pub mod value;

pub use cache::{CacheEvent, InvalidationSink, QueryCache};
pub use channel::{ActorChannels, ChannelError, EventBus, EventStream};
pub use error::{ClientError, ErrorCategory, StatusClass, classify_http_status, display_message};
pub use multipart::{
    AttachmentMap, ExtractedFiles, MultipartBody, QueryBody, VARIABLES_ROOT, encode_query,
    extract_files,
};
pub use normalization::{normalize_query_response, query_error_messages};
pub use retry::RetryPolicy;
pub use state_machine::{AttemptOutcome, AttemptState, AttemptStateMachine, NextStep};
pub use types::{
    ChannelSubscription, HttpMethod, InvalidationEvent, ListPage, QueryReply, RequestEnvelope,
    Session, SessionEvent, TokenPair,
};
pub use value::{FileUpload, InputValue};

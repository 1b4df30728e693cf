mod config;
mod logging;

use std::{process::ExitCode, sync::Arc};

use config::{SessionStoreKind, SmokeConfig};
use serde_json::json;
use storefront_core::{
    CacheEvent, ChannelSubscription, ClientError, InputValue, QueryCache, Session,
};
use storefront_http::{
    Backend, BackendConfig, BackendRoute, HandshakeConfig, QueryClient, SessionGuard,
};
use storefront_platform::{FileSessionStore, SessionStore};
use storefront_realtime::{
    BridgeConfig, BridgeEvent, BridgeWiring, ChannelConfig, PushChannel, RealtimeError,
    ViewScope, WsPushChannel, spawn_bridge,
};
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

const QUERY_KEY: &str = "smoke-query";
const POLL_TAG: &str = "smoke";

#[derive(Debug, Error)]
enum SmokeError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Realtime(#[from] RealtimeError),
    #[error("failed to wait for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();
    info!("starting storefront-smoke");

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "smoke run failed");
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: SmokeConfig) -> Result<(), SmokeError> {
    let (guard, query_backend) = build_guard(&config)?;
    let guard = Arc::new(guard);

    match establish_session(&guard, &config).await? {
        Some(session) => info!(user = %session.user, "session ready"),
        None => warn!("no stored session and no credentials; running anonymously"),
    }

    let queries = QueryClient::new(Arc::clone(&guard), query_backend, config.query_path.clone());
    let result = queries.execute(&config.query, &InputValue::Null).await?;
    println!("{result}");

    let Some(broadcast_url) = config.broadcast_url.as_deref() else {
        info!("no broadcast url configured; done");
        return Ok(());
    };

    let cache = Arc::new(QueryCache::default());
    let mut tags: Vec<&str> = config.topics.iter().map(String::as_str).collect();
    tags.push(POLL_TAG);
    cache.register(QUERY_KEY, &tags);
    cache.store(QUERY_KEY, result);
    let mut stale = cache.subscribe();

    let broadcast: Arc<dyn PushChannel> =
        Arc::new(WsPushChannel::broadcast(ChannelConfig::new(broadcast_url)?));
    let authenticated = match config.push_url.as_deref() {
        Some(url) => Some(
            Arc::new(WsPushChannel::authenticated(ChannelConfig::new(url)?)) as Arc<dyn PushChannel>,
        ),
        None => None,
    };
    let token_guard = Arc::clone(&guard);
    let bridge_config = BridgeConfig {
        poll_interval: config.poll_interval,
        ..BridgeConfig::default()
    };
    let bridge = spawn_bridge(
        &bridge_config,
        BridgeWiring {
            broadcast,
            authenticated,
            sink: cache.clone(),
            tokens: Arc::new(move || token_guard.access_token()),
            session_events: Some(guard.subscribe()),
        },
    );
    let mut bridge_events = bridge.events();

    let mut scope = ViewScope::new(bridge.clone());
    for topic in &config.topics {
        if !scope
            .subscribe(ChannelSubscription::broadcast(topic.as_str(), &[]))
            .await
        {
            warn!(topic = %topic, "topic subscription inactive");
        }
    }
    scope.poll(cache.clone(), POLL_TAG, bridge_config.poll_interval);
    let status = bridge.status().await?;
    info!(
        channels = ?status.active_channels,
        authenticated = status.authenticated_connected,
        degraded = status.degraded,
        "watching for changes; press Ctrl-C to stop"
    );

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal?;
                info!("shutdown requested");
                break;
            }
            event = bridge_events.recv() => match event {
                Ok(BridgeEvent::Invalidated(event)) => {
                    println!("invalidated {} {}", event.resource_tag, event.payload);
                }
                Ok(event) => info!(?event, "bridge event"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed bridge events"),
                Err(RecvError::Closed) => break,
            },
            event = stale.recv() => match event {
                Ok(CacheEvent::Stale { key, resource_tag }) => {
                    info!(key = %key, resource_tag = %resource_tag, "refetching");
                    match scope.guard(queries.execute(&config.query, &InputValue::Null)).await {
                        Some(Ok(value)) => {
                            println!("{value}");
                            cache.store(&key, value);
                        }
                        Some(Err(err)) => {
                            // Re-arm so the next invalidation retries.
                            warn!(error = %err, code = err.code(), "refetch failed");
                            cache.mark_fresh(&key);
                        }
                        None => {}
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed cache events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    scope.unmount();
    bridge.shutdown().await?;
    Ok(())
}

fn build_guard(config: &SmokeConfig) -> Result<(SessionGuard, Backend), ClientError> {
    let mut primary = BackendConfig::new(&config.api_url)?.with_timeout(config.http_timeout);
    if config.handshake {
        primary = primary.with_handshake(HandshakeConfig::default());
    }
    let store: Arc<dyn SessionStore> = match &config.session_store {
        SessionStoreKind::File(path) => Arc::new(FileSessionStore::new(path)),
        #[cfg(feature = "keyring")]
        SessionStoreKind::Keyring => Arc::new(
            storefront_platform::KeyringSessionStore::for_api(&config.api_url)
                .map_err(|err| ClientError::Storage(err.to_string()))?,
        ),
    };
    let guard = SessionGuard::new(BackendRoute::from_config(&primary)?, store);

    match config.query_url.as_deref() {
        Some(url) => {
            let secondary = BackendConfig::new(url)?.with_timeout(config.http_timeout);
            Ok((
                guard.with_secondary(BackendRoute::from_config(&secondary)?),
                Backend::Secondary,
            ))
        }
        None => Ok((guard, Backend::Primary)),
    }
}

async fn establish_session(
    guard: &SessionGuard,
    config: &SmokeConfig,
) -> Result<Option<Session>, ClientError> {
    if let Some(session) = guard.restore()? {
        return Ok(Some(session));
    }
    match (&config.email, &config.password) {
        (Some(email), Some(password)) => {
            let session = guard
                .login(json!({"email": email, "password": password}))
                .await?;
            Ok(Some(session))
        }
        _ => Ok(None),
    }
}

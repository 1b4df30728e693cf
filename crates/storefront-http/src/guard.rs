//! Session guard.
//!
//! Every authenticated request goes through [`SessionGuard::send`], which
//! attaches the bearer and anti-forgery tokens read at dispatch time and
//! drives an [`AttemptStateMachine`]:
//!
//! - `401` refreshes the access token once and replays the request once.
//!   Concurrent expiries share a single refresh call.
//! - `419` renews the anti-forgery token from the backend's bootstrap
//!   endpoint and replays once. The session survives a failed renewal.
//! - A failed refresh, or a replay rejected again with `401`, destroys the
//!   session and surfaces [`ClientError::AuthExpired`].

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use storefront_core::{
    AttemptOutcome, AttemptStateMachine, ClientError, EventBus, EventStream, HttpMethod, NextStep,
    Session, SessionEvent, StatusClass, TokenPair, classify_http_status,
};
use storefront_platform::SessionStore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    anti_forgery::AntiForgerySource,
    config::{AuthEndpoints, BackendConfig, HandshakeConfig},
    transport::{OutgoingRequest, ReqwestTransport, Transport, TransportError, TransportResponse},
};

const AUTHORIZATION: &str = "Authorization";

/// Which backend a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Public API. Also serves the session lifecycle endpoints.
    Primary,
    /// Cookie-protected admin backend.
    Secondary,
}

struct HandshakeRoute {
    config: HandshakeConfig,
    source: Arc<dyn AntiForgerySource>,
    renew_lock: Mutex<()>,
}

/// Transport plus optional anti-forgery settings for one backend.
pub struct BackendRoute {
    transport: Arc<dyn Transport>,
    handshake: Option<HandshakeRoute>,
}

impl BackendRoute {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            handshake: None,
        }
    }

    pub fn with_handshake(
        mut self,
        config: HandshakeConfig,
        source: Arc<dyn AntiForgerySource>,
    ) -> Self {
        self.handshake = Some(HandshakeRoute {
            config,
            source,
            renew_lock: Mutex::new(()),
        });
        self
    }

    /// Build a reqwest-backed route. A handshake config wires the cookie
    /// jar of the transport in as the anti-forgery source.
    pub fn from_config(config: &BackendConfig) -> Result<Self, ClientError> {
        let transport = ReqwestTransport::new(config)?;
        let source = match &config.handshake {
            Some(handshake) => Some((
                handshake.clone(),
                transport.anti_forgery_source(handshake)?,
            )),
            None => None,
        };
        let route = Self::new(Arc::new(transport));
        Ok(match source {
            Some((handshake, source)) => route.with_handshake(handshake, Arc::new(source)),
            None => route,
        })
    }
}

#[derive(Debug, Default)]
struct SessionCell {
    session: Option<Session>,
    /// Bumped whenever the session is installed, rotated or destroyed.
    generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct Policy {
    bearer: bool,
    refresh: bool,
}

const GUARDED: Policy = Policy {
    bearer: true,
    refresh: true,
};
const ANONYMOUS: Policy = Policy {
    bearer: false,
    refresh: false,
};
const NO_REFRESH: Policy = Policy {
    bearer: true,
    refresh: false,
};

struct Dispatched {
    generation: u64,
    anti_forgery: Option<String>,
    result: Result<TransportResponse, TransportError>,
}

pub struct SessionGuard {
    primary: BackendRoute,
    secondary: Option<BackendRoute>,
    endpoints: AuthEndpoints,
    store: Arc<dyn SessionStore>,
    cell: RwLock<SessionCell>,
    refresh_lock: Mutex<()>,
    events: EventBus<SessionEvent>,
}

impl SessionGuard {
    pub fn new(primary: BackendRoute, store: Arc<dyn SessionStore>) -> Self {
        Self {
            primary,
            secondary: None,
            endpoints: AuthEndpoints::default(),
            store,
            cell: RwLock::new(SessionCell::default()),
            refresh_lock: Mutex::new(()),
            events: EventBus::new(64),
        }
    }

    pub fn with_secondary(mut self, route: BackendRoute) -> Self {
        self.secondary = Some(route);
        self
    }

    pub fn with_endpoints(mut self, endpoints: AuthEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn subscribe(&self) -> EventStream<SessionEvent> {
        self.events.subscribe()
    }

    pub fn current_session(&self) -> Option<Session> {
        self.read_cell().session.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.read_cell()
            .session
            .as_ref()
            .map(|session| session.access_token.clone())
    }

    pub fn is_authenticated(&self) -> bool {
        self.read_cell().session.is_some()
    }

    /// Dispatch an authenticated request with refresh and handshake recovery.
    pub async fn send(
        &self,
        backend: Backend,
        request: &OutgoingRequest,
    ) -> Result<TransportResponse, ClientError> {
        self.run(backend, request, GUARDED).await
    }

    pub async fn login(&self, credentials: Value) -> Result<Session, ClientError> {
        let request = OutgoingRequest::post_json(self.endpoints.login_path.clone(), credentials);
        self.authenticate(&request).await
    }

    pub async fn register(&self, details: Value) -> Result<Session, ClientError> {
        let request = OutgoingRequest::post_json(self.endpoints.register_path.clone(), details);
        self.authenticate(&request).await
    }

    /// Best-effort server logout followed by unconditional local teardown.
    pub async fn logout(&self) {
        if self.is_authenticated() {
            let request = OutgoingRequest::new(HttpMethod::Post, self.endpoints.logout_path.clone());
            if let Err(err) = self.run(Backend::Primary, &request, NO_REFRESH).await {
                warn!(error = %err, "server logout failed; clearing local session anyway");
            }
        }
        self.destroy_session(SessionEvent::LoggedOut);
    }

    /// Load a persisted session, if any, and make it current.
    pub fn restore(&self) -> Result<Option<Session>, ClientError> {
        let loaded = self
            .store
            .load()
            .map_err(|err| ClientError::Storage(err.to_string()))?;
        if let Some(session) = &loaded {
            self.install(session.clone());
            info!("persisted session restored");
        }
        Ok(loaded)
    }

    async fn authenticate(&self, request: &OutgoingRequest) -> Result<Session, ClientError> {
        let response = self.run(Backend::Primary, request, ANONYMOUS).await?;
        let mut session: Session = decode_payload(&response.body)
            .map_err(|err| ClientError::Internal(format!("malformed session payload: {err}")))?;
        if session.anti_forgery_token.is_none() {
            session.anti_forgery_token = self
                .primary
                .handshake
                .as_ref()
                .and_then(|handshake| handshake.source.token());
        }

        if let Err(err) = self.store.save(&session) {
            warn!(error = %err, "failed to persist session; keeping it in memory");
        }
        self.install(session.clone());
        info!("session established");
        Ok(session)
    }

    async fn run(
        &self,
        backend: Backend,
        request: &OutgoingRequest,
        policy: Policy,
    ) -> Result<TransportResponse, ClientError> {
        let route = self.route(backend)?;
        let mut machine = AttemptStateMachine::default();
        let mut attempt = self.dispatch(route, request, policy).await;
        let mut rejected_handshake: Option<(u16, Value)> = None;

        loop {
            let outcome = classify(&attempt.result, policy, route.handshake.is_some());
            match machine.on_outcome(outcome)? {
                NextStep::Done => return attempt.result.map_err(TransportError::into_client_error),
                NextStep::Fail => {
                    return Err(self.fail(attempt.result, outcome, machine.has_refreshed()));
                }
                NextStep::RefreshThenReplay => {
                    if let Err(err) = self.refresh_after(attempt.generation).await {
                        machine.on_recovery_failed()?;
                        return Err(err);
                    }
                    machine.begin_replay()?;
                    debug!(?backend, path = %request.path, "replaying request after refresh");
                }
                NextStep::RenewHandshakeThenReplay => {
                    if let Err(TransportError::Status { status, body }) = &attempt.result {
                        rejected_handshake = Some((*status, body.clone()));
                    }
                    if let Err(err) = self
                        .renew_handshake(route, attempt.anti_forgery.as_deref())
                        .await
                    {
                        warn!(?backend, error = %err, "anti-forgery renewal failed");
                        machine.on_recovery_failed()?;
                        let (status, body) = rejected_handshake.unwrap_or((419, Value::Null));
                        return Err(ClientError::HandshakeFailed { status, body });
                    }
                    machine.begin_replay()?;
                    debug!(?backend, path = %request.path, "replaying request after handshake renewal");
                }
            }
            attempt = self.dispatch(route, request, policy).await;
        }
    }

    fn fail(
        &self,
        result: Result<TransportResponse, TransportError>,
        outcome: AttemptOutcome,
        refreshed: bool,
    ) -> ClientError {
        match (outcome, result) {
            // Only a token that was rotated for this request proves the
            // session is dead.
            (AttemptOutcome::RetryableAuth, _) if refreshed => {
                warn!("replayed request rejected again; destroying session");
                self.destroy_session(SessionEvent::Invalidated);
                ClientError::AuthExpired
            }
            (AttemptOutcome::RetryableHandshake, Err(TransportError::Status { status, body })) => {
                ClientError::HandshakeFailed { status, body }
            }
            (_, Err(err)) => err.into_client_error(),
            (_, Ok(response)) => ClientError::Internal(format!(
                "request failed with successful status {}",
                response.status
            )),
        }
    }

    /// Decorate and send once. Tokens are read here, not when the caller
    /// built the request.
    async fn dispatch(
        &self,
        route: &BackendRoute,
        request: &OutgoingRequest,
        policy: Policy,
    ) -> Dispatched {
        let mut decorated = request.clone();
        let generation = {
            let cell = self.read_cell();
            if policy.bearer
                && let Some(session) = &cell.session
            {
                decorated.set_header(AUTHORIZATION, format!("Bearer {}", session.access_token));
            }
            cell.generation
        };

        let anti_forgery = route.handshake.as_ref().and_then(|handshake| {
            let token = handshake.source.token();
            if let Some(token) = &token {
                decorated.set_header(&handshake.config.header_name, token.clone());
            }
            token
        });

        let result = route.transport.send(&decorated).await;
        Dispatched {
            generation,
            anti_forgery,
            result,
        }
    }

    /// Refresh unless another request already did so since `observed` was read.
    async fn refresh_after(&self, observed: u64) -> Result<(), ClientError> {
        let _permit = self.refresh_lock.lock().await;

        let refresh_token = {
            let cell = self.read_cell();
            match &cell.session {
                Some(_) if cell.generation != observed => {
                    debug!("session already rotated by a concurrent request");
                    return Ok(());
                }
                Some(session) => session.refresh_token.clone(),
                None => return Err(ClientError::AuthExpired),
            }
        };

        let request = OutgoingRequest::post_json(
            self.endpoints.refresh_path.clone(),
            json!({ "refreshToken": refresh_token }),
        );
        let attempt = self.dispatch(&self.primary, &request, ANONYMOUS).await;
        let pair = attempt
            .result
            .map_err(|err| err.to_string())
            .and_then(|response| {
                decode_payload::<TokenPair>(&response.body)
                    .map_err(|err| format!("malformed refresh response: {err}"))
            });

        match pair {
            Ok(pair) => {
                self.rotate(pair);
                info!("access token refreshed");
                Ok(())
            }
            Err(reason) => {
                warn!(%reason, "token refresh failed; destroying session");
                self.destroy_session(SessionEvent::Invalidated);
                Err(ClientError::AuthExpired)
            }
        }
    }

    async fn renew_handshake(
        &self,
        route: &BackendRoute,
        rejected: Option<&str>,
    ) -> Result<(), ClientError> {
        let Some(handshake) = &route.handshake else {
            return Err(ClientError::Internal(
                "handshake renewal on a backend without anti-forgery config".to_owned(),
            ));
        };
        let _permit = handshake.renew_lock.lock().await;

        let current = handshake.source.token();
        if current.is_some() && current.as_deref() != rejected {
            debug!("anti-forgery token already renewed by a concurrent request");
            self.remember_anti_forgery(current);
            return Ok(());
        }

        let bootstrap = OutgoingRequest::get(handshake.config.bootstrap_path.clone());
        route
            .transport
            .send(&bootstrap)
            .await
            .map_err(TransportError::into_client_error)?;

        match handshake.source.token() {
            Some(token) => {
                self.remember_anti_forgery(Some(token));
                info!("anti-forgery token renewed");
                Ok(())
            }
            None => Err(ClientError::Internal(format!(
                "bootstrap did not set the '{}' cookie",
                handshake.config.cookie_name
            ))),
        }
    }

    fn route(&self, backend: Backend) -> Result<&BackendRoute, ClientError> {
        match backend {
            Backend::Primary => Ok(&self.primary),
            Backend::Secondary => self
                .secondary
                .as_ref()
                .ok_or_else(|| ClientError::Internal("secondary backend not configured".to_owned())),
        }
    }

    fn install(&self, session: Session) {
        {
            let mut cell = self.write_cell();
            cell.session = Some(session);
            cell.generation += 1;
        }
        self.events.emit(SessionEvent::Established);
    }

    fn rotate(&self, pair: TokenPair) {
        let rotated = {
            let mut cell = self.write_cell();
            let Some(session) = cell.session.as_mut() else {
                return;
            };
            session.access_token = pair.access_token;
            session.refresh_token = pair.refresh_token;
            let rotated = session.clone();
            cell.generation += 1;
            rotated
        };
        if let Err(err) = self.store.save(&rotated) {
            warn!(error = %err, "failed to persist refreshed tokens");
        }
        self.events.emit(SessionEvent::Refreshed);
    }

    fn remember_anti_forgery(&self, token: Option<String>) {
        if let Some(session) = self.write_cell().session.as_mut() {
            session.anti_forgery_token = token;
        }
    }

    /// Drop tokens from memory and storage. Requests dispatched afterwards
    /// carry no bearer token.
    fn destroy_session(&self, event: SessionEvent) {
        let had_session = {
            let mut cell = self.write_cell();
            cell.generation += 1;
            cell.session.take().is_some()
        };
        if let Err(err) = self.store.clear() {
            warn!(error = %err, "failed to clear persisted session");
        }
        if had_session || event == SessionEvent::LoggedOut {
            self.events.emit(event);
        }
    }

    fn read_cell(&self) -> RwLockReadGuard<'_, SessionCell> {
        self.cell.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cell(&self) -> RwLockWriteGuard<'_, SessionCell> {
        self.cell.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn classify(
    result: &Result<TransportResponse, TransportError>,
    policy: Policy,
    has_handshake: bool,
) -> AttemptOutcome {
    match result {
        Ok(_) => AttemptOutcome::Ok,
        Err(TransportError::Status { status, .. }) => match classify_http_status(*status) {
            StatusClass::AuthExpired if policy.refresh => AttemptOutcome::RetryableAuth,
            StatusClass::HandshakeMismatch if has_handshake => AttemptOutcome::RetryableHandshake,
            _ => AttemptOutcome::Fatal,
        },
        Err(_) => AttemptOutcome::Fatal,
    }
}

/// Accept both bare payloads and `{ "data": ... }` wrappers.
fn decode_payload<T: DeserializeOwned>(body: &Value) -> Result<T, serde_json::Error> {
    match serde_json::from_value(body.clone()) {
        Ok(value) => Ok(value),
        Err(err) => match body.get("data") {
            Some(inner) => serde_json::from_value(inner.clone()),
            None => Err(err),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex as StdMutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use storefront_platform::InMemorySessionStore;
    use tokio::sync::Barrier;

    use super::*;
    use crate::{anti_forgery::StaticTokenSource, transport::RequestBody};

    const FRESH: &str = "access-fresh";

    fn ok(body: Value) -> TransportResponse {
        TransportResponse { status: 200, body }
    }

    fn status(status: u16, body: Value) -> TransportError {
        TransportError::Status { status, body }
    }

    fn session(access: &str) -> Session {
        Session {
            access_token: access.to_owned(),
            refresh_token: "refresh-1".to_owned(),
            user: json!({"id": 7}),
            anti_forgery_token: None,
        }
    }

    /// Token-checking API double.
    #[derive(Default)]
    struct FakeApi {
        valid_token: StdMutex<String>,
        refresh_fails: bool,
        always_unauthorized: bool,
        stale_gate: Option<Barrier>,
        refresh_calls: AtomicUsize,
        requests: StdMutex<Vec<OutgoingRequest>>,
    }

    impl FakeApi {
        fn requests_to(&self, path: &str) -> Vec<OutgoingRequest> {
            self.requests
                .lock()
                .expect("requests")
                .iter()
                .filter(|request| request.path == path)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeApi {
        async fn send(
            &self,
            request: &OutgoingRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.requests.lock().expect("requests").push(request.clone());
            match request.path.as_str() {
                "/auth/refresh" => {
                    self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    if self.refresh_fails {
                        return Err(status(401, json!({"message": "refresh token revoked"})));
                    }
                    *self.valid_token.lock().expect("token") = FRESH.to_owned();
                    Ok(ok(json!({"accessToken": FRESH, "refreshToken": "refresh-2"})))
                }
                "/auth/login" => {
                    let RequestBody::Json(body) = &request.body else {
                        return Err(status(400, Value::Null));
                    };
                    if body["password"] == "secret" {
                        Ok(ok(json!({"data": {
                            "accessToken": FRESH,
                            "refreshToken": "refresh-1",
                            "user": {"id": 7}
                        }})))
                    } else {
                        Err(status(401, json!({"message": "invalid credentials"})))
                    }
                }
                "/auth/logout" => Err(TransportError::Network("connection reset".to_owned())),
                _ => {
                    let expected = format!("Bearer {}", self.valid_token.lock().expect("token"));
                    if !self.always_unauthorized
                        && request.header(AUTHORIZATION) == Some(expected.as_str())
                    {
                        return Ok(ok(json!({"path": request.path})));
                    }
                    if let Some(gate) = &self.stale_gate {
                        gate.wait().await;
                    }
                    Err(status(401, json!({"message": "Unauthenticated."})))
                }
            }
        }
    }

    fn guard_with(api: &Arc<FakeApi>, store: &InMemorySessionStore) -> SessionGuard {
        SessionGuard::new(
            BackendRoute::new(api.clone()),
            Arc::new(store.clone()),
        )
    }

    fn drain(events: &mut EventStream<SessionEvent>) -> Vec<SessionEvent> {
        let mut received = Vec::new();
        while let Ok(event) = events.try_recv() {
            received.push(event);
        }
        received
    }

    #[tokio::test]
    async fn concurrent_expiries_share_one_refresh() {
        let api = Arc::new(FakeApi {
            stale_gate: Some(Barrier::new(5)),
            ..FakeApi::default()
        });
        let store = InMemorySessionStore::default();
        store.save(&session("access-stale")).expect("seed");
        let guard = guard_with(&api, &store);
        guard.restore().expect("restore");

        let request = OutgoingRequest::get("/orders");
        let (a, b, c, d, e) = tokio::join!(
            guard.send(Backend::Primary, &request),
            guard.send(Backend::Primary, &request),
            guard.send(Backend::Primary, &request),
            guard.send(Backend::Primary, &request),
            guard.send(Backend::Primary, &request),
        );

        for result in [a, b, c, d, e] {
            assert_eq!(result.expect("replay succeeds").status, 200);
        }
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.requests_to("/orders").len(), 10);
        assert_eq!(guard.access_token().as_deref(), Some(FRESH));
        assert_eq!(
            store.load().expect("load").map(|s| s.refresh_token),
            Some("refresh-2".to_owned())
        );
    }

    #[tokio::test]
    async fn replay_is_attempted_at_most_once() {
        let api = Arc::new(FakeApi {
            always_unauthorized: true,
            ..FakeApi::default()
        });
        let store = InMemorySessionStore::default();
        store.save(&session("access-stale")).expect("seed");
        let guard = guard_with(&api, &store);
        guard.restore().expect("restore");
        let mut events = guard.subscribe();

        let err = guard
            .send(Backend::Primary, &OutgoingRequest::get("/orders"))
            .await
            .expect_err("second 401 is final");

        assert_eq!(err, ClientError::AuthExpired);
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.requests_to("/orders").len(), 2);
        assert!(!guard.is_authenticated());
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::Refreshed, SessionEvent::Invalidated]
        );
    }

    #[tokio::test]
    async fn failed_refresh_tears_the_session_down() {
        let api = Arc::new(FakeApi {
            refresh_fails: true,
            ..FakeApi::default()
        });
        let store = InMemorySessionStore::default();
        store.save(&session("access-stale")).expect("seed");
        let guard = guard_with(&api, &store);
        guard.restore().expect("restore");
        let mut events = guard.subscribe();

        let err = guard
            .send(Backend::Primary, &OutgoingRequest::get("/orders"))
            .await
            .expect_err("refresh fails");
        assert_eq!(err, ClientError::AuthExpired);
        assert_eq!(drain(&mut events), vec![SessionEvent::Invalidated]);
        assert!(store.load().expect("load").is_none());

        let _ = guard
            .send(Backend::Primary, &OutgoingRequest::get("/orders/1"))
            .await;
        let later = api.requests_to("/orders/1");
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].header(AUTHORIZATION), None);
    }

    #[tokio::test]
    async fn login_installs_session_and_bad_credentials_skip_refresh() {
        let api = Arc::new(FakeApi::default());
        let store = InMemorySessionStore::default();
        let guard = guard_with(&api, &store);
        let mut events = guard.subscribe();

        let err = guard
            .login(json!({"email": "a@example.com", "password": "wrong"}))
            .await
            .expect_err("rejected");
        assert_eq!(err.status(), Some(401));
        assert_eq!(err.code(), "application_error");
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 0);

        let session = guard
            .login(json!({"email": "a@example.com", "password": "secret"}))
            .await
            .expect("login");
        assert_eq!(session.user, json!({"id": 7}));
        assert_eq!(store.load().expect("load"), Some(session));
        assert_eq!(drain(&mut events), vec![SessionEvent::Established]);

        *api.valid_token.lock().expect("token") = FRESH.to_owned();
        let response = guard
            .send(Backend::Primary, &OutgoingRequest::get("/me"))
            .await
            .expect("authorized");
        assert_eq!(response.body, json!({"path": "/me"}));
    }

    #[tokio::test]
    async fn logout_clears_locally_even_when_server_call_fails() {
        let api = Arc::new(FakeApi::default());
        let store = InMemorySessionStore::default();
        store.save(&session("access-1")).expect("seed");
        let guard = guard_with(&api, &store);
        guard.restore().expect("restore");
        let mut events = guard.subscribe();

        guard.logout().await;

        assert!(guard.current_session().is_none());
        assert!(store.load().expect("load").is_none());
        assert_eq!(drain(&mut events), vec![SessionEvent::LoggedOut]);
        assert_eq!(api.requests_to("/auth/logout").len(), 1);
    }

    /// Anti-forgery protected backend double.
    struct FakeAdmin {
        source: StaticTokenSource,
        bootstrap_sets: Option<&'static str>,
        bootstraps: AtomicUsize,
        requests: StdMutex<Vec<OutgoingRequest>>,
    }

    #[async_trait]
    impl Transport for FakeAdmin {
        async fn send(
            &self,
            request: &OutgoingRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.requests.lock().expect("requests").push(request.clone());
            if request.path == "/sanctum/csrf-cookie" {
                self.bootstraps.fetch_add(1, Ordering::SeqCst);
                self.source.set(self.bootstrap_sets.map(str::to_owned));
                return Ok(TransportResponse {
                    status: 204,
                    body: Value::Null,
                });
            }
            if request.header("X-XSRF-TOKEN") == Some("csrf-fresh") {
                Ok(ok(json!({"saved": true})))
            } else {
                Err(status(419, json!({"message": "CSRF token mismatch."})))
            }
        }
    }

    fn admin_guard(bootstrap_sets: Option<&'static str>) -> (SessionGuard, Arc<FakeAdmin>) {
        let source = StaticTokenSource::default();
        source.set(Some("csrf-stale".to_owned()));
        let admin = Arc::new(FakeAdmin {
            source: source.clone(),
            bootstrap_sets,
            bootstraps: AtomicUsize::new(0),
            requests: StdMutex::new(Vec::new()),
        });
        let store = InMemorySessionStore::default();
        store.save(&session("access-1")).expect("seed");
        let guard = SessionGuard::new(
            BackendRoute::new(Arc::new(FakeApi::default())),
            Arc::new(store),
        )
        .with_secondary(
            BackendRoute::new(admin.clone())
                .with_handshake(HandshakeConfig::default(), Arc::new(source)),
        );
        guard.restore().expect("restore");
        (guard, admin)
    }

    #[tokio::test]
    async fn handshake_mismatch_renews_token_and_replays() {
        let (guard, admin) = admin_guard(Some("csrf-fresh"));
        let request = OutgoingRequest::post_json("/products", json!({"name": "Mug"}));

        let response = guard
            .send(Backend::Secondary, &request)
            .await
            .expect("replay succeeds");

        assert_eq!(response.body, json!({"saved": true}));
        assert_eq!(admin.bootstraps.load(Ordering::SeqCst), 1);
        let sent = admin.requests.lock().expect("requests").clone();
        let products: Vec<_> = sent.iter().filter(|r| r.path == "/products").collect();
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].header("X-XSRF-TOKEN"), Some("csrf-stale"));
        assert_eq!(products[1].header("X-XSRF-TOKEN"), Some("csrf-fresh"));
        assert_eq!(products[1].header(AUTHORIZATION), Some("Bearer access-1"));
        assert_eq!(
            guard.current_session().and_then(|s| s.anti_forgery_token),
            Some("csrf-fresh".to_owned())
        );
    }

    #[tokio::test]
    async fn failed_renewal_surfaces_original_rejection_and_keeps_session() {
        let (guard, admin) = admin_guard(None);

        let err = guard
            .send(Backend::Secondary, &OutgoingRequest::get("/products"))
            .await
            .expect_err("renewal fails");

        assert_eq!(
            err,
            ClientError::HandshakeFailed {
                status: 419,
                body: json!({"message": "CSRF token mismatch."}),
            }
        );
        assert_eq!(admin.bootstraps.load(Ordering::SeqCst), 1);
        assert!(guard.is_authenticated());
    }

    /// Backend that checks both the anti-forgery header and the bearer token.
    struct FakeStrictAdmin {
        source: StaticTokenSource,
        bootstraps: AtomicUsize,
        requests: StdMutex<Vec<OutgoingRequest>>,
    }

    #[async_trait]
    impl Transport for FakeStrictAdmin {
        async fn send(
            &self,
            request: &OutgoingRequest,
        ) -> Result<TransportResponse, TransportError> {
            self.requests.lock().expect("requests").push(request.clone());
            if request.path == "/sanctum/csrf-cookie" {
                self.bootstraps.fetch_add(1, Ordering::SeqCst);
                self.source.set(Some("csrf-fresh".to_owned()));
                return Ok(TransportResponse {
                    status: 204,
                    body: Value::Null,
                });
            }
            if request.header("X-XSRF-TOKEN") != Some("csrf-fresh") {
                return Err(status(419, json!({"message": "CSRF token mismatch."})));
            }
            let expected = format!("Bearer {FRESH}");
            if request.header(AUTHORIZATION) != Some(expected.as_str()) {
                return Err(status(401, json!({"message": "Unauthenticated."})));
            }
            Ok(ok(json!({"saved": true})))
        }
    }

    #[tokio::test]
    async fn expired_token_after_handshake_renewal_still_refreshes() {
        let api = Arc::new(FakeApi::default());
        let source = StaticTokenSource::default();
        source.set(Some("csrf-stale".to_owned()));
        let admin = Arc::new(FakeStrictAdmin {
            source: source.clone(),
            bootstraps: AtomicUsize::new(0),
            requests: StdMutex::new(Vec::new()),
        });
        let store = InMemorySessionStore::default();
        store.save(&session("access-stale")).expect("seed");
        let guard = guard_with(&api, &store).with_secondary(
            BackendRoute::new(admin.clone())
                .with_handshake(HandshakeConfig::default(), Arc::new(source)),
        );
        guard.restore().expect("restore");
        let mut events = guard.subscribe();

        let response = guard
            .send(Backend::Secondary, &OutgoingRequest::get("/products"))
            .await
            .expect("both recoveries succeed");

        assert_eq!(response.body, json!({"saved": true}));
        assert_eq!(admin.bootstraps.load(Ordering::SeqCst), 1);
        assert_eq!(api.refresh_calls.load(Ordering::SeqCst), 1);
        let sent = admin.requests.lock().expect("requests").clone();
        assert_eq!(sent.iter().filter(|r| r.path == "/products").count(), 3);
        assert!(guard.is_authenticated());
        assert_eq!(guard.access_token().as_deref(), Some(FRESH));
        assert_eq!(drain(&mut events), vec![SessionEvent::Refreshed]);
    }

    #[tokio::test]
    async fn status_419_without_handshake_is_an_application_error() {
        let source = StaticTokenSource::default();
        let admin = Arc::new(FakeAdmin {
            source,
            bootstrap_sets: None,
            bootstraps: AtomicUsize::new(0),
            requests: StdMutex::new(Vec::new()),
        });
        let guard = SessionGuard::new(
            BackendRoute::new(admin.clone()),
            Arc::new(InMemorySessionStore::default()),
        );

        let err = guard
            .send(Backend::Primary, &OutgoingRequest::get("/products"))
            .await
            .expect_err("no recovery");
        assert_eq!(err.status(), Some(419));
        assert_eq!(err.code(), "application_error");
        assert_eq!(admin.bootstraps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn secondary_backend_must_be_configured() {
        let guard = SessionGuard::new(
            BackendRoute::new(Arc::new(FakeApi::default())),
            Arc::new(InMemorySessionStore::default()),
        );
        let err = guard
            .send(Backend::Secondary, &OutgoingRequest::get("/x"))
            .await
            .expect_err("missing backend");
        assert_eq!(err.code(), "internal_error");
    }
}

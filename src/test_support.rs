//! Shared fakes for unit tests.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::api::{ApiClient, ApiRequest, ApiResponse, Transport, TransportError};
use crate::auth::backend::{AuthBackend, BackendError, IssuedToken};
use crate::auth::codec;
use crate::auth::expiry::now_unix;
use crate::auth::refresh::{RefreshCoordinator, DEFAULT_REFRESH_TIMEOUT};
use crate::auth::session::{SessionManager, SessionSettings};
use crate::auth::tokens::{MemoryTokenStore, SessionRecord, StoreError, TokenStore};
use crate::models::Claims;

static TOKEN_SEQ: AtomicU64 = AtomicU64::new(0);

/// A three-segment token expiring `ttl_secs` from now. Every call yields a
/// distinct string.
pub fn mint_token(sub: &str, role: &str, ttl_secs: i64) -> String {
    let now = now_unix();
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = serde_json::json!({
        "sub": sub,
        "role": role,
        "iat": now,
        "exp": now + ttl_secs,
        "jti": TOKEN_SEQ.fetch_add(1, Ordering::SeqCst),
    });
    let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
    format!("{}.{}.sig", header, payload)
}

#[derive(Clone)]
pub enum RefreshPlan {
    /// A fresh counselor token per call.
    Mint,
    Issue(IssuedToken),
    Fail(u16),
    Hang,
}

pub struct MockBackend {
    login: Mutex<Option<Result<IssuedToken, BackendError>>>,
    refresh: Mutex<RefreshPlan>,
    refresh_delay: Duration,
    logout_delay: Duration,
    logout_fails: Mutex<bool>,
    login_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    logout_calls: AtomicUsize,
    refresh_seen: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            login: Mutex::new(None),
            refresh: Mutex::new(RefreshPlan::Mint),
            refresh_delay: Duration::ZERO,
            logout_delay: Duration::ZERO,
            logout_fails: Mutex::new(false),
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            logout_calls: AtomicUsize::new(0),
            refresh_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_refresh_delay(mut self, delay: Duration) -> Self {
        self.refresh_delay = delay;
        self
    }

    pub fn with_logout_delay(mut self, delay: Duration) -> Self {
        self.logout_delay = delay;
        self
    }

    pub fn set_login(&self, result: Result<IssuedToken, BackendError>) {
        *self.login.lock().unwrap() = Some(result);
    }

    pub fn set_refresh(&self, plan: RefreshPlan) {
        *self.refresh.lock().unwrap() = plan;
    }

    pub fn fail_logout(&self) {
        *self.logout_fails.lock().unwrap() = true;
    }

    pub fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> usize {
        self.logout_calls.load(Ordering::SeqCst)
    }

    /// Wait until `n` backend logouts have started; they may run on
    /// their own task.
    pub async fn wait_for_logout_calls(&self, n: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(1), async {
            while self.logout_calls() < n {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(waited.is_ok(), "backend logout was never called");
    }

    pub fn refresh_seen(&self) -> Vec<String> {
        self.refresh_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl AuthBackend for MockBackend {
    async fn login(&self, _identifier: &str, _secret: &str) -> Result<IssuedToken, BackendError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let configured = self.login.lock().unwrap().clone();
        configured.unwrap_or_else(|| Ok(IssuedToken::new(mint_token("1", "counselor", 3600))))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<IssuedToken, BackendError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        self.refresh_seen
            .lock()
            .unwrap()
            .push(refresh_token.to_string());
        if !self.refresh_delay.is_zero() {
            tokio::time::sleep(self.refresh_delay).await;
        }

        let plan = self.refresh.lock().unwrap().clone();
        match plan {
            RefreshPlan::Mint => Ok(IssuedToken::new(mint_token("1", "counselor", 3600))),
            RefreshPlan::Issue(issued) => Ok(issued),
            RefreshPlan::Fail(status) => Err(BackendError::Rejected {
                status,
                body: "refresh failed".into(),
            }),
            RefreshPlan::Hang => std::future::pending().await,
        }
    }

    async fn logout(&self, _access_token: &str) -> Result<(), BackendError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        if !self.logout_delay.is_zero() {
            tokio::time::sleep(self.logout_delay).await;
        }
        if *self.logout_fails.lock().unwrap() {
            return Err(BackendError::Network("connection reset".into()));
        }
        Ok(())
    }
}

/// In-memory store that counts writes and clears.
#[derive(Default)]
pub struct CountingStore {
    inner: MemoryTokenStore,
    saves: AtomicUsize,
    clears: AtomicUsize,
}

impl CountingStore {
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl TokenStore for CountingStore {
    fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save(record)
    }

    fn load(&self) -> Result<Option<SessionRecord>, StoreError> {
        self.inner.load()
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.inner.clear()
    }

    fn update_access_token(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        user: &Claims,
    ) -> Result<(), StoreError> {
        self.inner
            .update_access_token(access_token, refresh_token, user)
    }
}

type Responder =
    Box<dyn Fn(&ApiRequest, Option<&str>) -> Result<ApiResponse, TransportError> + Send + Sync>;

/// Transport answering from a closure and recording `(path, bearer)` per send.
pub struct MockTransport {
    responder: Responder,
    seen: Mutex<Vec<(String, Option<String>)>>,
    /// Responses for this path arrive only after the delay.
    slow_path: Option<(String, Duration)>,
}

impl MockTransport {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&ApiRequest, Option<&str>) -> Result<ApiResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            responder: Box::new(responder),
            seen: Mutex::new(Vec::new()),
            slow_path: None,
        }
    }

    pub fn with_slow_path(mut self, path: &str, delay: Duration) -> Self {
        self.slow_path = Some((path.to_string(), delay));
        self
    }

    pub fn seen(&self) -> Vec<(String, Option<String>)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        request: &ApiRequest,
        bearer: Option<&str>,
    ) -> Result<ApiResponse, TransportError> {
        tokio::task::yield_now().await;
        self.seen
            .lock()
            .unwrap()
            .push((request.path.clone(), bearer.map(str::to_string)));
        if let Some((path, delay)) = &self.slow_path {
            if *path == request.path {
                tokio::time::sleep(*delay).await;
            }
        }
        (self.responder)(request, bearer)
    }
}

/// A fully wired request stack over fakes.
pub struct Harness {
    pub session: Arc<SessionManager>,
    pub refresher: Arc<RefreshCoordinator>,
    pub api: ApiClient,
    pub store: Arc<CountingStore>,
    pub backend: Arc<MockBackend>,
    pub transport: Arc<MockTransport>,
}

impl Harness {
    pub fn new(backend: MockBackend, transport: MockTransport) -> Self {
        Self::with_refresh_timeout(backend, transport, DEFAULT_REFRESH_TIMEOUT)
    }

    pub fn with_refresh_timeout(
        backend: MockBackend,
        transport: MockTransport,
        timeout: Duration,
    ) -> Self {
        let store = Arc::new(CountingStore::default());
        let backend = Arc::new(backend);
        let transport = Arc::new(transport);
        let session = Arc::new(SessionManager::new(
            store.clone(),
            backend.clone(),
            SessionSettings::default(),
        ));
        let refresher = Arc::new(RefreshCoordinator::new(
            session.clone(),
            backend.clone(),
            timeout,
        ));
        let api = ApiClient::new(
            session.clone(),
            refresher.clone(),
            transport.clone(),
            vec![
                "/auth/login".into(),
                "/auth/refresh".into(),
                "/auth/logout".into(),
            ],
        );
        Self {
            session,
            refresher,
            api,
            store,
            backend,
            transport,
        }
    }

    /// Persist and activate a teacher session whose token lives `ttl_secs`.
    pub fn install_session(&self, ttl_secs: i64) -> String {
        let token = mint_token("1", "teacher", ttl_secs);
        let claims = codec::decode(&token).unwrap();
        let record = SessionRecord::new(token.clone(), None, claims);
        self.store.save(&record).unwrap();
        self.session.install(record);
        token
    }
}

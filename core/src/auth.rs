use crate::identity::IdentityStore;
use crate::remote::{ProtocolError, RemoteService};
use crate::signal::{SignalBus, AUTH_SUCCESS_MARKER};
use crate::storage::StorageError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

/// Cached view of the service's answer to "is this installation logged in".
/// Never persisted; re-derived at startup and after every login/logout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    Unknown,
    Unauthenticated,
    Authenticated,
}

impl AuthState {
    pub fn is_authenticated(self) -> bool {
        matches!(self, Self::Authenticated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginOutcome {
    Started,
    AlreadyInFlight,
}

#[derive(thiserror::Error, Debug)]
pub enum AuthFlowError {
    #[error("client identity unavailable: {0}")]
    Identity(#[from] StorageError),
    #[error("could not obtain login url: {0}")]
    LoginUrl(#[source] ProtocolError),
    #[error("could not open login window: {0}")]
    Browser(String),
    #[error("logout failed: {0}")]
    Logout(#[source] ProtocolError),
}

/// Opens the secondary browser context that hosts the external login page.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn open(&self, url: &Url) -> anyhow::Result<()>;
}

/// Drives the login/logout handshake and publishes the resulting state.
#[derive(Clone)]
pub struct AuthCoordinator {
    remote: Arc<dyn RemoteService>,
    identity: IdentityStore,
    browser: Arc<dyn BrowserContext>,
    signals: SignalBus,
    state: Arc<watch::Sender<AuthState>>,
    login_in_flight: Arc<AtomicBool>,
    listener: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AuthCoordinator {
    pub fn new(
        remote: Arc<dyn RemoteService>,
        identity: IdentityStore,
        browser: Arc<dyn BrowserContext>,
        signals: SignalBus,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::Unknown);
        Self {
            remote,
            identity,
            browser,
            signals,
            state: Arc::new(state),
            login_in_flight: Arc::new(AtomicBool::new(false)),
            listener: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> AuthState {
        *self.state.borrow()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated()
    }

    pub fn is_login_in_flight(&self) -> bool {
        self.login_in_flight.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.state.subscribe()
    }

    /// Asks the service for the authoritative status. Any failure resolves to
    /// unauthenticated.
    pub async fn check_status(&self) -> bool {
        let authenticated = match self.identity.get_or_create().await {
            Ok(identity) => match self.remote.check_auth(&identity).await {
                Ok(authenticated) => authenticated,
                Err(err) => {
                    tracing::warn!(%err, "auth check failed; treating as unauthenticated");
                    false
                }
            },
            Err(err) => {
                tracing::warn!(%err, "auth check skipped without identity");
                false
            }
        };
        self.publish(if authenticated {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        });
        authenticated
    }

    /// Opens the login window and waits, in the background, for it to report
    /// back. A second call while a login is pending is ignored.
    pub async fn login(&self) -> Result<LoginOutcome, AuthFlowError> {
        if self
            .login_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("login already in flight; ignoring repeated request");
            return Ok(LoginOutcome::AlreadyInFlight);
        }

        match self.start_login().await {
            Ok(()) => Ok(LoginOutcome::Started),
            Err(err) => {
                self.login_in_flight.store(false, Ordering::SeqCst);
                tracing::warn!(%err, "login could not be started; auth state unchanged");
                Err(err)
            }
        }
    }

    /// Abandons a pending login, e.g. after the user closed the window.
    /// Returns `false` once the window has reported back: the status
    /// re-check then owns the guard and releases it itself.
    pub fn cancel_login(&self) -> bool {
        if let Some(handle) = self.listener.lock().take() {
            if handle.is_finished() {
                return false;
            }
            handle.abort();
        }
        let was_pending = self.login_in_flight.swap(false, Ordering::SeqCst);
        if was_pending {
            tracing::info!("pending login cancelled");
        }
        was_pending
    }

    /// A successful logout acknowledgement is trusted directly; no re-check.
    pub async fn logout(&self) -> Result<(), AuthFlowError> {
        let identity = self.identity.get_or_create().await.map_err(|err| {
            tracing::warn!(%err, "logout skipped without identity");
            AuthFlowError::from(err)
        })?;
        match self.remote.logout(&identity).await {
            Ok(()) => {
                self.publish(AuthState::Unauthenticated);
                tracing::info!("logged out");
                Ok(())
            }
            Err(err) => {
                tracing::warn!(%err, "logout failed; auth state unchanged");
                Err(AuthFlowError::Logout(err))
            }
        }
    }

    async fn start_login(&self) -> Result<(), AuthFlowError> {
        let identity = self.identity.get_or_create().await?;
        let url = self
            .remote
            .login_url(&identity)
            .await
            .map_err(AuthFlowError::LoginUrl)?;

        // Subscribe before the window exists so a fast completion is not missed.
        let signals = self.signals.subscribe();
        self.browser
            .open(&url)
            .await
            .map_err(|err| AuthFlowError::Browser(err.to_string()))?;
        tracing::info!(host = url.host_str().unwrap_or_default(), "login window opened");

        let coordinator = self.clone();
        let handle = tokio::spawn(async move { coordinator.await_completion(signals).await });
        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Listener lifetime ends with the first matching signal.
    async fn await_completion(self, mut signals: broadcast::Receiver<String>) {
        loop {
            match signals.recv().await {
                Ok(payload) if payload == AUTH_SUCCESS_MARKER => break,
                Ok(payload) => {
                    tracing::debug!(%payload, "ignoring unrelated cross-context message");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "cross-context listener lagged");
                }
                Err(RecvError::Closed) => {
                    self.login_in_flight.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
        drop(signals);
        tracing::debug!("login window reported completion; re-checking status");
        // The marker only says the external flow ended, not that it succeeded.
        // Detached from the listener: neither login() nor cancel_login() can
        // abort it. The guard is released only after the answer is published.
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.check_status().await;
            coordinator.login_in_flight.store(false, Ordering::SeqCst);
        });
    }

    fn publish(&self, state: AuthState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(from = ?previous, to = ?state, "auth state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MockRemote, RecordedCall};
    use crate::storage::MemoryStore;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingBrowser {
        opened: Mutex<Vec<Url>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl BrowserContext for RecordingBrowser {
        async fn open(&self, url: &Url) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("no display");
            }
            self.opened.lock().push(url.clone());
            Ok(())
        }
    }

    struct Harness {
        auth: AuthCoordinator,
        remote: Arc<MockRemote>,
        browser: Arc<RecordingBrowser>,
        bus: SignalBus,
    }

    fn harness() -> Harness {
        let remote = Arc::new(MockRemote::new());
        let browser = Arc::new(RecordingBrowser::default());
        let bus = SignalBus::new();
        let identity = IdentityStore::new(Arc::new(MemoryStore::new()));
        let auth = AuthCoordinator::new(remote.clone(), identity, browser.clone(), bus.clone());
        Harness {
            auth,
            remote,
            browser,
            bus,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn starts_unknown_and_fails_closed() {
        let h = harness();
        assert_eq!(h.auth.state(), AuthState::Unknown);
        assert!(!h.auth.is_authenticated());

        h.remote
            .push_auth_check(Err(MockRemote::transport_failure("/auth/check")));
        assert!(!h.auth.check_status().await);
        assert_eq!(h.auth.state(), AuthState::Unauthenticated);
    }

    #[tokio::test]
    async fn check_status_tracks_server_answer() {
        let h = harness();
        h.remote.push_auth_check(Ok(true));
        assert!(h.auth.check_status().await);
        assert_eq!(h.auth.state(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn only_marker_triggers_recheck() {
        let h = harness();
        h.remote.push_auth_check(Ok(true));
        let mut states = h.auth.subscribe();

        assert_eq!(h.auth.login().await.unwrap(), LoginOutcome::Started);
        assert!(h.auth.is_login_in_flight());
        assert_eq!(h.browser.opened.lock().len(), 1);

        h.bus.post("unrelated");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.remote.auth_check_count(), 0);
        assert!(h.auth.is_login_in_flight());

        h.bus.post(AUTH_SUCCESS_MARKER);
        tokio::time::timeout(Duration::from_secs(2), states.changed())
            .await
            .expect("state published")
            .expect("sender alive");
        assert_eq!(*states.borrow(), AuthState::Authenticated);
        assert_eq!(h.remote.auth_check_count(), 1);
        assert!(!h.auth.is_login_in_flight());
    }

    #[tokio::test]
    async fn listener_is_released_after_completion() {
        let h = harness();
        h.auth.login().await.unwrap();
        assert_eq!(h.bus.listener_count(), 1);

        h.bus.post(AUTH_SUCCESS_MARKER);
        let bus = h.bus.clone();
        wait_until(|| bus.listener_count() == 0).await;
        wait_until(|| h.remote.auth_check_count() == 1).await;

        // A later stray marker has nobody left to wake.
        assert_eq!(h.bus.post(AUTH_SUCCESS_MARKER), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.remote.auth_check_count(), 1);
    }

    #[tokio::test]
    async fn repeated_login_opens_one_window() {
        let h = harness();
        assert_eq!(h.auth.login().await.unwrap(), LoginOutcome::Started);
        assert_eq!(h.auth.login().await.unwrap(), LoginOutcome::AlreadyInFlight);
        assert_eq!(h.browser.opened.lock().len(), 1);
        let login_calls = h
            .remote
            .calls()
            .into_iter()
            .filter(|call| matches!(call, RecordedCall::LoginUrl(_)))
            .count();
        assert_eq!(login_calls, 1);
        assert_eq!(h.bus.listener_count(), 1);
    }

    #[tokio::test]
    async fn login_during_recheck_does_not_lose_the_answer() {
        let h = harness();
        h.remote.set_auth_check_delay(Duration::from_millis(100));
        h.remote.push_auth_check(Ok(true));

        h.auth.login().await.unwrap();
        h.bus.post(AUTH_SUCCESS_MARKER);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.remote.auth_check_count(), 1);

        assert!(h.auth.is_login_in_flight());
        assert_eq!(h.auth.login().await.unwrap(), LoginOutcome::AlreadyInFlight);
        assert!(!h.auth.cancel_login());
        assert_eq!(h.browser.opened.lock().len(), 1);

        let auth = h.auth.clone();
        wait_until(|| auth.state() == AuthState::Authenticated).await;
        wait_until(|| !auth.is_login_in_flight()).await;
        assert_eq!(h.remote.auth_check_count(), 1);
        assert_eq!(h.auth.login().await.unwrap(), LoginOutcome::Started);
    }

    #[tokio::test]
    async fn cancel_allows_a_fresh_login() {
        let h = harness();
        h.auth.login().await.unwrap();
        assert!(h.auth.cancel_login());
        assert!(!h.auth.is_login_in_flight());
        let bus = h.bus.clone();
        wait_until(|| bus.listener_count() == 0).await;

        assert_eq!(h.auth.login().await.unwrap(), LoginOutcome::Started);
        assert_eq!(h.browser.opened.lock().len(), 2);
    }

    #[tokio::test]
    async fn login_url_failure_leaves_state_unchanged() {
        let h = harness();
        h.remote
            .push_login_url(Err(MockRemote::transport_failure("/auth/login")));
        let err = h.auth.login().await.expect_err("login url failure");
        assert!(matches!(err, AuthFlowError::LoginUrl(_)));
        assert_eq!(h.auth.state(), AuthState::Unknown);
        assert!(!h.auth.is_login_in_flight());
        assert!(h.browser.opened.lock().is_empty());
        assert_eq!(h.bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn browser_failure_releases_guard() {
        let h = harness();
        h.browser.fail.store(true, Ordering::SeqCst);
        let err = h.auth.login().await.expect_err("browser failure");
        assert!(matches!(err, AuthFlowError::Browser(_)));
        assert!(!h.auth.is_login_in_flight());
        assert_eq!(h.bus.listener_count(), 0);
    }

    #[tokio::test]
    async fn logout_trusts_acknowledgement() {
        let h = harness();
        h.remote.push_auth_check(Ok(true));
        h.auth.check_status().await;

        h.auth.logout().await.expect("logout");
        assert_eq!(h.auth.state(), AuthState::Unauthenticated);
        assert_eq!(h.remote.auth_check_count(), 1);
    }

    #[tokio::test]
    async fn failed_logout_keeps_state() {
        let h = harness();
        h.remote.push_auth_check(Ok(true));
        h.auth.check_status().await;

        h.remote
            .push_logout(Err(MockRemote::transport_failure("/auth/logout")));
        let err = h.auth.logout().await.expect_err("logout failure");
        assert!(matches!(err, AuthFlowError::Logout(_)));
        assert_eq!(h.auth.state(), AuthState::Authenticated);
    }
}

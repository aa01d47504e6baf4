use super::{test_runtime, RecordingBrowser};
use panelchat_core::{
    AuthCoordinator, AuthState, IdentityStore, LoginOutcome, MemoryStore, MockRemote, SignalBus,
    AUTH_SUCCESS_MARKER,
};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    auth: AuthCoordinator,
    remote: Arc<MockRemote>,
    browser: Arc<RecordingBrowser>,
    bus: SignalBus,
}

fn fixture() -> Fixture {
    let remote = Arc::new(MockRemote::new());
    let browser = Arc::new(RecordingBrowser::default());
    let bus = SignalBus::new();
    let identity = IdentityStore::new(Arc::new(MemoryStore::new()));
    let auth = AuthCoordinator::new(remote.clone(), identity, browser.clone(), bus.clone());
    Fixture {
        auth,
        remote,
        browser,
        bus,
    }
}

#[test]
fn network_failure_resolves_unauthenticated() {
    let runtime = test_runtime();
    let f = fixture();
    f.remote
        .push_auth_check(Err(MockRemote::transport_failure("/auth/check")));
    let authenticated = runtime.block_on(async {
        tokio::time::timeout(Duration::from_secs(2), f.auth.check_status())
            .await
            .expect("check resolves")
    });
    assert!(!authenticated);
    assert_eq!(f.auth.state(), AuthState::Unauthenticated);
}

#[test]
fn login_round_trip_reconciles_from_server() {
    let runtime = test_runtime();
    let f = fixture();
    runtime.block_on(async {
        assert!(!f.auth.check_status().await);
        let mut states = f.auth.subscribe();

        f.remote.push_auth_check(Ok(true));
        assert_eq!(f.auth.login().await.unwrap(), LoginOutcome::Started);
        assert_eq!(f.browser.opened.lock().unwrap().len(), 1);

        f.bus.post("unrelated");
        f.bus.post("{\"type\":\"ping\"}");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.remote.auth_check_count(), 1);

        f.bus.post(AUTH_SUCCESS_MARKER);
        tokio::time::timeout(Duration::from_secs(2), states.changed())
            .await
            .expect("re-check published")
            .expect("coordinator alive");
        assert_eq!(*states.borrow(), AuthState::Authenticated);
        assert_eq!(f.remote.auth_check_count(), 2);
        assert!(!f.auth.is_login_in_flight());
    });
}

#[test]
fn marker_alone_does_not_imply_success() {
    let runtime = test_runtime();
    let f = fixture();
    runtime.block_on(async {
        let mut states = f.auth.subscribe();
        f.remote.push_auth_check(Ok(false));
        f.auth.login().await.unwrap();
        f.bus.post(AUTH_SUCCESS_MARKER);
        tokio::time::timeout(Duration::from_secs(2), states.changed())
            .await
            .expect("re-check published")
            .expect("coordinator alive");
        assert_eq!(*states.borrow(), AuthState::Unauthenticated);
    });
}

#[test]
fn repeated_logins_do_not_stack_listeners() {
    let runtime = test_runtime();
    let f = fixture();
    runtime.block_on(async {
        for _ in 0..3 {
            f.auth.login().await.unwrap();
        }
        assert_eq!(f.browser.opened.lock().unwrap().len(), 1);
        assert_eq!(f.bus.listener_count(), 1);

        f.bus.post(AUTH_SUCCESS_MARKER);
        tokio::time::timeout(Duration::from_secs(2), async {
            while f.remote.auth_check_count() < 1 || f.bus.listener_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("listener finished");
        assert_eq!(f.remote.auth_check_count(), 1);

        assert_eq!(f.auth.login().await.unwrap(), LoginOutcome::Started);
        assert_eq!(f.browser.opened.lock().unwrap().len(), 2);
    });
}

#[test]
fn logout_moves_straight_to_unauthenticated() {
    let runtime = test_runtime();
    let f = fixture();
    runtime.block_on(async {
        f.remote.push_auth_check(Ok(true));
        assert!(f.auth.check_status().await);
        f.auth.logout().await.expect("logout");
        assert_eq!(f.auth.state(), AuthState::Unauthenticated);
        assert_eq!(f.remote.auth_check_count(), 1);
    });
}

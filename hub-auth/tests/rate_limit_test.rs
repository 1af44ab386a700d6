mod common;

use common::{client, login_request, TestApp, TestOptions, STRONG_PASSWORD};
use hub_auth::{config::RateLimitConfig, services::AuthError};
use std::time::Duration;

#[tokio::test]
async fn test_repeated_failures_lock_account() {
    // 1. Setup
    let app = TestApp::spawn();
    app.register_verified("mona", "mona@example.com").await;

    // 2. Five wrong passwords
    for _ in 0..5 {
        let result = app
            .auth
            .login(login_request("mona", "Wrong-Password-1"), &client("10.0.0.1"))
            .await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    }

    // 3. Even the right password is refused now
    let locked = app
        .auth
        .login(login_request("mona@example.com", STRONG_PASSWORD), &client("10.0.0.9"))
        .await;
    match locked {
        Err(AuthError::AccountLocked { retry_after_secs }) => {
            assert!(retry_after_secs > 0 && retry_after_secs <= 900)
        }
        other => panic!("expected lockout, got {:?}", other.err()),
    }

    // 4. One audit row and one critical event
    let lockouts = app.store.lockouts().unwrap();
    assert_eq!(lockouts.len(), 1);
    assert_eq!(lockouts[0].email, "mona@example.com");
    assert_eq!(lockouts[0].failure_count, 5);

    let events = app.auth.recent_security_events(None, 50).await.unwrap();
    assert_eq!(
        events.iter().filter(|e| e.event_type == "account_locked").count(),
        1
    );
    assert_eq!(
        events.iter().filter(|e| e.event_type == "login_failure").count(),
        5
    );
}

#[tokio::test]
async fn test_address_limit_expires_with_window() {
    // 1. Setup with a short window
    let app = TestApp::spawn_with(
        TestOptions {
            rate_limit: RateLimitConfig {
                max_attempts: 5,
                window_seconds: 2,
                lockout_seconds: 2,
            },
            ..Default::default()
        },
        |gateway| gateway,
    );
    app.register_verified("mona", "mona@example.com").await;

    // 2. Spray unknown accounts from one address
    for n in 0..5 {
        let result = app
            .auth
            .login(
                login_request(&format!("ghost{}", n), STRONG_PASSWORD),
                &client("10.9.9.9"),
            )
            .await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    }
    assert_eq!(app.store.login_attempt_count().unwrap(), 5);

    // 3. The address is limited, the account is not
    let limited = app
        .auth
        .login(login_request("mona", STRONG_PASSWORD), &client("10.9.9.9"))
        .await;
    assert!(matches!(limited, Err(AuthError::RateLimited { .. })));

    app.auth
        .login(login_request("mona", STRONG_PASSWORD), &client("10.0.0.2"))
        .await
        .expect("Other addresses are unaffected");

    // 4. The window slides past the failures
    tokio::time::sleep(Duration::from_millis(2100)).await;
    app.auth
        .login(login_request("mona", STRONG_PASSWORD), &client("10.9.9.9"))
        .await
        .expect("Limit should have expired");
}

#[tokio::test]
async fn test_lockout_releases_after_window() {
    let app = TestApp::spawn_with(
        TestOptions {
            rate_limit: RateLimitConfig {
                max_attempts: 3,
                window_seconds: 5,
                lockout_seconds: 5,
            },
            ..Default::default()
        },
        |gateway| gateway,
    );
    app.register_verified("mona", "mona@example.com").await;

    for _ in 0..3 {
        let _ = app
            .auth
            .login(login_request("mona", "Wrong-Password-1"), &client("10.0.0.1"))
            .await;
    }
    assert!(matches!(
        app.auth
            .login(login_request("mona", STRONG_PASSWORD), &client("10.0.0.1"))
            .await,
        Err(AuthError::AccountLocked { .. })
    ));

    tokio::time::sleep(Duration::from_millis(5100)).await;
    app.login("mona", STRONG_PASSWORD).await;
}

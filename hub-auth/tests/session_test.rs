mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{client, login_request, TestApp, TestOptions, STRONG_PASSWORD};
use hub_auth::{
    config::SessionConfig,
    dtos::LoginRequest,
    models::SecurityFlags,
    services::AuthError,
};
use std::time::Duration;

#[tokio::test]
async fn test_refresh_rotates_secret() {
    // 1. Setup
    let app = TestApp::spawn();
    let user = app.register_verified("mona", "mona@example.com").await;
    let login = app.login("mona", STRONG_PASSWORD).await;

    // 2. Rotate
    let rotated = app.auth.refresh_token(&login.refresh_token).await.unwrap();
    assert_ne!(rotated.refresh_token, login.refresh_token);
    assert_eq!(rotated.user.id, user.id);
    app.auth.verify_token(&rotated.access_token).await.unwrap();

    // 3. The old secret is dead, the new one works
    assert!(matches!(
        app.auth.refresh_token(&login.refresh_token).await,
        Err(AuthError::InvalidToken)
    ));
    app.auth.refresh_token(&rotated.refresh_token).await.unwrap();

    // Still one logical session
    assert_eq!(app.auth.list_sessions(user.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_refresh_has_single_winner() {
    let app = TestApp::spawn();
    app.register_verified("mona", "mona@example.com").await;
    let login = app.login("mona", STRONG_PASSWORD).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let auth = app.auth.clone();
            let token = login.refresh_token.clone();
            tokio::spawn(async move { auth.refresh_token(&token).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(AuthError::InvalidToken) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_session_cap_evicts_least_recently_used() {
    let app = TestApp::spawn();
    let user = app.register_verified("mona", "mona@example.com").await;

    let mut refresh_tokens = Vec::new();
    for _ in 0..6 {
        refresh_tokens.push(app.login("mona", STRONG_PASSWORD).await.refresh_token);
    }

    assert_eq!(app.auth.list_sessions(user.id).await.unwrap().len(), 5);
    assert!(matches!(
        app.auth.refresh_token(&refresh_tokens[0]).await,
        Err(AuthError::InvalidToken)
    ));
    app.auth.refresh_token(&refresh_tokens[5]).await.unwrap();
}

#[tokio::test]
async fn test_logout_blacklists_access_token() {
    let app = TestApp::spawn();
    app.register_verified("mona", "mona@example.com").await;
    let login = app.login("mona", STRONG_PASSWORD).await;

    app.auth
        .logout(&login.refresh_token, Some(&login.access_token))
        .await
        .unwrap();

    assert!(app
        .auth
        .blacklist()
        .is_token_blacklisted(&login.access_token)
        .await
        .unwrap());
    assert!(matches!(
        app.auth.verify_token(&login.access_token).await,
        Err(AuthError::InvalidToken)
    ));
    assert!(matches!(
        app.auth.refresh_token(&login.refresh_token).await,
        Err(AuthError::InvalidToken)
    ));

    // A second logout with the same secret finds nothing to revoke
    assert!(matches!(
        app.auth.logout(&login.refresh_token, None).await,
        Err(AuthError::InvalidToken)
    ));
}

#[tokio::test]
async fn test_fourth_address_flags_session() {
    let app = TestApp::spawn();
    let user = app.register_verified("mona", "mona@example.com").await;

    for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"] {
        app.auth
            .login(login_request("mona", STRONG_PASSWORD), &client(ip))
            .await
            .unwrap();
    }

    let sessions = app.auth.list_sessions(user.id).await.unwrap();
    let flags_for = |ip: &str| {
        sessions
            .iter()
            .find(|s| s.ip_address == ip)
            .map(|s| s.security_flags)
            .unwrap()
    };
    assert!(!flags_for("10.0.0.3").contains(SecurityFlags::SUSPICIOUS));
    assert!(flags_for("10.0.0.4").contains(SecurityFlags::SUSPICIOUS));

    let events = app.auth.recent_security_events(Some(user.id), 50).await.unwrap();
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type == "suspicious_activity")
            .count(),
        1
    );
}

#[tokio::test]
async fn test_remember_me_extends_lifetime() {
    let app = TestApp::spawn();
    let user = app.register_verified("mona", "mona@example.com").await;

    app.auth
        .login(
            LoginRequest {
                remember_me: true,
                ..login_request("mona", STRONG_PASSWORD)
            },
            &client("10.0.0.1"),
        )
        .await
        .unwrap();

    let sessions = app.auth.list_sessions(user.id).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].expires_at > Utc::now() + ChronoDuration::days(89));
}

#[tokio::test]
async fn test_idle_session_is_revoked_on_refresh() {
    let app = TestApp::spawn_with(
        TestOptions {
            session: SessionConfig {
                idle_timeout_minutes: 0,
                ..SessionConfig::default()
            },
            ..Default::default()
        },
        |gateway| gateway,
    );
    let user = app.register_verified("mona", "mona@example.com").await;
    let login = app.login("mona", STRONG_PASSWORD).await;

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(matches!(
        app.auth.refresh_token(&login.refresh_token).await,
        Err(AuthError::InvalidToken)
    ));
    assert!(app.auth.list_sessions(user.id).await.unwrap().is_empty());
}

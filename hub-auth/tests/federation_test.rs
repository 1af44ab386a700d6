mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{
    client, login_request, saml_config, saml_response, signed_assertion, unsigned_assertion,
    AssertionFields, TestApp, TestOptions, IDP_PRIVATE_KEY, ROGUE_PRIVATE_KEY, STRONG_PASSWORD,
};
use hub_auth::{
    config::{LdapConfig, OAuthProviderConfig, OidcConfig},
    federation::{
        AttributeMapping, ExternalIdentity, FederationError, FederationGateway, InMemoryDirectory,
        LdapAuthenticator, OAuthProvider, OidcProvider, ProviderKind, SamlServiceProvider,
        LDAP_PROVIDER, OIDC_PROVIDER, SAML_PROVIDER,
    },
    services::AuthError,
};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CALLBACK: &str = "https://hub.example.com/auth/callback";

fn federation_error<T: std::fmt::Debug>(result: Result<T, AuthError>) -> FederationError {
    match result {
        Err(AuthError::Federation(e)) => e,
        other => panic!("expected a federation error, got {:?}", other),
    }
}

fn state_param(url: &str) -> String {
    url.split("state=")
        .nth(1)
        .and_then(|rest| rest.split('&').next())
        .map(|s| urlencoding::decode(s).unwrap().into_owned())
        .unwrap()
}

fn github_provider(server: &MockServer) -> OAuthProvider {
    OAuthProvider::new(
        ProviderKind::GitHub,
        &OAuthProviderConfig {
            provider: "github".to_string(),
            client_id: "hub-client".to_string(),
            client_secret: "hub-secret".to_string(),
            base_url: Some(server.uri()),
        },
        reqwest::Client::new(),
    )
}

async fn mount_github_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/login/oauth/access_token"))
        .and(body_string_contains("code=good-code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "gho_token",
            "token_type": "bearer",
            "scope": "read:user,user:email"
        })))
        .mount(server)
        .await;
}

async fn mount_github_profile(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/user"))
        .and(header("authorization", "Bearer gho_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 583231,
            "login": "octocat",
            "name": "The Octocat",
            "email": null
        })))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/user/emails"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"email": "old@octo.example", "primary": false, "verified": true},
            {"email": "octo@octo.example", "primary": true, "verified": true}
        ])))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_github_login_uses_primary_email() {
    // 1. Setup
    let server = MockServer::start().await;
    mount_github_token(&server).await;
    mount_github_profile(&server).await;
    let provider = github_provider(&server);
    let app = TestApp::spawn_with(TestOptions::default(), |g| g.with_oauth(provider));
    let gateway = app.auth.federation();

    // 2. Redirect carries an encoded state
    let redirect = gateway.begin_oauth(ProviderKind::GitHub, CALLBACK).await.unwrap();
    assert!(redirect
        .url
        .starts_with(&format!("{}/login/oauth/authorize?client_id=hub-client", server.uri())));
    assert_eq!(state_param(&redirect.url), redirect.state);

    // 3. Callback
    let identity = gateway
        .complete_oauth(ProviderKind::GitHub, "good-code", &redirect.state)
        .await
        .unwrap();
    assert_eq!(identity.external_id, "583231");
    assert_eq!(identity.email, "octo@octo.example");
    assert_eq!(identity.username, "octocat");
    assert_eq!(
        identity.tokens.as_ref().map(|t| t.access_token.as_str()),
        Some("gho_token")
    );

    let login = app
        .auth
        .complete_federated_login("github", &identity, &client("10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(login.user.username, "octocat");
    assert!(login.user.email_verified);
    app.auth.verify_token(&login.access_token).await.unwrap();

    // 4. The state cannot be replayed
    let replay = gateway
        .complete_oauth(ProviderKind::GitHub, "good-code", &redirect.state)
        .await;
    assert!(matches!(federation_error(replay), FederationError::InvalidState));

    // 5. The link is reused on the next login
    let again = app
        .auth
        .complete_federated_login("github", &identity, &client("10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(again.user.id, login.user.id);
}

#[tokio::test]
async fn test_github_error_response_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login/oauth/access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": "bad_verification_code",
            "error_description": "The code passed is incorrect or expired."
        })))
        .mount(&server)
        .await;
    let provider = github_provider(&server);
    let app = TestApp::spawn_with(TestOptions::default(), |g| g.with_oauth(provider));
    let gateway = app.auth.federation();

    let redirect = gateway.begin_oauth(ProviderKind::GitHub, CALLBACK).await.unwrap();
    let result = gateway
        .complete_oauth(ProviderKind::GitHub, "stale-code", &redirect.state)
        .await;
    assert!(matches!(
        federation_error(result),
        FederationError::CodeExchange(e) if e == "bad_verification_code"
    ));
}

#[tokio::test]
async fn test_unconfigured_provider_rejected() {
    let app = TestApp::spawn();
    let result = app
        .auth
        .federation()
        .begin_oauth(ProviderKind::GitLab, CALLBACK)
        .await;
    assert!(matches!(
        federation_error(result),
        FederationError::ProviderNotConfigured(_)
    ));
}

#[tokio::test]
async fn test_federated_email_links_existing_account() {
    let app = TestApp::spawn();
    let local = app.register_verified("mona", "mona@example.com").await;

    let identity = ExternalIdentity {
        external_id: "gl-77".to_string(),
        email: "MONA@example.com".to_string(),
        username: "mona-gl".to_string(),
        ..Default::default()
    };
    let login = app
        .auth
        .complete_federated_login("gitlab", &identity, &client("10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(login.user.id, local.id);

    // The local password keeps working
    app.login("mona", STRONG_PASSWORD).await;
}

fn oidc_config(server: &MockServer) -> OidcConfig {
    OidcConfig {
        issuer: server.uri(),
        client_id: "hub".to_string(),
        client_secret: "oidc-secret".to_string(),
        scopes: vec!["openid".to_string(), "email".to_string(), "profile".to_string()],
        mapping: AttributeMapping::oidc_default(),
        admin_group: Some("hub-admins".to_string()),
        sync_groups: false,
    }
}

async fn mount_discovery(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": server.uri(),
            "authorization_endpoint": format!("{}/authorize", server.uri()),
            "token_endpoint": format!("{}/token", server.uri()),
            "userinfo_endpoint": format!("{}/userinfo", server.uri()),
            "jwks_uri": format!("{}/jwks", server.uri())
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_oidc_discovery_and_admin_sync() {
    // 1. Setup
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "oidc-access",
            "refresh_token": "oidc-refresh",
            "expires_in": 3600,
            "token_type": "Bearer"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .and(header("authorization", "Bearer oidc-access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sub": "ada-0001",
            "email": "ada@corp.example",
            "preferred_username": "ada",
            "name": "Ada Lovelace",
            "groups": ["staff", "hub-admins"]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sub": "ada-0001",
            "email": "ada@corp.example",
            "preferred_username": "ada",
            "name": "Ada Lovelace",
            "groups": ["staff"]
        })))
        .mount(&server)
        .await;

    let provider = OidcProvider::discover(&oidc_config(&server), reqwest::Client::new())
        .await
        .unwrap();
    let app = TestApp::spawn_with(TestOptions::default(), |g| g.with_oidc(provider));
    let gateway = app.auth.federation();

    // 2. First login grants admin from the group claim
    let redirect = gateway.begin_oidc(CALLBACK).await.unwrap();
    assert!(redirect
        .url
        .starts_with(&format!("{}/authorize?client_id=hub", server.uri())));
    assert!(redirect.url.contains("scope=openid%20email%20profile"));

    let identity = gateway.complete_oidc("code-1", &redirect.state).await.unwrap();
    assert_eq!(identity.external_id, "ada-0001");
    let login = app
        .auth
        .complete_federated_login(OIDC_PROVIDER, &identity, &client("10.0.0.1"))
        .await
        .unwrap();
    assert!(login.user.is_admin);
    assert_eq!(login.user.display_name.as_deref(), Some("Ada Lovelace"));
    assert_eq!(login.user.username, "ada");

    // 3. Leaving the group revokes admin on the next login
    let redirect = gateway.begin_oidc(CALLBACK).await.unwrap();
    let identity = gateway.complete_oidc("code-2", &redirect.state).await.unwrap();
    let login = app
        .auth
        .complete_federated_login(OIDC_PROVIDER, &identity, &client("10.0.0.1"))
        .await
        .unwrap();
    assert!(!login.user.is_admin);

    let events = app.auth.recent_security_events(Some(login.user.id), 20).await.unwrap();
    assert_eq!(
        events.iter().filter(|e| e.event_type == "federated_login").count(),
        2
    );
}

#[tokio::test]
async fn test_oidc_discovery_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let result = OidcProvider::discover(&oidc_config(&server), reqwest::Client::new()).await;
    assert!(matches!(result, Err(FederationError::Discovery(_))));
}

#[tokio::test]
async fn test_oidc_discovery_rejects_foreign_issuer() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/openid-configuration"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "issuer": "https://attacker.example",
            "authorization_endpoint": format!("{}/authorize", server.uri()),
            "token_endpoint": format!("{}/token", server.uri()),
            "userinfo_endpoint": format!("{}/userinfo", server.uri()),
            "jwks_uri": format!("{}/jwks", server.uri())
        })))
        .mount(&server)
        .await;

    let result = OidcProvider::discover(&oidc_config(&server), reqwest::Client::new()).await;
    assert!(matches!(result, Err(FederationError::Discovery(m)) if m.contains("issuer")));

    // A trailing slash on either side is the same issuer
    let server_ok = MockServer::start().await;
    mount_discovery(&server_ok).await;
    let mut config = oidc_config(&server_ok);
    config.issuer = format!("{}/", server_ok.uri());
    assert!(OidcProvider::discover(&config, reqwest::Client::new()).await.is_ok());
}

fn saml_app(allow_idp_initiated: bool) -> TestApp {
    let provider = SamlServiceProvider::new(&saml_config(allow_idp_initiated)).unwrap();
    TestApp::spawn_with(TestOptions::default(), |g: FederationGateway| g.with_saml(provider))
}

#[tokio::test]
async fn test_saml_signed_assertion_accepted() {
    // 1. Setup
    let app = saml_app(false);
    let gateway = app.auth.federation();
    let redirect = gateway.begin_saml().await.unwrap();
    assert!(redirect.url.starts_with("https://idp.example.com/sso?SAMLRequest="));

    // 2. Verify and map
    let fields = AssertionFields::default();
    let response = saml_response(&signed_assertion(&fields, IDP_PRIVATE_KEY));
    let identity = gateway
        .complete_saml(&response, Some(&redirect.state))
        .await
        .unwrap();
    assert_eq!(identity.external_id, "mona@corp.example.com");
    assert_eq!(identity.email, "mona@corp.example.com");
    assert_eq!(identity.groups, vec!["engineering".to_string()]);

    let login = app
        .auth
        .complete_federated_login(SAML_PROVIDER, &identity, &client("10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(login.user.username, "mona");
    assert!(!login.user.is_admin);

    // 3. RelayState is single use
    let replay = gateway.complete_saml(&response, Some(&redirect.state)).await;
    assert!(matches!(federation_error(replay), FederationError::InvalidState));
}

#[tokio::test]
async fn test_saml_inherited_namespace_and_admin_group() {
    let app = saml_app(false);
    let gateway = app.auth.federation();
    let redirect = gateway.begin_saml().await.unwrap();

    let fields = AssertionFields {
        self_declared: false,
        groups: vec!["engineering".to_string(), "hub-admins".to_string()],
        ..Default::default()
    };
    let identity = gateway
        .complete_saml(
            &saml_response(&signed_assertion(&fields, IDP_PRIVATE_KEY)),
            Some(&redirect.state),
        )
        .await
        .unwrap();

    let login = app
        .auth
        .complete_federated_login(SAML_PROVIDER, &identity, &client("10.0.0.1"))
        .await
        .unwrap();
    assert!(login.user.is_admin);
}

#[tokio::test]
async fn test_saml_rejects_forged_and_tampered_assertions() {
    let app = saml_app(true);
    let gateway = app.auth.federation();
    let fields = AssertionFields::default();

    // Signed by a key the IdP does not own
    let forged = saml_response(&signed_assertion(&fields, ROGUE_PRIVATE_KEY));
    assert!(matches!(
        federation_error(gateway.complete_saml(&forged, None).await),
        FederationError::InvalidSignature(_)
    ));

    // Valid signature, edited afterwards
    let tampered = signed_assertion(&fields, IDP_PRIVATE_KEY)
        .replace("mona@corp.example.com", "eve@corp.example.com");
    assert!(matches!(
        federation_error(gateway.complete_saml(&saml_response(&tampered), None).await),
        FederationError::InvalidSignature(_)
    ));

    // No signature at all
    let unsigned = saml_response(&unsigned_assertion(&fields));
    assert!(matches!(
        federation_error(gateway.complete_saml(&unsigned, None).await),
        FederationError::InvalidSignature(_)
    ));

    // The untouched original still verifies
    let genuine = saml_response(&signed_assertion(&fields, IDP_PRIVATE_KEY));
    gateway.complete_saml(&genuine, None).await.unwrap();
}

#[tokio::test]
async fn test_saml_rejects_expired_and_misaddressed_assertions() {
    let app = saml_app(true);
    let gateway = app.auth.federation();

    let expired = AssertionFields {
        not_on_or_after: Utc::now() - ChronoDuration::minutes(10),
        ..Default::default()
    };
    let result = gateway
        .complete_saml(&saml_response(&signed_assertion(&expired, IDP_PRIVATE_KEY)), None)
        .await;
    assert!(matches!(
        federation_error(result),
        FederationError::MalformedResponse(_)
    ));

    let elsewhere = AssertionFields {
        audience: "https://other-sp.example.com".to_string(),
        ..Default::default()
    };
    let result = gateway
        .complete_saml(&saml_response(&signed_assertion(&elsewhere, IDP_PRIVATE_KEY)), None)
        .await;
    assert!(matches!(
        federation_error(result),
        FederationError::MalformedResponse(m) if m.contains("audience")
    ));
}

#[tokio::test]
async fn test_saml_requires_relay_state_unless_idp_initiated() {
    let app = saml_app(false);
    let gateway = app.auth.federation();
    let response = saml_response(&signed_assertion(&AssertionFields::default(), IDP_PRIVATE_KEY));

    assert!(matches!(
        federation_error(gateway.complete_saml(&response, None).await),
        FederationError::InvalidState
    ));
    assert!(matches!(
        federation_error(gateway.complete_saml(&response, Some("made-up")).await),
        FederationError::InvalidState
    ));

    let metadata = gateway.saml_metadata().unwrap();
    assert!(metadata.contains(r#"entityID="https://hub.example.com/saml/metadata""#));
}

const SERVICE_DN: &str = "cn=hub-svc,ou=services,dc=corp,dc=example";
const ADA_DN: &str = "uid=ada,ou=people,dc=corp,dc=example";

fn directory() -> InMemoryDirectory {
    let directory = InMemoryDirectory::new();
    directory.add_entry(SERVICE_DN, "service-secret", &[]);
    directory.add_entry(
        ADA_DN,
        "Analytical-Engine-1",
        &[
            ("uid", &["ada"][..]),
            ("mail", &["ada@corp.example"][..]),
            ("givenName", &["Ada"][..]),
            ("sn", &["Lovelace"][..]),
            ("memberOf", &["cn=hub-admins,ou=groups,dc=corp,dc=example"][..]),
        ],
    );
    directory.add_entry(
        "uid=bob,ou=people,dc=corp,dc=example",
        "Difference-Engine-2",
        &[("uid", &["bob"][..]), ("mail", &["bob@corp.example"][..])],
    );
    directory
}

fn ldap_app(directory: &InMemoryDirectory) -> TestApp {
    let config = LdapConfig {
        url: "ldap://directory.corp.example".to_string(),
        bind_dn: SERVICE_DN.to_string(),
        bind_password: "service-secret".to_string(),
        base_dn: "dc=corp,dc=example".to_string(),
        user_filter: "(uid={username})".to_string(),
        admin_group: Some("hub-admins".to_string()),
        mapping: AttributeMapping::ldap_default(),
        sync_groups: false,
    };
    let authenticator = LdapAuthenticator::new(&config, Arc::new(directory.clone()));
    TestApp::spawn_with(TestOptions::default(), |g| g.with_ldap(authenticator))
}

#[tokio::test]
async fn test_ldap_two_step_bind_login() {
    // 1. Setup
    let directory = directory();
    let app = ldap_app(&directory);

    // 2. Service bind, search, user bind
    let login = app
        .auth
        .login(login_request("ada", "Analytical-Engine-1"), &client("10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(directory.bound_dns(), vec![SERVICE_DN.to_string(), ADA_DN.to_string()]);
    assert_eq!(login.user.email, "ada@corp.example");
    assert!(login.user.is_admin);

    // 3. The directory stays authoritative for the created account
    let again = app
        .auth
        .login(login_request("ada", "Analytical-Engine-1"), &client("10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(again.user.id, login.user.id);

    let identity = app
        .auth
        .federation()
        .authenticate_ldap("bob", "Difference-Engine-2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(identity.external_id, "uid=bob,ou=people,dc=corp,dc=example");
    assert!(app
        .auth
        .federation()
        .resolve_user(LDAP_PROVIDER, &identity)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_ldap_rejections() {
    let directory = directory();
    let app = ldap_app(&directory);

    let wrong = app
        .auth
        .login(login_request("ada", "not-her-password"), &client("10.0.0.1"))
        .await;
    assert!(matches!(wrong, Err(AuthError::InvalidCredentials)));

    // A wildcard is searched for literally
    let wildcard = app
        .auth
        .federation()
        .authenticate_ldap("*", "Analytical-Engine-1")
        .await
        .unwrap();
    assert!(wildcard.is_none());

    let empty = app
        .auth
        .federation()
        .authenticate_ldap("ada", "")
        .await
        .unwrap();
    assert!(empty.is_none());

    // Only the service account ever bound
    assert!(directory.bound_dns().iter().all(|dn| dn == SERVICE_DN));
}

#[tokio::test]
async fn test_local_password_takes_precedence_over_directory() {
    let directory = directory();
    let app = ldap_app(&directory);
    app.register_verified("mona", "mona@example.com").await;

    app.login("mona", STRONG_PASSWORD).await;
    assert!(directory.bound_dns().is_empty());
}

//! Test helpers for hub-auth integration tests.
//!
//! Every test gets a fresh [`MemoryStore`], a recording email/SMS outbox and an
//! [`AuthService`] wired the same way the binary wires it.

#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use hub_auth::{
    config::{JwtConfig, MfaConfig, RateLimitConfig, SamlConfig, SessionConfig},
    dtos::{ClientContext, LoginRequest, LoginResponse, RegisterRequest},
    federation::{
        c14n::{ExclusiveCanonicalizer, ENVELOPED_SIGNATURE, EXC_C14N},
        saml::{ASSERTION_NS, DSIG_NS, PROTOCOL_NS, RSA_SHA256, SHA256_DIGEST, STATUS_SUCCESS},
        AttributeMapping, FederationGateway,
    },
    models::UserInfo,
    services::{
        mfa::build_totp, AuthService, AuthSettings, EmailKind, EmailProvider, MockEmailService,
        RecordingSmsProvider, SmsProvider,
    },
    store::{MemoryStore, Stores},
};
use roxmltree::Document;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub const IDP_PRIVATE_KEY: &str = include_str!("../fixtures/idp_private_key.pem");
pub const IDP_PUBLIC_KEY: &str = include_str!("../fixtures/idp_public_key.pem");
pub const ROGUE_PRIVATE_KEY: &str = include_str!("../fixtures/rogue_private_key.pem");

pub const STRONG_PASSWORD: &str = "Correct-Horse-42";
pub const MFA_ISSUER: &str = "Hub";
pub const SP_ENTITY_ID: &str = "https://hub.example.com/saml/metadata";
pub const IDP_ENTITY_ID: &str = "https://idp.example.com";

pub struct TestOptions {
    pub rate_limit: RateLimitConfig,
    pub session: SessionConfig,
    pub failing_email: bool,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            session: SessionConfig::default(),
            failing_email: false,
        }
    }
}

pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub stores: Stores,
    pub auth: AuthService,
    pub email: Arc<MockEmailService>,
    pub sms: Arc<RecordingSmsProvider>,
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::spawn_with(TestOptions::default(), |gateway| gateway)
    }

    /// `configure` receives a gateway over the test store and may register providers.
    pub fn spawn_with(
        options: TestOptions,
        configure: impl FnOnce(FederationGateway) -> FederationGateway,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let stores = Stores::from_backend(store.clone());

        let email = Arc::new(if options.failing_email {
            MockEmailService::failing()
        } else {
            MockEmailService::new()
        });
        let sms = Arc::new(RecordingSmsProvider::new());

        let gateway = configure(FederationGateway::new(
            stores.users.clone(),
            stores.federation.clone(),
        ));

        let settings = AuthSettings {
            jwt: JwtConfig {
                secret: "integration-test-secret-with-enough-entropy".to_string(),
                access_token_expiry_hours: 1,
            },
            session: options.session,
            rate_limit: options.rate_limit,
            mfa: MfaConfig {
                issuer: MFA_ISSUER.to_string(),
            },
            base_url: "http://localhost:3000".to_string(),
        };

        let auth = AuthService::new(
            settings,
            &stores,
            email.clone() as Arc<dyn EmailProvider>,
            sms.clone() as Arc<dyn SmsProvider>,
            Arc::new(gateway),
        )
        .expect("Failed to build auth service");

        Self {
            store,
            stores,
            auth,
            email,
            sms,
        }
    }

    /// Register an account and confirm its email through the mailed token.
    pub async fn register_verified(&self, username: &str, email: &str) -> UserInfo {
        let response = self
            .auth
            .register(
                RegisterRequest {
                    username: username.to_string(),
                    email: email.to_string(),
                    password: STRONG_PASSWORD.to_string(),
                    display_name: None,
                },
                &client("10.0.0.1"),
            )
            .await
            .expect("Registration failed");

        let token = self
            .email
            .last_token(email, EmailKind::Verification)
            .expect("No verification email sent");
        self.auth
            .verify_email(&token)
            .await
            .expect("Email verification failed");

        response.user
    }

    pub async fn login(&self, login: &str, password: &str) -> LoginResponse {
        self.auth
            .login(login_request(login, password), &client("10.0.0.1"))
            .await
            .expect("Login failed")
    }
}

pub fn client(ip: &str) -> ClientContext {
    ClientContext::new(ip, "Mozilla/5.0 (X11; Linux x86_64) Firefox/126.0")
}

pub fn login_request(login: &str, password: &str) -> LoginRequest {
    LoginRequest {
        login: login.to_string(),
        password: password.to_string(),
        mfa_code: None,
        remember_me: false,
    }
}

pub fn current_totp(secret: &str, email: &str) -> String {
    build_totp(secret, MFA_ISSUER, email)
        .expect("Invalid TOTP secret")
        .generate_current()
        .expect("System clock before epoch")
}

pub fn saml_config(allow_idp_initiated: bool) -> SamlConfig {
    SamlConfig {
        sp_entity_id: SP_ENTITY_ID.to_string(),
        acs_url: "https://hub.example.com/saml/acs".to_string(),
        idp_entity_id: IDP_ENTITY_ID.to_string(),
        idp_sso_url: "https://idp.example.com/sso".to_string(),
        idp_public_key_pem: IDP_PUBLIC_KEY.to_string(),
        allow_idp_initiated,
        clock_skew_seconds: 60,
        mapping: AttributeMapping::saml_default(),
        admin_group: Some("hub-admins".to_string()),
        sync_groups: false,
    }
}

/// Contents of a test assertion.
#[derive(Debug, Clone)]
pub struct AssertionFields {
    pub id: String,
    pub name_id: String,
    pub email: String,
    pub groups: Vec<String>,
    pub audience: String,
    pub not_on_or_after: DateTime<Utc>,
    /// Declare the `saml` prefix on the Assertion itself instead of inheriting it.
    pub self_declared: bool,
}

impl Default for AssertionFields {
    fn default() -> Self {
        Self {
            id: "_assertion-1".to_string(),
            name_id: "mona@corp.example.com".to_string(),
            email: "mona@corp.example.com".to_string(),
            groups: vec!["engineering".to_string()],
            audience: SP_ENTITY_ID.to_string(),
            not_on_or_after: Utc::now() + Duration::minutes(5),
            self_declared: true,
        }
    }
}

fn instant(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn unsigned_assertion(fields: &AssertionFields) -> String {
    let declaration = if fields.self_declared {
        format!(r#" xmlns:saml="{}""#, ASSERTION_NS)
    } else {
        String::new()
    };
    let groups: String = fields
        .groups
        .iter()
        .map(|g| format!("<saml:AttributeValue>{}</saml:AttributeValue>", g))
        .collect();

    format!(
        concat!(
            r#"<saml:Assertion{} ID="{}" Version="2.0" IssueInstant="{}">"#,
            r#"<saml:Issuer>{}</saml:Issuer>"#,
            r#"<saml:Subject><saml:NameID>{}</saml:NameID>"#,
            r#"<saml:SubjectConfirmation Method="urn:oasis:names:tc:SAML:2.0:cm:bearer">"#,
            r#"<saml:SubjectConfirmationData NotOnOrAfter="{}"/></saml:SubjectConfirmation></saml:Subject>"#,
            r#"<saml:Conditions NotBefore="{}" NotOnOrAfter="{}">"#,
            r#"<saml:AudienceRestriction><saml:Audience>{}</saml:Audience></saml:AudienceRestriction>"#,
            r#"</saml:Conditions>"#,
            r#"<saml:AttributeStatement>"#,
            r#"<saml:Attribute Name="http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress">"#,
            r#"<saml:AttributeValue>{}</saml:AttributeValue></saml:Attribute>"#,
            r#"<saml:Attribute Name="http://schemas.xmlsoap.org/ws/2005/05/identity/claims/givenname">"#,
            r#"<saml:AttributeValue>Mona</saml:AttributeValue></saml:Attribute>"#,
            r#"<saml:Attribute Name="http://schemas.xmlsoap.org/claims/Group">{}</saml:Attribute>"#,
            r#"</saml:AttributeStatement></saml:Assertion>"#
        ),
        declaration,
        fields.id,
        instant(Utc::now()),
        IDP_ENTITY_ID,
        fields.name_id,
        instant(fields.not_on_or_after),
        instant(Utc::now() - Duration::minutes(1)),
        instant(fields.not_on_or_after),
        fields.audience,
        fields.email,
        groups,
    )
}

/// Sign `assertion` with an enveloped RSA-SHA256 signature placed after its Issuer.
///
/// `assertion_as_signed` is a standalone parseable form of the same assertion; when the
/// Assertion inherits its namespace it carries the declaration itself.
pub fn sign_assertion(assertion: &str, assertion_as_signed: &str, id: &str, private_key_pem: &str) -> String {
    let parsed = Document::parse(assertion_as_signed).expect("Invalid test assertion");
    let canonical_assertion = ExclusiveCanonicalizer::new(assertion_as_signed).canonicalize(parsed.root_element());
    let digest = STANDARD.encode(Sha256::digest(canonical_assertion.as_bytes()));

    let signed_info_body = format!(
        concat!(
            r#"<ds:CanonicalizationMethod Algorithm="{exc}"/>"#,
            r#"<ds:SignatureMethod Algorithm="{method}"/>"#,
            r##"<ds:Reference URI="#{id}"><ds:Transforms>"##,
            r#"<ds:Transform Algorithm="{enveloped}"/><ds:Transform Algorithm="{exc}"/>"#,
            r#"</ds:Transforms><ds:DigestMethod Algorithm="{digest_method}"/>"#,
            r#"<ds:DigestValue>{digest}</ds:DigestValue></ds:Reference>"#
        ),
        exc = EXC_C14N,
        method = RSA_SHA256,
        id = id,
        enveloped = ENVELOPED_SIGNATURE,
        digest_method = SHA256_DIGEST,
        digest = digest
    );
    let signed_info = format!(
        r#"<ds:SignedInfo xmlns:ds="{}">{}</ds:SignedInfo>"#,
        DSIG_NS, signed_info_body
    );
    let parsed = Document::parse(&signed_info).expect("Invalid test SignedInfo");
    let signed_info_canonical = ExclusiveCanonicalizer::new(&signed_info).canonicalize(parsed.root_element());

    let key = RsaPrivateKey::from_pkcs8_pem(private_key_pem).expect("Invalid test key");
    let signature = SigningKey::<Sha256>::new(key).sign(signed_info_canonical.as_bytes());

    let signature_element = format!(
        r#"<ds:Signature xmlns:ds="{}"><ds:SignedInfo>{}</ds:SignedInfo><ds:SignatureValue>{}</ds:SignatureValue></ds:Signature>"#,
        DSIG_NS,
        signed_info_body,
        STANDARD.encode(signature.to_bytes())
    );

    assertion.replacen(
        "</saml:Issuer>",
        &format!("</saml:Issuer>{}", signature_element),
        1,
    )
}

/// A signed assertion for `fields`, signed with `private_key_pem`.
pub fn signed_assertion(fields: &AssertionFields, private_key_pem: &str) -> String {
    let assertion = unsigned_assertion(fields);
    let as_signed = if fields.self_declared {
        assertion.clone()
    } else {
        assertion.replacen(
            "<saml:Assertion",
            &format!(r#"<saml:Assertion xmlns:saml="{}""#, ASSERTION_NS),
            1,
        )
    };
    sign_assertion(&assertion, &as_signed, &fields.id, private_key_pem)
}

/// Base64 POST-binding Response wrapping `assertion`.
pub fn saml_response(assertion: &str) -> String {
    STANDARD.encode(format!(
        concat!(
            r#"<samlp:Response xmlns:samlp="{}" xmlns:saml="{}" ID="_response-1" Version="2.0" "#,
            r#"IssueInstant="{}" Destination="https://hub.example.com/saml/acs">"#,
            r#"<saml:Issuer>{}</saml:Issuer>"#,
            r#"<samlp:Status><samlp:StatusCode Value="{}"/></samlp:Status>{}</samlp:Response>"#
        ),
        PROTOCOL_NS,
        ASSERTION_NS,
        instant(Utc::now()),
        IDP_ENTITY_ID,
        STATUS_SUCCESS,
        assertion
    ))
}

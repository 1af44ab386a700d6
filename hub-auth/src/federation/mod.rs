//! Identity federation gateway.
//!
//! Every provider flow has the same shape: a single-use correlation token, a redirect, a
//! callback validated exactly once, an exchange for claims, a mapping to
//! [`ExternalIdentity`], and finally find-or-create of the local user. The local account is
//! only touched after all remote calls have succeeded.

pub mod c14n;
pub mod ldap;
pub mod mapping;
pub mod oauth;
pub mod oidc;
pub mod saml;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::config::FederationConfig;
use crate::models::{OAuthAccount, OAuthState, User};
use crate::services::error::AuthError;
use crate::store::{FederationStore, StoreError, UserStore};
use crate::utils::generate_random_token;

pub use ldap::{InMemoryDirectory, Ldap3Connector, LdapAuthenticator, LdapConnection, LdapConnector};
pub use mapping::{AttributeMapping, MappedAttribute, MappedClaims, MappingError};
pub use oauth::{OAuthProvider, ProviderKind};
pub use oidc::OidcProvider;
pub use saml::SamlServiceProvider;

pub const OIDC_PROVIDER: &str = "oidc";
pub const SAML_PROVIDER: &str = "saml";
pub const LDAP_PROVIDER: &str = "ldap";

const MAX_USERNAME_LENGTH: usize = 39;

#[derive(Error, Debug)]
pub enum FederationError {
    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Invalid, expired or reused state")]
    InvalidState,

    #[error("Code exchange failed: {0}")]
    CodeExchange(String),

    #[error("Failed to fetch user info: {0}")]
    UserInfo(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Provider unreachable: {0}")]
    ProviderUnreachable(String),
}

impl FederationError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, FederationError::ProviderUnreachable(_))
    }

    /// The caller presented something we refuse, as opposed to the provider misbehaving.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            FederationError::InvalidState | FederationError::InvalidSignature(_)
        )
    }

    /// Map a transport failure, keeping timeouts and refused connections distinguishable.
    pub(crate) fn from_request(err: reqwest::Error, wrap: fn(String) -> Self) -> Self {
        if err.is_timeout() || err.is_connect() {
            FederationError::ProviderUnreachable(err.to_string())
        } else {
            wrap(err.to_string())
        }
    }
}

/// Tokens returned by an OAuth2/OIDC token endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Normalized identity asserted by an external provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalIdentity {
    pub external_id: String,
    pub email: String,
    pub username: String,
    pub display_name: Option<String>,
    pub groups: Vec<String>,
    pub tokens: Option<ProviderTokens>,
}

/// Where to send the browser, and the state that will come back.
#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
    pub url: String,
    pub state: String,
}

/// How a provider's assertions flow into the local account on every login.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncPolicy {
    pub sync_profile: bool,
    pub admin_group: Option<String>,
    pub sync_groups: bool,
}

/// Organization/team management, consumed for just-in-time provisioning.
#[async_trait]
pub trait OrgProvisioner: Send + Sync {
    async fn sync_memberships(
        &self,
        user_id: Uuid,
        provider: &str,
        groups: &[String],
    ) -> Result<(), anyhow::Error>;
}

pub struct NoopOrgProvisioner;

#[async_trait]
impl OrgProvisioner for NoopOrgProvisioner {
    async fn sync_memberships(
        &self,
        user_id: Uuid,
        provider: &str,
        groups: &[String],
    ) -> Result<(), anyhow::Error> {
        tracing::debug!(user_id = %user_id, provider, groups = groups.len(), "Group sync skipped");
        Ok(())
    }
}

/// Lowercased `[a-z0-9._-]`, trimmed to the username length limit.
fn sanitize_username(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter_map(|c| {
            let c = c.to_ascii_lowercase();
            (c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')).then_some(c)
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| matches!(c, '-' | '.'));
    let mut name: String = cleaned.chars().take(MAX_USERNAME_LENGTH).collect();
    if name.len() < 3 {
        name = format!("{}user", name);
    }
    name
}

pub struct FederationGateway {
    users: Arc<dyn UserStore>,
    links: Arc<dyn FederationStore>,
    provisioner: Arc<dyn OrgProvisioner>,
    oauth: HashMap<ProviderKind, OAuthProvider>,
    oidc: Option<OidcProvider>,
    saml: Option<SamlServiceProvider>,
    ldap: Option<LdapAuthenticator>,
}

impl FederationGateway {
    pub fn new(users: Arc<dyn UserStore>, links: Arc<dyn FederationStore>) -> Self {
        Self {
            users,
            links,
            provisioner: Arc::new(NoopOrgProvisioner),
            oauth: HashMap::new(),
            oidc: None,
            saml: None,
            ldap: None,
        }
    }

    /// Build the provider set from configuration. Runs OIDC discovery, so this performs
    /// network I/O when OIDC is configured.
    pub async fn from_config(
        config: &FederationConfig,
        users: Arc<dyn UserStore>,
        links: Arc<dyn FederationStore>,
    ) -> Result<Self, FederationError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("hub-auth/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FederationError::Discovery(format!("HTTP client: {}", e)))?;

        let mut gateway = Self::new(users, links);

        for provider in &config.oauth {
            let kind: ProviderKind = provider.provider.parse()?;
            gateway = gateway.with_oauth(OAuthProvider::new(kind, provider, http.clone()));
        }

        if let Some(oidc) = &config.oidc {
            gateway = gateway.with_oidc(OidcProvider::discover(oidc, http.clone()).await?);
        }

        if let Some(saml) = &config.saml {
            gateway = gateway.with_saml(SamlServiceProvider::new(saml)?);
        }

        if let Some(ldap) = &config.ldap {
            gateway = gateway.with_ldap(LdapAuthenticator::new(
                ldap,
                Arc::new(Ldap3Connector::new(&ldap.url, config.timeout_seconds)),
            ));
        }

        tracing::info!(
            oauth = gateway.oauth.len(),
            oidc = gateway.oidc.is_some(),
            saml = gateway.saml.is_some(),
            ldap = gateway.ldap.is_some(),
            "Federation gateway initialized"
        );

        Ok(gateway)
    }

    pub fn with_provisioner(mut self, provisioner: Arc<dyn OrgProvisioner>) -> Self {
        self.provisioner = provisioner;
        self
    }

    pub fn with_oauth(mut self, provider: OAuthProvider) -> Self {
        self.oauth.insert(provider.kind(), provider);
        self
    }

    pub fn with_oidc(mut self, provider: OidcProvider) -> Self {
        self.oidc = Some(provider);
        self
    }

    pub fn with_saml(mut self, provider: SamlServiceProvider) -> Self {
        self.saml = Some(provider);
        self
    }

    pub fn with_ldap(mut self, authenticator: LdapAuthenticator) -> Self {
        self.ldap = Some(authenticator);
        self
    }

    fn oauth_provider(&self, kind: ProviderKind) -> Result<&OAuthProvider, FederationError> {
        self.oauth
            .get(&kind)
            .ok_or_else(|| FederationError::ProviderNotConfigured(kind.as_str().to_string()))
    }

    fn oidc_provider(&self) -> Result<&OidcProvider, FederationError> {
        self.oidc
            .as_ref()
            .ok_or_else(|| FederationError::ProviderNotConfigured(OIDC_PROVIDER.to_string()))
    }

    fn saml_provider(&self) -> Result<&SamlServiceProvider, FederationError> {
        self.saml
            .as_ref()
            .ok_or_else(|| FederationError::ProviderNotConfigured(SAML_PROVIDER.to_string()))
    }

    async fn issue_state(
        &self,
        provider: &str,
        redirect_uri: Option<String>,
    ) -> Result<String, AuthError> {
        let state = generate_random_token();
        self.links
            .insert_oauth_state(&OAuthState::new(state.clone(), provider, redirect_uri))
            .await?;
        Ok(state)
    }

    async fn consume_state(&self, state: &str, provider: &str) -> Result<OAuthState, AuthError> {
        self.links
            .consume_oauth_state(state, provider, Utc::now())
            .await?
            .ok_or_else(|| {
                tracing::warn!(provider, "Rejected invalid or reused federation state");
                AuthError::Federation(FederationError::InvalidState)
            })
    }

    pub async fn begin_oauth(
        &self,
        kind: ProviderKind,
        redirect_uri: &str,
    ) -> Result<AuthorizationRedirect, AuthError> {
        let provider = self.oauth_provider(kind)?;
        let state = self
            .issue_state(kind.as_str(), Some(redirect_uri.to_string()))
            .await?;
        Ok(AuthorizationRedirect {
            url: provider.auth_url(&state, redirect_uri),
            state,
        })
    }

    /// Validate the callback state, then exchange the code and fetch the profile.
    #[tracing::instrument(skip(self, code, state))]
    pub async fn complete_oauth(
        &self,
        kind: ProviderKind,
        code: &str,
        state: &str,
    ) -> Result<ExternalIdentity, AuthError> {
        let provider = self.oauth_provider(kind)?;
        let stored = self.consume_state(state, kind.as_str()).await?;
        let redirect_uri = stored.redirect_uri.unwrap_or_default();

        let tokens = provider.exchange_code(code, &redirect_uri).await?;
        let mut identity = provider.user_info(&tokens.access_token).await?;
        identity.tokens = Some(tokens);
        Ok(identity)
    }

    pub async fn begin_oidc(&self, redirect_uri: &str) -> Result<AuthorizationRedirect, AuthError> {
        let provider = self.oidc_provider()?;
        let state = self
            .issue_state(OIDC_PROVIDER, Some(redirect_uri.to_string()))
            .await?;
        Ok(AuthorizationRedirect {
            url: provider.auth_url(&state, redirect_uri),
            state,
        })
    }

    #[tracing::instrument(skip_all)]
    pub async fn complete_oidc(&self, code: &str, state: &str) -> Result<ExternalIdentity, AuthError> {
        let provider = self.oidc_provider()?;
        let stored = self.consume_state(state, OIDC_PROVIDER).await?;
        let redirect_uri = stored.redirect_uri.unwrap_or_default();

        let tokens = provider.exchange_code(code, &redirect_uri).await?;
        let mut identity = provider.user_info(&tokens.access_token).await?;
        identity.tokens = Some(tokens);
        Ok(identity)
    }

    /// SP-initiated SAML login. The RelayState doubles as the single-use state.
    pub async fn begin_saml(&self) -> Result<AuthorizationRedirect, AuthError> {
        let provider = self.saml_provider()?;
        let state = self.issue_state(SAML_PROVIDER, None).await?;
        Ok(AuthorizationRedirect {
            url: provider.redirect_url(&state),
            state,
        })
    }

    /// Validate a POST-binding response. Responses without RelayState are IdP-initiated
    /// and only accepted when explicitly allowed.
    #[tracing::instrument(skip_all)]
    pub async fn complete_saml(
        &self,
        saml_response: &str,
        relay_state: Option<&str>,
    ) -> Result<ExternalIdentity, AuthError> {
        let provider = self.saml_provider()?;

        match relay_state.filter(|s| !s.is_empty()) {
            Some(state) => {
                self.consume_state(state, SAML_PROVIDER).await?;
            }
            None if provider.allows_idp_initiated() => {
                tracing::info!("Accepting IdP-initiated SAML response");
            }
            None => return Err(FederationError::InvalidState.into()),
        }

        Ok(provider.parse_response(saml_response, Utc::now())?)
    }

    pub fn saml_metadata(&self) -> Result<String, AuthError> {
        Ok(self.saml_provider()?.metadata())
    }

    /// `None` when the directory rejects the credentials.
    pub async fn authenticate_ldap(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<ExternalIdentity>, AuthError> {
        let ldap = self
            .ldap
            .as_ref()
            .ok_or_else(|| FederationError::ProviderNotConfigured(LDAP_PROVIDER.to_string()))?;
        Ok(ldap.authenticate(username, password).await?)
    }

    pub fn has_ldap(&self) -> bool {
        self.ldap.is_some()
    }

    fn policy(&self, provider: &str) -> SyncPolicy {
        match provider {
            OIDC_PROVIDER => self.oidc.as_ref().map(|p| p.policy()).unwrap_or_default(),
            SAML_PROVIDER => self.saml.as_ref().map(|p| p.policy()).unwrap_or_default(),
            LDAP_PROVIDER => self.ldap.as_ref().map(|p| p.policy()).unwrap_or_default(),
            _ => SyncPolicy::default(),
        }
    }

    /// Find the linked user, else the user with the same email, else create one.
    ///
    /// The account link and (per provider policy) the profile are refreshed on every call.
    #[tracing::instrument(skip(self, identity), fields(external_id = %identity.external_id))]
    pub async fn resolve_user(
        &self,
        provider: &str,
        identity: &ExternalIdentity,
    ) -> Result<User, AuthError> {
        if identity.email.trim().is_empty() {
            return Err(FederationError::UserInfo("provider returned no email".to_string()).into());
        }

        let linked = self
            .links
            .find_oauth_account(provider, &identity.external_id)
            .await?;

        let user = match linked {
            Some(link) => self
                .users
                .find_user_by_id(link.user_id)
                .await?
                .ok_or(AuthError::UserNotFound)?,
            None => match self.users.find_user_by_email(&identity.email).await? {
                Some(user) => {
                    tracing::info!(user_id = %user.id, provider, "Linking external identity by email");
                    user
                }
                None => self.create_user(identity).await?,
            },
        };

        if !user.is_active {
            return Err(AuthError::AccountInactive);
        }

        let policy = self.policy(provider);
        let user = self.sync_profile(user, identity, &policy).await?;

        let mut link = OAuthAccount::new(user.id, provider, &identity.external_id);
        link.email = Some(identity.email.clone());
        link.username = Some(identity.username.clone());
        if let Some(tokens) = &identity.tokens {
            link.access_token = Some(tokens.access_token.clone());
            link.refresh_token = tokens.refresh_token.clone();
            link.token_expires_at = tokens.expires_at;
        }
        self.links.upsert_oauth_account(&link).await?;

        if policy.sync_groups && !identity.groups.is_empty() {
            if let Err(e) = self
                .provisioner
                .sync_memberships(user.id, provider, &identity.groups)
                .await
            {
                tracing::warn!(user_id = %user.id, provider, error = %e, "Organization sync failed");
            }
        }

        Ok(user)
    }

    async fn create_user(&self, identity: &ExternalIdentity) -> Result<User, AuthError> {
        let local_part = identity.email.split('@').next().unwrap_or_default();
        let base = sanitize_username(if identity.username.is_empty() {
            local_part
        } else {
            &identity.username
        });

        let mut candidate = base.clone();
        for n in 2..=20 {
            if self.users.find_user_by_username(&candidate).await?.is_none() {
                break;
            }
            candidate = format!("{}-{}", base, n);
        }

        for _ in 0..3 {
            let user = User::new_federated(
                candidate.clone(),
                identity.email.clone(),
                identity.display_name.clone(),
            );
            match self.users.insert_user(&user).await {
                Ok(()) => {
                    tracing::info!(user_id = %user.id, username = %user.username, "Created federated user");
                    return Ok(user);
                }
                Err(StoreError::Conflict(_)) => {
                    // Lost a race: either the email appeared or the username was taken.
                    if let Some(existing) = self.users.find_user_by_email(&identity.email).await? {
                        return Ok(existing);
                    }
                    let token = generate_random_token();
                    candidate = format!("{}-{}", base, &token[..6]);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AuthError::UserAlreadyExists)
    }

    async fn sync_profile(
        &self,
        mut user: User,
        identity: &ExternalIdentity,
        policy: &SyncPolicy,
    ) -> Result<User, AuthError> {
        if !policy.sync_profile {
            return Ok(user);
        }

        if identity.display_name.is_some() && identity.display_name != user.display_name {
            self.users
                .update_display_name(user.id, identity.display_name.as_deref())
                .await?;
            user.display_name = identity.display_name.clone();
        }

        if let Some(admin_group) = &policy.admin_group {
            let is_admin = identity
                .groups
                .iter()
                .any(|g| g.eq_ignore_ascii_case(admin_group));
            if is_admin != user.is_admin {
                self.users.set_admin(user.id, is_admin).await?;
                tracing::info!(user_id = %user.id, is_admin, "Admin flag synced from provider groups");
                user.is_admin = is_admin;
            }
        }

        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn identity(external_id: &str, email: &str, username: &str) -> ExternalIdentity {
        ExternalIdentity {
            external_id: external_id.to_string(),
            email: email.to_string(),
            username: username.to_string(),
            display_name: Some("Mona Lisa".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_sanitize_username() {
        assert_eq!(sanitize_username("Mona.Lisa"), "mona.lisa");
        assert_eq!(sanitize_username("-jo hn-"), "john");
        assert_eq!(sanitize_username("x"), "xuser");
        assert_eq!(sanitize_username(&"a".repeat(60)).len(), MAX_USERNAME_LENGTH);
    }

    #[tokio::test]
    async fn test_resolve_creates_then_reuses_link() {
        let store = Arc::new(MemoryStore::new());
        let gateway = FederationGateway::new(store.clone(), store.clone());

        let first = gateway
            .resolve_user("github", &identity("42", "mona@example.com", "mona"))
            .await
            .unwrap();
        assert!(first.email_verified);
        assert!(!first.has_password());

        // Email changed at the provider; the link still wins.
        let second = gateway
            .resolve_user("github", &identity("42", "mona@new.example.com", "mona"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_resolve_links_existing_email_and_dedupes_username() {
        let store = Arc::new(MemoryStore::new());
        let gateway = FederationGateway::new(store.clone(), store.clone());

        let local = User::new("mona".into(), "Mona@Example.com".into(), "hash".into());
        store.insert_user(&local).await.unwrap();

        let linked = gateway
            .resolve_user("gitlab", &identity("7", "mona@example.com", "mona"))
            .await
            .unwrap();
        assert_eq!(linked.id, local.id);

        let other = gateway
            .resolve_user("gitlab", &identity("8", "other@example.com", "mona"))
            .await
            .unwrap();
        assert_eq!(other.username, "mona-2");
    }

    #[tokio::test]
    async fn test_inactive_user_rejected() {
        let store = Arc::new(MemoryStore::new());
        let gateway = FederationGateway::new(store.clone(), store.clone());

        let user = gateway
            .resolve_user("google", &identity("g-1", "ann@example.com", ""))
            .await
            .unwrap();
        assert_eq!(user.username, "ann");
        store.set_active(user.id, false).await.unwrap();

        assert!(matches!(
            gateway
                .resolve_user("google", &identity("g-1", "ann@example.com", ""))
                .await,
            Err(AuthError::AccountInactive)
        ));
    }

    #[tokio::test]
    async fn test_unconfigured_provider() {
        let store = Arc::new(MemoryStore::new());
        let gateway = FederationGateway::new(store.clone(), store);

        assert!(matches!(
            gateway.begin_oauth(ProviderKind::GitHub, "https://hub/cb").await,
            Err(AuthError::Federation(FederationError::ProviderNotConfigured(p))) if p == "github"
        ));
        assert!(gateway.saml_metadata().is_err());
    }
}

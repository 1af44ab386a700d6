//! Generic OpenID Connect provider configured through discovery.
//!
//! ID token signatures are not validated; identity comes from the userinfo endpoint,
//! fetched with the access token obtained over a direct back-channel exchange.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

use super::mapping::AttributeMapping;
use super::oauth::{authorization_url, exchange_authorization_code, fetch_json, local_part, value_string};
use super::{ExternalIdentity, FederationError, ProviderTokens, SyncPolicy};
use crate::config::OidcConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: Option<String>,
    pub jwks_uri: Option<String>,
}

pub fn discovery_url(issuer: &str) -> String {
    format!("{}/.well-known/openid-configuration", issuer.trim_end_matches('/'))
}

/// Flatten a JSON claim set into the multi-valued form attribute mappings consume.
fn claim_values(claims: &Value) -> HashMap<String, Vec<String>> {
    let Value::Object(map) = claims else {
        return HashMap::new();
    };

    map.iter()
        .filter_map(|(key, value)| {
            let values: Vec<String> = match value {
                Value::Array(items) => items.iter().filter_map(value_string).collect(),
                Value::Bool(b) => vec![b.to_string()],
                other => value_string(other).into_iter().collect(),
            };
            (!values.is_empty()).then(|| (key.clone(), values))
        })
        .collect()
}

#[derive(Clone)]
pub struct OidcProvider {
    client_id: String,
    client_secret: String,
    scopes: String,
    document: DiscoveryDocument,
    mapping: AttributeMapping,
    policy: SyncPolicy,
    http: reqwest::Client,
}

impl OidcProvider {
    /// Fetch the discovery document. Called once at startup.
    pub async fn discover(config: &OidcConfig, http: reqwest::Client) -> Result<Self, FederationError> {
        let url = discovery_url(&config.issuer);
        let response = http
            .get(&url)
            .send()
            .await
            .map_err(|e| FederationError::from_request(e, FederationError::Discovery))?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(status = %status, url = %url, "OIDC discovery failed");
            return Err(FederationError::Discovery(format!("HTTP {}", status.as_u16())));
        }

        let document: DiscoveryDocument = response
            .json()
            .await
            .map_err(|e| FederationError::Discovery(format!("invalid document: {}", e)))?;

        if document.issuer.trim_end_matches('/') != config.issuer.trim_end_matches('/') {
            tracing::error!(
                configured = %config.issuer,
                advertised = %document.issuer,
                "OIDC issuer mismatch in discovery document"
            );
            return Err(FederationError::Discovery(format!(
                "issuer mismatch: {}",
                document.issuer
            )));
        }

        tracing::info!(issuer = %document.issuer, "OIDC provider discovered");
        Ok(Self::from_document(config, document, http))
    }

    pub fn from_document(config: &OidcConfig, document: DiscoveryDocument, http: reqwest::Client) -> Self {
        Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scopes: config.scopes.join(" "),
            document,
            mapping: config.mapping.clone(),
            policy: SyncPolicy {
                sync_profile: true,
                admin_group: config.admin_group.clone(),
                sync_groups: config.sync_groups,
            },
            http,
        }
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy.clone()
    }

    pub fn auth_url(&self, state: &str, redirect_uri: &str) -> String {
        authorization_url(
            &self.document.authorization_endpoint,
            &self.client_id,
            redirect_uri,
            &self.scopes,
            state,
        )
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ProviderTokens, FederationError> {
        exchange_authorization_code(
            &self.http,
            &self.document.token_endpoint,
            &self.client_id,
            &self.client_secret,
            code,
            redirect_uri,
        )
        .await
    }

    pub async fn user_info(&self, access_token: &str) -> Result<ExternalIdentity, FederationError> {
        let endpoint = self
            .document
            .userinfo_endpoint
            .as_deref()
            .ok_or_else(|| FederationError::UserInfo("no userinfo endpoint advertised".to_string()))?;

        let claims = fetch_json(&self.http, endpoint, access_token).await?;
        let subject = value_string(&claims["sub"])
            .ok_or_else(|| FederationError::MalformedResponse("userinfo has no sub".to_string()))?;

        let mapped = self.mapping.apply(&claim_values(&claims));
        let email = mapped
            .email
            .ok_or_else(|| FederationError::UserInfo("no email claim".to_string()))?;

        Ok(ExternalIdentity {
            external_id: subject,
            username: mapped.username.unwrap_or_else(|| local_part(&email)),
            display_name: mapped.display_name.or_else(|| value_string(&claims["name"])),
            groups: mapped.groups,
            email,
            tokens: None,
        })
    }
}

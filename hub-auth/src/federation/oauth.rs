//! OAuth2 authorization-code adapters for GitHub, Google, Microsoft and GitLab.

use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::{ExternalIdentity, FederationError, ProviderTokens};
use crate::config::OAuthProviderConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    GitHub,
    Google,
    Microsoft,
    GitLab,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GitHub => "github",
            ProviderKind::Google => "google",
            ProviderKind::Microsoft => "microsoft",
            ProviderKind::GitLab => "gitlab",
        }
    }

    fn scopes(&self) -> &'static str {
        match self {
            ProviderKind::GitHub => "read:user user:email",
            ProviderKind::Google => "openid email profile",
            ProviderKind::Microsoft => "openid email profile User.Read",
            ProviderKind::GitLab => "read_user",
        }
    }

    /// Endpoints for the public service, or for a self-hosted/test instance rooted at `base`.
    fn endpoints(&self, base: Option<&str>) -> Endpoints {
        let base = base.map(|b| b.trim_end_matches('/'));
        match (self, base) {
            (ProviderKind::GitHub, None) => Endpoints {
                authorize: "https://github.com/login/oauth/authorize".into(),
                token: "https://github.com/login/oauth/access_token".into(),
                user: "https://api.github.com/user".into(),
                emails: Some("https://api.github.com/user/emails".into()),
            },
            (ProviderKind::GitHub, Some(b)) => Endpoints {
                authorize: format!("{}/login/oauth/authorize", b),
                token: format!("{}/login/oauth/access_token", b),
                user: format!("{}/user", b),
                emails: Some(format!("{}/user/emails", b)),
            },
            (ProviderKind::Google, None) => Endpoints {
                authorize: "https://accounts.google.com/o/oauth2/v2/auth".into(),
                token: "https://oauth2.googleapis.com/token".into(),
                user: "https://openidconnect.googleapis.com/v1/userinfo".into(),
                emails: None,
            },
            (ProviderKind::Google, Some(b)) => Endpoints {
                authorize: format!("{}/o/oauth2/v2/auth", b),
                token: format!("{}/token", b),
                user: format!("{}/v1/userinfo", b),
                emails: None,
            },
            (ProviderKind::Microsoft, base) => {
                let login = base.unwrap_or("https://login.microsoftonline.com");
                let graph = base.unwrap_or("https://graph.microsoft.com");
                Endpoints {
                    authorize: format!("{}/common/oauth2/v2.0/authorize", login),
                    token: format!("{}/common/oauth2/v2.0/token", login),
                    user: format!("{}/v1.0/me", graph),
                    emails: None,
                }
            }
            (ProviderKind::GitLab, base) => {
                let b = base.unwrap_or("https://gitlab.com");
                Endpoints {
                    authorize: format!("{}/oauth/authorize", b),
                    token: format!("{}/oauth/token", b),
                    user: format!("{}/api/v4/user", b),
                    emails: None,
                }
            }
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = FederationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(ProviderKind::GitHub),
            "google" => Ok(ProviderKind::Google),
            "microsoft" | "azure" => Ok(ProviderKind::Microsoft),
            "gitlab" => Ok(ProviderKind::GitLab),
            other => Err(FederationError::ProviderNotConfigured(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
struct Endpoints {
    authorize: String,
    token: String,
    user: String,
    emails: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    error: Option<String>,
}

impl TokenResponse {
    /// GitHub reports failures with a 200 and an `error` field.
    pub(crate) fn into_tokens(self) -> Result<ProviderTokens, FederationError> {
        match (self.access_token, self.error) {
            (Some(access_token), None) if !access_token.is_empty() => Ok(ProviderTokens {
                access_token,
                refresh_token: self.refresh_token,
                expires_at: self.expires_in.map(|s| Utc::now() + Duration::seconds(s)),
            }),
            (_, Some(error)) => Err(FederationError::CodeExchange(error)),
            _ => Err(FederationError::CodeExchange("no access token".to_string())),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

/// String or number field as a string.
pub(crate) fn value_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn local_part(email: &str) -> String {
    email.split('@').next().unwrap_or_default().to_string()
}

/// Build an authorization URL with properly encoded query parameters.
pub(crate) fn authorization_url(
    endpoint: &str,
    client_id: &str,
    redirect_uri: &str,
    scope: &str,
    state: &str,
) -> String {
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!(
        "{}{}client_id={}&redirect_uri={}&scope={}&state={}&response_type=code",
        endpoint,
        separator,
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(scope),
        urlencoding::encode(state),
    )
}

/// POST an authorization code to a token endpoint.
pub(crate) async fn exchange_authorization_code(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: &str,
    code: &str,
    redirect_uri: &str,
) -> Result<ProviderTokens, FederationError> {
    let response = http
        .post(token_endpoint)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ])
        .send()
        .await
        .map_err(|e| FederationError::from_request(e, FederationError::CodeExchange))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %body, "Token exchange failed");
        return Err(FederationError::CodeExchange(format!("HTTP {}", status.as_u16())));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| FederationError::MalformedResponse(format!("token response: {}", e)))?
        .into_tokens()
        .inspect_err(|e| tracing::error!(error = %e, "Token endpoint returned an error"))
}

/// GET a JSON document with a bearer token.
pub(crate) async fn fetch_json(
    http: &reqwest::Client,
    url: &str,
    access_token: &str,
) -> Result<Value, FederationError> {
    let response = http
        .get(url)
        .bearer_auth(access_token)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| FederationError::from_request(e, FederationError::UserInfo))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %body, url, "User info request failed");
        return Err(FederationError::UserInfo(format!("HTTP {}", status.as_u16())));
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| FederationError::MalformedResponse(format!("user info: {}", e)))
}

/// One configured OAuth2 provider.
#[derive(Clone)]
pub struct OAuthProvider {
    kind: ProviderKind,
    client_id: String,
    client_secret: String,
    endpoints: Endpoints,
    http: reqwest::Client,
}

impl OAuthProvider {
    pub fn new(kind: ProviderKind, config: &OAuthProviderConfig, http: reqwest::Client) -> Self {
        Self {
            kind,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            endpoints: kind.endpoints(config.base_url.as_deref()),
            http,
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn auth_url(&self, state: &str, redirect_uri: &str) -> String {
        authorization_url(
            &self.endpoints.authorize,
            &self.client_id,
            redirect_uri,
            self.kind.scopes(),
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
            &self.endpoints.token,
            &self.client_id,
            &self.client_secret,
            code,
            redirect_uri,
        )
        .await
    }

    pub async fn user_info(&self, access_token: &str) -> Result<ExternalIdentity, FederationError> {
        let profile = fetch_json(&self.http, &self.endpoints.user, access_token).await?;

        let identity = match self.kind {
            ProviderKind::GitHub => {
                let email = match value_string(&profile["email"]) {
                    Some(email) => email,
                    None => self.github_primary_email(access_token).await?,
                };
                ExternalIdentity {
                    external_id: value_string(&profile["id"]).unwrap_or_default(),
                    username: value_string(&profile["login"]).unwrap_or_else(|| local_part(&email)),
                    display_name: value_string(&profile["name"]),
                    email,
                    ..Default::default()
                }
            }
            ProviderKind::Google => {
                if profile["email_verified"] == Value::Bool(false) {
                    return Err(FederationError::UserInfo("email not verified".to_string()));
                }
                let email = value_string(&profile["email"]).unwrap_or_default();
                ExternalIdentity {
                    external_id: value_string(&profile["sub"]).unwrap_or_default(),
                    username: local_part(&email),
                    display_name: value_string(&profile["name"]),
                    email,
                    ..Default::default()
                }
            }
            ProviderKind::Microsoft => {
                let email = value_string(&profile["mail"])
                    .or_else(|| value_string(&profile["userPrincipalName"]))
                    .unwrap_or_default();
                ExternalIdentity {
                    external_id: value_string(&profile["id"]).unwrap_or_default(),
                    username: local_part(&email),
                    display_name: value_string(&profile["displayName"]),
                    email,
                    ..Default::default()
                }
            }
            ProviderKind::GitLab => {
                let email = value_string(&profile["email"]).unwrap_or_default();
                ExternalIdentity {
                    external_id: value_string(&profile["id"]).unwrap_or_default(),
                    username: value_string(&profile["username"]).unwrap_or_else(|| local_part(&email)),
                    display_name: value_string(&profile["name"]),
                    email,
                    ..Default::default()
                }
            }
        };

        if identity.external_id.is_empty() {
            return Err(FederationError::MalformedResponse("profile has no id".to_string()));
        }
        if identity.email.is_empty() {
            return Err(FederationError::UserInfo("profile has no email".to_string()));
        }

        tracing::debug!(provider = %self.kind, external_id = %identity.external_id, "Fetched provider profile");
        Ok(identity)
    }

    /// Private GitHub emails are only available from `/user/emails`.
    async fn github_primary_email(&self, access_token: &str) -> Result<String, FederationError> {
        let Some(url) = &self.endpoints.emails else {
            return Err(FederationError::UserInfo("no email endpoint".to_string()));
        };
        let emails: Vec<GitHubEmail> =
            serde_json::from_value(fetch_json(&self.http, url, access_token).await?)
                .map_err(|e| FederationError::MalformedResponse(format!("emails: {}", e)))?;

        emails
            .into_iter()
            .find(|e| e.primary && e.verified)
            .map(|e| e.email)
            .ok_or_else(|| FederationError::UserInfo("no verified primary email".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(kind: ProviderKind, base_url: Option<&str>) -> OAuthProvider {
        OAuthProvider::new(
            kind,
            &OAuthProviderConfig {
                provider: kind.as_str().to_string(),
                client_id: "client id".to_string(),
                client_secret: "secret".to_string(),
                base_url: base_url.map(String::from),
            },
            reqwest::Client::new(),
        )
    }

    #[test]
    fn test_auth_url_encodes_parameters() {
        let url = provider(ProviderKind::GitHub, None).auth_url("st&ate", "https://hub.dev/cb?x=1");
        assert!(url.starts_with("https://github.com/login/oauth/authorize?"));
        assert!(url.contains("client_id=client%20id"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fhub.dev%2Fcb%3Fx%3D1"));
        assert!(url.contains("scope=read%3Auser%20user%3Aemail"));
        assert!(url.contains("state=st%26ate"));
        assert!(url.ends_with("response_type=code"));
    }

    #[test]
    fn test_self_hosted_gitlab_endpoints() {
        let p = provider(ProviderKind::GitLab, Some("https://git.corp.example/"));
        assert!(p
            .auth_url("s", "r")
            .starts_with("https://git.corp.example/oauth/authorize?"));
        assert_eq!(p.endpoints.user, "https://git.corp.example/api/v4/user");
    }

    #[test]
    fn test_provider_names() {
        assert_eq!("GitHub".parse::<ProviderKind>().unwrap(), ProviderKind::GitHub);
        assert_eq!("azure".parse::<ProviderKind>().unwrap(), ProviderKind::Microsoft);
        assert!(matches!(
            "bitbucket".parse::<ProviderKind>(),
            Err(FederationError::ProviderNotConfigured(_))
        ));
    }

    #[test]
    fn test_token_response_errors() {
        let github_error: TokenResponse =
            serde_json::from_str(r#"{"error":"bad_verification_code"}"#).unwrap();
        assert!(matches!(
            github_error.into_tokens(),
            Err(FederationError::CodeExchange(e)) if e == "bad_verification_code"
        ));

        let ok: TokenResponse =
            serde_json::from_str(r#"{"access_token":"gho_1","expires_in":3600}"#).unwrap();
        let tokens = ok.into_tokens().unwrap();
        assert_eq!(tokens.access_token, "gho_1");
        assert!(tokens.expires_at.is_some());
    }
}

//! LDAP / Active Directory authentication by search-then-bind.

use async_trait::async_trait;
use ldap3::{ldap_escape, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::mapping::AttributeMapping;
use super::{ExternalIdentity, FederationError, SyncPolicy};
use crate::config::LdapConfig;

const INVALID_CREDENTIALS: u32 = 49;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LdapEntry {
    pub dn: String,
    pub attributes: HashMap<String, Vec<String>>,
}

/// One open directory connection.
#[async_trait]
pub trait LdapConnection: Send {
    /// `Ok(false)` when the directory rejects the credentials.
    async fn bind(&mut self, dn: &str, password: &str) -> Result<bool, FederationError>;

    async fn search(
        &mut self,
        base_dn: &str,
        filter: &str,
        attributes: &[&str],
    ) -> Result<Vec<LdapEntry>, FederationError>;

    async fn close(&mut self) -> Result<(), FederationError>;
}

#[async_trait]
pub trait LdapConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn LdapConnection>, FederationError>;
}

/// `ldap3` backed connector.
pub struct Ldap3Connector {
    url: String,
    timeout: Duration,
}

impl Ldap3Connector {
    pub fn new(url: &str, timeout_seconds: u64) -> Self {
        Self {
            url: url.to_string(),
            timeout: Duration::from_secs(timeout_seconds),
        }
    }
}

struct Ldap3Connection {
    ldap: ldap3::Ldap,
    timeout: Duration,
}

fn unreachable(err: ldap3::LdapError) -> FederationError {
    FederationError::ProviderUnreachable(format!("ldap: {}", err))
}

#[async_trait]
impl LdapConnector for Ldap3Connector {
    async fn connect(&self) -> Result<Box<dyn LdapConnection>, FederationError> {
        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout);
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &self.url)
            .await
            .map_err(unreachable)?;

        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                tracing::warn!(error = %e, "LDAP connection error");
            }
        });

        Ok(Box::new(Ldap3Connection {
            ldap,
            timeout: self.timeout,
        }))
    }
}

#[async_trait]
impl LdapConnection for Ldap3Connection {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<bool, FederationError> {
        let result = self
            .ldap
            .with_timeout(self.timeout)
            .simple_bind(dn, password)
            .await
            .map_err(unreachable)?;

        match result.rc {
            0 => Ok(true),
            INVALID_CREDENTIALS => Ok(false),
            rc => Err(FederationError::UserInfo(format!(
                "ldap bind failed with code {}: {}",
                rc, result.text
            ))),
        }
    }

    async fn search(
        &mut self,
        base_dn: &str,
        filter: &str,
        attributes: &[&str],
    ) -> Result<Vec<LdapEntry>, FederationError> {
        let (entries, _) = self
            .ldap
            .with_timeout(self.timeout)
            .search(base_dn, Scope::Subtree, filter, attributes.to_vec())
            .await
            .map_err(unreachable)?
            .success()
            .map_err(|e| FederationError::UserInfo(format!("ldap search failed: {}", e)))?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let entry = SearchEntry::construct(entry);
                LdapEntry {
                    dn: entry.dn,
                    attributes: entry.attrs,
                }
            })
            .collect())
    }

    async fn close(&mut self) -> Result<(), FederationError> {
        self.ldap.unbind().await.map_err(unreachable)
    }
}

/// Group name from a `memberOf` value: the leading CN of a DN, otherwise the value itself.
fn group_name(value: &str) -> String {
    let first = value.split(',').next().unwrap_or_default().trim();
    match first.split_once('=') {
        Some((key, cn)) if key.trim().eq_ignore_ascii_case("cn") => cn.trim().to_string(),
        _ => value.trim().to_string(),
    }
}

pub struct LdapAuthenticator {
    bind_dn: String,
    bind_password: String,
    base_dn: String,
    user_filter: String,
    mapping: AttributeMapping,
    policy: SyncPolicy,
    connector: Arc<dyn LdapConnector>,
}

impl LdapAuthenticator {
    pub fn new(config: &LdapConfig, connector: Arc<dyn LdapConnector>) -> Self {
        Self {
            bind_dn: config.bind_dn.clone(),
            bind_password: config.bind_password.clone(),
            base_dn: config.base_dn.clone(),
            user_filter: config.user_filter.clone(),
            mapping: config.mapping.clone(),
            policy: SyncPolicy {
                sync_profile: true,
                admin_group: config.admin_group.as_deref().map(group_name),
                sync_groups: config.sync_groups,
            },
            connector,
        }
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy.clone()
    }

    /// Bind as the service account, find the user's DN, then bind as the user.
    ///
    /// `None` for unknown users, ambiguous matches and rejected passwords.
    #[tracing::instrument(skip(self, password))]
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<ExternalIdentity>, FederationError> {
        // An empty password would be an unauthenticated bind, which most servers accept.
        if username.trim().is_empty() || password.is_empty() {
            return Ok(None);
        }

        let mut conn = self.connector.connect().await?;
        let result = self.authenticate_on(conn.as_mut(), username.trim(), password).await;
        if let Err(e) = conn.close().await {
            tracing::debug!(error = %e, "LDAP unbind failed");
        }
        result
    }

    async fn authenticate_on(
        &self,
        conn: &mut dyn LdapConnection,
        username: &str,
        password: &str,
    ) -> Result<Option<ExternalIdentity>, FederationError> {
        if !conn.bind(&self.bind_dn, &self.bind_password).await? {
            tracing::error!(bind_dn = %self.bind_dn, "LDAP service account bind rejected");
            return Err(FederationError::UserInfo(
                "service account bind rejected".to_string(),
            ));
        }

        let filter = self.user_filter.replace("{username}", &ldap_escape(username));
        let attributes = [
            self.mapping.email.as_str(),
            self.mapping.username.as_str(),
            self.mapping.first_name.as_str(),
            self.mapping.last_name.as_str(),
            self.mapping.groups.as_str(),
        ];

        let mut entries = conn.search(&self.base_dn, &filter, &attributes).await?;
        let entry = match entries.len() {
            1 => entries.remove(0),
            0 => return Ok(None),
            n => {
                tracing::warn!(matches = n, "LDAP filter matched more than one entry");
                return Ok(None);
            }
        };

        if !conn.bind(&entry.dn, password).await? {
            return Ok(None);
        }

        let mapped = self.mapping.apply(&entry.attributes);
        let email = mapped
            .email
            .ok_or_else(|| FederationError::UserInfo("directory entry has no email".to_string()))?;

        Ok(Some(ExternalIdentity {
            external_id: entry.dn,
            email,
            username: mapped.username.unwrap_or_else(|| username.to_string()),
            display_name: mapped.display_name,
            groups: mapped.groups.iter().map(|g| group_name(g)).collect(),
            tokens: None,
        }))
    }
}

#[derive(Debug, Clone)]
struct DirectoryEntry {
    dn: String,
    password: String,
    attributes: HashMap<String, Vec<String>>,
}

/// Directory held in memory, for tests and local development.
///
/// Filters support equality, presence (`attr=*`), `&` and `|`.
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    entries: Arc<Mutex<Vec<DirectoryEntry>>>,
    binds: Arc<Mutex<Vec<String>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&self, dn: &str, password: &str, attributes: &[(&str, &[&str])]) {
        let entry = DirectoryEntry {
            dn: dn.to_string(),
            password: password.to_string(),
            attributes: attributes
                .iter()
                .map(|(k, vs)| (k.to_string(), vs.iter().map(|v| v.to_string()).collect()))
                .collect(),
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    /// DNs of successful binds, in order.
    pub fn bound_dns(&self) -> Vec<String> {
        self.binds.lock().map(|b| b.clone()).unwrap_or_default()
    }
}

fn unescape_filter_value(value: &str) -> String {
    let mut out = Vec::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Split `(a)(b)(c)` into its top-level groups.
fn filter_groups(list: &str) -> Vec<&str> {
    let mut groups = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in list.char_indices() {
        match c {
            '(' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    groups.push(&list[start..=i]);
                }
            }
            _ => {}
        }
    }
    groups
}

fn filter_matches(filter: &str, entry: &DirectoryEntry) -> bool {
    let filter = filter.trim();
    let inner = filter
        .strip_prefix('(')
        .and_then(|f| f.strip_suffix(')'))
        .unwrap_or(filter);

    if let Some(rest) = inner.strip_prefix('&') {
        return filter_groups(rest).iter().all(|f| filter_matches(f, entry));
    }
    if let Some(rest) = inner.strip_prefix('|') {
        return filter_groups(rest).iter().any(|f| filter_matches(f, entry));
    }

    let Some((attribute, value)) = inner.split_once('=') else {
        return false;
    };
    let values = entry
        .attributes
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(attribute.trim()))
        .map(|(_, v)| v.as_slice())
        .unwrap_or_default();

    if value == "*" {
        return !values.is_empty();
    }
    let wanted = unescape_filter_value(value);
    values.iter().any(|v| v.eq_ignore_ascii_case(&wanted))
}

struct InMemoryConnection {
    directory: InMemoryDirectory,
}

#[async_trait]
impl LdapConnector for InMemoryDirectory {
    async fn connect(&self) -> Result<Box<dyn LdapConnection>, FederationError> {
        Ok(Box::new(InMemoryConnection {
            directory: self.clone(),
        }))
    }
}

#[async_trait]
impl LdapConnection for InMemoryConnection {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<bool, FederationError> {
        let entries = self
            .directory
            .entries
            .lock()
            .map_err(|_| FederationError::ProviderUnreachable("directory poisoned".to_string()))?;
        let ok = !password.is_empty()
            && entries
                .iter()
                .any(|e| e.dn.eq_ignore_ascii_case(dn) && e.password == password);
        drop(entries);

        if ok {
            if let Ok(mut binds) = self.directory.binds.lock() {
                binds.push(dn.to_string());
            }
        }
        Ok(ok)
    }

    async fn search(
        &mut self,
        base_dn: &str,
        filter: &str,
        attributes: &[&str],
    ) -> Result<Vec<LdapEntry>, FederationError> {
        let entries = self
            .directory
            .entries
            .lock()
            .map_err(|_| FederationError::ProviderUnreachable("directory poisoned".to_string()))?;
        let base = base_dn.to_ascii_lowercase();

        Ok(entries
            .iter()
            .filter(|e| e.dn.to_ascii_lowercase().ends_with(&base))
            .filter(|e| filter_matches(filter, e))
            .map(|e| LdapEntry {
                dn: e.dn.clone(),
                attributes: e
                    .attributes
                    .iter()
                    .filter(|(k, _)| attributes.iter().any(|a| a.eq_ignore_ascii_case(k)))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            })
            .collect())
    }

    async fn close(&mut self) -> Result<(), FederationError> {
        Ok(())
    }
}

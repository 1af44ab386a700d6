//! Attribute mappings from provider claim names to the canonical identity fields.

use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum MappingError {
    #[error("Unknown attribute mapping key: {0}")]
    UnknownKey(String),

    #[error("Malformed attribute mapping entry: {0}")]
    Malformed(String),
}

/// Canonical fields a mapping can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappedAttribute {
    Email,
    Username,
    FirstName,
    LastName,
    Groups,
}

impl FromStr for MappedAttribute {
    type Err = MappingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "email" => Ok(MappedAttribute::Email),
            "username" => Ok(MappedAttribute::Username),
            "first_name" => Ok(MappedAttribute::FirstName),
            "last_name" => Ok(MappedAttribute::LastName),
            "groups" => Ok(MappedAttribute::Groups),
            other => Err(MappingError::UnknownKey(other.to_string())),
        }
    }
}

const SAML_CLAIMS: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeMapping {
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub groups: String,
}

/// Values pulled out of a provider's attribute set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedClaims {
    pub email: Option<String>,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub groups: Vec<String>,
}

impl AttributeMapping {
    pub fn saml_default() -> Self {
        Self {
            email: format!("{}/emailaddress", SAML_CLAIMS),
            username: format!("{}/name", SAML_CLAIMS),
            first_name: format!("{}/givenname", SAML_CLAIMS),
            last_name: format!("{}/surname", SAML_CLAIMS),
            groups: "http://schemas.xmlsoap.org/claims/Group".to_string(),
        }
    }

    pub fn oidc_default() -> Self {
        Self {
            email: "email".to_string(),
            username: "preferred_username".to_string(),
            first_name: "given_name".to_string(),
            last_name: "family_name".to_string(),
            groups: "groups".to_string(),
        }
    }

    pub fn ldap_default() -> Self {
        Self {
            email: "mail".to_string(),
            username: "uid".to_string(),
            first_name: "givenName".to_string(),
            last_name: "sn".to_string(),
            groups: "memberOf".to_string(),
        }
    }

    /// Apply `key=attribute` overrides separated by commas, e.g.
    /// `username=sAMAccountName,groups=memberOf`.
    pub fn with_overrides(mut self, overrides: &str) -> Result<Self, MappingError> {
        for entry in overrides.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| MappingError::Malformed(entry.to_string()))?;
            let value = value.trim();
            if value.is_empty() {
                return Err(MappingError::Malformed(entry.to_string()));
            }
            *self.slot(key.parse()?) = value.to_string();
        }
        Ok(self)
    }

    pub fn source(&self, attribute: MappedAttribute) -> &str {
        match attribute {
            MappedAttribute::Email => &self.email,
            MappedAttribute::Username => &self.username,
            MappedAttribute::FirstName => &self.first_name,
            MappedAttribute::LastName => &self.last_name,
            MappedAttribute::Groups => &self.groups,
        }
    }

    fn slot(&mut self, attribute: MappedAttribute) -> &mut String {
        match attribute {
            MappedAttribute::Email => &mut self.email,
            MappedAttribute::Username => &mut self.username,
            MappedAttribute::FirstName => &mut self.first_name,
            MappedAttribute::LastName => &mut self.last_name,
            MappedAttribute::Groups => &mut self.groups,
        }
    }

    /// Extract canonical claims from a multi-valued attribute map.
    pub fn apply(&self, attributes: &HashMap<String, Vec<String>>) -> MappedClaims {
        let first = |attribute: MappedAttribute| {
            attributes
                .get(self.source(attribute))
                .and_then(|values| values.iter().find(|v| !v.trim().is_empty()))
                .map(|v| v.trim().to_string())
        };

        let display_name = match (first(MappedAttribute::FirstName), first(MappedAttribute::LastName))
        {
            (Some(f), Some(l)) => Some(format!("{} {}", f, l)),
            (Some(f), None) => Some(f),
            (None, Some(l)) => Some(l),
            (None, None) => None,
        };

        MappedClaims {
            email: first(MappedAttribute::Email),
            username: first(MappedAttribute::Username),
            display_name,
            groups: attributes
                .get(self.source(MappedAttribute::Groups))
                .cloned()
                .unwrap_or_default(),
        }
    }
}

//! SAML 2.0 service provider: SP-initiated redirect binding, POST-binding responses.
//!
//! Only assertions carrying an enveloped RSA-SHA256 signature from the configured IdP key
//! are trusted. No claim is read before the signature checks out.
//!
//! The reference must use the enveloped-signature transform followed by exclusive C14N,
//! and SignedInfo must be canonicalized with exclusive C14N as well.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use roxmltree::{Document, Node};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use subtle::ConstantTimeEq;

use super::c14n::{ExclusiveCanonicalizer, ENVELOPED_SIGNATURE, EXC_C14N};
use super::mapping::AttributeMapping;
use super::oauth::local_part;
use super::{ExternalIdentity, FederationError, SyncPolicy};
use crate::config::SamlConfig;
use crate::utils::generate_random_token;

pub const PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
const METADATA_NS: &str = "urn:oasis:names:tc:SAML:2.0:metadata";
pub const STATUS_SUCCESS: &str = "urn:oasis:names:tc:SAML:2.0:status:Success";
pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const SHA256_DIGEST: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const POST_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";
const EMAIL_NAME_ID: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress";

fn malformed(msg: impl Into<String>) -> FederationError {
    FederationError::MalformedResponse(msg.into())
}

fn invalid_signature(msg: impl Into<String>) -> FederationError {
    FederationError::InvalidSignature(msg.into())
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

fn child<'a, 'input>(node: Node<'a, 'input>, ns: &str, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.has_tag_name((ns, name)))
}

fn children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    ns: &'a str,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children().filter(move |n| n.has_tag_name((ns, name)))
}

fn text_of(node: Option<Node<'_, '_>>) -> Option<String> {
    node.and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>, FederationError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| malformed(format!("bad timestamp {}: {}", value, e)))
}

/// `PrefixList` of an `InclusiveNamespaces` child, empty when absent.
fn inclusive_prefixes<'a>(node: Node<'a, '_>) -> &'a str {
    node.children()
        .find(|n| n.has_tag_name((EXC_C14N, "InclusiveNamespaces")))
        .and_then(|n| n.attribute("PrefixList"))
        .unwrap_or_default()
}

/// Accepts `BEGIN PUBLIC KEY` (SPKI) or `BEGIN RSA PUBLIC KEY` (PKCS#1) PEM.
pub fn parse_idp_key(pem: &str) -> Result<RsaPublicKey, FederationError> {
    let pem = pem.trim();
    let parsed = if pem.contains("BEGIN RSA PUBLIC KEY") {
        RsaPublicKey::from_pkcs1_pem(pem).map_err(|e| e.to_string())
    } else {
        RsaPublicKey::from_public_key_pem(pem).map_err(|e| e.to_string())
    };
    parsed.map_err(|e| invalid_signature(format!("unusable IdP public key: {}", e)))
}

pub struct SamlServiceProvider {
    sp_entity_id: String,
    acs_url: String,
    idp_entity_id: String,
    idp_sso_url: String,
    verifying_key: VerifyingKey<Sha256>,
    allow_idp_initiated: bool,
    clock_skew: Duration,
    mapping: AttributeMapping,
    policy: SyncPolicy,
}

impl SamlServiceProvider {
    pub fn new(config: &SamlConfig) -> Result<Self, FederationError> {
        let key = parse_idp_key(&config.idp_public_key_pem)?;
        Ok(Self {
            sp_entity_id: config.sp_entity_id.clone(),
            acs_url: config.acs_url.clone(),
            idp_entity_id: config.idp_entity_id.clone(),
            idp_sso_url: config.idp_sso_url.clone(),
            verifying_key: VerifyingKey::<Sha256>::new(key),
            allow_idp_initiated: config.allow_idp_initiated,
            clock_skew: Duration::seconds(config.clock_skew_seconds),
            mapping: config.mapping.clone(),
            policy: SyncPolicy {
                sync_profile: true,
                admin_group: config.admin_group.clone(),
                sync_groups: config.sync_groups,
            },
        })
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy.clone()
    }

    pub fn allows_idp_initiated(&self) -> bool {
        self.allow_idp_initiated
    }

    pub fn authn_request(&self) -> String {
        format!(
            concat!(
                r#"<samlp:AuthnRequest xmlns:samlp="{}" xmlns:saml="{}" ID="_{}" Version="2.0" "#,
                r#"IssueInstant="{}" Destination="{}" AssertionConsumerServiceURL="{}" "#,
                r#"ProtocolBinding="{}"><saml:Issuer>{}</saml:Issuer>"#,
                r#"<samlp:NameIDPolicy Format="{}" AllowCreate="true"/></samlp:AuthnRequest>"#
            ),
            PROTOCOL_NS,
            ASSERTION_NS,
            generate_random_token(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            xml_escape(&self.idp_sso_url),
            xml_escape(&self.acs_url),
            POST_BINDING,
            xml_escape(&self.sp_entity_id),
            EMAIL_NAME_ID,
        )
    }

    /// Redirect-binding URL carrying a base64 AuthnRequest and the RelayState.
    pub fn redirect_url(&self, relay_state: &str) -> String {
        let request = STANDARD.encode(self.authn_request());
        let separator = if self.idp_sso_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}SAMLRequest={}&RelayState={}",
            self.idp_sso_url,
            separator,
            urlencoding::encode(&request),
            urlencoding::encode(relay_state)
        )
    }

    /// SP metadata document for registration at the IdP.
    pub fn metadata(&self) -> String {
        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<md:EntityDescriptor xmlns:md="{}" entityID="{}">"#,
                r#"<md:SPSSODescriptor AuthnRequestsSigned="false" WantAssertionsSigned="true" "#,
                r#"protocolSupportEnumeration="{}">"#,
                r#"<md:NameIDFormat>{}</md:NameIDFormat>"#,
                r#"<md:AssertionConsumerService Binding="{}" Location="{}" index="0" isDefault="true"/>"#,
                r#"</md:SPSSODescriptor></md:EntityDescriptor>"#
            ),
            METADATA_NS,
            xml_escape(&self.sp_entity_id),
            PROTOCOL_NS,
            EMAIL_NAME_ID,
            POST_BINDING,
            xml_escape(&self.acs_url),
        )
    }

    /// Decode, verify and map a base64 POST-binding `SAMLResponse`.
    pub fn parse_response(
        &self,
        encoded: &str,
        now: DateTime<Utc>,
    ) -> Result<ExternalIdentity, FederationError> {
        let bytes = STANDARD
            .decode(strip_whitespace(encoded))
            .map_err(|e| malformed(format!("base64: {}", e)))?;
        let xml = String::from_utf8(bytes).map_err(|e| malformed(format!("utf-8: {}", e)))?;
        let document = Document::parse(&xml).map_err(|e| malformed(format!("xml: {}", e)))?;

        let response = document.root_element();
        if !response.has_tag_name((PROTOCOL_NS, "Response")) {
            return Err(malformed("not a SAML Response"));
        }

        let status = child(response, PROTOCOL_NS, "Status")
            .and_then(|s| child(s, PROTOCOL_NS, "StatusCode"))
            .and_then(|c| c.attribute("Value"))
            .unwrap_or_default();
        if status != STATUS_SUCCESS {
            tracing::warn!(status, "SAML response without success status");
            return Err(malformed(format!("IdP status {}", status)));
        }

        let mut assertions = children(response, ASSERTION_NS, "Assertion");
        let assertion = match (assertions.next(), assertions.next()) {
            (Some(a), None) => a,
            (None, _) if child(response, ASSERTION_NS, "EncryptedAssertion").is_some() => {
                return Err(malformed("encrypted assertions are not supported"))
            }
            (None, _) => return Err(malformed("no assertion")),
            (Some(_), Some(_)) => return Err(malformed("multiple assertions")),
        };

        self.verify_signature(&xml, assertion)?;
        self.check_conditions(assertion, now)?;
        self.extract_identity(assertion)
    }

    fn verify_signature(&self, xml: &str, assertion: Node<'_, '_>) -> Result<(), FederationError> {
        let signature = child(assertion, DSIG_NS, "Signature")
            .ok_or_else(|| invalid_signature("assertion is not signed"))?;
        let signed_info = child(signature, DSIG_NS, "SignedInfo")
            .ok_or_else(|| invalid_signature("missing SignedInfo"))?;

        let canonicalization = child(signed_info, DSIG_NS, "CanonicalizationMethod")
            .filter(|m| m.attribute("Algorithm") == Some(EXC_C14N))
            .ok_or_else(|| invalid_signature("unsupported canonicalization method"))?;

        let method = child(signed_info, DSIG_NS, "SignatureMethod").and_then(|m| m.attribute("Algorithm"));
        if method != Some(RSA_SHA256) {
            return Err(invalid_signature(format!(
                "unsupported signature method {}",
                method.unwrap_or("none")
            )));
        }

        let mut references = children(signed_info, DSIG_NS, "Reference");
        let reference = match (references.next(), references.next()) {
            (Some(r), None) => r,
            _ => return Err(invalid_signature("expected exactly one reference")),
        };

        let id = assertion
            .attribute("ID")
            .ok_or_else(|| malformed("assertion has no ID"))?;
        if reference.attribute("URI") != Some(format!("#{}", id).as_str()) {
            return Err(invalid_signature("reference does not cover the assertion"));
        }

        let transforms: Vec<Node<'_, '_>> = child(reference, DSIG_NS, "Transforms")
            .map(|t| children(t, DSIG_NS, "Transform").collect())
            .unwrap_or_default();
        let reference_prefixes = match transforms.as_slice() {
            [enveloped, exclusive]
                if enveloped.attribute("Algorithm") == Some(ENVELOPED_SIGNATURE)
                    && exclusive.attribute("Algorithm") == Some(EXC_C14N) =>
            {
                inclusive_prefixes(*exclusive)
            }
            _ => return Err(invalid_signature("unsupported reference transforms")),
        };

        let digest_method = child(reference, DSIG_NS, "DigestMethod").and_then(|m| m.attribute("Algorithm"));
        if digest_method != Some(SHA256_DIGEST) {
            return Err(invalid_signature("unsupported digest method"));
        }

        let expected_digest = text_of(child(reference, DSIG_NS, "DigestValue"))
            .map(|d| strip_whitespace(&d))
            .ok_or_else(|| invalid_signature("missing DigestValue"))?;

        let canonical_assertion = ExclusiveCanonicalizer::new(xml)
            .with_inclusive_prefixes(reference_prefixes)
            .excluding(signature)
            .canonicalize(assertion);
        let digest = STANDARD.encode(Sha256::digest(canonical_assertion.as_bytes()));
        if !bool::from(digest.as_bytes().ct_eq(expected_digest.as_bytes())) {
            tracing::warn!("SAML assertion digest mismatch");
            return Err(invalid_signature("digest mismatch"));
        }

        let signature_value = text_of(child(signature, DSIG_NS, "SignatureValue"))
            .ok_or_else(|| invalid_signature("missing SignatureValue"))?;
        let signature_bytes = STANDARD
            .decode(strip_whitespace(&signature_value))
            .map_err(|e| invalid_signature(format!("SignatureValue: {}", e)))?;
        let signature_value = Signature::try_from(signature_bytes.as_slice())
            .map_err(|e| invalid_signature(format!("SignatureValue: {}", e)))?;

        let canonical_signed_info = ExclusiveCanonicalizer::new(xml)
            .with_inclusive_prefixes(inclusive_prefixes(canonicalization))
            .canonicalize(signed_info);
        self.verifying_key
            .verify(canonical_signed_info.as_bytes(), &signature_value)
            .map_err(|_| {
                tracing::warn!("SAML signature verification failed");
                invalid_signature("signature does not match the IdP key")
            })
    }

    fn check_conditions(&self, assertion: Node<'_, '_>, now: DateTime<Utc>) -> Result<(), FederationError> {
        if !self.idp_entity_id.is_empty() {
            match text_of(child(assertion, ASSERTION_NS, "Issuer")) {
                Some(issuer) if issuer == self.idp_entity_id => {}
                Some(issuer) => return Err(malformed(format!("unexpected issuer {}", issuer))),
                None => return Err(malformed("assertion has no issuer")),
            }
        }

        let conditions =
            child(assertion, ASSERTION_NS, "Conditions").ok_or_else(|| malformed("no conditions"))?;

        if let Some(not_before) = conditions.attribute("NotBefore") {
            if now + self.clock_skew < parse_instant(not_before)? {
                return Err(malformed("assertion not yet valid"));
            }
        }

        let not_on_or_after = conditions
            .attribute("NotOnOrAfter")
            .ok_or_else(|| malformed("conditions without NotOnOrAfter"))?;
        if now - self.clock_skew >= parse_instant(not_on_or_after)? {
            return Err(malformed("assertion expired"));
        }

        let confirmation_deadline = child(assertion, ASSERTION_NS, "Subject")
            .and_then(|s| child(s, ASSERTION_NS, "SubjectConfirmation"))
            .and_then(|c| child(c, ASSERTION_NS, "SubjectConfirmationData"))
            .and_then(|d| d.attribute("NotOnOrAfter"));
        if let Some(deadline) = confirmation_deadline {
            if now - self.clock_skew >= parse_instant(deadline)? {
                return Err(malformed("subject confirmation expired"));
            }
        }

        let audience_matches = children(conditions, ASSERTION_NS, "AudienceRestriction")
            .flat_map(|r| children(r, ASSERTION_NS, "Audience"))
            .filter_map(|a| text_of(Some(a)))
            .any(|a| a == self.sp_entity_id);
        if !audience_matches {
            return Err(malformed("audience does not include this service provider"));
        }

        Ok(())
    }

    fn extract_identity(&self, assertion: Node<'_, '_>) -> Result<ExternalIdentity, FederationError> {
        let name_id = text_of(
            child(assertion, ASSERTION_NS, "Subject").and_then(|s| child(s, ASSERTION_NS, "NameID")),
        )
        .ok_or_else(|| malformed("no NameID"))?;

        let mut attributes: HashMap<String, Vec<String>> = HashMap::new();
        for statement in children(assertion, ASSERTION_NS, "AttributeStatement") {
            for attribute in children(statement, ASSERTION_NS, "Attribute") {
                let Some(name) = attribute.attribute("Name") else {
                    continue;
                };
                let values = children(attribute, ASSERTION_NS, "AttributeValue")
                    .filter_map(|v| text_of(Some(v)));
                attributes.entry(name.to_string()).or_default().extend(values);
            }
        }

        let mapped = self.mapping.apply(&attributes);
        let email = mapped
            .email
            .or_else(|| name_id.contains('@').then(|| name_id.clone()))
            .ok_or_else(|| FederationError::UserInfo("assertion carries no email".to_string()))?;
        let username = match mapped.username {
            Some(u) if u.contains('@') => local_part(&u),
            Some(u) => u,
            None => local_part(&email),
        };

        Ok(ExternalIdentity {
            external_id: name_id,
            email,
            username,
            display_name: mapped.display_name,
            groups: mapped.groups,
            tokens: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDP_PUBLIC_KEY: &str = include_str!("../../tests/fixtures/idp_public_key.pem");
    const SHIBBOLETH_RESPONSE: &str = include_str!("../../tests/fixtures/saml/shibboleth_response.xml");
    const AZURE_RESPONSE: &str = include_str!("../../tests/fixtures/saml/azure_response.xml");

    fn issued_at() -> DateTime<Utc> {
        "2024-06-01T12:01:00Z".parse().unwrap()
    }

    fn provider() -> SamlServiceProvider {
        SamlServiceProvider::new(&SamlConfig {
            sp_entity_id: "https://hub.example.com/saml".to_string(),
            acs_url: "https://hub.example.com/saml/acs".to_string(),
            idp_entity_id: "https://idp.example.com".to_string(),
            idp_sso_url: "https://idp.example.com/sso".to_string(),
            idp_public_key_pem: IDP_PUBLIC_KEY.to_string(),
            allow_idp_initiated: false,
            clock_skew_seconds: 60,
            mapping: AttributeMapping::saml_default(),
            admin_group: None,
            sync_groups: false,
        })
        .unwrap()
    }

    fn response_with(assertion: &str, status: &str) -> String {
        STANDARD.encode(format!(
            r#"<samlp:Response xmlns:samlp="{}" ID="_r" Version="2.0"><samlp:Status><samlp:StatusCode Value="{}"/></samlp:Status>{}</samlp:Response>"#,
            PROTOCOL_NS, status, assertion
        ))
    }

    const UNSIGNED_ASSERTION: &str = r#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_a"><saml:Issuer>https://idp.example.com</saml:Issuer><saml:Subject><saml:NameID>mona@example.com</saml:NameID></saml:Subject><saml:Conditions NotOnOrAfter="2999-01-01T00:00:00Z"><saml:AudienceRestriction><saml:Audience>https://hub.example.com/saml</saml:Audience></saml:AudienceRestriction></saml:Conditions></saml:Assertion>"#;

    #[test]
    fn test_redirect_url_carries_request_and_relay_state() {
        let url = provider().redirect_url("relay-1");
        assert!(url.starts_with("https://idp.example.com/sso?SAMLRequest="));
        assert!(url.ends_with("&RelayState=relay-1"));

        let encoded = url
            .split("SAMLRequest=")
            .nth(1)
            .and_then(|rest| rest.split('&').next())
            .unwrap();
        let xml = String::from_utf8(
            STANDARD
                .decode(urlencoding::decode(encoded).unwrap().as_bytes())
                .unwrap(),
        )
        .unwrap();
        let doc = Document::parse(&xml).unwrap();
        let root = doc.root_element();
        assert!(root.has_tag_name((PROTOCOL_NS, "AuthnRequest")));
        assert_eq!(
            root.attribute("AssertionConsumerServiceURL"),
            Some("https://hub.example.com/saml/acs")
        );
    }

    #[test]
    fn test_metadata_is_well_formed() {
        let metadata = provider().metadata();
        let doc = Document::parse(&metadata).unwrap();
        assert_eq!(
            doc.root_element().attribute("entityID"),
            Some("https://hub.example.com/saml")
        );
        assert!(metadata.contains(r#"WantAssertionsSigned="true""#));
    }

    #[test]
    fn test_unsigned_assertion_rejected() {
        let result = provider().parse_response(&response_with(UNSIGNED_ASSERTION, STATUS_SUCCESS), Utc::now());
        assert!(matches!(result, Err(FederationError::InvalidSignature(_))));
    }

    #[test]
    fn test_failed_status_rejected_before_anything_else() {
        let result = provider().parse_response(
            &response_with(UNSIGNED_ASSERTION, "urn:oasis:names:tc:SAML:2.0:status:Requester"),
            Utc::now(),
        );
        assert!(matches!(result, Err(FederationError::MalformedResponse(m)) if m.contains("Requester")));
    }

    #[test]
    fn test_garbage_rejected() {
        let p = provider();
        assert!(matches!(
            p.parse_response("%%%", Utc::now()),
            Err(FederationError::MalformedResponse(_))
        ));
        assert!(matches!(
            p.parse_response(&STANDARD.encode("<html/>"), Utc::now()),
            Err(FederationError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_pretty_printed_response_verified() {
        let identity = provider()
            .parse_response(&STANDARD.encode(SHIBBOLETH_RESPONSE), issued_at())
            .unwrap();

        assert_eq!(identity.external_id, "AAdzZWNyZXQx");
        assert_eq!(identity.email, "grace@corp.example.com");
        assert_eq!(identity.username, "grace");
        assert!(identity.groups.contains(&"R&D".to_string()));
        assert!(identity.groups.contains(&"hub-admins".to_string()));
    }

    #[test]
    fn test_default_namespace_response_verified() {
        let identity = provider()
            .parse_response(&STANDARD.encode(AZURE_RESPONSE), issued_at())
            .unwrap();

        assert_eq!(identity.external_id, "x3Zb-Q1vE");
        assert_eq!(identity.email, "alan@corp.example.com");
        assert_eq!(identity.groups, vec!["4f6e-admins".to_string()]);
    }

    #[test]
    fn test_altered_fixture_rejected() {
        let p = provider();
        let tampered = SHIBBOLETH_RESPONSE.replace("grace@corp", "mallory@corp");
        assert!(matches!(
            p.parse_response(&STANDARD.encode(tampered), issued_at()),
            Err(FederationError::InvalidSignature(m)) if m.contains("digest")
        ));

        let reindented = AZURE_RESPONSE.replace("<Subject>", "<Subject>\n  ");
        assert!(matches!(
            p.parse_response(&STANDARD.encode(reindented), issued_at()),
            Err(FederationError::InvalidSignature(_))
        ));

        let expired = "2024-06-01T12:10:00Z".parse().unwrap();
        assert!(matches!(
            p.parse_response(&STANDARD.encode(SHIBBOLETH_RESPONSE), expired),
            Err(FederationError::MalformedResponse(m)) if m.contains("expired")
        ));
    }

    #[test]
    fn test_only_enveloped_exclusive_transforms_accepted() {
        let p = provider();
        let enveloped =
            r#"<ds:Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"/>"#;

        let missing_enveloped = SHIBBOLETH_RESPONSE.replace(enveloped, "");
        assert!(matches!(
            p.parse_response(&STANDARD.encode(missing_enveloped), issued_at()),
            Err(FederationError::InvalidSignature(m)) if m.contains("transforms")
        ));

        let extra = SHIBBOLETH_RESPONSE.replace(
            enveloped,
            &format!(
                r#"{}<ds:Transform Algorithm="http://www.w3.org/TR/1999/REC-xpath-19991116"/>"#,
                enveloped
            ),
        );
        assert!(matches!(
            p.parse_response(&STANDARD.encode(extra), issued_at()),
            Err(FederationError::InvalidSignature(m)) if m.contains("transforms")
        ));

        let inclusive = SHIBBOLETH_RESPONSE.replace(
            r#"<ds:CanonicalizationMethod Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/>"#,
            r#"<ds:CanonicalizationMethod Algorithm="http://www.w3.org/TR/2001/REC-xml-c14n-20010315"/>"#,
        );
        assert!(matches!(
            p.parse_response(&STANDARD.encode(inclusive), issued_at()),
            Err(FederationError::InvalidSignature(m)) if m.contains("canonicalization")
        ));
    }

    #[test]
    fn test_assertion_without_issuer_rejected() {
        let p = provider();
        let anonymous = UNSIGNED_ASSERTION.replace("<saml:Issuer>https://idp.example.com</saml:Issuer>", "");
        let doc = Document::parse(&anonymous).unwrap();
        assert!(matches!(
            p.check_conditions(doc.root_element(), Utc::now()),
            Err(FederationError::MalformedResponse(m)) if m.contains("no issuer")
        ));

        let doc = Document::parse(UNSIGNED_ASSERTION).unwrap();
        assert!(p.check_conditions(doc.root_element(), Utc::now()).is_ok());
    }

    #[test]
    fn test_bad_key_rejected() {
        assert!(parse_idp_key("-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----").is_err());
    }
}

//! Exclusive XML canonicalization (`xml-exc-c14n#`, comments omitted) over a parsed tree.
//!
//! Renders one element subtree the way an XML-DSig signer saw it: namespace declarations
//! only where visibly used (plus an optional inclusive prefix list), attributes sorted by
//! namespace URI then local name, empty elements as start/end pairs, and canonical escaping.

use roxmltree::{Node, NodeId, NodeType};
use std::collections::{BTreeSet, HashMap};

pub const EXC_C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
const XML_NS: &str = "http://www.w3.org/XML/1998/namespace";

pub struct ExclusiveCanonicalizer<'s> {
    source: &'s str,
    inclusive_prefixes: Vec<String>,
    excluded: Option<NodeId>,
}

impl<'s> ExclusiveCanonicalizer<'s> {
    /// `source` must be the text the tree was parsed from; element prefixes are read from it.
    pub fn new(source: &'s str) -> Self {
        Self {
            source,
            inclusive_prefixes: Vec::new(),
            excluded: None,
        }
    }

    /// Whitespace separated `PrefixList` of an `InclusiveNamespaces` element.
    pub fn with_inclusive_prefixes(mut self, prefix_list: &str) -> Self {
        self.inclusive_prefixes = prefix_list
            .split_whitespace()
            .map(|p| if p == "#default" { String::new() } else { p.to_string() })
            .collect();
        self
    }

    /// Leave `node` and its subtree out of the output (enveloped-signature transform).
    pub fn excluding(mut self, node: Node<'_, '_>) -> Self {
        self.excluded = Some(node.id());
        self
    }

    pub fn canonicalize(&self, apex: Node<'_, '_>) -> String {
        let mut out = String::new();
        self.write_element(apex, &HashMap::new(), &mut out);
        out
    }

    fn qualified_name(&self, node: Node<'_, '_>) -> String {
        let raw = self.source.get(node.range()).unwrap_or_default();
        let name = raw.strip_prefix('<').unwrap_or_default();
        let end = name
            .find(|c: char| c.is_whitespace() || c == '>' || c == '/')
            .unwrap_or(name.len());
        match &name[..end] {
            "" => node.tag_name().name().to_string(),
            qualified => qualified.to_string(),
        }
    }

    fn write_element(
        &self,
        node: Node<'_, '_>,
        rendered: &HashMap<String, String>,
        out: &mut String,
    ) {
        let qname = self.qualified_name(node);
        let element_prefix = qname.split_once(':').map(|(p, _)| p).unwrap_or_default();

        let mut used: BTreeSet<String> = BTreeSet::new();
        used.insert(element_prefix.to_string());

        let mut attributes: Vec<(String, String, String, String)> = Vec::new();
        for attribute in node.attributes() {
            let (uri, qualified) = match attribute.namespace() {
                Some(uri) => {
                    let prefix = attribute_prefix(node, uri);
                    if prefix != "xml" {
                        used.insert(prefix.clone());
                    }
                    (uri.to_string(), format!("{}:{}", prefix, attribute.name()))
                }
                None => (String::new(), attribute.name().to_string()),
            };
            attributes.push((
                uri,
                attribute.name().to_string(),
                qualified,
                attribute.value().to_string(),
            ));
        }
        attributes.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));

        used.extend(self.inclusive_prefixes.iter().cloned());

        let mut scope = rendered.clone();
        let mut declarations = String::new();
        for prefix in &used {
            if prefix == "xml" {
                continue;
            }
            let uri = namespace_uri(node, prefix);
            let render = match rendered.get(prefix) {
                Some(previous) => previous != &uri,
                None => !uri.is_empty(),
            };
            if !render {
                continue;
            }
            if prefix.is_empty() {
                declarations.push_str(" xmlns=\"");
            } else {
                declarations.push_str(" xmlns:");
                declarations.push_str(prefix);
                declarations.push_str("=\"");
            }
            declarations.push_str(&escape_attribute(&uri));
            declarations.push('"');
            scope.insert(prefix.clone(), uri);
        }

        out.push('<');
        out.push_str(&qname);
        out.push_str(&declarations);
        for (_, _, qualified, value) in &attributes {
            out.push(' ');
            out.push_str(qualified);
            out.push_str("=\"");
            out.push_str(&escape_attribute(value));
            out.push('"');
        }
        out.push('>');

        for child in node.children() {
            match child.node_type() {
                NodeType::Element => {
                    if Some(child.id()) != self.excluded {
                        self.write_element(child, &scope, out);
                    }
                }
                NodeType::Text => out.push_str(&escape_text(child.text().unwrap_or_default())),
                NodeType::PI => {
                    if let Some(pi) = child.pi() {
                        out.push_str("<?");
                        out.push_str(pi.target);
                        if let Some(value) = pi.value.filter(|v| !v.is_empty()) {
                            out.push(' ');
                            out.push_str(value);
                        }
                        out.push_str("?>");
                    }
                }
                NodeType::Comment | NodeType::Root => {}
            }
        }

        out.push_str("</");
        out.push_str(&qname);
        out.push('>');
    }
}

/// In-scope URI bound to `prefix` (`""` is the default namespace), empty when unbound.
fn namespace_uri(node: Node<'_, '_>, prefix: &str) -> String {
    node.namespaces()
        .find(|ns| ns.name().unwrap_or_default() == prefix)
        .map(|ns| ns.uri().to_string())
        .unwrap_or_default()
}

fn attribute_prefix(node: Node<'_, '_>, uri: &str) -> String {
    if uri == XML_NS {
        return "xml".to_string();
    }
    node.namespaces()
        .find(|ns| ns.uri() == uri && ns.name().is_some())
        .and_then(|ns| ns.name())
        .unwrap_or_default()
        .to_string()
}

fn escape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
    out
}

fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
    out
}

// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Distinguished names as flat `(TYPE, value)` lists, used for trusted
//! identity matching.

use std::collections::HashSet;

use der::asn1::ObjectIdentifier;
use x509_cert::name::Name;

use super::{CertificateError, Result};

const ATTRIBUTE_TYPES: &[(&str, &str)] = &[
    ("2.5.4.3", "CN"),
    ("2.5.4.4", "SN"),
    ("2.5.4.5", "SERIALNUMBER"),
    ("2.5.4.6", "C"),
    ("2.5.4.7", "L"),
    ("2.5.4.8", "ST"),
    ("2.5.4.9", "STREET"),
    ("2.5.4.10", "O"),
    ("2.5.4.11", "OU"),
    ("2.5.4.12", "T"),
    ("2.5.4.42", "GN"),
    ("0.9.2342.19200300.100.1.25", "DC"),
    ("1.2.840.113549.1.9.1", "E"),
];

/// Attributes that a trusted identity must pin.
const MANDATORY_ATTRIBUTES: &[&str] = &["C", "ST", "O"];

fn short_name(oid: &ObjectIdentifier) -> String {
    let dotted = oid.to_string();
    ATTRIBUTE_TYPES
        .iter()
        .find(|(o, _)| *o == dotted)
        .map(|(_, name)| name.to_string())
        .unwrap_or(dotted)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistinguishedName(pub Vec<(String, String)>);

impl DistinguishedName {
    /// Flattens the RDN sequence of a certificate name.
    pub fn from_name(name: &Name) -> Self {
        let mut attrs = Vec::new();
        for rdn in name.0.iter() {
            for atv in rdn.0.iter() {
                let value = String::from_utf8_lossy(atv.value.value()).into_owned();
                attrs.push((short_name(&atv.oid), value));
            }
        }
        Self(attrs)
    }

    /// Parses an RFC 4514 string such as `CN=acme,O=Acme\, Inc.,C=US`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut attrs = Vec::new();
        for part in split_unescaped(s) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| CertificateError::InvalidName(format!("`{part}` is not TYPE=value")))?;
            let key = key.trim().to_ascii_uppercase();
            let value = unescape(value.trim());
            if key.is_empty() || value.is_empty() {
                return Err(CertificateError::InvalidName(format!(
                    "empty attribute in `{s}`"
                )));
            }
            attrs.push((key, value));
        }
        if attrs.is_empty() {
            return Err(CertificateError::InvalidName(format!("`{s}` is empty")));
        }
        Ok(Self(attrs))
    }

    /// Parses a trusted identity DN: no duplicate attributes, C, ST and O required.
    pub fn parse_identity(s: &str) -> Result<Self> {
        let dn = Self::parse(s)?;
        let mut seen = HashSet::new();
        for (key, _) in &dn.0 {
            if !seen.insert(key.as_str()) {
                return Err(CertificateError::InvalidName(format!(
                    "`{s}` has duplicate attribute {key}"
                )));
            }
        }
        for required in MANDATORY_ATTRIBUTES {
            if !seen.contains(required) {
                return Err(CertificateError::InvalidName(format!(
                    "`{s}` is missing mandatory attribute {required}"
                )));
            }
        }
        Ok(dn)
    }

    pub fn get<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.0
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// True when every attribute of `self` appears with the same value in `subject`.
    pub fn is_subset_of(&self, subject: &DistinguishedName) -> bool {
        self.0
            .iter()
            .all(|(key, value)| subject.get(key).any(|v| v == value))
    }
}

fn split_unescaped(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ',' || c == '+' {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    parts.push(current);
    parts
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use test_utils::{CertSpec, Profile};

    #[rstest]
    #[case("C=US, ST=WA, O=Notary", true)]
    #[case("CN=acme,O=Acme\\, Inc.,ST=WA,C=US", true)]
    #[case("C=US, O=Notary", false)]
    #[case("C=US, ST=WA, O=Notary, O=Other", false)]
    #[case("C=US, ST=WA, Notary", false)]
    #[case("", false)]
    fn test_parse_identity(#[case] input: &str, #[case] ok: bool) {
        assert_eq!(DistinguishedName::parse_identity(input).is_ok(), ok, "{input}");
    }

    #[test]
    fn test_escaped_comma() {
        let dn = DistinguishedName::parse("CN=acme,O=Acme\\, Inc.,C=US").unwrap();
        assert_eq!(dn.get("O").collect::<Vec<_>>(), vec!["Acme, Inc."]);
    }

    #[test]
    fn test_subset_match_against_certificate() {
        let id = CertSpec::new("Signer", Profile::CodeSigning).self_signed();
        let cert = crate::x509::parse_der(&id.cert_der()).unwrap();
        let subject = DistinguishedName::from_name(&cert.tbs_certificate.subject);

        let policy = DistinguishedName::parse_identity("C=US, ST=WA, O=Notary").unwrap();
        assert!(policy.is_subset_of(&subject));

        let policy = DistinguishedName::parse_identity("C=US, ST=WA, O=Notary, CN=Signer").unwrap();
        assert!(policy.is_subset_of(&subject));

        let policy = DistinguishedName::parse_identity("C=US, ST=WA, O=Other").unwrap();
        assert!(!policy.is_subset_of(&subject));
    }
}

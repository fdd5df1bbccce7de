// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! `trustpolicy.oci.json`: statements selected by registry scope.

use std::{collections::HashMap, path::Path};

use serde::{Deserialize, Serialize};

use super::{
    check_unique_names, check_version, invalid, load_document, PolicyError, PolicyStatement,
    Result, WILDCARD,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciPolicyStatement {
    pub registry_scopes: Vec<String>,
    #[serde(flatten)]
    pub statement: PolicyStatement,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciTrustPolicy {
    pub version: String,
    pub trust_policies: Vec<OciPolicyStatement>,
}

impl OciTrustPolicy {
    /// Loads and validates the document at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let policy: Self = load_document(path)?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<()> {
        check_version(&self.version)?;
        if self.trust_policies.is_empty() {
            return Err(PolicyError::Invalid("no trust policy statements".into()));
        }
        check_unique_names(self.trust_policies.iter().map(|s| s.statement.name.as_str()))?;

        let mut owners: HashMap<&str, &str> = HashMap::new();
        for entry in &self.trust_policies {
            let name = entry.statement.name.as_str();
            entry.statement.validate()?;

            if entry.registry_scopes.is_empty() {
                return Err(invalid(name, "no registry scopes"));
            }
            if entry.registry_scopes.iter().any(|s| s == WILDCARD)
                && entry.registry_scopes.len() > 1
            {
                return Err(invalid(
                    name,
                    "wildcard scope `*` cannot be mixed with other scopes",
                ));
            }
            for scope in &entry.registry_scopes {
                if scope != WILDCARD {
                    validate_scope(scope).map_err(|reason| invalid(name, reason))?;
                }
                if let Some(other) = owners.insert(scope.as_str(), name) {
                    return Err(PolicyError::Invalid(format!(
                        "registry scope `{scope}` is claimed by both `{other}` and `{name}`"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Selects the statement for an artifact reference such as
    /// `registry.example.com/app@sha256:...`.
    ///
    /// A literal scope match wins over the wildcard statement.
    pub fn statement_for(&self, artifact_reference: &str) -> Result<&PolicyStatement> {
        let scope = scope_of(artifact_reference);
        self.trust_policies
            .iter()
            .find(|s| s.registry_scopes.iter().any(|r| r == scope))
            .or_else(|| {
                self.trust_policies
                    .iter()
                    .find(|s| s.registry_scopes.iter().any(|r| r == WILDCARD))
            })
            .map(|s| &s.statement)
            .ok_or_else(|| PolicyError::NoApplicablePolicy(artifact_reference.to_string()))
    }
}

/// Strips the tag or digest from a reference, leaving `registry/repository`.
pub fn scope_of(reference: &str) -> &str {
    let without_digest = reference.split('@').next().unwrap_or(reference);
    match without_digest.rfind(':') {
        Some(colon) if !without_digest[colon..].contains('/') => &without_digest[..colon],
        _ => without_digest,
    }
}

fn validate_scope(scope: &str) -> std::result::Result<(), String> {
    let Some((registry, repository)) = scope.split_once('/') else {
        return Err(format!(
            "registry scope `{scope}` must be of the form <registry>/<repository>"
        ));
    };
    if registry.is_empty() {
        return Err(format!("registry scope `{scope}` has an empty registry"));
    }
    if scope_of(scope) != scope {
        return Err(format!(
            "registry scope `{scope}` must not contain a tag or digest"
        ));
    }
    let component_ok = |c: &str| {
        !c.is_empty()
            && c.chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || "._-".contains(ch))
    };
    if !repository.split('/').all(component_ok) {
        return Err(format!(
            "registry scope `{scope}` has an invalid repository name"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn document(statements: serde_json::Value) -> std::result::Result<OciTrustPolicy, PolicyError> {
        let policy: OciTrustPolicy = serde_json::from_value(serde_json::json!({
            "version": "1.0",
            "trustPolicies": statements,
        }))
        .unwrap();
        policy.validate().map(|_| policy)
    }

    fn statement(name: &str, scopes: &[&str]) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "registryScopes": scopes,
            "signatureVerification": {"level": "strict"},
            "trustStores": ["ca:acme"],
            "trustedIdentities": ["*"],
        })
    }

    #[rstest]
    #[case("registry.example.com/app", "registry.example.com/app")]
    #[case("registry.example.com/app:v1", "registry.example.com/app")]
    #[case("registry.example.com/app@sha256:abcd", "registry.example.com/app")]
    #[case("localhost:5000/team/app:v1", "localhost:5000/team/app")]
    #[case("localhost:5000/app", "localhost:5000/app")]
    fn test_scope_of(#[case] reference: &str, #[case] scope: &str) {
        assert_eq!(scope_of(reference), scope);
    }

    #[test]
    fn test_select_literal_then_wildcard() {
        let policy = document(serde_json::json!([
            statement("wildcard", &["*"]),
            statement("app", &["registry.example.com/app", "registry.example.com/lib"]),
        ]))
        .unwrap();

        let name = |r: &str| policy.statement_for(r).unwrap().name.clone();
        assert_eq!(name("registry.example.com/app@sha256:00"), "app");
        assert_eq!(name("registry.example.com/lib:latest"), "app");
        assert_eq!(name("registry.example.com/other:v1"), "wildcard");
    }

    #[test]
    fn test_no_applicable_policy() {
        let policy = document(serde_json::json!([statement(
            "app",
            &["registry.example.com/app"]
        )]))
        .unwrap();
        assert!(matches!(
            policy.statement_for("registry.example.com/other:v1"),
            Err(PolicyError::NoApplicablePolicy(_))
        ));
    }

    #[rstest]
    #[case(serde_json::json!([statement("a", &["*"]), statement("b", &["*"])]))]
    #[case(serde_json::json!([statement("a", &["r.io/x"]), statement("b", &["r.io/x"])]))]
    #[case(serde_json::json!([statement("a", &["r.io/x"]), statement("a", &["r.io/y"])]))]
    #[case(serde_json::json!([statement("a", &["*", "r.io/x"])]))]
    #[case(serde_json::json!([statement("a", &[])]))]
    #[case(serde_json::json!([statement("a", &["r.io/x:v1"])]))]
    #[case(serde_json::json!([statement("a", &["r.io/Upper"])]))]
    #[case(serde_json::json!([statement("a", &["noslash"])]))]
    #[case(serde_json::json!([]))]
    fn test_invalid_documents(#[case] statements: serde_json::Value) {
        assert!(document(statements).is_err());
    }

    #[test]
    fn test_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trustpolicy.oci.json");
        assert!(matches!(
            OciTrustPolicy::load(&path),
            Err(PolicyError::NotFound(_))
        ));

        std::fs::write(
            &path,
            r#"{"version":"1.0","trustPolicies":[{"name":"default","registryScopes":["*"],
            "signatureVerification":{"level":"strict"},
            "trustStores":["ca:acme"],
            "trustedIdentities":["x509.subject:CN=acme,O=Acme,ST=WA,C=US"]}]}"#,
        )
        .unwrap();
        let policy = OciTrustPolicy::load(&path).unwrap();
        assert_eq!(policy.trust_policies[0].statement.name, "default");

        std::fs::write(&path, r#"{"version":"2.0","trustPolicies":[]}"#).unwrap();
        assert!(matches!(
            OciTrustPolicy::load(&path),
            Err(PolicyError::UnsupportedVersion(_))
        ));
    }
}

// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! `trustpolicy.blob.json`: statements selected by name, with an optional
//! global fallback.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{
    check_unique_names, check_version, load_document, PolicyError, PolicyStatement, Result,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobPolicyStatement {
    #[serde(flatten)]
    pub statement: PolicyStatement,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub global_policy: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobTrustPolicy {
    pub version: String,
    pub trust_policies: Vec<BlobPolicyStatement>,
}

impl BlobTrustPolicy {
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
        for entry in &self.trust_policies {
            entry.statement.validate()?;
        }
        if self.trust_policies.iter().filter(|s| s.global_policy).count() > 1 {
            return Err(PolicyError::Invalid(
                "at most one statement may be the global policy".into(),
            ));
        }
        Ok(())
    }

    /// Selects the statement named `name`, or the global statement when no
    /// name is given.
    pub fn statement_for(&self, name: Option<&str>) -> Result<&PolicyStatement> {
        let found = match name {
            Some(name) => self
                .trust_policies
                .iter()
                .find(|s| s.statement.name == name),
            None => self.trust_policies.iter().find(|s| s.global_policy),
        };
        found.map(|s| &s.statement).ok_or_else(|| {
            PolicyError::NoApplicablePolicy(
                name.map(|n| format!("policy `{n}`"))
                    .unwrap_or_else(|| "blob without a policy name".into()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statement(name: &str, global: bool) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "signatureVerification": {"level": "permissive"},
            "trustStores": ["ca:acme"],
            "trustedIdentities": ["*"],
            "globalPolicy": global,
        })
    }

    fn document(statements: serde_json::Value) -> Result<BlobTrustPolicy> {
        let policy: BlobTrustPolicy = serde_json::from_value(serde_json::json!({
            "version": "1.0",
            "trustPolicies": statements,
        }))
        .unwrap();
        policy.validate().map(|_| policy)
    }

    #[test]
    fn test_select_by_name_or_global() {
        let policy = document(serde_json::json!([
            statement("release", false),
            statement("fallback", true),
        ]))
        .unwrap();
        assert_eq!(policy.statement_for(Some("release")).unwrap().name, "release");
        assert_eq!(policy.statement_for(None).unwrap().name, "fallback");
        assert!(matches!(
            policy.statement_for(Some("missing")),
            Err(PolicyError::NoApplicablePolicy(_))
        ));
    }

    #[test]
    fn test_no_global_policy() {
        let policy = document(serde_json::json!([statement("release", false)])).unwrap();
        assert!(matches!(
            policy.statement_for(None),
            Err(PolicyError::NoApplicablePolicy(_))
        ));
    }

    #[test]
    fn test_multiple_global_policies() {
        assert!(document(serde_json::json!([statement("a", true), statement("b", true)])).is_err());
    }
}

// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{fmt, str::FromStr};

use crate::digest::Digest;

use super::RegistryError;

/// An artifact reference: `registry[:port]/repository[:tag|@digest]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl Reference {
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// `registry/repository`, the unit trust policy scopes are written in.
    pub fn scope(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// What to ask the registry for: the digest when pinned, else the tag.
    pub fn manifest_reference(&self) -> Option<String> {
        self.digest
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| self.tag.clone())
    }

    /// The same artifact pinned to `digest`, without a tag.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest),
        }
    }

    /// True for registries reached over plain HTTP without being listed
    /// as insecure.
    pub fn is_localhost(&self) -> bool {
        let host = self
            .registry
            .rsplit_once(':')
            .map_or(self.registry.as_str(), |(host, _)| host);
        matches!(host, "localhost" | "127.0.0.1" | "[::1]")
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        match (&self.digest, &self.tag) {
            (Some(digest), _) => write!(f, "@{digest}"),
            (None, Some(tag)) => write!(f, ":{tag}"),
            (None, None) => Ok(()),
        }
    }
}

fn valid_registry(registry: &str) -> bool {
    !registry.is_empty()
        && registry
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'))
}

fn valid_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let (Some(first), Some(last)) = (bytes.first(), bytes.last()) else {
        return false;
    };
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    alnum(first)
        && alnum(last)
        && bytes
            .iter()
            .all(|b| alnum(b) || matches!(b, b'.' | b'_' | b'-'))
}

fn valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric() || c == '_')
        && tag.len() <= 128
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

impl FromStr for Reference {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| RegistryError::InvalidReference(format!("`{s}`: {reason}"));

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => (
                name,
                Some(
                    digest
                        .parse::<Digest>()
                        .map_err(|_| invalid("invalid digest"))?,
                ),
            ),
            None => (s, None),
        };
        let (registry, path) = name
            .split_once('/')
            .ok_or_else(|| invalid("missing repository"))?;
        if !valid_registry(registry) {
            return Err(invalid("invalid registry"));
        }
        let (repository, tag) = match path.rsplit_once(':') {
            Some((repository, tag)) if !tag.contains('/') => (repository, Some(tag)),
            _ => (path, None),
        };
        if !repository.split('/').all(valid_path_component) {
            return Err(invalid("invalid repository"));
        }
        if let Some(tag) = tag {
            if !valid_tag(tag) {
                return Err(invalid("invalid tag"));
            }
        }
        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.map(str::to_string),
            digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const DIGEST: &str = "sha256:2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae";

    #[rstest]
    #[case("registry.example.com/app:v1", "registry.example.com", "app", Some("v1"), false)]
    #[case("localhost:5000/team/app", "localhost:5000", "team/app", None, false)]
    #[case(&format!("registry.example.com/app@{DIGEST}"), "registry.example.com", "app", None, true)]
    #[case(&format!("registry.example.com/app:v1@{DIGEST}"), "registry.example.com", "app", Some("v1"), true)]
    fn test_parse(
        #[case] input: &str,
        #[case] registry: &str,
        #[case] repository: &str,
        #[case] tag: Option<&str>,
        #[case] pinned: bool,
    ) {
        let reference: Reference = input.parse().unwrap();
        assert_eq!(reference.registry(), registry);
        assert_eq!(reference.repository(), repository);
        assert_eq!(reference.tag(), tag);
        assert_eq!(reference.digest().is_some(), pinned);
    }

    #[rstest]
    #[case("app:v1")]
    #[case("registry.example.com/App:v1")]
    #[case("registry.example.com/app:-bad")]
    #[case("registry.example.com/app@sha256:abc")]
    #[case("registry.example.com/")]
    fn test_parse_invalid(#[case] input: &str) {
        assert!(matches!(
            input.parse::<Reference>(),
            Err(RegistryError::InvalidReference(_))
        ));
    }

    #[test]
    fn test_display_and_pin() {
        let reference: Reference = "localhost:5000/app:v1".parse().unwrap();
        assert!(reference.is_localhost());
        assert_eq!(reference.scope(), "localhost:5000/app");
        assert_eq!(reference.manifest_reference().as_deref(), Some("v1"));

        let pinned = reference.with_digest(DIGEST.parse().unwrap());
        assert_eq!(pinned.to_string(), format!("localhost:5000/app@{DIGEST}"));
        assert_eq!(pinned.manifest_reference().as_deref(), Some(DIGEST));
    }
}

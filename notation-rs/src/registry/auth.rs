// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Registry credentials and the `WWW-Authenticate` challenge flow.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use log::debug;
use serde::Deserialize;

use super::{RegistryError, Result};

pub const ENV_USERNAME: &str = "NOTATION_USERNAME";
pub const ENV_PASSWORD: &str = "NOTATION_PASSWORD";

#[derive(Clone, Default, PartialEq, Eq)]
pub enum Credential {
    #[default]
    Anonymous,
    Basic {
        username: String,
        password: String,
    },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Anonymous => write!(f, "Anonymous"),
            Credential::Basic { username, .. } => write!(f, "Basic({username})"),
        }
    }
}

#[derive(Deserialize, Default)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthConfig>,
}

#[derive(Deserialize, Default)]
struct DockerAuthConfig {
    #[serde(default)]
    auth: String,
}

impl Credential {
    /// `NOTATION_USERNAME` and `NOTATION_PASSWORD`, when both are set.
    pub fn from_env() -> Option<Self> {
        match (std::env::var(ENV_USERNAME), std::env::var(ENV_PASSWORD)) {
            (Ok(username), Ok(password)) if !username.is_empty() => {
                Some(Credential::Basic { username, password })
            }
            _ => None,
        }
    }

    /// The `auths` entry for `registry` in a docker `config.json`.
    pub fn from_docker_config(path: &Path, registry: &str) -> Result<Option<Self>> {
        let config_err = |source| RegistryError::Credentials {
            path: path.display().to_string(),
            source,
        };
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(config_err(e.into())),
        };
        let config: DockerConfigFile = serde_json::from_slice(&content)
            .context("parse docker config")
            .map_err(config_err)?;
        let Some(entry) = config.auths.get(registry) else {
            return Ok(None);
        };
        let decoded = STANDARD
            .decode(entry.auth.trim())
            .context("decode auth")
            .map_err(config_err)?;
        let decoded = String::from_utf8(decoded)
            .context("auth is not UTF-8")
            .map_err(config_err)?;
        let (username, password) = decoded
            .split_once(':')
            .context("auth is not `user:password`")
            .map_err(config_err)?;
        Ok(Some(Credential::Basic {
            username: username.to_string(),
            password: password.to_string(),
        }))
    }

    /// Environment first, then `~/.docker/config.json`, else anonymous.
    pub fn resolve(registry: &str) -> Result<Self> {
        if let Some(credential) = Self::from_env() {
            return Ok(credential);
        }
        let docker_config = dirs::home_dir().map(|home| home.join(".docker").join("config.json"));
        if let Some(credential) = docker_config
            .map(|path: PathBuf| Self::from_docker_config(&path, registry))
            .transpose()?
            .flatten()
        {
            return Ok(credential);
        }
        Ok(Credential::Anonymous)
    }

    fn basic_header(&self) -> Option<String> {
        match self {
            Credential::Anonymous => None,
            Credential::Basic { username, password } => Some(format!(
                "Basic {}",
                STANDARD.encode(format!("{username}:{password}"))
            )),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Challenge {
    Basic,
    Bearer { params: BTreeMap<String, String> },
}

impl Challenge {
    /// Parses a `WWW-Authenticate` header value.
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
        match scheme.to_ascii_lowercase().as_str() {
            "basic" => Ok(Challenge::Basic),
            "bearer" => {
                let params = parse_params(rest)
                    .ok_or_else(|| RegistryError::InvalidChallenge(header.to_string()))?;
                if !params.contains_key("realm") {
                    return Err(RegistryError::InvalidChallenge(header.to_string()));
                }
                Ok(Challenge::Bearer { params })
            }
            _ => Err(RegistryError::InvalidChallenge(header.to_string())),
        }
    }
}

/// `key="value", key=value` pairs. Quoted values may contain commas.
fn parse_params(s: &str) -> Option<BTreeMap<String, String>> {
    let mut params = BTreeMap::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let (key, after) = rest.split_once('=')?;
        let after = after.trim_start();
        let (value, after) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            let end = after.find(',').unwrap_or(after.len());
            (after[..end].trim(), &after[end..])
        };
        params.insert(key.trim().to_ascii_lowercase(), value.to_string());
        rest = after.trim_start().trim_start_matches(',').trim_start();
    }
    Some(params)
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Answers challenges and remembers the resulting `Authorization` header per
/// scope.
pub(crate) struct Authenticator {
    credential: Credential,
    http: reqwest::Client,
    cache: Mutex<HashMap<String, String>>,
}

impl Authenticator {
    pub(crate) fn new(credential: Credential, http: reqwest::Client) -> Self {
        Self {
            credential,
            http,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn cached(&self, scope: &str) -> Option<String> {
        self.cache
            .lock()
            .ok()
            .and_then(|cache| cache.get(scope).cloned())
    }

    fn remember(&self, scope: &str, header: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(scope.to_string(), header.to_string());
        }
    }

    /// Produces an `Authorization` header value for `challenge`.
    pub(crate) async fn authorize(&self, challenge: &Challenge, scope: &str) -> Result<String> {
        let header = match challenge {
            Challenge::Basic => self
                .credential
                .basic_header()
                .ok_or_else(|| RegistryError::Unauthorized(scope.to_string()))?,
            Challenge::Bearer { params } => {
                let token = self.fetch_token(params, scope).await?;
                format!("Bearer {token}")
            }
        };
        self.remember(scope, &header);
        Ok(header)
    }

    async fn fetch_token(&self, params: &BTreeMap<String, String>, scope: &str) -> Result<String> {
        let realm = params
            .get("realm")
            .ok_or_else(|| RegistryError::InvalidChallenge("missing realm".into()))?;
        let mut url = url::Url::parse(realm)
            .map_err(|_| RegistryError::InvalidChallenge(format!("invalid realm `{realm}`")))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = params.get("service") {
                query.append_pair("service", service);
            }
            query.append_pair("scope", scope);
        }
        debug!("requesting registry token from {}", url.as_str());

        let url_str = url.to_string();
        let http_err = |source| RegistryError::Http {
            url: url_str.clone(),
            source,
        };
        let mut request = self.http.get(url);
        if let Some(basic) = self.credential.basic_header() {
            request = request.header(reqwest::header::AUTHORIZATION, basic);
        }
        let response = request.send().await.map_err(http_err)?;
        match response.status().as_u16() {
            200..=299 => {}
            401 | 403 => return Err(RegistryError::Unauthorized(scope.to_string())),
            status => {
                return Err(RegistryError::Status {
                    url: url_str,
                    status,
                })
            }
        }
        let token: TokenResponse = response.json().await.map_err(http_err)?;
        token
            .token
            .or(token.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| RegistryError::InvalidChallenge("token response without token".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serial_test::serial;
    use wiremock::{
        matchers::{header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    #[rstest]
    #[case(
        r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:app:pull""#,
        &[("realm", "https://auth.example.com/token"), ("service", "registry.example.com"), ("scope", "repository:app:pull")]
    )]
    #[case(
        r#"Bearer realm="https://auth.example.com/token", scope="repository:a:pull,push""#,
        &[("realm", "https://auth.example.com/token"), ("scope", "repository:a:pull,push")]
    )]
    #[case(
        r#"bearer Realm=https://auth.example.com/token,service=reg"#,
        &[("realm", "https://auth.example.com/token"), ("service", "reg")]
    )]
    fn test_parse_bearer(#[case] header: &str, #[case] expected: &[(&str, &str)]) {
        let expected = expected
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(
            Challenge::parse(header).unwrap(),
            Challenge::Bearer { params: expected }
        );
    }

    #[rstest]
    #[case("Basic realm=\"registry\"", true)]
    #[case("Bearer service=\"reg\"", false)]
    #[case("Negotiate", false)]
    fn test_parse_other(#[case] header: &str, #[case] ok: bool) {
        assert_eq!(Challenge::parse(header).is_ok(), ok);
    }

    #[test]
    fn test_docker_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            format!(
                r#"{{"auths":{{"registry.example.com":{{"auth":"{}"}}}}}}"#,
                STANDARD.encode("alice:s3cret")
            ),
        )
        .unwrap();

        assert_eq!(
            Credential::from_docker_config(&path, "registry.example.com").unwrap(),
            Some(Credential::Basic {
                username: "alice".into(),
                password: "s3cret".into()
            })
        );
        assert_eq!(Credential::from_docker_config(&path, "other.example.com").unwrap(), None);
        assert_eq!(
            Credential::from_docker_config(&dir.path().join("missing.json"), "x").unwrap(),
            None
        );
    }

    #[test]
    #[serial]
    fn test_credential_from_env() {
        std::env::set_var(ENV_USERNAME, "bob");
        std::env::set_var(ENV_PASSWORD, "pw");
        assert_eq!(
            Credential::from_env(),
            Some(Credential::Basic {
                username: "bob".into(),
                password: "pw".into()
            })
        );
        std::env::remove_var(ENV_PASSWORD);
        assert_eq!(Credential::from_env(), None);
        std::env::remove_var(ENV_USERNAME);
    }

    #[tokio::test]
    async fn test_bearer_token_flow() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("service", "registry.example.com"))
            .and(query_param("scope", "repository:app:pull"))
            .and(header("authorization", "Basic Ym9iOnB3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "t0ken"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let auth = Authenticator::new(
            Credential::Basic {
                username: "bob".into(),
                password: "pw".into(),
            },
            reqwest::Client::new(),
        );
        let challenge = Challenge::parse(&format!(
            r#"Bearer realm="{}/token",service="registry.example.com""#,
            server.uri()
        ))
        .unwrap();
        let scope = "repository:app:pull";
        assert_eq!(auth.cached(scope), None);
        assert_eq!(
            auth.authorize(&challenge, scope).await.unwrap(),
            "Bearer t0ken"
        );
        assert_eq!(auth.cached(scope).as_deref(), Some("Bearer t0ken"));
    }

    #[tokio::test]
    async fn test_basic_challenge_needs_credentials() {
        let auth = Authenticator::new(Credential::Anonymous, reqwest::Client::new());
        assert!(matches!(
            auth.authorize(&Challenge::Basic, "repository:app:pull").await,
            Err(RegistryError::Unauthorized(_))
        ));
    }
}

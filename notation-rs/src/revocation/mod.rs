// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Certificate revocation checking over OCSP and CRLs.
//!
//! Every certificate of a chain except the trust anchor is checked in
//! parallel. OCSP responders are asked first, in the order the certificate
//! lists them; CRL distribution points are consulted when no responder gave a
//! definitive answer.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use log::debug;
use strum::{AsRefStr, Display};
use thiserror::Error;
use x509_cert::Certificate;

use crate::{
    config::Timeouts,
    x509::{self, CertificateError},
};

pub mod cache;
pub mod crl;
pub mod ocsp;

pub use cache::{CacheError, CrlCache, FileCache};
pub use crl::{CrlBundle, CrlFetcher};
pub use ocsp::OcspClient;

pub type Result<T> = std::result::Result<T, RevocationError>;

#[derive(Error, Debug)]
pub enum RevocationError {
    #[error("certificate chain is empty")]
    EmptyChain,

    #[error("failed to build http client")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("unsupported revocation endpoint `{0}`")]
    InvalidUrl(String),

    #[error("response from {url} exceeds {limit} bytes")]
    ResponseTooLarge { url: String, limit: usize },

    #[error("invalid OCSP response: {0}")]
    Ocsp(String),

    #[error("invalid CRL: {0}")]
    Crl(String),

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

/// Revocation status of a certificate or of a whole chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, Display)]
pub enum RevocationStatus {
    Good,
    Revoked,
    Unknown,
}

/// What one OCSP responder or CRL distribution point said.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerResult {
    pub url: String,
    pub status: RevocationStatus,
    pub error: Option<String>,
}

/// Revocation result of one certificate of a chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertRevocationResult {
    pub status: RevocationStatus,
    pub server_results: Vec<ServerResult>,
}

impl CertRevocationResult {
    fn from_servers(server_results: Vec<ServerResult>) -> Self {
        let status = aggregate(server_results.iter().map(|r| r.status), false);
        Self {
            status,
            server_results,
        }
    }
}

/// Folds statuses: any `Revoked` wins, then `Good` when `all_good` is false
/// and at least one is good (or when `all_good` is true and every one is good),
/// else `Unknown`. An empty set is `Unknown` for endpoints and `Good` for chains.
fn aggregate(statuses: impl Iterator<Item = RevocationStatus>, all_good: bool) -> RevocationStatus {
    let (mut any, mut good, mut revoked, mut total) = (false, 0usize, false, 0usize);
    for status in statuses {
        any = true;
        total += 1;
        match status {
            RevocationStatus::Revoked => revoked = true,
            RevocationStatus::Good => good += 1,
            RevocationStatus::Unknown => {}
        }
    }
    if revoked {
        RevocationStatus::Revoked
    } else if !any {
        if all_good {
            RevocationStatus::Good
        } else {
            RevocationStatus::Unknown
        }
    } else if (all_good && good == total) || (!all_good && good > 0) {
        RevocationStatus::Good
    } else {
        RevocationStatus::Unknown
    }
}

/// Chain level status: `Revoked` if any certificate is, `Good` if all are.
pub fn chain_status(results: &[CertRevocationResult]) -> RevocationStatus {
    aggregate(results.iter().map(|r| r.status), true)
}

/// Checks certificate chains for revocation.
#[derive(Clone)]
pub struct RevocationValidator {
    ocsp: OcspClient,
    crl: Arc<CrlFetcher>,
}

impl RevocationValidator {
    pub fn new(timeouts: &Timeouts, cache: Option<Arc<dyn CrlCache>>) -> Result<Self> {
        Ok(Self {
            ocsp: OcspClient::new(timeouts.ocsp)?,
            crl: Arc::new(CrlFetcher::new(timeouts.crl, cache)?),
        })
    }

    pub fn with_clients(ocsp: OcspClient, crl: CrlFetcher) -> Self {
        Self {
            ocsp,
            crl: Arc::new(crl),
        }
    }

    /// Checks every certificate of a leaf-first chain. The last certificate
    /// is the trust anchor and is reported as good without a lookup.
    ///
    /// Results are in chain order.
    pub async fn validate(&self, chain: &[Certificate]) -> Result<Vec<CertRevocationResult>> {
        let Some((anchor, rest)) = chain.split_last() else {
            return Err(RevocationError::EmptyChain);
        };
        let checks = rest
            .iter()
            .zip(chain.iter().skip(1))
            .map(|(cert, issuer)| self.check_certificate(cert, issuer));
        let mut results = join_all(checks).await;
        debug!(
            "trust anchor `{}` is not checked for revocation",
            x509::subject(anchor)
        );
        results.push(CertRevocationResult {
            status: RevocationStatus::Good,
            server_results: vec![],
        });
        Ok(results)
    }

    async fn check_certificate(
        &self,
        cert: &Certificate,
        issuer: &Certificate,
    ) -> CertRevocationResult {
        let subject = x509::subject(cert);
        let ocsp_urls = x509::ocsp_urls(cert).unwrap_or_default();
        let crl_urls = x509::crl_urls(cert).unwrap_or_default();
        if ocsp_urls.is_empty() && crl_urls.is_empty() {
            debug!("`{subject}` has no OCSP or CRL endpoint");
            return CertRevocationResult {
                status: RevocationStatus::Unknown,
                server_results: vec![],
            };
        }

        let mut server_results = Vec::new();
        for url in ocsp_urls {
            let result = match self.ocsp.check(&url, cert, issuer).await {
                Ok(status) => server_result(url, status, None),
                Err(e) => {
                    debug!("OCSP check of `{subject}` against {url} failed: {e}");
                    server_result(url, RevocationStatus::Unknown, Some(error_chain(&e)))
                }
            };
            let definitive = result.status != RevocationStatus::Unknown;
            server_results.push(result);
            if definitive {
                return CertRevocationResult::from_servers(server_results);
            }
        }

        for url in crl_urls {
            let result = match self.crl.check(&url, cert, issuer).await {
                Ok(status) => server_result(url, status, None),
                Err(e) => {
                    debug!("CRL check of `{subject}` against {url} failed: {e}");
                    server_result(url, RevocationStatus::Unknown, Some(error_chain(&e)))
                }
            };
            server_results.push(result);
        }
        CertRevocationResult::from_servers(server_results)
    }
}

fn server_result(url: String, status: RevocationStatus, error: Option<String>) -> ServerResult {
    ServerResult { url, status, error }
}

fn error_chain(e: &RevocationError) -> String {
    let mut message = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Downloads `url` with a timeout and an upper bound on the body size.
pub(crate) async fn fetch(
    request: reqwest::RequestBuilder,
    url: &str,
    timeout: Duration,
    limit: usize,
) -> Result<Vec<u8>> {
    let response = request
        .timeout(timeout)
        .send()
        .await
        .map_err(|source| RevocationError::Http {
            url: url.to_string(),
            source,
        })?;
    if !response.status().is_success() {
        return Err(RevocationError::HttpStatus {
            url: url.to_string(),
            status: response.status().as_u16(),
        });
    }
    if response.content_length().unwrap_or(0) as usize > limit {
        return Err(RevocationError::ResponseTooLarge {
            url: url.to_string(),
            limit,
        });
    }
    let body = response
        .bytes()
        .await
        .map_err(|source| RevocationError::Http {
            url: url.to_string(),
            source,
        })?;
    if body.len() > limit {
        return Err(RevocationError::ResponseTooLarge {
            url: url.to_string(),
            limit,
        });
    }
    Ok(body.to_vec())
}

/// Only plain HTTP(S) endpoints are queried.
pub(crate) fn check_url(url: &str) -> Result<()> {
    match url::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(RevocationError::InvalidUrl(url.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revocation::ocsp::{tests::ocsp_response, CertStatus};
    use der::asn1::Null;
    use rstest::rstest;
    use test_utils::{revocation_list, CertSpec, Identity, Profile};
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };
    use RevocationStatus::*;

    fn result(status: RevocationStatus) -> CertRevocationResult {
        CertRevocationResult {
            status,
            server_results: vec![],
        }
    }

    #[rstest]
    #[case(&[Good, Good, Good], Good)]
    #[case(&[Good, Unknown, Good], Unknown)]
    #[case(&[Unknown, Revoked, Good], Revoked)]
    #[case(&[], Good)]
    fn test_chain_status(#[case] statuses: &[RevocationStatus], #[case] expected: RevocationStatus) {
        let results: Vec<_> = statuses.iter().copied().map(result).collect();
        assert_eq!(chain_status(&results), expected);

        let mut reversed = results.clone();
        reversed.reverse();
        assert_eq!(chain_status(&reversed), expected);
    }

    #[rstest]
    #[case(&[Unknown, Good], Good)]
    #[case(&[Good, Revoked], Revoked)]
    #[case(&[Unknown, Unknown], Unknown)]
    #[case(&[], Unknown)]
    fn test_endpoint_aggregation(
        #[case] statuses: &[RevocationStatus],
        #[case] expected: RevocationStatus,
    ) {
        let servers = statuses
            .iter()
            .map(|s| server_result("http://x".into(), *s, None))
            .collect();
        assert_eq!(CertRevocationResult::from_servers(servers).status, expected);
    }

    #[rstest]
    #[case("http://ocsp.example.com", true)]
    #[case("https://crl.example.com/a.crl", true)]
    #[case("ldap://crl.example.com", false)]
    #[case("not a url", false)]
    fn test_check_url(#[case] url: &str, #[case] ok: bool) {
        assert_eq!(check_url(url).is_ok(), ok);
    }

    struct Responders {
        server: MockServer,
        root: Identity,
        leaf: Identity,
        chain: Vec<Certificate>,
    }

    impl Responders {
        /// A leaf listing two OCSP responders and one CRL distribution point.
        async fn new() -> Self {
            let server = MockServer::start().await;
            let root = CertSpec::new("Root", Profile::Root).self_signed();
            let leaf = CertSpec::new("Leaf", Profile::CodeSigning)
                .ocsp_url(&format!("{}/ocsp-a", server.uri()))
                .ocsp_url(&format!("{}/ocsp-b", server.uri()))
                .crl_url(&format!("{}/root.crl", server.uri()))
                .issued_by(&root);
            let chain = crate::x509::parse_der_chain(&[leaf.cert_der(), root.cert_der()]).unwrap();
            Self {
                server,
                root,
                leaf,
                chain,
            }
        }

        async fn respond(&self, verb: &str, route: &str, response: ResponseTemplate, calls: u64) {
            Mock::given(method(verb))
                .and(path(route))
                .respond_with(response)
                .expect(calls)
                .mount(&self.server)
                .await;
        }

        fn validator(&self) -> RevocationValidator {
            RevocationValidator::new(&Timeouts::default(), None).unwrap()
        }
    }

    #[tokio::test]
    async fn test_first_definitive_ocsp_answer_wins() {
        let fx = Responders::new().await;
        fx.respond("POST", "/ocsp-a", ResponseTemplate::new(500), 1).await;
        let good = ocsp_response(&fx.leaf, &fx.root, &fx.root, CertStatus::Good(Null));
        fx.respond("POST", "/ocsp-b", ResponseTemplate::new(200).set_body_bytes(good), 1)
            .await;
        fx.respond("GET", "/root.crl", ResponseTemplate::new(200), 0).await;

        let results = fx.validator().validate(&fx.chain).await.unwrap();
        assert_eq!(results[0].status, Good);
        let urls: Vec<_> = results[0]
            .server_results
            .iter()
            .map(|r| (r.url.rsplit('/').next().unwrap_or_default().to_string(), r.status))
            .collect();
        assert_eq!(
            urls,
            vec![("ocsp-a".to_string(), Unknown), ("ocsp-b".to_string(), Good)]
        );
        assert!(results[0].server_results[0].error.is_some());
    }

    #[tokio::test]
    async fn test_crl_consulted_when_ocsp_is_silent() {
        let fx = Responders::new().await;
        fx.respond("POST", "/ocsp-a", ResponseTemplate::new(503), 1).await;
        let unknown = ocsp_response(&fx.leaf, &fx.root, &fx.root, CertStatus::Unknown(Null));
        fx.respond("POST", "/ocsp-b", ResponseTemplate::new(200).set_body_bytes(unknown), 1)
            .await;
        let next_update = time::OffsetDateTime::now_utc() + time::Duration::hours(1);
        let crl = revocation_list(&fx.root, &[fx.leaf.serial], next_update);
        fx.respond("GET", "/root.crl", ResponseTemplate::new(200).set_body_bytes(crl), 1)
            .await;

        let results = fx.validator().validate(&fx.chain).await.unwrap();
        assert_eq!(results[0].status, Revoked);
        assert_eq!(results[0].server_results.len(), 3);
        assert_eq!(chain_status(&results), Revoked);
    }

    #[tokio::test]
    async fn test_no_endpoints_is_unknown() {
        let pki = test_utils::TestPki::new();
        let chain = crate::x509::parse_der_chain(&pki.chain_der()).unwrap();
        let validator = RevocationValidator::new(&Timeouts::default(), None).unwrap();
        let results = validator.validate(&chain).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, Unknown);
        assert_eq!(results[1].status, Good);
        assert_eq!(chain_status(&results), Unknown);

        assert!(matches!(
            validator.validate(&[]).await,
            Err(RevocationError::EmptyChain)
        ));
    }
}

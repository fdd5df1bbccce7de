// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! CRL download, validation and lookup.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use der::{Decode, Encode};
use log::{debug, warn};
use x509_cert::{
    crl::CertificateList,
    ext::pkix::CrlDistributionPoints,
    serial_number::SerialNumber,
    Certificate,
};

use super::{
    cache::{CacheError, CrlCache},
    check_url, fetch, RevocationError, RevocationStatus, Result,
};
use crate::{
    crypto::PublicKey,
    x509::{self, oid},
};

const MAX_CRL_SIZE: usize = 32 * 1024 * 1024;

// CRLReason removeFromCRL as encoded in the entry extension.
const REASON_REMOVE_FROM_CRL: &[u8] = &[0x0a, 0x01, 0x08];

static CACHE_ERROR_WARNED: AtomicBool = AtomicBool::new(false);

/// A base CRL and the delta CRLs published alongside it.
#[derive(Clone, Debug)]
pub struct CrlBundle {
    pub base: CertificateList,
    pub deltas: Vec<CertificateList>,
    pub fetched_at: DateTime<Utc>,
}

impl CrlBundle {
    /// Earliest `nextUpdate` of the bundle's CRLs.
    pub fn next_update(&self) -> Option<DateTime<Utc>> {
        std::iter::once(&self.base)
            .chain(self.deltas.iter())
            .map(|crl| crl.tbs_cert_list.next_update.as_ref().map(x509::time_to_chrono))
            .collect::<Option<Vec<_>>>()?
            .into_iter()
            .min()
    }

    /// Checks that every CRL is issued and signed by `issuer` and current at `now`.
    pub fn validate(&self, issuer: &Certificate, now: DateTime<Utc>) -> Result<()> {
        for crl in std::iter::once(&self.base).chain(self.deltas.iter()) {
            validate_crl(crl, issuer, now)?;
        }
        for delta in &self.deltas {
            let is_delta = delta
                .tbs_cert_list
                .crl_extensions
                .iter()
                .flatten()
                .any(|ext| ext.extn_id == oid::ID_CE_DELTA_CRL_INDICATOR);
            if !is_delta {
                return Err(RevocationError::Crl(
                    "freshest CRL is not a delta CRL".into(),
                ));
            }
        }
        Ok(())
    }

    /// Looks `serial` up in the base CRL, then in the deltas. A certificate
    /// put on hold and later removed by a delta is not revoked.
    pub fn status(&self, serial: &SerialNumber) -> RevocationStatus {
        let mut status = RevocationStatus::Good;
        for crl in std::iter::once(&self.base).chain(self.deltas.iter()) {
            let entry = crl
                .tbs_cert_list
                .revoked_certificates
                .iter()
                .flatten()
                .find(|entry| &entry.serial_number == serial);
            let Some(entry) = entry else { continue };
            let reason = entry
                .crl_entry_extensions
                .iter()
                .flatten()
                .find(|ext| ext.extn_id == oid::ID_CE_CRL_REASONS)
                .map(|ext| ext.extn_value.as_bytes());
            status = match reason {
                Some(REASON_REMOVE_FROM_CRL) => RevocationStatus::Good,
                _ => RevocationStatus::Revoked,
            };
        }
        status
    }
}

fn validate_crl(crl: &CertificateList, issuer: &Certificate, now: DateTime<Utc>) -> Result<()> {
    let tbs = &crl.tbs_cert_list;
    if tbs.issuer != issuer.tbs_certificate.subject {
        return Err(RevocationError::Crl(format!(
            "CRL issuer `{}` is not `{}`",
            tbs.issuer,
            x509::subject(issuer)
        )));
    }
    let signed = tbs.to_der().map_err(crl_err)?;
    PublicKey::from_certificate(issuer)
        .and_then(|key| key.verify_x509(&crl.signature_algorithm, &signed, crl.signature.raw_bytes()))
        .map_err(|e| RevocationError::Crl(format!("signature: {e}")))?;
    let next_update = tbs
        .next_update
        .as_ref()
        .map(x509::time_to_chrono)
        .ok_or_else(|| RevocationError::Crl("missing nextUpdate".into()))?;
    if next_update <= now {
        return Err(RevocationError::Crl(format!("expired at {next_update}")));
    }
    Ok(())
}

fn crl_err(e: der::Error) -> RevocationError {
    RevocationError::Crl(e.to_string())
}

/// Delta CRL locations announced by the base CRL's FreshestCRL extension.
fn freshest_crl_urls(base: &CertificateList) -> Result<Vec<String>> {
    let Some(ext) = base
        .tbs_cert_list
        .crl_extensions
        .iter()
        .flatten()
        .find(|ext| ext.extn_id == oid::ID_CE_FRESHEST_CRL)
    else {
        return Ok(vec![]);
    };
    let points = CrlDistributionPoints::from_der(ext.extn_value.as_bytes()).map_err(crl_err)?;
    Ok(x509::distribution_point_urls(&points.0))
}

fn log_cache_error(url: &str, e: &dyn std::error::Error) {
    debug!("CRL cache error for {url}: {e}");
    if !CACHE_ERROR_WARNED.swap(true, Ordering::Relaxed) {
        warn!("CRL cache error discarded: {e}");
    }
}

/// Downloads CRLs through an optional cache. Concurrent requests for the
/// same URL share a single download.
pub struct CrlFetcher {
    http: reqwest::Client,
    timeout: Duration,
    cache: Option<Arc<dyn CrlCache>>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CrlFetcher {
    pub fn new(timeout: Duration, cache: Option<Arc<dyn CrlCache>>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(RevocationError::Client)?;
        Ok(Self {
            http,
            timeout,
            cache,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    /// Checks `cert` against the CRL published at `url`.
    pub async fn check(
        &self,
        url: &str,
        cert: &Certificate,
        issuer: &Certificate,
    ) -> Result<RevocationStatus> {
        let bundle = self.fetch(url, issuer).await?;
        let status = bundle.status(&cert.tbs_certificate.serial_number);
        debug!("CRL {url} reports {status} for `{}`", x509::subject(cert));
        Ok(status)
    }

    /// Returns a validated bundle for `url`, from the cache when possible.
    pub async fn fetch(&self, url: &str, issuer: &Certificate) -> Result<CrlBundle> {
        check_url(url)?;
        if let Some(bundle) = self.cached(url, issuer).await {
            return Ok(bundle);
        }

        let gate = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.entry(url.to_string()).or_default().clone()
        };
        let _guard = gate.lock().await;
        // someone else may have filled the cache while we waited
        if let Some(bundle) = self.cached(url, issuer).await {
            return Ok(bundle);
        }

        let result = self.download(url, issuer).await;
        if let Ok(bundle) = &result {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.set(url, bundle).await {
                    log_cache_error(url, &e);
                }
            }
        }
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(url);
        result
    }

    async fn cached(&self, url: &str, issuer: &Certificate) -> Option<CrlBundle> {
        let cache = self.cache.as_ref()?;
        match cache.get(url).await {
            Ok(bundle) => match bundle.validate(issuer, Utc::now()) {
                Ok(()) => Some(bundle),
                Err(e) => {
                    log_cache_error(url, &e);
                    None
                }
            },
            Err(e @ (CacheError::NotFound(_) | CacheError::Expired(_))) => {
                debug!("{e}");
                None
            }
            Err(e) => {
                log_cache_error(url, &e);
                None
            }
        }
    }

    async fn download(&self, url: &str, issuer: &Certificate) -> Result<CrlBundle> {
        let base = self.download_crl(url).await?;
        let mut deltas = Vec::new();
        // the first reachable delta location is enough
        for delta_url in freshest_crl_urls(&base)? {
            match self.download_crl(&delta_url).await {
                Ok(delta) => {
                    deltas.push(delta);
                    break;
                }
                Err(e) => debug!("delta CRL {delta_url} unavailable: {e}"),
            }
        }
        let bundle = CrlBundle {
            base,
            deltas,
            fetched_at: Utc::now(),
        };
        bundle.validate(issuer, Utc::now())?;
        Ok(bundle)
    }

    async fn download_crl(&self, url: &str) -> Result<CertificateList> {
        check_url(url)?;
        let der = fetch(self.http.get(url), url, self.timeout, MAX_CRL_SIZE).await?;
        CertificateList::from_der(&der).map_err(crl_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revocation::{
        cache::FileCache,
        chain_status, OcspClient, RevocationValidator,
    };
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::sync::atomic::AtomicUsize;
    use test_utils::{revocation_list, CertSpec, CrlSpec, Identity, Profile, RevocationReason};
    use time::OffsetDateTime;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn next_hour() -> OffsetDateTime {
        OffsetDateTime::now_utc() + time::Duration::hours(1)
    }

    struct Fixture {
        server: MockServer,
        root: Identity,
        leaf: Identity,
    }

    impl Fixture {
        async fn new() -> Self {
            let server = MockServer::start().await;
            let root = CertSpec::new("Root", Profile::Root).self_signed();
            let leaf = CertSpec::new("Leaf", Profile::CodeSigning)
                .crl_url(&format!("{}/root.crl", server.uri()))
                .issued_by(&root);
            Self { server, root, leaf }
        }

        fn chain(&self) -> Vec<Certificate> {
            vec![
                x509::parse_der(&self.leaf.cert_der()).unwrap(),
                x509::parse_der(&self.root.cert_der()).unwrap(),
            ]
        }

        async fn serve(&self, crl: Vec<u8>, expected_calls: u64) {
            Mock::given(method("GET"))
                .and(path("/root.crl"))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(crl))
                .expect(expected_calls)
                .mount(&self.server)
                .await;
        }
    }

    fn fetcher(cache: Option<Arc<dyn CrlCache>>) -> CrlFetcher {
        CrlFetcher::new(Duration::from_secs(5), cache).unwrap()
    }

    #[tokio::test]
    async fn test_good_and_revoked() {
        let fx = Fixture::new().await;
        let chain = fx.chain();
        fx.serve(revocation_list(&fx.root, &[1, 2, 3], next_hour()), 1)
            .await;
        let url = format!("{}/root.crl", fx.server.uri());
        assert_eq!(
            fetcher(None).check(&url, &chain[0], &chain[1]).await.unwrap(),
            RevocationStatus::Good
        );

        let fx = Fixture::new().await;
        let chain = fx.chain();
        fx.serve(revocation_list(&fx.root, &[fx.leaf.serial], next_hour()), 1)
            .await;
        let validator = RevocationValidator::with_clients(
            OcspClient::new(Duration::from_secs(2)).unwrap(),
            fetcher(None),
        );
        let results = validator.validate(&chain).await.unwrap();
        assert_eq!(results[0].status, RevocationStatus::Revoked);
        assert_eq!(chain_status(&results), RevocationStatus::Revoked);
    }

    #[tokio::test]
    async fn test_crl_from_wrong_issuer() {
        let fx = Fixture::new().await;
        let chain = fx.chain();
        let other = CertSpec::new("Other Root", Profile::Root).self_signed();
        fx.serve(revocation_list(&other, &[], next_hour()), 1).await;
        let url = format!("{}/root.crl", fx.server.uri());
        assert!(matches!(
            fetcher(None).check(&url, &chain[0], &chain[1]).await,
            Err(RevocationError::Crl(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_crl() {
        let fx = Fixture::new().await;
        let chain = fx.chain();
        let stale = OffsetDateTime::now_utc() - time::Duration::minutes(1);
        fx.serve(revocation_list(&fx.root, &[], stale), 1).await;
        let url = format!("{}/root.crl", fx.server.uri());
        assert!(fetcher(None).check(&url, &chain[0], &chain[1]).await.is_err());
    }

    #[tokio::test]
    async fn test_server_error_is_unknown() {
        let fx = Fixture::new().await;
        let chain = fx.chain();
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&fx.server)
            .await;
        let validator = RevocationValidator::with_clients(
            OcspClient::new(Duration::from_secs(2)).unwrap(),
            fetcher(None),
        );
        let results = validator.validate(&chain).await.unwrap();
        assert_eq!(results[0].status, RevocationStatus::Unknown);
        let server = &results[0].server_results[0];
        assert!(server.error.as_deref().unwrap_or_default().contains("500"));
    }

    #[tokio::test]
    async fn test_cache_is_used() {
        let fx = Fixture::new().await;
        let chain = fx.chain();
        fx.serve(revocation_list(&fx.root, &[], next_hour()), 1).await;
        let dir = tempfile::tempdir().unwrap();
        let cache: Arc<dyn CrlCache> = Arc::new(FileCache::new(dir.path()));
        let url = format!("{}/root.crl", fx.server.uri());

        let first = fetcher(Some(cache.clone()));
        first.check(&url, &chain[0], &chain[1]).await.unwrap();
        // a new fetcher over the same directory does not download again
        let second = fetcher(Some(cache.clone()));
        assert_eq!(
            second.check(&url, &chain[0], &chain[1]).await.unwrap(),
            RevocationStatus::Good
        );
        assert!(cache.get(&url).await.is_ok());
    }

    #[tokio::test]
    async fn test_single_flight() {
        let fx = Fixture::new().await;
        let chain = fx.chain();
        fx.serve(revocation_list(&fx.root, &[], next_hour()), 1).await;
        let dir = tempfile::tempdir().unwrap();
        let cache: Arc<dyn CrlCache> = Arc::new(FileCache::new(dir.path()));
        let fetcher = fetcher(Some(cache));
        let url = format!("{}/root.crl", fx.server.uri());

        let checks = (0..8).map(|_| fetcher.check(&url, &chain[0], &chain[1]));
        for status in join_all(checks).await {
            assert_eq!(status.unwrap(), RevocationStatus::Good);
        }
    }

    fn parse_crl(der: &[u8]) -> CertificateList {
        CertificateList::from_der(der).unwrap()
    }

    #[tokio::test]
    async fn test_delta_crl_revokes() {
        let fx = Fixture::new().await;
        let chain = fx.chain();
        let base = CrlSpec::new(next_hour())
            .freshest_url(&format!("{}/delta.crl", fx.server.uri()))
            .signed_by(&fx.root);
        fx.serve(base, 1).await;
        let delta = CrlSpec::new(next_hour())
            .number(2)
            .delta_of(1)
            .revoke(fx.leaf.serial)
            .signed_by(&fx.root);
        Mock::given(method("GET"))
            .and(path("/delta.crl"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(delta))
            .expect(1)
            .mount(&fx.server)
            .await;

        let url = format!("{}/root.crl", fx.server.uri());
        let bundle = fetcher(None).fetch(&url, &chain[1]).await.unwrap();
        assert_eq!(bundle.deltas.len(), 1);
        assert_eq!(
            bundle.status(&chain[0].tbs_certificate.serial_number),
            RevocationStatus::Revoked
        );
    }

    #[tokio::test]
    async fn test_freshest_crl_must_be_delta() {
        let fx = Fixture::new().await;
        let chain = fx.chain();
        let base = CrlSpec::new(next_hour())
            .freshest_url(&format!("{}/delta.crl", fx.server.uri()))
            .signed_by(&fx.root);
        fx.serve(base, 1).await;
        Mock::given(method("GET"))
            .and(path("/delta.crl"))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(revocation_list(&fx.root, &[], next_hour())),
            )
            .mount(&fx.server)
            .await;

        let url = format!("{}/root.crl", fx.server.uri());
        assert!(matches!(
            fetcher(None).check(&url, &chain[0], &chain[1]).await,
            Err(RevocationError::Crl(msg)) if msg.contains("delta")
        ));
    }

    #[tokio::test]
    async fn test_delta_removes_hold() {
        let fx = Fixture::new().await;
        let chain = fx.chain();
        let serial = &chain[0].tbs_certificate.serial_number;
        let base = parse_crl(
            &CrlSpec::new(next_hour())
                .revoke_with(fx.leaf.serial, RevocationReason::CertificateHold)
                .signed_by(&fx.root),
        );
        let delta = parse_crl(
            &CrlSpec::new(next_hour())
                .number(2)
                .delta_of(1)
                .revoke_with(fx.leaf.serial, RevocationReason::RemoveFromCrl)
                .signed_by(&fx.root),
        );

        let held = CrlBundle {
            base: base.clone(),
            deltas: vec![],
            fetched_at: Utc::now(),
        };
        assert_eq!(held.status(serial), RevocationStatus::Revoked);

        let released = CrlBundle {
            base,
            deltas: vec![delta],
            fetched_at: Utc::now(),
        };
        released.validate(&chain[1], Utc::now()).unwrap();
        assert_eq!(released.status(serial), RevocationStatus::Good);
    }

    /// A cache that always fails; lookups still go to the network.
    struct BrokenCache(AtomicUsize);

    #[async_trait]
    impl CrlCache for BrokenCache {
        async fn get(&self, _url: &str) -> std::result::Result<CrlBundle, CacheError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(CacheError::Corrupt("broken".into()))
        }

        async fn set(&self, _url: &str, _bundle: &CrlBundle) -> std::result::Result<(), CacheError> {
            Err(CacheError::Io(std::io::Error::other("read-only")))
        }
    }

    #[tokio::test]
    async fn test_cache_errors_are_discarded() {
        let fx = Fixture::new().await;
        let chain = fx.chain();
        fx.serve(revocation_list(&fx.root, &[], next_hour()), 1).await;
        let cache = Arc::new(BrokenCache(AtomicUsize::new(0)));
        let url = format!("{}/root.crl", fx.server.uri());
        let status = fetcher(Some(cache.clone()))
            .check(&url, &chain[0], &chain[1])
            .await
            .unwrap();
        assert_eq!(status, RevocationStatus::Good);
        assert_eq!(cache.0.load(Ordering::SeqCst), 2);
    }
}

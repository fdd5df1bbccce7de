// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! X.509 helpers: parsing, extension lookup and chain validation.

use chrono::{DateTime, Utc};
use der::{Decode, Encode};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x509_cert::{
    ext::pkix::{
        name::{DistributionPointName, GeneralName},
        AuthorityInfoAccessSyntax, BasicConstraints, CrlDistributionPoints,
    },
    time::Time,
    Certificate,
};

use crate::crypto::{CryptoError, PublicKey};

mod chain;
pub mod name;
pub mod oid;

pub use chain::{build_chain, check_validity, validate_chain, CertificatePurpose};

pub type Result<T> = std::result::Result<T, CertificateError>;

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("certificate chain is empty")]
    EmptyChain,

    #[error("failed to parse certificate: {0}")]
    Parse(String),

    #[error("certificate chain is incomplete: {0}")]
    ChainIncomplete(String),

    #[error("certificate chain is not trusted: root `{0}` is not in the trust store")]
    UntrustedRoot(String),

    #[error("certificate `{subject}` expired at {not_after}")]
    CertExpired {
        subject: String,
        not_after: DateTime<Utc>,
    },

    #[error("certificate `{subject}` is not valid before {not_before}")]
    CertNotYetValid {
        subject: String,
        not_before: DateTime<Utc>,
    },

    #[error("invalid key usage: {0}")]
    InvalidKeyUsage(String),

    #[error("invalid signature on certificate `{0}`")]
    InvalidChainSignature(String),

    #[error("invalid distinguished name: {0}")]
    InvalidName(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl From<der::Error> for CertificateError {
    fn from(e: der::Error) -> Self {
        CertificateError::Parse(e.to_string())
    }
}

pub fn parse_der(der: &[u8]) -> Result<Certificate> {
    Ok(Certificate::from_der(der)?)
}

pub fn parse_der_chain(ders: &[Vec<u8>]) -> Result<Vec<Certificate>> {
    ders.iter().map(|der| parse_der(der)).collect()
}

/// Parses every certificate of a PEM bundle, in file order.
pub fn parse_pem_chain(pem: &[u8]) -> Result<Vec<Certificate>> {
    Ok(Certificate::load_pem_chain(pem)?)
}

pub fn to_der(cert: &Certificate) -> Result<Vec<u8>> {
    Ok(cert.to_der()?)
}

pub fn subject(cert: &Certificate) -> String {
    cert.tbs_certificate.subject.to_string()
}

pub fn time_to_chrono(time: &Time) -> DateTime<Utc> {
    let secs = time.to_unix_duration().as_secs() as i64;
    DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn not_before(cert: &Certificate) -> DateTime<Utc> {
    time_to_chrono(&cert.tbs_certificate.validity.not_before)
}

pub fn not_after(cert: &Certificate) -> DateTime<Utc> {
    time_to_chrono(&cert.tbs_certificate.validity.not_after)
}

/// Hex SHA-256 over the DER encoding.
pub fn thumbprint(cert: &Certificate) -> Result<String> {
    Ok(hex::encode(Sha256::digest(cert.to_der()?)))
}

/// Checks that `cert` carries a valid signature made by `issuer`.
pub fn verify_issued_by(cert: &Certificate, issuer: &Certificate) -> Result<()> {
    let tbs = cert.tbs_certificate.to_der()?;
    PublicKey::from_certificate(issuer)?
        .verify_x509(&cert.signature_algorithm, &tbs, cert.signature.raw_bytes())
        .map_err(|_| CertificateError::InvalidChainSignature(subject(cert)))
}

pub fn is_self_issued(cert: &Certificate) -> bool {
    cert.tbs_certificate.subject == cert.tbs_certificate.issuer
}

pub fn is_self_signed(cert: &Certificate) -> bool {
    is_self_issued(cert) && verify_issued_by(cert, cert).is_ok()
}

pub fn basic_constraints(cert: &Certificate) -> Result<Option<BasicConstraints>> {
    Ok(cert
        .tbs_certificate
        .get::<BasicConstraints>()?
        .map(|(_, bc)| bc))
}

pub fn is_ca(cert: &Certificate) -> bool {
    matches!(basic_constraints(cert), Ok(Some(bc)) if bc.ca)
}

fn uris(names: &[GeneralName]) -> impl Iterator<Item = String> + '_ {
    names.iter().filter_map(|name| match name {
        GeneralName::UniformResourceIdentifier(uri) => Some(uri.to_string()),
        _ => None,
    })
}

/// OCSP responder URLs from the Authority Information Access extension.
pub fn ocsp_urls(cert: &Certificate) -> Result<Vec<String>> {
    let Some((_, aia)) = cert.tbs_certificate.get::<AuthorityInfoAccessSyntax>()? else {
        return Ok(vec![]);
    };
    Ok(aia
        .0
        .iter()
        .filter(|ad| ad.access_method == oid::ID_AD_OCSP)
        .flat_map(|ad| uris(std::slice::from_ref(&ad.access_location)).collect::<Vec<_>>())
        .collect())
}

/// Full-name URIs of CRL distribution points.
pub fn crl_urls(cert: &Certificate) -> Result<Vec<String>> {
    let Some((_, dps)) = cert.tbs_certificate.get::<CrlDistributionPoints>()? else {
        return Ok(vec![]);
    };
    Ok(distribution_point_urls(&dps.0))
}

pub(crate) fn distribution_point_urls(
    points: &[x509_cert::ext::pkix::crl::dp::DistributionPoint],
) -> Vec<String> {
    points
        .iter()
        .filter_map(|dp| match &dp.distribution_point {
            Some(DistributionPointName::FullName(names)) => Some(uris(names).collect::<Vec<_>>()),
            _ => None,
        })
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_utils::{CertSpec, Profile, TestPki};

    #[test]
    fn test_parse_and_inspect() {
        let pki = TestPki::with_leaf(
            CertSpec::new("Leaf", Profile::CodeSigning).crl_url("http://crl.example.com/root.crl"),
        );
        let chain = parse_pem_chain(pki.chain_pem().as_bytes()).unwrap();
        assert_eq!(chain.len(), 2);
        assert!(subject(&chain[0]).contains("CN=Leaf"));
        assert!(is_self_signed(&chain[1]));
        assert!(!is_self_signed(&chain[0]));
        assert!(is_ca(&chain[1]));
        assert!(!is_ca(&chain[0]));
        verify_issued_by(&chain[0], &chain[1]).unwrap();
        assert_eq!(
            crl_urls(&chain[0]).unwrap(),
            vec!["http://crl.example.com/root.crl".to_string()]
        );
        assert!(ocsp_urls(&chain[0]).unwrap().is_empty());
        assert_eq!(thumbprint(&chain[0]).unwrap().len(), 64);
        assert!(not_before(&chain[0]) < not_after(&chain[0]));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_der(b"not a certificate"),
            Err(CertificateError::Parse(_))
        ));
    }
}

// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! RFC 3161 timestamp countersignatures.
//!
//! At signing time a [`Timestamper`] obtains a token over the hash of the
//! envelope signature. At verification time [`SignedToken`] parses the token,
//! checks that it covers the signature and that the TSA really signed it.
//! Trusting the TSA certificate chain is the verifier's business.

use chrono::{DateTime, Utc};
use cms::{
    cert::CertificateChoices,
    content_info::ContentInfo,
    signed_data::{SignedData, SignerIdentifier, SignerInfo},
};
use const_oid::db::rfc5912::{
    ECDSA_WITH_SHA_256, ECDSA_WITH_SHA_384, ECDSA_WITH_SHA_512, ID_EC_PUBLIC_KEY, RSA_ENCRYPTION,
    SHA_256_WITH_RSA_ENCRYPTION, SHA_384_WITH_RSA_ENCRYPTION, SHA_512_WITH_RSA_ENCRYPTION,
};
use der::{asn1::OctetString, Decode, Encode};
use spki::AlgorithmIdentifierOwned;
use thiserror::Error;
use x509_cert::{ext::pkix::SubjectKeyIdentifier, Certificate};

use crate::{
    crypto::{CryptoError, HashAlgorithm, PublicKey},
    x509::{self, oid, CertificateError},
};

pub mod asn1;
mod client;

pub use client::{HttpTimestamper, TimestampRequest, Timestamper};

use asn1::TstInfo;

pub type Result<T> = std::result::Result<T, TimestampError>;

#[derive(Error, Debug)]
pub enum TimestampError {
    #[error("malformed timestamp token: {0}")]
    Malformed(String),

    #[error("timestamp does not cover the signature")]
    MessageImprintMismatch,

    #[error("timestamp response nonce does not match the request")]
    NonceMismatch,

    #[error("timestamp authority rejected the request with status {status}: {reason}")]
    Rejected { status: u8, reason: String },

    #[error("timestamp token signature is invalid")]
    InvalidSignature(#[source] CryptoError),

    #[error("timestamp signer certificate not found in token")]
    SignerNotFound,

    #[error("invalid timestamp authority url `{0}`")]
    InvalidUrl(String),

    #[error("timestamp request to {url} failed")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("timestamp authority {url} returned {status}")]
    HttpStatus { url: String, status: u16 },

    #[error(transparent)]
    Certificate(#[from] CertificateError),
}

impl From<der::Error> for TimestampError {
    fn from(e: der::Error) -> Self {
        TimestampError::Malformed(e.to_string())
    }
}

/// A parsed TimeStampToken.
#[derive(Clone, Debug)]
pub struct SignedToken {
    signed_data: SignedData,
    tst_info: TstInfo,
    tst_info_der: Vec<u8>,
    certificates: Vec<Certificate>,
}

impl SignedToken {
    /// Parses a DER TimeStampToken (a CMS ContentInfo holding SignedData).
    pub fn parse(der: &[u8]) -> Result<Self> {
        let content_info = ContentInfo::from_der(der)?;
        Self::from_content_info(&content_info)
    }

    pub(crate) fn from_content_info(content_info: &ContentInfo) -> Result<Self> {
        if content_info.content_type != oid::ID_SIGNED_DATA {
            return Err(TimestampError::Malformed(format!(
                "content type {} is not signed data",
                content_info.content_type
            )));
        }
        let signed_data: SignedData = content_info.content.decode_as()?;
        let encap = &signed_data.encap_content_info;
        if encap.econtent_type != oid::ID_CT_TST_INFO {
            return Err(TimestampError::Malformed(format!(
                "encapsulated content type {} is not TSTInfo",
                encap.econtent_type
            )));
        }
        let econtent = encap
            .econtent
            .as_ref()
            .ok_or_else(|| TimestampError::Malformed("missing TSTInfo".into()))?;
        let tst_info_der = econtent.decode_as::<OctetString>()?.as_bytes().to_vec();
        let tst_info = TstInfo::from_der(&tst_info_der)?;
        if signed_data.signer_infos.0.len() != 1 {
            return Err(TimestampError::Malformed(format!(
                "expected exactly one signer, found {}",
                signed_data.signer_infos.0.len()
            )));
        }
        let certificates = signed_data
            .certificates
            .iter()
            .flat_map(|set| set.0.iter())
            .filter_map(|choice| match choice {
                CertificateChoices::Certificate(cert) => Some(cert.clone()),
                _ => None,
            })
            .collect();
        Ok(Self {
            signed_data,
            tst_info,
            tst_info_der,
            certificates,
        })
    }

    pub fn tst_info(&self) -> &TstInfo {
        &self.tst_info
    }

    pub fn certificates(&self) -> &[Certificate] {
        &self.certificates
    }

    pub fn gen_time(&self) -> DateTime<Utc> {
        x509::time_to_chrono(&x509_cert::time::Time::GeneralTime(self.tst_info.gen_time))
    }

    /// The interval the TSA vouches for: genTime plus or minus its accuracy.
    pub fn time_range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let accuracy = self
            .tst_info
            .accuracy
            .as_ref()
            .map(|a| a.as_duration())
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or_else(chrono::Duration::zero);
        let gen_time = self.gen_time();
        (gen_time - accuracy, gen_time + accuracy)
    }

    fn signer_info(&self) -> Result<&SignerInfo> {
        self.signed_data
            .signer_infos
            .0
            .iter()
            .next()
            .ok_or_else(|| TimestampError::Malformed("no signer info".into()))
    }

    /// The certificate that signed the token.
    pub fn signer_certificate(&self) -> Result<&Certificate> {
        let signer_info = self.signer_info()?;
        self.certificates
            .iter()
            .find(|cert| match &signer_info.sid {
                SignerIdentifier::IssuerAndSerialNumber(ias) => {
                    cert.tbs_certificate.issuer == ias.issuer
                        && cert.tbs_certificate.serial_number == ias.serial_number
                }
                SignerIdentifier::SubjectKeyIdentifier(ski) => cert
                    .tbs_certificate
                    .get::<SubjectKeyIdentifier>()
                    .ok()
                    .flatten()
                    .is_some_and(|(_, id)| &id == ski),
            })
            .ok_or(TimestampError::SignerNotFound)
    }

    /// Checks that the token covers `message` and carries a valid signature
    /// from its signer certificate. Returns the signer certificate.
    pub fn verify(&self, message: &[u8]) -> Result<&Certificate> {
        let imprint = &self.tst_info.message_imprint;
        let hash = HashAlgorithm::from_oid(&imprint.hash_algorithm.oid)
            .map_err(|e| TimestampError::Malformed(e.to_string()))?;
        if hash.digest(message) != imprint.hashed_message.as_bytes() {
            return Err(TimestampError::MessageImprintMismatch);
        }

        let signer_info = self.signer_info()?;
        let signer = self.signer_certificate()?;
        let digest_hash = HashAlgorithm::from_oid(&signer_info.digest_alg.oid)
            .map_err(|e| TimestampError::Malformed(e.to_string()))?;
        let key = PublicKey::from_certificate(signer).map_err(TimestampError::InvalidSignature)?;
        let algorithm = signature_algorithm(&signer_info.signature_algorithm, digest_hash)?;

        match &signer_info.signed_attrs {
            Some(attrs) => {
                let content_digest = digest_hash.digest(&self.tst_info_der);
                let mut digest_ok = false;
                for attr in attrs.iter() {
                    if attr.oid == oid::ID_MESSAGE_DIGEST {
                        let value = attr
                            .values
                            .iter()
                            .next()
                            .ok_or_else(|| TimestampError::Malformed("empty message digest".into()))?
                            .decode_as::<OctetString>()?;
                        digest_ok = value.as_bytes() == content_digest.as_slice();
                    } else if attr.oid == oid::ID_CONTENT_TYPE {
                        let content_type = attr
                            .values
                            .iter()
                            .next()
                            .ok_or_else(|| TimestampError::Malformed("empty content type".into()))?
                            .decode_as::<der::asn1::ObjectIdentifier>()?;
                        if content_type != oid::ID_CT_TST_INFO {
                            return Err(TimestampError::Malformed(format!(
                                "signed content type {content_type} is not TSTInfo"
                            )));
                        }
                    }
                }
                if !digest_ok {
                    return Err(TimestampError::Malformed(
                        "message digest attribute does not match TSTInfo".into(),
                    ));
                }
                let signed = attrs.to_der()?;
                key.verify_x509(&algorithm, &signed, signer_info.signature.as_bytes())
                    .map_err(TimestampError::InvalidSignature)?;
            }
            None => key
                .verify_x509(&algorithm, &self.tst_info_der, signer_info.signature.as_bytes())
                .map_err(TimestampError::InvalidSignature)?,
        }
        Ok(signer)
    }
}

/// CMS signer infos often name only the key type; combine it with the digest.
fn signature_algorithm(
    declared: &AlgorithmIdentifierOwned,
    digest: HashAlgorithm,
) -> Result<AlgorithmIdentifierOwned> {
    let oid = match (declared.oid, digest) {
        (RSA_ENCRYPTION, HashAlgorithm::Sha256) => SHA_256_WITH_RSA_ENCRYPTION,
        (RSA_ENCRYPTION, HashAlgorithm::Sha384) => SHA_384_WITH_RSA_ENCRYPTION,
        (RSA_ENCRYPTION, HashAlgorithm::Sha512) => SHA_512_WITH_RSA_ENCRYPTION,
        (ID_EC_PUBLIC_KEY, HashAlgorithm::Sha256) => ECDSA_WITH_SHA_256,
        (ID_EC_PUBLIC_KEY, HashAlgorithm::Sha384) => ECDSA_WITH_SHA_384,
        (ID_EC_PUBLIC_KEY, HashAlgorithm::Sha512) => ECDSA_WITH_SHA_512,
        (RSA_ENCRYPTION, _) | (ID_EC_PUBLIC_KEY, _) => {
            return Err(TimestampError::Malformed(format!(
                "unsupported digest {digest} for {}",
                declared.oid
            )))
        }
        _ => return Ok(declared.clone()),
    };
    Ok(AlgorithmIdentifierOwned {
        oid,
        parameters: None,
    })
}

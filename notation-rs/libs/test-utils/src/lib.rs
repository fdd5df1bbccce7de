// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Throwaway X.509 PKI used by the notation-rs test suites.

use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, CrlDistributionPoint,
    CustomExtension, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair,
    KeyUsagePurpose, RevokedCertParams, SerialNumber, SignatureAlgorithm,
};
use der::{
    asn1::{BitString, ObjectIdentifier, OctetString, Uint},
    Decode, Encode,
};
use p256::{
    ecdsa::{signature::Signer, Signature, SigningKey},
    pkcs8::DecodePrivateKey,
};
use time::{Duration, OffsetDateTime};
use x509_cert::{crl::CertificateList, ext::Extension};

pub use rcgen::{RevocationReason, PKCS_ECDSA_P256_SHA256, PKCS_ECDSA_P384_SHA384};

const ID_CE_DELTA_CRL_INDICATOR: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.27");
const ID_CE_FRESHEST_CRL: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.46");

/// What a generated certificate is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    Root,
    Intermediate,
    CodeSigning,
    Timestamping,
    /// A self-signed leaf, usable as a signing authority anchor.
    SelfSignedCodeSigning,
}

/// A certificate together with its private key.
pub struct Identity {
    pub cert: rcgen::Certificate,
    pub key: KeyPair,
    pub subject: String,
    pub serial: u64,
}

impl Identity {
    pub fn cert_der(&self) -> Vec<u8> {
        self.cert.der().to_vec()
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    pub fn key_der(&self) -> Vec<u8> {
        self.key.serialize_der()
    }
}

/// Describes one certificate to generate.
#[derive(Clone)]
pub struct CertSpec {
    pub common_name: String,
    pub profile: Profile,
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
    pub serial: u64,
    pub crl_url: Option<String>,
    /// OCSP responders, in the order the certificate lists them.
    pub ocsp_urls: Vec<String>,
    pub algorithm: &'static SignatureAlgorithm,
}

impl CertSpec {
    pub fn new(common_name: &str, profile: Profile) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            common_name: common_name.to_string(),
            profile,
            not_before: now - Duration::days(1),
            not_after: now + Duration::days(365),
            serial: next_serial(),
            crl_url: None,
            ocsp_urls: vec![],
            algorithm: &PKCS_ECDSA_P256_SHA256,
        }
    }

    pub fn validity(mut self, not_before: OffsetDateTime, not_after: OffsetDateTime) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    /// Makes the certificate expired an hour ago, valid since a day before that.
    pub fn expired(self) -> Self {
        let now = OffsetDateTime::now_utc();
        self.validity(now - Duration::days(2), now - Duration::hours(1))
    }

    pub fn crl_url(mut self, url: &str) -> Self {
        self.crl_url = Some(url.to_string());
        self
    }

    /// Adds an OCSP responder after those already listed.
    pub fn ocsp_url(mut self, url: &str) -> Self {
        self.ocsp_urls.push(url.to_string());
        self
    }

    pub fn algorithm(mut self, algorithm: &'static SignatureAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    fn params(&self) -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CountryName, "US");
        dn.push(DnType::StateOrProvinceName, "WA");
        dn.push(DnType::LocalityName, "Seattle");
        dn.push(DnType::OrganizationName, "Notary");
        dn.push(DnType::CommonName, self.common_name.as_str());
        params.distinguished_name = dn;
        params.not_before = self.not_before;
        params.not_after = self.not_after;
        params.serial_number = Some(SerialNumber::from(self.serial));
        if let Some(url) = &self.crl_url {
            params.crl_distribution_points = vec![CrlDistributionPoint {
                uris: vec![url.clone()],
            }];
        }
        if !self.ocsp_urls.is_empty() {
            params
                .custom_extensions
                .push(CustomExtension::from_oid_content(
                    &[1, 3, 6, 1, 5, 5, 7, 1, 1],
                    authority_info_access(&self.ocsp_urls),
                ));
        }

        match self.profile {
            Profile::Root | Profile::Intermediate => {
                params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
                params.key_usages = vec![
                    KeyUsagePurpose::KeyCertSign,
                    KeyUsagePurpose::CrlSign,
                    KeyUsagePurpose::DigitalSignature,
                ];
            }
            Profile::CodeSigning | Profile::SelfSignedCodeSigning => {
                params.is_ca = IsCa::ExplicitNoCa;
                params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
                params.extended_key_usages = vec![ExtendedKeyUsagePurpose::CodeSigning];
            }
            Profile::Timestamping => {
                params.is_ca = IsCa::ExplicitNoCa;
                params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
                params.extended_key_usages = vec![ExtendedKeyUsagePurpose::TimeStamping];
            }
        }
        params
    }

    fn subject(&self) -> String {
        format!(
            "C=US, ST=WA, L=Seattle, O=Notary, CN={}",
            self.common_name
        )
    }

    pub fn self_signed(self) -> Identity {
        let key = KeyPair::generate_for(self.algorithm).expect("generate key");
        let cert = self.params().self_signed(&key).expect("self sign");
        Identity {
            cert,
            key,
            subject: self.subject(),
            serial: self.serial,
        }
    }

    pub fn issued_by(self, issuer: &Identity) -> Identity {
        let key = KeyPair::generate_for(self.algorithm).expect("generate key");
        let cert = self
            .params()
            .signed_by(&key, &issuer.cert, &issuer.key)
            .expect("issue certificate");
        Identity {
            cert,
            key,
            subject: self.subject(),
            serial: self.serial,
        }
    }
}

// AuthorityInfoAccessSyntax with one id-ad-ocsp URI per responder.
fn authority_info_access(urls: &[String]) -> Vec<u8> {
    const ID_AD_OCSP: &[u8] = &[0x06, 0x08, 0x2b, 0x06, 0x01, 0x05, 0x05, 0x07, 0x30, 0x01];
    let descriptions: Vec<u8> = urls
        .iter()
        .flat_map(|url| {
            let mut access = ID_AD_OCSP.to_vec();
            access.extend(der_tlv(0x86, url.as_bytes()));
            der_tlv(0x30, &access)
        })
        .collect();
    der_tlv(0x30, &descriptions)
}

fn der_tlv(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes: Vec<u8> = len
            .to_be_bytes()
            .into_iter()
            .skip_while(|b| *b == 0)
            .collect();
        out.push(0x80 | bytes.len() as u8);
        out.extend(bytes);
    }
    out.extend_from_slice(content);
    out
}

fn next_serial() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SERIAL: AtomicU64 = AtomicU64::new(1000);
    SERIAL.fetch_add(1, Ordering::Relaxed)
}

/// Root CA plus a code signing leaf issued directly under it.
pub struct TestPki {
    pub root: Identity,
    pub leaf: Identity,
}

impl TestPki {
    pub fn new() -> Self {
        let root = CertSpec::new("Notation Test Root", Profile::Root).self_signed();
        let leaf = CertSpec::new("Notation Test Leaf", Profile::CodeSigning).issued_by(&root);
        Self { root, leaf }
    }

    pub fn with_leaf(leaf_spec: CertSpec) -> Self {
        let root = CertSpec::new("Notation Test Root", Profile::Root).self_signed();
        let leaf = leaf_spec.issued_by(&root);
        Self { root, leaf }
    }

    /// Leaf-first DER chain, root included.
    pub fn chain_der(&self) -> Vec<Vec<u8>> {
        vec![self.leaf.cert_der(), self.root.cert_der()]
    }

    /// Leaf-first PEM bundle, root included.
    pub fn chain_pem(&self) -> String {
        format!("{}{}", self.leaf.cert_pem(), self.root.cert_pem())
    }
}

impl Default for TestPki {
    fn default() -> Self {
        Self::new()
    }
}

/// A CRL signed by `issuer` revoking the given serial numbers.
pub fn revocation_list(issuer: &Identity, revoked: &[u64], next_update: OffsetDateTime) -> Vec<u8> {
    revoked
        .iter()
        .fold(CrlSpec::new(next_update), |spec, serial| spec.revoke(*serial))
        .signed_by(issuer)
}

/// Describes one CRL to generate, base or delta.
#[derive(Clone)]
pub struct CrlSpec {
    pub revoked: Vec<(u64, RevocationReason)>,
    pub next_update: OffsetDateTime,
    pub crl_number: u64,
    /// Base CRL number carried in a DeltaCRLIndicator extension.
    pub delta_of: Option<u64>,
    /// Delta CRL location announced in a FreshestCRL extension.
    pub freshest_url: Option<String>,
}

impl CrlSpec {
    pub fn new(next_update: OffsetDateTime) -> Self {
        Self {
            revoked: vec![],
            next_update,
            crl_number: 1,
            delta_of: None,
            freshest_url: None,
        }
    }

    pub fn revoke(self, serial: u64) -> Self {
        self.revoke_with(serial, RevocationReason::KeyCompromise)
    }

    pub fn revoke_with(mut self, serial: u64, reason: RevocationReason) -> Self {
        self.revoked.push((serial, reason));
        self
    }

    pub fn number(mut self, crl_number: u64) -> Self {
        self.crl_number = crl_number;
        self
    }

    /// Marks the CRL as a delta of the base CRL numbered `base`.
    pub fn delta_of(mut self, base: u64) -> Self {
        self.delta_of = Some(base);
        self
    }

    pub fn freshest_url(mut self, url: &str) -> Self {
        self.freshest_url = Some(url.to_string());
        self
    }

    pub fn signed_by(&self, issuer: &Identity) -> Vec<u8> {
        let now = OffsetDateTime::now_utc();
        let params = CertificateRevocationListParams {
            this_update: now - Duration::minutes(5),
            next_update: self.next_update,
            crl_number: SerialNumber::from(self.crl_number),
            issuing_distribution_point: None,
            revoked_certs: self
                .revoked
                .iter()
                .map(|(serial, reason)| RevokedCertParams {
                    serial_number: SerialNumber::from(*serial),
                    revocation_time: now - Duration::minutes(1),
                    reason_code: Some(*reason),
                    invalidity_date: None,
                })
                .collect(),
            key_identifier_method: KeyIdMethod::Sha256,
        };
        let der = params
            .signed_by(&issuer.cert, &issuer.key)
            .expect("sign crl")
            .der()
            .to_vec();

        let mut extensions = Vec::new();
        if let Some(base) = self.delta_of {
            let number = Uint::new(&base.to_be_bytes())
                .and_then(|n| n.to_der())
                .expect("encode base CRL number");
            extensions.push(extension(ID_CE_DELTA_CRL_INDICATOR, true, number));
        }
        if let Some(url) = &self.freshest_url {
            extensions.push(extension(ID_CE_FRESHEST_CRL, false, distribution_points(url)));
        }
        if extensions.is_empty() {
            return der;
        }
        resign_crl(&der, issuer, extensions)
    }
}

fn extension(extn_id: ObjectIdentifier, critical: bool, value: Vec<u8>) -> Extension {
    Extension {
        extn_id,
        critical,
        extn_value: OctetString::new(value).expect("extension value"),
    }
}

// CRLDistributionPoints with a single fullName URI.
fn distribution_points(url: &str) -> Vec<u8> {
    let name = der_tlv(0xa0, &der_tlv(0xa0, &der_tlv(0x86, url.as_bytes())));
    der_tlv(0x30, &der_tlv(0x30, &name))
}

// rcgen cannot add CRL extensions, so they are spliced in and the CRL is
// signed again with the issuer's P-256 key.
fn resign_crl(der: &[u8], issuer: &Identity, extensions: Vec<Extension>) -> Vec<u8> {
    let mut crl = CertificateList::from_der(der).expect("parse crl");
    crl.tbs_cert_list
        .crl_extensions
        .get_or_insert_with(Vec::new)
        .extend(extensions);
    let tbs = crl.tbs_cert_list.to_der().expect("encode crl");
    let key = SigningKey::from_pkcs8_der(&issuer.key_der()).expect("P-256 issuer key");
    let signature: Signature = key.sign(&tbs);
    crl.signature = BitString::from_bytes(signature.to_der().as_bytes()).expect("signature");
    crl.to_der().expect("encode crl")
}

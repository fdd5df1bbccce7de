// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! OCSP (RFC 6960) client.

use std::time::Duration;

use chrono::{DateTime, Utc};
use const_oid::db::rfc5912::ID_SHA_1;
use der::{
    asn1::{BitString, GeneralizedTime, Null, ObjectIdentifier, OctetString},
    Decode, Encode, Enumerated, Sequence,
};
use log::debug;
use spki::AlgorithmIdentifierOwned;
use x509_cert::{
    ext::{pkix::ExtendedKeyUsage, Extensions},
    name::Name,
    serial_number::SerialNumber,
    Certificate,
};

use super::{check_url, fetch, RevocationError, RevocationStatus, Result};
use crate::{
    crypto::{HashAlgorithm, PublicKey},
    x509::{self, oid},
};

const MEDIA_TYPE_OCSP_REQUEST: &str = "application/ocsp-request";
const MAX_RESPONSE_SIZE: usize = 20 * 1024;

/// ```text
/// OCSPRequest ::= SEQUENCE {
///     tbsRequest                  TBSRequest,
///     optionalSignature   [0]     EXPLICIT Signature OPTIONAL }
/// ```
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct OcspRequest {
    pub tbs_request: TbsRequest,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct TbsRequest {
    #[asn1(context_specific = "0", optional = "true")]
    pub version: Option<u8>,
    pub request_list: Vec<Request>,
    #[asn1(context_specific = "2", optional = "true")]
    pub request_extensions: Option<Extensions>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct Request {
    pub req_cert: CertId,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct CertId {
    pub hash_algorithm: AlgorithmIdentifierOwned,
    pub issuer_name_hash: OctetString,
    pub issuer_key_hash: OctetString,
    pub serial_number: SerialNumber,
}

#[derive(Enumerated, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum OcspResponseStatus {
    Successful = 0,
    MalformedRequest = 1,
    InternalError = 2,
    TryLater = 3,
    SigRequired = 5,
    Unauthorized = 6,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct OcspResponse {
    pub response_status: OcspResponseStatus,
    #[asn1(context_specific = "0", optional = "true")]
    pub response_bytes: Option<ResponseBytes>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct ResponseBytes {
    pub response_type: ObjectIdentifier,
    pub response: OctetString,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct BasicOcspResponse {
    pub tbs_response_data: ResponseData,
    pub signature_algorithm: AlgorithmIdentifierOwned,
    pub signature: BitString,
    #[asn1(context_specific = "0", optional = "true")]
    pub certs: Option<Vec<Certificate>>,
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct ResponseData {
    #[asn1(context_specific = "0", optional = "true")]
    pub version: Option<u8>,
    pub responder_id: ResponderId,
    pub produced_at: GeneralizedTime,
    pub responses: Vec<SingleResponse>,
    #[asn1(context_specific = "1", optional = "true")]
    pub response_extensions: Option<Extensions>,
}

#[derive(Clone, Debug, Eq, PartialEq, der::Choice)]
pub enum ResponderId {
    #[asn1(context_specific = "1", tag_mode = "EXPLICIT", constructed = "true")]
    ByName(Name),
    #[asn1(context_specific = "2", tag_mode = "EXPLICIT", constructed = "true")]
    ByKey(OctetString),
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct SingleResponse {
    pub cert_id: CertId,
    pub cert_status: CertStatus,
    pub this_update: GeneralizedTime,
    #[asn1(context_specific = "0", optional = "true")]
    pub next_update: Option<GeneralizedTime>,
    #[asn1(context_specific = "1", optional = "true")]
    pub single_extensions: Option<Extensions>,
}

#[derive(Clone, Debug, Eq, PartialEq, der::Choice)]
pub enum CertStatus {
    #[asn1(context_specific = "0", tag_mode = "IMPLICIT")]
    Good(Null),
    #[asn1(context_specific = "1", tag_mode = "IMPLICIT", constructed = "true")]
    Revoked(RevokedInfo),
    #[asn1(context_specific = "2", tag_mode = "IMPLICIT")]
    Unknown(Null),
}

#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub struct RevokedInfo {
    pub revocation_time: GeneralizedTime,
    #[asn1(context_specific = "0", optional = "true")]
    pub revocation_reason: Option<der::Any>,
}

impl CertId {
    /// SHA-1 CertID of `cert` as issued by `issuer`.
    pub fn new(cert: &Certificate, issuer: &Certificate) -> Result<Self> {
        let issuer_name = issuer.tbs_certificate.subject.to_der().map_err(der_err)?;
        let name_hash = HashAlgorithm::Sha1.digest(&issuer_name);
        Ok(Self {
            hash_algorithm: AlgorithmIdentifierOwned {
                oid: ID_SHA_1,
                parameters: Some(der::Any::null()),
            },
            issuer_name_hash: OctetString::new(name_hash).map_err(der_err)?,
            issuer_key_hash: OctetString::new(issuer_key_hash(issuer)).map_err(der_err)?,
            serial_number: cert.tbs_certificate.serial_number.clone(),
        })
    }

    fn matches(&self, other: &CertId) -> bool {
        self.serial_number == other.serial_number
            && (other.hash_algorithm.oid != ID_SHA_1
                || (self.issuer_name_hash == other.issuer_name_hash
                    && self.issuer_key_hash == other.issuer_key_hash))
    }
}

/// SHA-1 of the subject public key bits, as used by CertID and ResponderID byKey.
fn issuer_key_hash(issuer: &Certificate) -> Vec<u8> {
    HashAlgorithm::Sha1.digest(
        issuer
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .raw_bytes(),
    )
}

fn der_err(e: der::Error) -> RevocationError {
    RevocationError::Ocsp(e.to_string())
}

fn to_chrono(time: &GeneralizedTime) -> DateTime<Utc> {
    x509::time_to_chrono(&x509_cert::time::Time::GeneralTime(*time))
}

#[derive(Clone)]
pub struct OcspClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl OcspClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(RevocationError::Client)?;
        Ok(Self { http, timeout })
    }

    /// Asks the responder at `url` about `cert`.
    pub async fn check(
        &self,
        url: &str,
        cert: &Certificate,
        issuer: &Certificate,
    ) -> Result<RevocationStatus> {
        check_url(url)?;
        let cert_id = CertId::new(cert, issuer)?;
        let request = OcspRequest {
            tbs_request: TbsRequest {
                version: None,
                request_list: vec![Request {
                    req_cert: cert_id.clone(),
                }],
                request_extensions: None,
            },
        }
        .to_der()
        .map_err(der_err)?;

        let body = fetch(
            self.http
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, MEDIA_TYPE_OCSP_REQUEST)
                .body(request),
            url,
            self.timeout,
            MAX_RESPONSE_SIZE,
        )
        .await?;
        let status = evaluate_response(&body, &cert_id, issuer, Utc::now())?;
        debug!(
            "OCSP responder {url} reports {status} for `{}`",
            x509::subject(cert)
        );
        Ok(status)
    }
}

/// Validates a DER OCSPResponse and extracts the status of `cert_id`.
pub fn evaluate_response(
    der: &[u8],
    cert_id: &CertId,
    issuer: &Certificate,
    now: DateTime<Utc>,
) -> Result<RevocationStatus> {
    let response = OcspResponse::from_der(der).map_err(der_err)?;
    if response.response_status != OcspResponseStatus::Successful {
        return Err(RevocationError::Ocsp(format!(
            "responder returned {:?}",
            response.response_status
        )));
    }
    let bytes = response
        .response_bytes
        .ok_or_else(|| RevocationError::Ocsp("missing response bytes".into()))?;
    if bytes.response_type != oid::ID_PKIX_OCSP_BASIC {
        return Err(RevocationError::Ocsp(format!(
            "unsupported response type {}",
            bytes.response_type
        )));
    }
    let basic = BasicOcspResponse::from_der(bytes.response.as_bytes()).map_err(der_err)?;

    let responder = responder_certificate(&basic, issuer, now)?;
    let tbs = basic.tbs_response_data.to_der().map_err(der_err)?;
    PublicKey::from_certificate(&responder)
        .and_then(|key| key.verify_x509(&basic.signature_algorithm, &tbs, basic.signature.raw_bytes()))
        .map_err(|e| RevocationError::Ocsp(format!("response signature: {e}")))?;

    let single = basic
        .tbs_response_data
        .responses
        .iter()
        .find(|r| cert_id.matches(&r.cert_id))
        .ok_or_else(|| RevocationError::Ocsp("no response for the certificate".into()))?;

    if to_chrono(&single.this_update) > now {
        return Err(RevocationError::Ocsp("thisUpdate is in the future".into()));
    }
    if let Some(next_update) = &single.next_update {
        if to_chrono(next_update) < now {
            return Err(RevocationError::Ocsp("response is stale".into()));
        }
    }

    Ok(match single.cert_status {
        CertStatus::Good(_) => RevocationStatus::Good,
        CertStatus::Revoked(_) => RevocationStatus::Revoked,
        CertStatus::Unknown(_) => RevocationStatus::Unknown,
    })
}

/// The issuer itself, or a delegated responder certificate it issued for
/// OCSP signing.
fn responder_certificate(
    basic: &BasicOcspResponse,
    issuer: &Certificate,
    now: DateTime<Utc>,
) -> Result<Certificate> {
    let responder_id = &basic.tbs_response_data.responder_id;
    let is_responder = |cert: &Certificate| match responder_id {
        ResponderId::ByName(name) => &cert.tbs_certificate.subject == name,
        ResponderId::ByKey(hash) => hash.as_bytes() == issuer_key_hash(cert).as_slice(),
    };
    if is_responder(issuer) {
        return Ok(issuer.clone());
    }

    let delegated = basic
        .certs
        .iter()
        .flatten()
        .find(|c| is_responder(c))
        .ok_or_else(|| RevocationError::Ocsp("responder certificate not found".into()))?;
    x509::verify_issued_by(delegated, issuer)
        .map_err(|e| RevocationError::Ocsp(format!("delegated responder: {e}")))?;
    let ocsp_signing = delegated
        .tbs_certificate
        .get::<ExtendedKeyUsage>()
        .map_err(der_err)?
        .is_some_and(|(_, eku)| eku.0.contains(&oid::ID_KP_OCSP_SIGNING));
    if !ocsp_signing {
        return Err(RevocationError::Ocsp(
            "delegated responder lacks the OCSPSigning extended key usage".into(),
        ));
    }
    x509::check_validity(std::slice::from_ref(delegated), now)
        .map_err(|e| RevocationError::Ocsp(format!("delegated responder: {e}")))?;
    Ok(delegated.clone())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use const_oid::db::rfc5912::ECDSA_WITH_SHA_256;
    use p256::{ecdsa::SigningKey, pkcs8::DecodePrivateKey};
    use signature::Signer;
    use test_utils::{CertSpec, Identity, Profile};
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn gt(time: DateTime<Utc>) -> GeneralizedTime {
        GeneralizedTime::from_unix_duration(std::time::Duration::from_secs(time.timestamp() as u64))
            .unwrap()
    }

    /// A successful OCSP response for `cert` signed by `signer`.
    pub fn ocsp_response(
        cert: &Identity,
        issuer: &Identity,
        signer: &Identity,
        status: CertStatus,
    ) -> Vec<u8> {
        let cert = x509::parse_der(&cert.cert_der()).unwrap();
        let issuer_cert = x509::parse_der(&issuer.cert_der()).unwrap();
        let signer_cert = x509::parse_der(&signer.cert_der()).unwrap();
        let now = Utc::now();
        let data = ResponseData {
            version: None,
            responder_id: ResponderId::ByName(signer_cert.tbs_certificate.subject.clone()),
            produced_at: gt(now),
            responses: vec![SingleResponse {
                cert_id: CertId::new(&cert, &issuer_cert).unwrap(),
                cert_status: status,
                this_update: gt(now - chrono::Duration::minutes(5)),
                next_update: Some(gt(now + chrono::Duration::hours(1))),
                single_extensions: None,
            }],
            response_extensions: None,
        };
        let key = SigningKey::from_pkcs8_der(&signer.key_der()).unwrap();
        let sig: p256::ecdsa::Signature = key.sign(&data.to_der().unwrap());
        let certs = (signer.serial != issuer.serial).then(|| vec![signer_cert]);
        let basic = BasicOcspResponse {
            tbs_response_data: data,
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: ECDSA_WITH_SHA_256,
                parameters: None,
            },
            signature: BitString::from_bytes(sig.to_der().as_bytes()).unwrap(),
            certs,
        };
        OcspResponse {
            response_status: OcspResponseStatus::Successful,
            response_bytes: Some(ResponseBytes {
                response_type: oid::ID_PKIX_OCSP_BASIC,
                response: OctetString::new(basic.to_der().unwrap()).unwrap(),
            }),
        }
        .to_der()
        .unwrap()
    }

    fn revoked() -> CertStatus {
        CertStatus::Revoked(RevokedInfo {
            revocation_time: gt(Utc::now() - chrono::Duration::minutes(1)),
            revocation_reason: None,
        })
    }

    #[rstest::rstest]
    #[case(CertStatus::Good(Null), RevocationStatus::Good)]
    #[case(revoked(), RevocationStatus::Revoked)]
    #[case(CertStatus::Unknown(Null), RevocationStatus::Unknown)]
    #[tokio::test]
    async fn test_ocsp_statuses(#[case] status: CertStatus, #[case] expected: RevocationStatus) {
        let server = MockServer::start().await;
        let root = CertSpec::new("Root", Profile::Root).self_signed();
        let leaf = CertSpec::new("Leaf", Profile::CodeSigning)
            .ocsp_url(&format!("{}/ocsp", server.uri()))
            .issued_by(&root);
        Mock::given(method("POST"))
            .and(path("/ocsp"))
            .and(header("content-type", MEDIA_TYPE_OCSP_REQUEST))
            .respond_with(
                ResponseTemplate::new(200).set_body_bytes(ocsp_response(&leaf, &root, &root, status)),
            )
            .mount(&server)
            .await;

        let leaf_cert = x509::parse_der(&leaf.cert_der()).unwrap();
        let root_cert = x509::parse_der(&root.cert_der()).unwrap();
        let urls = x509::ocsp_urls(&leaf_cert).unwrap();
        assert_eq!(urls, vec![format!("{}/ocsp", server.uri())]);

        let client = OcspClient::new(Duration::from_secs(2)).unwrap();
        let got = client.check(&urls[0], &leaf_cert, &root_cert).await.unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_delegated_responder() {
        let root = CertSpec::new("Root", Profile::Root).self_signed();
        let leaf = CertSpec::new("Leaf", Profile::CodeSigning).issued_by(&root);
        let leaf_cert = x509::parse_der(&leaf.cert_der()).unwrap();
        let root_cert = x509::parse_der(&root.cert_der()).unwrap();
        let cert_id = CertId::new(&leaf_cert, &root_cert).unwrap();

        // a code signing certificate is not an OCSP responder
        let impostor = CertSpec::new("Responder", Profile::CodeSigning).issued_by(&root);
        let der = ocsp_response(&leaf, &root, &impostor, CertStatus::Good(Null));
        assert!(matches!(
            evaluate_response(&der, &cert_id, &root_cert, Utc::now()),
            Err(RevocationError::Ocsp(_))
        ));

        // signed by someone else entirely
        let stranger = CertSpec::new("Root", Profile::Root).self_signed();
        let der = ocsp_response(&leaf, &root, &stranger, CertStatus::Good(Null));
        assert!(evaluate_response(&der, &cert_id, &root_cert, Utc::now()).is_err());
    }

    #[test]
    fn test_stale_response() {
        let root = CertSpec::new("Root", Profile::Root).self_signed();
        let leaf = CertSpec::new("Leaf", Profile::CodeSigning).issued_by(&root);
        let leaf_cert = x509::parse_der(&leaf.cert_der()).unwrap();
        let root_cert = x509::parse_der(&root.cert_der()).unwrap();
        let cert_id = CertId::new(&leaf_cert, &root_cert).unwrap();
        let der = ocsp_response(&leaf, &root, &root, CertStatus::Good(Null));

        let later = Utc::now() + chrono::Duration::hours(2);
        assert!(evaluate_response(&der, &cert_id, &root_cert, later).is_err());
        let earlier = Utc::now() - chrono::Duration::hours(2);
        assert!(evaluate_response(&der, &cert_id, &root_cert, earlier).is_err());
    }

    #[tokio::test]
    async fn test_responder_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let root = CertSpec::new("Root", Profile::Root).self_signed();
        let leaf = CertSpec::new("Leaf", Profile::CodeSigning).issued_by(&root);
        let leaf_cert = x509::parse_der(&leaf.cert_der()).unwrap();
        let root_cert = x509::parse_der(&root.cert_der()).unwrap();
        let client = OcspClient::new(Duration::from_secs(2)).unwrap();
        assert!(matches!(
            client.check(&server.uri(), &leaf_cert, &root_cert).await,
            Err(RevocationError::HttpStatus { status: 500, .. })
        ));

        let try_later = OcspResponse {
            response_status: OcspResponseStatus::TryLater,
            response_bytes: None,
        }
        .to_der()
        .unwrap();
        let cert_id = CertId::new(&leaf_cert, &root_cert).unwrap();
        assert!(matches!(
            evaluate_response(&try_later, &cert_id, &root_cert, Utc::now()),
            Err(RevocationError::Ocsp(_))
        ));
    }
}

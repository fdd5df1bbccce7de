// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Tagged COSE_Sign1 encoding of a Notary Project envelope.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use coset::{
    cbor::value::{Integer, Value},
    iana::{self, EnumI64},
    CborSerializable, ContentType, CoseSign1, Header, Label, ProtectedHeader,
    RegisteredLabel, RegisteredLabelWithPrivate, TaggedCborSerializable,
};
use x509_cert::Certificate;

use super::{
    check_signer_output, truncate, Attribute, EnvelopeContent, EnvelopeError, Result,
    SignRequest, SignedAttributes, SignerInfo, SigningScheme, UnsignedAttributes,
    HEADER_AUTHENTIC_SIGNING_TIME, HEADER_EXPIRY, HEADER_SIGNING_AGENT, HEADER_SIGNING_SCHEME,
    HEADER_SIGNING_TIME, HEADER_TIMESTAMP_SIGNATURE,
};
use crate::{
    crypto::{KeySpec, SignatureAlgorithm},
    descriptor::MEDIA_TYPE_PAYLOAD_V1,
    x509,
};

/// COSE header label of the X.509 certificate chain (RFC 9360).
const LABEL_X5CHAIN: i64 = 33;

/// CBOR tag for epoch-based date/time.
const TAG_EPOCH_TIME: u64 = 1;

#[derive(Clone, Debug)]
pub struct CoseEnvelope {
    sign1: CoseSign1,
    content: EnvelopeContent,
}

fn malformed(e: impl std::fmt::Display) -> EnvelopeError {
    EnvelopeError::MalformedEnvelope(e.to_string())
}

fn time_value(time: &DateTime<Utc>) -> Value {
    Value::Tag(
        TAG_EPOCH_TIME,
        Box::new(Value::Integer(Integer::from(time.timestamp()))),
    )
}

fn parse_time(value: &Value, key: &str) -> Result<DateTime<Utc>> {
    let Value::Tag(TAG_EPOCH_TIME, inner) = value else {
        return Err(malformed(format!("`{key}` must be a tag 1 epoch time")));
    };
    let secs = match inner.as_ref() {
        Value::Integer(i) => i64::try_from(*i).map_err(|_| malformed(format!("`{key}` out of range")))?,
        Value::Float(f) => *f as i64,
        _ => return Err(malformed(format!("`{key}` must be numeric"))),
    };
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| malformed(format!("`{key}` out of range")))
}

pub(crate) fn json_to_cbor(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(Integer::from(i))
            } else if let Some(u) = n.as_u64() {
                Value::Integer(Integer::from(u))
            } else {
                Value::Float(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(json_to_cbor).collect()),
        serde_json::Value::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (Value::Text(k.clone()), json_to_cbor(v)))
                .collect(),
        ),
    }
}

pub(crate) fn cbor_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => {
            let n = i128::from(*i);
            if let Ok(v) = i64::try_from(n) {
                serde_json::Value::from(v)
            } else if let Ok(v) = u64::try_from(n) {
                serde_json::Value::from(v)
            } else {
                serde_json::Value::String(n.to_string())
            }
        }
        Value::Float(f) => serde_json::Value::from(*f),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::String(STANDARD.encode(b)),
        Value::Tag(_, inner) => cbor_to_json(inner),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(cbor_to_json).collect()),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| {
                    let key = match k {
                        Value::Text(s) => s.clone(),
                        other => cbor_to_json(other).to_string(),
                    };
                    (key, cbor_to_json(v))
                })
                .collect(),
        ),
        _ => serde_json::Value::Null,
    }
}

fn text_label(key: &str) -> Label {
    Label::Text(key.to_string())
}

fn unprotected_header(
    unsigned: &UnsignedAttributes,
    chain: &[Certificate],
) -> Result<Header> {
    let mut ders = chain
        .iter()
        .map(|c| Ok(Value::Bytes(x509::to_der(c)?)))
        .collect::<Result<Vec<Value>>>()?;
    let x5chain = if ders.len() == 1 {
        ders.remove(0)
    } else {
        Value::Array(ders)
    };

    let mut header = Header::default();
    header.rest.push((Label::Int(LABEL_X5CHAIN), x5chain));
    if let Some(agent) = &unsigned.signing_agent {
        header
            .rest
            .push((text_label(HEADER_SIGNING_AGENT), Value::Text(agent.clone())));
    }
    if let Some(token) = &unsigned.timestamp_signature {
        header
            .rest
            .push((text_label(HEADER_TIMESTAMP_SIGNATURE), Value::Bytes(token.clone())));
    }
    Ok(header)
}

impl CoseEnvelope {
    pub(super) async fn sign(request: SignRequest<'_>, key_spec: KeySpec) -> Result<Self> {
        let algorithm = key_spec.signature_algorithm();
        let signing_time = truncate(request.signing_time);
        let expiry = request.expiry.map(truncate);
        let scheme = request.signing_scheme;

        let mut protected = Header {
            alg: Some(RegisteredLabelWithPrivate::PrivateUse(algorithm.cose_id())),
            content_type: Some(ContentType::Text(request.payload_content_type.clone())),
            ..Default::default()
        };
        if let Some(alg) = iana::Algorithm::from_i64(algorithm.cose_id()) {
            protected.alg = Some(RegisteredLabelWithPrivate::Assigned(alg));
        }

        let mut crit = vec![HEADER_SIGNING_SCHEME.to_string()];
        if scheme == SigningScheme::X509SigningAuthority {
            crit.push(HEADER_AUTHENTIC_SIGNING_TIME.to_string());
        }
        if expiry.is_some() {
            crit.push(HEADER_EXPIRY.to_string());
        }
        crit.extend(
            request
                .extended_attributes
                .iter()
                .filter(|a| a.critical)
                .map(|a| a.key.clone()),
        );
        protected.crit = crit.into_iter().map(RegisteredLabel::Text).collect();

        protected.rest.push((
            text_label(HEADER_SIGNING_SCHEME),
            Value::Text(scheme.to_string()),
        ));
        protected
            .rest
            .push((text_label(scheme.signing_time_header()), time_value(&signing_time)));
        if let Some(expiry) = &expiry {
            protected
                .rest
                .push((text_label(HEADER_EXPIRY), time_value(expiry)));
        }
        for attr in &request.extended_attributes {
            protected
                .rest
                .push((text_label(&attr.key), json_to_cbor(&attr.value)));
        }

        let mut sign1 = CoseSign1 {
            protected: ProtectedHeader {
                original_data: None,
                header: protected,
            },
            unprotected: Header::default(),
            payload: Some(request.payload.clone()),
            signature: vec![],
        };
        let tbs = sign1.tbs_data(b"");
        let (signature, certificate_chain) = request.signer.sign(&tbs).await?;
        check_signer_output(key_spec, &certificate_chain)?;

        let unsigned_attributes = UnsignedAttributes {
            signing_agent: request.signing_agent,
            timestamp_signature: None,
        };
        sign1.unprotected = unprotected_header(&unsigned_attributes, &certificate_chain)?;
        sign1.signature = signature.clone();

        Ok(Self {
            sign1,
            content: EnvelopeContent {
                payload_content_type: request.payload_content_type,
                payload: request.payload,
                signer_info: SignerInfo {
                    signed_attributes: SignedAttributes {
                        signing_scheme: scheme,
                        signing_time,
                        expiry,
                        extended_attributes: request.extended_attributes,
                    },
                    unsigned_attributes,
                    signature_algorithm: algorithm,
                    signature,
                    certificate_chain,
                },
            },
        })
    }

    pub(super) fn parse(raw: &[u8]) -> Result<Self> {
        let sign1 = CoseSign1::from_tagged_slice(raw)
            .or_else(|_| CoseSign1::from_slice(raw))
            .map_err(|e| malformed(format!("invalid COSE_Sign1: {e:?}")))?;

        let payload = sign1
            .payload
            .clone()
            .ok_or_else(|| malformed("detached COSE payloads are not supported"))?;
        let (payload_content_type, signed_attributes, signature_algorithm) =
            parse_protected(&sign1.protected.header)?;
        let (unsigned_attributes, certificate_chain) = parse_unprotected(&sign1.unprotected)?;

        let content = EnvelopeContent {
            payload_content_type,
            payload,
            signer_info: SignerInfo {
                signed_attributes,
                unsigned_attributes,
                signature_algorithm,
                signature: sign1.signature.clone(),
                certificate_chain,
            },
        };
        Ok(Self { sign1, content })
    }

    pub fn content(&self) -> &EnvelopeContent {
        &self.content
    }

    pub(super) fn signing_input(&self) -> Vec<u8> {
        self.sign1.tbs_data(b"")
    }

    pub(super) fn set_timestamp_signature(&mut self, token: Vec<u8>) {
        self.content.signer_info.unsigned_attributes.timestamp_signature = Some(token);
    }

    pub(super) fn serialize(&self) -> Result<Vec<u8>> {
        let signer_info = &self.content.signer_info;
        let mut sign1 = self.sign1.clone();
        sign1.unprotected = unprotected_header(
            &signer_info.unsigned_attributes,
            &signer_info.certificate_chain,
        )?;
        sign1
            .to_tagged_vec()
            .map_err(|e| malformed(format!("encode COSE_Sign1: {e:?}")))
    }
}

fn parse_protected(header: &Header) -> Result<(String, SignedAttributes, SignatureAlgorithm)> {
    let missing = |key: &str| malformed(format!("missing `{key}` protected header"));

    let algorithm = match &header.alg {
        Some(RegisteredLabelWithPrivate::Assigned(alg)) => {
            SignatureAlgorithm::from_cose_id(alg.to_i64())?
        }
        Some(RegisteredLabelWithPrivate::PrivateUse(id)) => SignatureAlgorithm::from_cose_id(*id)?,
        _ => return Err(missing("alg")),
    };
    let cty = match &header.content_type {
        Some(ContentType::Text(cty)) => cty.clone(),
        _ => return Err(missing("cty")),
    };
    if cty != MEDIA_TYPE_PAYLOAD_V1 {
        return Err(malformed(format!("unsupported payload content type `{cty}`")));
    }

    let crit = header
        .crit
        .iter()
        .map(|label| match label {
            RegisteredLabel::Text(s) => Ok(s.clone()),
            other => Err(malformed(format!("unsupported critical label {other:?}"))),
        })
        .collect::<Result<Vec<String>>>()?;
    let is_critical = |key: &str| crit.iter().any(|k| k == key);

    let mut scheme = None;
    let mut signing_time = None;
    let mut authentic_signing_time = None;
    let mut expiry = None;
    let mut extended_attributes = Vec::new();
    for (label, value) in &header.rest {
        let Label::Text(key) = label else {
            continue;
        };
        match key.as_str() {
            HEADER_SIGNING_SCHEME => {
                let Value::Text(s) = value else {
                    return Err(malformed(format!("`{HEADER_SIGNING_SCHEME}` must be text")));
                };
                scheme = Some(
                    s.parse::<SigningScheme>()
                        .map_err(|_| malformed(format!("unknown signing scheme `{s}`")))?,
                );
            }
            HEADER_SIGNING_TIME => signing_time = Some(parse_time(value, key)?),
            HEADER_AUTHENTIC_SIGNING_TIME => authentic_signing_time = Some(parse_time(value, key)?),
            HEADER_EXPIRY => expiry = Some(parse_time(value, key)?),
            _ => extended_attributes.push(Attribute {
                key: key.clone(),
                critical: is_critical(key),
                value: cbor_to_json(value),
            }),
        }
    }

    for key in &crit {
        let present = header
            .rest
            .iter()
            .any(|(label, _)| matches!(label, Label::Text(k) if k == key));
        if !present {
            return Err(malformed(format!("critical header `{key}` is not present")));
        }
    }

    let scheme = scheme.ok_or_else(|| missing(HEADER_SIGNING_SCHEME))?;
    if !is_critical(HEADER_SIGNING_SCHEME) {
        return Err(malformed(format!(
            "`{HEADER_SIGNING_SCHEME}` must be marked critical"
        )));
    }
    let signing_time = match scheme {
        SigningScheme::X509 => {
            if authentic_signing_time.is_some() {
                return Err(malformed(format!(
                    "`{HEADER_AUTHENTIC_SIGNING_TIME}` is not allowed with {scheme}"
                )));
            }
            signing_time.ok_or_else(|| missing(HEADER_SIGNING_TIME))?
        }
        SigningScheme::X509SigningAuthority => {
            if !is_critical(HEADER_AUTHENTIC_SIGNING_TIME) {
                return Err(malformed(format!(
                    "`{HEADER_AUTHENTIC_SIGNING_TIME}` must be marked critical"
                )));
            }
            authentic_signing_time.ok_or_else(|| missing(HEADER_AUTHENTIC_SIGNING_TIME))?
        }
    };
    if expiry.is_some() && !is_critical(HEADER_EXPIRY) {
        return Err(malformed(format!("`{HEADER_EXPIRY}` must be marked critical")));
    }

    Ok((
        cty,
        SignedAttributes {
            signing_scheme: scheme,
            signing_time,
            expiry,
            extended_attributes,
        },
        algorithm,
    ))
}

fn parse_unprotected(header: &Header) -> Result<(UnsignedAttributes, Vec<Certificate>)> {
    let mut unsigned = UnsignedAttributes::default();
    let mut chain = None;
    for (label, value) in &header.rest {
        match label {
            Label::Int(LABEL_X5CHAIN) => {
                let ders: Vec<&Vec<u8>> = match value {
                    Value::Bytes(der) => vec![der],
                    Value::Array(items) => items
                        .iter()
                        .map(|item| match item {
                            Value::Bytes(der) => Ok(der),
                            _ => Err(malformed("x5chain entries must be byte strings")),
                        })
                        .collect::<Result<_>>()?,
                    _ => return Err(malformed("x5chain must be a byte string or array")),
                };
                chain = Some(
                    ders.into_iter()
                        .map(|der| Ok(x509::parse_der(der)?))
                        .collect::<Result<Vec<Certificate>>>()?,
                );
            }
            Label::Text(key) if key == HEADER_SIGNING_AGENT => match value {
                Value::Text(agent) => unsigned.signing_agent = Some(agent.clone()),
                _ => return Err(malformed(format!("`{HEADER_SIGNING_AGENT}` must be text"))),
            },
            Label::Text(key) if key == HEADER_TIMESTAMP_SIGNATURE => match value {
                Value::Bytes(token) => unsigned.timestamp_signature = Some(token.clone()),
                _ => {
                    return Err(malformed(format!(
                        "`{HEADER_TIMESTAMP_SIGNATURE}` must be a byte string"
                    )))
                }
            },
            _ => {}
        }
    }

    let chain = chain.unwrap_or_default();
    if chain.is_empty() {
        return Err(EnvelopeError::EmptyCertificateChain);
    }
    Ok((unsigned, chain))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{
        tests::{payload, TestSigner},
        Envelope, EnvelopeFormat, ParseOptions, MEDIA_TYPE_COSE,
    };
    use test_utils::{CertSpec, Profile};

    #[tokio::test]
    async fn test_single_certificate_chain_is_bstr() {
        let leaf = CertSpec::new("Authority", Profile::SelfSignedCodeSigning).self_signed();
        let signer = TestSigner {
            key: crate::crypto::PrivateKey::from_pem(&leaf.key_pem()).unwrap(),
            chain: vec![x509::parse_der(&leaf.cert_der()).unwrap()],
        };
        let mut request = SignRequest::new(payload(), &signer);
        request.signing_scheme = SigningScheme::X509SigningAuthority;
        let envelope = Envelope::sign(EnvelopeFormat::Cose, request).await.unwrap();
        let raw = envelope.serialize().unwrap();

        let sign1 = CoseSign1::from_tagged_slice(&raw).unwrap();
        let x5chain = sign1
            .unprotected
            .rest
            .iter()
            .find(|(l, _)| *l == Label::Int(LABEL_X5CHAIN))
            .map(|(_, v)| v.clone())
            .unwrap();
        assert!(matches!(x5chain, Value::Bytes(_)));
        assert_eq!(
            sign1.protected.header.alg,
            Some(RegisteredLabelWithPrivate::Assigned(iana::Algorithm::ES256))
        );

        let parsed = Envelope::parse(MEDIA_TYPE_COSE, &raw, &ParseOptions::default()).unwrap();
        parsed.verify_signature().unwrap();
        assert_eq!(
            parsed.content().signer_info.signed_attributes.signing_scheme,
            SigningScheme::X509SigningAuthority
        );
    }

    #[tokio::test]
    async fn test_flipped_signature_byte() {
        let pki = test_utils::TestPki::new();
        let signer = TestSigner::new(&pki);
        let envelope = Envelope::sign(EnvelopeFormat::Cose, SignRequest::new(payload(), &signer))
            .await
            .unwrap();
        let mut sign1 = CoseSign1::from_tagged_slice(&envelope.serialize().unwrap()).unwrap();
        sign1.signature[5] ^= 0x01;
        let raw = sign1.to_tagged_vec().unwrap();
        let parsed = Envelope::parse(MEDIA_TYPE_COSE, &raw, &ParseOptions::default()).unwrap();
        assert!(matches!(
            parsed.verify_signature(),
            Err(EnvelopeError::InvalidSignature)
        ));
    }

    #[test]
    fn test_garbage() {
        assert!(matches!(
            Envelope::parse(MEDIA_TYPE_COSE, &[0xd2, 0x84, 0x00], &ParseOptions::default()),
            Err(EnvelopeError::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn test_json_cbor_values() {
        let value = serde_json::json!({"a": [1, -2, true, "x"], "b": null});
        assert_eq!(cbor_to_json(&json_to_cbor(&value)), value);
    }
}

// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! JWS JSON serialization of a Notary Project envelope.

use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;

use serde::{
    de::{IgnoredAny, MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use serde_json::{Map, Value};
use x509_cert::Certificate;

use super::{
    check_signer_output, truncate, Attribute, EnvelopeContent, EnvelopeError, Result,
    SignRequest, SignedAttributes, SignerInfo, SigningScheme, UnsignedAttributes,
    HEADER_AUTHENTIC_SIGNING_TIME, HEADER_EXPIRY, HEADER_SIGNING_AGENT, HEADER_SIGNING_SCHEME,
    HEADER_SIGNING_TIME, HEADER_TIMESTAMP_SIGNATURE,
};
use crate::{
    crypto::{KeySpec, SignatureAlgorithm},
    x509,
};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct UnprotectedHeader {
    #[serde(
        rename = "io.cncf.notary.timestampSignature",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    timestamp_signature: Option<String>,
    #[serde(
        rename = "io.cncf.notary.signingAgent",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    signing_agent: Option<String>,
    #[serde(default)]
    x5c: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct JwsJson {
    payload: String,
    protected: String,
    header: UnprotectedHeader,
    signature: String,
}

#[derive(Clone, Debug)]
pub struct JwsEnvelope {
    /// base64url protected header exactly as signed.
    protected: String,
    /// base64url payload exactly as signed.
    payload: String,
    content: EnvelopeContent,
}

/// Protected header members, serialized in insertion order.
#[derive(Default)]
struct ProtectedHeader(Vec<(String, Value)>);

impl ProtectedHeader {
    fn push(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.push((key.into(), value.into()));
    }
}

impl Serialize for ProtectedHeader {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (key, value) in &self.0 {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// Member names of a JSON object in document order.
struct KeyOrder(Vec<String>);

impl<'de> Deserialize<'de> for KeyOrder {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct KeyVisitor;

        impl<'de> Visitor<'de> for KeyVisitor {
            type Value = KeyOrder;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON object")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut map: A,
            ) -> std::result::Result<KeyOrder, A::Error> {
                let mut keys = Vec::new();
                while let Some((key, IgnoredAny)) = map.next_entry::<String, IgnoredAny>()? {
                    keys.push(key);
                }
                Ok(KeyOrder(keys))
            }
        }

        deserializer.deserialize_map(KeyVisitor)
    }
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_time(value: &Value, key: &str) -> Result<DateTime<Utc>> {
    let s = value
        .as_str()
        .ok_or_else(|| EnvelopeError::MalformedEnvelope(format!("`{key}` must be a string")))?;
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EnvelopeError::MalformedEnvelope(format!("`{key}`: {e}")))
}

fn b64url_decode(field: &str, value: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| EnvelopeError::MalformedEnvelope(format!("{field} is not base64url: {e}")))
}

impl JwsEnvelope {
    pub(super) async fn sign(request: SignRequest<'_>, key_spec: KeySpec) -> Result<Self> {
        let algorithm = key_spec.signature_algorithm();
        let signing_time = truncate(request.signing_time);
        let expiry = request.expiry.map(truncate);
        let scheme = request.signing_scheme;

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

        let mut header = ProtectedHeader::default();
        header.push("alg", algorithm.jws_name());
        header.push("cty", request.payload_content_type.clone());
        header.push("crit", crit);
        header.push(HEADER_SIGNING_SCHEME, scheme.to_string());
        header.push(scheme.signing_time_header(), format_time(&signing_time));
        if let Some(expiry) = &expiry {
            header.push(HEADER_EXPIRY, format_time(expiry));
        }
        for attr in &request.extended_attributes {
            header.push(attr.key.clone(), attr.value.clone());
        }

        let header_json = serde_json::to_vec(&header)
            .map_err(|e| EnvelopeError::MalformedEnvelope(e.to_string()))?;
        let protected = URL_SAFE_NO_PAD.encode(header_json);
        let payload = URL_SAFE_NO_PAD.encode(&request.payload);
        let signing_input = format!("{protected}.{payload}");

        let (signature, certificate_chain) = request.signer.sign(signing_input.as_bytes()).await?;
        check_signer_output(key_spec, &certificate_chain)?;

        Ok(Self {
            protected,
            payload,
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
                    unsigned_attributes: UnsignedAttributes {
                        signing_agent: request.signing_agent,
                        timestamp_signature: None,
                    },
                    signature_algorithm: algorithm,
                    signature,
                    certificate_chain,
                },
            },
        })
    }

    pub(super) fn parse(raw: &[u8]) -> Result<Self> {
        let jws: JwsJson = serde_json::from_slice(raw)
            .map_err(|e| EnvelopeError::MalformedEnvelope(format!("invalid JWS JSON: {e}")))?;

        let header_bytes = b64url_decode("protected header", &jws.protected)?;
        let header: Map<String, Value> = serde_json::from_slice(&header_bytes).map_err(|e| {
            EnvelopeError::MalformedEnvelope(format!("protected header is not a JSON object: {e}"))
        })?;
        let KeyOrder(order) = serde_json::from_slice(&header_bytes).map_err(|e| {
            EnvelopeError::MalformedEnvelope(format!("protected header is not a JSON object: {e}"))
        })?;
        let payload = b64url_decode("payload", &jws.payload)?;
        let signature = b64url_decode("signature", &jws.signature)?;

        let (payload_content_type, signed_attributes, signature_algorithm) =
            parse_protected(header, order)?;

        if jws.header.x5c.is_empty() {
            return Err(EnvelopeError::EmptyCertificateChain);
        }
        let certificate_chain = jws
            .header
            .x5c
            .iter()
            .map(|c| {
                let der = STANDARD
                    .decode(c)
                    .map_err(|e| EnvelopeError::MalformedEnvelope(format!("x5c: {e}")))?;
                Ok(x509::parse_der(&der)?)
            })
            .collect::<Result<Vec<Certificate>>>()?;
        let timestamp_signature = jws
            .header
            .timestamp_signature
            .as_deref()
            .map(|t| {
                STANDARD.decode(t).map_err(|e| {
                    EnvelopeError::MalformedEnvelope(format!("{HEADER_TIMESTAMP_SIGNATURE}: {e}"))
                })
            })
            .transpose()?;

        Ok(Self {
            protected: jws.protected,
            payload: jws.payload,
            content: EnvelopeContent {
                payload_content_type,
                payload,
                signer_info: SignerInfo {
                    signed_attributes,
                    unsigned_attributes: UnsignedAttributes {
                        signing_agent: jws.header.signing_agent,
                        timestamp_signature,
                    },
                    signature_algorithm,
                    signature,
                    certificate_chain,
                },
            },
        })
    }

    pub fn content(&self) -> &EnvelopeContent {
        &self.content
    }

    pub(super) fn signing_input(&self) -> Vec<u8> {
        format!("{}.{}", self.protected, self.payload).into_bytes()
    }

    pub(super) fn set_timestamp_signature(&mut self, token: Vec<u8>) {
        self.content.signer_info.unsigned_attributes.timestamp_signature = Some(token);
    }

    pub(super) fn serialize(&self) -> Result<Vec<u8>> {
        let signer_info = &self.content.signer_info;
        let x5c = signer_info
            .certificate_chain
            .iter()
            .map(|c| Ok(STANDARD.encode(x509::to_der(c)?)))
            .collect::<Result<Vec<String>>>()?;
        let jws = JwsJson {
            payload: self.payload.clone(),
            protected: self.protected.clone(),
            header: UnprotectedHeader {
                timestamp_signature: signer_info
                    .unsigned_attributes
                    .timestamp_signature
                    .as_ref()
                    .map(|t| STANDARD.encode(t)),
                signing_agent: signer_info.unsigned_attributes.signing_agent.clone(),
                x5c,
            },
            signature: URL_SAFE_NO_PAD.encode(&signer_info.signature),
        };
        serde_json::to_vec(&jws).map_err(|e| EnvelopeError::MalformedEnvelope(e.to_string()))
    }
}

/// Splits the protected header into its fixed members and the extended
/// attributes, which keep the order they were signed in.
fn parse_protected(
    mut header: Map<String, Value>,
    order: Vec<String>,
) -> Result<(String, SignedAttributes, SignatureAlgorithm)> {
    let missing = |key: &str| EnvelopeError::MalformedEnvelope(format!("missing `{key}` header"));

    let alg = header.remove("alg").ok_or_else(|| missing("alg"))?;
    let algorithm = SignatureAlgorithm::from_jws_name(alg.as_str().unwrap_or_default())?;
    let cty = header
        .remove("cty")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| missing("cty"))?;
    if cty != crate::descriptor::MEDIA_TYPE_PAYLOAD_V1 {
        return Err(EnvelopeError::MalformedEnvelope(format!(
            "unsupported payload content type `{cty}`"
        )));
    }

    let crit: Vec<String> = match header.remove("crit") {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                other => Err(EnvelopeError::MalformedEnvelope(format!(
                    "`crit` entry {other} is not a string"
                ))),
            })
            .collect::<Result<_>>()?,
        Some(_) => {
            return Err(EnvelopeError::MalformedEnvelope(
                "`crit` must be an array".into(),
            ))
        }
        None => return Err(missing("crit")),
    };
    for key in &crit {
        if key != HEADER_SIGNING_SCHEME
            && key != HEADER_SIGNING_TIME
            && key != HEADER_AUTHENTIC_SIGNING_TIME
            && key != HEADER_EXPIRY
            && !header.contains_key(key)
        {
            return Err(EnvelopeError::MalformedEnvelope(format!(
                "critical header `{key}` is not present"
            )));
        }
    }

    let scheme = header
        .remove(HEADER_SIGNING_SCHEME)
        .and_then(|v| v.as_str().and_then(|s| s.parse::<SigningScheme>().ok()))
        .ok_or_else(|| missing(HEADER_SIGNING_SCHEME))?;
    if !crit.iter().any(|k| k == HEADER_SIGNING_SCHEME) {
        return Err(EnvelopeError::MalformedEnvelope(format!(
            "`{HEADER_SIGNING_SCHEME}` must be marked critical"
        )));
    }

    let signing_time = match scheme {
        SigningScheme::X509 => {
            if header.contains_key(HEADER_AUTHENTIC_SIGNING_TIME) {
                return Err(EnvelopeError::MalformedEnvelope(format!(
                    "`{HEADER_AUTHENTIC_SIGNING_TIME}` is not allowed with {scheme}"
                )));
            }
            let value = header
                .remove(HEADER_SIGNING_TIME)
                .ok_or_else(|| missing(HEADER_SIGNING_TIME))?;
            parse_time(&value, HEADER_SIGNING_TIME)?
        }
        SigningScheme::X509SigningAuthority => {
            if !crit.iter().any(|k| k == HEADER_AUTHENTIC_SIGNING_TIME) {
                return Err(EnvelopeError::MalformedEnvelope(format!(
                    "`{HEADER_AUTHENTIC_SIGNING_TIME}` must be marked critical"
                )));
            }
            let value = header
                .remove(HEADER_AUTHENTIC_SIGNING_TIME)
                .ok_or_else(|| missing(HEADER_AUTHENTIC_SIGNING_TIME))?;
            header.remove(HEADER_SIGNING_TIME);
            parse_time(&value, HEADER_AUTHENTIC_SIGNING_TIME)?
        }
    };

    let expiry = match header.remove(HEADER_EXPIRY) {
        Some(value) => {
            if !crit.iter().any(|k| k == HEADER_EXPIRY) {
                return Err(EnvelopeError::MalformedEnvelope(format!(
                    "`{HEADER_EXPIRY}` must be marked critical"
                )));
            }
            Some(parse_time(&value, HEADER_EXPIRY)?)
        }
        None => None,
    };

    let extended_attributes = order
        .into_iter()
        .filter_map(|key| {
            let value = header.remove(&key)?;
            Some(Attribute {
                critical: crit.contains(&key),
                key,
                value,
            })
        })
        .collect();

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

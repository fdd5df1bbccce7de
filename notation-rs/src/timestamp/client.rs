// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::time::Duration;

use async_trait::async_trait;
use der::{asn1::OctetString, Decode, Encode};
use log::debug;
use rand::Rng;
use spki::AlgorithmIdentifierOwned;

use super::{
    asn1::{MessageImprint, TimeStampReq, TimeStampResp},
    Result, SignedToken, TimestampError,
};
use crate::crypto::HashAlgorithm;

const MEDIA_TYPE_QUERY: &str = "application/timestamp-query";
const MEDIA_TYPE_REPLY: &str = "application/timestamp-reply";
const MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

/// What to timestamp: the hash of a message under a given algorithm.
#[derive(Clone, Debug)]
pub struct TimestampRequest {
    pub hash_algorithm: HashAlgorithm,
    pub hashed_message: Vec<u8>,
    pub nonce: u64,
}

impl TimestampRequest {
    pub fn new(message: &[u8], hash_algorithm: HashAlgorithm) -> Self {
        Self {
            hash_algorithm,
            hashed_message: hash_algorithm.digest(message),
            nonce: rand::thread_rng().gen(),
        }
    }

    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(TimeStampReq {
            version: 1,
            message_imprint: MessageImprint {
                hash_algorithm: AlgorithmIdentifierOwned {
                    oid: self.hash_algorithm.oid(),
                    parameters: None,
                },
                hashed_message: OctetString::new(self.hashed_message.clone())?,
            },
            req_policy: None,
            nonce: Some(self.nonce),
            cert_req: true,
            extensions: None,
        }
        .to_der()?)
    }

    /// Checks a DER TimeStampResp against this request and returns the token.
    pub fn accept(&self, der: &[u8]) -> Result<(Vec<u8>, SignedToken)> {
        let response = TimeStampResp::from_der(der)?;
        if !response.status.is_granted() {
            return Err(TimestampError::Rejected {
                status: response.status.status,
                reason: response
                    .status
                    .status_string
                    .unwrap_or_default()
                    .join("; "),
            });
        }
        let content_info = response
            .time_stamp_token
            .ok_or_else(|| TimestampError::Malformed("granted response without token".into()))?;
        let token = SignedToken::from_content_info(&content_info)?;
        if token.tst_info().nonce != Some(self.nonce) {
            return Err(TimestampError::NonceMismatch);
        }
        let imprint = &token.tst_info().message_imprint;
        if imprint.hash_algorithm.oid != self.hash_algorithm.oid()
            || imprint.hashed_message.as_bytes() != self.hashed_message.as_slice()
        {
            return Err(TimestampError::MessageImprintMismatch);
        }
        Ok((content_info.to_der()?, token))
    }
}

/// Obtains RFC 3161 timestamp tokens.
#[async_trait]
pub trait Timestamper: Send + Sync {
    /// Returns the DER TimeStampToken together with its parsed form.
    async fn timestamp(&self, request: &TimestampRequest) -> Result<(Vec<u8>, SignedToken)>;
}

/// A timestamp authority reached over HTTP.
pub struct HttpTimestamper {
    url: url::Url,
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpTimestamper {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let parsed = url::Url::parse(url).map_err(|_| TimestampError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TimestampError::InvalidUrl(url.to_string()));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|source| TimestampError::Http {
                url: url.to_string(),
                source,
            })?;
        Ok(Self {
            url: parsed,
            http,
            timeout,
        })
    }
}

#[async_trait]
impl Timestamper for HttpTimestamper {
    async fn timestamp(&self, request: &TimestampRequest) -> Result<(Vec<u8>, SignedToken)> {
        let url = self.url.to_string();
        let http_err = |source| TimestampError::Http {
            url: url.clone(),
            source,
        };
        let response = self
            .http
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, MEDIA_TYPE_QUERY)
            .header(reqwest::header::ACCEPT, MEDIA_TYPE_REPLY)
            .body(request.to_der()?)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(http_err)?;
        if !response.status().is_success() {
            return Err(TimestampError::HttpStatus {
                url,
                status: response.status().as_u16(),
            });
        }
        let body = response.bytes().await.map_err(http_err)?;
        if body.len() > MAX_RESPONSE_SIZE {
            return Err(TimestampError::Malformed(format!(
                "response exceeds {MAX_RESPONSE_SIZE} bytes"
            )));
        }
        let accepted = request.accept(&body)?;
        debug!(
            "timestamp authority {url} granted a token at {}",
            accepted.1.gen_time()
        );
        Ok(accepted)
    }
}

// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::Path;

use async_trait::async_trait;
use x509_cert::Certificate;

use super::{Result, SignError};
use crate::{
    crypto::{KeySpec, PrivateKey, PublicKey},
    envelope::{self, PrimitiveSigner},
    x509,
};

/// A PKCS#8 key on disk together with its leaf-first certificate chain.
#[derive(Debug)]
pub struct LocalSigner {
    key: PrivateKey,
    chain: Vec<Certificate>,
}

impl LocalSigner {
    /// Pairs `key` with `chain`, checking that the leaf certifies this key.
    pub fn new(key: PrivateKey, chain: Vec<Certificate>) -> Result<Self> {
        let key_spec = key.key_spec()?;
        envelope::check_signer_output(key_spec, &chain)?;
        let algorithm = key_spec.signature_algorithm();
        let challenge = b"notation-rs key pair check";
        let signature = key.sign(algorithm, challenge)?;
        let leaf = chain.first().ok_or(envelope::EnvelopeError::EmptyCertificateChain)?;
        PublicKey::from_certificate(leaf)?
            .verify(algorithm, challenge, &signature)
            .map_err(|_| {
                SignError::InvalidKey(format!(
                    "private key does not match certificate `{}`",
                    x509::subject(leaf)
                ))
            })?;
        Ok(Self { key, chain })
    }

    pub fn from_files(key_path: &Path, cert_path: &Path) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path).map_err(|source| SignError::Io {
                path: path.to_path_buf(),
                source,
            })
        };
        let key_pem = String::from_utf8(read(key_path)?).map_err(|_| {
            SignError::InvalidKey(format!("{} is not a PEM file", key_path.display()))
        })?;
        let key = PrivateKey::from_pem(&key_pem)?;
        let chain = x509::parse_pem_chain(&read(cert_path)?)?;
        Self::new(key, chain)
    }

    pub fn chain(&self) -> &[Certificate] {
        &self.chain
    }
}

#[async_trait]
impl PrimitiveSigner for LocalSigner {
    async fn key_spec(&self) -> envelope::Result<KeySpec> {
        Ok(self.key.key_spec()?)
    }

    async fn sign(&self, payload: &[u8]) -> envelope::Result<(Vec<u8>, Vec<Certificate>)> {
        let algorithm = self.key.key_spec()?.signature_algorithm();
        Ok((self.key.sign(algorithm, payload)?, self.chain.clone()))
    }
}

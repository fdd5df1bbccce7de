// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use rsa::{
    pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey, RsaPrivateKey,
};
use signature::Signer;

use super::{CryptoError, KeySpec, PublicKey, Result, SignatureAlgorithm};

/// A local signing key loaded from PEM.
pub enum PrivateKey {
    Rsa(Box<RsaPrivateKey>),
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
    P521(p521::ecdsa::SigningKey),
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            PrivateKey::Rsa(_) => "Rsa",
            PrivateKey::P256(_) => "P256",
            PrivateKey::P384(_) => "P384",
            PrivateKey::P521(_) => "P521",
        };
        f.debug_tuple("PrivateKey").field(&kind).finish()
    }
}

impl PrivateKey {
    /// Parses a PKCS#8 PEM key. PKCS#1 RSA and SEC1 EC keys are accepted too.
    pub fn from_pem(pem: &str) -> Result<Self> {
        if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
            return Ok(PrivateKey::Rsa(Box::new(key)));
        }
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_pem(pem) {
            return Ok(PrivateKey::P256(key));
        }
        if let Ok(key) = p384::ecdsa::SigningKey::from_pkcs8_pem(pem) {
            return Ok(PrivateKey::P384(key));
        }
        if let Ok(secret) = p521::SecretKey::from_pkcs8_pem(pem) {
            return Self::p521_from_secret(secret);
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
            return Ok(PrivateKey::Rsa(Box::new(key)));
        }
        if let Ok(secret) = p256::SecretKey::from_sec1_pem(pem) {
            return Ok(PrivateKey::P256(secret.into()));
        }
        if let Ok(secret) = p384::SecretKey::from_sec1_pem(pem) {
            return Ok(PrivateKey::P384(secret.into()));
        }
        if let Ok(secret) = p521::SecretKey::from_sec1_pem(pem) {
            return Self::p521_from_secret(secret);
        }

        Err(CryptoError::UnsupportedKey(
            "expected an RSA or NIST P-curve private key in PEM".into(),
        ))
    }

    fn p521_from_secret(secret: p521::SecretKey) -> Result<Self> {
        p521::ecdsa::SigningKey::from_slice(&secret.to_bytes())
            .map(PrivateKey::P521)
            .map_err(|e| CryptoError::InvalidKey(format!("p521 key: {e}")))
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            PrivateKey::Rsa(key) => PublicKey::Rsa(key.to_public_key()),
            PrivateKey::P256(key) => PublicKey::P256(*key.verifying_key()),
            PrivateKey::P384(key) => PublicKey::P384(*key.verifying_key()),
            PrivateKey::P521(key) => PublicKey::P521(p521::ecdsa::VerifyingKey::from(key)),
        }
    }

    pub fn key_spec(&self) -> Result<KeySpec> {
        self.public_key().key_spec()
    }

    /// Produces an envelope signature: RSASSA-PSS or fixed width `r||s` ECDSA.
    pub fn sign(&self, algorithm: SignatureAlgorithm, message: &[u8]) -> Result<Vec<u8>> {
        let key_spec = self.key_spec()?;
        if key_spec.signature_algorithm() != algorithm {
            return Err(CryptoError::AlgorithmMismatch {
                algorithm,
                key_spec,
            });
        }

        let signing = |e: signature::Error| CryptoError::Signing(e.to_string());
        match self {
            PrivateKey::Rsa(key) => {
                let hash = algorithm.hash();
                let hashed = hash.digest(message);
                key.sign_with_rng(&mut rand::thread_rng(), hash.pss(), &hashed)
                    .map_err(|e| CryptoError::Signing(e.to_string()))
            }
            PrivateKey::P256(key) => {
                let sig: p256::ecdsa::Signature = key.try_sign(message).map_err(signing)?;
                Ok(sig.to_bytes().to_vec())
            }
            PrivateKey::P384(key) => {
                let sig: p384::ecdsa::Signature = key.try_sign(message).map_err(signing)?;
                Ok(sig.to_bytes().to_vec())
            }
            PrivateKey::P521(key) => {
                let sig: p521::ecdsa::Signature = key.try_sign(message).map_err(signing)?;
                Ok(sig.to_bytes().to_vec())
            }
        }
    }
}

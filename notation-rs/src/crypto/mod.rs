// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Key specs, signature algorithms and the public-key operations shared by
//! the envelope codec and certificate validation.

use const_oid::db::rfc5912::{
    ECDSA_WITH_SHA_256, ECDSA_WITH_SHA_384, ECDSA_WITH_SHA_512, ID_EC_PUBLIC_KEY, ID_RSASSA_PSS,
    ID_SHA_1, ID_SHA_256, ID_SHA_384, ID_SHA_512, RSA_ENCRYPTION, SECP_256_R_1, SECP_384_R_1,
    SECP_521_R_1, SHA_1_WITH_RSA_ENCRYPTION, SHA_256_WITH_RSA_ENCRYPTION,
    SHA_384_WITH_RSA_ENCRYPTION, SHA_512_WITH_RSA_ENCRYPTION,
};
use der::{asn1::ObjectIdentifier, referenced::OwnedToRef, Decode, Encode, Sequence};
use rsa::{traits::PublicKeyParts, Pkcs1v15Sign, Pss, RsaPublicKey};
use sha2::Digest as _;
use signature::hazmat::PrehashVerifier;
use spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;

mod key;

pub use key::PrivateKey;

pub type Result<T> = std::result::Result<T, CryptoError>;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("unsupported key: {0}")]
    UnsupportedKey(String),

    #[error("unsupported signature algorithm `{0}`")]
    UnsupportedAlgorithm(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("signature algorithm {algorithm} does not match key spec {key_spec}")]
    AlgorithmMismatch {
        algorithm: SignatureAlgorithm,
        key_spec: KeySpec,
    },

    #[error("signature verification failed")]
    VerificationFailed,

    #[error("signing failed: {0}")]
    Signing(String),
}

/// Hash functions used by the supported signature algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, Display, EnumString)]
pub enum HashAlgorithm {
    #[strum(serialize = "SHA-1")]
    Sha1,
    #[strum(serialize = "SHA-256")]
    Sha256,
    #[strum(serialize = "SHA-384")]
    Sha384,
    #[strum(serialize = "SHA-512")]
    Sha512,
}

impl HashAlgorithm {
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha1 => sha1::Sha1::digest(data).to_vec(),
            HashAlgorithm::Sha256 => sha2::Sha256::digest(data).to_vec(),
            HashAlgorithm::Sha384 => sha2::Sha384::digest(data).to_vec(),
            HashAlgorithm::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }

    pub fn output_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            HashAlgorithm::Sha1 => ID_SHA_1,
            HashAlgorithm::Sha256 => ID_SHA_256,
            HashAlgorithm::Sha384 => ID_SHA_384,
            HashAlgorithm::Sha512 => ID_SHA_512,
        }
    }

    pub fn from_oid(oid: &ObjectIdentifier) -> Result<Self> {
        match *oid {
            ID_SHA_1 => Ok(HashAlgorithm::Sha1),
            ID_SHA_256 => Ok(HashAlgorithm::Sha256),
            ID_SHA_384 => Ok(HashAlgorithm::Sha384),
            ID_SHA_512 => Ok(HashAlgorithm::Sha512),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    /// Digest algorithm used for OCI descriptors signed with this hash.
    pub fn digest_algorithm(&self) -> crate::digest::DigestAlgorithm {
        match self {
            HashAlgorithm::Sha384 => crate::digest::DigestAlgorithm::Sha384,
            HashAlgorithm::Sha512 => crate::digest::DigestAlgorithm::Sha512,
            _ => crate::digest::DigestAlgorithm::Sha256,
        }
    }

    fn pss(&self) -> Pss {
        match self {
            HashAlgorithm::Sha1 => Pss::new::<sha1::Sha1>(),
            HashAlgorithm::Sha256 => Pss::new::<sha2::Sha256>(),
            HashAlgorithm::Sha384 => Pss::new::<sha2::Sha384>(),
            HashAlgorithm::Sha512 => Pss::new::<sha2::Sha512>(),
        }
    }

    fn pss_with_salt(&self, salt_len: usize) -> Pss {
        match self {
            HashAlgorithm::Sha1 => Pss::new_with_salt::<sha1::Sha1>(salt_len),
            HashAlgorithm::Sha256 => Pss::new_with_salt::<sha2::Sha256>(salt_len),
            HashAlgorithm::Sha384 => Pss::new_with_salt::<sha2::Sha384>(salt_len),
            HashAlgorithm::Sha512 => Pss::new_with_salt::<sha2::Sha512>(salt_len),
        }
    }

    fn pkcs1v15(&self) -> Pkcs1v15Sign {
        match self {
            HashAlgorithm::Sha1 => Pkcs1v15Sign::new::<sha1::Sha1>(),
            HashAlgorithm::Sha256 => Pkcs1v15Sign::new::<sha2::Sha256>(),
            HashAlgorithm::Sha384 => Pkcs1v15Sign::new::<sha2::Sha384>(),
            HashAlgorithm::Sha512 => Pkcs1v15Sign::new::<sha2::Sha512>(),
        }
    }
}

/// Key type and size of a signing key, using the plugin wire names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, Display, EnumString)]
pub enum KeySpec {
    #[strum(serialize = "RSA-2048")]
    Rsa2048,
    #[strum(serialize = "RSA-3072")]
    Rsa3072,
    #[strum(serialize = "RSA-4096")]
    Rsa4096,
    #[strum(serialize = "EC-256")]
    Ec256,
    #[strum(serialize = "EC-384")]
    Ec384,
    #[strum(serialize = "EC-521")]
    Ec521,
}

impl KeySpec {
    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        match self {
            KeySpec::Rsa2048 => SignatureAlgorithm::RsaPssSha256,
            KeySpec::Rsa3072 => SignatureAlgorithm::RsaPssSha384,
            KeySpec::Rsa4096 => SignatureAlgorithm::RsaPssSha512,
            KeySpec::Ec256 => SignatureAlgorithm::EcdsaSha256,
            KeySpec::Ec384 => SignatureAlgorithm::EcdsaSha384,
            KeySpec::Ec521 => SignatureAlgorithm::EcdsaSha512,
        }
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.signature_algorithm().hash()
    }

    pub fn from_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self> {
        PublicKey::from_spki(spki)?.key_spec()
    }
}

/// Envelope signature algorithms, using the plugin wire names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, Display, EnumString)]
pub enum SignatureAlgorithm {
    #[strum(serialize = "RSASSA-PSS-SHA-256")]
    RsaPssSha256,
    #[strum(serialize = "RSASSA-PSS-SHA-384")]
    RsaPssSha384,
    #[strum(serialize = "RSASSA-PSS-SHA-512")]
    RsaPssSha512,
    #[strum(serialize = "ECDSA-SHA-256")]
    EcdsaSha256,
    #[strum(serialize = "ECDSA-SHA-384")]
    EcdsaSha384,
    #[strum(serialize = "ECDSA-SHA-512")]
    EcdsaSha512,
}

impl SignatureAlgorithm {
    pub fn hash(&self) -> HashAlgorithm {
        match self {
            SignatureAlgorithm::RsaPssSha256 | SignatureAlgorithm::EcdsaSha256 => {
                HashAlgorithm::Sha256
            }
            SignatureAlgorithm::RsaPssSha384 | SignatureAlgorithm::EcdsaSha384 => {
                HashAlgorithm::Sha384
            }
            SignatureAlgorithm::RsaPssSha512 | SignatureAlgorithm::EcdsaSha512 => {
                HashAlgorithm::Sha512
            }
        }
    }

    /// JOSE `alg` header value.
    pub fn jws_name(&self) -> &'static str {
        match self {
            SignatureAlgorithm::RsaPssSha256 => "PS256",
            SignatureAlgorithm::RsaPssSha384 => "PS384",
            SignatureAlgorithm::RsaPssSha512 => "PS512",
            SignatureAlgorithm::EcdsaSha256 => "ES256",
            SignatureAlgorithm::EcdsaSha384 => "ES384",
            SignatureAlgorithm::EcdsaSha512 => "ES512",
        }
    }

    pub fn from_jws_name(name: &str) -> Result<Self> {
        Ok(match name {
            "PS256" => SignatureAlgorithm::RsaPssSha256,
            "PS384" => SignatureAlgorithm::RsaPssSha384,
            "PS512" => SignatureAlgorithm::RsaPssSha512,
            "ES256" => SignatureAlgorithm::EcdsaSha256,
            "ES384" => SignatureAlgorithm::EcdsaSha384,
            "ES512" => SignatureAlgorithm::EcdsaSha512,
            other => return Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        })
    }

    /// COSE algorithm identifier.
    pub fn cose_id(&self) -> i64 {
        match self {
            SignatureAlgorithm::RsaPssSha256 => -37,
            SignatureAlgorithm::RsaPssSha384 => -38,
            SignatureAlgorithm::RsaPssSha512 => -39,
            SignatureAlgorithm::EcdsaSha256 => -7,
            SignatureAlgorithm::EcdsaSha384 => -35,
            SignatureAlgorithm::EcdsaSha512 => -36,
        }
    }

    pub fn from_cose_id(id: i64) -> Result<Self> {
        Ok(match id {
            -37 => SignatureAlgorithm::RsaPssSha256,
            -38 => SignatureAlgorithm::RsaPssSha384,
            -39 => SignatureAlgorithm::RsaPssSha512,
            -7 => SignatureAlgorithm::EcdsaSha256,
            -35 => SignatureAlgorithm::EcdsaSha384,
            -36 => SignatureAlgorithm::EcdsaSha512,
            other => return Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        })
    }
}

/// RSASSA-PSS-params (RFC 4055). Only the fields used for verification.
#[derive(Clone, Debug, Sequence)]
struct PssParams {
    #[asn1(context_specific = "0", optional = "true")]
    hash: Option<AlgorithmIdentifierOwned>,
    #[asn1(context_specific = "1", optional = "true")]
    mask_gen: Option<AlgorithmIdentifierOwned>,
    #[asn1(context_specific = "2", optional = "true")]
    salt_len: Option<u32>,
    #[asn1(context_specific = "3", optional = "true")]
    trailer_field: Option<u32>,
}

/// A public key able to check envelope and certificate signatures.
#[derive(Clone)]
pub enum PublicKey {
    Rsa(RsaPublicKey),
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
    P521(p521::ecdsa::VerifyingKey),
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublicKey::Rsa(key) => f.debug_tuple("Rsa").field(key).finish(),
            PublicKey::P256(key) => f.debug_tuple("P256").field(key).finish(),
            PublicKey::P384(key) => f.debug_tuple("P384").field(key).finish(),
            // p521 0.13's VerifyingKey does not implement Debug.
            PublicKey::P521(_) => f.debug_tuple("P521").field(&"..").finish(),
        }
    }
}

impl PublicKey {
    pub fn from_spki(spki: &SubjectPublicKeyInfoOwned) -> Result<Self> {
        match spki.algorithm.oid {
            RSA_ENCRYPTION => RsaPublicKey::try_from(spki.owned_to_ref())
                .map(PublicKey::Rsa)
                .map_err(|e| CryptoError::InvalidKey(format!("rsa public key: {e}"))),
            ID_EC_PUBLIC_KEY => {
                let curve: ObjectIdentifier = spki
                    .algorithm
                    .parameters
                    .as_ref()
                    .ok_or_else(|| CryptoError::InvalidKey("missing curve parameter".into()))?
                    .decode_as()
                    .map_err(|e| CryptoError::InvalidKey(format!("curve parameter: {e}")))?;
                let point = spki.subject_public_key.raw_bytes();
                let invalid = |e: signature::Error| CryptoError::InvalidKey(format!("ec point: {e}"));
                match curve {
                    SECP_256_R_1 => p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
                        .map(PublicKey::P256)
                        .map_err(invalid),
                    SECP_384_R_1 => p384::ecdsa::VerifyingKey::from_sec1_bytes(point)
                        .map(PublicKey::P384)
                        .map_err(invalid),
                    SECP_521_R_1 => p521::ecdsa::VerifyingKey::from_sec1_bytes(point)
                        .map(PublicKey::P521)
                        .map_err(invalid),
                    other => Err(CryptoError::UnsupportedKey(format!("curve {other}"))),
                }
            }
            other => Err(CryptoError::UnsupportedKey(format!("algorithm {other}"))),
        }
    }

    pub fn from_certificate(cert: &x509_cert::Certificate) -> Result<Self> {
        Self::from_spki(&cert.tbs_certificate.subject_public_key_info)
    }

    pub fn key_spec(&self) -> Result<KeySpec> {
        match self {
            PublicKey::Rsa(key) => match key.size() * 8 {
                2048 => Ok(KeySpec::Rsa2048),
                3072 => Ok(KeySpec::Rsa3072),
                4096 => Ok(KeySpec::Rsa4096),
                bits => Err(CryptoError::UnsupportedKey(format!("RSA key size {bits}"))),
            },
            PublicKey::P256(_) => Ok(KeySpec::Ec256),
            PublicKey::P384(_) => Ok(KeySpec::Ec384),
            PublicKey::P521(_) => Ok(KeySpec::Ec521),
        }
    }

    /// Verifies an envelope signature: RSASSA-PSS, or fixed width `r||s` ECDSA.
    pub fn verify(&self, algorithm: SignatureAlgorithm, message: &[u8], sig: &[u8]) -> Result<()> {
        let key_spec = self.key_spec()?;
        if key_spec.signature_algorithm() != algorithm {
            return Err(CryptoError::AlgorithmMismatch {
                algorithm,
                key_spec,
            });
        }

        let hash = algorithm.hash();
        let hashed = hash.digest(message);
        match self {
            PublicKey::Rsa(key) => key
                .verify(hash.pss(), &hashed, sig)
                .map_err(|_| CryptoError::VerificationFailed),
            _ => self.verify_ecdsa_prehash(&hashed, sig, false),
        }
    }

    /// Verifies a signature made with an X.509 signature algorithm
    /// (certificates, CRLs, OCSP responses, CMS signer infos).
    pub fn verify_x509(
        &self,
        algorithm: &AlgorithmIdentifierOwned,
        message: &[u8],
        sig: &[u8],
    ) -> Result<()> {
        match (self, algorithm.oid) {
            (PublicKey::Rsa(key), oid) if oid == RSA_ENCRYPTION || oid == SHA_256_WITH_RSA_ENCRYPTION => {
                // rsaEncryption as a signature algorithm shows up in CMS signer infos
                let hashed = HashAlgorithm::Sha256.digest(message);
                key.verify(HashAlgorithm::Sha256.pkcs1v15(), &hashed, sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
            (PublicKey::Rsa(key), SHA_1_WITH_RSA_ENCRYPTION) => {
                let hashed = HashAlgorithm::Sha1.digest(message);
                key.verify(HashAlgorithm::Sha1.pkcs1v15(), &hashed, sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
            (PublicKey::Rsa(key), SHA_384_WITH_RSA_ENCRYPTION) => {
                let hashed = HashAlgorithm::Sha384.digest(message);
                key.verify(HashAlgorithm::Sha384.pkcs1v15(), &hashed, sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
            (PublicKey::Rsa(key), SHA_512_WITH_RSA_ENCRYPTION) => {
                let hashed = HashAlgorithm::Sha512.digest(message);
                key.verify(HashAlgorithm::Sha512.pkcs1v15(), &hashed, sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
            (PublicKey::Rsa(key), ID_RSASSA_PSS) => {
                let params = algorithm
                    .parameters
                    .as_ref()
                    .ok_or_else(|| CryptoError::UnsupportedAlgorithm("RSASSA-PSS without parameters".into()))?
                    .to_der()
                    .and_then(|der| PssParams::from_der(&der))
                    .map_err(|e| CryptoError::UnsupportedAlgorithm(format!("RSASSA-PSS parameters: {e}")))?;
                let hash = match &params.hash {
                    Some(alg) => HashAlgorithm::from_oid(&alg.oid)?,
                    None => HashAlgorithm::Sha1,
                };
                let salt_len = params.salt_len.unwrap_or(20) as usize;
                let hashed = hash.digest(message);
                key.verify(hash.pss_with_salt(salt_len), &hashed, sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
            (PublicKey::Rsa(_), oid) => Err(CryptoError::UnsupportedAlgorithm(oid.to_string())),
            (_, ECDSA_WITH_SHA_256) => {
                self.verify_ecdsa_prehash(&HashAlgorithm::Sha256.digest(message), sig, true)
            }
            (_, ECDSA_WITH_SHA_384) => {
                self.verify_ecdsa_prehash(&HashAlgorithm::Sha384.digest(message), sig, true)
            }
            (_, ECDSA_WITH_SHA_512) => {
                self.verify_ecdsa_prehash(&HashAlgorithm::Sha512.digest(message), sig, true)
            }
            (_, oid) => Err(CryptoError::UnsupportedAlgorithm(oid.to_string())),
        }
    }

    fn verify_ecdsa_prehash(&self, prehash: &[u8], sig: &[u8], der_encoded: bool) -> Result<()> {
        let failed = |_| CryptoError::VerificationFailed;
        match self {
            PublicKey::P256(key) => {
                let sig = if der_encoded {
                    p256::ecdsa::Signature::from_der(sig)
                } else {
                    p256::ecdsa::Signature::from_slice(sig)
                }
                .map_err(failed)?;
                key.verify_prehash(prehash, &sig).map_err(failed)
            }
            PublicKey::P384(key) => {
                let sig = if der_encoded {
                    p384::ecdsa::Signature::from_der(sig)
                } else {
                    p384::ecdsa::Signature::from_slice(sig)
                }
                .map_err(failed)?;
                key.verify_prehash(prehash, &sig).map_err(failed)
            }
            PublicKey::P521(key) => {
                let sig = if der_encoded {
                    p521::ecdsa::Signature::from_der(sig)
                } else {
                    p521::ecdsa::Signature::from_slice(sig)
                }
                .map_err(failed)?;
                key.verify_prehash(prehash, &sig).map_err(failed)
            }
            PublicKey::Rsa(_) => Err(CryptoError::UnsupportedAlgorithm("ECDSA with RSA key".into())),
        }
    }
}

// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use thiserror::Error;

use crate::{
    blob, config, crypto, descriptor, envelope, plugin, registry, revocation, signer, timestamp, trustpolicy,
    truststore, verifier, x509,
};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid descriptor")]
    Descriptor(#[from] descriptor::DescriptorError),

    #[error("signature envelope error")]
    Envelope(#[from] envelope::EnvelopeError),

    #[error("certificate error")]
    Certificate(#[from] x509::CertificateError),

    #[error("revocation check failed")]
    Revocation(#[from] revocation::RevocationError),

    #[error("timestamp error")]
    Timestamp(#[from] timestamp::TimestampError),

    #[error("trust policy error")]
    Policy(#[from] trustpolicy::PolicyError),

    #[error("trust store error")]
    TrustStore(#[from] truststore::TrustStoreError),

    #[error("plugin error")]
    Plugin(#[from] plugin::PluginError),

    #[error("registry error")]
    Registry(#[from] registry::RegistryError),

    #[error("signing failed")]
    Sign(#[from] signer::SignError),

    #[error("verification failed")]
    Verification(#[from] verifier::VerificationError),

    #[error("cryptographic error")]
    Crypto(#[from] crypto::CryptoError),

    #[error("blob error")]
    Blob(#[from] blob::BlobError),

    #[error("configuration error")]
    Config(#[from] config::ConfigError),
}

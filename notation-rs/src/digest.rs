// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use strum::{AsRefStr, Display, EnumString};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::descriptor::DescriptorError;

pub const DIGEST_SHA256_PREFIX: &str = "sha256:";
pub const DIGEST_SHA384_PREFIX: &str = "sha384:";
pub const DIGEST_SHA512_PREFIX: &str = "sha512:";

/// Digest algorithms allowed in OCI content identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, AsRefStr, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    /// Length of the lowercase hex encoding.
    pub fn hex_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha256 => 64,
            DigestAlgorithm::Sha384 => 96,
            DigestAlgorithm::Sha512 => 128,
        }
    }

    pub fn hasher(&self) -> DigestHasher {
        match self {
            DigestAlgorithm::Sha256 => DigestHasher::Sha256(sha2::Sha256::new()),
            DigestAlgorithm::Sha384 => DigestHasher::Sha384(sha2::Sha384::new()),
            DigestAlgorithm::Sha512 => DigestHasher::Sha512(sha2::Sha512::new()),
        }
    }

    pub fn digest(&self, data: &[u8]) -> Digest {
        let mut hasher = self.hasher();
        hasher.update(data);
        hasher.finalize()
    }
}

/// An OCI content digest, `<algorithm>:<hex>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Checks `data` against this digest.
    pub fn verify(&self, data: &[u8]) -> bool {
        self.algorithm.digest(data) == *self
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl FromStr for Digest {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| DescriptorError::InvalidDigest(s.to_string()))?;
        let algorithm = DigestAlgorithm::from_str(algorithm)
            .map_err(|_| DescriptorError::UnsupportedDigestAlgorithm(algorithm.to_string()))?;
        if hex.len() != algorithm.hex_len()
            || !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(DescriptorError::InvalidDigest(s.to_string()));
        }

        Ok(Digest {
            algorithm,
            hex: hex.to_string(),
        })
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug)]
pub enum DigestHasher {
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl DigestHasher {
    pub fn update(&mut self, buf: &[u8]) {
        match self {
            DigestHasher::Sha256(hasher) => hasher.update(buf),
            DigestHasher::Sha384(hasher) => hasher.update(buf),
            DigestHasher::Sha512(hasher) => hasher.update(buf),
        }
    }

    pub fn finalize(self) -> Digest {
        let (algorithm, hex) = match self {
            DigestHasher::Sha256(hasher) => (DigestAlgorithm::Sha256, hex::encode(hasher.finalize())),
            DigestHasher::Sha384(hasher) => (DigestAlgorithm::Sha384, hex::encode(hasher.finalize())),
            DigestHasher::Sha512(hasher) => (DigestAlgorithm::Sha512, hex::encode(hasher.finalize())),
        };
        Digest { algorithm, hex }
    }
}

/// Streams `reader` through a hasher, returning the digest and byte count.
pub async fn digest_reader<R>(algorithm: DigestAlgorithm, mut reader: R) -> std::io::Result<(Digest, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = algorithm.hasher();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hasher.finalize(), size))
}

// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Signing and verification of OCI artifacts and arbitrary blobs following
//! the Notary Project specifications.
//!
//! The crate is organised bottom-up: [`envelope`] encodes JWS and COSE
//! signature envelopes, [`x509`], [`revocation`] and [`timestamp`] establish
//! trust in the certificates they carry, [`trustpolicy`] and [`truststore`]
//! describe what the user trusts, and [`verifier`] and [`signer`] tie these
//! together. [`oci`] and [`blob`] are the end-to-end workflows that the
//! `notation` binary calls.

pub mod blob;
pub mod config;
pub mod crypto;
pub mod descriptor;
pub mod digest;
pub mod dir;
pub mod envelope;
pub mod error;
pub mod inspect;
pub mod oci;
pub mod plugin;
pub mod registry;
pub mod revocation;
pub mod signer;
pub mod timestamp;
pub mod trustpolicy;
pub mod truststore;
pub mod verifier;
pub mod x509;

pub use error::{Error, Result};

/// Value of the `io.cncf.notary.signingAgent` unsigned attribute written by
/// this library unless the caller overrides it.
pub const SIGNING_AGENT: &str = concat!("notation-rs/", env!("CARGO_PKG_VERSION"));

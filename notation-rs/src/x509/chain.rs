// Copyright (c) 2025 The notation-rs Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use chrono::{DateTime, Utc};
use der::Encode;
use log::debug;
use x509_cert::{
    ext::pkix::{ExtendedKeyUsage, KeyUsage},
    Certificate,
};

use super::{
    basic_constraints, is_self_issued, not_after, not_before, oid, subject, verify_issued_by,
    CertificateError, Result,
};

/// What the leaf certificate of a chain is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CertificatePurpose {
    CodeSigning,
    Timestamping,
}

/// Orders `leaf` plus whichever of `pool` chain up from it. Unrelated
/// certificates in the pool are ignored.
pub fn build_chain(leaf: &Certificate, pool: &[Certificate]) -> Vec<Certificate> {
    let mut chain = vec![leaf.clone()];
    let mut remaining: Vec<&Certificate> = pool.iter().filter(|c| *c != leaf).collect();
    loop {
        let Some(current) = chain.last() else { break };
        if is_self_issued(current) {
            break;
        }
        let issuer = &current.tbs_certificate.issuer;
        let Some(pos) = remaining
            .iter()
            .position(|c| &c.tbs_certificate.subject == issuer)
        else {
            break;
        };
        chain.push(remaining.remove(pos).clone());
    }
    chain
}

/// Validates a leaf-first chain against trusted roots.
///
/// The chain must already be ordered, end with a self-signed certificate that
/// matches one of `roots` by subject and public key, and satisfy the key usage
/// rules for `purpose`. Validity periods are only checked when `at` is given;
/// callers that need to pick the reference time later use [`check_validity`].
pub fn validate_chain(
    chain: &[Certificate],
    roots: &[Certificate],
    purpose: CertificatePurpose,
    at: Option<DateTime<Utc>>,
) -> Result<()> {
    let Some(leaf) = chain.first() else {
        return Err(CertificateError::EmptyChain);
    };

    for (i, pair) in chain.windows(2).enumerate() {
        let (cert, issuer) = (&pair[0], &pair[1]);
        if cert.tbs_certificate.issuer != issuer.tbs_certificate.subject {
            return Err(CertificateError::ChainIncomplete(format!(
                "issuer of certificate {i} `{}` is not the subject of certificate {}",
                subject(cert),
                i + 1
            )));
        }
        verify_issued_by(cert, issuer)?;
    }

    // terminal certificate
    let root = &chain[chain.len() - 1];
    if !is_self_issued(root) {
        return Err(CertificateError::ChainIncomplete(format!(
            "chain ends with `{}` which is not self-signed",
            subject(root)
        )));
    }
    verify_issued_by(root, root)?;
    let root_subject = root.tbs_certificate.subject.to_der()?;
    let root_key = root.tbs_certificate.subject_public_key_info.to_der()?;
    let trusted = roots.iter().any(|candidate| {
        candidate.tbs_certificate.subject.to_der().ok().as_deref() == Some(root_subject.as_slice())
            && candidate
                .tbs_certificate
                .subject_public_key_info
                .to_der()
                .ok()
                .as_deref()
                == Some(root_key.as_slice())
    });
    if !trusted {
        return Err(CertificateError::UntrustedRoot(subject(root)));
    }

    // intermediates and root must be CAs; path length counts CAs below
    for (i, ca) in chain.iter().enumerate().skip(1) {
        let Some(bc) = basic_constraints(ca)? else {
            return Err(CertificateError::InvalidKeyUsage(format!(
                "`{}` has no basic constraints but issues certificates",
                subject(ca)
            )));
        };
        if !bc.ca {
            return Err(CertificateError::InvalidKeyUsage(format!(
                "`{}` is not a CA but issues certificates",
                subject(ca)
            )));
        }
        if let Some(max) = bc.path_len_constraint {
            if i - 1 > max as usize {
                return Err(CertificateError::InvalidKeyUsage(format!(
                    "path length constraint of `{}` exceeded",
                    subject(ca)
                )));
            }
        }
        if let Some((_, ku)) = ca.tbs_certificate.get::<KeyUsage>()? {
            if !ku.key_cert_sign() {
                return Err(CertificateError::InvalidKeyUsage(format!(
                    "`{}` lacks keyCertSign",
                    subject(ca)
                )));
            }
        }
    }

    validate_leaf(leaf, purpose)?;

    if let Some(at) = at {
        check_validity(chain, at)?;
    }
    debug!(
        "certificate chain for `{}` validated against trusted root `{}`",
        subject(leaf),
        subject(root)
    );
    Ok(())
}

fn validate_leaf(leaf: &Certificate, purpose: CertificatePurpose) -> Result<()> {
    if matches!(basic_constraints(leaf)?, Some(bc) if bc.ca) {
        return Err(CertificateError::InvalidKeyUsage(format!(
            "leaf `{}` is a CA certificate",
            subject(leaf)
        )));
    }
    if let Some((_, ku)) = leaf.tbs_certificate.get::<KeyUsage>()? {
        if !ku.digital_signature() {
            return Err(CertificateError::InvalidKeyUsage(format!(
                "leaf `{}` lacks digitalSignature",
                subject(leaf)
            )));
        }
    }

    let eku = leaf
        .tbs_certificate
        .get::<ExtendedKeyUsage>()?
        .map(|(_, eku)| eku.0);
    match purpose {
        CertificatePurpose::CodeSigning => {
            if let Some(eku) = eku {
                if !eku.contains(&oid::ID_KP_CODE_SIGNING) {
                    return Err(CertificateError::InvalidKeyUsage(format!(
                        "leaf `{}` is not valid for code signing",
                        subject(leaf)
                    )));
                }
            }
        }
        CertificatePurpose::Timestamping => match eku.as_deref() {
            Some([only]) if *only == oid::ID_KP_TIME_STAMPING => {}
            _ => {
                return Err(CertificateError::InvalidKeyUsage(format!(
                    "timestamping certificate `{}` must have timeStamping as its only extended key usage",
                    subject(leaf)
                )))
            }
        },
    }
    Ok(())
}

/// Checks that every certificate in `chain` is valid at `at`.
pub fn check_validity(chain: &[Certificate], at: DateTime<Utc>) -> Result<()> {
    for cert in chain {
        let not_before = not_before(cert);
        if at < not_before {
            return Err(CertificateError::CertNotYetValid {
                subject: subject(cert),
                not_before,
            });
        }
        let not_after = not_after(cert);
        if at > not_after {
            return Err(CertificateError::CertExpired {
                subject: subject(cert),
                not_after,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x509::parse_der;
    use test_utils::{CertSpec, Identity, Profile, TestPki};

    fn certs(ids: &[&Identity]) -> Vec<Certificate> {
        ids.iter().map(|id| parse_der(&id.cert_der()).unwrap()).collect()
    }

    #[test]
    fn test_valid_chain() {
        let pki = TestPki::new();
        let chain = certs(&[&pki.leaf, &pki.root]);
        let roots = certs(&[&pki.root]);
        validate_chain(&chain, &roots, CertificatePurpose::CodeSigning, Some(Utc::now())).unwrap();
    }

    #[test]
    fn test_chain_with_intermediate() {
        let root = CertSpec::new("Root", Profile::Root).self_signed();
        let inter = CertSpec::new("Intermediate", Profile::Intermediate).issued_by(&root);
        let leaf = CertSpec::new("Leaf", Profile::CodeSigning).issued_by(&inter);
        let chain = certs(&[&leaf, &inter, &root]);
        let roots = certs(&[&root]);
        validate_chain(&chain, &roots, CertificatePurpose::CodeSigning, Some(Utc::now())).unwrap();

        // out of order
        let shuffled = certs(&[&leaf, &root, &inter]);
        assert!(matches!(
            validate_chain(&shuffled, &roots, CertificatePurpose::CodeSigning, None),
            Err(CertificateError::ChainIncomplete(_))
        ));

        // build_chain restores the order from an unordered pool
        let built = build_chain(&chain[0], &shuffled);
        assert_eq!(built, chain);
    }

    #[test]
    fn test_untrusted_root() {
        let pki = TestPki::new();
        let other = TestPki::new();
        let chain = certs(&[&pki.leaf, &pki.root]);
        let roots = certs(&[&other.root]);
        assert!(matches!(
            validate_chain(&chain, &roots, CertificatePurpose::CodeSigning, None),
            Err(CertificateError::UntrustedRoot(_))
        ));
    }

    #[test]
    fn test_missing_root() {
        let pki = TestPki::new();
        let chain = certs(&[&pki.leaf]);
        let roots = certs(&[&pki.root]);
        assert!(matches!(
            validate_chain(&chain, &roots, CertificatePurpose::CodeSigning, None),
            Err(CertificateError::ChainIncomplete(_))
        ));
    }

    #[test]
    fn test_expired_leaf() {
        let pki = TestPki::with_leaf(CertSpec::new("Leaf", Profile::CodeSigning).expired());
        let chain = certs(&[&pki.leaf, &pki.root]);
        let roots = certs(&[&pki.root]);
        validate_chain(&chain, &roots, CertificatePurpose::CodeSigning, None).unwrap();
        assert!(matches!(
            validate_chain(&chain, &roots, CertificatePurpose::CodeSigning, Some(Utc::now())),
            Err(CertificateError::CertExpired { .. })
        ));
        let two_hours_ago = Utc::now() - chrono::Duration::hours(2);
        check_validity(&chain, two_hours_ago).unwrap();
    }

    #[test]
    fn test_wrong_purpose() {
        let pki = TestPki::new();
        let chain = certs(&[&pki.leaf, &pki.root]);
        let roots = certs(&[&pki.root]);
        assert!(matches!(
            validate_chain(&chain, &roots, CertificatePurpose::Timestamping, None),
            Err(CertificateError::InvalidKeyUsage(_))
        ));

        let tsa = TestPki::with_leaf(CertSpec::new("TSA", Profile::Timestamping));
        let chain = certs(&[&tsa.leaf, &tsa.root]);
        let roots = certs(&[&tsa.root]);
        validate_chain(&chain, &roots, CertificatePurpose::Timestamping, None).unwrap();
        assert!(matches!(
            validate_chain(&chain, &roots, CertificatePurpose::CodeSigning, None),
            Err(CertificateError::InvalidKeyUsage(_))
        ));
    }

    #[test]
    fn test_self_signed_leaf() {
        let leaf = CertSpec::new("Authority", Profile::SelfSignedCodeSigning).self_signed();
        let chain = certs(&[&leaf]);
        validate_chain(&chain, &chain, CertificatePurpose::CodeSigning, Some(Utc::now())).unwrap();
    }

    #[test]
    fn test_tampered_signature() {
        let pki = TestPki::new();
        let mut chain = certs(&[&pki.leaf, &pki.root]);
        let roots = certs(&[&pki.root]);
        let mut sig = chain[0].signature.raw_bytes().to_vec();
        let last = sig.len() - 1;
        sig[last] ^= 0x01;
        chain[0].signature = der::asn1::BitString::from_bytes(&sig).unwrap();
        assert!(matches!(
            validate_chain(&chain, &roots, CertificatePurpose::CodeSigning, None),
            Err(CertificateError::InvalidChainSignature(_))
        ));
    }
}

// SPDX-FileCopyrightText: 2025 fwpkcs7 contributors
// SPDX-License-Identifier: GPL-3.0-only

//! PKCS#7 verification against a caller-supplied trust anchor.
//!
//! The default [`VerifyPolicy`] is what firmware needs: a chain may end at any
//! trusted certificate, validity periods are ignored because the platform
//! clock cannot be trusted this early, and no key purpose is enforced.

use std::time::SystemTime;

use bitflags::bitflags;
use cms::signed_data::SignerInfo;
use const_oid::{AssociatedOid, ObjectIdentifier, db::rfc5280};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use x509_cert::{
    Certificate, Version,
    der::{Encode, asn1::OctetString},
    ext::pkix::{
        AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages,
        SubjectAltName, SubjectKeyIdentifier,
    },
};

use crate::{
    crypto::{self, RsaPublicKeyExt, SignatureAlgorithm},
    pkcs7::{self, Error, ID_MESSAGE_DIGEST, Result, SignedDataBlob},
};

/// Extensions understood by the chain checks. Any other critical extension
/// makes a certificate unusable.
const HANDLED_EXTENSIONS: [ObjectIdentifier; 6] = [
    BasicConstraints::OID,
    KeyUsage::OID,
    ExtendedKeyUsage::OID,
    SubjectKeyIdentifier::OID,
    AuthorityKeyIdentifier::OID,
    SubjectAltName::OID,
];

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VerifyFlags: u8 {
        /// A chain may end at a trusted certificate that is not self-issued.
        const PARTIAL_CHAIN = 1 << 0;
        /// Skip validity period checks.
        const NO_CHECK_TIME = 1 << 1;
    }
}

/// Key purpose required of the signer certificate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Purpose {
    #[default]
    Any,
    SmimeSign,
    CodeSigning,
}

impl Purpose {
    fn key_purpose(self) -> Option<ObjectIdentifier> {
        match self {
            Self::Any => None,
            Self::SmimeSign => Some(rfc5280::ID_KP_EMAIL_PROTECTION),
            Self::CodeSigning => Some(rfc5280::ID_KP_CODE_SIGNING),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerifyPolicy {
    pub flags: VerifyFlags,
    pub purpose: Purpose,
    /// Maximum number of certificates in a chain, including the signer.
    pub max_depth: usize,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        Self {
            flags: VerifyFlags::PARTIAL_CHAIN | VerifyFlags::NO_CHECK_TIME,
            purpose: Purpose::Any,
            max_depth: 100,
        }
    }
}

/// Certificates trusted for the duration of one verification.
#[derive(Clone, Debug, Default)]
pub struct TrustStore {
    certs: Vec<Certificate>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store containing a single DER-encoded certificate.
    pub fn from_der(data: &[u8]) -> Result<Self> {
        let cert = pkcs7::decode_certificate(data)?;

        Ok(Self { certs: vec![cert] })
    }

    pub fn add(&mut self, cert: Certificate) {
        self.certs.push(cert);
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    fn contains(&self, cert: &Certificate) -> bool {
        self.certs.iter().any(|c| c == cert)
    }

    fn issuers_of<'a>(&'a self, cert: &'a Certificate) -> impl Iterator<Item = &'a Certificate> {
        self.certs
            .iter()
            .filter(|c| c.tbs_certificate.subject == cert.tbs_certificate.issuer)
    }
}

fn is_self_issued(cert: &Certificate) -> bool {
    cert.tbs_certificate.subject == cert.tbs_certificate.issuer
}

/// Check that `issuer` signed `cert`.
fn verify_cert_signature(cert: &Certificate, issuer: &Certificate) -> Result<()> {
    let oid = cert.signature_algorithm.oid;
    let algo = SignatureAlgorithm::from_oid(&oid)
        .and_then(SignatureAlgorithm::digest)
        .ok_or(Error::UnsupportedSignatureAlgorithm(oid))?;

    let tbs = cert
        .tbs_certificate
        .to_der()
        .map_err(|e| Error::Encode("TBSCertificate", e))?;
    let signature = cert
        .signature
        .as_bytes()
        .ok_or(Error::UnsupportedSignatureAlgorithm(oid))?;

    let public_key = crypto::get_public_key(issuer)
        .map_err(|e| Error::PublicKey(pkcs7::describe(issuer), e))?;

    public_key
        .verify_sig(algo, &algo.hash(&tbs), signature)
        .map_err(|e| Error::CertSignatureInvalid(pkcs7::describe(cert), e))
}

/// Check that `issuer` may sign certificates. `below` is the number of
/// non-self-issued intermediates between `issuer` and the leaf.
fn check_issuer(issuer: &Certificate, below: usize) -> Result<()> {
    if let Some((_, ku)) = pkcs7::find_extension::<KeyUsage>(issuer)?
        && !ku.0.contains(KeyUsages::KeyCertSign)
    {
        return Err(Error::NotCa(pkcs7::describe(issuer)));
    }

    match pkcs7::find_extension::<BasicConstraints>(issuer)? {
        Some((_, bc)) if !bc.ca => Err(Error::NotCa(pkcs7::describe(issuer))),
        Some((_, bc)) => match bc.path_len_constraint {
            Some(max) if below > usize::from(max) => {
                Err(Error::PathLenExceeded(pkcs7::describe(issuer), max))
            }
            _ => Ok(()),
        },
        // Only self-issued v1 roots predate basic constraints.
        None if issuer.tbs_certificate.version == Version::V1 && is_self_issued(issuer) => Ok(()),
        None => Err(Error::NotCa(pkcs7::describe(issuer))),
    }
}

fn check_critical_extensions(cert: &Certificate) -> Result<()> {
    if let Some(ext) = cert
        .tbs_certificate
        .extensions
        .iter()
        .flatten()
        .find(|e| e.critical && !HANDLED_EXTENSIONS.contains(&e.extn_id))
    {
        return Err(Error::UnhandledCriticalExtension {
            oid: ext.extn_id,
            cert: pkcs7::describe(cert),
        });
    }

    Ok(())
}

fn check_time(cert: &Certificate, now: SystemTime) -> Result<()> {
    let validity = &cert.tbs_certificate.validity;

    if now < validity.not_before.to_system_time() {
        return Err(Error::CertNotYetValid(pkcs7::describe(cert)));
    } else if now > validity.not_after.to_system_time() {
        return Err(Error::CertExpired(pkcs7::describe(cert)));
    }

    Ok(())
}

fn check_purpose(cert: &Certificate, purpose: Purpose) -> Result<()> {
    let Some(required) = purpose.key_purpose() else {
        return Ok(());
    };

    // No EKU means any purpose.
    if let Some((_, eku)) = pkcs7::find_extension::<ExtendedKeyUsage>(cert)?
        && !eku
            .0
            .iter()
            .any(|p| *p == required || *p == rfc5280::ANY_EXTENDED_KEY_USAGE)
    {
        return Err(Error::PurposeMismatch(pkcs7::describe(cert), purpose));
    }

    Ok(())
}

/// Find the first issuer of `cert` whose key verifies its signature. Trusted
/// certificates are preferred over untrusted ones.
fn find_issuer<'a>(
    cert: &'a Certificate,
    chain: &[&'a Certificate],
    untrusted: &[&'a Certificate],
    store: &'a TrustStore,
) -> Result<&'a Certificate> {
    let candidates = store
        .issuers_of(cert)
        .chain(
            untrusted
                .iter()
                .copied()
                .filter(|c| c.tbs_certificate.subject == cert.tbs_certificate.issuer),
        )
        .filter(|c| !chain.iter().any(|x| x == c));

    let mut last_err = None;

    for candidate in candidates {
        match verify_cert_signature(cert, candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) => {
                trace!("Rejected issuer candidate {}: {e}", pkcs7::describe(candidate));
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::IssuerNotFound(pkcs7::describe(cert))))
}

/// Build and validate a chain from `leaf` to a certificate in `store`.
pub fn verify_chain(
    leaf: &Certificate,
    untrusted: &[&Certificate],
    store: &TrustStore,
    policy: &VerifyPolicy,
) -> Result<()> {
    let now = SystemTime::now();
    let mut chain = vec![leaf];
    let mut cert = leaf;

    check_purpose(leaf, policy.purpose)?;

    loop {
        check_critical_extensions(cert)?;

        if !policy.flags.contains(VerifyFlags::NO_CHECK_TIME) {
            check_time(cert, now)?;
        }

        if store.contains(cert)
            && (policy.flags.contains(VerifyFlags::PARTIAL_CHAIN) || is_self_issued(cert))
        {
            trace!("Chain anchored at trusted {}", pkcs7::describe(cert));
            return Ok(());
        } else if is_self_issued(cert) {
            return Err(Error::UntrustedRoot(pkcs7::describe(cert)));
        } else if chain.len() >= policy.max_depth {
            return Err(Error::ChainTooDeep(policy.max_depth));
        }

        let issuer = find_issuer(cert, &chain, untrusted, store)?;
        let below = chain[1..].iter().filter(|c| !is_self_issued(c)).count();
        check_issuer(issuer, below)?;

        trace!("{} issued by {}", pkcs7::describe(cert), pkcs7::describe(issuer));

        chain.push(issuer);
        cert = issuer;
    }
}

/// Check a single SignerInfo's signature over `content`.
fn verify_signer_info(
    index: usize,
    info: &SignerInfo,
    cert: &Certificate,
    content: &[u8],
) -> Result<()> {
    let digest_algo = crypto::digest_registry()
        .lookup(&info.digest_alg.oid)
        .ok_or(Error::UnsupportedDigestAlgorithm(info.digest_alg.oid))?;

    // The digest always comes from the SignerInfo digest algorithm. The
    // signature algorithm only has to be RSA PKCS#1 v1.5.
    SignatureAlgorithm::from_oid(&info.signature_algorithm.oid)
        .ok_or(Error::UnsupportedSignatureAlgorithm(info.signature_algorithm.oid))?;

    let content_digest = digest_algo.hash(content);

    let signed_digest = match &info.signed_attrs {
        None => content_digest,
        Some(attrs) => {
            let message_digest = attrs
                .iter()
                .find(|a| a.oid == ID_MESSAGE_DIGEST)
                .and_then(|a| a.values.iter().next())
                .ok_or(Error::MissingMessageDigest(index))?
                .decode_as::<OctetString>()
                .map_err(Error::DecodeSignedData)?;

            if message_digest.as_bytes() != content_digest.as_slice() {
                return Err(Error::MessageDigestMismatch(index));
            }

            // The signature covers the attributes with a SET OF tag.
            let der = attrs
                .to_der()
                .map_err(|e| Error::Encode("signed attributes", e))?;

            digest_algo.hash(&der)
        }
    };

    let public_key =
        crypto::get_public_key(cert).map_err(|e| Error::PublicKey(pkcs7::describe(cert), e))?;

    public_key
        .verify_sig(digest_algo, &signed_digest, info.signature.as_bytes())
        .map_err(|e| Error::SignatureInvalid(index, e))?;

    trace!(
        "SignerInfo #{index} signed by {} with {digest_algo:?}",
        pkcs7::describe(cert),
    );

    Ok(())
}

/// Verify every signer's chain and then every signer's signature over
/// `content`.
pub fn verify_signed_data(
    blob: &SignedDataBlob,
    store: &TrustStore,
    content: &[u8],
    policy: &VerifyPolicy,
) -> Result<()> {
    let signers = blob.signers()?;
    let untrusted = blob.certificates().collect::<Vec<_>>();

    for signer in &signers {
        verify_chain(signer, &untrusted, store, policy)?;
    }

    for (index, (info, cert)) in blob.signer_infos().zip(&signers).enumerate() {
        verify_signer_info(index, info, cert, content)?;
    }

    debug!("Verified {} signers", signers.len());

    Ok(())
}

/// Verify a PKCS#7 blob against one trusted DER certificate with a custom
/// policy.
pub fn verify_with(
    signed: &[u8],
    trusted: &[u8],
    content: &[u8],
    policy: &VerifyPolicy,
) -> Result<()> {
    pkcs7::check_input(signed)?;
    pkcs7::check_input(trusted)?;
    pkcs7::check_size(content)?;

    trace!(
        "{} digest algorithms available",
        crypto::digest_registry().len(),
    );

    let blob = SignedDataBlob::decode(signed)?;
    let store = TrustStore::from_der(trusted)?;

    verify_signed_data(&blob, &store, content, policy)
}

/// Verify a PKCS#7 blob against one trusted DER certificate with the default
/// firmware policy. Any failure results in `false`.
pub fn verify(signed: &[u8], trusted: &[u8], content: &[u8]) -> bool {
    match verify_with(signed, trusted, content, &VerifyPolicy::default()) {
        Ok(()) => true,
        Err(e) => {
            debug!("PKCS#7 verification failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_permissive() {
        let policy = VerifyPolicy::default();

        assert!(policy.flags.contains(VerifyFlags::PARTIAL_CHAIN));
        assert!(policy.flags.contains(VerifyFlags::NO_CHECK_TIME));
        assert_eq!(policy.purpose, Purpose::Any);
        assert_eq!(policy.max_depth, 100);
    }

    #[test]
    fn purpose_oids() {
        assert_eq!(Purpose::Any.key_purpose(), None);
        assert_eq!(
            Purpose::CodeSigning.key_purpose(),
            Some(ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.3")),
        );
        assert_eq!(
            Purpose::SmimeSign.key_purpose(),
            Some(ObjectIdentifier::new_unwrap("1.3.6.1.5.5.7.3.4")),
        );
    }

    #[test]
    fn handled_extension_oids() {
        let oids = HANDLED_EXTENSIONS.map(|o| o.to_string());

        assert_eq!(
            oids,
            ["2.5.29.19", "2.5.29.15", "2.5.29.37", "2.5.29.14", "2.5.29.35", "2.5.29.17"],
        );
    }

    #[test]
    fn verify_rejects_empty_buffers() {
        assert!(!verify(&[], &[1], &[]));
        assert!(!verify(&[1], &[], &[]));
    }
}

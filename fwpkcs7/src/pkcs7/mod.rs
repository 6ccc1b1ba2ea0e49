// SPDX-FileCopyrightText: 2025 fwpkcs7 contributors
// SPDX-License-Identifier: GPL-3.0-only

//! PKCS#7 `SignedData` handling for firmware authentication.
//!
//! Every entry point accepts attacker-controlled bytes. They are bounds
//! checked, normalized into a `ContentInfo` envelope and then decoded with the
//! RustCrypto `cms` types. Nothing is ever returned on failure.

use std::collections::TryReserveError;

use cms::{
    content_info::ContentInfo,
    cert::CertificateChoices,
    signed_data::{SignedData, SignerIdentifier, SignerInfo},
};
use const_oid::{AssociatedOid, ObjectIdentifier, db::rfc5911};
use thiserror::Error;
use tracing::trace;
use x509_cert::{
    Certificate,
    der::{self, Decode, Reader, SliceReader},
    ext::pkix::SubjectKeyIdentifier,
};

use crate::{
    crypto,
    format::{certlist, envelope},
};

pub mod sign;
pub mod signature;
pub mod signers;
pub mod verify;

/// Largest accepted input. Firmware callers historically passed lengths as a
/// signed 32-bit integer.
pub const MAX_INPUT_SIZE: usize = i32::MAX as usize;

/// PKCS#9 `contentType` attribute.
pub const ID_CONTENT_TYPE: ObjectIdentifier = rfc5911::ID_CONTENT_TYPE;
/// PKCS#9 `messageDigest` attribute.
pub const ID_MESSAGE_DIGEST: ObjectIdentifier = rfc5911::ID_MESSAGE_DIGEST;

/// Coarse classification of [`Error`]. Callers that only need an accept/reject
/// decision can ignore this entirely.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Empty or oversized buffers, or an undersized output buffer.
    InvalidInput,
    /// The envelope could not be classified or the DER could not be decoded.
    MalformedEnvelope,
    /// Well-formed, but not something this crate handles.
    UnsupportedStructure,
    /// An allocation failed.
    ResourceExhausted,
    /// The structure was fine, but the signature or chain did not validate.
    VerificationFailed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Input is empty")]
    EmptyInput,
    #[error("Input size {0} exceeds limit of {MAX_INPUT_SIZE} bytes")]
    InputTooLarge(usize),
    #[error("Destination buffer is too small: {actual} < {required} bytes")]
    BufferTooSmall { required: usize, actual: usize },
    #[error("Failed to normalize ContentInfo envelope")]
    Envelope(#[from] envelope::Error),
    #[error("Failed to decode ContentInfo")]
    DecodeContentInfo(#[source] der::Error),
    #[error("Failed to decode SignedData")]
    DecodeSignedData(#[source] der::Error),
    #[error("Failed to decode trusted certificate")]
    DecodeTrustedCert(#[source] der::Error),
    #[error("Failed to decode {oid} extension of {cert}")]
    DecodeExtension {
        oid: ObjectIdentifier,
        cert: String,
        #[source]
        source: der::Error,
    },
    #[error("ContentInfo type is not signedData: {0}")]
    NotSignedData(ObjectIdentifier),
    #[error("SignedData contains no SignerInfo")]
    NoSigners,
    #[error("Expected exactly one SignerInfo, but found {0}")]
    NotOneSigner(usize),
    #[error("Certificate for SignerInfo #{0} is not embedded in SignedData")]
    SignerCertNotFound(usize),
    #[error("Failed to serialize certificate list")]
    CertList(#[from] certlist::Error),
    #[error("Failed to allocate {0} bytes")]
    Alloc(usize, #[source] TryReserveError),
    #[error("Unsupported digest algorithm: {0}")]
    UnsupportedDigestAlgorithm(ObjectIdentifier),
    #[error("Unsupported signature algorithm: {0}")]
    UnsupportedSignatureAlgorithm(ObjectIdentifier),
    #[error("Signed attributes of SignerInfo #{0} have no messageDigest")]
    MissingMessageDigest(usize),
    #[error("messageDigest of SignerInfo #{0} does not match content")]
    MessageDigestMismatch(usize),
    #[error("Failed to load public key of {0}")]
    PublicKey(String, #[source] crypto::Error),
    #[error("Signature of SignerInfo #{0} is invalid")]
    SignatureInvalid(usize, #[source] crypto::Error),
    #[error("Signature of certificate {0} is invalid")]
    CertSignatureInvalid(String, #[source] crypto::Error),
    #[error("Issuer of certificate {0} not found")]
    IssuerNotFound(String),
    #[error("Chain ends at untrusted certificate {0}")]
    UntrustedRoot(String),
    #[error("Issuer {0} is not a CA")]
    NotCa(String),
    #[error("Issuer {0} allows at most {1} intermediates below it")]
    PathLenExceeded(String, u8),
    #[error("Unhandled critical extension {oid} in {cert}")]
    UnhandledCriticalExtension { oid: ObjectIdentifier, cert: String },
    #[error("Certificate {0} has expired")]
    CertExpired(String),
    #[error("Certificate {0} is not yet valid")]
    CertNotYetValid(String),
    #[error("Certificate {0} is not valid for purpose {1:?}")]
    PurposeMismatch(String, verify::Purpose),
    #[error("Chain exceeds maximum depth of {0}")]
    ChainTooDeep(usize),
    #[error("Failed to DER encode {0}")]
    Encode(&'static str, #[source] der::Error),
    #[error("Failed to sign with {0}")]
    Sign(String, #[source] crypto::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyInput | Self::InputTooLarge(_) | Self::BufferTooSmall { .. } => {
                ErrorKind::InvalidInput
            }
            Self::Envelope(envelope::Error::Alloc(..))
            | Self::CertList(certlist::Error::Alloc(..))
            | Self::Alloc(..) => ErrorKind::ResourceExhausted,
            Self::Envelope(_)
            | Self::CertList(_)
            | Self::DecodeContentInfo(_)
            | Self::DecodeSignedData(_)
            | Self::DecodeTrustedCert(_)
            | Self::DecodeExtension { .. }
            | Self::Encode(..) => ErrorKind::MalformedEnvelope,
            Self::NotSignedData(_)
            | Self::NoSigners
            | Self::NotOneSigner(_)
            | Self::SignerCertNotFound(_)
            | Self::UnsupportedDigestAlgorithm(_)
            | Self::UnsupportedSignatureAlgorithm(_) => ErrorKind::UnsupportedStructure,
            Self::MissingMessageDigest(_)
            | Self::MessageDigestMismatch(_)
            | Self::PublicKey(..)
            | Self::SignatureInvalid(..)
            | Self::CertSignatureInvalid(..)
            | Self::IssuerNotFound(_)
            | Self::UntrustedRoot(_)
            | Self::NotCa(_)
            | Self::PathLenExceeded(..)
            | Self::UnhandledCriticalExtension { .. }
            | Self::CertExpired(_)
            | Self::CertNotYetValid(_)
            | Self::PurposeMismatch(..)
            | Self::ChainTooDeep(_) => ErrorKind::VerificationFailed,
            Self::Sign(..) => ErrorKind::InvalidInput,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Reject empty buffers and buffers above [`MAX_INPUT_SIZE`].
pub fn check_input(data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Err(Error::EmptyInput);
    }

    check_size(data)
}

/// Like [`check_input`], but empty buffers are fine.
pub fn check_size(data: &[u8]) -> Result<()> {
    if data.len() > MAX_INPUT_SIZE {
        return Err(Error::InputTooLarge(data.len()));
    }

    Ok(())
}

/// Copy `data` into a new buffer without aborting on allocation failure.
pub(crate) fn try_to_vec(data: &[u8]) -> Result<Vec<u8>> {
    let mut result = Vec::new();
    result
        .try_reserve_exact(data.len())
        .map_err(|e| Error::Alloc(data.len(), e))?;
    result.extend_from_slice(data);

    Ok(result)
}

/// Human readable identification for log and error messages.
pub(crate) fn describe(cert: &Certificate) -> String {
    cert.tbs_certificate.subject.to_string()
}

/// Find and decode the extension of type `T`. Returns the criticality flag
/// alongside the value.
pub(crate) fn find_extension<'a, T>(cert: &'a Certificate) -> Result<Option<(bool, T)>>
where
    T: Decode<'a> + AssociatedOid,
{
    let Some(ext) = cert
        .tbs_certificate
        .extensions
        .iter()
        .flatten()
        .find(|e| e.extn_id == T::OID)
    else {
        return Ok(None);
    };

    let value = T::from_der(ext.extn_value.as_bytes()).map_err(|e| Error::DecodeExtension {
        oid: T::OID,
        cert: describe(cert),
        source: e,
    })?;

    Ok(Some((ext.critical, value)))
}

/// Decode one DER certificate. Trailing data is ignored.
pub fn decode_certificate(data: &[u8]) -> Result<Certificate> {
    check_input(data)?;

    let mut reader = SliceReader::new(data).map_err(Error::DecodeTrustedCert)?;
    let cert = Certificate::decode(&mut reader).map_err(Error::DecodeTrustedCert)?;

    Ok(cert)
}

fn signer_matches(cert: &Certificate, sid: &SignerIdentifier) -> bool {
    match sid {
        SignerIdentifier::IssuerAndSerialNumber(isn) => {
            cert.tbs_certificate.issuer == isn.issuer
                && cert.tbs_certificate.serial_number == isn.serial_number
        }
        SignerIdentifier::SubjectKeyIdentifier(ski) => {
            // Certificates with a broken SKI extension simply don't match.
            matches!(
                find_extension::<SubjectKeyIdentifier>(cert),
                Ok(Some((_, s))) if s.0 == ski.0,
            )
        }
    }
}

/// A decoded PKCS#7 `SignedData`, accepted either bare or wrapped in a
/// `ContentInfo`.
#[derive(Clone, Debug)]
pub struct SignedDataBlob {
    signed_data: SignedData,
}

impl SignedDataBlob {
    pub fn decode(data: &[u8]) -> Result<Self> {
        check_input(data)?;

        let envelope = envelope::normalize(data)?;

        // Like d2i, only the first ContentInfo is consumed. Padding after it is
        // common in firmware payloads.
        let mut reader =
            SliceReader::new(envelope.as_bytes()).map_err(Error::DecodeContentInfo)?;
        let ci = ContentInfo::decode(&mut reader).map_err(Error::DecodeContentInfo)?;

        let trailing = reader.remaining_len();
        if trailing != der::Length::ZERO {
            trace!("Ignoring {trailing} bytes after ContentInfo");
        }

        if ci.content_type != rfc5911::ID_SIGNED_DATA {
            return Err(Error::NotSignedData(ci.content_type));
        }

        let signed_data = ci
            .content
            .decode_as::<SignedData>()
            .map_err(Error::DecodeSignedData)?;

        trace!(
            "Decoded SignedData with {} SignerInfos and {} certificates",
            signed_data.signer_infos.0.len(),
            signed_data.certificates.as_ref().map_or(0, |c| c.0.len()),
        );

        Ok(Self { signed_data })
    }

    pub fn signed_data(&self) -> &SignedData {
        &self.signed_data
    }

    /// Standard X.509 certificates embedded in the structure, in decoded
    /// order. Other certificate formats are skipped.
    pub fn certificates(&self) -> impl Iterator<Item = &Certificate> {
        self.signed_data.certificates.iter().flat_map(|certs| {
            certs.0.iter().filter_map(|cc| {
                if let CertificateChoices::Certificate(c) = cc {
                    Some(c)
                } else {
                    None
                }
            })
        })
    }

    pub fn signer_infos(&self) -> impl Iterator<Item = &SignerInfo> {
        self.signed_data.signer_infos.0.iter()
    }

    pub fn signer_info_count(&self) -> usize {
        self.signed_data.signer_infos.0.len()
    }

    /// The only SignerInfo. Anything other than exactly one is rejected.
    pub fn single_signer_info(&self) -> Result<&SignerInfo> {
        let count = self.signer_info_count();
        if count != 1 {
            return Err(Error::NotOneSigner(count));
        }

        self.signer_infos().next().ok_or(Error::NotOneSigner(0))
    }

    /// Find the embedded certificate identified by a SignerInfo.
    pub fn signer_cert(&self, index: usize, info: &SignerInfo) -> Result<&Certificate> {
        self.certificates()
            .find(|c| signer_matches(c, &info.sid))
            .ok_or(Error::SignerCertNotFound(index))
    }

    /// Certificates of every signer, in SignerInfo order. Fails if there are
    /// no signers or if any signer's certificate is missing.
    pub fn signers(&self) -> Result<Vec<&Certificate>> {
        if self.signer_info_count() == 0 {
            return Err(Error::NoSigners);
        }

        self.signer_infos()
            .enumerate()
            .map(|(i, info)| self.signer_cert(i, info))
            .collect()
    }

    /// Content bytes embedded in the structure, if it is not detached.
    pub fn embedded_content(&self) -> Option<&[u8]> {
        self.signed_data
            .encap_content_info
            .econtent
            .as_ref()
            .map(|any| any.value())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn input_guard() {
        assert_matches!(check_input(&[]), Err(Error::EmptyInput));
        assert_matches!(check_size(&[]), Ok(()));
        assert_matches!(check_input(&[0]), Ok(()));
    }

    #[test]
    fn short_input_is_malformed() {
        let err = SignedDataBlob::decode(&[0x30; 16]).unwrap_err();
        assert_matches!(err, Error::Envelope(envelope::Error::TooShort(16)));
        assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
    }

    #[test]
    fn garbage_is_malformed() {
        let err = SignedDataBlob::decode(&[0xa5; 512]).unwrap_err();
        assert_matches!(err, Error::DecodeContentInfo(_));
        assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
    }

    #[test]
    fn error_kinds() {
        assert_eq!(Error::EmptyInput.kind(), ErrorKind::InvalidInput);
        assert_eq!(Error::NotOneSigner(2).kind(), ErrorKind::UnsupportedStructure);
        assert_eq!(
            Error::IssuerNotFound("CN=x".into()).kind(),
            ErrorKind::VerificationFailed,
        );
        assert_eq!(
            Error::Envelope(envelope::Error::TooLarge(1 << 20)).kind(),
            ErrorKind::MalformedEnvelope,
        );
    }

    #[test]
    fn allocation_failures_are_resource_exhaustion() {
        let reserve_err = || Vec::<u8>::new().try_reserve(usize::MAX).unwrap_err();

        for err in [
            Error::Alloc(usize::MAX, reserve_err()),
            Error::Envelope(envelope::Error::Alloc(usize::MAX, reserve_err())),
            Error::CertList(certlist::Error::Alloc(usize::MAX, reserve_err())),
        ] {
            assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        }

        let data = [0u8; 8];
        assert_matches!(
            try_to_vec(&data),
            Ok(v) if v == data
        );
    }
}

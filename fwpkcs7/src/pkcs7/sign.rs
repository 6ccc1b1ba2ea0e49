// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-FileCopyrightText: 2025 fwpkcs7 contributors
// SPDX-License-Identifier: GPL-3.0-only

use cms::{
    cert::{CertificateChoices, IssuerAndSerialNumber},
    content_info::{CmsVersion, ContentInfo},
    signed_data::{
        CertificateSet, DigestAlgorithmIdentifiers, EncapsulatedContentInfo, SignatureValue,
        SignedAttributes, SignedData, SignerIdentifier, SignerInfo, SignerInfos,
    },
};
use const_oid::db::rfc5911;
use rsa::RsaPrivateKey;
use tracing::debug;
use x509_cert::{
    Certificate,
    attr::Attribute,
    der::{
        Any, Encode,
        asn1::{OctetString, SetOfVec},
    },
    spki::AlgorithmIdentifierOwned,
};

use crate::{
    crypto::{self, DigestAlgorithm},
    pkcs7::{self, Error, ID_CONTENT_TYPE, ID_MESSAGE_DIGEST, Result},
};

fn encode_err(what: &'static str) -> impl Fn(x509_cert::der::Error) -> Error {
    move |e| Error::Encode(what, e)
}

#[derive(Clone)]
struct SignerSpec<'a> {
    key: &'a RsaPrivateKey,
    cert: &'a Certificate,
    digest: DigestAlgorithm,
    signed_attrs: bool,
}

/// Builder for RSA PKCS#1 v1.5 signed PKCS#7 `SignedData` structures.
#[derive(Clone)]
pub struct SignedDataBuilder<'a> {
    content: &'a [u8],
    detached: bool,
    signers: Vec<SignerSpec<'a>>,
    extra_certs: Vec<&'a Certificate>,
}

impl<'a> SignedDataBuilder<'a> {
    pub fn new(content: &'a [u8]) -> Self {
        Self {
            content,
            detached: false,
            signers: vec![],
            extra_certs: vec![],
        }
    }

    /// Leave the content out of the structure.
    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    /// Add a signer. `cert` is embedded automatically. With `signed_attrs`,
    /// the signature covers `contentType` and `messageDigest` attributes
    /// instead of the raw content.
    pub fn signer(
        mut self,
        key: &'a RsaPrivateKey,
        cert: &'a Certificate,
        digest: DigestAlgorithm,
        signed_attrs: bool,
    ) -> Self {
        self.signers.push(SignerSpec {
            key,
            cert,
            digest,
            signed_attrs,
        });
        self
    }

    /// Embed an additional certificate, like an intermediate CA.
    pub fn extra_cert(mut self, cert: &'a Certificate) -> Self {
        self.extra_certs.push(cert);
        self
    }

    fn signed_attributes(digest: &[u8]) -> Result<SignedAttributes> {
        let content_type = Attribute {
            oid: ID_CONTENT_TYPE,
            values: SetOfVec::try_from(vec![
                Any::encode_from(&rfc5911::ID_DATA).map_err(encode_err("contentType"))?,
            ])
            .map_err(encode_err("contentType"))?,
        };

        let message_digest = Attribute {
            oid: ID_MESSAGE_DIGEST,
            values: SetOfVec::try_from(vec![
                Any::encode_from(
                    &OctetString::new(digest).map_err(encode_err("messageDigest"))?,
                )
                .map_err(encode_err("messageDigest"))?,
            ])
            .map_err(encode_err("messageDigest"))?,
        };

        SignedAttributes::try_from(vec![content_type, message_digest])
            .map_err(encode_err("signed attributes"))
    }

    fn signer_info(&self, spec: &SignerSpec<'_>) -> Result<SignerInfo> {
        let content_digest = spec.digest.hash(self.content);

        let (signed_attrs, signed_digest) = if spec.signed_attrs {
            let attrs = Self::signed_attributes(&content_digest)?;
            let der = attrs.to_der().map_err(encode_err("signed attributes"))?;
            let digest = spec.digest.hash(&der);

            (Some(attrs), digest)
        } else {
            (None, content_digest)
        };

        let signature = crypto::rsa_sign(spec.key, spec.digest, &signed_digest)
            .map_err(|e| Error::Sign(pkcs7::describe(spec.cert), e))?;

        Ok(SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: spec.cert.tbs_certificate.issuer.clone(),
                serial_number: spec.cert.tbs_certificate.serial_number.clone(),
            }),
            digest_alg: AlgorithmIdentifierOwned {
                oid: spec.digest.oid(),
                parameters: None,
            },
            signed_attrs,
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: spec.digest.rsa_signature_oid(),
                parameters: None,
            },
            signature: SignatureValue::new(signature).map_err(encode_err("signature"))?,
            unsigned_attrs: None,
        })
    }

    /// Build the bare `SignedData`.
    pub fn build_signed_data(&self) -> Result<SignedData> {
        let mut digest_algorithms = vec![];
        for spec in &self.signers {
            let algorithm = AlgorithmIdentifierOwned {
                oid: spec.digest.oid(),
                parameters: None,
            };

            if !digest_algorithms.contains(&algorithm) {
                digest_algorithms.push(algorithm);
            }
        }

        let mut unique_certs = Vec::<&Certificate>::new();
        for cert in self
            .signers
            .iter()
            .map(|s| s.cert)
            .chain(self.extra_certs.iter().copied())
        {
            if !unique_certs.contains(&cert) {
                unique_certs.push(cert);
            }
        }

        let certs = unique_certs
            .into_iter()
            .map(|c| CertificateChoices::Certificate(c.clone()))
            .collect::<Vec<_>>();

        let econtent = if self.detached {
            None
        } else {
            let octets = OctetString::new(self.content).map_err(encode_err("content"))?;
            Some(Any::encode_from(&octets).map_err(encode_err("content"))?)
        };

        let signer_infos = self
            .signers
            .iter()
            .map(|spec| self.signer_info(spec))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "Signed {} bytes with {} signers and {} certificates",
            self.content.len(),
            signer_infos.len(),
            certs.len(),
        );

        Ok(SignedData {
            version: CmsVersion::V1,
            digest_algorithms: DigestAlgorithmIdentifiers::try_from(digest_algorithms)
                .map_err(encode_err("digest algorithms"))?,
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: rfc5911::ID_DATA,
                econtent,
            },
            certificates: if certs.is_empty() {
                None
            } else {
                Some(CertificateSet::try_from(certs).map_err(encode_err("certificates"))?)
            },
            crls: None,
            signer_infos: SignerInfos::try_from(signer_infos)
                .map_err(encode_err("signer infos"))?,
        })
    }

    /// Build the `SignedData` wrapped in a `ContentInfo`.
    pub fn build(&self) -> Result<ContentInfo> {
        let signed_data = self.build_signed_data()?;

        Ok(ContentInfo {
            content_type: rfc5911::ID_SIGNED_DATA,
            content: Any::encode_from(&signed_data).map_err(encode_err("SignedData"))?,
        })
    }

    /// DER encoding of [`Self::build`].
    pub fn build_der(&self) -> Result<Vec<u8>> {
        self.build()?
            .to_der()
            .map_err(encode_err("ContentInfo"))
    }

    /// DER encoding of [`Self::build_signed_data`], without the `ContentInfo`.
    pub fn build_bare_der(&self) -> Result<Vec<u8>> {
        self.build_signed_data()?
            .to_der()
            .map_err(encode_err("SignedData"))
    }
}

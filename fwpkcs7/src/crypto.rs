// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-FileCopyrightText: 2025 fwpkcs7 contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    env::{self, VarError},
    ffi::{OsStr, OsString},
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::OnceLock,
    time::{Duration, SystemTime},
};

use const_oid::{AssociatedOid, ObjectIdentifier, db::rfc5912};
use md5::Md5;
use pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::{CryptoRng, RngCore};
use rsa::{
    Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey, pkcs1v15::SigningKey, traits::PublicKeyParts,
};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use thiserror::Error;
use tracing::trace;
use x509_cert::{
    Certificate,
    builder::{Builder, CertificateBuilder, Profile},
    der::{
        Decode, DecodePem, EncodePem, SliceReader,
        asn1::UtcTime,
        referenced::OwnedToRef,
    },
    name::Name,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::{Time, Validity},
};

pub const ID_MD5: ObjectIdentifier = Md5::OID;
pub const ID_SHA1: ObjectIdentifier = Sha1::OID;
pub const ID_SHA256: ObjectIdentifier = Sha256::OID;
pub const ID_SHA384: ObjectIdentifier = Sha384::OID;
pub const ID_SHA512: ObjectIdentifier = Sha512::OID;

pub const RSA_ENCRYPTION: ObjectIdentifier = rfc5912::RSA_ENCRYPTION;
pub const MD5_WITH_RSA_ENCRYPTION: ObjectIdentifier = rfc5912::MD_5_WITH_RSA_ENCRYPTION;
pub const SHA1_WITH_RSA_ENCRYPTION: ObjectIdentifier = rfc5912::SHA_1_WITH_RSA_ENCRYPTION;
pub const SHA256_WITH_RSA_ENCRYPTION: ObjectIdentifier = rfc5912::SHA_256_WITH_RSA_ENCRYPTION;
pub const SHA384_WITH_RSA_ENCRYPTION: ObjectIdentifier = rfc5912::SHA_384_WITH_RSA_ENCRYPTION;
pub const SHA512_WITH_RSA_ENCRYPTION: ObjectIdentifier = rfc5912::SHA_512_WITH_RSA_ENCRYPTION;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Digest algorithm not supported for signing: {0:?}")]
    UnsupportedSigningDigest(DigestAlgorithm),
    #[error("RSA key size ({}) not supported", .0 * 8)]
    UnsupportedKeySize(usize),
    #[error("Invalid digest length ({0} bytes) for {1:?}")]
    InvalidDigestLength(usize, DigestAlgorithm),
    #[error("Failed to read environment variable: {0:?}")]
    InvalidEnvVar(OsString, #[source] VarError),
    #[error("PEM has start tag, but no end tag")]
    PemNoEndTag,
    #[error("Failed to load encrypted RSA private key")]
    LoadKeyEncrypted(#[source] pkcs8::Error),
    #[error("Failed to load unencrypted RSA private key")]
    LoadKeyUnencrypted(#[source] pkcs8::Error),
    #[error("Failed to save encrypted RSA private key")]
    SaveKeyEncrypted(#[source] pkcs8::Error),
    #[error("Failed to save unencrypted RSA private key")]
    SaveKeyUnencrypted(#[source] pkcs8::Error),
    #[error("Failed to load RSA public key")]
    LoadPubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to save RSA public key")]
    SavePubKey(#[source] pkcs8::spki::Error),
    #[error("Failed to load X509 certificate")]
    LoadCert(#[source] x509_cert::der::Error),
    #[error("Failed to save X509 certificate")]
    SaveCert(#[source] x509_cert::der::Error),
    #[error("Failed to generate RSA key")]
    RsaGenerate(#[source] Box<rsa::Error>),
    #[error("Failed to RSA sign digest")]
    RsaSign(#[source] Box<rsa::Error>),
    #[error("Failed to RSA verify signature")]
    RsaVerify(#[source] Box<rsa::Error>),
    #[error("Failed to generate X509 certificate")]
    CertGenerate(#[source] x509_cert::builder::Error),
    #[error("Invalid parameters for X509 certificate generation")]
    CertParams(#[source] x509_cert::der::Error),
    #[error("Failed to read file: {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
    #[error("Failed to write file: {0:?}")]
    WriteFile(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Message digests that may appear in a PKCS#7 `SignerInfo` or certificate
/// signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub const ALL: [Self; 5] = [
        Self::Md5,
        Self::Sha1,
        Self::Sha256,
        Self::Sha384,
        Self::Sha512,
    ];

    /// Canonical algorithm identifier.
    pub fn oid(self) -> ObjectIdentifier {
        match self {
            Self::Md5 => ID_MD5,
            Self::Sha1 => ID_SHA1,
            Self::Sha256 => ID_SHA256,
            Self::Sha384 => ID_SHA384,
            Self::Sha512 => ID_SHA512,
        }
    }

    /// Identifier of the matching `*WithRSAEncryption` signature algorithm.
    pub fn rsa_signature_oid(self) -> ObjectIdentifier {
        match self {
            Self::Md5 => MD5_WITH_RSA_ENCRYPTION,
            Self::Sha1 => SHA1_WITH_RSA_ENCRYPTION,
            Self::Sha256 => SHA256_WITH_RSA_ENCRYPTION,
            Self::Sha384 => SHA384_WITH_RSA_ENCRYPTION,
            Self::Sha512 => SHA512_WITH_RSA_ENCRYPTION,
        }
    }

    /// Length of the digest output.
    pub fn output_size(self) -> usize {
        match self {
            Self::Md5 => <Md5 as Digest>::output_size(),
            Self::Sha1 => <Sha1 as Digest>::output_size(),
            Self::Sha256 => <Sha256 as Digest>::output_size(),
            Self::Sha384 => <Sha384 as Digest>::output_size(),
            Self::Sha512 => <Sha512 as Digest>::output_size(),
        }
    }

    /// Compute the digest of the specified data.
    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Md5 => Md5::digest(data).to_vec(),
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    fn pkcs1v15_scheme(self) -> Pkcs1v15Sign {
        match self {
            Self::Md5 => Pkcs1v15Sign::new::<Md5>(),
            Self::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
            Self::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            Self::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
            Self::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
        }
    }
}

/// Lookup table from algorithm identifiers to digests.
#[derive(Debug)]
pub struct DigestRegistry {
    by_oid: BTreeMap<ObjectIdentifier, DigestAlgorithm>,
}

impl DigestRegistry {
    fn new() -> Self {
        let mut by_oid = BTreeMap::new();

        for algo in DigestAlgorithm::ALL {
            by_oid.insert(algo.oid(), algo);
        }

        // Some signers put the signature algorithm in the digest algorithm
        // field. Treat it as plain SHA-1.
        by_oid.insert(SHA1_WITH_RSA_ENCRYPTION, DigestAlgorithm::Sha1);

        Self { by_oid }
    }

    pub fn lookup(&self, oid: &ObjectIdentifier) -> Option<DigestAlgorithm> {
        self.by_oid.get(oid).copied()
    }

    pub fn len(&self) -> usize {
        self.by_oid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_oid.is_empty()
    }
}

/// Get the process-wide digest registry. The table is built on first use.
pub fn digest_registry() -> &'static DigestRegistry {
    static REGISTRY: OnceLock<DigestRegistry> = OnceLock::new();

    REGISTRY.get_or_init(|| {
        let registry = DigestRegistry::new();
        trace!("Registered {} digest algorithm identifiers", registry.len());
        registry
    })
}

/// RSA signature schemes accepted in `SignerInfo` and certificates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignatureAlgorithm {
    /// Bare `rsaEncryption`. The digest comes from elsewhere, like the
    /// `SignerInfo` digest algorithm.
    Rsa,
    /// `*WithRSAEncryption` with an implied digest.
    RsaWith(DigestAlgorithm),
}

impl SignatureAlgorithm {
    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        if *oid == RSA_ENCRYPTION {
            return Some(Self::Rsa);
        }

        DigestAlgorithm::ALL
            .into_iter()
            .find(|d| d.rsa_signature_oid() == *oid)
            .map(Self::RsaWith)
    }

    pub fn digest(self) -> Option<DigestAlgorithm> {
        match self {
            Self::Rsa => None,
            Self::RsaWith(d) => Some(d),
        }
    }
}

#[derive(Clone)]
pub enum PassphraseSource {
    None,
    EnvVar(OsString),
    File(PathBuf),
}

impl PassphraseSource {
    pub fn new(pass_file: Option<&Path>, env_var: Option<&OsStr>) -> Self {
        #[allow(clippy::option_if_let_else)]
        if let Some(v) = env_var {
            Self::EnvVar(v.to_owned())
        } else if let Some(p) = pass_file {
            Self::File(p.to_owned())
        } else {
            Self::None
        }
    }

    pub fn acquire(&self) -> Result<String> {
        let passphrase = match self {
            Self::None => String::new(),
            Self::EnvVar(v) => env::var(v).map_err(|e| Error::InvalidEnvVar(v.clone(), e))?,
            Self::File(p) => fs::read_to_string(p)
                .map_err(|e| Error::ReadFile(p.clone(), e))?
                .trim_end_matches(['\r', '\n'])
                .to_owned(),
        };

        Ok(passphrase)
    }
}

fn check_key_size(size: usize) -> Result<()> {
    // RustCrypto does not support 8192-bit keys.
    if size > 4096 / 8 {
        return Err(Error::UnsupportedKeySize(size));
    }

    Ok(())
}

/// Sign a digest with RSA PKCS#1 v1.5.
pub fn rsa_sign(key: &RsaPrivateKey, algo: DigestAlgorithm, digest: &[u8]) -> Result<Vec<u8>> {
    if digest.len() != algo.output_size() {
        return Err(Error::InvalidDigestLength(digest.len(), algo));
    }

    // We don't support signing with insecure algorithms.
    if matches!(algo, DigestAlgorithm::Md5 | DigestAlgorithm::Sha1) {
        return Err(Error::UnsupportedSigningDigest(algo));
    }

    check_key_size(key.size())?;

    key.sign(algo.pkcs1v15_scheme(), digest)
        .map_err(|e| Error::RsaSign(Box::new(e)))
}

pub trait RsaPublicKeyExt {
    fn verify_sig(&self, algo: DigestAlgorithm, digest: &[u8], signature: &[u8]) -> Result<()>;
}

impl RsaPublicKeyExt for RsaPublicKey {
    /// Verify the signature against the specified key.
    fn verify_sig(&self, algo: DigestAlgorithm, digest: &[u8], signature: &[u8]) -> Result<()> {
        // Check this explicitly so we can provide a better error message.
        if digest.len() != algo.output_size() {
            return Err(Error::InvalidDigestLength(digest.len(), algo));
        }

        check_key_size(self.size())?;

        self.verify(algo.pkcs1v15_scheme(), digest, signature)
            .map_err(|e| Error::RsaVerify(Box::new(e)))
    }
}

/// Generate an RSA key pair of the specified size.
pub fn generate_rsa_key_pair_with_rng(
    rng: &mut (impl CryptoRng + RngCore),
    bits: usize,
) -> Result<RsaPrivateKey> {
    check_key_size(bits / 8)?;

    RsaPrivateKey::new(rng, bits).map_err(|e| Error::RsaGenerate(Box::new(e)))
}

/// Generate a 4096-bit RSA key pair.
pub fn generate_rsa_key_pair() -> Result<RsaPrivateKey> {
    generate_rsa_key_pair_with_rng(&mut rand::thread_rng(), 4096)
}

/// Build a validity period covering `[not_before, not_after]`.
pub fn validity_between(not_before: SystemTime, not_after: SystemTime) -> Result<Validity> {
    let not_before = UtcTime::from_system_time(not_before).map_err(Error::CertParams)?;
    let not_after = UtcTime::from_system_time(not_after).map_err(Error::CertParams)?;

    Ok(Validity {
        not_before: Time::UtcTime(not_before),
        not_after: Time::UtcTime(not_after),
    })
}

/// Build a validity period starting now.
pub fn validity_from_now(duration: Duration) -> Result<Validity> {
    Validity::from_now(duration).map_err(Error::CertParams)
}

/// Issuer of a generated certificate. Self-signed if absent.
pub struct CertIssuer<'a> {
    pub cert: &'a Certificate,
    pub key: &'a RsaPrivateKey,
}

/// Generate a certificate for `key`. Without an issuer, the certificate is a
/// self-signed root. With an issuer, it is either a subordinate CA or a leaf,
/// depending on `ca`.
pub fn generate_cert(
    key: &RsaPrivateKey,
    issuer: Option<CertIssuer<'_>>,
    serial: u64,
    validity: Validity,
    subject: &str,
    ca: bool,
) -> Result<Certificate> {
    let public_key_der = key
        .to_public_key()
        .to_public_key_der()
        .map_err(Error::SavePubKey)?;
    let subject: Name = subject.parse().map_err(Error::CertParams)?;

    let (profile, signing_key) = match issuer {
        None => (Profile::Root, SigningKey::<Sha256>::new(key.clone())),
        Some(CertIssuer { cert, key: issuer_key }) => {
            let issuer = cert.tbs_certificate.subject.clone();
            let profile = if ca {
                Profile::SubCA {
                    issuer,
                    path_len_constraint: None,
                }
            } else {
                Profile::Leaf {
                    issuer,
                    enable_key_agreement: false,
                    enable_key_encipherment: false,
                }
            };

            (profile, SigningKey::<Sha256>::new(issuer_key.clone()))
        }
    };

    let builder = CertificateBuilder::new(
        profile,
        SerialNumber::from(serial),
        validity,
        subject,
        SubjectPublicKeyInfoOwned::from_der(public_key_der.as_bytes())
            .map_err(Error::CertParams)?,
        &signing_key,
    )
    .map_err(Error::CertGenerate)?;

    let mut rng = rand::thread_rng();
    let cert = builder
        .build_with_rng(&mut rng)
        .map_err(Error::CertGenerate)?;

    Ok(cert)
}

/// x509_cert/pem follow rfc7468 strictly instead of implementing a lenient
/// parser. The PEM decoder rejects lines in the base64 section that are longer
/// than 64 characters, excluding whitespace. Reformat the data so that such
/// certificates still load.
fn reformat_pem(data: &[u8]) -> Result<Vec<u8>> {
    let mut result = vec![];
    let mut base64 = vec![];
    let mut inside_base64 = false;

    for line in data.split(|&c| c == b'\n') {
        let line = line.trim_ascii_end();

        if line.is_empty() {
            continue;
        } else if line.starts_with(b"-----BEGIN CERTIFICATE-----") {
            inside_base64 = true;

            result.extend_from_slice(line);
            result.push(b'\n');
        } else if line.starts_with(b"-----END CERTIFICATE-----") {
            inside_base64 = false;

            for chunk in base64.chunks(64) {
                result.extend_from_slice(chunk);
                result.push(b'\n');
            }

            base64.clear();

            result.extend_from_slice(line);
            result.push(b'\n');
        } else if inside_base64 {
            base64.extend_from_slice(line);
        }
    }

    if inside_base64 {
        return Err(Error::PemNoEndTag);
    }

    Ok(result)
}

/// Parse a DER-encoded certificate. Like most DER decoders used in firmware,
/// bytes after the end of the certificate are ignored.
pub fn parse_der_cert(data: &[u8]) -> Result<Certificate> {
    let mut reader = SliceReader::new(data).map_err(Error::LoadCert)?;

    Certificate::decode(&mut reader).map_err(Error::LoadCert)
}

/// Parse a certificate in either PEM or DER form.
pub fn parse_cert(data: &[u8]) -> Result<Certificate> {
    if data.trim_ascii_start().starts_with(b"-----BEGIN") {
        let data = reformat_pem(data)?;
        Certificate::from_pem(data).map_err(Error::LoadCert)
    } else {
        parse_der_cert(data)
    }
}

/// Read a PEM- or DER-encoded certificate from a reader.
pub fn read_cert(path: &Path, mut reader: impl Read) -> Result<Certificate> {
    let mut data = vec![];
    reader
        .read_to_end(&mut data)
        .map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    parse_cert(&data)
}

/// Read a PEM- or DER-encoded certificate from a file.
pub fn read_cert_file(path: &Path) -> Result<Certificate> {
    let reader = File::open(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    read_cert(path, reader)
}

/// Write PEM-encoded certificate to a file.
pub fn write_pem_cert_file(path: &Path, cert: &Certificate) -> Result<()> {
    let data = cert.to_pem(LineEnding::LF).map_err(Error::SaveCert)?;

    fs::write(path, data).map_err(|e| Error::WriteFile(path.to_owned(), e))
}

/// Read PEM-encoded PKCS8 private key from a file.
pub fn read_pem_key_file(path: &Path, source: &PassphraseSource) -> Result<RsaPrivateKey> {
    let data = fs::read_to_string(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;

    if data.contains("ENCRYPTED") {
        let passphrase = source.acquire()?;

        RsaPrivateKey::from_pkcs8_encrypted_pem(&data, passphrase).map_err(Error::LoadKeyEncrypted)
    } else {
        RsaPrivateKey::from_pkcs8_pem(&data).map_err(Error::LoadKeyUnencrypted)
    }
}

/// Save PEM-encoded PKCS8 private key to a file. The key is encrypted if the
/// passphrase source yields a non-empty passphrase.
pub fn write_pem_key_file(
    path: &Path,
    key: &RsaPrivateKey,
    source: &PassphraseSource,
) -> Result<()> {
    let passphrase = source.acquire()?;

    let data = if passphrase.is_empty() {
        key.to_pkcs8_pem(LineEnding::LF)
            .map_err(Error::SaveKeyUnencrypted)?
    } else {
        key.to_pkcs8_encrypted_pem(rand::thread_rng(), passphrase, LineEnding::LF)
            .map_err(Error::SaveKeyEncrypted)?
    };

    let mut options = OpenOptions::new();
    options.write(true);
    options.create(true);
    options.truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut writer = options
        .open(path)
        .map_err(|e| Error::WriteFile(path.to_owned(), e))?;

    writer
        .write_all(data.as_bytes())
        .map_err(|e| Error::WriteFile(path.to_owned(), e))
}

/// Get the RSA public key from a certificate.
pub fn get_public_key(cert: &Certificate) -> Result<RsaPublicKey> {
    let public_key =
        RsaPublicKey::try_from(cert.tbs_certificate.subject_public_key_info.owned_to_ref())
            .map_err(Error::LoadPubKey)?;

    Ok(public_key)
}

/// Check if a certificate matches a private key.
pub fn cert_matches_key(cert: &Certificate, key: &RsaPrivateKey) -> Result<bool> {
    let public_key = get_public_key(cert)?;

    Ok(key.to_public_key() == public_key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_oids() {
        let oids = [
            (ID_MD5, "1.2.840.113549.2.5"),
            (ID_SHA1, "1.3.14.3.2.26"),
            (ID_SHA256, "2.16.840.1.101.3.4.2.1"),
            (ID_SHA384, "2.16.840.1.101.3.4.2.2"),
            (ID_SHA512, "2.16.840.1.101.3.4.2.3"),
            (RSA_ENCRYPTION, "1.2.840.113549.1.1.1"),
            (MD5_WITH_RSA_ENCRYPTION, "1.2.840.113549.1.1.4"),
            (SHA1_WITH_RSA_ENCRYPTION, "1.2.840.113549.1.1.5"),
            (SHA256_WITH_RSA_ENCRYPTION, "1.2.840.113549.1.1.11"),
            (SHA384_WITH_RSA_ENCRYPTION, "1.2.840.113549.1.1.12"),
            (SHA512_WITH_RSA_ENCRYPTION, "1.2.840.113549.1.1.13"),
        ];

        for (oid, expected) in oids {
            assert_eq!(oid.to_string(), expected);
        }
    }

    #[test]
    fn registry_contains_all_digests() {
        let registry = digest_registry();

        for algo in DigestAlgorithm::ALL {
            assert_eq!(registry.lookup(&algo.oid()), Some(algo));
        }
    }

    #[test]
    fn registry_aliases_sha1_with_rsa() {
        assert_eq!(
            digest_registry().lookup(&SHA1_WITH_RSA_ENCRYPTION),
            Some(DigestAlgorithm::Sha1),
        );
        assert_eq!(digest_registry().lookup(&SHA256_WITH_RSA_ENCRYPTION), None);
        assert_eq!(digest_registry().lookup(&RSA_ENCRYPTION), None);
    }

    #[test]
    fn signature_algorithm_oids() {
        assert_eq!(
            SignatureAlgorithm::from_oid(&RSA_ENCRYPTION),
            Some(SignatureAlgorithm::Rsa),
        );
        assert_eq!(
            SignatureAlgorithm::from_oid(&SHA384_WITH_RSA_ENCRYPTION),
            Some(SignatureAlgorithm::RsaWith(DigestAlgorithm::Sha384)),
        );
        assert_eq!(SignatureAlgorithm::from_oid(&ID_SHA256), None);
    }

    #[test]
    fn digest_sizes() {
        for algo in DigestAlgorithm::ALL {
            assert_eq!(algo.hash(b"data").len(), algo.output_size());
        }
    }

    #[test]
    fn reformat_long_pem_lines() {
        let data = b"-----BEGIN CERTIFICATE-----\n\
            AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA\n\
            -----END CERTIFICATE-----\n";
        let reformatted = reformat_pem(data).unwrap();

        assert!(
            reformatted
                .split(|&c| c == b'\n')
                .all(|line| line.len() <= 64 || line.starts_with(b"-----"))
        );
    }

    #[test]
    fn reformat_pem_missing_end() {
        let data = b"-----BEGIN CERTIFICATE-----\nAAAA\n";
        assert!(matches!(reformat_pem(data), Err(Error::PemNoEndTag)));
    }
}

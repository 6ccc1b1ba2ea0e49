// SPDX-FileCopyrightText: 2025 fwpkcs7 contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, ValueEnum};
use x509_cert::{
    Certificate,
    der::{Decode, Encode},
};

use crate::{
    cli::{args::Cli, status, warning},
    config::Config,
    crypto::{self, DigestAlgorithm, PassphraseSource},
    format::{certlist::CertList, envelope},
    pkcs7::{
        SignedDataBlob,
        sign::SignedDataBuilder,
        signature, signers,
        verify::{self, TrustStore},
    },
};

fn read_input(path: &Path, max_size: usize) -> Result<Vec<u8>> {
    let size = fs::metadata(path)
        .with_context(|| format!("Failed to stat file: {path:?}"))?
        .len();

    if size > max_size as u64 {
        bail!("File exceeds {max_size} byte limit: {path:?}");
    }

    fs::read(path).with_context(|| format!("Failed to read file: {path:?}"))
}

fn write_output(path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).with_context(|| format!("Failed to write file: {path:?}"))
}

fn load_config(cli: &Cli) -> Result<Config> {
    Config::load(cli.config.as_deref()).context("Failed to load config")
}

/// Load a PEM or DER certificate and return its DER encoding.
fn read_cert_der(path: &Path) -> Result<Vec<u8>> {
    let cert = crypto::read_cert_file(path)
        .with_context(|| format!("Failed to load certificate: {path:?}"))?;

    cert.to_der()
        .with_context(|| format!("Failed to encode certificate: {path:?}"))
}

fn write_list(path: Option<&Path>, list: Option<&CertList>, name: &str) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };

    match list {
        Some(list) => write_output(path, list.as_bytes()),
        None => {
            warning!("No {name} certificates; not writing {path:?}");
            Ok(())
        }
    }
}

pub fn wrap_main(cli: &WrapCli, global: &Cli) -> Result<()> {
    let config = load_config(global)?;
    let data = read_input(&cli.input, config.max_input_size())?;
    let envelope = envelope::normalize(&data)
        .with_context(|| format!("Failed to normalize: {:?}", cli.input))?;

    if envelope.was_wrapped() {
        status!("Input is already wrapped in ContentInfo");
    } else {
        status!("Wrapped bare SignedData in ContentInfo");
    }

    write_output(&cli.output, envelope.as_bytes())
}

pub fn signers_main(cli: &SignersCli, global: &Cli) -> Result<()> {
    let config = load_config(global)?;
    let data = read_input(&cli.input, config.max_input_size())?;

    let result = signers::get_signers(&data)
        .with_context(|| format!("Failed to extract signers: {:?}", cli.input))?;

    status!("Found {} signer certificates", result.list.iter().count());

    write_list(cli.list.as_deref(), Some(&result.list), "signer")?;

    if let Some(path) = &cli.cert {
        write_output(path, &result.trusted_cert)?;
    }

    Ok(())
}

pub fn chain_main(cli: &ChainCli, global: &Cli) -> Result<()> {
    let config = load_config(global)?;
    let data = read_input(&cli.input, config.max_input_size())?;

    let result = signers::get_certificates_list(&data)
        .with_context(|| format!("Failed to extract certificate chain: {:?}", cli.input))?;

    let count = |l: &Option<CertList>| l.as_ref().map_or(0, |l| l.iter().count());
    status!(
        "Chain has {} certificates; {} unchained",
        count(&result.chain),
        count(&result.unchained),
    );

    write_list(cli.chain.as_deref(), result.chain.as_ref(), "chained")?;
    write_list(cli.unchained.as_deref(), result.unchained.as_ref(), "unchained")?;

    Ok(())
}

pub fn verify_main(cli: &VerifyCli, global: &Cli) -> Result<()> {
    let config = load_config(global)?;
    let policy = config.verify_policy();
    let data = read_input(&cli.input, config.max_input_size())?;
    let trusted = read_cert_der(&cli.trusted)?;

    let blob = SignedDataBlob::decode(&data)
        .with_context(|| format!("Failed to decode PKCS#7: {:?}", cli.input))?;
    let store = TrustStore::from_der(&trusted)
        .with_context(|| format!("Failed to load trusted certificate: {:?}", cli.trusted))?;

    let content = match &cli.content {
        Some(path) => read_input(path, config.max_input_size())?,
        None => match blob.embedded_content() {
            Some(c) => c.to_vec(),
            None => bail!("SignedData is detached; specify --content"),
        },
    };

    verify::verify_signed_data(&blob, &store, &content, &policy)
        .with_context(|| format!("Verification failed: {:?}", cli.input))?;

    status!("Successfully verified {:?}", cli.input);

    Ok(())
}

pub fn signature_main(cli: &SignatureCli, global: &Cli) -> Result<()> {
    let config = load_config(global)?;
    let data = read_input(&cli.input, config.max_input_size())?;

    let sig = signature::get_signature(&data)
        .with_context(|| format!("Failed to extract signature: {:?}", cli.input))?;

    status!("Signature is {} bytes", sig.len());

    write_output(&cli.output, &sig)
}

pub fn dump_list_main(cli: &DumpListCli, global: &Cli) -> Result<()> {
    let config = load_config(global)?;
    let data = read_input(&cli.input, config.max_input_size())?;
    let list = CertList::from_bytes(data)
        .with_context(|| format!("Failed to parse certificate list: {:?}", cli.input))?;

    for (i, der) in list.iter().enumerate() {
        let fingerprint = hex::encode(DigestAlgorithm::Sha256.hash(der));

        match Certificate::from_der(der) {
            Ok(cert) => {
                println!("[{i}] Subject: {}", cert.tbs_certificate.subject);
                println!("    Issuer:  {}", cert.tbs_certificate.issuer);
            }
            Err(e) => println!("[{i}] Invalid certificate: {e}"),
        }

        println!("    SHA-256: {fingerprint}");
    }

    Ok(())
}

pub fn sign_main(cli: &SignCli, global: &Cli) -> Result<()> {
    let config = load_config(global)?;
    let source = PassphraseSource::new(
        cli.passphrase.pass_file.as_deref(),
        cli.passphrase.pass_env_var.as_deref(),
    );
    let key = crypto::read_pem_key_file(&cli.key, &source)
        .with_context(|| format!("Failed to load key: {:?}", cli.key))?;
    let cert = crypto::read_cert_file(&cli.cert)
        .with_context(|| format!("Failed to load certificate: {:?}", cli.cert))?;

    if !crypto::cert_matches_key(&cert, &key)? {
        bail!("Private key and certificate do not match");
    }

    let extra_certs = cli
        .extra_cert
        .iter()
        .map(|p| {
            crypto::read_cert_file(p).with_context(|| format!("Failed to load certificate: {p:?}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let content = read_input(&cli.input, config.max_input_size())?;

    let mut builder = SignedDataBuilder::new(&content)
        .detached(cli.detached)
        .signer(&key, &cert, cli.digest.into(), !cli.no_signed_attrs);
    for extra in &extra_certs {
        builder = builder.extra_cert(extra);
    }

    let output = if cli.bare {
        builder.build_bare_der()
    } else {
        builder.build_der()
    }
    .context("Failed to create SignedData")?;

    write_output(&cli.output, &output)
}

/// Wrap a bare SignedData in a ContentInfo.
///
/// Input that is already wrapped is written back unchanged.
#[derive(Debug, Parser)]
pub struct WrapCli {
    /// Path to input PKCS#7 file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output PKCS#7 file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

/// Extract the signer certificates.
#[derive(Debug, Parser)]
pub struct SignersCli {
    /// Path to input PKCS#7 file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output serialized certificate list.
    #[arg(long, value_name = "FILE", value_parser)]
    list: Option<PathBuf>,

    /// Path to output DER certificate of the first signer.
    #[arg(long, value_name = "FILE", value_parser)]
    cert: Option<PathBuf>,
}

/// Split embedded certificates into the signer chain and the rest.
///
/// Only PKCS#7 files with exactly one signer are supported.
#[derive(Debug, Parser)]
pub struct ChainCli {
    /// Path to input PKCS#7 file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output serialized list of chained certificates.
    #[arg(long, value_name = "FILE", value_parser)]
    chain: Option<PathBuf>,

    /// Path to output serialized list of unchained certificates.
    #[arg(long, value_name = "FILE", value_parser)]
    unchained: Option<PathBuf>,
}

/// Verify a PKCS#7 file against a trusted certificate.
#[derive(Debug, Parser)]
pub struct VerifyCli {
    /// Path to input PKCS#7 file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to trusted certificate (PEM or DER).
    #[arg(short, long, value_name = "FILE", value_parser)]
    trusted: PathBuf,

    /// Path to signed content. Defaults to the embedded content.
    #[arg(short, long, value_name = "FILE", value_parser)]
    content: Option<PathBuf>,
}

/// Extract the raw signature of the only signer.
#[derive(Debug, Parser)]
pub struct SignatureCli {
    /// Path to input PKCS#7 file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to output signature.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

/// Show the certificates in a serialized certificate list.
#[derive(Debug, Parser)]
pub struct DumpListCli {
    /// Path to serialized certificate list.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SignDigest {
    Sha256,
    Sha384,
    Sha512,
}

impl From<SignDigest> for DigestAlgorithm {
    fn from(digest: SignDigest) -> Self {
        match digest {
            SignDigest::Sha256 => Self::Sha256,
            SignDigest::Sha384 => Self::Sha384,
            SignDigest::Sha512 => Self::Sha512,
        }
    }
}

#[derive(Debug, Args)]
struct PassphraseGroup {
    /// Environment variable containing private key passphrase.
    #[arg(long, value_name = "ENV_VAR", value_parser, group = "pass")]
    pass_env_var: Option<OsString>,

    /// File containing private key passphrase.
    #[arg(long, value_name = "FILE", value_parser, group = "pass")]
    pass_file: Option<PathBuf>,
}

/// Sign a file and produce a PKCS#7 SignedData.
#[derive(Debug, Parser)]
pub struct SignCli {
    /// Path to content to sign.
    #[arg(short, long, value_name = "FILE", value_parser)]
    input: PathBuf,

    /// Path to signing private key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    key: PathBuf,

    #[command(flatten)]
    passphrase: PassphraseGroup,

    /// Path to signing certificate.
    #[arg(short, long, value_name = "FILE", value_parser)]
    cert: PathBuf,

    /// Additional certificate to embed, like an intermediate CA.
    #[arg(long, value_name = "FILE", value_parser)]
    extra_cert: Vec<PathBuf>,

    /// Digest algorithm.
    #[arg(long, value_enum, default_value_t = SignDigest::Sha256)]
    digest: SignDigest,

    /// Do not embed the content.
    #[arg(long)]
    detached: bool,

    /// Sign the content directly instead of signed attributes.
    #[arg(long)]
    no_signed_attrs: bool,

    /// Output a bare SignedData without the ContentInfo wrapper.
    #[arg(long)]
    bare: bool,

    /// Path to output PKCS#7 file.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,
}

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;

    use crate::cli::args::Command;

    use super::*;

    fn parse(args: &[&OsStr]) -> Cli {
        Cli::try_parse_from([OsStr::new("fwpkcs7")].iter().chain(args)).unwrap()
    }

    #[test]
    fn input_limit_comes_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("fwpkcs7.toml");
        let input = dir.path().join("input.p7");
        let output = dir.path().join("output.p7");

        fs::write(&config, "[limits]\nmax_input_size = 16\n").unwrap();
        fs::write(&input, [0u8; 64]).unwrap();

        let cli = parse(&[
            OsStr::new("--config"),
            config.as_os_str(),
            OsStr::new("wrap"),
            OsStr::new("--input"),
            input.as_os_str(),
            OsStr::new("--output"),
            output.as_os_str(),
        ]);
        let Command::Wrap(c) = &cli.command else {
            panic!("Unexpected command: {:?}", cli.command);
        };

        let err = wrap_main(c, &cli).unwrap_err();
        assert!(err.to_string().contains("16 byte limit"), "{err:?}");
        assert!(!output.exists());

        let cli = parse(&[
            OsStr::new("--config"),
            config.as_os_str(),
            OsStr::new("dump-list"),
            OsStr::new("--input"),
            input.as_os_str(),
        ]);
        let Command::DumpList(c) = &cli.command else {
            panic!("Unexpected command: {:?}", cli.command);
        };

        let err = dump_list_main(c, &cli).unwrap_err();
        assert!(err.to_string().contains("16 byte limit"), "{err:?}");
    }
}

// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-FileCopyrightText: 2025 fwpkcs7 contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{ffi::OsString, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::crypto::{self, CertIssuer, PassphraseSource};

fn get_passphrase_source(group: &PassphraseGroup) -> PassphraseSource {
    PassphraseSource::new(group.pass_file.as_deref(), group.pass_env_var.as_deref())
}

pub fn key_main(cli: &KeyCli) -> Result<()> {
    match &cli.command {
        KeyCommand::GenerateKey(c) => {
            let source = get_passphrase_source(&c.passphrase);
            let private_key =
                crypto::generate_rsa_key_pair().context("Failed to generate RSA keypair")?;

            crypto::write_pem_key_file(&c.output, &private_key, &source)
                .with_context(|| format!("Failed to write private key: {:?}", c.output))?;
        }
        KeyCommand::GenerateCert(c) => {
            let source = get_passphrase_source(&c.passphrase);
            let private_key = crypto::read_pem_key_file(&c.key, &source)
                .with_context(|| format!("Failed to load key: {:?}", c.key))?;

            let issuer = match (&c.issuer.issuer_key, &c.issuer.issuer_cert) {
                (Some(key_path), Some(cert_path)) => {
                    let group = &c.issuer.issuer_passphrase;
                    let source = PassphraseSource::new(
                        group.issuer_pass_file.as_deref(),
                        group.issuer_pass_env_var.as_deref(),
                    );
                    let key = crypto::read_pem_key_file(key_path, &source)
                        .with_context(|| format!("Failed to load issuer key: {key_path:?}"))?;
                    let cert = crypto::read_cert_file(cert_path).with_context(|| {
                        format!("Failed to load issuer certificate: {cert_path:?}")
                    })?;

                    if !crypto::cert_matches_key(&cert, &key)? {
                        anyhow::bail!("Issuer key and certificate do not match");
                    }

                    Some((key, cert))
                }
                _ => None,
            };

            let validity = crypto::validity_from_now(Duration::from_secs(
                c.validity * 24 * 60 * 60,
            ))
            .context("Failed to compute validity period")?;

            let cert = crypto::generate_cert(
                &private_key,
                issuer
                    .as_ref()
                    .map(|(key, cert)| CertIssuer { cert, key }),
                rand::random(),
                validity,
                &c.subject,
                c.ca,
            )
            .context("Failed to generate certificate")?;

            crypto::write_pem_cert_file(&c.output, &cert)
                .with_context(|| format!("Failed to write certificate: {:?}", c.output))?;
        }
    }

    Ok(())
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

#[derive(Debug, Args)]
struct IssuerPassphraseGroup {
    /// Environment variable containing issuer private key passphrase.
    #[arg(long, value_name = "ENV_VAR", value_parser, group = "issuer_pass")]
    issuer_pass_env_var: Option<OsString>,

    /// File containing issuer private key passphrase.
    #[arg(long, value_name = "FILE", value_parser, group = "issuer_pass")]
    issuer_pass_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct IssuerGroup {
    /// Path to issuer private key. Self-signed if omitted.
    #[arg(long, value_name = "FILE", value_parser, requires = "issuer_cert")]
    issuer_key: Option<PathBuf>,

    /// Path to issuer certificate.
    #[arg(long, value_name = "FILE", value_parser, requires = "issuer_key")]
    issuer_cert: Option<PathBuf>,

    #[command(flatten)]
    issuer_passphrase: IssuerPassphraseGroup,
}

/// Generate an 4096-bit RSA keypair.
///
/// The output is saved in the standard PKCS8 format.
#[derive(Debug, Parser)]
struct GenerateKeyCli {
    /// Path to output private key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    #[command(flatten)]
    passphrase: PassphraseGroup,
}

/// Generate a certificate.
///
/// Without an issuer, a self-signed root CA certificate is generated.
#[derive(Debug, Parser)]
struct GenerateCertCli {
    /// Path to input private key.
    #[arg(short, long, value_name = "FILE", value_parser)]
    key: PathBuf,

    #[command(flatten)]
    passphrase: PassphraseGroup,

    #[command(flatten)]
    issuer: IssuerGroup,

    /// Path to output certificate.
    #[arg(short, long, value_name = "FILE", value_parser)]
    output: PathBuf,

    /// Certificate subject with comma-separated components.
    #[arg(short, long, default_value = "CN=fwpkcs7")]
    subject: String,

    /// Certificate validity in days.
    #[arg(short, long, default_value = "10000")]
    validity: u64,

    /// Generate an intermediate CA instead of a leaf when an issuer is given.
    #[arg(long)]
    ca: bool,
}

#[derive(Debug, Subcommand)]
enum KeyCommand {
    GenerateKey(GenerateKeyCli),
    GenerateCert(GenerateCertCli),
}

/// Generate keys and certificates.
#[derive(Debug, Parser)]
pub struct KeyCli {
    #[command(subcommand)]
    command: KeyCommand,
}

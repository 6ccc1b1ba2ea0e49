// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-FileCopyrightText: 2025 fwpkcs7 contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{Level, level_filters::LevelFilter};

use crate::cli::{key, pkcs7};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Level and message only.
    #[default]
    Short,
    /// Include the timestamp.
    Medium,
    /// Include the timestamp, module path, and source location.
    Long,
    /// One JSON object per line.
    Json,
}

/// Set up the global `tracing` subscriber. Output goes to stderr so that it
/// never mixes with data written to stdout.
pub fn init_logging(level: LogLevel, format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(LevelFilter::from_level(level.into()));

    match format {
        LogFormat::Short => builder.without_time().with_target(false).init(),
        LogFormat::Medium => builder.with_target(false).init(),
        LogFormat::Long => builder
            .with_file(true)
            .with_line_number(true)
            .init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Wrap(pkcs7::WrapCli),
    Signers(pkcs7::SignersCli),
    Chain(pkcs7::ChainCli),
    Verify(pkcs7::VerifyCli),
    Signature(pkcs7::SignatureCli),
    DumpList(pkcs7::DumpListCli),
    Sign(pkcs7::SignCli),
    Key(key::KeyCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log message severity to output.
    #[arg(long, global = true, value_name = "LEVEL", default_value_t, value_enum)]
    pub log_level: LogLevel,

    /// Output format for log messages.
    #[arg(long, global = true, value_name = "FORMAT", default_value_t, value_enum)]
    pub log_format: LogFormat,

    /// Path to config file.
    ///
    /// If unset, `fwpkcs7.toml` in the current directory is used if it exists.
    #[arg(long, global = true, value_name = "FILE", value_parser)]
    pub config: Option<PathBuf>,
}

pub fn main(logging_initialized: &AtomicBool) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level, cli.log_format);
    logging_initialized.store(true, Ordering::SeqCst);

    match &cli.command {
        Command::Wrap(c) => pkcs7::wrap_main(c, &cli),
        Command::Signers(c) => pkcs7::signers_main(c, &cli),
        Command::Chain(c) => pkcs7::chain_main(c, &cli),
        Command::Verify(c) => pkcs7::verify_main(c, &cli),
        Command::Signature(c) => pkcs7::signature_main(c, &cli),
        Command::DumpList(c) => pkcs7::dump_list_main(c, &cli),
        Command::Sign(c) => pkcs7::sign_main(c, &cli),
        Command::Key(c) => key::key_main(c),
    }
}

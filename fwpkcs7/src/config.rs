// SPDX-FileCopyrightText: 2025 fwpkcs7 contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::pkcs7::{
    MAX_INPUT_SIZE,
    verify::{Purpose, VerifyFlags, VerifyPolicy},
};

/// Config file read when none is specified explicitly.
pub const DEFAULT_PATH: &str = "fwpkcs7.toml";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config: {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse config: {0:?}")]
    Parse(PathBuf, #[source] toml_edit::de::Error),
    #[error("max_depth must be at least 1")]
    InvalidMaxDepth,
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifyConfig {
    pub partial_chain: bool,
    pub check_time: bool,
    pub purpose: Purpose,
    pub max_depth: usize,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            partial_chain: true,
            check_time: false,
            purpose: Purpose::Any,
            max_depth: 100,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Largest input file accepted by the CLI. Values above the library limit
    /// are clamped.
    pub max_input_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_input_size: MAX_INPUT_SIZE,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub verify: VerifyConfig,
    pub limits: LimitsConfig,
}

impl Config {
    pub fn parse(path: &Path, contents: &str) -> Result<Self> {
        let config: Self = toml_edit::de::from_str(contents)
            .map_err(|e| Error::Parse(path.to_owned(), e))?;

        if config.verify.max_depth == 0 {
            return Err(Error::InvalidMaxDepth);
        }

        Ok(config)
    }

    /// Load a config file. With no explicit path, [`DEFAULT_PATH`] is tried
    /// and the defaults are used if it does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p, true),
            None => (Path::new(DEFAULT_PATH), false),
        };

        let contents = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if !required && e.kind() == io::ErrorKind::NotFound => {
                debug!("No config at {path:?}, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(Error::Read(path.to_owned(), e)),
        };

        debug!("Loading config from {path:?}");

        Self::parse(path, &contents)
    }

    pub fn verify_policy(&self) -> VerifyPolicy {
        let mut flags = VerifyFlags::empty();
        flags.set(VerifyFlags::PARTIAL_CHAIN, self.verify.partial_chain);
        flags.set(VerifyFlags::NO_CHECK_TIME, !self.verify.check_time);

        VerifyPolicy {
            flags,
            purpose: self.verify.purpose,
            max_depth: self.verify.max_depth,
        }
    }

    /// Input size limit, clamped to what the library accepts.
    pub fn max_input_size(&self) -> usize {
        self.limits.max_input_size.min(MAX_INPUT_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_match_library_policy() {
        let config = Config::parse(Path::new("empty.toml"), "").unwrap();

        assert_eq!(config, Config::default());
        assert_eq!(config.verify_policy(), VerifyPolicy::default());
        assert_eq!(config.max_input_size(), MAX_INPUT_SIZE);
    }

    #[test]
    fn parse_overrides() {
        let config = Config::parse(
            Path::new("strict.toml"),
            r#"
                [verify]
                partial_chain = false
                check_time = true
                purpose = "code_signing"
                max_depth = 4

                [limits]
                max_input_size = 99999999999
            "#,
        )
        .unwrap();

        let policy = config.verify_policy();
        assert!(policy.flags.is_empty());
        assert_eq!(policy.purpose, Purpose::CodeSigning);
        assert_eq!(policy.max_depth, 4);
        assert_eq!(config.max_input_size(), MAX_INPUT_SIZE);
    }

    #[test]
    fn parse_rejects_bad_values() {
        assert_matches!(
            Config::parse(Path::new("a.toml"), "[verify]\npurpose = \"email\""),
            Err(Error::Parse(..))
        );
        assert_matches!(
            Config::parse(Path::new("b.toml"), "[verify]\nunknown = 1"),
            Err(Error::Parse(..))
        );
        assert_matches!(
            Config::parse(Path::new("c.toml"), "[verify]\nmax_depth = 0"),
            Err(Error::InvalidMaxDepth)
        );
    }

    #[test]
    fn missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");

        assert_matches!(Config::load(Some(&path)), Err(Error::Read(..)));
    }
}

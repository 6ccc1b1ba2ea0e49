// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-FileCopyrightText: 2025 fwpkcs7 contributors
// SPDX-License-Identifier: GPL-3.0-only

//! PKCS#7 `SignedData` parsing, certificate extraction, and verification for
//! firmware authentication.
//!
//! The CLI source files use concrete types wherever possible for simplicity,
//! while the library source files aim to be generic.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod format;
pub mod pkcs7;

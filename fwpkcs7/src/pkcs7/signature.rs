// SPDX-FileCopyrightText: 2025 fwpkcs7 contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Raw signature extraction, used when counter-signing or timestamping.

use tracing::trace;

use crate::pkcs7::{self, Error, Result, SignedDataBlob};

fn with_signature<T>(data: &[u8], f: impl FnOnce(&[u8]) -> Result<T>) -> Result<T> {
    let blob = SignedDataBlob::decode(data)?;
    let info = blob.single_signer_info()?;
    let signature = info.signature.as_bytes();

    trace!("SignerInfo signature is {} bytes", signature.len());

    f(signature)
}

/// Get the encrypted digest of the only SignerInfo.
pub fn get_signature(data: &[u8]) -> Result<Vec<u8>> {
    with_signature(data, pkcs7::try_to_vec)
}

/// Copy the encrypted digest of the only SignerInfo into `dest` and return its
/// length. With no destination, only the length is returned. Nothing is
/// written if `dest` is too small.
pub fn copy_signature(data: &[u8], dest: Option<&mut [u8]>) -> Result<usize> {
    with_signature(data, |signature| {
        if let Some(dest) = dest {
            let actual = dest.len();
            let dest = dest
                .get_mut(..signature.len())
                .ok_or(Error::BufferTooSmall {
                    required: signature.len(),
                    actual,
                })?;

            dest.copy_from_slice(signature);
        }

        Ok(signature.len())
    })
}

// SPDX-FileCopyrightText: 2025 fwpkcs7 contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Normalization of PKCS#7 blobs into a full `ContentInfo` envelope.
//!
//! UEFI allows authenticated variables and signed payloads to carry a
//! `SignedData` structure either with or without the surrounding `ContentInfo`.
//! Everything downstream expects the wrapped form, so a bare `SignedData` gets
//! a fixed 19-byte header prepended:
//!
//! ```text
//! 30 82 <len1:be16>        SEQUENCE, len1 = len(SignedData) + 15
//!   06 09 <signedData OID> OBJECT IDENTIFIER 1.2.840.113549.1.7.2
//!   A0 82 <len2:be16>      [0] EXPLICIT, len2 = len(SignedData)
//!     <SignedData>
//! ```
//!
//! Detection only looks at fixed offsets. It is not a DER parse.

use std::{borrow::Cow, collections::TryReserveError, fmt, mem};

use thiserror::Error;
use tracing::trace;
use zerocopy::{IntoBytes, byteorder::big_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// DER content bytes of the PKCS#7 `signedData` OID (1.2.840.113549.1.7.2).
pub const SIGNED_DATA_OID: [u8; 9] = [0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02];

/// Size of the synthesized `ContentInfo` header.
pub const HEADER_SIZE: usize = 19;

/// Number of leading bytes inspected by [`is_wrapped`].
pub const DETECT_SIZE: usize = 17;

/// Largest bare `SignedData` whose length still fits in the header's 16-bit
/// length fields.
pub const MAX_BARE_SIZE: usize = u16::MAX as usize - HEADER_SIZE;

#[derive(Debug, Error)]
pub enum Error {
    #[error("PKCS#7 data is too short to classify: {0} < {DETECT_SIZE} bytes")]
    TooShort(usize),
    #[error("Bare SignedData is too large to wrap: {0} > {MAX_BARE_SIZE} bytes")]
    TooLarge(usize),
    #[error("Failed to allocate {0} byte ContentInfo envelope")]
    Alloc(usize, #[source] TryReserveError),
}

type Result<T> = std::result::Result<T, Error>;

/// Raw layout of the synthesized `ContentInfo` header.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    /// `SEQUENCE` tag.
    seq_tag: u8,
    /// Long form length with two length octets.
    seq_len_form: u8,
    /// Length of everything after this field.
    seq_len: big_endian::U16,
    /// `OBJECT IDENTIFIER` tag.
    oid_tag: u8,
    /// Length of [`Self::oid`].
    oid_len: u8,
    oid: [u8; 9],
    /// `[0]` constructed, context-specific tag.
    content_tag: u8,
    /// Long form length with two length octets.
    content_len_form: u8,
    /// Length of the bare `SignedData`.
    content_len: big_endian::U16,
}

const _: () = assert!(mem::size_of::<RawHeader>() == HEADER_SIZE);

impl fmt::Debug for RawHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawHeader")
            .field("seq_len", &self.seq_len.get())
            .field("content_len", &self.content_len.get())
            .finish_non_exhaustive()
    }
}

impl RawHeader {
    fn new(content_len: u16) -> Self {
        Self {
            seq_tag: 0x30,
            seq_len_form: 0x82,
            // Everything in the header after seq_len is 15 bytes.
            seq_len: (content_len + (HEADER_SIZE as u16 - 4)).into(),
            oid_tag: 0x06,
            oid_len: SIGNED_DATA_OID.len() as u8,
            oid: SIGNED_DATA_OID,
            content_tag: 0xa0,
            content_len_form: 0x82,
            content_len: content_len.into(),
        }
    }
}

/// Check whether `data` already begins with a `ContentInfo` header for
/// `signedData`. Inputs shorter than [`DETECT_SIZE`] are never considered
/// wrapped.
pub fn is_wrapped(data: &[u8]) -> bool {
    let Some(prefix) = data.get(..DETECT_SIZE) else {
        return false;
    };

    prefix[4] == 0x06
        && prefix[5] == 0x09
        && prefix[6..15] == SIGNED_DATA_OID
        && prefix[15] == 0xa0
        && prefix[16] == 0x82
}

fn alloc(size: usize) -> Result<Vec<u8>> {
    let mut result = Vec::new();
    result
        .try_reserve_exact(size)
        .map_err(|e| Error::Alloc(size, e))?;

    Ok(result)
}

/// Prepend the 19-byte `ContentInfo` header to a bare `SignedData`.
pub fn wrap(data: &[u8]) -> Result<Vec<u8>> {
    let content_len = u16::try_from(data.len())
        .ok()
        .filter(|n| usize::from(*n) <= MAX_BARE_SIZE)
        .ok_or(Error::TooLarge(data.len()))?;
    let size = HEADER_SIZE + data.len();

    let mut result = alloc(size)?;

    let header = RawHeader::new(content_len);
    trace!("Synthesizing ContentInfo header: {header:?}");

    result.extend_from_slice(header.as_bytes());
    result.extend_from_slice(data);

    Ok(result)
}

/// A PKCS#7 blob in `ContentInfo` form. Already-wrapped input is borrowed
/// as-is. Only bare input results in a new buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Envelope<'a> {
    data: Cow<'a, [u8]>,
}

impl fmt::Debug for Envelope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("was_wrapped", &self.was_wrapped())
            .field("len", &self.data.len())
            .finish()
    }
}

impl<'a> Envelope<'a> {
    /// Whether the input was already a `ContentInfo` (and is aliased rather
    /// than copied).
    pub fn was_wrapped(&self) -> bool {
        matches!(self.data, Cow::Borrowed(_))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Cow<'a, [u8]> {
        self.data
    }
}

impl AsRef<[u8]> for Envelope<'_> {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Return `data` in `ContentInfo` form, wrapping it if needed.
///
/// Input shorter than [`DETECT_SIZE`] bytes cannot be classified and is
/// rejected. Bare input larger than [`MAX_BARE_SIZE`] is rejected instead of
/// producing a header with truncated lengths.
pub fn normalize(data: &[u8]) -> Result<Envelope<'_>> {
    if data.len() < DETECT_SIZE {
        return Err(Error::TooShort(data.len()));
    }

    if is_wrapped(data) {
        trace!("PKCS#7 data is already wrapped in ContentInfo");

        Ok(Envelope {
            data: Cow::Borrowed(data),
        })
    } else {
        trace!("Wrapping {} byte bare SignedData in ContentInfo", data.len());

        Ok(Envelope {
            data: Cow::Owned(wrap(data)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn bare(len: usize) -> Vec<u8> {
        let mut data = vec![0x30, 0x82, ((len - 4) >> 8) as u8, (len - 4) as u8];
        data.resize(len, 0xa5);
        data
    }

    #[test]
    fn allocation_failure_is_reported() {
        assert_matches!(alloc(usize::MAX), Err(Error::Alloc(usize::MAX, _)));
        assert!(alloc(HEADER_SIZE).unwrap().capacity() >= HEADER_SIZE);
    }

    #[test]
    fn header_layout() {
        let data = bare(0x1234);
        let wrapped = wrap(&data).unwrap();

        assert_eq!(wrapped.len(), data.len() + HEADER_SIZE);
        assert_eq!(&wrapped[..4], &[0x30, 0x82, 0x12, 0x43]);
        assert_eq!(&wrapped[4..6], &[0x06, 0x09]);
        assert_eq!(&wrapped[6..15], &SIGNED_DATA_OID);
        assert_eq!(&wrapped[15..19], &[0xa0, 0x82, 0x12, 0x34]);
        assert_eq!(&wrapped[19..], data.as_slice());
    }

    #[test]
    fn wrapped_is_detected() {
        let wrapped = wrap(&bare(300)).unwrap();

        assert!(is_wrapped(&wrapped));
        assert!(!is_wrapped(&bare(300)));
    }

    #[test]
    fn normalize_aliases_wrapped_input() {
        let wrapped = wrap(&bare(300)).unwrap();
        let envelope = normalize(&wrapped).unwrap();

        assert!(envelope.was_wrapped());
        assert_eq!(envelope.as_bytes().as_ptr(), wrapped.as_ptr());
        assert_eq!(envelope.as_bytes(), wrapped.as_slice());
    }

    #[test]
    fn normalize_is_idempotent() {
        let data = bare(1000);
        let first = normalize(&data).unwrap();
        assert!(!first.was_wrapped());

        let second = normalize(first.as_bytes()).unwrap();
        assert!(second.was_wrapped());
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    #[test]
    fn short_input_is_rejected() {
        for len in 0..DETECT_SIZE {
            let data = vec![0u8; len];
            assert_matches!(normalize(&data), Err(Error::TooShort(n)) if n == len);
            assert!(!is_wrapped(&data));
        }

        // The shortest classifiable input is accepted.
        let data = vec![0u8; DETECT_SIZE];
        assert!(!normalize(&data).unwrap().was_wrapped());
    }

    #[test]
    fn oversized_bare_input_is_rejected() {
        let data = vec![0u8; MAX_BARE_SIZE];
        assert_eq!(wrap(&data).unwrap().len(), usize::from(u16::MAX));

        let data = vec![0u8; MAX_BARE_SIZE + 1];
        assert_matches!(normalize(&data), Err(Error::TooLarge(n)) if n == MAX_BARE_SIZE + 1);
    }

    #[test]
    fn partial_prefix_match_is_wrapped_again() {
        let mut data = wrap(&bare(300)).unwrap();
        // Short form length instead of 0x82.
        data[16] = 0x81;

        let envelope = normalize(&data).unwrap();
        assert!(!envelope.was_wrapped());
        assert_eq!(&envelope.as_bytes()[HEADER_SIZE..], data.as_slice());
    }
}

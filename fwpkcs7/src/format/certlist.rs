// SPDX-FileCopyrightText: 2025 fwpkcs7 contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Serialized certificate lists (`EFI_CERT_STACK` layout).
//!
//! ```text
//! u8  count
//! repeated count times:
//!     u32 length (little endian)
//!     u8  der[length]
//! ```
//!
//! There is no padding and no trailing data. The count is a single byte, so
//! lists with 256 or more certificates wrap around. This matches the layout
//! that firmware consumers already expect.

use std::{collections::TryReserveError, fmt, mem};

use thiserror::Error;
use tracing::{trace, warn};
use x509_cert::{Certificate, der::Encode};
use zerocopy::{FromBytes, IntoBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Certificate is too large for a list record: {0} bytes")]
    RecordTooLarge(usize),
    #[error("Failed to grow certificate list by {0} bytes")]
    Alloc(usize, #[source] TryReserveError),
    #[error("Failed to DER encode certificate #{0}")]
    Encode(usize, #[source] x509_cert::der::Error),
    #[error("Certificate list is empty")]
    Empty,
    #[error("Record #{index} at offset {offset} is truncated")]
    Truncated { index: usize, offset: usize },
    #[error("Expected {expected} certificates (mod 256), but found {actual}")]
    CountMismatch { expected: u8, actual: usize },
}

type Result<T> = std::result::Result<T, Error>;

/// Raw layout of the header that precedes every DER record.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawRecordHeader {
    /// Size of the DER-encoded certificate that follows.
    length: little_endian::U32,
}

impl fmt::Debug for RawRecordHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRecordHeader")
            .field("length", &self.length.get())
            .finish()
    }
}

const RECORD_HEADER_SIZE: usize = mem::size_of::<RawRecordHeader>();

fn try_reserve(buf: &mut Vec<u8>, additional: usize) -> Result<()> {
    buf.try_reserve_exact(additional)
        .map_err(|e| Error::Alloc(additional, e))
}

/// Incrementally builds a [`CertList`]. Dropping the builder releases
/// everything accumulated so far.
#[derive(Default)]
pub struct CertListBuilder {
    data: Vec<u8>,
    count: usize,
    scratch: Vec<u8>,
}

impl fmt::Debug for CertListBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertListBuilder")
            .field("count", &self.count)
            .field("size", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl CertListBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of certificates appended so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Append a DER-encoded certificate.
    pub fn push_der(&mut self, der: &[u8]) -> Result<()> {
        let length = u32::try_from(der.len()).map_err(|_| Error::RecordTooLarge(der.len()))?;
        let additional = RECORD_HEADER_SIZE
            .checked_add(der.len())
            .ok_or(Error::RecordTooLarge(der.len()))?;

        if self.data.is_empty() {
            // Count byte.
            try_reserve(&mut self.data, 1 + additional)?;
            self.data.push(0);
        } else {
            try_reserve(&mut self.data, additional)?;
        }

        let header = RawRecordHeader {
            length: length.into(),
        };

        self.data.extend_from_slice(header.as_bytes());
        self.data.extend_from_slice(der);
        self.count += 1;

        Ok(())
    }

    /// Append a certificate, DER encoding it first.
    pub fn push(&mut self, cert: &Certificate) -> Result<()> {
        let size = cert
            .encoded_len()
            .and_then(usize::try_from)
            .map_err(|e| Error::Encode(self.count, e))?;

        let mut scratch = mem::take(&mut self.scratch);
        scratch.clear();

        // Encoding never grows the buffer past this.
        let ret = try_reserve(&mut scratch, size)
            .and_then(|()| {
                cert.encode_to_vec(&mut scratch)
                    .map_err(|e| Error::Encode(self.count, e))
            })
            .and_then(|_| self.push_der(&scratch));

        self.scratch = scratch;

        ret
    }

    /// Finish the list. Returns [`None`] if no certificates were appended.
    pub fn finish(self) -> Option<CertList> {
        if self.count == 0 {
            return None;
        }

        if self.count > usize::from(u8::MAX) {
            warn!(
                "Certificate count {} does not fit in the count byte and will wrap to {}",
                self.count,
                self.count as u8,
            );
        }

        let mut data = self.data;
        data[0] = self.count as u8;

        trace!(
            "Serialized {} certificates into {} byte list",
            self.count,
            data.len(),
        );

        Some(CertList { data })
    }
}

/// An owned, serialized certificate list.
#[derive(Clone, PartialEq, Eq)]
pub struct CertList {
    data: Vec<u8>,
}

impl fmt::Debug for CertList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertList")
            .field("count", &self.count())
            .field("size", &self.data.len())
            .finish()
    }
}

impl CertList {
    /// Serialize every certificate yielded by `certs`, in iteration order.
    /// Returns [`None`] if the iterator is empty. On failure, nothing built so
    /// far survives.
    pub fn from_certs<'a>(certs: impl IntoIterator<Item = &'a Certificate>) -> Result<Option<Self>> {
        let mut builder = CertListBuilder::new();

        for cert in certs {
            builder.push(cert)?;
        }

        Ok(builder.finish())
    }

    /// Serialize already DER-encoded certificates, in iteration order.
    pub fn from_der_certs<T: AsRef<[u8]>>(
        certs: impl IntoIterator<Item = T>,
    ) -> Result<Option<Self>> {
        let mut builder = CertListBuilder::new();

        for der in certs {
            builder.push_der(der.as_ref())?;
        }

        Ok(builder.finish())
    }

    /// Validate and take ownership of a serialized list.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let (&count, mut remain) = data.split_first().ok_or(Error::Empty)?;
        let mut offset = 1;
        let mut actual = 0;

        while !remain.is_empty() {
            let (der, rest) =
                split_record(remain).ok_or(Error::Truncated { index: actual, offset })?;

            offset += RECORD_HEADER_SIZE + der.len();
            remain = rest;
            actual += 1;
        }

        if actual == 0 || actual as u8 != count {
            return Err(Error::CountMismatch {
                expected: count,
                actual,
            });
        }

        Ok(Self { data })
    }

    /// Value of the leading count byte. This is the number of certificates
    /// modulo 256.
    pub fn count(&self) -> u8 {
        self.data[0]
    }

    /// Iterate over the DER-encoded certificates in the list.
    pub fn iter(&self) -> Records<'_> {
        Records {
            remain: &self.data[1..],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl AsRef<[u8]> for CertList {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl<'a> IntoIterator for &'a CertList {
    type Item = &'a [u8];
    type IntoIter = Records<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Split one `(header, der)` record off the front of `data`.
fn split_record(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let (header, rest) = RawRecordHeader::read_from_prefix(data).ok()?;
    let length = usize::try_from(header.length.get()).ok()?;

    if rest.len() < length {
        return None;
    }

    Some(rest.split_at(length))
}

/// Iterator over the DER records of a validated [`CertList`].
#[derive(Clone, Debug)]
pub struct Records<'a> {
    remain: &'a [u8],
}

impl<'a> Iterator for Records<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let (der, rest) = split_record(self.remain)?;
        self.remain = rest;

        Some(der)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn empty_list_is_absent() {
        assert_matches!(CertList::from_der_certs::<&[u8]>([]), Ok(None));
    }

    #[test]
    fn layout_is_exact() {
        let certs: [&[u8]; 3] = [b"first", b"", b"third cert"];
        let list = CertList::from_der_certs(certs).unwrap().unwrap();

        let mut expected = vec![3u8];
        for cert in certs {
            expected.extend((cert.len() as u32).to_le_bytes());
            expected.extend_from_slice(cert);
        }

        assert_eq!(list.as_bytes(), expected.as_slice());
        assert_eq!(list.len(), 1 + 3 * 4 + 5 + 10);
        assert_eq!(list.count(), 3);
        assert_eq!(list.iter().collect::<Vec<_>>(), certs);
    }

    #[test]
    fn count_wraps_at_256() {
        let certs = vec![[0xaa_u8; 2]; 257];
        let list = CertList::from_der_certs(&certs).unwrap().unwrap();

        assert_eq!(list.count(), 1);
        assert_eq!(list.iter().count(), 257);
        assert_eq!(list.len(), 1 + 257 * 6);

        // Still parses because the count matches modulo 256.
        CertList::from_bytes(list.into_bytes()).unwrap();
    }

    #[test]
    fn parse_round_trip() {
        let list = CertList::from_der_certs([b"a".as_slice(), b"bc"])
            .unwrap()
            .unwrap();
        let parsed = CertList::from_bytes(list.as_bytes().to_vec()).unwrap();

        assert_eq!(parsed, list);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_matches!(CertList::from_bytes(vec![]), Err(Error::Empty));
        assert_matches!(
            CertList::from_bytes(vec![0]),
            Err(Error::CountMismatch {
                expected: 0,
                actual: 0,
            })
        );
        // Header cut short.
        assert_matches!(
            CertList::from_bytes(vec![1, 4, 0]),
            Err(Error::Truncated {
                index: 0,
                offset: 1,
            })
        );
        // Length runs past the end.
        assert_matches!(
            CertList::from_bytes(vec![1, 4, 0, 0, 0, 1, 2, 3]),
            Err(Error::Truncated {
                index: 0,
                offset: 1,
            })
        );
        // Trailing garbage looks like a second, truncated record.
        assert_matches!(
            CertList::from_bytes(vec![1, 1, 0, 0, 0, 9, 0xff]),
            Err(Error::Truncated {
                index: 1,
                offset: 6,
            })
        );
        assert_matches!(
            CertList::from_bytes(vec![2, 1, 0, 0, 0, 9]),
            Err(Error::CountMismatch {
                expected: 2,
                actual: 1,
            })
        );
    }

    #[test]
    fn allocation_failure_is_reported() {
        let mut buf = vec![1u8];
        assert_matches!(
            try_reserve(&mut buf, usize::MAX),
            Err(Error::Alloc(usize::MAX, _))
        );
        assert_eq!(buf, [1]);

        // The builder is still usable afterwards.
        let mut builder = CertListBuilder::new();
        assert_matches!(
            try_reserve(&mut builder.data, usize::MAX),
            Err(Error::Alloc(..))
        );
        builder.push_der(b"cert").unwrap();
        assert_eq!(builder.finish().unwrap().count(), 1);
    }

    #[test]
    fn huge_length_does_not_overflow() {
        assert_matches!(
            CertList::from_bytes(vec![1, 0xff, 0xff, 0xff, 0xff, 0]),
            Err(Error::Truncated { .. })
        );
    }
}

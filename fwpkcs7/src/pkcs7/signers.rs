// SPDX-FileCopyrightText: 2025 fwpkcs7 contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Extraction of signer certificates and issuance chains. Nothing here makes
//! a trust decision. Certificates are only reorganized.

use std::ptr;

use tracing::{debug, trace};
use x509_cert::Certificate;

use crate::{
    format::certlist::CertList,
    pkcs7::{self, Error, Result, SignedDataBlob},
};

/// Serialized signer certificates.
#[derive(Clone, Debug)]
pub struct Signers {
    /// Every signer certificate. The list is ordered last signer first.
    pub list: CertList,
    /// DER encoding of the first signer's certificate. This is the last
    /// record in [`Self::list`].
    pub trusted_cert: Vec<u8>,
}

/// Serialized result of [`get_certificates_list`]. Either list is [`None`]
/// when it would be empty.
#[derive(Clone, Debug, Default)]
pub struct CertificatesList {
    /// Signer certificate followed by its issuers, leaf first.
    pub chain: Option<CertList>,
    /// Embedded certificates that are not part of the chain, in decoded
    /// order. The certificate set is DER sorted, so this is not necessarily
    /// the order the signer embedded them in.
    pub unchained: Option<CertList>,
}

/// Serialize the certificates of every signer in a PKCS#7 blob.
pub fn get_signers(data: &[u8]) -> Result<Signers> {
    let blob = SignedDataBlob::decode(data)?;
    let signers = blob.signers()?;

    // Stack pop order. The first signer ends up last.
    let list = CertList::from_certs(signers.iter().rev().copied())?.ok_or(Error::NoSigners)?;
    let last = list.iter().last().ok_or(Error::NoSigners)?;
    let trusted_cert = pkcs7::try_to_vec(last)?;

    debug!("Extracted {} signer certificates", signers.len());

    Ok(Signers { list, trusted_cert })
}

/// Walk from `signer` up through `pool` by subject/issuer name. Each issuer
/// found is moved out of the pool. The walk stops at a self-issued
/// certificate or when no issuer is left in the pool.
fn build_chain<'a>(
    signer: &'a Certificate,
    pool: &mut Vec<&'a Certificate>,
) -> Vec<&'a Certificate> {
    let mut chain = vec![signer];
    let mut cert = signer;

    loop {
        let tbs = &cert.tbs_certificate;
        if tbs.issuer == tbs.subject {
            trace!("Chain ends at self-issued {}", pkcs7::describe(cert));
            break;
        }

        let Some(index) = pool
            .iter()
            .position(|c| c.tbs_certificate.subject == tbs.issuer)
        else {
            trace!("No issuer for {} in embedded certificates", pkcs7::describe(cert));
            break;
        };

        let issuer = pool.remove(index);
        trace!("Chained {}", pkcs7::describe(issuer));

        chain.push(issuer);
        cert = issuer;
    }

    chain
}

/// Split the embedded certificates of a single-signer PKCS#7 blob into the
/// signer's issuance chain and everything else.
pub fn get_certificates_list(data: &[u8]) -> Result<CertificatesList> {
    let blob = SignedDataBlob::decode(data)?;
    let info = blob.single_signer_info()?;
    let signer = blob.signer_cert(0, info)?;

    let mut pool = blob
        .certificates()
        .filter(|c| !ptr::eq(*c, signer))
        .collect::<Vec<_>>();

    let chain = build_chain(signer, &mut pool);

    debug!(
        "Built chain of {} certificates with {} left unchained",
        chain.len(),
        pool.len(),
    );

    Ok(CertificatesList {
        chain: CertList::from_certs(chain)?,
        unchained: CertList::from_certs(pool)?,
    })
}

#[cfg(test)]
mod tests {
    use std::{sync::OnceLock, time::Duration};

    use rand::{SeedableRng, rngs::StdRng};
    use rsa::RsaPrivateKey;

    use super::*;
    use crate::crypto::{self, CertIssuer};

    fn key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();

        KEY.get_or_init(|| {
            let mut rng = StdRng::seed_from_u64(1);
            crypto::generate_rsa_key_pair_with_rng(&mut rng, 1024).unwrap()
        })
    }

    fn cert(subject: &str, issuer: Option<&Certificate>) -> Certificate {
        let validity = crypto::validity_from_now(Duration::from_secs(3600)).unwrap();
        let issuer = issuer.map(|cert| CertIssuer { cert, key: key() });

        crypto::generate_cert(key(), issuer, 1, validity, subject, true).unwrap()
    }

    fn subjects(chain: &[&Certificate]) -> Vec<String> {
        chain.iter().map(|c| pkcs7::describe(c)).collect()
    }

    #[test]
    fn chain_stops_at_self_issued() {
        let root = cert("CN=root", None);
        let inter = cert("CN=inter", Some(&root));
        let leaf = cert("CN=leaf", Some(&inter));
        let other = cert("CN=other", Some(&root));

        let mut pool = vec![&other, &root, &inter];
        let chain = build_chain(&leaf, &mut pool);

        assert_eq!(subjects(&chain), ["CN=leaf", "CN=inter", "CN=root"]);
        assert_eq!(subjects(&pool), ["CN=other"]);
    }

    #[test]
    fn chain_stops_without_issuer() {
        let root = cert("CN=root", None);
        let inter = cert("CN=inter", Some(&root));
        let leaf = cert("CN=leaf", Some(&inter));

        let mut pool = vec![&root];
        let chain = build_chain(&leaf, &mut pool);

        assert_eq!(subjects(&chain), ["CN=leaf"]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn chain_cycle_terminates() {
        let placeholder = cert("CN=b", None);
        let a = cert("CN=a", Some(&placeholder));
        let b = cert("CN=b", Some(&a));
        let leaf = cert("CN=leaf", Some(&a));

        let mut pool = vec![&a, &b];
        let chain = build_chain(&leaf, &mut pool);

        assert_eq!(subjects(&chain), ["CN=leaf", "CN=a", "CN=b"]);
        assert!(pool.is_empty());
    }

    #[test]
    fn self_issued_signer_is_its_own_chain() {
        let root = cert("CN=root", None);
        let other = cert("CN=root", None);

        let mut pool = vec![&other];
        let chain = build_chain(&root, &mut pool);

        assert_eq!(chain.len(), 1);
        assert_eq!(pool.len(), 1);
    }
}

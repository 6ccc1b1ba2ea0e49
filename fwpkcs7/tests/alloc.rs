// SPDX-FileCopyrightText: 2025 fwpkcs7 contributors
// SPDX-License-Identifier: GPL-3.0-only

//! Every operation must release everything it allocated, whether it succeeds
//! or fails. Allocations are counted per thread so that tests running in
//! parallel do not disturb each other.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::Cell,
    sync::OnceLock,
    time::Duration,
};

use fwpkcs7::{
    crypto::{self, CertIssuer, DigestAlgorithm},
    format::{certlist::CertList, envelope},
    pkcs7::{SignedDataBlob, sign::SignedDataBuilder, signature, signers, verify},
};
use rand::{SeedableRng, rngs::StdRng};
use x509_cert::der::Encode;

struct CountingAllocator;

thread_local! {
    static LIVE: Cell<isize> = const { Cell::new(0) };
}

fn adjust(delta: isize) {
    // Fails only during thread teardown.
    let _ = LIVE.try_with(|live| live.set(live.get() + delta));
}

fn live() -> isize {
    LIVE.with(Cell::get)
}

unsafe impl GlobalAlloc for CountingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc(layout) };
        if !ptr.is_null() {
            adjust(1);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { System.alloc_zeroed(layout) };
        if !ptr.is_null() {
            adjust(1);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { System.dealloc(ptr, layout) };
        adjust(-1);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

#[global_allocator]
static ALLOCATOR: CountingAllocator = CountingAllocator;

const CONTENT: &[u8] = b"capsule payload";

struct Blobs {
    root: Vec<u8>,
    /// Leaf signer, intermediate embedded.
    signed: Vec<u8>,
    /// Same, without the ContentInfo wrapper.
    bare: Vec<u8>,
    /// Two signers.
    multi: Vec<u8>,
}

fn blobs() -> &'static Blobs {
    static BLOBS: OnceLock<Blobs> = OnceLock::new();

    BLOBS.get_or_init(|| {
        let mut rng = StdRng::seed_from_u64(7);
        let root_key = crypto::generate_rsa_key_pair_with_rng(&mut rng, 1024).unwrap();
        let leaf_key = crypto::generate_rsa_key_pair_with_rng(&mut rng, 1024).unwrap();
        let validity = crypto::validity_from_now(Duration::from_secs(3600)).unwrap();

        let root =
            crypto::generate_cert(&root_key, None, 1, validity.clone(), "CN=Root", true).unwrap();
        let leaf = crypto::generate_cert(
            &leaf_key,
            Some(CertIssuer {
                cert: &root,
                key: &root_key,
            }),
            2,
            validity,
            "CN=Leaf",
            false,
        )
        .unwrap();

        let builder = SignedDataBuilder::new(CONTENT)
            .signer(&leaf_key, &leaf, DigestAlgorithm::Sha256, true)
            .extra_cert(&root);

        Blobs {
            root: root.to_der().unwrap(),
            signed: builder.build_der().unwrap(),
            bare: builder.build_bare_der().unwrap(),
            multi: builder
                .signer(&root_key, &root, DigestAlgorithm::Sha256, false)
                .build_der()
                .unwrap(),
        }
    })
}

/// Run `f` once to settle lazy initialization, then check that a second run
/// leaves no allocation behind.
fn assert_balanced<T>(name: &str, f: impl Fn() -> T) {
    drop(f());

    let before = live();
    drop(f());
    let after = live();

    assert_eq!(after, before, "{name}: allocations not released");
}

#[test]
fn envelope_releases_memory() {
    let blobs = blobs();

    assert_balanced("wrapped", || envelope::normalize(&blobs.signed));
    assert_balanced("bare", || envelope::normalize(&blobs.bare));
    assert_balanced("short", || envelope::normalize(&blobs.bare[..8]));
    assert_balanced("oversized", || envelope::wrap(&[0u8; 70_000]));
}

#[test]
fn cert_list_releases_memory() {
    let blobs = blobs();

    assert_balanced("build", || CertList::from_der_certs([&blobs.root, &blobs.root]));
    assert_balanced("parse", || {
        let list = CertList::from_der_certs([&blobs.root]).unwrap().unwrap();
        CertList::from_bytes(list.into_bytes())
    });
    assert_balanced("truncated", || CertList::from_bytes(vec![1, 9, 0, 0, 0, 1]));
}

#[test]
fn extraction_releases_memory() {
    let blobs = blobs();
    let mut garbage = blobs.signed.clone();
    garbage.truncate(garbage.len() / 2);

    for (name, data) in [
        ("signed", blobs.signed.as_slice()),
        ("bare", blobs.bare.as_slice()),
        ("multi", blobs.multi.as_slice()),
        ("garbage", garbage.as_slice()),
    ] {
        assert_balanced(name, || SignedDataBlob::decode(data));
        assert_balanced(name, || signers::get_signers(data));
        assert_balanced(name, || signers::get_certificates_list(data));
        assert_balanced(name, || signature::get_signature(data));
        assert_balanced(name, || {
            let mut buf = [0u8; 16];
            signature::copy_signature(data, Some(&mut buf))
        });
    }
}

#[test]
fn verification_releases_memory() {
    let blobs = blobs();

    assert!(verify::verify(&blobs.signed, &blobs.root, CONTENT));
    assert!(!verify::verify(&blobs.signed, &blobs.root, b"tampered"));

    assert_balanced("success", || verify::verify(&blobs.signed, &blobs.root, CONTENT));
    assert_balanced("bare", || verify::verify(&blobs.bare, &blobs.root, CONTENT));
    assert_balanced("tampered", || {
        verify::verify(&blobs.signed, &blobs.root, b"tampered")
    });
    assert_balanced("bad trusted cert", || {
        verify::verify(&blobs.signed, &blobs.root[..32], CONTENT)
    });
    assert_balanced("empty", || verify::verify(&[], &blobs.root, CONTENT));
}

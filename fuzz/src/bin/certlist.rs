#[cfg(not(windows))]
mod fuzz {
    use fwpkcs7::format::certlist::CertList;
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                if let Ok(list) = CertList::from_bytes(data.to_vec()) {
                    let rebuilt = CertList::from_der_certs(list.iter()).unwrap();
                    assert_eq!(rebuilt.as_ref().map(|l| l.as_bytes()), Some(data));
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}

#[cfg(not(windows))]
mod fuzz {
    use fwpkcs7::pkcs7::{signature, signers};
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let _ = signers::get_signers(data);
                let _ = signers::get_certificates_list(data);
                let _ = signature::get_signature(data);

                if let Ok(len) = signature::copy_signature(data, None) {
                    let mut buf = vec![0u8; len];
                    assert_eq!(signature::copy_signature(data, Some(&mut buf)).ok(), Some(len));
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}

#[cfg(not(windows))]
mod fuzz {
    use fwpkcs7::pkcs7::verify;
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                // First byte splits the input into the signed blob and the
                // trusted certificate.
                let Some((&split, rest)) = data.split_first() else {
                    return;
                };
                let (signed, trusted) = rest.split_at(usize::from(split).min(rest.len()));

                let _ = verify::verify(signed, trusted, b"");
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}

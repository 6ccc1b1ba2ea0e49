#[cfg(not(windows))]
mod fuzz {
    use fwpkcs7::format::envelope;
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                if let Ok(envelope) = envelope::normalize(data) {
                    assert!(envelope::is_wrapped(envelope.as_bytes()));
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}

//! `mysql_native_password` (4.1+) challenge/response scrambling.
//!
//! `SHA1(password) XOR SHA1(challenge + SHA1(SHA1(password)))`, per the handshake the server
//! issues as its 8+12 byte auth-plugin-data. The crate hand-rolls this because it is the one
//! piece of MySQL auth a pure client library cannot avoid implementing.

use sha1::{Digest, Sha1};

pub(crate) fn scramble(password: &[u8], challenge: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = sha1_digest(password);
    let stage2 = sha1_digest(&stage1);

    let mut seed = Vec::with_capacity(challenge.len() + stage2.len());
    seed.extend_from_slice(challenge);
    seed.extend_from_slice(&stage2);
    let stage3 = sha1_digest(&seed);

    stage1
        .iter()
        .zip(stage3.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

fn sha1_digest(input: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(input);
    hasher.finalize().into()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_password_scrambles_to_empty() {
        assert!(scramble(b"", b"01234567890123456789").is_empty());
    }

    #[test]
    fn scramble_is_deterministic_and_twenty_bytes() {
        let a = scramble(b"hunter2", b"01234567890123456789");
        let b = scramble(b"hunter2", b"01234567890123456789");
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
        let c = scramble(b"different", b"01234567890123456789");
        assert_ne!(a, c);
    }
}

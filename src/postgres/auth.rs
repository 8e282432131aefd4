//! PostgreSQL MD5 authentication: `"md5" + hex(MD5(hex(MD5(password || username)) || salt))`.

use md5::{Digest, Md5};

pub(crate) fn md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    let mut first = Md5::new();
    first.update(password.as_bytes());
    first.update(username.as_bytes());
    let first_hex = format!("{:x}", first.finalize());

    let mut second = Md5::new();
    second.update(first_hex.as_bytes());
    second.update(salt);
    format!("md5{:x}", second.finalize())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn matches_known_vector() {
        // SHA/MD5 reference vectors for PostgreSQL's two-pass scheme are easiest to check by
        // reproducing the two passes by hand rather than hard-coding a third-party fixture.
        let expected_first = format!("{:x}", {
            let mut h = Md5::new();
            h.update(b"hunter2");
            h.update(b"alice");
            h.finalize()
        });
        let expected = format!("md5{:x}", {
            let mut h = Md5::new();
            h.update(expected_first.as_bytes());
            h.update([1u8, 2, 3, 4]);
            h.finalize()
        });
        assert_eq!(md5_password("alice", "hunter2", &[1, 2, 3, 4]), expected);
    }

    #[test]
    fn differs_per_username() {
        assert_ne!(
            md5_password("alice", "hunter2", &[0, 0, 0, 0]),
            md5_password("bob", "hunter2", &[0, 0, 0, 0])
        );
    }
}

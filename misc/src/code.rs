use anyhow::{bail, Result};
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

#[inline(always)]
pub fn base64_encode<T>(input: T) -> String
where
    T: AsRef<[u8]>,
{
    BASE64_STANDARD.encode(input)
}

#[inline(always)]
pub fn base64_decode<T>(input: T) -> Result<Vec<u8>>
where
    T: AsRef<[u8]>,
{
    match BASE64_STANDARD.decode(input) {
        Ok(data) => Ok(data),
        Err(_) => bail!("invalid base64 string"),
    }
}

/// Returns the lowercase hex sha256 digest of the input.
#[inline(always)]
pub fn sha256<T>(input: T) -> String
where
    T: AsRef<[u8]>,
{
    let hash = Sha256::digest(input);
    format!("{hash:x}")
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    buf
}

/// Compares two byte strings without short-circuiting on the first
/// mismatch. Both inputs must be digests of equal length for the
/// comparison to be meaningful.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64() {
        let data = b"Hello, World!";
        let encoded = base64_encode(data);
        assert_eq!(encoded, "SGVsbG8sIFdvcmxkIQ==");
        let decoded = base64_decode(&encoded).unwrap();
        assert_eq!(decoded, data);

        assert!(base64_decode("not base64!!").is_err());
    }

    #[test]
    fn test_sha256() {
        assert_eq!(
            sha256("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_random_bytes() {
        let a = random_bytes(32);
        let b = random_bytes(32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abcd", b"abcd"));
        assert!(!constant_time_eq(b"abcd", b"abce"));
        assert!(!constant_time_eq(b"abcd", b"abc"));
    }
}

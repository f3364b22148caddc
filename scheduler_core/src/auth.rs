//! `auth_code(secret, sign) = SHA1(XOR(sign, secret))`, rendered as lowercase
//! hex. The client handshake, the node handshake, and node rediscovery all
//! use this identical derivation so that either side can verify the other
//! without a shared session key beyond the static secret.
use sha1::{Digest, Sha1};

/// XORs `a` against `b`, cycling the shorter of the two over the length of
/// the longer one: the per-connection `sign` nonce is XORed against the
/// long-lived cluster or node secret.
pub fn xor_bytes(a: &[u8], b: &[u8]) -> Vec<u8> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| a[i % a.len()] ^ b[i % b.len()])
        .collect()
}

/// Computes the auth token used to authenticate a connection: the SHA1 hex
/// digest of `sign` XORed with `secret`.
pub fn auth_code(secret: &[u8], sign: &[u8]) -> String {
    let xored = xor_bytes(sign, secret);
    let mut hasher = Sha1::new();
    hasher.update(&xored);
    hex::encode(hasher.finalize())
}

/// Generates a fresh random `sign` nonce, used once per scheduler process
/// lifetime (persisted to `<dest_prefix>/config`) and re-used for every
/// PONG/CLIENT hello comparison.
pub fn random_sign() -> Vec<u8> {
    use rand::RngCore;
    let mut sign = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut sign);
    sign
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_bytes_is_symmetric_under_matching_lengths() {
        let a = b"abcd";
        let b = b"wxyz";
        let ab = xor_bytes(a, b);
        let ba = xor_bytes(b, a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn xor_bytes_cycles_shorter_operand() {
        let a = b"ab";
        let b = b"abcdef";
        let out = xor_bytes(a, b);
        assert_eq!(out.len(), 6);
        assert_eq!(out[0], a[0] ^ b[0]);
        assert_eq!(out[2], a[0] ^ b[2]);
    }

    #[test]
    fn auth_code_is_deterministic_and_both_sides_agree() {
        let secret = b"cluster-secret";
        let sign = random_sign();
        let ours = auth_code(secret, &sign);
        let theirs = auth_code(secret, &sign);
        assert_eq!(ours, theirs);
        assert_eq!(ours.len(), 40); // sha1 hex digest
    }

    #[test]
    fn auth_code_differs_for_different_secrets() {
        let sign = random_sign();
        let a = auth_code(b"secret-a", &sign);
        let b = auth_code(b"secret-b", &sign);
        assert_ne!(a, b);
    }
}

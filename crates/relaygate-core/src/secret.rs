//! Secrets and generated names for ephemeral relay identities.

use rand::Rng;
use ring::constant_time;
use ring::rand::{SecureRandom, SystemRandom};

/// Characters used for generated hostnames. Omits look-alikes (0/o, 1/l/i, s/5, u/v).
pub const NAME_ALPHABET: &[u8] = b"23456789abcdefghjkmnpqrtvwxyz";

/// Generate a random opaque secret (16 bytes, hex encoded).
pub fn generate_secret() -> String {
    let rng = SystemRandom::new();
    let mut secret = [0u8; 16];
    if rng.fill(&mut secret).is_err() {
        // SystemRandom only fails if the OS source is unavailable; fall back to
        // the thread RNG rather than issuing an all-zero secret.
        rand::thread_rng().fill(&mut secret[..]);
    }
    hex::encode(secret)
}

/// Generate a name of `len` characters drawn from [`NAME_ALPHABET`].
pub fn generate_name(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| NAME_ALPHABET[rng.gen_range(0..NAME_ALPHABET.len())] as char)
        .collect()
}

/// Compare two secrets without leaking where they differ.
pub fn secrets_match(expected: &str, provided: &str) -> bool {
    constant_time::verify_slices_are_equal(expected.as_bytes(), provided.as_bytes()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_hex_and_unique() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn name_uses_alphabet_only() {
        for _ in 0..20 {
            let name = generate_name(8);
            assert_eq!(name.len(), 8);
            assert!(name.bytes().all(|c| NAME_ALPHABET.contains(&c)));
        }
    }

    #[test]
    fn match_requires_exact_secret() {
        assert!(secrets_match("hunter2", "hunter2"));
        assert!(!secrets_match("hunter2", "hunter3"));
        assert!(!secrets_match("hunter2", "hunter"));
        assert!(!secrets_match("hunter2", ""));
    }
}

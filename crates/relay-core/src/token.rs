//! Random token generation for pairing and auth secrets.
//!
//! Tokens are fixed-length alphanumeric strings drawn from the OS-seeded
//! thread RNG.  They are compared by plain equality; brute-force hardening is
//! intentionally out of scope on a trusted LAN.

use rand::{distributions::Alphanumeric, Rng};

/// Length of pairing and auth tokens in characters.
pub const TOKEN_LEN: usize = 32;

/// Generates a random alphanumeric token of the given length.
pub fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_token_has_requested_length() {
        assert_eq!(generate_token(TOKEN_LEN).len(), TOKEN_LEN);
        assert_eq!(generate_token(8).len(), 8);
    }

    #[test]
    fn test_generate_token_is_alphanumeric() {
        let token = generate_token(TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_generate_token_produces_distinct_values() {
        // Two 32-character random tokens colliding would indicate a broken RNG.
        assert_ne!(generate_token(TOKEN_LEN), generate_token(TOKEN_LEN));
    }
}

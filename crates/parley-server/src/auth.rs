//! Credential hashing collaborator.
//!
//! Kept behind a trait so deployments can swap in a real KDF without
//! touching the router. The default implementation is salted BLAKE3 —
//! adequate for a hobby deployment, easy to replace for anything else.

use rand::RngCore;

/// Pure-function collaborator for password hashing and verification.
pub trait CredentialVerifier: Send + Sync {
    fn hash_password(&self, password: &str) -> String;
    fn verify(&self, password: &str, stored_hash: &str) -> bool;
}

/// Salted BLAKE3 hashing: `salt_hex$digest_hex`.
#[derive(Debug, Default)]
pub struct Blake3Verifier;

impl Blake3Verifier {
    fn digest(salt: &[u8], password: &str) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(salt);
        hasher.update(password.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

impl CredentialVerifier for Blake3Verifier {
    fn hash_password(&self, password: &str) -> String {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let salt_hex: String = salt.iter().map(|b| format!("{b:02x}")).collect();
        format!("{salt_hex}${}", Self::digest(&salt, password))
    }

    fn verify(&self, password: &str, stored_hash: &str) -> bool {
        let Some((salt_hex, digest)) = stored_hash.split_once('$') else {
            return false;
        };
        if salt_hex.len() % 2 != 0 {
            return false;
        }
        let mut salt = Vec::with_capacity(salt_hex.len() / 2);
        for i in (0..salt_hex.len()).step_by(2) {
            match u8::from_str_radix(&salt_hex[i..i + 2], 16) {
                Ok(b) => salt.push(b),
                Err(_) => return false,
            }
        }
        Self::digest(&salt, password) == digest
    }
}

/// A hash no password can verify against. Used for internal identities
/// (the AI participant) that must never log in.
pub fn unusable_hash() -> String {
    "!".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_verify_round_trip() {
        let verifier = Blake3Verifier;
        let hash = verifier.hash_password("hunter2");
        assert!(verifier.verify("hunter2", &hash));
        assert!(!verifier.verify("hunter3", &hash));
    }

    #[test]
    fn hashes_are_salted() {
        let verifier = Blake3Verifier;
        let a = verifier.hash_password("same");
        let b = verifier.hash_password("same");
        assert_ne!(a, b);
        assert!(verifier.verify("same", &a));
        assert!(verifier.verify("same", &b));
    }

    #[test]
    fn unusable_hash_never_verifies() {
        let verifier = Blake3Verifier;
        assert!(!verifier.verify("", &unusable_hash()));
        assert!(!verifier.verify("!", &unusable_hash()));
    }
}

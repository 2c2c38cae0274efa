//! Startup self-tests for the cryptographic primitives and the system RNG.

use std::sync::Mutex;

use dualchain_primitives::{hash_to_hex, sha256, Hash256};
use rand::RngCore;
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};

const SHA256_ABC: &str = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";

/// Owns the secp256k1 context between startup and shutdown.
#[derive(Default)]
pub struct CryptoContext {
    secp: Mutex<Option<Secp256k1<All>>>,
}

impl CryptoContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the context and runs every self-test against it.
    pub fn start(&self) -> Result<(), String> {
        let secp = Secp256k1::new();
        sha256_self_test()?;
        ecc_self_test(&secp)?;
        rng_self_test()?;
        *self.secp.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(secp);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.secp
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Returns whether a context was released.
    pub fn stop(&self) -> bool {
        self.secp
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .is_some()
    }
}

pub fn sha256_self_test() -> Result<(), String> {
    let digest = hash_to_hex(&reversed(sha256(b"abc")));
    if digest != SHA256_ABC {
        return Err(format!("SHA256 self-test failed: got {digest}"));
    }
    Ok(())
}

/// Signs and verifies with a fresh key, then checks a tampered message is refused.
pub fn ecc_self_test(secp: &Secp256k1<All>) -> Result<(), String> {
    let mut rng = rand::thread_rng();
    let secret = loop {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        if let Ok(secret) = SecretKey::from_slice(&bytes) {
            break secret;
        }
    };
    let public = PublicKey::from_secret_key(secp, &secret);
    let digest = sha256(b"dualchain elliptic curve sanity check");
    let message = Message::from_digest(digest);
    let signature = secp.sign_ecdsa(&message, &secret);
    secp.verify_ecdsa(&message, &signature, &public)
        .map_err(|err| format!("Elliptic curve cryptography sanity check failure: {err}"))?;

    let mut tampered = digest;
    tampered[0] ^= 0x01;
    if secp
        .verify_ecdsa(&Message::from_digest(tampered), &signature, &public)
        .is_ok()
    {
        return Err("Elliptic curve cryptography sanity check failure: forged signature accepted".to_string());
    }
    Ok(())
}

/// Two consecutive draws must be non-zero and distinct.
pub fn rng_self_test() -> Result<(), String> {
    let mut rng = rand::thread_rng();
    let mut first = [0u8; 32];
    let mut second = [0u8; 32];
    rng.fill_bytes(&mut first);
    rng.fill_bytes(&mut second);
    if first == [0u8; 32] || second == [0u8; 32] || first == second {
        return Err("OS cryptographic RNG sanity check failure".to_string());
    }
    Ok(())
}

/// `hash_to_hex` prints in display (reversed) byte order.
fn reversed(mut hash: Hash256) -> Hash256 {
    hash.reverse();
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_runs_self_tests_and_stops_once() {
        let crypto = CryptoContext::new();
        crypto.start().expect("sanity");
        assert!(crypto.is_started());
        assert!(crypto.stop());
        assert!(!crypto.stop());
    }

    #[test]
    fn individual_checks_pass() {
        sha256_self_test().expect("sha256");
        rng_self_test().expect("rng");
        ecc_self_test(&Secp256k1::new()).expect("ecc");
    }
}

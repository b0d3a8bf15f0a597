//! Tunnel key agreement and symmetric encryption.
//!
//! Each side of a tunnel generates a fresh X25519 key pair, exchanges public
//! keys over the relay, and derives a session key from the shared secret and
//! a hash of the pre-shared key both sides already know out-of-band
//! (spec.md §4.4/§9). The relay only ever forwards opaque bytes.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::error::CryptoError;

/// HKDF `info` label, kept identical to the original implementation's value
/// so a session key derived here matches one derived by an unmodified peer.
const SESSION_INFO: &[u8] = b"oldie-goldie-secure-chat-session";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// A fresh, single-use X25519 key pair for one tunnel handshake.
pub struct KeyPair {
    secret: EphemeralSecret,
    pub public: PublicKey,
}

/// Generates a new ephemeral key pair. Never reused across tunnels.
pub fn generate_keypair() -> KeyPair {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    KeyPair { secret, public }
}

impl KeyPair {
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Consumes this key pair to compute the Diffie-Hellman shared secret
    /// with a peer's public key. A `KeyPair` is single-use by construction,
    /// matching `EphemeralSecret`'s own one-shot contract.
    pub fn diffie_hellman(self, peer_public_bytes: &[u8; 32]) -> [u8; 32] {
        let peer_public = PublicKey::from(*peer_public_bytes);
        self.secret.diffie_hellman(&peer_public).to_bytes()
    }
}

/// SHA-256 of the pre-shared key text, used as the HKDF salt.
pub fn hash_psk(psk: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(psk.as_bytes());
    hasher.finalize().into()
}

/// Derives the 32-byte AES-256-GCM session key from the X25519 shared secret
/// and the PSK hash, via HKDF-SHA256.
pub fn derive_session_key(shared_secret: &[u8; 32], psk_hash: &[u8; 32]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(psk_hash), shared_secret);
    let mut session_key = [0u8; 32];
    hk.expand(SESSION_INFO, &mut session_key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    session_key
}

/// Encrypts `plaintext` under `session_key`, returning
/// `nonce(12) || tag(16) || ciphertext(N)`.
///
/// Unlike the original implementation this does not PKCS7-pad the plaintext
/// first: AES-GCM is a stream cipher construction and needs no block
/// alignment, so the padding step was dropped as dead weight rather than
/// ported.
pub fn encrypt(session_key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(session_key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    // RustCrypto's `encrypt` returns `ciphertext || tag`; split the tag off
    // so it can be placed ahead of the ciphertext on the wire per spec.
    let mut ciphertext = cipher
        .encrypt(nonce, plaintext)
        .expect("encryption cannot fail with a correctly sized key and nonce");
    let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);

    let mut out = Vec::with_capacity(NONCE_LEN + TAG_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&tag);
    out.extend_from_slice(&ciphertext);
    out
}

/// Decrypts a `nonce(12) || tag(16) || ciphertext(N)` frame produced by
/// [`encrypt`]. Returns [`CryptoError::AuthenticationFailed`] if the tag does
/// not verify, and never leaks partial plaintext in that case.
pub fn decrypt(session_key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::Truncated);
    }
    let (nonce_bytes, rest) = data.split_at(NONCE_LEN);
    let (tag, ciphertext) = rest.split_at(TAG_LEN);

    let mut ciphertext_and_tag = Vec::with_capacity(ciphertext.len() + TAG_LEN);
    ciphertext_and_tag.extend_from_slice(ciphertext);
    ciphertext_and_tag.extend_from_slice(tag);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(session_key));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext_and_tag.as_ref())
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_secret_agrees_from_either_side() {
        let alice = generate_keypair();
        let bob = generate_keypair();
        let alice_public = alice.public_bytes();
        let bob_public = bob.public_bytes();

        let alice_secret = alice.diffie_hellman(&bob_public);
        let bob_secret = bob.diffie_hellman(&alice_public);
        assert_eq!(alice_secret, bob_secret);
    }

    #[test]
    fn session_key_derivation_agrees_given_the_same_psk() {
        let alice = generate_keypair();
        let bob = generate_keypair();
        let alice_public = alice.public_bytes();
        let bob_public = bob.public_bytes();
        let psk_hash = hash_psk("correct horse battery staple");

        let alice_shared = alice.diffie_hellman(&bob_public);
        let bob_shared = bob.diffie_hellman(&alice_public);

        let alice_key = derive_session_key(&alice_shared, &psk_hash);
        let bob_key = derive_session_key(&bob_shared, &psk_hash);
        assert_eq!(alice_key, bob_key);
    }

    #[test]
    fn different_psks_derive_different_session_keys() {
        let shared = [7u8; 32];
        let key_a = derive_session_key(&shared, &hash_psk("one"));
        let key_b = derive_session_key(&shared, &hash_psk("two"));
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn encrypt_decrypt_round_trips() {
        let key = [1u8; 32];
        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let frame = encrypt(&key, plaintext);
        let recovered = decrypt(&key, &frame).unwrap();
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn wire_layout_places_nonce_then_tag_then_ciphertext() {
        let key = [2u8; 32];
        let plaintext = b"hello";
        let frame = encrypt(&key, plaintext);
        assert_eq!(frame.len(), NONCE_LEN + TAG_LEN + plaintext.len());
    }

    #[test]
    fn decrypt_fails_under_the_wrong_key() {
        let frame = encrypt(&[3u8; 32], b"secret message");
        let result = decrypt(&[4u8; 32], &frame);
        assert!(matches!(result, Err(CryptoError::AuthenticationFailed)));
    }

    #[test]
    fn decrypt_fails_on_truncated_input() {
        let result = decrypt(&[5u8; 32], &[0u8; 4]);
        assert!(matches!(result, Err(CryptoError::Truncated)));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let key = [6u8; 32];
        let mut frame = encrypt(&key, b"do not trust this byte");
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(matches!(decrypt(&key, &frame), Err(CryptoError::AuthenticationFailed)));
    }
}

//! Crypto provider
//!
//! The narrow interface the engine sees key material through: BLAKE3
//! hashing, Ed25519 signing, X25519 sealing (asymmetric, used only to
//! wrap group symmetric keys), and XChaCha20-Poly1305 for private
//! transaction payloads. All operations are deterministic given their
//! inputs; any tamper surfaces as `CryptoError` and callers treat the
//! affected transaction as invalid.

use crate::types::{Hash, SealingPub, ShortHash, Signature, SigningPub};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Nonce length for sealing and symmetric encryption (XChaCha20).
pub const NONCE_LEN: usize = 24;

/// Errors from the crypto provider
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key material")]
    InvalidKey,

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("encryption failed")]
    EncryptFailed,
}

/// Collision-resistant 32-byte content hash.
pub fn hash(bytes: &[u8]) -> Hash {
    Hash(*blake3::hash(bytes).as_bytes())
}

/// Truncated hash for in-memory dedup keys.
pub fn short_hash(bytes: &[u8]) -> ShortHash {
    let full = blake3::hash(bytes);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full.as_bytes()[..16]);
    ShortHash(out)
}

/// Uniqueness nonces and key seeds.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

/// Ed25519 keypair that signs session chain hashes.
#[derive(Clone)]
pub struct SigningKeypair {
    key: SigningKey,
}

impl SigningKeypair {
    /// Generate a keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Rebuild a keypair from a stored 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    pub fn public(&self) -> SigningPub {
        SigningPub(self.key.verifying_key().to_bytes())
    }

    /// The 32-byte seed, for persistence. Wrap in `Zeroizing` at call sites.
    pub fn seed(&self) -> [u8; 32] {
        self.key.to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.key.sign(message).to_bytes())
    }
}

/// Verify a signature against a verifying key.
pub fn verify(public: &SigningPub, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(&public.0).map_err(|_| CryptoError::InvalidKey)?;
    let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
    key.verify(message, &sig)
        .map_err(|_| CryptoError::SignatureInvalid)
}

// ---------------------------------------------------------------------------
// Sealing
// ---------------------------------------------------------------------------

/// X25519 keypair used to seal symmetric keys to a member.
#[derive(Clone)]
pub struct SealingKeypair {
    secret: x25519_dalek::StaticSecret,
}

impl SealingKeypair {
    pub fn generate() -> Self {
        Self {
            secret: x25519_dalek::StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            secret: x25519_dalek::StaticSecret::from(*seed),
        }
    }

    pub fn public(&self) -> SealingPub {
        SealingPub(x25519_dalek::PublicKey::from(&self.secret).to_bytes())
    }

    pub fn seed(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }
}

fn sealing_aead(
    ours: &SealingKeypair,
    theirs: &SealingPub,
    nonce: &[u8; NONCE_LEN],
) -> Result<XChaCha20Poly1305, CryptoError> {
    let shared = ours
        .secret
        .diffie_hellman(&x25519_dalek::PublicKey::from(theirs.0));
    let hk = Hkdf::<Sha256>::new(Some(nonce), shared.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(b"cojson/seal", &mut *key)
        .map_err(|_| CryptoError::InvalidKey)?;
    Ok(XChaCha20Poly1305::new((&*key).into()))
}

/// Authenticated asymmetric encryption of `plaintext` from `from` to the
/// holder of `to`.
pub fn seal(
    to: &SealingPub,
    from: &SealingKeypair,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let aead = sealing_aead(from, to, nonce)?;
    aead.encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptFailed)
}

/// Inverse of [`seal`]; fails on any tamper or key mismatch.
pub fn unseal(
    from: &SealingPub,
    to: &SealingKeypair,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let aead = sealing_aead(to, from, nonce)?;
    aead.decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}

// ---------------------------------------------------------------------------
// Symmetric encryption
// ---------------------------------------------------------------------------

/// A symmetric key epoch's secret. Wiped from memory on drop; never
/// crosses the storage interface in plaintext.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymKey(pub(crate) [u8; 32]);

impl SymKey {
    pub fn generate() -> Self {
        Self(random_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SymKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymKey(..)")
    }
}

/// AEAD-encrypt a private transaction payload.
pub fn encrypt(
    key: &SymKey,
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    XChaCha20Poly1305::new((&key.0).into())
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::EncryptFailed)
}

/// Inverse of [`encrypt`]; fails on any tamper.
pub fn decrypt(
    key: &SymKey,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    XChaCha20Poly1305::new((&key.0).into())
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::DecryptFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash(b"cojson"), hash(b"cojson"));
        assert_ne!(hash(b"cojson"), hash(b"cojsom"));
        assert_eq!(short_hash(b"x").0, hash(b"x").0[..16]);
    }

    #[test]
    fn test_sign_and_verify() {
        let pair = SigningKeypair::generate();
        let sig = pair.sign(b"chain hash");
        assert!(verify(&pair.public(), b"chain hash", &sig).is_ok());
    }

    #[test]
    fn test_verify_tampered_fails() {
        let pair = SigningKeypair::generate();
        let sig = pair.sign(b"original");
        assert_eq!(
            verify(&pair.public(), b"tampered", &sig),
            Err(CryptoError::SignatureInvalid)
        );
    }

    #[test]
    fn test_verify_wrong_key_fails() {
        let pair = SigningKeypair::generate();
        let other = SigningKeypair::generate();
        let sig = pair.sign(b"msg");
        assert!(verify(&other.public(), b"msg", &sig).is_err());
    }

    #[test]
    fn test_signing_seed_roundtrip() {
        let pair = SigningKeypair::generate();
        let rebuilt = SigningKeypair::from_seed(&pair.seed());
        assert_eq!(pair.public(), rebuilt.public());
    }

    #[test]
    fn test_seal_unseal() {
        let alice = SealingKeypair::generate();
        let bob = SealingKeypair::generate();
        let nonce = random_bytes::<NONCE_LEN>();

        let sealed = seal(&bob.public(), &alice, &nonce, b"epoch key").unwrap();
        let opened = unseal(&alice.public(), &bob, &nonce, &sealed).unwrap();
        assert_eq!(opened, b"epoch key");
    }

    #[test]
    fn test_unseal_wrong_recipient_fails() {
        let alice = SealingKeypair::generate();
        let bob = SealingKeypair::generate();
        let eve = SealingKeypair::generate();
        let nonce = random_bytes::<NONCE_LEN>();

        let sealed = seal(&bob.public(), &alice, &nonce, b"secret").unwrap();
        assert_eq!(
            unseal(&alice.public(), &eve, &nonce, &sealed),
            Err(CryptoError::DecryptFailed)
        );
    }

    #[test]
    fn test_symmetric_roundtrip() {
        let key = SymKey::generate();
        let nonce = random_bytes::<NONCE_LEN>();

        let ct = encrypt(&key, &nonce, b"changes").unwrap();
        assert_eq!(decrypt(&key, &nonce, &ct).unwrap(), b"changes");

        let mut tampered = ct.clone();
        tampered[0] ^= 0xff;
        assert_eq!(
            decrypt(&key, &nonce, &tampered),
            Err(CryptoError::DecryptFailed)
        );
    }

    #[test]
    fn test_symmetric_wrong_key_fails() {
        let key = SymKey::generate();
        let other = SymKey::generate();
        let nonce = random_bytes::<NONCE_LEN>();
        let ct = encrypt(&key, &nonce, b"payload").unwrap();
        assert!(decrypt(&other, &nonce, &ct).is_err());
    }
}

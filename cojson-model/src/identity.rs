//! Local agent identity and key files
//!
//! An agent holds the Ed25519 signing keypair that authenticates its
//! sessions and the X25519 sealing keypair that group key epochs are
//! wrapped under. The private halves live in a local key file and are
//! never replicated.

use crate::crypto::{SealingKeypair, SigningKeypair};
use crate::id::{AgentId, SessionId, SessionOwner};
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

/// Errors from identity handling
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid key file length: expected 64 bytes, got {0}")]
    InvalidKeyFileLength(usize),
}

/// The local secrets of one agent: signing + sealing keypairs.
#[derive(Clone)]
pub struct AgentSecret {
    signing: SigningKeypair,
    sealing: SealingKeypair,
}

impl AgentSecret {
    /// Generate a fresh agent from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing: SigningKeypair::generate(),
            sealing: SealingKeypair::generate(),
        }
    }

    /// Load from a key file, or generate and save if it doesn't exist.
    /// Returns (agent, is_new).
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<(Self, bool), IdentityError> {
        let path = path.as_ref();
        if path.exists() {
            Ok((Self::load(path)?, false))
        } else {
            let agent = Self::generate();
            agent.save(path)?;
            Ok((agent, true))
        }
    }

    /// Load an agent from a 64-byte key file (signing seed ‖ sealing seed).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let bytes = Zeroizing::new(fs::read(path)?);
        if bytes.len() != 64 {
            return Err(IdentityError::InvalidKeyFileLength(bytes.len()));
        }

        let mut signing_seed = Zeroizing::new([0u8; 32]);
        signing_seed.copy_from_slice(&bytes[..32]);
        let mut sealing_seed = Zeroizing::new([0u8; 32]);
        sealing_seed.copy_from_slice(&bytes[32..]);

        Ok(Self {
            signing: SigningKeypair::from_seed(&signing_seed),
            sealing: SealingKeypair::from_seed(&sealing_seed),
        })
    }

    /// Save the agent's private seeds to a key file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), IdentityError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut bytes = Zeroizing::new([0u8; 64]);
        bytes[..32].copy_from_slice(&self.signing.seed());
        bytes[32..].copy_from_slice(&self.sealing.seed());

        let mut file = fs::File::create(path)?;
        file.write_all(bytes.as_ref())?;
        Ok(())
    }

    /// The public identity of this agent.
    pub fn id(&self) -> AgentId {
        AgentId {
            sealing: self.sealing.public(),
            signing: self.signing.public(),
        }
    }

    pub fn signing(&self) -> &SigningKeypair {
        &self.signing
    }

    pub fn sealing(&self) -> &SealingKeypair {
        &self.sealing
    }

    /// Pick a fresh session for this process.
    ///
    /// Counters are random so two devices or tabs of the same account
    /// never collide; within the session, transaction indices provide
    /// the total order.
    pub fn new_session(&self, owner: SessionOwner) -> SessionId {
        let counter = u64::from_be_bytes(crate::crypto::random_bytes());
        SessionId::new(owner, counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_distinct() {
        let a = AgentSecret::generate();
        let b = AgentSecret::generate();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.key");

        let agent = AgentSecret::generate();
        agent.save(&path).unwrap();

        let loaded = AgentSecret::load(&path).unwrap();
        assert_eq!(agent.id(), loaded.id());
    }

    #[test]
    fn test_load_or_generate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.key");

        let (first, is_new) = AgentSecret::load_or_generate(&path).unwrap();
        assert!(is_new);

        let (second, is_new) = AgentSecret::load_or_generate(&path).unwrap();
        assert!(!is_new);
        assert_eq!(first.id(), second.id());
    }

    #[test]
    fn test_load_rejects_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.key");
        fs::write(&path, [0u8; 10]).unwrap();

        assert!(matches!(
            AgentSecret::load(&path),
            Err(IdentityError::InvalidKeyFileLength(10))
        ));
    }

    #[test]
    fn test_sessions_do_not_collide() {
        let agent = AgentSecret::generate();
        let owner = SessionOwner::Agent(agent.id());
        let a = agent.new_session(owner);
        let b = agent.new_session(owner);
        assert_ne!(a, b);
    }
}

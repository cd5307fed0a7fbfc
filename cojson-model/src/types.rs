//! Fixed-width byte tokens
//!
//! Hashes, keys, and signatures are opaque fixed-width byte strings.
//! Their textual form is base58 everywhere one is rendered — inside
//! `co_z…`/`sealer_z…`/`signer_z…` identifiers and on the wire — so
//! each token knows how to round-trip through that form itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from rebuilding a token out of untrusted bytes or text
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ByteTokenError {
    #[error("invalid base58")]
    Base58,

    #[error("wrong token length: expected {expected} bytes, got {got}")]
    Length { expected: usize, got: usize },
}

macro_rules! byte_token {
    ($name:ident[$len:expr], $doc:expr) => {
        #[doc = $doc]
        #[derive(
            Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[repr(transparent)]
        pub struct $name(#[serde(with = "serde_bytes")] pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// The base58 rendering used inside identifiers and frames.
            pub fn to_b58(&self) -> String {
                bs58::encode(&self.0).into_string()
            }

            /// Parse the base58 rendering back into the token.
            pub fn from_b58(s: &str) -> Result<Self, ByteTokenError> {
                let bytes = bs58::decode(s)
                    .into_vec()
                    .map_err(|_| ByteTokenError::Base58)?;
                Self::from_slice(&bytes)
            }

            /// Checked conversion from a borrowed slice.
            pub fn from_slice(bytes: &[u8]) -> Result<Self, ByteTokenError> {
                match <[u8; $len]>::try_from(bytes) {
                    Ok(arr) => Ok(Self(arr)),
                    Err(_) => Err(ByteTokenError::Length {
                        expected: $len,
                        got: bytes.len(),
                    }),
                }
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_b58())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_b58())
            }
        }
    };
}

byte_token!(Hash[32], "32-byte content hash (BLAKE3)");
byte_token!(
    ShortHash[16],
    "Truncated 16-byte hash for in-memory dedup keys"
);
byte_token!(SigningPub[32], "32-byte Ed25519 verifying key");
byte_token!(
    SealingPub[32],
    "32-byte X25519 public key used to seal symmetric keys to a member"
);
byte_token!(
    Signature[64],
    "64-byte Ed25519 signature over a session's running chain hash"
);

impl Hash {
    /// The chain hash before any transaction has been appended.
    pub const ZERO: Hash = Hash([0u8; 32]);
}

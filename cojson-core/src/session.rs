//! Session logs (append-only signed transaction chains)
//!
//! A session log manages a single session's append-only sequence of
//! transactions for one CoValue. Every transaction extends a running
//! chain hash, and the session's owner signs the chain head. Signatures
//! are cumulative: a new signature supersedes earlier ones, and only
//! the latest must verify. Earlier signatures are kept as checkpoints
//! so sync can stream partial chains that are still verifiable.

use crate::transaction::Transaction;
use cojson_model::crypto::{self, SigningKeypair};
use cojson_model::{Hash, SessionId, Signature, SigningPub};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur during session log operations
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionLogError {
    #[error("invalid sequence: log has {expected} transactions, content starts after {got}")]
    InvalidSequence { expected: u32, got: u32 },

    #[error("forked session: overlapping transactions do not match")]
    Forked,

    #[error("signature verification failed for session chain head")]
    SignatureInvalid,

    #[error("chain hash mismatch at index {0}")]
    ChainMismatch(u32),
}

/// Outcome of an append attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// New transactions were committed; indices `from..to`.
    Appended { from: u32, to: u32 },
    /// Every transaction in the batch was already present.
    AlreadyKnown,
}

/// Extend a running chain hash with one transaction.
fn chain_step(prev: &Hash, tx: &Transaction) -> Hash {
    let mut input = Vec::with_capacity(32 + 256);
    input.extend_from_slice(prev.as_bytes());
    input.extend_from_slice(&tx.canonical_bytes());
    crypto::hash(&input)
}

/// The ordered transactions of one (CoValue, session) pair plus the
/// trailing signature over the session's current chain hash.
#[derive(Clone, Debug)]
pub struct SessionLog {
    id: SessionId,
    transactions: Vec<Transaction>,
    last_hash: Hash,
    /// Signatures keyed by the transaction count they cover. The
    /// greatest entry is the trailing signature; earlier entries are
    /// checkpoints used to fragment outbound content.
    signatures: BTreeMap<u32, Signature>,
}

impl SessionLog {
    /// Create an empty log for a session.
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            transactions: Vec::new(),
            last_hash: Hash::ZERO,
            signatures: BTreeMap::new(),
        }
    }

    /// Rebuild a log from stored transactions, re-deriving the chain
    /// head. Local storage is trusted, so owner signatures are taken as
    /// stored rather than re-verified; `verify_full` remains available
    /// for integrity checks.
    pub fn rehydrate(
        id: SessionId,
        transactions: Vec<Transaction>,
        signatures: BTreeMap<u32, Signature>,
    ) -> Self {
        let mut head = Hash::ZERO;
        for tx in &transactions {
            head = chain_step(&head, tx);
        }
        Self {
            id,
            transactions,
            last_hash: head,
            signatures,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Number of transactions committed (also the next append index).
    pub fn count(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn last_hash(&self) -> &Hash {
        &self.last_hash
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Transactions with index > `after`, for sync deltas.
    pub fn transactions_after(&self, after: u32) -> &[Transaction] {
        let start = (after as usize).min(self.transactions.len());
        &self.transactions[start..]
    }

    /// The trailing signature, valid over the current chain head.
    pub fn latest_signature(&self) -> Option<&Signature> {
        self.signatures.values().next_back()
    }

    /// The signature covering exactly `count` transactions, if retained.
    pub fn signature_covering(&self, count: u32) -> Option<&Signature> {
        self.signatures.get(&count)
    }

    /// Counts at which a retained signature ends a verifiable prefix,
    /// strictly greater than `after`. Sync fragments content at these
    /// boundaries.
    pub fn checkpoints_after(&self, after: u32) -> impl Iterator<Item = u32> + '_ {
        self.signatures.range(after + 1..).map(|(count, _)| *count)
    }

    /// Validate and append a batch received from a peer or storage.
    ///
    /// `after` is the index the batch extends (the sender's view of our
    /// count). Overlapping transactions must byte-match what we already
    /// hold; wholly-known batches are a no-op. The signature must
    /// verify over the post-append chain head under `verifying`.
    /// All-or-nothing: on error the log is unchanged.
    pub fn try_append(
        &mut self,
        after: u32,
        txs: &[Transaction],
        signature: Signature,
        verifying: &SigningPub,
    ) -> Result<AppendOutcome, SessionLogError> {
        let count = self.count();
        if after > count {
            return Err(SessionLogError::InvalidSequence {
                expected: count,
                got: after,
            });
        }

        // Overlap from an idempotent redelivery: the shared prefix must
        // be identical, otherwise the session has forked.
        let skip = (count - after) as usize;
        for (i, tx) in txs.iter().take(skip).enumerate() {
            if self.transactions[after as usize + i] != *tx {
                return Err(SessionLogError::Forked);
            }
        }
        if skip >= txs.len() {
            return Ok(AppendOutcome::AlreadyKnown);
        }

        let new_txs = &txs[skip..];
        let mut head = self.last_hash;
        for tx in new_txs {
            head = chain_step(&head, tx);
        }

        crypto::verify(verifying, head.as_bytes(), &signature)
            .map_err(|_| SessionLogError::SignatureInvalid)?;

        self.transactions.extend_from_slice(new_txs);
        self.last_hash = head;
        let new_count = self.count();
        self.signatures.insert(new_count, signature);

        Ok(AppendOutcome::Appended {
            from: count,
            to: new_count,
        })
    }

    /// Append locally-authored transactions, signing the new chain head
    /// with the session owner's key. Returns the trailing signature for
    /// persistence and broadcast.
    pub fn append_local(&mut self, txs: &[Transaction], signer: &SigningKeypair) -> Signature {
        let mut head = self.last_hash;
        for tx in txs {
            head = chain_step(&head, tx);
        }
        let signature = signer.sign(head.as_bytes());

        self.transactions.extend_from_slice(txs);
        self.last_hash = head;
        self.signatures.insert(self.count(), signature);
        signature
    }

    /// Re-derive the whole chain and check the trailing signature.
    pub fn verify_full(&self, verifying: &SigningPub) -> Result<(), SessionLogError> {
        let mut head = Hash::ZERO;
        for tx in &self.transactions {
            head = chain_step(&head, tx);
        }
        if head != self.last_hash {
            return Err(SessionLogError::ChainMismatch(self.count()));
        }
        if let Some(sig) = self.latest_signature() {
            crypto::verify(verifying, head.as_bytes(), sig)
                .map_err(|_| SessionLogError::SignatureInvalid)?;
        }
        Ok(())
    }
}

//! CoValueCore: one CoValue's complete state
//!
//! Owns the immutable header and the set of session logs, ingests
//! batches from peers or storage, appends local writes, and derives the
//! kind-specific materialized view. Ingest checks structure (chain,
//! signature, dependencies); permission and decryption are evaluated
//! during the fold at each transaction's causal position, so verdicts
//! are a pure function of the transaction sets this replica holds and
//! replicas converge as those sets converge.

use crate::colist::ListView;
use crate::comap::MapView;
use crate::coplaintext::TextView;
use crate::costream::StreamView;
use crate::group::{GroupResolver, GroupView, Member};
use crate::header::{CoHeader, CoKind, Ruleset};
use crate::session::{AppendOutcome, SessionLog, SessionLogError};
use crate::transaction::{Transaction, TxBody};
use cojson_model::crypto::{SigningKeypair, SymKey};
use cojson_model::id::SessionOwner;
use cojson_model::{CausalKey, CoId, KeyId, SessionId, Signature, SigningPub};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors surfaced by transaction ingest.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum IngestError {
    #[error("session signature invalid")]
    SignatureInvalid,

    #[error("chain broken for {session}: have {expected}, content starts after {got}")]
    ChainBroken {
        session: SessionId,
        expected: u32,
        got: u32,
    },

    #[error("session fork detected for {0}")]
    Forked(SessionId),

    #[error("unknown dependency: {0}")]
    UnknownDependency(CoId),
}

/// Everything the core needs from the surrounding node while folding:
/// other groups' views, account signing keys, and unlocked epoch keys.
pub trait CoContext: GroupResolver {
    /// The signing key registered in an account's content.
    fn signing_key_of(&self, account: &CoId) -> Option<SigningPub>;

    /// An unlocked symmetric epoch key, if this replica has been sealed
    /// into the epoch.
    fn epoch_key(&self, key: &KeyId) -> Option<SymKey>;
}

/// A self-contained context for tests and single-shot folds.
#[derive(Default)]
pub struct StaticContext {
    pub groups: HashMap<CoId, Arc<GroupView>>,
    pub signers: HashMap<CoId, SigningPub>,
    pub keys: HashMap<KeyId, SymKey>,
}

impl GroupResolver for StaticContext {
    fn group_view(&self, id: &CoId) -> Option<Arc<GroupView>> {
        self.groups.get(id).cloned()
    }
}

impl CoContext for StaticContext {
    fn signing_key_of(&self, account: &CoId) -> Option<SigningPub> {
        self.signers.get(account).copied()
    }

    fn epoch_key(&self, key: &KeyId) -> Option<SymKey> {
        self.keys.get(key).cloned()
    }
}

/// The materialized view of a CoValue, by kind.
pub enum CoView {
    Map(MapView),
    List(ListView),
    Stream(StreamView),
    PlainText(TextView),
    /// Groups and accounts: the permission fold plus its map content.
    Group(GroupView),
}

impl CoView {
    pub fn as_map(&self) -> Option<&MapView> {
        match self {
            CoView::Map(v) => Some(v),
            CoView::Group(g) => Some(g.map()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListView> {
        match self {
            CoView::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&StreamView> {
        match self {
            CoView::Stream(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextView> {
        match self {
            CoView::PlainText(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_group(&self) -> Option<&GroupView> {
        match self {
            CoView::Group(g) => Some(g),
            _ => None,
        }
    }
}

/// Notification for one committed ingest batch.
#[derive(Clone, Debug)]
pub struct CoUpdate {
    pub id: CoId,
    pub session: SessionId,
    pub from: u32,
    pub to: u32,
}

/// Per-session summary advertised to peers.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    /// Whether the advertiser holds the header.
    pub header: bool,
    /// Last transaction count per session.
    pub sessions: BTreeMap<SessionId, u32>,
}

/// New transactions extending a peer's known state for one session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionNewContent {
    pub after: u32,
    pub transactions: Vec<Transaction>,
    #[serde(with = "sig_b58")]
    pub signature: Signature,
}

/// Signatures travel base58 on the wire, like every other token.
pub mod sig_b58 {
    use cojson_model::Signature;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &Signature, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&sig.to_b58())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Signature, D::Error> {
        let s = String::deserialize(deserializer)?;
        Signature::from_b58(&s).map_err(de::Error::custom)
    }
}

/// One CoValue: immutable header plus mutable session logs.
pub struct CoValueCore {
    id: CoId,
    header: CoHeader,
    sessions: HashMap<SessionId, SessionLog>,
    update_tx: broadcast::Sender<CoUpdate>,
}

impl CoValueCore {
    pub fn new(header: CoHeader) -> Self {
        let (update_tx, _) = broadcast::channel(64);
        Self {
            id: header.id(),
            header,
            sessions: HashMap::new(),
            update_tx,
        }
    }

    /// Rebuild a core from stored sessions. Chain hashes are re-derived
    /// by the session logs; signatures are taken as stored (local
    /// storage is trusted, unlike peers).
    pub fn from_parts(header: CoHeader, sessions: Vec<SessionLog>) -> Self {
        let mut core = Self::new(header);
        for log in sessions {
            core.sessions.insert(*log.id(), log);
        }
        core
    }

    pub fn id(&self) -> &CoId {
        &self.id
    }

    pub fn header(&self) -> &CoHeader {
        &self.header
    }

    pub fn kind(&self) -> CoKind {
        self.header.kind
    }

    pub fn sessions(&self) -> &HashMap<SessionId, SessionLog> {
        &self.sessions
    }

    /// Subscribe to committed-batch notifications. Exactly one event is
    /// published per committed batch; dropping the receiver
    /// unsubscribes without disturbing other subscribers.
    pub fn subscribe(&self) -> broadcast::Receiver<CoUpdate> {
        self.update_tx.subscribe()
    }

    /// The verifying key for a session, resolved through the context
    /// for account-owned sessions.
    fn verifying_key(
        &self,
        session: &SessionId,
        ctx: &dyn CoContext,
    ) -> Result<SigningPub, IngestError> {
        match &session.owner {
            SessionOwner::Agent(agent) => Ok(agent.signing),
            SessionOwner::Account(account) => ctx
                .signing_key_of(account)
                .ok_or(IngestError::UnknownDependency(*account)),
        }
    }

    /// Ingest a batch of transactions for one session, all-or-nothing.
    ///
    /// Structural validation happens here: dependency presence, index
    /// continuity, chain hashing, and the trailing signature. On commit
    /// subscribers are notified exactly once.
    pub fn ingest(
        &mut self,
        session: SessionId,
        after: u32,
        txs: &[Transaction],
        signature: Signature,
        ctx: &dyn CoContext,
    ) -> Result<AppendOutcome, IngestError> {
        // The governing group must be known before content is accepted,
        // otherwise permission verdicts could silently flip later.
        if let Some(group) = self.header.owner_group() {
            if ctx.group_view(group).is_none() {
                return Err(IngestError::UnknownDependency(*group));
            }
        }

        let verifying = self.verifying_key(&session, ctx)?;
        let log = self
            .sessions
            .entry(session)
            .or_insert_with(|| SessionLog::new(session));

        let outcome = log.try_append(after, txs, signature, &verifying).map_err(
            |err| match err {
                SessionLogError::InvalidSequence { expected, got } => IngestError::ChainBroken {
                    session,
                    expected,
                    got,
                },
                SessionLogError::Forked => IngestError::Forked(session),
                SessionLogError::SignatureInvalid | SessionLogError::ChainMismatch(_) => {
                    IngestError::SignatureInvalid
                }
            },
        )?;

        if let AppendOutcome::Appended { from, to } = outcome {
            let _ = self.update_tx.send(CoUpdate {
                id: self.id,
                session,
                from,
                to,
            });
        }
        Ok(outcome)
    }

    /// Append locally-authored transactions to our own session, signing
    /// the new chain head. Returns the trailing signature for storage
    /// and broadcast.
    pub fn append_local(
        &mut self,
        session: SessionId,
        txs: &[Transaction],
        signer: &SigningKeypair,
    ) -> Signature {
        let log = self
            .sessions
            .entry(session)
            .or_insert_with(|| SessionLog::new(session));
        let from = log.count();
        let signature = log.append_local(txs, signer);
        let to = log.count();

        let _ = self.update_tx.send(CoUpdate {
            id: self.id,
            session,
            from,
            to,
        });
        signature
    }

    /// Per-session counts for sync advertisement.
    pub fn known_state(&self) -> KnownState {
        KnownState {
            header: true,
            sessions: self
                .sessions
                .iter()
                .filter(|(_, log)| !log.is_empty())
                .map(|(id, log)| (*id, log.count()))
                .collect(),
        }
    }

    /// Content extending a peer's known sessions, one entry per session
    /// where we hold more. Fragmenting for backpressure happens in the
    /// sync engine using the logs' signature checkpoints.
    pub fn new_content_since(
        &self,
        known: &BTreeMap<SessionId, u32>,
    ) -> BTreeMap<SessionId, SessionNewContent> {
        let mut new = BTreeMap::new();
        for (session, log) in &self.sessions {
            let after = known.get(session).copied().unwrap_or(0);
            if log.count() > after {
                if let Some(signature) = log.latest_signature() {
                    new.insert(
                        *session,
                        SessionNewContent {
                            after,
                            transactions: log.transactions_after(after).to_vec(),
                            signature: *signature,
                        },
                    );
                }
            }
        }
        new
    }

    /// Like [`new_content_since`](Self::new_content_since), but split
    /// into fragments of at most `max_txs` transactions for
    /// backpressure. Fragments end at signature checkpoints so each one
    /// stays independently verifiable; a run without intermediate
    /// checkpoints ships whole under the trailing signature.
    pub fn content_fragments(
        &self,
        known: &BTreeMap<SessionId, u32>,
        max_txs: usize,
    ) -> Vec<BTreeMap<SessionId, SessionNewContent>> {
        let mut fragments = Vec::new();
        let mut current: BTreeMap<SessionId, SessionNewContent> = BTreeMap::new();
        let mut current_txs = 0usize;

        for (session, log) in &self.sessions {
            let start = known.get(session).copied().unwrap_or(0);
            if log.count() <= start || log.latest_signature().is_none() {
                continue;
            }

            // Runs may only end where a signature exists; the chain head
            // always qualifies.
            let mut boundaries: Vec<u32> = log.checkpoints_after(start).collect();
            if boundaries.last() != Some(&log.count()) {
                boundaries.push(log.count());
            }

            let mut cursor = start;
            while cursor < log.count() {
                // Greedily extend to the furthest boundary within the
                // budget; an unbroken over-budget run ships whole.
                let mut end = None;
                for &b in &boundaries {
                    if b <= cursor {
                        continue;
                    }
                    if (b - cursor) as usize <= max_txs {
                        end = Some(b);
                    } else {
                        break;
                    }
                }
                let end = end.unwrap_or_else(|| {
                    boundaries
                        .iter()
                        .copied()
                        .find(|b| *b > cursor)
                        .unwrap_or_else(|| log.count())
                });
                let Some(signature) = log.signature_covering(end).copied() else {
                    break;
                };

                let run = log.transactions()[cursor as usize..end as usize].to_vec();
                if current_txs > 0
                    && (current.contains_key(session) || current_txs + run.len() > max_txs)
                {
                    fragments.push(std::mem::take(&mut current));
                    current_txs = 0;
                }
                current_txs += run.len();
                current.insert(
                    *session,
                    SessionNewContent {
                        after: cursor,
                        transactions: run,
                        signature,
                    },
                );
                cursor = end;
            }
        }

        if !current.is_empty() {
            fragments.push(current);
        }
        fragments
    }

    /// All transactions in causal order, with session owners; cut off
    /// at `made_at <= cutoff` when given.
    fn causal_transactions(&self, cutoff: Option<u64>) -> Vec<(CausalKey, SessionOwner, &Transaction)> {
        let mut txs = Vec::new();
        for (session, log) in &self.sessions {
            for (index, tx) in log.transactions().iter().enumerate() {
                if cutoff.is_some_and(|t| tx.made_at > t) {
                    continue;
                }
                txs.push((
                    CausalKey::new(tx.made_at, *session, index as u32),
                    session.owner,
                    tx,
                ));
            }
        }
        txs.sort_by_key(|(k, _, _)| *k);
        txs
    }

    /// Decrypt a transaction's change list, or `None` while the epoch
    /// key is unavailable. Transactions stay retained either way; a
    /// later seal unlocks them retroactively because views are folds
    /// over the retained set.
    fn decrypted_changes(tx: &Transaction, ctx: &dyn CoContext) -> Option<Vec<Value>> {
        match &tx.body {
            TxBody::Trusting { changes } => Some(changes.clone()),
            TxBody::Private { key_used, .. } => {
                let key = ctx.epoch_key(key_used)?;
                tx.decrypt_changes(&key).ok()
            }
        }
    }

    /// Fold the governing-group permission check for one transaction.
    fn permitted(
        &self,
        owner: &SessionOwner,
        at: CausalKey,
        governing: Option<&Arc<GroupView>>,
        ctx: &dyn CoContext,
    ) -> bool {
        match self.header.ruleset {
            Ruleset::UnsafeAllowAll => true,
            Ruleset::Group => true, // gated inside the group fold itself
            Ruleset::OwnedByGroup(_) => {
                let Some(group) = governing else {
                    return false;
                };
                group
                    .role_at(&Member::from_owner(owner), at, &ResolverAdapter(ctx))
                    .is_some_and(|role| role.can_write())
            }
        }
    }

    /// The materialized view, derived from all validated, decrypted
    /// transactions.
    pub fn view(&self, ctx: &dyn CoContext) -> CoView {
        self.view_inner(ctx, None)
    }

    /// A read-only view ignoring transactions with `made_at > t`.
    pub fn at_time(&self, t: u64, ctx: &dyn CoContext) -> CoView {
        self.view_inner(ctx, Some(t))
    }

    fn view_inner(&self, ctx: &dyn CoContext, cutoff: Option<u64>) -> CoView {
        let ordered = self.causal_transactions(cutoff);

        // Groups and accounts run the permission fold directly.
        if matches!(self.header.ruleset, Ruleset::Group) {
            let decrypted: Vec<(CausalKey, SessionOwner, Vec<Value>)> = ordered
                .iter()
                .filter_map(|(at, owner, tx)| {
                    Self::decrypted_changes(tx, ctx).map(|c| (*at, *owner, c))
                })
                .collect();
            return CoView::Group(GroupView::fold(
                decrypted.iter().map(|(at, o, c)| (*at, *o, c.as_slice())),
                &ResolverAdapter(ctx),
            ));
        }

        let governing = self
            .header
            .owner_group()
            .and_then(|g| ctx.group_view(g));

        let visible: Vec<(CausalKey, Vec<Value>)> = ordered
            .iter()
            .filter(|(at, owner, _)| self.permitted(owner, *at, governing.as_ref(), ctx))
            .filter_map(|(at, _, tx)| Self::decrypted_changes(tx, ctx).map(|c| (*at, c)))
            .collect();
        let iter = visible.iter().map(|(at, c)| (*at, c.as_slice()));

        match self.header.kind {
            CoKind::Map | CoKind::Group | CoKind::Account => CoView::Map(MapView::fold(iter)),
            CoKind::List => CoView::List(ListView::fold(iter)),
            CoKind::Stream => CoView::Stream(StreamView::fold(iter)),
            CoKind::PlainText => CoView::PlainText(TextView::fold(iter)),
        }
    }
}

/// Adapts a `CoContext` to the narrower `GroupResolver` seam without
/// relying on trait-object upcasting.
struct ResolverAdapter<'a>(&'a dyn CoContext);

impl GroupResolver for ResolverAdapter<'_> {
    fn group_view(&self, id: &CoId) -> Option<Arc<GroupView>> {
        self.0.group_view(id)
    }
}

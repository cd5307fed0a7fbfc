//! LocalNode: process-wide registry and sync routing
//!
//! The node owns every loaded CoValueCore, wires local writes through
//! storage and out to peers, and drives the per-peer reconciliation
//! state machine. All CoValue mutation happens on the node's logical
//! lane; peer transports only move frames in and out of the per-peer
//! queues.

use cojson_core::core::StaticContext;
use cojson_core::{
    AppendOutcome, CoHeader, CoKind, CoUpdate, CoValueCore, CoView, GroupView, IngestError,
    KnownState, MapOp, Member, Role, Ruleset, SessionNewContent, Transaction,
};
use cojson_model::crypto::CryptoError;
use cojson_model::id::SessionOwner;
use cojson_model::{AgentSecret, CoId, KeyId, SessionId, SigningPub};
use cojson_storage::{Storage, StorageError};
use cojson_sync::{
    diff_known, DependencyBuffer, OutboundQueue, PeerState, SyncMessage, MAX_TXS_PER_CONTENT,
};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors surfaced to callers of node operations
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("unknown covalue: {0}")]
    UnknownCoValue(CoId),

    #[error("node has no account yet")]
    NoAccount,

    #[error("epoch key unavailable: {0}")]
    KeyUnavailable(KeyId),

    #[error("covalue {0} is not a group")]
    NotAGroup(CoId),

    #[error("content header does not hash to {0}")]
    HeaderMismatch(CoId),

    #[error("unknown peer: {0}")]
    UnknownPeer(String),
}

/// Identifier a transport hands us for one connected peer.
pub type PeerId = String;

struct Peer {
    state: PeerState,
    outbox: OutboundQueue,
}

impl Peer {
    fn new() -> Self {
        Self {
            state: PeerState::new(),
            outbox: OutboundQueue::default(),
        }
    }
}

/// A process-local CoJSON node bound to one agent.
pub struct LocalNode {
    agent: AgentSecret,
    account: Option<CoId>,
    cores: HashMap<CoId, CoValueCore>,
    /// Session used for all local writes; account-owned once the
    /// account exists, agent-owned during bootstrap.
    agent_session: SessionId,
    account_session: Option<SessionId>,
    /// Epoch keys this replica has unsealed.
    keys: HashMap<KeyId, cojson_model::SymKey>,
    storage: Box<dyn Storage>,
    peers: HashMap<PeerId, Peer>,
    parked: DependencyBuffer<(PeerId, SyncMessage)>,
}

impl LocalNode {
    /// Open a node over an agent identity and a storage backend.
    pub fn new(agent: AgentSecret, storage: Box<dyn Storage>) -> Self {
        let agent_session = agent.new_session(SessionOwner::Agent(agent.id()));
        Self {
            agent,
            account: None,
            cores: HashMap::new(),
            agent_session,
            account_session: None,
            keys: HashMap::new(),
            storage,
            peers: HashMap::new(),
            parked: DependencyBuffer::new(),
        }
    }

    pub fn agent(&self) -> &AgentSecret {
        &self.agent
    }

    pub fn account(&self) -> Option<&CoId> {
        self.account.as_ref()
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn write_session(&self) -> SessionId {
        self.account_session.unwrap_or(self.agent_session)
    }

    // -----------------------------------------------------------------
    // Context assembly
    // -----------------------------------------------------------------

    /// Snapshot the permission context: group views, account signing
    /// keys, and unlocked epoch keys. Group views fold in two passes so
    /// parent-group links resolve without chasing cycles.
    pub fn build_ctx(&mut self) -> StaticContext {
        let mut pass = StaticContext {
            keys: self.keys.clone(),
            ..StaticContext::default()
        };

        for _ in 0..2 {
            let mut groups: HashMap<CoId, Arc<GroupView>> = HashMap::new();
            for (id, core) in &self.cores {
                if matches!(core.header().ruleset, Ruleset::Group) {
                    if let CoView::Group(view) = core.view(&pass) {
                        groups.insert(*id, Arc::new(view));
                    }
                }
            }

            let mut signers = HashMap::new();
            for (id, view) in &groups {
                if let Some(signer) = account_signer(view) {
                    signers.insert(*id, signer);
                }
            }

            // Unseal every epoch addressed to our account.
            if let Some(account) = self.account {
                for view in groups.values() {
                    for (key_id, key) in view.unseal_keys(&account, self.agent.sealing()) {
                        self.keys.entry(key_id).or_insert(key);
                    }
                }
            }

            pass = StaticContext {
                groups,
                signers,
                keys: self.keys.clone(),
            };
        }
        pass
    }

    // -----------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------

    /// Is this CoValue loaded?
    pub fn contains(&self, id: &CoId) -> bool {
        self.cores.contains_key(id)
    }

    /// Drop an idle core from memory. Storage still holds its state;
    /// `load` brings it back on demand.
    pub fn evict(&mut self, id: &CoId) -> bool {
        self.cores.remove(id).is_some()
    }

    /// Load a CoValue from storage into the registry, if stored.
    pub fn load(&mut self, id: &CoId) -> Result<bool, NodeError> {
        if self.cores.contains_key(id) {
            return Ok(true);
        }
        let Some(stored) = self.storage.read_co_value(id)? else {
            return Ok(false);
        };
        self.cores
            .insert(*id, CoValueCore::from_parts(stored.header, stored.sessions));
        Ok(true)
    }

    /// Load a CoValue, requesting it from every peer when storage does
    /// not hold it. The handle populates when content arrives.
    pub fn load_or_request(&mut self, id: &CoId) -> Result<bool, NodeError> {
        if self.load(id)? {
            return Ok(true);
        }
        let load = SyncMessage::Load {
            id: *id,
            sessions: BTreeMap::new(),
        };
        for peer in self.peers.values_mut() {
            peer.outbox.push(load.clone());
        }
        Ok(false)
    }

    /// Subscribe to a loaded CoValue's committed batches.
    pub fn subscribe(&self, id: &CoId) -> Result<broadcast::Receiver<CoUpdate>, NodeError> {
        self.cores
            .get(id)
            .map(|core| core.subscribe())
            .ok_or(NodeError::UnknownCoValue(*id))
    }

    /// The materialized view of a loaded CoValue.
    pub fn view(&mut self, id: &CoId) -> Result<CoView, NodeError> {
        let ctx = self.build_ctx();
        let core = self
            .cores
            .get(id)
            .ok_or(NodeError::UnknownCoValue(*id))?;
        Ok(core.view(&ctx))
    }

    /// A point-in-time view ignoring transactions after `t`.
    pub fn view_at(&mut self, id: &CoId, t: u64) -> Result<CoView, NodeError> {
        let ctx = self.build_ctx();
        let core = self
            .cores
            .get(id)
            .ok_or(NodeError::UnknownCoValue(*id))?;
        Ok(core.at_time(t, &ctx))
    }

    // -----------------------------------------------------------------
    // Creation and local writes
    // -----------------------------------------------------------------

    /// Create the node's account CoValue: a self-ruled value holding
    /// the agent's public keys. Must happen before group membership.
    pub fn create_account(&mut self) -> Result<CoId, NodeError> {
        let header = CoHeader::new(CoKind::Account, Ruleset::Group, Self::now_ms());
        let id = header.id();
        let agent_id = self.agent.id();

        let changes = vec![
            MapOp::set(
                "sealerKey",
                json!(format!("sealer_z{}", agent_id.sealing.to_b58())),
            ),
            MapOp::set(
                "signerKey",
                json!(format!("signer_z{}", agent_id.signing.to_b58())),
            ),
        ];

        let mut core = CoValueCore::new(header.clone());
        let tx = Transaction::trusting(Self::now_ms(), changes);
        let signature = core.append_local(self.agent_session, &[tx], self.agent.signing());

        self.storage.write_header(&id, &header)?;
        self.storage.write_transactions(
            &id,
            &self.agent_session,
            0,
            core.sessions()[&self.agent_session].transactions(),
            &signature,
        )?;

        self.cores.insert(id, core);
        self.account = Some(id);
        self.account_session = Some(self.agent.new_session(SessionOwner::Account(id)));
        self.announce(&id);
        Ok(id)
    }

    /// Bind this node to an account CoValue it already holds (e.g.
    /// after restarting over existing storage).
    pub fn adopt_account(&mut self, id: &CoId) -> Result<(), NodeError> {
        if !self.load(id)? {
            return Err(NodeError::UnknownCoValue(*id));
        }
        self.account = Some(*id);
        self.account_session = Some(self.agent.new_session(SessionOwner::Account(*id)));
        Ok(())
    }

    /// Create a group with this account as admin and a fresh read-key
    /// epoch sealed to it.
    pub fn create_group(&mut self) -> Result<CoId, NodeError> {
        let account = self.account.ok_or(NodeError::NoAccount)?;
        let header = CoHeader::new(CoKind::Group, Ruleset::Group, Self::now_ms());
        let id = header.id();

        let mut changes = vec![cojson_core::group::grant(
            &Member::Account(account),
            Role::Admin,
        )];
        let recipients = vec![(account, self.agent.sealing().public())];
        let (key_id, key, rotate) =
            cojson_core::group::rotate_read_key(&recipients, self.agent.sealing())?;
        changes.extend(rotate);
        self.keys.insert(key_id, key);

        self.create_with_first_tx(header, changes)?;
        Ok(id)
    }

    /// Create an owned CoValue under a group.
    pub fn create_co_value(&mut self, kind: CoKind, group: &CoId) -> Result<CoId, NodeError> {
        if !self
            .cores
            .get(group)
            .is_some_and(|core| matches!(core.header().ruleset, Ruleset::Group))
        {
            return Err(NodeError::NotAGroup(*group));
        }
        let header = CoHeader::new(kind, Ruleset::OwnedByGroup(*group), Self::now_ms());
        let id = header.id();
        self.create_with_first_tx(header, Vec::new())?;
        Ok(id)
    }

    fn create_with_first_tx(
        &mut self,
        header: CoHeader,
        changes: Vec<Value>,
    ) -> Result<CoId, NodeError> {
        let id = header.id();
        let session = self.write_session();
        let mut core = CoValueCore::new(header.clone());

        self.storage.write_header(&id, &header)?;
        if !changes.is_empty() {
            let tx = Transaction::trusting(Self::now_ms(), changes);
            let signature = core.append_local(session, &[tx], self.agent.signing());
            self.storage.write_transactions(
                &id,
                &session,
                0,
                core.sessions()[&session].transactions(),
                &signature,
            )?;
        }

        self.cores.insert(id, core);
        self.announce(&id);
        Ok(id)
    }

    /// Append a trusting transaction with the given changes.
    pub fn commit(&mut self, id: &CoId, changes: Vec<Value>) -> Result<(), NodeError> {
        self.commit_tx(id, Transaction::trusting(Self::now_ms(), changes))
    }

    /// Append a private transaction sealed under the governing group's
    /// current read-key epoch.
    pub fn commit_private(&mut self, id: &CoId, changes: Vec<Value>) -> Result<(), NodeError> {
        let ctx = self.build_ctx();
        let core = self
            .cores
            .get(id)
            .ok_or(NodeError::UnknownCoValue(*id))?;
        let group_id = match core.header().ruleset {
            Ruleset::OwnedByGroup(g) => g,
            _ => *id,
        };
        let group = ctx
            .groups
            .get(&group_id)
            .ok_or(NodeError::UnknownCoValue(group_id))?;
        let key_id = group
            .current_read_key()
            .ok_or(NodeError::NotAGroup(group_id))?;
        let key = self
            .keys
            .get(&key_id)
            .ok_or(NodeError::KeyUnavailable(key_id))?;

        let tx = Transaction::private(Self::now_ms(), key_id, key, &changes)?;
        self.commit_tx(id, tx)
    }

    fn commit_tx(&mut self, id: &CoId, tx: Transaction) -> Result<(), NodeError> {
        let session = self.write_session();
        let core = self
            .cores
            .get_mut(id)
            .ok_or(NodeError::UnknownCoValue(*id))?;

        let after = core
            .sessions()
            .get(&session)
            .map_or(0, |log| log.count());
        let signature = core.append_local(session, std::slice::from_ref(&tx), self.agent.signing());

        self.storage
            .write_transactions(id, &session, after, std::slice::from_ref(&tx), &signature)?;

        // Ship the delta to every peer not known to have it.
        let mut new = BTreeMap::new();
        new.insert(
            session,
            SessionNewContent {
                after,
                transactions: vec![tx],
                signature,
            },
        );
        self.broadcast_content(id, &new);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Group conveniences
    // -----------------------------------------------------------------

    /// Grant a role and seal the current epoch to the member so they
    /// can read private content.
    pub fn add_member(&mut self, group: &CoId, account: &CoId, role: Role) -> Result<(), NodeError> {
        let ctx = self.build_ctx();
        let view = ctx
            .groups
            .get(group)
            .ok_or(NodeError::NotAGroup(*group))?;

        let mut changes = vec![cojson_core::group::grant(&Member::Account(*account), role)];

        // writeOnly members may append but never read others' private
        // transactions, so they receive no epoch seal.
        if role.can_read() {
            let member_view = ctx
                .groups
                .get(account)
                .ok_or(NodeError::UnknownCoValue(*account))?;
            let sealer = account_sealer(member_view).ok_or(NodeError::UnknownCoValue(*account))?;
            if let Some(key_id) = view.current_read_key() {
                let key = self
                    .keys
                    .get(&key_id)
                    .ok_or(NodeError::KeyUnavailable(key_id))?;
                changes.push(cojson_core::group::seal_key_entry(
                    &key_id,
                    key,
                    account,
                    &sealer,
                    self.agent.sealing(),
                )?);
            }
        }
        self.commit(group, changes)
    }

    /// Revoke a member and rotate to a fresh epoch sealed only to the
    /// remaining readers.
    pub fn revoke_member(&mut self, group: &CoId, account: &CoId) -> Result<(), NodeError> {
        let ctx = self.build_ctx();
        let view = ctx
            .groups
            .get(group)
            .ok_or(NodeError::NotAGroup(*group))?
            .clone();

        let mut recipients = Vec::new();
        for (member, role) in view.members() {
            let Member::Account(member_id) = member else {
                continue;
            };
            if member_id == *account || !role.can_read() {
                continue;
            }
            if let Some(sealer) = ctx.groups.get(&member_id).and_then(|v| account_sealer(v)) {
                recipients.push((member_id, sealer));
            }
        }

        let mut changes = vec![cojson_core::group::grant(
            &Member::Account(*account),
            Role::Revoked,
        )];
        let (key_id, key, rotate) =
            cojson_core::group::rotate_read_key(&recipients, self.agent.sealing())?;
        changes.extend(rotate);
        self.keys.insert(key_id, key);

        self.commit(group, changes)
    }

    /// Publish an invite principal; sharing the returned agent secret
    /// out-of-band lets a new account swap itself in at `role`.
    pub fn create_invite(&mut self, group: &CoId, role: Role) -> Result<AgentSecret, NodeError> {
        let agent = AgentSecret::generate();
        self.commit(group, vec![cojson_core::group::invite(&agent.id(), role)])?;
        Ok(agent)
    }

    /// Redeem an invite: append the atomic self-insertion from a
    /// session owned by the invite agent.
    pub fn accept_invite(
        &mut self,
        group: &CoId,
        invite: &AgentSecret,
        role: Role,
    ) -> Result<(), NodeError> {
        let account = self.account.ok_or(NodeError::NoAccount)?;
        let session = invite.new_session(SessionOwner::Agent(invite.id()));
        let core = self
            .cores
            .get_mut(group)
            .ok_or(NodeError::UnknownCoValue(*group))?;

        let tx = Transaction::trusting(
            Self::now_ms(),
            vec![cojson_core::group::grant(
                &Member::Account(account),
                role,
            )],
        );
        let signature = core.append_local(session, std::slice::from_ref(&tx), invite.signing());
        self.storage
            .write_transactions(group, &session, 0, std::slice::from_ref(&tx), &signature)?;

        let mut new = BTreeMap::new();
        new.insert(
            session,
            SessionNewContent {
                after: 0,
                transactions: vec![tx],
                signature,
            },
        );
        self.broadcast_content(group, &new);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Peers and sync
    // -----------------------------------------------------------------

    /// Register a peer and advertise every open CoValue.
    pub fn connect_peer(&mut self, peer: impl Into<PeerId>) {
        let peer = peer.into();
        let mut state = Peer::new();
        for (id, core) in &self.cores {
            let known = core.known_state();
            state.outbox.push(SyncMessage::Known {
                id: *id,
                header: known.header,
                sessions: known.sessions,
            });
        }
        self.peers.insert(peer, state);
    }

    pub fn disconnect_peer(&mut self, peer: &str) {
        self.peers.remove(peer);
    }

    /// Acknowledgement timeout: pessimistically forget what the peer
    /// knows and restart from a fresh KNOWN exchange.
    pub fn on_ack_timeout(&mut self, peer: &str) {
        if let Some(p) = self.peers.get_mut(peer) {
            p.state.reset();
            for (id, core) in &self.cores {
                let known = core.known_state();
                p.outbox.push(SyncMessage::Known {
                    id: *id,
                    header: known.header,
                    sessions: known.sessions,
                });
            }
        }
    }

    /// Drain a peer's outbound queue for transmission.
    pub fn collect_outbound(&mut self, peer: &str) -> Vec<SyncMessage> {
        let Some(p) = self.peers.get_mut(peer) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Some(msg) = p.outbox.pop() {
            // Track what the peer will know once this arrives.
            match &msg {
                SyncMessage::Known { .. } | SyncMessage::Load { .. } | SyncMessage::Done { .. } => {}
                SyncMessage::Content { id, header, new } => {
                    p.state.record_content(id, header.is_some(), new);
                }
            }
            out.push(msg);
        }
        out
    }

    /// Route one inbound message from a peer.
    pub fn handle_message(&mut self, peer: &str, msg: SyncMessage) -> Result<(), NodeError> {
        if !self.peers.contains_key(peer) {
            return Err(NodeError::UnknownPeer(peer.to_string()));
        }
        match msg {
            SyncMessage::Known {
                id,
                header,
                sessions,
            } => self.handle_known(peer, id, header, &sessions),
            SyncMessage::Load { id, sessions } => self.handle_load(peer, id, &sessions),
            SyncMessage::Content { id, header, new } => {
                self.handle_content(peer, id, header, new)
            }
            SyncMessage::Done { .. } => Ok(()),
        }
    }

    fn handle_known(
        &mut self,
        peer: &str,
        id: CoId,
        header: bool,
        sessions: &BTreeMap<SessionId, u32>,
    ) -> Result<(), NodeError> {
        if let Some(p) = self.peers.get_mut(peer) {
            p.state.record_known(&id, header, sessions);
        }

        if !self.cores.contains_key(&id) && !self.load(&id)? {
            // The peer has something we never heard of: ask for it.
            if !sessions.is_empty() || header {
                self.push_to_peer(
                    peer,
                    SyncMessage::Load {
                        id,
                        sessions: BTreeMap::new(),
                    },
                );
            }
            return Ok(());
        }

        let core = self.cores.get(&id).ok_or(NodeError::UnknownCoValue(id))?;
        let ours = core.known_state();
        let theirs = KnownState {
            header,
            sessions: sessions.clone(),
        };
        let diff = diff_known(&ours, &theirs);

        if !diff.we_need.is_empty() {
            let our_sessions = ours.sessions.clone();
            self.push_to_peer(
                peer,
                SyncMessage::Load {
                    id,
                    sessions: our_sessions,
                },
            );
        }
        if !diff.they_need.is_empty() || diff.they_need_header {
            self.send_content(peer, &id, sessions, diff.they_need_header)?;
        }
        if diff.is_settled() {
            self.push_to_peer(peer, SyncMessage::Done { id });
        }
        Ok(())
    }

    fn handle_load(
        &mut self,
        peer: &str,
        id: CoId,
        sessions: &BTreeMap<SessionId, u32>,
    ) -> Result<(), NodeError> {
        if let Some(p) = self.peers.get_mut(peer) {
            // A LOAD implies the requester holds these sessions.
            p.state.record_known(&id, false, sessions);
        }
        if self.cores.contains_key(&id) || self.load(&id)? {
            let send_header = !self
                .peers
                .get(peer)
                .is_some_and(|p| p.state.knows_header(&id));
            self.send_content(peer, &id, sessions, send_header)?;
        } else {
            self.push_to_peer(peer, SyncMessage::Done { id });
        }
        Ok(())
    }

    fn handle_content(
        &mut self,
        peer: &str,
        id: CoId,
        mut header: Option<CoHeader>,
        new: BTreeMap<SessionId, SessionNewContent>,
    ) -> Result<(), NodeError> {
        let had_header = header.is_some();

        // Header dependency: either supplied, already loaded, or in
        // storage; otherwise park and ask for it.
        if !self.cores.contains_key(&id) && !self.load(&id)? {
            match header.take() {
                Some(h) => {
                    if h.id() != id {
                        tracing::warn!(%id, "rejecting content with mismatched header");
                        return Err(NodeError::HeaderMismatch(id));
                    }
                    self.storage.write_header(&id, &h)?;
                    self.cores.insert(id, CoValueCore::new(h));
                }
                None => {
                    tracing::debug!(%id, "parking content until header arrives");
                    self.park(
                        peer,
                        id,
                        SyncMessage::Content {
                            id,
                            header: None,
                            new,
                        },
                    );
                    return Ok(());
                }
            }
        }

        // Group dependency: the governing group must be known before
        // content is accepted.
        let group_dep = self
            .cores
            .get(&id)
            .and_then(|core| core.header().owner_group().copied());
        if let Some(group) = group_dep {
            if !self.cores.contains_key(&group) && !self.load(&group)? {
                tracing::debug!(%id, %group, "parking content until governing group arrives");
                self.park(
                    peer,
                    group,
                    SyncMessage::Content {
                        id,
                        header: None,
                        new,
                    },
                );
                return Ok(());
            }
        }

        let ctx = self.build_ctx();
        let mut applied: BTreeMap<SessionId, SessionNewContent> = BTreeMap::new();
        for (session, content) in &new {
            let core = self
                .cores
                .get_mut(&id)
                .ok_or(NodeError::UnknownCoValue(id))?;
            match core.ingest(
                *session,
                content.after,
                &content.transactions,
                content.signature,
                &ctx,
            ) {
                Ok(AppendOutcome::Appended { .. }) => {
                    self.storage.write_transactions(
                        &id,
                        session,
                        content.after,
                        &content.transactions,
                        &content.signature,
                    )?;
                    applied.insert(*session, content.clone());
                }
                Ok(AppendOutcome::AlreadyKnown) => {}
                Err(IngestError::ChainBroken { expected, .. }) => {
                    // Re-request from our actual index.
                    let mut ours = BTreeMap::new();
                    ours.insert(*session, expected);
                    self.push_to_peer(peer, SyncMessage::Load { id, sessions: ours });
                }
                Err(IngestError::UnknownDependency(dep)) => {
                    tracing::debug!(%id, %dep, "parking session content on missing dependency");
                    let mut remaining = BTreeMap::new();
                    remaining.insert(*session, content.clone());
                    self.park(
                        peer,
                        dep,
                        SyncMessage::Content {
                            id,
                            header: None,
                            new: remaining,
                        },
                    );
                }
                Err(err) => {
                    tracing::warn!(%id, %session, %err, "rejecting content from peer");
                }
            }
        }

        if let Some(p) = self.peers.get_mut(peer) {
            p.state.record_content(&id, had_header, &new);
        }

        if !applied.is_empty() {
            // Acknowledge with our updated state.
            if let Some(core) = self.cores.get(&id) {
                let known = core.known_state();
                self.push_to_peer(
                    peer,
                    SyncMessage::Known {
                        id,
                        header: known.header,
                        sessions: known.sessions,
                    },
                );
            }
            self.forward_content(peer, &id, &applied);
        }
        // A header alone can unblock parked dependents, so retry
        // whenever the CoValue is now available.
        if self.cores.contains_key(&id) {
            self.retry_parked(&id)?;
        }
        Ok(())
    }

    /// Queue content covering everything beyond `their_sessions`,
    /// fragmented for backpressure.
    fn send_content(
        &mut self,
        peer: &str,
        id: &CoId,
        their_sessions: &BTreeMap<SessionId, u32>,
        include_header: bool,
    ) -> Result<(), NodeError> {
        let Some(core) = self.cores.get(id) else {
            return Ok(());
        };
        let fragments = core.content_fragments(their_sessions, MAX_TXS_PER_CONTENT);
        let header = include_header.then(|| core.header().clone());

        if fragments.is_empty() {
            if let Some(h) = header {
                self.push_to_peer(
                    peer,
                    SyncMessage::Content {
                        id: *id,
                        header: Some(h),
                        new: BTreeMap::new(),
                    },
                );
            }
            return Ok(());
        }

        let mut header = header;
        for fragment in fragments {
            self.push_to_peer(
                peer,
                SyncMessage::Content {
                    id: *id,
                    header: header.take(),
                    new: fragment,
                },
            );
        }
        Ok(())
    }

    /// Forward freshly-applied content to every other peer whose
    /// tracked state lacks it.
    fn forward_content(
        &mut self,
        from: &str,
        id: &CoId,
        applied: &BTreeMap<SessionId, SessionNewContent>,
    ) {
        let peer_names: Vec<PeerId> = self
            .peers
            .keys()
            .filter(|name| name.as_str() != from)
            .cloned()
            .collect();

        for name in peer_names {
            let lacking: BTreeMap<SessionId, SessionNewContent> = {
                let Some(p) = self.peers.get(&name) else {
                    continue;
                };
                applied
                    .iter()
                    .filter(|(session, content)| {
                        let end = content.after + content.transactions.len() as u32;
                        !p.state.has(id, session, end)
                    })
                    .map(|(s, c)| (*s, c.clone()))
                    .collect()
            };
            if lacking.is_empty() {
                continue;
            }
            let include_header = !self
                .peers
                .get(&name)
                .is_some_and(|p| p.state.knows_header(id));
            let header = include_header
                .then(|| self.cores.get(id).map(|c| c.header().clone()))
                .flatten();
            self.push_to_peer(
                &name,
                SyncMessage::Content {
                    id: *id,
                    header,
                    new: lacking,
                },
            );
        }
    }

    fn park(&mut self, peer: &str, missing: CoId, msg: SyncMessage) {
        self.parked.park(missing, (peer.to_string(), msg));
        self.push_to_peer(
            peer,
            SyncMessage::Load {
                id: missing,
                sessions: BTreeMap::new(),
            },
        );
    }

    /// Re-handle everything that was waiting on `arrived`.
    fn retry_parked(&mut self, arrived: &CoId) -> Result<(), NodeError> {
        for (peer, msg) in self.parked.take_ready(arrived) {
            if self.peers.contains_key(&peer) {
                self.handle_message(&peer, msg)?;
            }
        }
        Ok(())
    }

    fn push_to_peer(&mut self, peer: &str, msg: SyncMessage) {
        if let Some(p) = self.peers.get_mut(peer) {
            p.outbox.push(msg);
        }
    }

    /// Advertise a newly-created CoValue to every peer.
    fn announce(&mut self, id: &CoId) {
        let Some(core) = self.cores.get(id) else {
            return;
        };
        let known = core.known_state();
        for peer in self.peers.values_mut() {
            peer.outbox.push(SyncMessage::Known {
                id: *id,
                header: known.header,
                sessions: known.sessions.clone(),
            });
        }
    }

    /// Broadcast a local delta to peers not known to have it.
    fn broadcast_content(&mut self, id: &CoId, new: &BTreeMap<SessionId, SessionNewContent>) {
        let peer_names: Vec<PeerId> = self.peers.keys().cloned().collect();
        for name in peer_names {
            let lacks = {
                let Some(p) = self.peers.get(&name) else {
                    continue;
                };
                new.iter().any(|(session, content)| {
                    let end = content.after + content.transactions.len() as u32;
                    !p.state.has(id, session, end)
                })
            };
            if !lacks {
                continue;
            }
            let include_header = !self
                .peers
                .get(&name)
                .is_some_and(|p| p.state.knows_header(id));
            let header = include_header
                .then(|| self.cores.get(id).map(|c| c.header().clone()))
                .flatten();
            self.push_to_peer(
                &name,
                SyncMessage::Content {
                    id: *id,
                    header,
                    new: new.clone(),
                },
            );
        }
    }

    /// Our advertised state for one CoValue.
    pub fn known_state_of(&self, id: &CoId) -> Option<KnownState> {
        self.cores.get(id).map(|core| core.known_state())
    }

    /// A full CONTENT message for one CoValue, header included. Used to
    /// seed a peer or a test without the KNOWN/LOAD exchange.
    pub fn content_message(&self, id: &CoId) -> Option<SyncMessage> {
        let core = self.cores.get(id)?;
        Some(SyncMessage::Content {
            id: *id,
            header: Some(core.header().clone()),
            new: core.new_content_since(&BTreeMap::new()),
        })
    }

    /// Flush and drop everything; storage already holds the durable
    /// state.
    pub fn close(mut self) {
        self.peers.clear();
        self.cores.clear();
    }
}

/// Extract the signing key registered in an account's content.
fn account_signer(view: &GroupView) -> Option<SigningPub> {
    let value = view.map().get("signerKey")?.as_str()?;
    SigningPub::from_b58(value.strip_prefix("signer_z")?).ok()
}

/// Extract the sealing key registered in an account's content.
fn account_sealer(view: &GroupView) -> Option<cojson_model::SealingPub> {
    let value = view.map().get("sealerKey")?.as_str()?;
    cojson_model::SealingPub::from_b58(value.strip_prefix("sealer_z")?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use cojson_storage::MemStorage;

    fn new_node() -> LocalNode {
        LocalNode::new(AgentSecret::generate(), Box::new(MemStorage::new()))
    }

    #[test]
    fn test_account_creation_registers_keys() {
        let mut node = new_node();
        let account = node.create_account().unwrap();
        assert_eq!(node.account(), Some(&account));

        let ctx = node.build_ctx();
        assert_eq!(
            ctx.signers.get(&account),
            Some(&node.agent().signing().public())
        );
    }

    #[test]
    fn test_group_creation_seals_initial_epoch() {
        let mut node = new_node();
        node.create_account().unwrap();
        let group = node.create_group().unwrap();

        let view = node.view(&group).unwrap();
        let group_view = view.as_group().unwrap();
        let key_id = group_view.current_read_key().unwrap();
        assert!(node.keys.contains_key(&key_id));
    }

    #[test]
    fn test_commit_and_view() {
        let mut node = new_node();
        node.create_account().unwrap();
        let group = node.create_group().unwrap();
        let map = node.create_co_value(CoKind::Map, &group).unwrap();

        node.commit(&map, vec![MapOp::set("title", json!("notes"))])
            .unwrap();
        let view = node.view(&map).unwrap();
        assert_eq!(view.as_map().unwrap().get("title"), Some(&json!("notes")));
    }

    #[test]
    fn test_create_co_value_requires_group() {
        let mut node = new_node();
        let account = node.create_account().unwrap();
        let bogus = CoId(cojson_model::Hash([0xaa; 32]));
        assert!(matches!(
            node.create_co_value(CoKind::Map, &bogus),
            Err(NodeError::NotAGroup(_))
        ));
        // Accounts are Group-ruleset, so ownership under them works.
        assert!(node.create_co_value(CoKind::Map, &account).is_ok());
    }

    #[test]
    fn test_commit_private_without_epoch_fails() {
        let mut node = new_node();
        node.create_account().unwrap();
        let account = *node.account().unwrap();
        // Accounts have no read key epoch.
        let map = node.create_co_value(CoKind::Map, &account).unwrap();
        assert!(matches!(
            node.commit_private(&map, vec![MapOp::set("s", json!(1))]),
            Err(NodeError::NotAGroup(_))
        ));
    }

    #[test]
    fn test_commit_unknown_covalue_fails() {
        let mut node = new_node();
        node.create_account().unwrap();
        let bogus = CoId(cojson_model::Hash([0xbb; 32]));
        assert!(matches!(
            node.commit(&bogus, vec![]),
            Err(NodeError::UnknownCoValue(_))
        ));
    }
}

//! Group permission model
//!
//! A group is a CoValue whose content defines roles and key epochs for
//! the CoValues that reference it. The content is an ordinary LWW map
//! fold, but ingest of a group's own transactions is gated by the roles
//! folded so far: admins change membership, invites may only swap
//! themselves in, and the first transaction bootstraps its author as
//! admin. Effective roles are always evaluated *at a causal position*,
//! so replicas converge on the same verdicts once they hold the same
//! group transactions.

use crate::comap::{MapOp, MapView};
use cojson_model::crypto::{self, CryptoError, SealingKeypair, SymKey, NONCE_LEN};
use cojson_model::id::SessionOwner;
use cojson_model::{AgentId, CausalKey, CoId, KeyId, SealingPub};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Maximum parent-group chain length considered during role lookups.
/// Cycles between groups terminate here.
const MAX_INHERITANCE_DEPTH: usize = 4;

/// Roles, ordered so that `min`/`max` express intersection and the
/// strongest grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Revoked,
    WriteOnly,
    Reader,
    Writer,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Revoked => "revoked",
            Role::WriteOnly => "writeOnly",
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "revoked" => Some(Role::Revoked),
            "writeOnly" => Some(Role::WriteOnly),
            "reader" => Some(Role::Reader),
            "writer" => Some(Role::Writer),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    /// May append transactions to owned CoValues.
    pub fn can_write(&self) -> bool {
        matches!(self, Role::WriteOnly | Role::Writer | Role::Admin)
    }

    /// May read private payloads.
    pub fn can_read(&self) -> bool {
        matches!(self, Role::Reader | Role::Writer | Role::Admin)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// A principal a role can be granted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Member {
    Account(CoId),
    Agent(AgentId),
    Everyone,
}

impl Member {
    pub fn from_owner(owner: &SessionOwner) -> Self {
        match owner {
            SessionOwner::Account(id) => Member::Account(*id),
            SessionOwner::Agent(id) => Member::Agent(*id),
        }
    }

    fn key_string(&self) -> String {
        match self {
            Member::Account(id) => id.to_string(),
            Member::Agent(id) => id.to_string(),
            Member::Everyone => "everyone".to_string(),
        }
    }
}

/// A symmetric epoch key sealed for one member.
#[derive(Clone, Debug, PartialEq)]
pub struct SealedKeyBlob {
    pub sealed: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    /// Sealing public key of the admin who wrapped the epoch.
    pub by: SealingPub,
}

impl SealedKeyBlob {
    pub fn to_value(&self) -> Value {
        json!({
            "by": format!("sealer_z{}", self.by.to_b58()),
            "nonce": bs58::encode(&self.nonce).into_string(),
            "sealed": bs58::encode(&self.sealed).into_string(),
        })
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let by = obj
            .get("by")?
            .as_str()?
            .strip_prefix("sealer_z")
            .and_then(|s| SealingPub::from_b58(s).ok())?;
        let nonce = bs58::decode(obj.get("nonce")?.as_str()?)
            .into_vec()
            .ok()
            .and_then(|v| <[u8; NONCE_LEN]>::try_from(v).ok())?;
        let sealed = bs58::decode(obj.get("sealed")?.as_str()?).into_vec().ok()?;
        Some(Self { sealed, nonce, by })
    }
}

/// One accepted group content entry.
#[derive(Clone, Debug, PartialEq)]
pub enum GroupEntry {
    Role { member: Member, role: Role },
    ReadKey { key: KeyId },
    SealedKey {
        account: CoId,
        key: KeyId,
        blob: SealedKeyBlob,
    },
    ParentGroup { group: CoId, cap: Role },
    Invite { agent: AgentId, role: Role },
}

impl GroupEntry {
    /// Decode a map `set` into a recognized group entry. Plain keys
    /// that carry no permission meaning return `None`.
    fn parse(key: &str, value: &Value) -> Option<Self> {
        if key == "everyone" {
            return Some(GroupEntry::Role {
                member: Member::Everyone,
                role: Role::from_str(value.as_str()?)?,
            });
        }
        if key == "readKey" {
            return Some(GroupEntry::ReadKey {
                key: value.as_str()?.parse().ok()?,
            });
        }
        if let Some(rest) = key.strip_prefix("parentGroup_") {
            let cap = match value.as_str()? {
                "extend" => Role::Admin,
                role => Role::from_str(role)?,
            };
            return Some(GroupEntry::ParentGroup {
                group: rest.parse().ok()?,
                cap,
            });
        }
        if let Some(rest) = key.strip_prefix("inviteSecret_") {
            let (agent, role) = rest.rsplit_once('_')?;
            return Some(GroupEntry::Invite {
                agent: agent.parse().ok()?,
                role: Role::from_str(role)?,
            });
        }
        if key.starts_with("sealer_z") {
            return Some(GroupEntry::Role {
                member: Member::Agent(key.parse().ok()?),
                role: Role::from_str(value.as_str()?)?,
            });
        }
        if key.starts_with(CoId::PREFIX) {
            // Either `<account>` (role grant) or `<account>_<keyId>`
            // (sealed epoch key for that account).
            if let Some((account, key_id)) = key.split_once("_key_z") {
                let key_id: KeyId = format!("key_z{}", key_id).parse().ok()?;
                return Some(GroupEntry::SealedKey {
                    account: account.parse().ok()?,
                    key: key_id,
                    blob: SealedKeyBlob::from_value(value)?,
                });
            }
            return Some(GroupEntry::Role {
                member: Member::Account(key.parse().ok()?),
                role: Role::from_str(value.as_str()?)?,
            });
        }
        None
    }

    /// The map key this entry is written under.
    pub fn key_string(&self) -> String {
        match self {
            GroupEntry::Role { member, .. } => member.key_string(),
            GroupEntry::ReadKey { .. } => "readKey".to_string(),
            GroupEntry::SealedKey { account, key, .. } => format!("{}_{}", account, key),
            GroupEntry::ParentGroup { group, .. } => format!("parentGroup_{}", group),
            GroupEntry::Invite { agent, role } => {
                format!("inviteSecret_{}_{}", agent, role.as_str())
            }
        }
    }
}

/// Resolves other groups' views during role lookups (parent groups) and
/// ingest (owned CoValues). Implemented by the node registry.
pub trait GroupResolver {
    fn group_view(&self, id: &CoId) -> Option<Arc<GroupView>>;
}

/// A resolver that knows no other groups; inheritance is inert.
pub struct NoGroups;

impl GroupResolver for NoGroups {
    fn group_view(&self, _id: &CoId) -> Option<Arc<GroupView>> {
        None
    }
}

impl GroupResolver for HashMap<CoId, Arc<GroupView>> {
    fn group_view(&self, id: &CoId) -> Option<Arc<GroupView>> {
        self.get(id).cloned()
    }
}

/// Materialized view of a group: the accepted permission entries in
/// causal order, plus the generic map view of the accepted changes.
#[derive(Clone, Debug, Default)]
pub struct GroupView {
    log: Vec<(CausalKey, GroupEntry)>,
    map: MapView,
}

impl GroupView {
    /// Fold a group's own transactions (sorted by causal key) into the
    /// view, enforcing the group's write rules as it goes. Rejected
    /// transactions are skipped whole; acceptance is deterministic
    /// given the same transaction set, so replicas converge.
    pub fn fold<'a>(
        txs: impl Iterator<Item = (CausalKey, SessionOwner, &'a [Value])>,
        resolver: &dyn GroupResolver,
    ) -> Self {
        let mut view = GroupView::default();
        for (at, owner, changes) in txs {
            view.apply_tx(at, &owner, changes, resolver);
        }
        view
    }

    fn apply_tx(
        &mut self,
        at: CausalKey,
        owner: &SessionOwner,
        changes: &[Value],
        resolver: &dyn GroupResolver,
    ) {
        if !self.tx_permitted(at, owner, changes, resolver) {
            tracing::debug!(?at, "group transaction rejected by permission fold");
            return;
        }

        let signer = Member::from_owner(owner);
        let bootstrap = self.log.is_empty();
        let mut granted_self = false;

        for change in changes {
            if let Some(MapOp::Set { key, value }) = MapOp::from_value(change) {
                if let Some(entry) = GroupEntry::parse(&key, &value) {
                    if matches!(&entry, GroupEntry::Role { member, .. } if *member == signer) {
                        granted_self = true;
                    }
                    self.log.push((at, entry));
                }
            }
        }

        // Creator bootstrap: the first accepted transaction's author is
        // the group's admin unless it granted itself explicitly.
        if bootstrap && !granted_self {
            self.log.push((
                at,
                GroupEntry::Role {
                    member: signer,
                    role: Role::Admin,
                },
            ));
        }

        self.map.apply(at, changes);
    }

    fn tx_permitted(
        &self,
        at: CausalKey,
        owner: &SessionOwner,
        changes: &[Value],
        resolver: &dyn GroupResolver,
    ) -> bool {
        // First accepted transaction bootstraps the creator.
        if self.log.is_empty() {
            return true;
        }

        let signer = Member::from_owner(owner);

        // Invite swap: an invite agent may append exactly one change,
        // granting one absent account a role no stronger than the
        // invite's. Admin-equivalent, scoped to self-insertion only.
        if let SessionOwner::Agent(agent) = owner {
            if let Some(invite_role) = self.invite_role_at(agent, at) {
                if self.role_at_inner(&signer, at, resolver, 0).is_none() {
                    return self.invite_swap_permitted(invite_role, at, changes, resolver);
                }
            }
        }

        let effective = self
            .role_at_inner(&signer, at, resolver, 0)
            .unwrap_or(Role::Revoked);

        for change in changes {
            let permitted = match MapOp::from_value(change) {
                Some(MapOp::Set { key, value }) => match GroupEntry::parse(&key, &value) {
                    Some(_) => effective.is_admin(),
                    // Plain content keys on the group need write access
                    None => effective.can_write(),
                },
                Some(MapOp::Del { .. }) => effective.is_admin(),
                None => false,
            };
            if !permitted {
                return false;
            }
        }
        true
    }

    fn invite_swap_permitted(
        &self,
        invite_role: Role,
        at: CausalKey,
        changes: &[Value],
        resolver: &dyn GroupResolver,
    ) -> bool {
        if changes.len() != 1 {
            return false;
        }
        match MapOp::from_value(&changes[0]) {
            Some(MapOp::Set { key, value }) => match GroupEntry::parse(&key, &value) {
                Some(GroupEntry::Role {
                    member: member @ Member::Account(_),
                    role,
                }) => {
                    role <= invite_role
                        && self.role_at_inner(&member, at, resolver, 0).is_none()
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Effective role of a member as of a causal position.
    ///
    /// A direct grant (including an explicit revocation) takes
    /// precedence; otherwise the strongest of `everyone` and inherited
    /// parent-group roles (each capped by the marker's role) applies.
    pub fn role_at(
        &self,
        member: &Member,
        at: CausalKey,
        resolver: &dyn GroupResolver,
    ) -> Option<Role> {
        self.role_at_inner(member, at, resolver, 0)
    }

    fn role_at_inner(
        &self,
        member: &Member,
        at: CausalKey,
        resolver: &dyn GroupResolver,
        depth: usize,
    ) -> Option<Role> {
        if let Some(direct) = self.lww_role(member, at) {
            return Some(direct);
        }
        if matches!(member, Member::Everyone) {
            return None;
        }

        let mut best: Option<Role> = self.lww_role(&Member::Everyone, at);

        if depth < MAX_INHERITANCE_DEPTH {
            for (group, cap) in self.parents_at(at) {
                if let Some(parent) = resolver.group_view(&group) {
                    if let Some(role) = parent.role_at_inner(member, at, resolver, depth + 1) {
                        let capped = role.min(cap);
                        best = Some(best.map_or(capped, |b| b.max(capped)));
                    }
                }
            }
        }
        best
    }

    /// Last-writer-wins direct grant for a member at a causal position.
    fn lww_role(&self, member: &Member, at: CausalKey) -> Option<Role> {
        let mut latest = None;
        for (k, e) in &self.log {
            if *k > at {
                break;
            }
            if let GroupEntry::Role { member: m, role } = e {
                if m == member {
                    latest = Some(*role);
                }
            }
        }
        latest
    }

    /// Parent groups active at a causal position (LWW per parent).
    fn parents_at(&self, at: CausalKey) -> Vec<(CoId, Role)> {
        let mut parents: HashMap<CoId, Role> = HashMap::new();
        for (k, e) in &self.log {
            if *k > at {
                break;
            }
            if let GroupEntry::ParentGroup { group, cap } = e {
                parents.insert(*group, *cap);
            }
        }
        parents.into_iter().collect()
    }

    /// The invite role granted to an agent at a causal position.
    pub fn invite_role_at(&self, agent: &AgentId, at: CausalKey) -> Option<Role> {
        let mut latest = None;
        for (k, e) in &self.log {
            if *k > at {
                break;
            }
            if let GroupEntry::Invite { agent: a, role } = e {
                if a == agent {
                    latest = Some(*role);
                }
            }
        }
        latest
    }

    /// The key epoch a private write at this causal position must use.
    pub fn read_key_at(&self, at: CausalKey) -> Option<KeyId> {
        let mut latest = None;
        for (k, e) in &self.log {
            if *k > at {
                break;
            }
            if let GroupEntry::ReadKey { key } = e {
                latest = Some(*key);
            }
        }
        latest
    }

    /// The currently active key epoch.
    pub fn current_read_key(&self) -> Option<KeyId> {
        self.log
            .iter()
            .filter_map(|(_, e)| match e {
                GroupEntry::ReadKey { key } => Some(*key),
                _ => None,
            })
            .next_back()
    }

    /// Every sealed epoch key addressed to an account.
    pub fn seals_for(&self, account: &CoId) -> Vec<(KeyId, &SealedKeyBlob)> {
        self.log
            .iter()
            .filter_map(|(_, e)| match e {
                GroupEntry::SealedKey {
                    account: a,
                    key,
                    blob,
                } if a == account => Some((*key, blob)),
                _ => None,
            })
            .collect()
    }

    /// Unseal every epoch key addressed to `account` with its sealing
    /// keypair. Blobs that fail to open are skipped.
    pub fn unseal_keys(
        &self,
        account: &CoId,
        sealing: &SealingKeypair,
    ) -> HashMap<KeyId, SymKey> {
        let mut keys = HashMap::new();
        for (key_id, blob) in self.seals_for(account) {
            if let Ok(bytes) = crypto::unseal(&blob.by, sealing, &blob.nonce, &blob.sealed) {
                if let Ok(raw) = <[u8; 32]>::try_from(bytes.as_slice()) {
                    keys.insert(key_id, SymKey::from_bytes(raw));
                }
            }
        }
        keys
    }

    /// Accounts with a live direct role grant (excluding `everyone`).
    pub fn members(&self) -> Vec<(Member, Role)> {
        let mut latest: HashMap<Member, Role> = HashMap::new();
        for (_, e) in &self.log {
            if let GroupEntry::Role { member, role } = e {
                if !matches!(member, Member::Everyone) {
                    latest.insert(*member, *role);
                }
            }
        }
        latest.into_iter().collect()
    }

    /// The generic map view over accepted changes.
    pub fn map(&self) -> &MapView {
        &self.map
    }
}

// ---------------------------------------------------------------------------
// Write-path helpers
// ---------------------------------------------------------------------------

/// Change granting `member` a role.
pub fn grant(member: &Member, role: Role) -> Value {
    MapOp::set(member.key_string(), json!(role.as_str()))
}

/// Change publishing an invite principal.
pub fn invite(agent: &AgentId, role: Role) -> Value {
    MapOp::set(
        format!("inviteSecret_{}_{}", agent, role.as_str()),
        json!(role.as_str()),
    )
}

/// Change linking a parent group with a role cap.
pub fn extend_parent(group: &CoId, cap: Role) -> Value {
    MapOp::set(format!("parentGroup_{}", group), json!(cap.as_str()))
}

/// Seal an epoch key for one recipient account.
pub fn seal_key_entry(
    key_id: &KeyId,
    key: &SymKey,
    recipient: &CoId,
    recipient_sealing: &SealingPub,
    admin_sealing: &SealingKeypair,
) -> Result<Value, CryptoError> {
    let nonce = crypto::random_bytes::<NONCE_LEN>();
    let sealed = crypto::seal(recipient_sealing, admin_sealing, &nonce, key.as_bytes())?;
    let blob = SealedKeyBlob {
        sealed,
        nonce,
        by: admin_sealing.public(),
    };
    Ok(MapOp::set(
        format!("{}_{}", recipient, key_id),
        blob.to_value(),
    ))
}

/// Changes starting a fresh key epoch sealed for every reader in
/// `recipients`. Used on revocation so former members never hold the
/// new epoch.
pub fn rotate_read_key(
    recipients: &[(CoId, SealingPub)],
    admin_sealing: &SealingKeypair,
) -> Result<(KeyId, SymKey, Vec<Value>), CryptoError> {
    let key_id = KeyId(crypto::random_bytes());
    let key = SymKey::generate();

    let mut changes = Vec::with_capacity(recipients.len() + 1);
    for (account, sealing_pub) in recipients {
        changes.push(seal_key_entry(
            &key_id,
            &key,
            account,
            sealing_pub,
            admin_sealing,
        )?);
    }
    changes.push(MapOp::set("readKey", json!(key_id.to_string())));
    Ok((key_id, key, changes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cojson_model::id::SessionId;
    use cojson_model::{AgentSecret, Hash};

    fn account(byte: u8) -> CoId {
        CoId(Hash([byte; 32]))
    }

    fn session_of(account_id: CoId, counter: u64) -> SessionId {
        SessionId::new(SessionOwner::Account(account_id), counter)
    }

    fn key_at(made_at: u64, session: SessionId, index: u32) -> CausalKey {
        CausalKey::new(made_at, session, index)
    }

    struct GroupSim {
        txs: Vec<(CausalKey, SessionOwner, Vec<Value>)>,
    }

    impl GroupSim {
        fn new() -> Self {
            Self { txs: Vec::new() }
        }

        fn tx(&mut self, made_at: u64, owner: SessionOwner, changes: Vec<Value>) -> CausalKey {
            let session = SessionId::new(owner, 1);
            let index = self
                .txs
                .iter()
                .filter(|(k, _, _)| k.session == session)
                .count() as u32;
            let at = key_at(made_at, session, index);
            self.txs.push((at, owner, changes));
            at
        }

        fn view(&self) -> GroupView {
            let mut sorted = self.txs.clone();
            sorted.sort_by_key(|(k, _, _)| *k);
            GroupView::fold(
                sorted.iter().map(|(k, o, c)| (*k, *o, c.as_slice())),
                &NoGroups,
            )
        }
    }

    fn later(at: CausalKey) -> CausalKey {
        CausalKey::new(at.made_at + 1000, at.session, at.index + 1)
    }

    #[test]
    fn test_creator_bootstraps_as_admin() {
        let admin = account(1);
        let mut sim = GroupSim::new();
        let at = sim.tx(
            1,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(admin), Role::Admin)],
        );
        let view = sim.view();
        assert_eq!(
            view.role_at(&Member::Account(admin), at, &NoGroups),
            Some(Role::Admin)
        );
    }

    #[test]
    fn test_implicit_bootstrap_grant() {
        // First transaction without a self-grant still makes the
        // creator admin (account bootstrap writes content keys first).
        let creator = account(1);
        let mut sim = GroupSim::new();
        let at = sim.tx(
            1,
            SessionOwner::Account(creator),
            vec![MapOp::set("profile", json!("co_zabc"))],
        );
        let view = sim.view();
        assert_eq!(
            view.role_at(&Member::Account(creator), at, &NoGroups),
            Some(Role::Admin)
        );
    }

    #[test]
    fn test_admin_grants_and_non_admin_cannot() {
        let admin = account(1);
        let writer = account(2);
        let outsider = account(3);

        let mut sim = GroupSim::new();
        sim.tx(
            1,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(admin), Role::Admin)],
        );
        sim.tx(
            2,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(writer), Role::Writer)],
        );
        // The writer tries to promote an outsider: rejected.
        let at = sim.tx(
            3,
            SessionOwner::Account(writer),
            vec![grant(&Member::Account(outsider), Role::Writer)],
        );

        let view = sim.view();
        let probe = later(at);
        assert_eq!(
            view.role_at(&Member::Account(writer), probe, &NoGroups),
            Some(Role::Writer)
        );
        assert_eq!(
            view.role_at(&Member::Account(outsider), probe, &NoGroups),
            None
        );
    }

    #[test]
    fn test_role_at_respects_causal_position() {
        let admin = account(1);
        let bob = account(2);

        let mut sim = GroupSim::new();
        let t1 = sim.tx(
            1,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(admin), Role::Admin)],
        );
        let t2 = sim.tx(
            10,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(bob), Role::Writer)],
        );
        let t3 = sim.tx(
            20,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(bob), Role::Revoked)],
        );

        let view = sim.view();
        let bob_m = Member::Account(bob);
        assert_eq!(view.role_at(&bob_m, t1, &NoGroups), None);
        assert_eq!(view.role_at(&bob_m, t2, &NoGroups), Some(Role::Writer));
        assert_eq!(view.role_at(&bob_m, t3, &NoGroups), Some(Role::Revoked));
        assert!(!view
            .role_at(&bob_m, later(t3), &NoGroups)
            .unwrap()
            .can_write());
    }

    #[test]
    fn test_everyone_grant() {
        let admin = account(1);
        let anyone = account(9);

        let mut sim = GroupSim::new();
        sim.tx(
            1,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(admin), Role::Admin)],
        );
        let at = sim.tx(
            2,
            SessionOwner::Account(admin),
            vec![grant(&Member::Everyone, Role::Reader)],
        );

        let view = sim.view();
        assert_eq!(
            view.role_at(&Member::Account(anyone), later(at), &NoGroups),
            Some(Role::Reader)
        );
    }

    #[test]
    fn test_direct_revocation_beats_everyone() {
        let admin = account(1);
        let banned = account(2);

        let mut sim = GroupSim::new();
        sim.tx(
            1,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(admin), Role::Admin)],
        );
        let at = sim.tx(
            2,
            SessionOwner::Account(admin),
            vec![
                grant(&Member::Everyone, Role::Writer),
                grant(&Member::Account(banned), Role::Revoked),
            ],
        );

        let view = sim.view();
        assert_eq!(
            view.role_at(&Member::Account(banned), later(at), &NoGroups),
            Some(Role::Revoked)
        );
    }

    #[test]
    fn test_parent_group_inheritance_with_cap() {
        let admin = account(1);
        let parent_member = account(2);

        // Parent group: member is an admin there.
        let mut parent_sim = GroupSim::new();
        parent_sim.tx(
            1,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(admin), Role::Admin)],
        );
        parent_sim.tx(
            2,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(parent_member), Role::Admin)],
        );
        let parent_view = Arc::new(parent_sim.view());
        let parent_id = account(0x77);

        let mut resolver = HashMap::new();
        resolver.insert(parent_id, parent_view);

        // Child group extends the parent, capped at writer.
        let mut child_sim = GroupSim::new();
        child_sim.tx(
            1,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(admin), Role::Admin)],
        );
        let at = child_sim.tx(
            2,
            SessionOwner::Account(admin),
            vec![extend_parent(&parent_id, Role::Writer)],
        );

        let view = child_sim.view();
        assert_eq!(
            view.role_at(&Member::Account(parent_member), later(at), &resolver),
            Some(Role::Writer)
        );
    }

    #[test]
    fn test_invite_swap() {
        let admin = account(1);
        let invite_agent = AgentSecret::generate();
        let newcomer = account(5);

        let mut sim = GroupSim::new();
        sim.tx(
            1,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(admin), Role::Admin)],
        );
        sim.tx(
            2,
            SessionOwner::Account(admin),
            vec![invite(&invite_agent.id(), Role::Writer)],
        );
        // The invite agent swaps the newcomer in.
        let at = sim.tx(
            3,
            SessionOwner::Agent(invite_agent.id()),
            vec![grant(&Member::Account(newcomer), Role::Writer)],
        );

        let view = sim.view();
        assert_eq!(
            view.role_at(&Member::Account(newcomer), later(at), &NoGroups),
            Some(Role::Writer)
        );
    }

    #[test]
    fn test_invite_cannot_escalate_or_touch_existing() {
        let admin = account(1);
        let member = account(2);
        let invite_agent = AgentSecret::generate();
        let newcomer = account(5);

        let mut sim = GroupSim::new();
        sim.tx(
            1,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(admin), Role::Admin)],
        );
        sim.tx(
            2,
            SessionOwner::Account(admin),
            vec![
                grant(&Member::Account(member), Role::Reader),
                invite(&invite_agent.id(), Role::Reader),
            ],
        );
        // Escalation beyond the invite role: rejected.
        sim.tx(
            3,
            SessionOwner::Agent(invite_agent.id()),
            vec![grant(&Member::Account(newcomer), Role::Admin)],
        );
        // Touching an existing member: rejected.
        let at = sim.tx(
            4,
            SessionOwner::Agent(invite_agent.id()),
            vec![grant(&Member::Account(member), Role::Reader)],
        );

        let view = sim.view();
        let probe = later(at);
        assert_eq!(
            view.role_at(&Member::Account(newcomer), probe, &NoGroups),
            None
        );
        assert_eq!(
            view.role_at(&Member::Account(member), probe, &NoGroups),
            Some(Role::Reader)
        );
    }

    #[test]
    fn test_read_key_rotation_and_unseal() {
        let admin_secret = AgentSecret::generate();
        let member_secret = AgentSecret::generate();
        let admin = account(1);
        let member = account(2);

        let mut sim = GroupSim::new();
        sim.tx(
            1,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(admin), Role::Admin)],
        );

        let recipients = vec![
            (admin, admin_secret.sealing().public()),
            (member, member_secret.sealing().public()),
        ];
        let (key_id, key, changes) =
            rotate_read_key(&recipients, admin_secret.sealing()).unwrap();
        sim.tx(2, SessionOwner::Account(admin), changes);

        let view = sim.view();
        assert_eq!(view.current_read_key(), Some(key_id));

        let unlocked = view.unseal_keys(&member, member_secret.sealing());
        assert_eq!(unlocked.get(&key_id), Some(&key));

        // A third party cannot open either seal.
        let outsider = AgentSecret::generate();
        assert!(view.unseal_keys(&member, outsider.sealing()).is_empty());
    }

    #[test]
    fn test_revoked_member_excluded_from_new_epoch() {
        let admin_secret = AgentSecret::generate();
        let b_secret = AgentSecret::generate();
        let admin = account(1);
        let b = account(2);

        let mut sim = GroupSim::new();
        sim.tx(
            1,
            SessionOwner::Account(admin),
            vec![grant(&Member::Account(admin), Role::Admin)],
        );
        let (e1, _, changes) = rotate_read_key(
            &[
                (admin, admin_secret.sealing().public()),
                (b, b_secret.sealing().public()),
            ],
            admin_secret.sealing(),
        )
        .unwrap();
        sim.tx(2, SessionOwner::Account(admin), changes);

        // Revoke b and rotate, sealing only to the admin.
        let (e2, _, mut changes) = rotate_read_key(
            &[(admin, admin_secret.sealing().public())],
            admin_secret.sealing(),
        )
        .unwrap();
        changes.insert(0, grant(&Member::Account(b), Role::Revoked));
        sim.tx(3, SessionOwner::Account(admin), changes);

        let view = sim.view();
        assert_eq!(view.current_read_key(), Some(e2));

        // b still holds epoch 1 but never receives epoch 2.
        let b_keys = view.unseal_keys(&b, b_secret.sealing());
        assert!(b_keys.contains_key(&e1));
        assert!(!b_keys.contains_key(&e2));
    }

    #[test]
    fn test_group_entry_key_roundtrip() {
        let entries = vec![
            GroupEntry::Role {
                member: Member::Account(account(1)),
                role: Role::Writer,
            },
            GroupEntry::ReadKey { key: KeyId([7; 12]) },
            GroupEntry::ParentGroup {
                group: account(2),
                cap: Role::Reader,
            },
        ];
        for entry in entries {
            let key = entry.key_string();
            let value = match &entry {
                GroupEntry::Role { role, .. } => json!(role.as_str()),
                GroupEntry::ReadKey { key } => json!(key.to_string()),
                GroupEntry::ParentGroup { cap, .. } => json!(cap.as_str()),
                _ => unreachable!(),
            };
            assert_eq!(GroupEntry::parse(&key, &value), Some(entry));
        }
    }
}

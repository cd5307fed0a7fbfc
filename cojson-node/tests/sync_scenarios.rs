//! End-to-end sync scenarios between two in-process nodes.
//!
//! Messages are pumped synchronously between the nodes' per-peer
//! queues until both fall quiet, standing in for any ordered reliable
//! transport.

use cojson_core::{Anchor, CoKind, ListOp, MapOp, Role};
use cojson_model::{AgentSecret, CoId};
use cojson_node::{LocalNode, NodeError};
use cojson_storage::{FileStorage, MemStorage};
use serde_json::json;
use std::time::Duration;

fn new_node() -> LocalNode {
    LocalNode::new(AgentSecret::generate(), Box::new(MemStorage::new()))
}

/// Exchange messages until both nodes go quiet. Node `a` addresses its
/// peer as "b" and vice versa.
fn pump(a: &mut LocalNode, b: &mut LocalNode) {
    for _ in 0..100 {
        let from_a = a.collect_outbound("b");
        let from_b = b.collect_outbound("a");
        if from_a.is_empty() && from_b.is_empty() {
            return;
        }
        for msg in from_a {
            let _ = b.handle_message("a", msg);
        }
        for msg in from_b {
            let _ = a.handle_message("b", msg);
        }
    }
    panic!("pump did not quiesce");
}

/// Wall clocks only have millisecond resolution; writes that must be
/// causally later need a later timestamp.
fn tick() {
    std::thread::sleep(Duration::from_millis(5));
}

struct Pair {
    a: LocalNode,
    b: LocalNode,
    b_account: CoId,
    group: CoId,
}

/// Two connected nodes with synced accounts and a group where `a` is
/// admin and `b` a writer.
fn connected_pair() -> Pair {
    let mut a = new_node();
    let mut b = new_node();
    a.create_account().unwrap();
    let b_account = b.create_account().unwrap();
    let group = a.create_group().unwrap();

    a.connect_peer("b");
    b.connect_peer("a");
    pump(&mut a, &mut b);

    a.add_member(&group, &b_account, Role::Writer).unwrap();
    pump(&mut a, &mut b);
    tick();

    Pair {
        a,
        b,
        b_account,
        group,
    }
}

fn map_get(node: &mut LocalNode, id: &CoId, key: &str) -> Option<serde_json::Value> {
    node.view(id)
        .unwrap()
        .as_map()
        .and_then(|m| m.get(key).cloned())
}

#[test]
fn lww_map_converges_to_latest_writer() {
    let mut pair = connected_pair();
    let map = pair.a.create_co_value(CoKind::Map, &pair.group).unwrap();

    pair.a
        .commit(&map, vec![MapOp::set("k", json!("x"))])
        .unwrap();
    pump(&mut pair.a, &mut pair.b);
    assert_eq!(map_get(&mut pair.b, &map, "k"), Some(json!("x")));

    tick();
    pair.b
        .commit(&map, vec![MapOp::set("k", json!("y"))])
        .unwrap();
    pump(&mut pair.a, &mut pair.b);

    assert_eq!(map_get(&mut pair.a, &map, "k"), Some(json!("y")));
    assert_eq!(map_get(&mut pair.b, &map, "k"), Some(json!("y")));
}

#[test]
fn partition_heal_converges_lists() {
    let mut pair = connected_pair();
    let list = pair.a.create_co_value(CoKind::List, &pair.group).unwrap();
    pump(&mut pair.a, &mut pair.b);

    // Partitioned: both sides write without exchanging messages.
    for i in 0..10 {
        pair.a
            .commit(&list, vec![ListOp::pre(Anchor::End, json!(format!("a{i}")))])
            .unwrap();
        pair.b
            .commit(&list, vec![ListOp::pre(Anchor::End, json!(format!("b{i}")))])
            .unwrap();
    }

    // Heal.
    pump(&mut pair.a, &mut pair.b);

    let view_a: Vec<serde_json::Value> = pair
        .a
        .view(&list)
        .unwrap()
        .as_list()
        .unwrap()
        .to_vec()
        .into_iter()
        .cloned()
        .collect();
    let view_b: Vec<serde_json::Value> = pair
        .b
        .view(&list)
        .unwrap()
        .as_list()
        .unwrap()
        .to_vec()
        .into_iter()
        .cloned()
        .collect();

    assert_eq!(view_a.len(), 20);
    assert_eq!(view_a, view_b);
}

#[test]
fn revocation_rotates_epoch_and_preserves_old_reads() {
    let mut pair = connected_pair();
    let map = pair.a.create_co_value(CoKind::Map, &pair.group).unwrap();
    pump(&mut pair.a, &mut pair.b);

    pair.a
        .commit_private(&map, vec![MapOp::set("secret", json!("one"))])
        .unwrap();
    pump(&mut pair.a, &mut pair.b);
    assert_eq!(map_get(&mut pair.b, &map, "secret"), Some(json!("one")));

    tick();
    pair.a.revoke_member(&pair.group, &pair.b_account).unwrap();
    tick();
    pair.a
        .commit_private(&map, vec![MapOp::set("secret2", json!("two"))])
        .unwrap();
    pump(&mut pair.a, &mut pair.b);

    // The admin reads both epochs.
    assert_eq!(map_get(&mut pair.a, &map, "secret2"), Some(json!("two")));
    // The revoked member keeps its old epoch but never sees the new one.
    assert_eq!(map_get(&mut pair.b, &map, "secret"), Some(json!("one")));
    assert_eq!(map_get(&mut pair.b, &map, "secret2"), None);

    // And it cannot write under the new epoch either.
    assert!(matches!(
        pair.b
            .commit_private(&map, vec![MapOp::set("x", json!(1))]),
        Err(NodeError::KeyUnavailable(_))
    ));
}

#[test]
fn missing_dependencies_are_buffered_and_retried() {
    let mut a = new_node();
    let mut b = new_node();
    let a_account = a.create_account().unwrap();
    b.create_account().unwrap();
    let group = a.create_group().unwrap();
    let map = a.create_co_value(CoKind::Map, &group).unwrap();
    a.commit(&map, vec![MapOp::set("k", json!("x"))]).unwrap();

    a.connect_peer("b");
    b.connect_peer("a");

    // Deliver the map first: its governing group is unknown to b, so
    // the content parks and b asks for the group.
    let map_content = a.content_message(&map).unwrap();
    b.handle_message("a", map_content).unwrap();
    assert_eq!(map_get(&mut b, &map, "k"), None);
    let requests = b.collect_outbound("a");
    assert!(requests
        .iter()
        .any(|m| matches!(m, cojson_sync::SyncMessage::Load { id, .. } if id == &group)));

    // The group itself depends on a's account for signature checks.
    let group_content = a.content_message(&group).unwrap();
    b.handle_message("a", group_content).unwrap();

    // Once the account lands, the whole parked chain unwinds.
    let account_content = a.content_message(&a_account).unwrap();
    b.handle_message("a", account_content).unwrap();

    assert_eq!(map_get(&mut b, &map, "k"), Some(json!("x")));
}

#[test]
fn invite_swap_grants_membership() {
    let mut pair = connected_pair();
    let map = pair.a.create_co_value(CoKind::Map, &pair.group).unwrap();

    // A fresh node with no direct grant.
    let mut c = new_node();
    let _c_account = c.create_account().unwrap();

    let invite = pair.a.create_invite(&pair.group, Role::Writer).unwrap();
    pump(&mut pair.a, &mut pair.b);

    // c connects to a and syncs the group and map.
    pair.a.connect_peer("c");
    c.connect_peer("a");
    {
        // Pump a <-> c.
        for _ in 0..100 {
            let from_a = pair.a.collect_outbound("c");
            let from_c = c.collect_outbound("a");
            if from_a.is_empty() && from_c.is_empty() {
                break;
            }
            for msg in from_a {
                let _ = c.handle_message("a", msg);
            }
            for msg in from_c {
                let _ = pair.a.handle_message("c", msg);
            }
        }
    }

    tick();
    c.accept_invite(&pair.group, &invite, Role::Writer).unwrap();
    tick();
    c.commit(&map, vec![MapOp::set("from-c", json!(1))]).unwrap();

    for _ in 0..100 {
        let from_a = pair.a.collect_outbound("c");
        let from_c = c.collect_outbound("a");
        if from_a.is_empty() && from_c.is_empty() {
            break;
        }
        for msg in from_a {
            let _ = c.handle_message("a", msg);
        }
        for msg in from_c {
            let _ = pair.a.handle_message("c", msg);
        }
    }

    assert_eq!(map_get(&mut pair.a, &map, "from-c"), Some(json!(1)));
    assert_eq!(map_get(&mut c, &map, "from-c"), Some(json!(1)));
}

#[test]
fn text_diff_roundtrip() {
    let mut node = new_node();
    node.create_account().unwrap();
    let group = node.create_group().unwrap();
    let text_id = node.create_co_value(CoKind::PlainText, &group).unwrap();
    let text = cojson_node::TextHandle::new(text_id);

    text.apply_diff(&mut node, "Meeting notes").unwrap();
    assert_eq!(text.text(&mut node).unwrap(), "Meeting notes");

    tick();
    text.apply_diff(&mut node, "Meeting weekly notes").unwrap();
    assert_eq!(text.text(&mut node).unwrap(), "Meeting weekly notes");

    tick();
    text.apply_diff(&mut node, "Meeting notes").unwrap();
    assert_eq!(text.text(&mut node).unwrap(), "Meeting notes");
}

#[test]
fn subscription_fires_on_remote_update() {
    let mut pair = connected_pair();
    let map = pair.a.create_co_value(CoKind::Map, &pair.group).unwrap();
    pump(&mut pair.a, &mut pair.b);

    let mut updates = pair.b.subscribe(&map).unwrap();
    pair.a
        .commit(&map, vec![MapOp::set("k", json!(1))])
        .unwrap();
    pump(&mut pair.a, &mut pair.b);

    let update = updates.try_recv().expect("update for committed batch");
    assert_eq!(update.id, map);
}

#[test]
fn storage_reload_restores_state() {
    let dir = tempfile::tempdir().unwrap();
    let agent_path = dir.path().join("agent.key");
    let store_path = dir.path().join("store");

    let (account, group, map) = {
        let (agent, _) = AgentSecret::load_or_generate(&agent_path).unwrap();
        let storage = FileStorage::open(&store_path).unwrap();
        let mut node = LocalNode::new(agent, Box::new(storage));
        let account = node.create_account().unwrap();
        let group = node.create_group().unwrap();
        let map = node.create_co_value(CoKind::Map, &group).unwrap();
        node.commit(&map, vec![MapOp::set("k", json!("persisted"))])
            .unwrap();
        node.commit_private(&map, vec![MapOp::set("s", json!("sealed"))])
            .unwrap();
        node.close();
        (account, group, map)
    };

    let (agent, is_new) = AgentSecret::load_or_generate(&agent_path).unwrap();
    assert!(!is_new);
    let storage = FileStorage::open(&store_path).unwrap();
    let mut node = LocalNode::new(agent, Box::new(storage));

    node.adopt_account(&account).unwrap();
    assert!(node.load(&group).unwrap());
    assert!(node.load(&map).unwrap());

    assert_eq!(map_get(&mut node, &map, "k"), Some(json!("persisted")));
    // Private content unlocks again through the group's sealed epochs.
    assert_eq!(map_get(&mut node, &map, "s"), Some(json!("sealed")));
}

#[test]
fn ack_timeout_restarts_known_exchange() {
    let mut pair = connected_pair();
    let map = pair.a.create_co_value(CoKind::Map, &pair.group).unwrap();
    pair.a
        .commit(&map, vec![MapOp::set("k", json!(1))])
        .unwrap();
    pump(&mut pair.a, &mut pair.b);

    // After a timeout, a forgets what b knows and re-advertises
    // everything.
    pair.a.on_ack_timeout("b");
    let restart = pair.a.collect_outbound("b");
    assert!(restart
        .iter()
        .any(|m| matches!(m, cojson_sync::SyncMessage::Known { id, .. } if id == &map)));

    // The exchange settles again without duplicating state.
    for msg in restart {
        let _ = pair.b.handle_message("a", msg);
    }
    pump(&mut pair.a, &mut pair.b);
    assert_eq!(map_get(&mut pair.b, &map, "k"), Some(json!(1)));
}

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;

use KeelDB::cluster::{
    find_connection_changes, DatabaseRecord, DatabaseTopology, NamedTask, NodeRole, RachisState,
    ReplicationKind, ReplicationNode, TopologyStore,
};
use KeelDB::hash::jump_consistent_hash;
use KeelDB::{keel_error, KeelError};

fn random_topology(rng: &mut oorandom::Rand32) -> DatabaseTopology {
    let mut t = DatabaseTopology::new();
    let n = rng.rand_range(1..12);
    for i in 0..n {
        let tag = format!("N{i}");
        let role = match rng.rand_range(0..4) {
            0 => NodeRole::Promotable,
            1 => NodeRole::Rehab,
            2 => NodeRole::Watcher,
            _ => NodeRole::Member,
        };
        t.add(tag, role).expect("fresh tag");
    }
    t
}

fn shuffled(rng: &mut oorandom::Rand32, v: &[String]) -> Vec<String> {
    let mut out = v.to_vec();
    for i in (1..out.len()).rev() {
        let j = rng.rand_range(0..(i as u32 + 1)) as usize;
        out.swap(i, j);
    }
    out
}

#[test]
fn jump_hash_is_in_range_and_moves_minimally() {
    let mut rng = oorandom::Rand64::new(0x5eed);
    for _ in 0..2_000 {
        let key = rng.rand_u64();
        let mut prev = jump_consistent_hash(key, 1);
        assert_eq!(prev, 0);
        for n in 2..64 {
            let h = jump_consistent_hash(key, n);
            assert!((0..n).contains(&h));
            // при добавлении бакета ключ либо остаётся, либо уходит в новый
            assert!(h == prev || h == n - 1, "key {key:#x}: {prev} -> {h} at n={n}");
            prev = h;
        }
    }
    assert_eq!(jump_consistent_hash(42, 0), -1);
    assert_eq!(jump_consistent_hash(42, -3), -1);
}

#[test]
fn owner_is_always_a_member_and_order_independent() -> Result<()> {
    let mut rng = oorandom::Rand32::new(7);
    for round in 0..500 {
        let t = random_topology(&mut rng);
        let task = NamedTask::new(format!("etl/orders-{round}"));
        match t.whose_task_is_it(&task) {
            Ok(owner) => {
                assert!(t.is_member(&owner), "round {round}: {owner} is not a member of {t:?}");
                let mut reordered = t.clone();
                reordered.members = shuffled(&mut rng, &t.members);
                reordered.promotables = shuffled(&mut rng, &t.promotables);
                reordered.rehabs = shuffled(&mut rng, &t.rehabs);
                assert_eq!(reordered.whose_task_is_it(&task)?, owner);
            }
            Err(e) => {
                assert!(t.members.is_empty(), "round {round}: {e:#}");
                assert!(matches!(keel_error(&e), Some(KeelError::NoOwnerAvailable { .. })));
            }
        }
    }
    Ok(())
}

#[test]
fn state_mentor_and_last_responsible() -> Result<()> {
    let mut t = DatabaseTopology::with_members(["A", "B", "C"])?;
    t.add_promotable("D")?;
    let task = NamedTask::new("backup/nightly");

    assert_eq!(t.whose_task_is_it_in_state(RachisState::Candidate, &task, None)?, None);
    assert_eq!(t.whose_task_is_it_in_state(RachisState::Passive, &task, None)?, None);

    let plain = t.whose_task_is_it_in_state(RachisState::Follower, &task, None)?;
    assert_eq!(plain, Some(t.whose_task_is_it(&task)?));

    let mentored = NamedTask::new("backup/nightly").with_mentor("C");
    assert_eq!(
        t.whose_task_is_it_in_state(RachisState::Leader, &mentored, Some("A"))?,
        Some("C".to_string())
    );
    // ментор, который не член, игнорируется
    let bad_mentor = NamedTask::new("backup/nightly").with_mentor("D");
    assert_eq!(
        t.whose_task_is_it_in_state(RachisState::Leader, &bad_mentor, Some("B"))?,
        Some("B".to_string())
    );
    assert_eq!(
        t.whose_task_is_it_in_state(RachisState::Leader, &task, Some("D"))?,
        plain
    );
    Ok(())
}

fn cluster_urls(tags: &[&str]) -> BTreeMap<String, String> {
    tags.iter()
        .map(|t| (t.to_string(), format!("http://{}.local:8080", t.to_lowercase())))
        .collect()
}

#[test]
fn every_follower_has_exactly_one_replicating_member() -> Result<()> {
    let mut t = DatabaseTopology::with_members(["A", "B", "C"])?;
    t.add_promotable("D")?;
    t.add_rehab("E")?;
    t.add_watcher("W")?;
    let urls = cluster_urls(&["A", "B", "C", "D", "E", "W"]);
    let none = BTreeSet::new();

    let mut followers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for member in ["A", "B", "C"] {
        let dest = t.get_destinations(member, "orders", &none, &urls, RachisState::Follower);
        let mut sorted = dest.clone();
        sorted.sort();
        assert_eq!(dest, sorted, "destinations must come out sorted");

        for other in ["A", "B", "C"].iter().filter(|&&m| m != member) {
            assert!(dest.iter().any(|d| d.node_tag == *other && d.kind == ReplicationKind::Internal));
        }
        for d in &dest {
            assert_eq!(d.database, "orders");
            assert_eq!(d.url, urls[&d.node_tag]);
            if !t.is_member(&d.node_tag) {
                followers.entry(d.node_tag.clone()).or_default().push(member.to_string());
            }
            if d.node_tag == "W" {
                assert_eq!(d.kind, ReplicationKind::Watcher);
            }
        }
    }
    for tag in ["D", "E", "W"] {
        assert_eq!(followers.get(tag).map(Vec::len), Some(1), "{tag}: {followers:?}");
    }
    Ok(())
}

#[test]
fn destinations_skip_nodes_being_deleted() -> Result<()> {
    let mut t = DatabaseTopology::with_members(["A", "B", "C"])?;
    t.add_watcher("W")?;
    t.predefined_mentors.insert("W".into(), "A".into());
    let urls = cluster_urls(&["A", "B", "C", "W"]);

    let deleting: BTreeSet<String> = ["B".to_string()].into_iter().collect();
    let dest = t.get_destinations("A", "orders", &deleting, &urls, RachisState::Leader);
    let tags: Vec<&str> = dest.iter().map(|d| d.node_tag.as_str()).collect();
    assert_eq!(tags, vec!["C", "W"]);

    let self_deleting: BTreeSet<String> = ["A".to_string()].into_iter().collect();
    assert!(t
        .get_destinations("A", "orders", &self_deleting, &urls, RachisState::Leader)
        .is_empty());

    // вне раздачи задач ведомых не реплицируем, члены остаются
    let passive = t.get_destinations("A", "orders", &BTreeSet::new(), &urls, RachisState::Passive);
    let tags: Vec<&str> = passive.iter().map(|d| d.node_tag.as_str()).collect();
    assert_eq!(tags, vec!["B", "C"]);
    Ok(())
}

#[test]
fn connection_changes_turn_old_into_new() {
    let mut rng = oorandom::Rand32::new(99);
    for _ in 0..300 {
        let pick = |rng: &mut oorandom::Rand32| -> Vec<ReplicationNode> {
            let set: BTreeSet<ReplicationNode> = (0..rng.rand_range(0..10))
                .map(|_| {
                    let n = rng.rand_range(0..8);
                    let kind = if n % 3 == 0 { ReplicationKind::Watcher } else { ReplicationKind::Internal };
                    ReplicationNode::new(format!("N{n}"), format!("http://n{n}"), "orders", kind)
                })
                .collect();
            set.into_iter().collect()
        };
        let old = pick(&mut rng);
        let new = pick(&mut rng);
        let changes = find_connection_changes(&old, &new);

        let mut applied: BTreeSet<ReplicationNode> = old.iter().cloned().collect();
        for r in &changes.to_remove {
            assert!(applied.remove(r));
            assert!(!new.contains(r));
        }
        for a in &changes.to_add {
            assert!(!old.contains(a));
            assert!(applied.insert(a.clone()));
        }
        assert_eq!(applied.into_iter().collect::<Vec<_>>(), new);
    }
}

#[test]
fn record_roundtrips_and_store_swaps_snapshots() -> Result<()> {
    let dir = std::env::temp_dir().join(format!(
        "keeltest-topology-record-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("orders.json");

    let mut rec = DatabaseRecord::new("orders", DatabaseTopology::with_members(["A", "B"])?);
    rec.cluster_urls = cluster_urls(&["A", "B", "C"]);
    rec.save(&path)?;
    let loaded = DatabaseRecord::load(&path)?;
    assert_eq!(loaded, rec);

    let store = TopologyStore::new(loaded)?;
    let before = store.snapshot();
    let after = store.update(|r| {
        r.topology
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no topology"))?
            .add_promotable("C")
    })?;
    assert_eq!(after.etag, 1);
    assert_eq!(before.etag, 0);
    assert!(before.topology.as_ref().map_or(false, |t| t.promotables.is_empty()));
    assert_eq!(
        store.snapshot().topology.as_ref().map(|t| t.role_of("C")),
        Some(Some(NodeRole::Promotable))
    );

    let a = store.snapshot().get_destinations("A", RachisState::Leader);
    let b = store.snapshot().get_destinations("B", RachisState::Leader);
    let c_count = a.iter().chain(&b).filter(|d| d.node_tag == "C").count();
    assert_eq!(c_count, 1);
    Ok(())
}

use std::collections::BTreeMap;

use anyhow::Result;

use KeelDB::cluster::{
    get_bucket_for, DatabaseRecord, DatabaseTopology, MigrationStatus, ShardingConfiguration,
    TopologyStore, NUMBER_OF_BUCKETS,
};
use KeelDB::{keel_error, KeelError};

fn sharded(n: u32) -> Result<ShardingConfiguration> {
    let mut shards = BTreeMap::new();
    for i in 0..n {
        shards.insert(i, DatabaseTopology::with_members([format!("S{i}A"), format!("S{i}B")])?);
    }
    ShardingConfiguration::with_shards(shards)
}

fn is_conflict(e: &anyhow::Error) -> bool {
    matches!(keel_error(e), Some(KeelError::MigrationConflict(_)))
}

#[test]
fn bucket_moves_through_all_states() -> Result<()> {
    let mut s = sharded(2)?;
    assert_eq!(s.shard_for_bucket(5), Some(0));

    s.start_bucket_migration(5, 0, 1, 10)?;
    assert_eq!(s.migration(5).map(|m| m.status), Some(MigrationStatus::Moving));
    // владение не меняется, пока приёмник не подтвердил
    assert_eq!(s.shard_for_bucket(5), Some(0));

    let err = s.start_bucket_migration(7, 0, 1, 11).unwrap_err();
    assert!(is_conflict(&err), "{err:#}");
    assert!(s.migration(7).is_none());

    // подтверждение раньше времени и чужой индекс отвергаются
    assert!(is_conflict(&s.destination_migration_confirmed(5, 10).unwrap_err()));
    assert!(is_conflict(&s.source_migration_completed(5, 9, "A:1").unwrap_err()));

    s.source_migration_completed(5, 10, "A:42-xyz")?;
    let m = s.migration(5).cloned().expect("record");
    assert_eq!(m.status, MigrationStatus::Moved);
    assert_eq!(m.last_source_change_vector.as_deref(), Some("A:42-xyz"));
    assert!(is_conflict(&s.start_bucket_migration(7, 0, 1, 11).unwrap_err()));

    s.destination_migration_confirmed(5, 10)?;
    assert_eq!(s.shard_for_bucket(5), Some(1));
    assert_eq!(s.shard_for_bucket(4), Some(0));
    assert_eq!(s.shard_for_bucket(6), Some(0));
    assert!(s.active_migration().is_none());
    s.validate()?;

    // следующая миграция разрешена, повторная для того же бакета — нет
    s.start_bucket_migration(7, 0, 1, 11)?;
    assert!(is_conflict(&s.start_bucket_migration(5, 1, 0, 12).unwrap_err()));

    s.migration_cleanup(5, 10)?;
    assert!(s.migration(5).is_none());
    assert_eq!(s.shard_for_bucket(5), Some(1));
    Ok(())
}

#[test]
fn invalid_migrations_are_conflicts() -> Result<()> {
    let mut s = sharded(3)?;
    let last = NUMBER_OF_BUCKETS - 1;
    let owner_of_last = s.shard_for_bucket(last).expect("owner");

    for (bucket, src, dst) in [
        (NUMBER_OF_BUCKETS, 0, 1),
        (0, 0, 0),
        (0, 0, 9),
        (0, 1, 2),
        (last, 0, owner_of_last),
    ] {
        let err = s.start_bucket_migration(bucket, src, dst, 1).unwrap_err();
        assert!(is_conflict(&err), "{bucket} {src}->{dst}: {err:#}");
    }
    assert!(s.bucket_migrations.is_empty());
    assert!(is_conflict(&s.migration_cleanup(0, 1).unwrap_err()));
    Ok(())
}

#[test]
fn many_moves_keep_ranges_consistent() -> Result<()> {
    let mut s = sharded(4)?;
    let mut rng = oorandom::Rand32::new(2024);
    let mut expected: BTreeMap<u32, u32> = BTreeMap::new();

    for idx in 0..200u64 {
        let bucket = rng.rand_range(0..NUMBER_OF_BUCKETS);
        let src = s.shard_for_bucket(bucket).expect("owner");
        let dst = (src + 1 + rng.rand_range(0..3)) % 4;
        if s.migration(bucket).is_some() {
            continue;
        }
        s.start_bucket_migration(bucket, src, dst, idx)?;
        s.source_migration_completed(bucket, idx, format!("cv-{idx}"))?;
        s.destination_migration_confirmed(bucket, idx)?;
        expected.insert(bucket, dst);
        s.validate()?;
    }
    for (bucket, shard) in &expected {
        assert_eq!(s.shard_for_bucket(*bucket), Some(*shard));
    }
    // шарды непомеченных бакетов не поменялись
    for _ in 0..1_000 {
        let b = rng.rand_range(0..NUMBER_OF_BUCKETS);
        if !expected.contains_key(&b) {
            assert_eq!(s.shard_for_bucket(b), Some(b / (NUMBER_OF_BUCKETS / 4)));
        }
    }
    Ok(())
}

#[test]
fn documents_route_by_bucket_through_the_store() -> Result<()> {
    let mut rec = DatabaseRecord::new("orders", DatabaseTopology::new());
    rec.topology = None;
    rec.sharding = Some(sharded(2)?);
    let store = TopologyStore::new(rec)?;

    let id = "Orders/1-A";
    let bucket = get_bucket_for(id);
    assert_eq!(bucket, get_bucket_for("orders/1-a"));
    let snap = store.snapshot();
    let sharding = snap.sharding.as_ref().expect("sharded");
    let (b, src) = sharding.shard_for_id(id).expect("owner");
    assert_eq!(b, bucket);
    let dst = 1 - src;

    store.update(|r| {
        let s = r.sharding.as_mut().ok_or_else(|| anyhow::anyhow!("not sharded"))?;
        s.start_bucket_migration(bucket, src, dst, 1)?;
        s.source_migration_completed(bucket, 1, "cv")?;
        s.destination_migration_confirmed(bucket, 1)
    })?;

    // старый снапшот не видит перенос
    assert_eq!(sharding.shard_for_id(id).map(|(_, s)| s), Some(src));
    let now = store.snapshot();
    let moved = now.sharding.as_ref().and_then(|s| s.shard_for_id(id)).map(|(_, s)| s);
    assert_eq!(moved, Some(dst));
    assert!(now.topology_for(Some(dst)).map_or(false, |t| t.is_member(&format!("S{dst}A"))));
    Ok(())
}

use anyhow::{anyhow, Result};
use std::path::PathBuf;

use KeelDB::cluster::{get_bucket_for, DatabaseRecord, NamedTask, RachisState};

use crate::util::print_json;

pub fn exec_whose_task(
    record: PathBuf,
    key: String,
    mentor: Option<String>,
    state: RachisState,
    shard: Option<u32>,
) -> Result<()> {
    let rec = DatabaseRecord::load(&record)?;
    let topology = rec
        .topology_for(shard)
        .ok_or_else(|| anyhow!("record '{}' has no topology for shard {:?}", rec.database_name, shard))?;
    let mut task = NamedTask::new(key);
    if let Some(m) = mentor {
        task = task.with_mentor(m);
    }
    match topology.whose_task_is_it_in_state(state, &task, None)? {
        Some(owner) => println!("{}", owner),
        None => println!("(no owner assigned in {:?} state)", state),
    }
    Ok(())
}

pub fn exec_destinations(record: PathBuf, node: String, state: RachisState, json: bool) -> Result<()> {
    let rec = DatabaseRecord::load(&record)?;
    let dests = rec.get_destinations(&node, state);
    if json {
        return print_json(&dests);
    }
    if dests.is_empty() {
        println!("{}: no destinations for '{}'", node, rec.database_name);
    }
    for d in dests {
        println!("{:?}\t{}", d.kind, d);
    }
    Ok(())
}

pub fn exec_bucket(id: String, record: Option<PathBuf>) -> Result<()> {
    let bucket = get_bucket_for(&id);
    let Some(path) = record else {
        println!("{}", bucket);
        return Ok(());
    };
    let rec = DatabaseRecord::load(&path)?;
    let sharding = rec
        .sharding
        .as_ref()
        .ok_or_else(|| anyhow!("record '{}' is not sharded", rec.database_name))?;
    match sharding.shard_for_bucket(bucket) {
        Some(shard) => {
            print!("bucket {} -> shard {}", bucket, shard);
            if let Some(m) = sharding.migration(bucket) {
                print!(
                    " (migrating {} -> {}: {})",
                    m.source_shard, m.destination_shard, m.status
                );
            }
            println!();
        }
        None => println!("bucket {} -> (no shard)", bucket),
    }
    Ok(())
}

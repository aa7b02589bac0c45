use anyhow::Result;
use std::path::PathBuf;

use KeelDB::EnvBuilder;

use crate::util::{ensure_root, keys_for};

/// Перенести журнал в data file и усечь журнал (под эксклюзивной блокировкой окружения).
pub fn exec(path: PathBuf) -> Result<()> {
    ensure_root(&path)?;
    let mut b = EnvBuilder::new().auto_schema_upgrade(false);
    if let Some(keys) = keys_for(&path)? {
        b = b.encrypted(keys);
    }
    let env = b.open(&path)?;
    let r = env.flush_to_data_file()?;
    println!(
        "checkpoint: flushed up to tx {}, {} page(s) written, journal truncated: {}",
        r.flushed_upto, r.pages_written, r.journal_truncated
    );
    env.close()
}

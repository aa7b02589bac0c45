use anyhow::Result;
use std::path::PathBuf;

use KeelDB::schema::upgrade_to_current;
use KeelDB::EnvBuilder;

use crate::util::{ensure_root, keys_for};

pub fn exec(path: PathBuf) -> Result<()> {
    ensure_root(&path)?;
    let mut b = EnvBuilder::new().auto_schema_upgrade(false);
    if let Some(keys) = keys_for(&path)? {
        b = b.encrypted(keys);
    }
    let env = b.open(&path)?;
    let before = env.env_header()?.schema_version;
    let steps = upgrade_to_current(&env)?;
    let after = env.env_header()?.schema_version;
    if steps.is_empty() {
        println!("upgrade: {} storage already at schema {}", env.storage_type(), after);
    } else {
        println!(
            "upgrade: {} storage {} -> {} via {}",
            env.storage_type(),
            before,
            after,
            steps.join(", ")
        );
    }
    env.close()
}

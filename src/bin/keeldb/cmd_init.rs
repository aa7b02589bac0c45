use anyhow::{anyhow, Result};
use std::path::PathBuf;

use KeelDB::meta::meta_path;
use KeelDB::{EnvBuilder, EnvKeyProvider, StorageType};

pub fn exec(path: PathBuf, storage: StorageType, page_size: u32, encrypted: bool) -> Result<()> {
    if meta_path(&path).exists() {
        return Err(anyhow!("storage already initialized at {}", path.display()));
    }
    let mut b = EnvBuilder::new().page_size(page_size);
    if encrypted {
        b = b.encrypted(std::sync::Arc::new(EnvKeyProvider::from_env()?));
    }
    let env = b.create(&path, storage)?;
    let hdr = env.env_header()?;
    println!(
        "init: {} storage at {} (page_size={}, schema={}, encrypted={})",
        env.storage_type(),
        path.display(),
        env.page_size(),
        hdr.schema_version,
        env.is_encrypted()
    );
    env.close()
}

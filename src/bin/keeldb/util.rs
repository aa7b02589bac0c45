use anyhow::{anyhow, Result};
use std::path::Path;
use std::sync::Arc;

use KeelDB::meta::read_meta;
use KeelDB::{EnvKeyProvider, KeyProvider};

pub fn ensure_root(root: &Path) -> Result<()> {
    if !root.exists() {
        return Err(anyhow!("storage root does not exist: {}", root.display()));
    }
    Ok(())
}

/// Ключи из окружения, если хранилище зашифровано.
pub fn keys_for(root: &Path) -> Result<Option<Arc<dyn KeyProvider>>> {
    let meta = read_meta(root)?;
    if !meta.is_encrypted() {
        return Ok(None);
    }
    let p = EnvKeyProvider::from_env()?;
    Ok(Some(Arc::new(p)))
}

pub fn print_json<T: serde::Serialize>(v: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(v)?);
    Ok(())
}

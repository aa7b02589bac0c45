//! cluster/record — персистентная запись базы и copy-on-write хранилище топологии.
//!
//! DatabaseRecord хранится как pretty JSON (tmp + rename). TopologyStore отдаёт
//! читателям неизменяемый Arc-снапшот; update() клонирует, меняет, проверяет
//! инварианты и подменяет снапшот целиком, увеличивая etag.

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::error::KeelError;

use super::changes::ReplicationNode;
use super::sharding::ShardingConfiguration;
use super::topology::{DatabaseTopology, RachisState};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub database_name: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub topology: Option<DatabaseTopology>,
    #[serde(default)]
    pub sharding: Option<ShardingConfiguration>,
    /// Узлы, с которых база сейчас удаляется.
    #[serde(default)]
    pub deletion_in_progress: BTreeSet<String>,
    /// node tag → url.
    #[serde(default)]
    pub cluster_urls: BTreeMap<String, String>,
    #[serde(default)]
    pub etag: u64,
}

impl DatabaseRecord {
    pub fn new(database_name: impl Into<String>, topology: DatabaseTopology) -> Self {
        Self {
            database_name: database_name.into(),
            topology: Some(topology),
            ..Default::default()
        }
    }

    pub fn is_sharded(&self) -> bool {
        self.sharding.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_name.is_empty() {
            return Err(KeelError::InvalidTopology("database record without a name".into()).into());
        }
        if let Some(t) = &self.topology {
            t.validate()?;
        }
        if let Some(s) = &self.sharding {
            s.validate()?;
        }
        Ok(())
    }

    /// Топология, которой принадлежат задачи: для шардированной базы — шард `shard`.
    pub fn topology_for(&self, shard: Option<u32>) -> Option<&DatabaseTopology> {
        match (shard, &self.sharding) {
            (Some(n), Some(s)) => s.shards.get(&n),
            _ => self.topology.as_ref(),
        }
    }

    pub fn get_destinations(&self, node_tag: &str, state: RachisState) -> Vec<ReplicationNode> {
        match &self.topology {
            Some(t) => t.get_destinations(
                node_tag,
                &self.database_name,
                &self.deletion_in_progress,
                &self.cluster_urls,
                state,
            ),
            None => Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let rec: DatabaseRecord = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse database record {}", path.display()))?;
        rec.validate()?;
        Ok(rec)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(self).context("serialize database record")?;
        {
            let mut f = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp)
                .with_context(|| format!("open {}", tmp.display()))?;
            f.write_all(&data)?;
            let _ = f.sync_all();
        }
        fs::rename(&tmp, path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct TopologyStore {
    current: RwLock<Arc<DatabaseRecord>>,
}

impl TopologyStore {
    pub fn new(record: DatabaseRecord) -> Result<Self> {
        record.validate()?;
        Ok(Self {
            current: RwLock::new(Arc::new(record)),
        })
    }

    /// Неизменяемый вид записи на время одной логической операции.
    pub fn snapshot(&self) -> Arc<DatabaseRecord> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn etag(&self) -> u64 {
        self.snapshot().etag
    }

    /// Изменить копию и подменить снапшот. Ошибка `f` или проверки ничего не меняет.
    pub fn update<F>(&self, f: F) -> Result<Arc<DatabaseRecord>>
    where
        F: FnOnce(&mut DatabaseRecord) -> Result<()>,
    {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let mut next = DatabaseRecord::clone(&guard);
        f(&mut next)?;
        next.validate()?;
        next.etag = guard.etag + 1;
        let next = Arc::new(next);
        *guard = Arc::clone(&next);
        debug!("record '{}': etag {}", next.database_name, next.etag);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_update_keeps_snapshot() {
        let store = TopologyStore::new(DatabaseRecord::new(
            "orders",
            DatabaseTopology::with_members(["A"]).unwrap(),
        ))
        .unwrap();
        let before = store.snapshot();
        let r = store.update(|rec| {
            let t = rec.topology.get_or_insert_with(DatabaseTopology::new);
            t.members.push("A".into());
            Ok(())
        });
        assert!(r.is_err());
        assert_eq!(store.etag(), 0);
        assert!(Arc::ptr_eq(&before, &store.snapshot()));
    }
}

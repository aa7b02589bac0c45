//! cluster/sharding — бакеты, шарды и миграция бакета между шардами.
//!
//! - Бакет документа: xxhash64(lowercase id) % NUMBER_OF_BUCKETS.
//! - bucket_ranges: отсортированы по началу; диапазон длится до следующего начала.
//! - Миграция: Moving → Moved → OwnershipTransferred → (cleanup удаляет запись).
//!   Пока хоть одна миграция ниже OwnershipTransferred, новая не стартует;
//!   бакет с любой записью миграции повторно не мигрирует.

use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::KeelError;
use crate::hash::{bucket_index, task_key};
use crate::metrics::{record_migration_completed, record_migration_started};

use super::topology::DatabaseTopology;

pub const NUMBER_OF_BUCKETS: u32 = 1_048_576;

/// Бакет документа по его id (регистр не важен).
pub fn get_bucket_for(id: &str) -> u32 {
    bucket_index(task_key(id), NUMBER_OF_BUCKETS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MigrationStatus {
    Moving,
    Moved,
    OwnershipTransferred,
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardBucketMigration {
    pub bucket: u32,
    pub source_shard: u32,
    pub destination_shard: u32,
    pub migration_index: u64,
    pub status: MigrationStatus,
    #[serde(default)]
    pub last_source_change_vector: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardBucketRange {
    pub bucket_range_start: u32,
    pub shard_number: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingConfiguration {
    pub shards: BTreeMap<u32, DatabaseTopology>,
    pub bucket_ranges: Vec<ShardBucketRange>,
    #[serde(default)]
    pub bucket_migrations: BTreeMap<u32, ShardBucketMigration>,
}

fn conflict(msg: String) -> anyhow::Error {
    KeelError::MigrationConflict(msg).into()
}

impl ShardingConfiguration {
    /// Шарды с равными долями пространства бакетов (по порядку номеров).
    pub fn with_shards(shards: BTreeMap<u32, DatabaseTopology>) -> Result<Self> {
        if shards.is_empty() {
            return Err(KeelError::InvalidTopology("sharded database needs at least one shard".into()).into());
        }
        let n = shards.len() as u64;
        let bucket_ranges = shards
            .keys()
            .enumerate()
            .map(|(i, &shard)| ShardBucketRange {
                bucket_range_start: (i as u64 * NUMBER_OF_BUCKETS as u64 / n) as u32,
                shard_number: shard,
            })
            .collect();
        Ok(Self {
            shards,
            bucket_ranges,
            bucket_migrations: BTreeMap::new(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        for t in self.shards.values() {
            t.validate()?;
        }
        let mut prev: Option<u32> = None;
        for r in &self.bucket_ranges {
            if prev.map_or(r.bucket_range_start != 0, |p| r.bucket_range_start <= p) {
                return Err(KeelError::InvalidTopology(format!(
                    "bucket ranges must start at 0 and be strictly increasing (got {})",
                    r.bucket_range_start
                ))
                .into());
            }
            if !self.shards.contains_key(&r.shard_number) {
                return Err(KeelError::InvalidTopology(format!(
                    "bucket range {} points at unknown shard {}",
                    r.bucket_range_start, r.shard_number
                ))
                .into());
            }
            prev = Some(r.bucket_range_start);
        }
        Ok(())
    }

    pub fn shard_for_bucket(&self, bucket: u32) -> Option<u32> {
        let idx = self
            .bucket_ranges
            .partition_point(|r| r.bucket_range_start <= bucket);
        idx.checked_sub(1).map(|i| self.bucket_ranges[i].shard_number)
    }

    /// (бакет, шард) для id документа.
    pub fn shard_for_id(&self, id: &str) -> Option<(u32, u32)> {
        let bucket = get_bucket_for(id);
        self.shard_for_bucket(bucket).map(|s| (bucket, s))
    }

    pub fn migration(&self, bucket: u32) -> Option<&ShardBucketMigration> {
        self.bucket_migrations.get(&bucket)
    }

    /// Миграция, которая ещё не передала владение.
    pub fn active_migration(&self) -> Option<&ShardBucketMigration> {
        self.bucket_migrations
            .values()
            .find(|m| m.status < MigrationStatus::OwnershipTransferred)
    }

    pub fn start_bucket_migration(
        &mut self,
        bucket: u32,
        source_shard: u32,
        destination_shard: u32,
        migration_index: u64,
    ) -> Result<()> {
        if bucket >= NUMBER_OF_BUCKETS {
            return Err(conflict(format!(
                "bucket {} is out of range (0..{})",
                bucket, NUMBER_OF_BUCKETS
            )));
        }
        if let Some(active) = self.active_migration() {
            return Err(conflict(format!(
                "bucket {} is already {} from shard {} to shard {}",
                active.bucket, active.status, active.source_shard, active.destination_shard
            )));
        }
        if let Some(m) = self.bucket_migrations.get(&bucket) {
            return Err(conflict(format!(
                "bucket {} already has a migration record ({})",
                bucket, m.status
            )));
        }
        if source_shard == destination_shard {
            return Err(conflict(format!(
                "bucket {}: source and destination are both shard {}",
                bucket, source_shard
            )));
        }
        for shard in [source_shard, destination_shard] {
            if !self.shards.contains_key(&shard) {
                return Err(conflict(format!("bucket {}: unknown shard {}", bucket, shard)));
            }
        }
        if self.shard_for_bucket(bucket) != Some(source_shard) {
            return Err(conflict(format!(
                "bucket {} does not belong to shard {}",
                bucket, source_shard
            )));
        }

        self.bucket_migrations.insert(
            bucket,
            ShardBucketMigration {
                bucket,
                source_shard,
                destination_shard,
                migration_index,
                status: MigrationStatus::Moving,
                last_source_change_vector: None,
            },
        );
        record_migration_started();
        info!(
            "bucket {}: migration {} started, shard {} -> {}",
            bucket, migration_index, source_shard, destination_shard
        );
        Ok(())
    }

    fn migration_at(
        &mut self,
        bucket: u32,
        migration_index: u64,
        expected: MigrationStatus,
    ) -> Result<&mut ShardBucketMigration> {
        let m = self
            .bucket_migrations
            .get_mut(&bucket)
            .ok_or_else(|| conflict(format!("bucket {} is not migrating", bucket)))?;
        if m.migration_index != migration_index {
            return Err(conflict(format!(
                "bucket {}: migration index {} does not match current {}",
                bucket, migration_index, m.migration_index
            )));
        }
        if m.status != expected {
            return Err(conflict(format!(
                "bucket {} is {}, expected {}",
                bucket, m.status, expected
            )));
        }
        Ok(m)
    }

    /// Источник отправил всё: Moving → Moved.
    pub fn source_migration_completed(
        &mut self,
        bucket: u32,
        migration_index: u64,
        change_vector: impl Into<String>,
    ) -> Result<()> {
        let m = self.migration_at(bucket, migration_index, MigrationStatus::Moving)?;
        m.status = MigrationStatus::Moved;
        m.last_source_change_vector = Some(change_vector.into());
        info!("bucket {}: source finished sending", bucket);
        Ok(())
    }

    /// Приёмник подтвердил: Moved → OwnershipTransferred, бакет переходит к приёмнику.
    pub fn destination_migration_confirmed(&mut self, bucket: u32, migration_index: u64) -> Result<()> {
        let m = self.migration_at(bucket, migration_index, MigrationStatus::Moved)?;
        m.status = MigrationStatus::OwnershipTransferred;
        let dest = m.destination_shard;
        self.assign_bucket(bucket, dest);
        record_migration_completed();
        info!("bucket {}: ownership transferred to shard {}", bucket, dest);
        Ok(())
    }

    /// Удалить завершённую запись миграции.
    pub fn migration_cleanup(&mut self, bucket: u32, migration_index: u64) -> Result<()> {
        self.migration_at(bucket, migration_index, MigrationStatus::OwnershipTransferred)?;
        self.bucket_migrations.remove(&bucket);
        Ok(())
    }

    /// Переназначить один бакет, сохраняя владельцев соседей.
    fn assign_bucket(&mut self, bucket: u32, shard: u32) {
        let previous = self.shard_for_bucket(bucket);
        let mut starts: BTreeMap<u32, u32> = self
            .bucket_ranges
            .iter()
            .map(|r| (r.bucket_range_start, r.shard_number))
            .collect();
        if let (Some(prev), Some(next)) = (previous, bucket.checked_add(1)) {
            if next < NUMBER_OF_BUCKETS {
                starts.entry(next).or_insert(prev);
            }
        }
        starts.insert(bucket, shard);

        let mut ranges: Vec<ShardBucketRange> = Vec::with_capacity(starts.len());
        for (start, shard) in starts {
            if ranges.last().map_or(false, |r| r.shard_number == shard) {
                continue;
            }
            ranges.push(ShardBucketRange {
                bucket_range_start: start,
                shard_number: shard,
            });
        }
        self.bucket_ranges = ranges;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_shards() -> ShardingConfiguration {
        let mut shards = BTreeMap::new();
        shards.insert(0, DatabaseTopology::with_members(["A"]).unwrap());
        shards.insert(1, DatabaseTopology::with_members(["B"]).unwrap());
        ShardingConfiguration::with_shards(shards).unwrap()
    }

    #[test]
    fn even_split() {
        let s = two_shards();
        assert_eq!(s.shard_for_bucket(0), Some(0));
        assert_eq!(s.shard_for_bucket(NUMBER_OF_BUCKETS / 2 - 1), Some(0));
        assert_eq!(s.shard_for_bucket(NUMBER_OF_BUCKETS / 2), Some(1));
        assert_eq!(s.shard_for_bucket(NUMBER_OF_BUCKETS - 1), Some(1));
        s.validate().unwrap();
    }

    #[test]
    fn single_bucket_reassignment_keeps_neighbours() {
        let mut s = two_shards();
        s.assign_bucket(5, 1);
        assert_eq!(s.shard_for_bucket(4), Some(0));
        assert_eq!(s.shard_for_bucket(5), Some(1));
        assert_eq!(s.shard_for_bucket(6), Some(0));
        s.validate().unwrap();
        s.assign_bucket(5, 0);
        assert_eq!(s.bucket_ranges.len(), 2);
    }

    #[test]
    fn bucket_is_case_insensitive() {
        assert_eq!(get_bucket_for("Users/1"), get_bucket_for("users/1"));
        assert!(get_bucket_for("orders/42") < NUMBER_OF_BUCKETS);
    }
}

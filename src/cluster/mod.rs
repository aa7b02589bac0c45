//! cluster — топология базы, владение задачами и бакетами.
//!
//! Чисто in-memory слой, пересобираемый из персистентной записи базы (DatabaseRecord).
//!
//! Layout:
//! - topology.rs — DatabaseTopology, роли, DatabaseTask, whose_task_is_it, get_destinations
//! - changes.rs  — ReplicationNode и find_connection_changes (sorted-merge diff)
//! - sharding.rs — бакеты (2^20), ShardingConfiguration, миграции бакетов
//! - record.rs   — DatabaseRecord (JSON) и TopologyStore (copy-on-write снапшоты)

pub mod changes;
pub mod record;
pub mod sharding;
pub mod topology;

pub use changes::{find_connection_changes, ConnectionChanges, ReplicationKind, ReplicationNode};
pub use record::{DatabaseRecord, TopologyStore};
pub use sharding::{
    get_bucket_for, MigrationStatus, ShardBucketMigration, ShardBucketRange, ShardingConfiguration,
    NUMBER_OF_BUCKETS,
};
pub use topology::{
    resolve_owner, DatabaseTask, DatabaseTopology, NamedTask, NodeRole, PromotableTask, RachisState,
};

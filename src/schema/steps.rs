//! schema/steps — шаги апгрейда.
//!
//! Каждый шаг меняет только страницу 0 (feature bits / статистика корня);
//! версию выставляет SchemaUpgrader после успешного шага.

use anyhow::Result;

use super::{
    StorageType, FEATURE_DOCS_COUNTERS, FEATURE_DOCS_REVISION_BIN, FEATURE_DOCS_TIMESERIES_ROLLUP,
    FEATURE_INDEX_FIELD_CACHE, FEATURE_INDEX_SPATIAL_V2, FEATURE_SERVER_COMPACT_KEYS,
};
use crate::env::WriteTransaction;

pub type UpgradeFn = fn(&mut WriteTransaction<'_>) -> Result<()>;

/// (storage, from, to, run)
pub(crate) const BUILTIN_STEPS: &[(StorageType, u32, u32, UpgradeFn)] = &[
    (StorageType::Server, 60_000, 60_001, server_from_60_000),
    (StorageType::Documents, 60_000, 60_001, documents_from_60_000),
    (StorageType::Documents, 60_001, 60_002, documents_from_60_001),
    (StorageType::Documents, 60_004, 60_005, documents_from_60_004),
    (StorageType::Index, 60_000, 60_001, index_from_60_000),
    (StorageType::Index, 60_001, 60_002, index_from_60_001),
];

fn add_features(tx: &mut WriteTransaction<'_>, bits: u32) -> Result<()> {
    let hdr = tx.env_header()?;
    tx.set_features(hdr.features | bits)
}

fn server_from_60_000(tx: &mut WriteTransaction<'_>) -> Result<()> {
    add_features(tx, FEATURE_SERVER_COMPACT_KEYS)
}

fn documents_from_60_000(tx: &mut WriteTransaction<'_>) -> Result<()> {
    add_features(tx, FEATURE_DOCS_REVISION_BIN)
}

// 60_002/60_003 пропущены: шаг ведёт сразу к 60_004 через skip-list.
fn documents_from_60_001(tx: &mut WriteTransaction<'_>) -> Result<()> {
    add_features(tx, FEATURE_DOCS_COUNTERS)
}

fn documents_from_60_004(tx: &mut WriteTransaction<'_>) -> Result<()> {
    let hdr = tx.env_header()?;
    let mut root = hdr.root;
    // с 60_005 пустое дерево имеет глубину 1
    root.depth = root.depth.max(1);
    tx.set_root(root)?;
    add_features(tx, FEATURE_DOCS_TIMESERIES_ROLLUP)
}

fn index_from_60_000(tx: &mut WriteTransaction<'_>) -> Result<()> {
    add_features(tx, FEATURE_INDEX_FIELD_CACHE)
}

fn index_from_60_001(tx: &mut WriteTransaction<'_>) -> Result<()> {
    add_features(tx, FEATURE_INDEX_SPATIAL_V2)
}

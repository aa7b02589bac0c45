//! schema — типы хранилищ и цепочка апгрейдов версии схемы.
//!
//! - mod.rs      — StorageType, текущие версии, skip-list, feature bits.
//! - upgrader.rs — SchemaUpgrader: шаг за шагом, одна write-транзакция на шаг.
//! - steps.rs    — сами шаги (<Type>_From_<version>).
//!
//! Версия схемы живёт в странице 0 (EnvHeader) и меняется транзакционно.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod steps;
pub mod upgrader;

pub use upgrader::{upgrade_to_current, SchemaUpgrader, UpgradeOutcome, UpgradeStep};

pub const SERVER_VERSION: u32 = 60_001;
pub const CONFIGURATION_VERSION: u32 = 60_000;
pub const DOCUMENTS_VERSION: u32 = 60_005;
pub const INDEX_VERSION: u32 = 60_002;

/// Версии Documents, которые нельзя обновить на месте (только через `keeldb recover`).
pub const DOCUMENTS_SKIPPED_VERSIONS: &[u32] = &[60_002, 60_003];

// Feature bits в EnvHeader::features, выставляются шагами апгрейда.
pub const FEATURE_SERVER_COMPACT_KEYS: u32 = 0x0001;
pub const FEATURE_DOCS_REVISION_BIN: u32 = 0x0002;
pub const FEATURE_DOCS_COUNTERS: u32 = 0x0004;
pub const FEATURE_DOCS_TIMESERIES_ROLLUP: u32 = 0x0008;
pub const FEATURE_INDEX_FIELD_CACHE: u32 = 0x0010;
pub const FEATURE_INDEX_SPATIAL_V2: u32 = 0x0020;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    Server,
    Configuration,
    Documents,
    Index,
}

impl StorageType {
    pub const ALL: [StorageType; 4] = [
        StorageType::Server,
        StorageType::Configuration,
        StorageType::Documents,
        StorageType::Index,
    ];

    pub fn as_u8(self) -> u8 {
        match self {
            StorageType::Server => 1,
            StorageType::Configuration => 2,
            StorageType::Documents => 3,
            StorageType::Index => 4,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(StorageType::Server),
            2 => Ok(StorageType::Configuration),
            3 => Ok(StorageType::Documents),
            4 => Ok(StorageType::Index),
            other => Err(anyhow!("unknown storage type {}", other)),
        }
    }

    pub fn current_version(self) -> u32 {
        match self {
            StorageType::Server => SERVER_VERSION,
            StorageType::Configuration => CONFIGURATION_VERSION,
            StorageType::Documents => DOCUMENTS_VERSION,
            StorageType::Index => INDEX_VERSION,
        }
    }

    pub fn skipped_versions(self) -> &'static [u32] {
        match self {
            StorageType::Documents => DOCUMENTS_SKIPPED_VERSIONS,
            _ => &[],
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageType::Server => "Server",
            StorageType::Configuration => "Configuration",
            StorageType::Documents => "Documents",
            StorageType::Index => "Index",
        };
        f.write_str(s)
    }
}

impl FromStr for StorageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(StorageType::Server),
            "configuration" | "config" => Ok(StorageType::Configuration),
            "documents" | "docs" => Ok(StorageType::Documents),
            "index" => Ok(StorageType::Index),
            other => Err(anyhow!(
                "unknown storage type '{}' (expected server|configuration|documents|index)",
                other
            )),
        }
    }
}

//! schema/upgrader — цепочка апгрейдов версии схемы.
//!
//! upgrade():
//! - версия из skip-list → UnsupportedSchemaVersion до запуска какого-либо шага;
//! - шага для версии нет → applied=false;
//! - иначе шаг, переход к его target, прыжок через версии из skip-list,
//!   запись версии в страницу 0 в той же транзакции.
//!
//! upgrade_to_current(): по транзакции на шаг, пока не дойдём до текущей версии.

use anyhow::Result;
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;

use super::steps::{UpgradeFn, BUILTIN_STEPS};
use super::StorageType;
use crate::env::{StorageEnvironment, WriteTransaction};
use crate::error::KeelError;
use crate::metrics::record_schema_upgrade_step;

#[derive(Clone)]
pub struct UpgradeStep {
    pub name: String,
    pub from: u32,
    pub to: u32,
    pub run: UpgradeFn,
}

impl std::fmt::Debug for UpgradeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeStep")
            .field("name", &self.name)
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpgradeOutcome {
    pub applied: bool,
    pub step: Option<String>,
    pub new_version: u32,
}

#[derive(Debug, Clone)]
pub struct SchemaUpgrader {
    storage: StorageType,
    steps: BTreeMap<u32, UpgradeStep>,
    skipped: Vec<u32>,
}

/// Имя шага: `Documents_From_60_000`.
pub fn step_name(storage: StorageType, from: u32) -> String {
    format!("{}_From_{}_{:03}", storage, from / 1000, from % 1000)
}

impl SchemaUpgrader {
    /// Пустой апгрейдер (без шагов) для типа хранилища.
    pub fn new(storage: StorageType) -> Self {
        Self {
            storage,
            steps: BTreeMap::new(),
            skipped: storage.skipped_versions().to_vec(),
        }
    }

    /// Апгрейдер со встроенными шагами.
    pub fn for_storage(storage: StorageType) -> Self {
        let mut u = Self::new(storage);
        for &(st, from, to, run) in BUILTIN_STEPS {
            if st == storage {
                u.register(from, to, run);
            }
        }
        u
    }

    pub fn storage(&self) -> StorageType {
        self.storage
    }

    pub fn register(&mut self, from: u32, to: u32, run: UpgradeFn) -> &mut Self {
        let name = step_name(self.storage, from);
        self.steps.insert(from, UpgradeStep { name, from, to, run });
        self
    }

    pub fn steps(&self) -> impl Iterator<Item = &UpgradeStep> {
        self.steps.values()
    }

    pub fn is_skipped(&self, version: u32) -> bool {
        self.skipped.contains(&version)
    }

    /// Один шаг в рамках переданной транзакции.
    pub fn upgrade(&self, tx: &mut WriteTransaction<'_>, current: u32) -> Result<UpgradeOutcome> {
        if self.is_skipped(current) {
            return Err(KeelError::UnsupportedSchemaVersion {
                storage: self.storage,
                version: current,
            }
            .into());
        }
        let step = match self.steps.get(&current) {
            Some(s) => s,
            None => {
                return Ok(UpgradeOutcome {
                    applied: false,
                    step: None,
                    new_version: current,
                })
            }
        };

        (step.run)(tx)?;
        let mut version = step.to;
        while self.is_skipped(version) {
            debug!("schema: {} version {} is skipped", self.storage, version);
            version += 1;
        }
        tx.set_schema_version(version)?;
        record_schema_upgrade_step();
        info!(
            "schema: {} applied ({} -> {})",
            step.name, current, version
        );
        Ok(UpgradeOutcome {
            applied: true,
            step: Some(step.name.clone()),
            new_version: version,
        })
    }
}

/// Довести окружение до текущей версии его типа хранилища.
/// Возвращает имена применённых шагов.
pub fn upgrade_to_current(env: &StorageEnvironment) -> Result<Vec<String>> {
    let mut applied = Vec::new();
    loop {
        let mut tx = env.write_txn()?;
        let hdr = tx.env_header()?;
        let storage = hdr.storage_type;
        let current = hdr.schema_version;
        let target = storage.current_version();
        if current == target {
            return Ok(applied);
        }
        if current > target {
            return Err(KeelError::SchemaTooNew {
                storage,
                version: current,
                supported: target,
            }
            .into());
        }

        let upgrader = SchemaUpgrader::for_storage(storage);
        let out = upgrader.upgrade(&mut tx, current)?;
        if !out.applied {
            return Err(KeelError::MissingUpgradeStep {
                storage,
                version: current,
            }
            .into());
        }
        tx.commit()?;
        if let Some(name) = out.step {
            applied.push(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_names_follow_storage_and_version() {
        assert_eq!(step_name(StorageType::Documents, 60_000), "Documents_From_60_000");
        assert_eq!(step_name(StorageType::Index, 60_001), "Index_From_60_001");
    }

    #[test]
    fn builtin_chains_reach_current_versions() {
        for st in StorageType::ALL {
            let u = SchemaUpgrader::for_storage(st);
            let mut v = 60_000;
            while v < st.current_version() {
                let step = u.steps.get(&v).unwrap_or_else(|| panic!("{} has no step at {}", st, v));
                v = step.to;
                while u.is_skipped(v) {
                    v += 1;
                }
            }
            assert_eq!(v, st.current_version());
        }
    }
}

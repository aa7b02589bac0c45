//! error — типизированные ошибки, по которым вызывающий принимает решения.
//!
//! Библиотека возвращает `anyhow::Result`; варианты KeelError едут внутри
//! `anyhow::Error` и достаются через `downcast_ref::<KeelError>()`
//! (или [`is_catastrophic`] по всей цепочке).
//!
//! Severity:
//! - Recoverable  — глотается или повторяется на месте (повторный dispose буфера).
//! - Error        — упал этот запрос, окружение работает дальше.
//! - Catastrophic — без оператора повторять бесполезно.

use std::fmt;
use thiserror::Error;

use crate::schema::StorageType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Recoverable,
    Error,
    Catastrophic,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Recoverable => write!(f, "RECOVERABLE"),
            Severity::Error => write!(f, "ERROR"),
            Severity::Catastrophic => write!(f, "CATASTROPHIC"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum KeelError {
    #[error("integrity failure in {what}: {detail}")]
    IntegrityFailure { what: String, detail: String },

    #[error("storage environment halted after a catastrophic failure: {reason}")]
    EnvironmentHalted { reason: String },

    #[error("no available owner for task '{task}' ({candidates} candidates, none enabled)")]
    NoOwnerAvailable { task: String, candidates: usize },

    #[error("bucket migration conflict: {0}")]
    MigrationConflict(String),

    #[error(
        "{storage} storage is at schema version {version}, which cannot be upgraded in place; \
         export the data with the offline recovery tool (`keeldb recover`) and import it into a new store"
    )]
    UnsupportedSchemaVersion { storage: StorageType, version: u32 },

    #[error("no schema upgrade step registered for {storage} storage at version {version}")]
    MissingUpgradeStep { storage: StorageType, version: u32 },

    #[error("{storage} storage schema version {version} is newer than supported {supported}")]
    SchemaTooNew { storage: StorageType, version: u32, supported: u32 },

    #[error("page {page} is beyond the allocated extent ({allocated} pages)")]
    PageOutOfRange { page: u64, allocated: u64 },

    #[error("native buffer already disposed")]
    AlreadyDisposed,

    #[error("invalid topology: {0}")]
    InvalidTopology(String),
}

impl KeelError {
    pub fn integrity(what: impl Into<String>, detail: impl Into<String>) -> Self {
        KeelError::IntegrityFailure {
            what: what.into(),
            detail: detail.into(),
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            KeelError::IntegrityFailure { .. }
            | KeelError::EnvironmentHalted { .. }
            | KeelError::UnsupportedSchemaVersion { .. }
            | KeelError::MissingUpgradeStep { .. }
            | KeelError::SchemaTooNew { .. } => Severity::Catastrophic,
            KeelError::NoOwnerAvailable { .. }
            | KeelError::MigrationConflict(_)
            | KeelError::PageOutOfRange { .. }
            | KeelError::InvalidTopology(_) => Severity::Error,
            KeelError::AlreadyDisposed => Severity::Recoverable,
        }
    }

    #[inline]
    pub fn is_catastrophic(&self) -> bool {
        self.severity() == Severity::Catastrophic
    }
}

/// Первый KeelError в цепочке anyhow.
pub fn keel_error(err: &anyhow::Error) -> Option<&KeelError> {
    err.chain().find_map(|e| e.downcast_ref::<KeelError>())
}

/// true, если хоть одно звено цепочки — катастрофический KeelError.
pub fn is_catastrophic(err: &anyhow::Error) -> bool {
    keel_error(err).map_or(false, KeelError::is_catastrophic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn catastrophic_survives_context() {
        let r: anyhow::Result<()> = Err(KeelError::integrity("page 7", "MAC mismatch").into());
        let err = r.context("read page").unwrap_err();
        assert!(is_catastrophic(&err));
        assert!(matches!(keel_error(&err), Some(KeelError::IntegrityFailure { .. })));
    }

    #[test]
    fn conflict_is_not_catastrophic() {
        let err: anyhow::Error = KeelError::MigrationConflict("bucket 5 is Moving".into()).into();
        assert!(!is_catastrophic(&err));
        assert_eq!(KeelError::AlreadyDisposed.severity(), Severity::Recoverable);
    }

    #[test]
    fn unsupported_version_names_tool() {
        let e = KeelError::UnsupportedSchemaVersion {
            storage: StorageType::Documents,
            version: 60_002,
        };
        let msg = e.to_string();
        assert!(msg.contains("Documents"));
        assert!(msg.contains("60002"));
        assert!(msg.contains("keeldb recover"));
    }
}

//! Lightweight global metrics for KeelDB.
//!
//! Потокобезопасные атомарные счётчики для подсистем:
//! - Journal (commit, fsync, replay, torn truncation)
//! - Data file checkpoint
//! - Crypto (page/payload encrypt/decrypt, integrity failures)
//! - Commit gate
//! - Native memory cleaner
//! - Ownership resolution / bucket migrations
//! - Schema upgrades

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

// ----- Journal -----
static JOURNAL_COMMITS: AtomicU64 = AtomicU64::new(0);
static JOURNAL_BYTES_WRITTEN: AtomicU64 = AtomicU64::new(0);
static JOURNAL_FSYNC_CALLS: AtomicU64 = AtomicU64::new(0);
static JOURNAL_REPLAYED_TX: AtomicU64 = AtomicU64::new(0);
static JOURNAL_TORN_TRUNCATIONS: AtomicU64 = AtomicU64::new(0);

// ----- Checkpoint -----
static CHECKPOINTS: AtomicU64 = AtomicU64::new(0);
static PAGES_FLUSHED: AtomicU64 = AtomicU64::new(0);

// ----- Crypto -----
static PAGES_ENCRYPTED: AtomicU64 = AtomicU64::new(0);
static PAGES_DECRYPTED: AtomicU64 = AtomicU64::new(0);
static INTEGRITY_FAILURES: AtomicU64 = AtomicU64::new(0);

// ----- Commit gate -----
static COMMIT_SIGNALS: AtomicU64 = AtomicU64::new(0);

// ----- Cleaner -----
static CLEANER_TICKS: AtomicU64 = AtomicU64::new(0);
static CLEANER_SKIPPED_TICKS: AtomicU64 = AtomicU64::new(0);
static CLEANER_RECLAIMED_BUFFERS: AtomicU64 = AtomicU64::new(0);
static CLEANER_RECLAIMED_BYTES: AtomicU64 = AtomicU64::new(0);

// ----- Cluster -----
static OWNER_RESOLUTIONS: AtomicU64 = AtomicU64::new(0);
static OWNER_REHASHES: AtomicU64 = AtomicU64::new(0);
static MIGRATIONS_STARTED: AtomicU64 = AtomicU64::new(0);
static MIGRATIONS_COMPLETED: AtomicU64 = AtomicU64::new(0);

// ----- Schema -----
static SCHEMA_UPGRADE_STEPS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    // Journal
    pub journal_commits: u64,
    pub journal_bytes_written: u64,
    pub journal_fsync_calls: u64,
    pub journal_replayed_tx: u64,
    pub journal_torn_truncations: u64,

    // Checkpoint
    pub checkpoints: u64,
    pub pages_flushed: u64,

    // Crypto
    pub pages_encrypted: u64,
    pub pages_decrypted: u64,
    pub integrity_failures: u64,

    // Commit gate
    pub commit_signals: u64,

    // Cleaner
    pub cleaner_ticks: u64,
    pub cleaner_skipped_ticks: u64,
    pub cleaner_reclaimed_buffers: u64,
    pub cleaner_reclaimed_bytes: u64,

    // Cluster
    pub owner_resolutions: u64,
    pub owner_rehashes: u64,
    pub migrations_started: u64,
    pub migrations_completed: u64,

    // Schema
    pub schema_upgrade_steps: u64,
}

impl MetricsSnapshot {
    pub fn avg_journal_bytes_per_commit(&self) -> f64 {
        if self.journal_commits == 0 {
            0.0
        } else {
            self.journal_bytes_written as f64 / self.journal_commits as f64
        }
    }

    pub fn avg_rehashes_per_resolution(&self) -> f64 {
        if self.owner_resolutions == 0 {
            0.0
        } else {
            self.owner_rehashes as f64 / self.owner_resolutions as f64
        }
    }
}

// ----- Recorders (Journal) -----
pub fn record_journal_commit(bytes: usize) {
    JOURNAL_COMMITS.fetch_add(1, Ordering::Relaxed);
    JOURNAL_BYTES_WRITTEN.fetch_add(bytes as u64, Ordering::Relaxed);
}

pub fn record_journal_fsync() {
    JOURNAL_FSYNC_CALLS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_journal_replayed(tx: u64) {
    JOURNAL_REPLAYED_TX.fetch_add(tx, Ordering::Relaxed);
}

pub fn record_journal_torn_truncation() {
    JOURNAL_TORN_TRUNCATIONS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Checkpoint) -----
pub fn record_checkpoint(pages: u64) {
    CHECKPOINTS.fetch_add(1, Ordering::Relaxed);
    PAGES_FLUSHED.fetch_add(pages, Ordering::Relaxed);
}

// ----- Recorders (Crypto) -----
pub fn record_page_encrypted() {
    PAGES_ENCRYPTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_page_decrypted() {
    PAGES_DECRYPTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_integrity_failure() {
    INTEGRITY_FAILURES.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Commit gate) -----
pub fn record_commit_signal() {
    COMMIT_SIGNALS.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Cleaner) -----
pub fn record_cleaner_tick() {
    CLEANER_TICKS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cleaner_skipped_tick() {
    CLEANER_SKIPPED_TICKS.fetch_add(1, Ordering::Relaxed);
}

pub fn record_cleaner_reclaimed(bytes: usize) {
    CLEANER_RECLAIMED_BUFFERS.fetch_add(1, Ordering::Relaxed);
    CLEANER_RECLAIMED_BYTES.fetch_add(bytes as u64, Ordering::Relaxed);
}

// ----- Recorders (Cluster) -----
pub fn record_owner_resolution(rehashes: u64) {
    OWNER_RESOLUTIONS.fetch_add(1, Ordering::Relaxed);
    OWNER_REHASHES.fetch_add(rehashes, Ordering::Relaxed);
}

pub fn record_migration_started() {
    MIGRATIONS_STARTED.fetch_add(1, Ordering::Relaxed);
}

pub fn record_migration_completed() {
    MIGRATIONS_COMPLETED.fetch_add(1, Ordering::Relaxed);
}

// ----- Recorders (Schema) -----
pub fn record_schema_upgrade_step() {
    SCHEMA_UPGRADE_STEPS.fetch_add(1, Ordering::Relaxed);
}

// ----- Snapshot / Reset -----
pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        journal_commits: JOURNAL_COMMITS.load(Ordering::Relaxed),
        journal_bytes_written: JOURNAL_BYTES_WRITTEN.load(Ordering::Relaxed),
        journal_fsync_calls: JOURNAL_FSYNC_CALLS.load(Ordering::Relaxed),
        journal_replayed_tx: JOURNAL_REPLAYED_TX.load(Ordering::Relaxed),
        journal_torn_truncations: JOURNAL_TORN_TRUNCATIONS.load(Ordering::Relaxed),

        checkpoints: CHECKPOINTS.load(Ordering::Relaxed),
        pages_flushed: PAGES_FLUSHED.load(Ordering::Relaxed),

        pages_encrypted: PAGES_ENCRYPTED.load(Ordering::Relaxed),
        pages_decrypted: PAGES_DECRYPTED.load(Ordering::Relaxed),
        integrity_failures: INTEGRITY_FAILURES.load(Ordering::Relaxed),

        commit_signals: COMMIT_SIGNALS.load(Ordering::Relaxed),

        cleaner_ticks: CLEANER_TICKS.load(Ordering::Relaxed),
        cleaner_skipped_ticks: CLEANER_SKIPPED_TICKS.load(Ordering::Relaxed),
        cleaner_reclaimed_buffers: CLEANER_RECLAIMED_BUFFERS.load(Ordering::Relaxed),
        cleaner_reclaimed_bytes: CLEANER_RECLAIMED_BYTES.load(Ordering::Relaxed),

        owner_resolutions: OWNER_RESOLUTIONS.load(Ordering::Relaxed),
        owner_rehashes: OWNER_REHASHES.load(Ordering::Relaxed),
        migrations_started: MIGRATIONS_STARTED.load(Ordering::Relaxed),
        migrations_completed: MIGRATIONS_COMPLETED.load(Ordering::Relaxed),

        schema_upgrade_steps: SCHEMA_UPGRADE_STEPS.load(Ordering::Relaxed),
    }
}

pub fn reset() {
    JOURNAL_COMMITS.store(0, Ordering::Relaxed);
    JOURNAL_BYTES_WRITTEN.store(0, Ordering::Relaxed);
    JOURNAL_FSYNC_CALLS.store(0, Ordering::Relaxed);
    JOURNAL_REPLAYED_TX.store(0, Ordering::Relaxed);
    JOURNAL_TORN_TRUNCATIONS.store(0, Ordering::Relaxed);

    CHECKPOINTS.store(0, Ordering::Relaxed);
    PAGES_FLUSHED.store(0, Ordering::Relaxed);

    PAGES_ENCRYPTED.store(0, Ordering::Relaxed);
    PAGES_DECRYPTED.store(0, Ordering::Relaxed);
    INTEGRITY_FAILURES.store(0, Ordering::Relaxed);

    COMMIT_SIGNALS.store(0, Ordering::Relaxed);

    CLEANER_TICKS.store(0, Ordering::Relaxed);
    CLEANER_SKIPPED_TICKS.store(0, Ordering::Relaxed);
    CLEANER_RECLAIMED_BUFFERS.store(0, Ordering::Relaxed);
    CLEANER_RECLAIMED_BYTES.store(0, Ordering::Relaxed);

    OWNER_RESOLUTIONS.store(0, Ordering::Relaxed);
    OWNER_REHASHES.store(0, Ordering::Relaxed);
    MIGRATIONS_STARTED.store(0, Ordering::Relaxed);
    MIGRATIONS_COMPLETED.store(0, Ordering::Relaxed);

    SCHEMA_UPGRADE_STEPS.store(0, Ordering::Relaxed);
}

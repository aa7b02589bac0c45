//! Centralized configuration and builder for KeelDB.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - KeelConfig::from_env() reads KEEL_* variables on top of the defaults.
//! - EnvBuilder collects overrides and opens/creates a StorageEnvironment.
//!
//! Defaults favour durability:
//! - journal_fsync = true (every non-lazy commit is fsynced before it is visible)
//! - flush_on_close = true (checkpoint journal into the data file on drop)

use anyhow::Result;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::consts::DEFAULT_PAGE_SIZE;
use crate::crypto::KeyProvider;
use crate::env::StorageEnvironment;
use crate::schema::StorageType;

/// Top-level configuration for a storage environment.
#[derive(Clone, Debug)]
pub struct KeelConfig {
    /// Page size for newly created environments (existing ones use meta).
    /// Env: KEEL_PAGE_SIZE (default 8192)
    pub page_size: u32,

    /// Data file size reserved on create, in pages.
    /// Env: KEEL_INITIAL_FILE_PAGES (default 64)
    pub initial_file_pages: u64,

    /// fsync the journal on every non-lazy commit.
    /// Env: KEEL_JOURNAL_FSYNC (default true)
    pub journal_fsync: bool,

    /// zstd-compress journal payloads when it makes them smaller.
    /// Env: KEEL_JOURNAL_COMPRESSION (default true)
    pub journal_compression: bool,

    /// Env: KEEL_JOURNAL_ZSTD_LEVEL (default 1)
    pub journal_compression_level: i32,

    /// Checkpoint automatically once this many unflushed page versions pile up.
    /// 0 disables auto-flush.
    /// Env: KEEL_FLUSH_THRESHOLD_PAGES (default 1024)
    pub flush_threshold_pages: usize,

    /// Checkpoint and mark a clean shutdown when the environment is dropped.
    /// Env: KEEL_FLUSH_ON_CLOSE (default true)
    pub flush_on_close: bool,

    // ---------- Encryption ----------
    /// Encrypt pages and journal payloads (AES-256-GCM). Create-time only.
    /// Env: KEEL_ENCRYPTION = 0|1|true|false (default false)
    pub encryption_enabled: bool,

    /// Key identifier requested from the KeyProvider.
    /// Env: KEEL_KEY_ID (default: provider's default)
    pub encryption_key_id: Option<String>,

    /// Nonce counter values reserved (and fsynced) per block.
    /// Env: KEEL_NONCE_RESERVE (default 4096)
    pub nonce_reserve_block: u64,

    // ---------- Schema ----------
    /// Run the schema upgrade chain when opening an older environment.
    /// Env: KEEL_AUTO_SCHEMA_UPGRADE (default true)
    pub auto_schema_upgrade: bool,

    // ---------- Native memory cleaner ----------
    /// Период тика чистильщика пула буферов окружения; 0 — без фонового потока.
    /// Env: KEEL_CLEANER_PERIOD_MS (default 60000)
    pub cleaner_period_ms: u64,

    /// Буферы, простаивающие дольше, освобождаются на обычном тике.
    /// Env: KEEL_CLEANER_IDLE_MS (default 300000)
    pub cleaner_idle_ms: u64,
}

impl Default for KeelConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            initial_file_pages: 64,
            journal_fsync: true,
            journal_compression: true,
            journal_compression_level: 1,
            flush_threshold_pages: 1024,
            flush_on_close: true,

            encryption_enabled: false,
            encryption_key_id: None,
            nonce_reserve_block: 4096,

            auto_schema_upgrade: true,

            cleaner_period_ms: 60_000,
            cleaner_idle_ms: 5 * 60_000,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "yes" || s == "on"
    })
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl KeelConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_parse::<u32>("KEEL_PAGE_SIZE") {
            cfg.page_size = n;
        }
        if let Some(n) = env_parse::<u64>("KEEL_INITIAL_FILE_PAGES") {
            cfg.initial_file_pages = n;
        }
        if let Some(on) = env_flag("KEEL_JOURNAL_FSYNC") {
            cfg.journal_fsync = on;
        }
        if let Some(on) = env_flag("KEEL_JOURNAL_COMPRESSION") {
            cfg.journal_compression = on;
        }
        if let Some(n) = env_parse::<i32>("KEEL_JOURNAL_ZSTD_LEVEL") {
            cfg.journal_compression_level = n;
        }
        if let Some(n) = env_parse::<usize>("KEEL_FLUSH_THRESHOLD_PAGES") {
            cfg.flush_threshold_pages = n;
        }
        if let Some(on) = env_flag("KEEL_FLUSH_ON_CLOSE") {
            cfg.flush_on_close = on;
        }

        if let Some(on) = env_flag("KEEL_ENCRYPTION") {
            cfg.encryption_enabled = on;
        }
        if let Ok(v) = std::env::var("KEEL_KEY_ID") {
            let s = v.trim();
            if !s.is_empty() {
                cfg.encryption_key_id = Some(s.to_string());
            }
        }
        if let Some(n) = env_parse::<u64>("KEEL_NONCE_RESERVE") {
            cfg.nonce_reserve_block = n.max(1);
        }

        if let Some(on) = env_flag("KEEL_AUTO_SCHEMA_UPGRADE") {
            cfg.auto_schema_upgrade = on;
        }

        if let Some(n) = env_parse::<u64>("KEEL_CLEANER_PERIOD_MS") {
            cfg.cleaner_period_ms = n;
        }
        if let Some(n) = env_parse::<u64>("KEEL_CLEANER_IDLE_MS") {
            cfg.cleaner_idle_ms = n;
        }

        cfg
    }

    pub fn with_page_size(mut self, ps: u32) -> Self {
        self.page_size = ps;
        self
    }

    pub fn with_initial_file_pages(mut self, pages: u64) -> Self {
        self.initial_file_pages = pages;
        self
    }

    pub fn with_journal_fsync(mut self, on: bool) -> Self {
        self.journal_fsync = on;
        self
    }

    pub fn with_journal_compression(mut self, on: bool) -> Self {
        self.journal_compression = on;
        self
    }

    pub fn with_flush_threshold_pages(mut self, pages: usize) -> Self {
        self.flush_threshold_pages = pages;
        self
    }

    pub fn with_flush_on_close(mut self, on: bool) -> Self {
        self.flush_on_close = on;
        self
    }

    pub fn with_encryption(mut self, on: bool) -> Self {
        self.encryption_enabled = on;
        self
    }

    pub fn with_encryption_key_id<S: Into<String>>(mut self, kid: Option<S>) -> Self {
        self.encryption_key_id = kid.map(Into::into);
        self
    }

    pub fn with_nonce_reserve_block(mut self, n: u64) -> Self {
        self.nonce_reserve_block = n.max(1);
        self
    }

    pub fn with_auto_schema_upgrade(mut self, on: bool) -> Self {
        self.auto_schema_upgrade = on;
        self
    }

    pub fn with_cleaner_period_ms(mut self, ms: u64) -> Self {
        self.cleaner_period_ms = ms;
        self
    }

    pub fn with_cleaner_idle_ms(mut self, ms: u64) -> Self {
        self.cleaner_idle_ms = ms;
        self
    }
}

impl fmt::Display for KeelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "KeelConfig {{ \
             page_size: {}, \
             initial_file_pages: {}, \
             journal_fsync: {}, \
             journal_compression: {} (level {}), \
             flush_threshold_pages: {}, \
             flush_on_close: {}, \
             encryption_enabled: {}, \
             encryption_key_id: {}, \
             nonce_reserve_block: {}, \
             auto_schema_upgrade: {}, \
             cleaner_period_ms: {}, \
             cleaner_idle_ms: {} \
             }}",
            self.page_size,
            self.initial_file_pages,
            self.journal_fsync,
            self.journal_compression,
            self.journal_compression_level,
            self.flush_threshold_pages,
            self.flush_on_close,
            self.encryption_enabled,
            self.encryption_key_id
                .as_deref()
                .unwrap_or("default(provider)"),
            self.nonce_reserve_block,
            self.auto_schema_upgrade,
            self.cleaner_period_ms,
            self.cleaner_idle_ms,
        )
    }
}

/// Builder that collects overrides and opens a StorageEnvironment.
/// `StorageEnvironment::builder()` returns this.
#[derive(Clone)]
pub struct EnvBuilder {
    cfg: KeelConfig,
    keys: Option<Arc<dyn KeyProvider>>,
}

impl Default for EnvBuilder {
    fn default() -> Self {
        // Start from env, then allow overrides.
        Self {
            cfg: KeelConfig::from_env(),
            keys: None,
        }
    }
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: KeelConfig::default(),
            keys: None,
        }
    }

    pub fn page_size(mut self, ps: u32) -> Self {
        self.cfg.page_size = ps;
        self
    }

    pub fn initial_file_pages(mut self, pages: u64) -> Self {
        self.cfg.initial_file_pages = pages;
        self
    }

    pub fn journal_fsync(mut self, on: bool) -> Self {
        self.cfg.journal_fsync = on;
        self
    }

    pub fn journal_compression(mut self, on: bool) -> Self {
        self.cfg.journal_compression = on;
        self
    }

    pub fn flush_threshold_pages(mut self, pages: usize) -> Self {
        self.cfg.flush_threshold_pages = pages;
        self
    }

    pub fn flush_on_close(mut self, on: bool) -> Self {
        self.cfg.flush_on_close = on;
        self
    }

    pub fn auto_schema_upgrade(mut self, on: bool) -> Self {
        self.cfg.auto_schema_upgrade = on;
        self
    }

    pub fn cleaner_period_ms(mut self, ms: u64) -> Self {
        self.cfg.cleaner_period_ms = ms;
        self
    }

    pub fn cleaner_idle_ms(mut self, ms: u64) -> Self {
        self.cfg.cleaner_idle_ms = ms;
        self
    }

    /// Enable encryption with keys from `provider`.
    pub fn encrypted(mut self, provider: Arc<dyn KeyProvider>) -> Self {
        self.cfg.encryption_enabled = true;
        self.keys = Some(provider);
        self
    }

    pub fn key_id<S: Into<String>>(mut self, kid: S) -> Self {
        self.cfg.encryption_key_id = Some(kid.into());
        self
    }

    pub fn config(&self) -> &KeelConfig {
        &self.cfg
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> KeelConfig {
        self.cfg
    }

    pub fn create(self, root: &Path, storage: StorageType) -> Result<StorageEnvironment> {
        StorageEnvironment::create(root, self.cfg, storage, self.keys.as_deref())
    }

    pub fn open(self, root: &Path) -> Result<StorageEnvironment> {
        StorageEnvironment::open(root, self.cfg, self.keys.as_deref())
    }
}

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use KeelDB::consts::PAGE_HEADER_SIZE;
use KeelDB::{read_meta, EnvBuilder, KeelConfig, StaticKeyProvider, StorageEnvironment, StorageType};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("keeltest-builder-{prefix}-{pid}-{t}-{id}"))
}

#[test]
fn builder_overrides_defaults() {
    let cfg = EnvBuilder::from_default()
        .page_size(16384)
        .initial_file_pages(8)
        .journal_fsync(false)
        .journal_compression(false)
        .flush_threshold_pages(0)
        .flush_on_close(false)
        .auto_schema_upgrade(false)
        .key_id("rotated")
        .build();
    let def = KeelConfig::default();

    assert_eq!(cfg.page_size, 16384);
    assert_eq!(cfg.initial_file_pages, 8);
    assert!(!cfg.journal_fsync && def.journal_fsync);
    assert!(!cfg.journal_compression && def.journal_compression);
    assert_eq!(cfg.flush_threshold_pages, 0);
    assert!(!cfg.flush_on_close);
    assert!(!cfg.auto_schema_upgrade);
    assert_eq!(cfg.encryption_key_id.as_deref(), Some("rotated"));
    assert!(!cfg.encryption_enabled);
    assert_eq!(cfg.cleaner_period_ms, def.cleaner_period_ms);

    let plain = KeelConfig::default()
        .with_page_size(4096)
        .with_flush_on_close(false)
        .with_cleaner_idle_ms(10);
    assert_eq!(plain.page_size, 4096);
    assert!(!plain.flush_on_close);
    assert_eq!(plain.cleaner_idle_ms, 10);
}

#[test]
fn invalid_page_size_touches_nothing() {
    let root = unique_root("bad-ps");
    for ps in [0u32, 1000, 2048, 6000] {
        let r = EnvBuilder::from_default().page_size(ps).create(&root, StorageType::Server);
        assert!(r.is_err(), "page size {ps} must be rejected");
    }
    assert!(!root.exists());
}

#[test]
fn page_size_comes_from_meta_on_open() -> Result<()> {
    let root = unique_root("meta-ps");
    {
        let env = StorageEnvironment::builder()
            .page_size(8192)
            .journal_fsync(false)
            .create(&root, StorageType::Configuration)?;
        assert_eq!(env.page_size(), 8192);
        assert_eq!(env.storage_type(), StorageType::Configuration);
    }
    assert!(EnvBuilder::from_default().create(&root, StorageType::Configuration).is_err());

    let env = EnvBuilder::from_default().page_size(4096).open(&root)?;
    assert_eq!(env.page_size(), 8192);
    assert_eq!(read_meta(&root)?.page_size, 8192);
    assert_eq!(
        env.env_header()?.schema_version,
        StorageType::Configuration.current_version()
    );
    Ok(())
}

#[test]
fn uncompressed_journal_recovers_too() -> Result<()> {
    let root = unique_root("plain-journal");
    let builder = EnvBuilder::from_default()
        .page_size(4096)
        .journal_fsync(false)
        .journal_compression(false)
        .flush_threshold_pages(0)
        .flush_on_close(false);
    let page = {
        let env = builder.clone().create(&root, StorageType::Index)?;
        let mut tx = env.write_txn()?;
        let page = tx.allocate_pages(1)?;
        tx.modify_page(page)?[PAGE_HEADER_SIZE..].fill(0x61);
        tx.commit()?;
        assert!(env.stats().journal_bytes > 4096);
        page
    };

    let env = builder.open(&root)?;
    assert!(env.recovery_report().applied >= 2);
    let mut r = env.read_txn();
    assert!(r.get_page(page)?[PAGE_HEADER_SIZE..].iter().all(|&b| b == 0x61));
    Ok(())
}

#[test]
fn encryption_key_id_must_exist() {
    let root = unique_root("kid");
    let r = EnvBuilder::from_default()
        .page_size(4096)
        .encrypted(Arc::new(StaticKeyProvider::new("k1", [5u8; 32])))
        .key_id("k2")
        .create(&root, StorageType::Documents);
    assert!(r.is_err());
}


use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use KeelDB::consts::{DATA_FILE, PAGE_FLAG_OVERFLOW, PAGE_HEADER_SIZE};
use KeelDB::page::PageHeader;
use KeelDB::{keel_error, EnvBuilder, KeelError, StaticKeyProvider, StorageEnvironment, StorageType};

const PS: usize = 4096;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn unique_root(prefix: &str) -> PathBuf {
    let pid = std::process::id();
    let t = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let base = std::env::temp_dir();
    base.join(format!("keeltest-env-{prefix}-{pid}-{t}-{id}"))
}

// без авто-checkpoint'а и без flush при закрытии: всё живёт только в журнале
fn journal_only() -> EnvBuilder {
    EnvBuilder::from_default()
        .page_size(PS as u32)
        .journal_fsync(false)
        .flush_threshold_pages(0)
        .flush_on_close(false)
}

fn write_byte_page(env: &StorageEnvironment, page: Option<u64>, fill: u8) -> Result<(u64, u64)> {
    let mut tx = env.write_txn()?;
    let page = match page {
        Some(p) => p,
        None => tx.allocate_pages(1)?,
    };
    let run = tx.modify_page(page)?;
    for b in run[PAGE_HEADER_SIZE..].iter_mut() {
        *b = fill;
    }
    let id = tx.commit()?;
    Ok((page, id))
}

fn body(env: &StorageEnvironment, page: u64) -> Result<Vec<u8>> {
    let mut r = env.read_txn();
    Ok(r.get_page(page)?[PAGE_HEADER_SIZE..].to_vec())
}

fn flip_data_byte(root: &Path, offset: u64) -> Result<()> {
    let mut f = OpenOptions::new().read(true).write(true).open(root.join(DATA_FILE))?;
    let mut b = [0u8; 1];
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(&mut b)?;
    b[0] ^= 0x5A;
    f.seek(SeekFrom::Start(offset))?;
    f.write_all(&b)?;
    f.sync_all()?;
    Ok(())
}

#[test]
fn crash_before_checkpoint_is_recovered_from_journal() -> Result<()> {
    let root = unique_root("crash");
    let (pages, last_tx) = {
        let env = journal_only().create(&root, StorageType::Documents)?;
        let (p1, _) = write_byte_page(&env, None, 0x11)?;
        let (p2, _) = write_byte_page(&env, None, 0x22)?;
        let (_, last) = write_byte_page(&env, Some(p1), 0x33)?;
        assert_eq!(env.last_flushed_tx(), 0);
        ((p1, p2), last)
        // drop без checkpoint'а
    };

    let env = journal_only().open(&root)?;
    assert!(env.recovery_report().applied >= 3, "report: {:?}", env.recovery_report());
    assert_eq!(env.recovery_report().last_tx_id, last_tx);
    assert_eq!(env.last_committed_tx(), last_tx);
    assert!(body(&env, pages.0)?.iter().all(|&b| b == 0x33));
    assert!(body(&env, pages.1)?.iter().all(|&b| b == 0x22));

    // следующий id продолжает последовательность
    let (_, next) = write_byte_page(&env, Some(pages.1), 0x44)?;
    assert_eq!(next, last_tx + 1);
    Ok(())
}

#[test]
fn reader_snapshot_survives_commit_and_checkpoint() -> Result<()> {
    let root = unique_root("snapshot");
    let env = journal_only().create(&root, StorageType::Documents)?;
    let (page, first) = write_byte_page(&env, None, 1)?;

    let mut reader = env.read_txn();
    assert_eq!(reader.snapshot(), first);

    let (_, second) = write_byte_page(&env, Some(page), 2)?;
    let report = env.flush_to_data_file()?;
    assert_eq!(report.flushed_upto, first, "checkpoint must stop at the oldest reader");
    assert!(!report.journal_truncated);

    assert!(reader.get_page(page)?[PAGE_HEADER_SIZE..].iter().all(|&b| b == 1));
    assert!(body(&env, page)?.iter().all(|&b| b == 2));
    drop(reader);

    let report = env.flush_to_data_file()?;
    assert_eq!(report.flushed_upto, second);
    assert!(report.journal_truncated);
    assert_eq!(env.stats().pending_versions, 0);
    assert!(body(&env, page)?.iter().all(|&b| b == 2));
    Ok(())
}

#[test]
fn corrupted_data_page_halts_the_environment() -> Result<()> {
    let root = unique_root("halt");
    let page = {
        let env = journal_only().create(&root, StorageType::Documents)?;
        let (page, _) = write_byte_page(&env, None, 0x7E)?;
        env.flush_to_data_file()?;
        env.close()?;
        page
    };
    flip_data_byte(&root, page * PS as u64 + 200)?;

    let env = journal_only().open(&root)?;
    let err = body(&env, page).unwrap_err();
    assert!(matches!(keel_error(&err), Some(KeelError::IntegrityFailure { .. })), "{err:#}");
    assert!(env.is_halted());
    assert!(env.halt_reason().is_some());

    let err = env.write_txn().err().expect("halted environment must refuse writers");
    assert!(matches!(keel_error(&err), Some(KeelError::EnvironmentHalted { .. })), "{err:#}");
    Ok(())
}

fn zero_data_page(root: &Path, page: u64) -> Result<()> {
    let mut f = OpenOptions::new().write(true).open(root.join(DATA_FILE))?;
    f.seek(SeekFrom::Start(page * PS as u64))?;
    f.write_all(&[0u8; PS])?;
    f.sync_all()?;
    Ok(())
}

fn assert_zeroed_page_is_caught(env: &StorageEnvironment, page: u64) {
    let err = body(env, page).unwrap_err();
    assert!(matches!(keel_error(&err), Some(KeelError::IntegrityFailure { .. })), "{err:#}");
    assert!(env.is_halted());
}

#[test]
fn zeroed_flushed_page_is_integrity_failure() -> Result<()> {
    let root = unique_root("zeroed");
    let page = {
        let env = journal_only().create(&root, StorageType::Documents)?;
        let (page, _) = write_byte_page(&env, None, 0x6D)?;
        env.flush_to_data_file()?;
        env.close()?;
        page
    };
    zero_data_page(&root, page)?;

    let env = journal_only().open(&root)?;
    assert!(env.next_page_number() > page);
    assert_zeroed_page_is_caught(&env, page);
    Ok(())
}

#[test]
fn zeroed_flushed_page_is_integrity_failure_when_encrypted() -> Result<()> {
    let root = unique_root("zeroed-tde");
    let keys = Arc::new(StaticKeyProvider::new("main", [7u8; 32]));
    let page = {
        let env = journal_only()
            .encrypted(keys.clone())
            .create(&root, StorageType::Documents)?;
        let (page, _) = write_byte_page(&env, None, 0x4E)?;
        env.flush_to_data_file()?;
        env.close()?;
        page
    };
    zero_data_page(&root, page)?;

    let env = journal_only().encrypted(keys).open(&root)?;
    assert_zeroed_page_is_caught(&env, page);
    Ok(())
}

#[test]
fn overflow_run_keeps_its_size_across_reopen() -> Result<()> {
    let root = unique_root("overflow");
    let bytes = 3 * PS;
    let first = {
        let env = journal_only().create(&root, StorageType::Documents)?;
        let before = env.next_page_number();
        let mut tx = env.write_txn()?;
        let first = tx.allocate_overflow(bytes)?;
        assert_eq!(first, before);
        let run = tx.modify_page(first)?;
        run[PAGE_HEADER_SIZE] = 0xAB;
        let last = run.len() - 1;
        run[last] = 0xCD;
        tx.commit()?;
        first
    };

    let env = journal_only().open(&root)?;
    let mut r = env.read_txn();
    let run = r.get_page(first)?.to_vec();
    assert_eq!(run.len() % PS, 0);
    assert!(run.len() >= bytes);
    let hdr = PageHeader::read(&run)?;
    assert_ne!(hdr.flags & PAGE_FLAG_OVERFLOW, 0);
    assert_eq!(hdr.overflow_size as usize, bytes);
    assert_eq!(run[PAGE_HEADER_SIZE], 0xAB);
    assert_eq!(run[run.len() - 1], 0xCD);

    let root_hdr = r.env_header()?.root;
    assert_eq!(root_hdr.overflow_pages, (run.len() / PS) as u64);
    assert_eq!(env.next_page_number(), first + (run.len() / PS) as u64);
    Ok(())
}

#[test]
fn commit_buffers_come_from_the_pool_and_idle_ones_are_reclaimed() -> Result<()> {
    let root = unique_root("buffers");
    let env = journal_only()
        .cleaner_period_ms(0)
        .cleaner_idle_ms(60_000)
        .create(&root, StorageType::Documents)?;
    let pool = Arc::clone(env.buffer_pool());
    assert_eq!(pool.buffer_size(), PS);

    for fill in 1..=3u8 {
        write_byte_page(&env, None, fill)?;
    }
    // один буфер на поток, переиспользуется каждым коммитом
    assert_eq!(pool.tracked_items(), 1);
    assert_eq!(env.stats().pooled_buffers, 1);

    let tick = env.memory_cleaner().run_tick();
    assert_eq!(tick.pools, 1);
    assert_eq!(tick.reclaimed, 0, "buffer is not idle yet");

    let later = pool.now_ms() + 60_000;
    let stats = pool.reclaim_at(later, 60_000, false);
    assert_eq!(stats.reclaimed, 1);
    assert_eq!(stats.reclaimed_bytes, PS);
    assert_eq!(pool.tracked_items(), 0);

    // следующий коммит арендует новый буфер
    let (page, _) = write_byte_page(&env, None, 9)?;
    assert_eq!(pool.tracked_items(), 1);
    assert!(body(&env, page)?.iter().all(|&b| b == 9));
    Ok(())
}

#[test]
fn background_cleaner_lives_as_long_as_the_environment() -> Result<()> {
    let root = unique_root("cleaner");
    let env = journal_only()
        .cleaner_period_ms(5)
        .cleaner_idle_ms(0)
        .create(&root, StorageType::Documents)?;
    write_byte_page(&env, None, 1)?;

    let pool = Arc::clone(env.buffer_pool());
    let mut waited = 0;
    while pool.tracked_items() > 0 && waited < 400 {
        std::thread::sleep(std::time::Duration::from_millis(5));
        waited += 1;
    }
    assert_eq!(pool.tracked_items(), 0);

    let cleaner = Arc::clone(env.memory_cleaner());
    drop(env);
    // поток чистильщика остановлен и отпустил свою ссылку
    assert_eq!(Arc::strong_count(&cleaner), 1);
    Ok(())
}

#[test]
fn encrypted_environment_needs_its_key() -> Result<()> {
    let root = unique_root("tde");
    let key = [9u8; 32];
    let page = {
        let env = journal_only()
            .encrypted(Arc::new(StaticKeyProvider::new("main", key)))
            .create(&root, StorageType::Documents)?;
        assert!(env.is_encrypted());
        let (page, _) = write_byte_page(&env, None, 0x5C)?;
        page
    };

    // журнал зашифрован: открытого текста страницы там нет
    let journal = fs::read(root.join("journal.log"))?;
    assert!(!journal.windows(64).any(|w| w.iter().all(|&b| b == 0x5C)));

    assert!(journal_only().open(&root).is_err());

    let env = journal_only()
        .encrypted(Arc::new(StaticKeyProvider::new("main", key)))
        .open(&root)?;
    assert!(body(&env, page)?.iter().all(|&b| b == 0x5C));
    env.flush_to_data_file()?;
    assert!(body(&env, page)?.iter().all(|&b| b == 0x5C));
    env.close()?;

    let wrong = journal_only()
        .encrypted(Arc::new(StaticKeyProvider::new("main", [1u8; 32])))
        .open(&root)
        .and_then(|env| body(&env, page));
    assert!(wrong.is_err());
    Ok(())
}

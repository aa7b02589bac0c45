use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;

use KeelDB::consts::{PAGE_HEADER_SIZE, PAGE_OFF_NONCE};
use KeelDB::crypto::{KeyProvider, NonceSequence, PageCipher, StaticKeyProvider};
use KeelDB::page::PageHeader;
use KeelDB::pager::{CryptoPager, MmapPager, Pager, PagerTxState};
use KeelDB::{is_catastrophic, keel_error, KeelError};

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
    base.join(format!("keeltest-crypto-{prefix}-{pid}-{t}-{id}"))
}

fn cipher(root: &PathBuf, key: [u8; 32]) -> Result<Arc<PageCipher>> {
    let kp = StaticKeyProvider::new("k1", key);
    let km = kp.key("k1")?;
    Ok(Arc::new(PageCipher::new(&km, Arc::new(NonceSequence::open(root, 32)?))))
}

fn crypto_pager(root: &PathBuf, key: [u8; 32]) -> Result<CryptoPager> {
    let inner = MmapPager::open(&root.join("data.keel"), PS, 8)?;
    Ok(CryptoPager::new(Box::new(inner), cipher(root, key)?))
}

#[test]
fn overflow_run_roundtrip_and_ciphertext_differs() -> Result<()> {
    let root = unique_root("roundtrip");
    fs::create_dir_all(&root)?;
    let mut pager = crypto_pager(&root, [3u8; 32])?;

    let mut st = PagerTxState::new(PS);
    {
        let run = pager.acquire_new_page_pointer(&mut st, 2, 3)?;
        assert_eq!(run.len(), 3 * PS);
        let hdr = PageHeader::read(run)?;
        assert_eq!(hdr.page_number, 2);
        for (i, b) in run[PAGE_HEADER_SIZE..].iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
    }
    let dirty = st.take_dirty();
    assert_eq!(dirty.len(), 1);
    let (page, plain) = &dirty[0];
    pager.write_page_run(*page, plain)?;
    pager.sync()?;

    let raw = pager.read_raw_run(2)?;
    assert_eq!(raw.len(), plain.len());
    assert_ne!(&raw[PAGE_HEADER_SIZE..], &plain[PAGE_HEADER_SIZE..], "body must be encrypted");

    let mut st2 = PagerTxState::new(PS);
    let got = pager.acquire_page_pointer(&mut st2, 2)?;
    assert_eq!(&got[PAGE_HEADER_SIZE..], &plain[PAGE_HEADER_SIZE..]);
    Ok(())
}

#[test]
fn every_write_uses_a_fresh_nonce() -> Result<()> {
    let root = unique_root("nonce");
    fs::create_dir_all(&root)?;
    let mut pager = crypto_pager(&root, [4u8; 32])?;

    let mut st = PagerTxState::new(PS);
    pager.acquire_new_page_pointer(&mut st, 1, 1)?;
    let (_, plain) = st.take_dirty().remove(0);

    pager.write_page_run(1, &plain)?;
    let first = pager.read_raw_run(1)?[PAGE_OFF_NONCE..PAGE_OFF_NONCE + 12].to_vec();
    pager.write_page_run(1, &plain)?;
    let second = pager.read_raw_run(1)?[PAGE_OFF_NONCE..PAGE_OFF_NONCE + 12].to_vec();
    assert_ne!(first, second);
    Ok(())
}

#[test]
fn tampered_page_is_integrity_failure() -> Result<()> {
    let root = unique_root("tamper");
    fs::create_dir_all(&root)?;
    {
        let mut pager = crypto_pager(&root, [5u8; 32])?;
        let mut st = PagerTxState::new(PS);
        pager.acquire_new_page_pointer(&mut st, 1, 1)?[100] = 42;
        let (_, plain) = st.take_dirty().remove(0);
        pager.write_page_run(1, &plain)?;
        pager.sync()?;
    }
    {
        // портим шифртекст в обход шифрования
        let mut raw_pager = MmapPager::open(&root.join("data.keel"), PS, 8)?;
        let mut raw = raw_pager.read_raw_run(1)?;
        raw[PAGE_HEADER_SIZE + 10] ^= 0x01;
        raw_pager.write_page_run(1, &raw)?;
        raw_pager.sync()?;
    }

    let pager = crypto_pager(&root, [5u8; 32])?;
    let mut st = PagerTxState::new(PS);
    let err = pager.acquire_page_pointer(&mut st, 1).unwrap_err();
    assert!(is_catastrophic(&err));
    assert!(matches!(keel_error(&err), Some(KeelError::IntegrityFailure { .. })));

    // чужой ключ тоже не проходит проверку тега
    let wrong = crypto_pager(&root, [6u8; 32])?;
    let mut st = PagerTxState::new(PS);
    assert!(wrong.acquire_page_pointer(&mut st, 1).is_err());
    Ok(())
}

#[test]
fn never_written_run_reads_as_zeros() -> Result<()> {
    let root = unique_root("zero");
    fs::create_dir_all(&root)?;
    let pager = crypto_pager(&root, [8u8; 32])?;
    let mut st = PagerTxState::new(PS);
    let run = pager.acquire_page_pointer(&mut st, 6)?;
    assert!(run.iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn page_beyond_extent_is_out_of_range() -> Result<()> {
    let root = unique_root("range");
    fs::create_dir_all(&root)?;
    let pager = crypto_pager(&root, [9u8; 32])?;
    let mut st = PagerTxState::new(PS);
    let err = pager.acquire_page_pointer(&mut st, 1_000).unwrap_err();
    assert!(matches!(keel_error(&err), Some(KeelError::PageOutOfRange { .. })));
    assert!(!is_catastrophic(&err));
    Ok(())
}

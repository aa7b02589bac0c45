//! env/recover — офлайн-экспорт всех проверяемых прогонов страниц.
//!
//! Инструмент для хранилищ, которые нельзя открыть штатно (например, версия
//! схемы из skip-list). Версию схемы не проверяет и ничего не апгрейдит.
//!
//! - shared LOCK (окружение не должно быть открыто на запись);
//! - data file читается целиком, поверх накладываются валидные транзакции журнала
//!   (dry-run реплей, без усечения);
//! - прогон экспортируется, если проходит crc32c (plain) или MAC (encrypted);
//!   полностью нулевые прогоны выше сброшенной границы (meta.next_page_number)
//!   пропускаются, ниже неё считаются повреждёнными.
//!
//! verify_journal — тот же dry-run реплей без экспорта (для `keeldb verify-journal`).
//!
//! Формат экспорта: [magic8 "KEELRCV1"][page_size u32] затем кадры
//! [page_number u64][page_count u32][plain run bytes].

use anyhow::{Context, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use log::{info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use crate::config::KeelConfig;
use crate::consts::{DATA_FILE, ENV_HEADER_PAGE};
use crate::crypto::KeyProvider;
use crate::journal::{journal_path, replay_journal, ReplayOptions, ReplayReport};
use crate::lock::try_acquire_shared_lock;
use crate::meta::read_meta;
use crate::page::{run_verify_checksum, EnvHeader, PageHeader};
use crate::schema::StorageType;

use super::build_cipher;

pub const RECOVERY_MAGIC: &[u8; 8] = b"KEELRCV1";

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub storage_type: Option<StorageType>,
    pub schema_version: Option<u32>,
    pub runs_exported: u64,
    pub pages_exported: u64,
    pub runs_from_journal: u64,
    pub failed_pages: Vec<u64>,
    pub journal_error: Option<String>,
}

pub fn recover_pages(
    root: &Path,
    keys: Option<&dyn KeyProvider>,
    out: &mut dyn Write,
) -> Result<RecoveryReport> {
    let _lock = try_acquire_shared_lock(root)?;
    let meta = read_meta(root)?;
    let ps = meta.page_size as usize;
    let cipher = build_cipher(root, &KeelConfig::default(), &meta, keys)?;

    let data_path = root.join(DATA_FILE);
    let data = match std::fs::read(&data_path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            return Err(e).with_context(|| format!("read data file {}", data_path.display()))
        }
    };

    let mut report = RecoveryReport {
        storage_type: StorageType::from_u8(meta.storage_type).ok(),
        ..Default::default()
    };

    // plain-прогоны из журнала; новейшая версия страницы побеждает
    let mut overlay: BTreeMap<u64, Vec<u8>> = BTreeMap::new();
    let mut next_page = meta.next_page_number;
    let opts = ReplayOptions {
        page_size: ps,
        cipher: cipher.clone(),
        flushed_tx_id: meta.last_flushed_tx,
        truncate: false,
    };
    let replayed = replay_journal(&journal_path(root), &opts, |h, runs| {
        for (page, run) in runs {
            overlay.insert(*page, run.to_vec());
        }
        next_page = next_page.max(h.next_page_number);
        Ok(())
    });
    if let Err(e) = replayed {
        warn!("recover: journal of {} is unusable past this point: {:#}", root.display(), e);
        report.journal_error = Some(format!("{:#}", e));
    }

    let file_pages = (data.len() / ps) as u64;
    let last = next_page.max(file_pages);

    out.write_all(RECOVERY_MAGIC)?;
    out.write_u32::<LittleEndian>(meta.page_size)?;

    let mut page = 0u64;
    while page < last {
        let run = match overlay.remove(&page) {
            Some(run) => {
                report.runs_from_journal += 1;
                Some(run)
            }
            None => read_verified_run(&data, page, ps, cipher.as_deref()),
        };
        let run = match run {
            Some(r) => r,
            None => {
                // ниже сброшенной границы нулевых страниц быть не может
                let written = page < meta.next_page_number;
                if page < file_pages && (written || !is_zero_page(&data, page, ps)) {
                    report.failed_pages.push(page);
                }
                page += 1;
                continue;
            }
        };

        let count = (run.len() / ps) as u64;
        if page == ENV_HEADER_PAGE {
            if let Ok(h) = EnvHeader::read(&run) {
                report.storage_type = Some(h.storage_type);
                report.schema_version = Some(h.schema_version);
            }
        }
        out.write_u64::<LittleEndian>(page)?;
        out.write_u32::<LittleEndian>(count as u32)?;
        out.write_all(&run)?;
        report.runs_exported += 1;
        report.pages_exported += count;
        page += count;
    }
    out.flush()?;

    info!(
        "recover: {} run(s) ({} pages) exported from {}, {} page(s) failed verification",
        report.runs_exported,
        report.pages_exported,
        root.display(),
        report.failed_pages.len()
    );
    Ok(report)
}

/// Проверить журнал целиком, ничего не применяя и не усекая.
pub fn verify_journal(root: &Path, keys: Option<&dyn KeyProvider>) -> Result<ReplayReport> {
    let _lock = try_acquire_shared_lock(root)?;
    let meta = read_meta(root)?;
    let cipher = build_cipher(root, &KeelConfig::default(), &meta, keys)?;
    let opts = ReplayOptions {
        page_size: meta.page_size as usize,
        cipher,
        flushed_tx_id: meta.last_flushed_tx,
        truncate: false,
    };
    replay_journal(&journal_path(root), &opts, |_, _| Ok(()))
}

fn is_zero_page(data: &[u8], page: u64, ps: usize) -> bool {
    let start = page as usize * ps;
    data[start..start + ps].iter().all(|&b| b == 0)
}

fn read_verified_run(
    data: &[u8],
    page: u64,
    ps: usize,
    cipher: Option<&crate::crypto::PageCipher>,
) -> Option<Vec<u8>> {
    let start = page as usize * ps;
    if start + ps > data.len() || is_zero_page(data, page, ps) {
        return None;
    }
    let hdr = PageHeader::read(&data[start..start + ps]).ok()?;
    if hdr.page_number != page {
        return None;
    }
    let end = start + hdr.run_pages(ps) as usize * ps;
    if end > data.len() {
        return None;
    }
    let mut run = data[start..end].to_vec();
    match cipher {
        Some(c) => c.decrypt_run(&mut run).ok()?,
        None => {
            if !run_verify_checksum(&run).ok()? {
                return None;
            }
        }
    }
    Some(run)
}

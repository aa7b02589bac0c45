//! journal/replay — восстановление после падения.
//!
//! - Записи с id <= flushed_tx_id проверяются, но не применяются (уже в data file).
//! - Первая запись с id > flushed_tx_id + 1 — дыра в последовательности: IntegrityFailure.
//! - Первая torn-запись останавливает реплей; с `truncate` файл режется по её смещению.
//! - Ошибки целостности (MAC, распаковка) пробрасываются как есть — это катастрофа.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use crate::consts::JOURNAL_HDR_SIZE;
use crate::crypto::PageCipher;
use crate::error::KeelError;
use crate::metrics::{record_integrity_failure, record_journal_replayed, record_journal_torn_truncation};

use super::header::TransactionHeader;
use super::reader::{JournalRead, JournalReader, Truncation};

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub page_size: usize,
    pub cipher: Option<Arc<PageCipher>>,
    pub flushed_tx_id: u64,
    pub truncate: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReplayReport {
    pub applied: u64,
    pub skipped: u64,
    /// Последний валидный id в журнале (или flushed_tx_id, если журнал пуст).
    pub last_tx_id: u64,
    pub last_header: Option<TransactionHeader>,
    pub truncation: Option<Truncation>,
}

/// Применить валидные транзакции по порядку.
/// `apply` получает заголовок и прогоны (номер первой страницы, plain-байты).
pub fn replay_journal<F>(path: &Path, opts: &ReplayOptions, mut apply: F) -> Result<ReplayReport>
where
    F: FnMut(&TransactionHeader, &[(u64, &[u8])]) -> Result<()>,
{
    let mut report = ReplayReport {
        last_tx_id: opts.flushed_tx_id,
        ..Default::default()
    };
    let len = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => {
            debug!("replay: journal {} not found, nothing to do", path.display());
            return Ok(report);
        }
    };
    if len < JOURNAL_HDR_SIZE as u64 {
        debug!("replay: journal {} has no header yet, nothing to do", path.display());
        return Ok(report);
    }

    let mut reader = JournalReader::open(path, opts.page_size, opts.cipher.clone())?;
    loop {
        match reader.next_transaction()? {
            JournalRead::End => break,
            JournalRead::Torn(t) => {
                warn!(
                    "replay: torn record #{} at offset {} in {}: {}",
                    t.record_index,
                    t.offset,
                    path.display(),
                    t.reason
                );
                report.truncation = Some(t);
                break;
            }
            JournalRead::Transaction(tx) => {
                let id = tx.header.transaction_id;
                if report.applied == 0 && report.skipped == 0 && id > opts.flushed_tx_id + 1 {
                    record_integrity_failure();
                    return Err(KeelError::integrity(
                        format!("journal {}", path.display()),
                        format!(
                            "first transaction {} leaves a gap after flushed transaction {}",
                            id, opts.flushed_tx_id
                        ),
                    )
                    .into());
                }
                if id <= opts.flushed_tx_id {
                    report.skipped += 1;
                } else {
                    let runs = tx.runs(opts.page_size)?;
                    apply(&tx.header, &runs)?;
                    report.applied += 1;
                }
                report.last_tx_id = report.last_tx_id.max(id);
                report.last_header = Some(tx.header);
            }
        }
    }

    if opts.truncate {
        if let Some(t) = report.truncation.as_ref() {
            let f = OpenOptions::new()
                .write(true)
                .open(path)
                .with_context(|| format!("open journal {} for truncation", path.display()))?;
            f.set_len(t.offset)?;
            f.sync_all()?;
            record_journal_torn_truncation();
            warn!(
                "replay: journal {} truncated to {} bytes",
                path.display(),
                t.offset
            );
        }
    }

    record_journal_replayed(report.applied);
    if report.applied > 0 {
        info!(
            "replay: applied {} transaction(s), skipped {}, last tx {}",
            report.applied, report.skipped, report.last_tx_id
        );
    }
    Ok(report)
}

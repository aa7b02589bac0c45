//! journal/reader — последовательное чтение и валидация записей журнала.
//!
//! Порядок проверок одной записи:
//! 1) marker заголовка;                       → Torn
//! 2) transaction_id == предыдущий + 1;        → Torn (устаревший хвост)
//! 3) tx_marker содержит Commit;               → Torn
//! 4) payload целиком присутствует;            → Torn
//! 5) xxhash64 payload == hash заголовка;      → Torn
//! 6) MAC (если зашифровано);                  → IntegrityFailure
//! 7) распаковка, размер == page_count*ps.     → IntegrityFailure
//!
//! Torn — это не ошибка: запись и всё после неё считаются недописанными.
//! Неполный заголовок в конце файла тоже Torn; ровно конец файла — End.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::consts::{FLAG_ENCRYPTED, JOURNAL_HDR_SIZE, TX_HEADER_MARKER, TX_HEADER_SIZE};
use crate::crypto::PageCipher;
use crate::error::KeelError;
use crate::hash::xxhash64;
use crate::metrics::record_integrity_failure;
use crate::page::PageHeader;

use super::header::{payload_aad, TransactionHeader, TxMarker};
use super::read_journal_file_header;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TornReason {
    PartialHeader,
    BadMarker,
    OutOfSequence { expected: u64, found: u64 },
    NotCommitted,
    PartialPayload,
    HashMismatch { stored: u64, computed: u64 },
}

impl std::fmt::Display for TornReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TornReason::PartialHeader => write!(f, "partial transaction header"),
            TornReason::BadMarker => write!(f, "bad header marker"),
            TornReason::OutOfSequence { expected, found } => {
                write!(f, "transaction id {} where {} was expected", found, expected)
            }
            TornReason::NotCommitted => write!(f, "record carries no commit marker"),
            TornReason::PartialPayload => write!(f, "payload cut short"),
            TornReason::HashMismatch { stored, computed } => write!(
                f,
                "payload hash mismatch (stored {:#018x}, computed {:#018x})",
                stored, computed
            ),
        }
    }
}

/// Где и почему журнал обрывается.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Truncation {
    /// Порядковый номер записи в файле, с 1.
    pub record_index: u64,
    /// Смещение начала записи = новая длина файла при усечении.
    pub offset: u64,
    pub reason: TornReason,
}

/// Валидная транзакция: заголовок + plain-прогоны страниц.
#[derive(Debug, Clone)]
pub struct JournalTransaction {
    pub header: TransactionHeader,
    pub offset: u64,
    pub pages: Vec<u8>,
}

impl JournalTransaction {
    /// Разбить payload на прогоны: (номер первой страницы, байты прогона).
    pub fn runs(&self, page_size: usize) -> Result<Vec<(u64, &[u8])>> {
        let mut out = Vec::new();
        let mut off = 0usize;
        let mut pages = 0u64;
        while off < self.pages.len() {
            let hdr = PageHeader::read(&self.pages[off..])?;
            let count = hdr.run_pages(page_size);
            let end = off + count as usize * page_size;
            if end > self.pages.len() {
                return Err(KeelError::integrity(
                    format!("journal transaction {}", self.header.transaction_id),
                    format!("page run {} overruns the payload", hdr.page_number),
                )
                .into());
            }
            out.push((hdr.page_number, &self.pages[off..end]));
            pages += count;
            off = end;
        }
        if pages != self.header.page_count as u64 {
            return Err(KeelError::integrity(
                format!("journal transaction {}", self.header.transaction_id),
                format!("{} pages in runs, header says {}", pages, self.header.page_count),
            )
            .into());
        }
        Ok(out)
    }
}

#[derive(Debug)]
pub enum JournalRead {
    Transaction(JournalTransaction),
    Torn(Truncation),
    End,
}

pub struct JournalReader {
    path: PathBuf,
    file: File,
    len: u64,
    pos: u64,
    page_size: usize,
    cipher: Option<Arc<PageCipher>>,
    expected_next: Option<u64>,
    index: u64,
}

impl JournalReader {
    pub fn open(path: &Path, page_size: usize, cipher: Option<Arc<PageCipher>>) -> Result<Self> {
        let mut file =
            File::open(path).with_context(|| format!("open journal {}", path.display()))?;
        let len = file.metadata()?.len();
        let hdr = read_journal_file_header(&mut file)?;
        if hdr.page_size as usize != page_size {
            return Err(anyhow!(
                "journal {} page_size {} != {}",
                path.display(),
                hdr.page_size,
                page_size
            ));
        }
        if hdr.flags & FLAG_ENCRYPTED != 0 && cipher.is_none() {
            return Err(anyhow!(
                "journal {} is encrypted; a key is required to read it",
                path.display()
            ));
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
            pos: JOURNAL_HDR_SIZE as u64,
            page_size,
            cipher,
            expected_next: None,
            index: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Следующий id, которого ждёт reader (None до первой записи).
    pub fn expected_next(&self) -> Option<u64> {
        self.expected_next
    }

    fn torn(&self, reason: TornReason) -> JournalRead {
        JournalRead::Torn(Truncation {
            record_index: self.index,
            offset: self.pos,
            reason,
        })
    }

    pub fn next_transaction(&mut self) -> Result<JournalRead> {
        if self.pos >= self.len {
            return Ok(JournalRead::End);
        }
        self.index += 1;

        if self.len - self.pos < TX_HEADER_SIZE as u64 {
            return Ok(self.torn(TornReason::PartialHeader));
        }
        let mut hbuf = [0u8; TX_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(self.pos))?;
        self.file.read_exact(&mut hbuf)?;
        let h = TransactionHeader::decode(&hbuf)?;

        if h.header_marker != TX_HEADER_MARKER {
            return Ok(self.torn(TornReason::BadMarker));
        }
        if let Some(expected) = self.expected_next {
            if h.transaction_id != expected {
                return Ok(self.torn(TornReason::OutOfSequence {
                    expected,
                    found: h.transaction_id,
                }));
            }
        }
        if !h.tx_marker.contains(TxMarker::COMMIT) {
            return Ok(self.torn(TornReason::NotCommitted));
        }
        let body_start = self.pos + TX_HEADER_SIZE as u64;
        if h.compressed_size > self.len - body_start {
            return Ok(self.torn(TornReason::PartialPayload));
        }

        let mut body = vec![0u8; h.compressed_size as usize];
        self.file.read_exact(&mut body)?;
        let computed = xxhash64(&body);
        if computed != h.hash {
            return Ok(self.torn(TornReason::HashMismatch {
                stored: h.hash,
                computed,
            }));
        }

        if h.is_encrypted() {
            let cipher = self.cipher.as_ref().ok_or_else(|| {
                anyhow!("transaction {} is encrypted, no key", h.transaction_id)
            })?;
            let aad = payload_aad(&hbuf);
            let seq = u64::from_le_bytes(h.nonce);
            cipher.decrypt_payload(h.transaction_id, &aad, &mut body, seq, &h.mac)?;
        }

        let pages = if h.is_compressed() {
            zstd::bulk::decompress(&body, h.uncompressed_size as usize).map_err(|e| {
                record_integrity_failure();
                anyhow::Error::from(KeelError::integrity(
                    format!("journal transaction {}", h.transaction_id),
                    format!("zstd: {}", e),
                ))
            })?
        } else {
            body
        };
        let expected_len = h.page_count as u64 * self.page_size as u64;
        if pages.len() as u64 != expected_len || h.uncompressed_size != expected_len {
            record_integrity_failure();
            return Err(KeelError::integrity(
                format!("journal transaction {}", h.transaction_id),
                format!(
                    "payload is {} bytes, expected {} ({} pages)",
                    pages.len(),
                    expected_len,
                    h.page_count
                ),
            )
            .into());
        }

        let offset = self.pos;
        self.pos = body_start + h.compressed_size;
        self.expected_next = Some(h.transaction_id + 1);
        Ok(JournalRead::Transaction(JournalTransaction {
            header: h,
            offset,
            pages,
        }))
    }
}

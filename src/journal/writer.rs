//! journal/writer — запись транзакций в журнал.
//!
//! Конвейер append():
//! 1) заголовок (id, страницы, root, timestamp, marker=Commit);
//! 2) zstd, если включено и результат короче (в буфер из пула окружения, если он задан);
//! 3) AES-GCM payload'а (AAD = заголовок с занулённым hash);
//! 4) hash = xxhash64 байтов payload как они лягут на диск;
//! 5) запись header, затем payload;
//! 6) fsync, если не Lazy и fsync не отключён.
//!
//! Ошибка записи посреди записи откатывает файл к последней целой границе.

use anyhow::{anyhow, Context, Result};
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::consts::{
    FLAG_ENCRYPTED, JOURNAL_HDR_SIZE, TX_FLAG_COMPRESSED, TX_FLAG_ENCRYPTED, TX_FLAG_LAZY,
    TX_HEADER_SIZE,
};
use crate::crypto::PageCipher;
use crate::hash::xxhash64;
use crate::memory::{NativeMemoryPool, ScratchBuffer};
use crate::metrics::{record_journal_commit, record_journal_fsync};
use crate::page::TreeRootHeader;
use crate::util::now_ticks_utc;

use super::header::{payload_aad, TransactionHeader};
use super::{journal_path, read_journal_file_header, write_journal_file_header, JournalFileHeader};

/// Что пишем в журнал за одну транзакцию.
#[derive(Debug)]
pub struct CommitRecord<'a> {
    pub transaction_id: u64,
    pub next_page_number: u64,
    pub last_page_number: u64,
    pub page_count: u32,
    pub root: TreeRootHeader,
    pub lazy: bool,
    /// Plain-прогоны страниц подряд.
    pub pages: &'a [u8],
}

pub struct JournalWriter {
    path: PathBuf,
    file: File,
    len: u64,
    page_size: usize,
    fsync: bool,
    // None = без сжатия
    zstd_level: Option<i32>,
    cipher: Option<Arc<PageCipher>>,
    buffers: Option<Arc<NativeMemoryPool>>,
}

impl JournalWriter {
    /// Открыть журнал на дозапись (создать с заголовком, если его нет).
    pub fn open(
        root: &Path,
        page_size: usize,
        fsync: bool,
        zstd_level: Option<i32>,
        cipher: Option<Arc<PageCipher>>,
    ) -> Result<Self> {
        let path = journal_path(root);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("open journal {}", path.display()))?;

        let flags = if cipher.is_some() { FLAG_ENCRYPTED } else { 0 };
        let mut len = file.metadata()?.len();
        if len < JOURNAL_HDR_SIZE as u64 {
            file.set_len(0)?;
            write_journal_file_header(
                &mut file,
                &JournalFileHeader {
                    page_size: page_size as u32,
                    flags,
                },
            )?;
            file.sync_all()?;
            len = JOURNAL_HDR_SIZE as u64;
        } else {
            let hdr = read_journal_file_header(&mut file)?;
            if hdr.page_size as usize != page_size {
                return Err(anyhow!(
                    "journal {} page_size {} != environment page_size {}",
                    path.display(),
                    hdr.page_size,
                    page_size
                ));
            }
            if hdr.flags & FLAG_ENCRYPTED != flags {
                return Err(anyhow!(
                    "journal {} encryption flag does not match environment",
                    path.display()
                ));
            }
        }

        Ok(Self {
            path,
            file,
            len,
            page_size,
            fsync,
            zstd_level,
            cipher,
            buffers: None,
        })
    }

    /// Рабочие буферы кадров брать из пула окружения.
    pub fn with_buffers(mut self, pool: Arc<NativeMemoryPool>) -> Self {
        self.buffers = Some(pool);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Текущая длина файла (граница последней целой записи).
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len <= JOURNAL_HDR_SIZE as u64
    }

    pub fn append(&mut self, rec: &CommitRecord<'_>) -> Result<TransactionHeader> {
        let expected = rec.page_count as usize * self.page_size;
        if rec.pages.len() != expected {
            return Err(anyhow!(
                "transaction {} payload is {} bytes, expected {} ({} pages)",
                rec.transaction_id,
                rec.pages.len(),
                expected,
                rec.page_count
            ));
        }

        let mut h = TransactionHeader::new(rec.transaction_id);
        h.next_page_number = rec.next_page_number;
        h.last_page_number = rec.last_page_number;
        h.page_count = rec.page_count;
        h.root = rec.root;
        h.uncompressed_size = rec.pages.len() as u64;
        h.timestamp_ticks = now_ticks_utc();
        if rec.lazy {
            h.flags |= TX_FLAG_LAZY;
        }

        // компрессия сразу в рабочий буфер той же длины: не влезло — пишем как есть
        let len = rec.pages.len();
        let mut scratch = ScratchBuffer::rent(self.buffers.as_ref(), len);
        let mut body_len = len;
        let mut compressed = false;
        if let Some(level) = self.zstd_level.filter(|_| len > 0) {
            if let Ok(n) = zstd::bulk::compress_to_buffer(rec.pages, &mut scratch[..], level) {
                if n < len {
                    body_len = n;
                    compressed = true;
                    h.flags |= TX_FLAG_COMPRESSED;
                }
            }
        }
        if !compressed {
            scratch.copy_from_slice(rec.pages);
        }
        let body = &mut scratch[..body_len];
        h.compressed_size = body_len as u64;

        if let Some(cipher) = self.cipher.as_ref() {
            h.flags |= TX_FLAG_ENCRYPTED;
            let aad = payload_aad(&h.encode());
            let (seq, tag) = cipher.encrypt_payload(&aad, body)?;
            h.nonce = seq.to_le_bytes();
            h.mac = tag;
        }

        h.hash = xxhash64(body);
        let head = h.encode();
        let frame_len = TX_HEADER_SIZE + body_len;

        let start = self.len;
        if let Err(e) = self.write_frame(start, &head, body) {
            // откат к последней целой записи; если не вышло, хвост отрежет replay
            if let Err(e2) = self.file.set_len(start) {
                warn!("journal {}: rollback after failed append: {}", self.path.display(), e2);
            }
            return Err(e);
        }
        self.len = start + frame_len as u64;

        if self.fsync && !rec.lazy {
            self.file
                .sync_data()
                .with_context(|| format!("fsync journal {}", self.path.display()))?;
            record_journal_fsync();
        }
        record_journal_commit(frame_len);
        debug!(
            "journal: tx {} appended ({} pages, {} bytes on disk, flags={:#x})",
            h.transaction_id,
            h.page_count,
            frame_len,
            h.flags
        );
        Ok(h)
    }

    fn write_frame(&mut self, at: u64, head: &[u8], body: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(at))?;
        self.file
            .write_all(head)
            .and_then(|_| self.file.write_all(body))
            .with_context(|| format!("append to journal {}", self.path.display()))?;
        Ok(())
    }

    /// fsync того, что накопили Lazy-транзакции.
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .with_context(|| format!("fsync journal {}", self.path.display()))?;
        record_journal_fsync();
        Ok(())
    }

    /// После полного checkpoint: оставить только заголовок файла.
    pub fn truncate_to_header(&mut self) -> Result<()> {
        self.file.set_len(JOURNAL_HDR_SIZE as u64)?;
        self.file.sync_all()?;
        self.len = JOURNAL_HDR_SIZE as u64;
        debug!("journal {} truncated to header", self.path.display());
        Ok(())
    }
}

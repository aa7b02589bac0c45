//! Журнал транзакций (KEELJRN1).
//!
//! Разделение:
//! - header.rs — TransactionHeader (192 байта) и AAD для payload.
//! - writer.rs — JournalWriter: сжатие, шифрование, хэш, запись, fsync.
//! - reader.rs — JournalReader: последовательная валидация записей, детект torn-write.
//! - replay.rs — replay_journal: применение валидных транзакций, усечение хвоста.
//!
//! Формат файла:
//! - заголовок 16 байт: [magic8 "KEELJRN1"][page_size u32][flags u32 (FLAG_ENCRYPTED)];
//! - далее записи: [TransactionHeader 192][payload compressed_size байт].
//!
//! Payload = конкатенация прогонов страниц транзакции (по возрастанию номеров),
//! каждый прогон со своим 64-байтовым заголовком.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::consts::{JOURNAL_FILE, JOURNAL_HDR_SIZE, JOURNAL_MAGIC};

pub mod header;
pub mod reader;
pub mod replay;
pub mod writer;

pub use header::{payload_aad, TransactionHeader, TxMarker};
pub use reader::{JournalRead, JournalReader, JournalTransaction, TornReason, Truncation};
pub use replay::{replay_journal, ReplayOptions, ReplayReport};
pub use writer::{CommitRecord, JournalWriter};

#[inline]
pub fn journal_path(root: &Path) -> PathBuf {
    root.join(JOURNAL_FILE)
}

/// Заголовок файла журнала.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalFileHeader {
    pub page_size: u32,
    pub flags: u32,
}

pub fn write_journal_file_header(f: &mut File, hdr: &JournalFileHeader) -> Result<()> {
    let mut buf = [0u8; JOURNAL_HDR_SIZE];
    buf[..8].copy_from_slice(JOURNAL_MAGIC);
    LittleEndian::write_u32(&mut buf[8..12], hdr.page_size);
    LittleEndian::write_u32(&mut buf[12..16], hdr.flags);
    f.seek(SeekFrom::Start(0))?;
    f.write_all(&buf)?;
    Ok(())
}

pub fn read_journal_file_header(f: &mut File) -> Result<JournalFileHeader> {
    let mut buf = [0u8; JOURNAL_HDR_SIZE];
    f.seek(SeekFrom::Start(0))?;
    f.read_exact(&mut buf)
        .context("read journal file header")?;
    if &buf[..8] != JOURNAL_MAGIC {
        return Err(anyhow!("bad journal magic"));
    }
    Ok(JournalFileHeader {
        page_size: LittleEndian::read_u32(&buf[8..12]),
        flags: LittleEndian::read_u32(&buf[12..16]),
    })
}

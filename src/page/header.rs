//! page/header — 64-байтовый заголовок страницы.
//!
//! Layout (LE):
//! [0..8)   page_number u64
//! [8]      flags u8 (PAGE_FLAG_*)
//! [10..12) lower u16
//! [12..14) upper u16
//! [16..20) overflow_size u32 — байты полезной нагрузки overflow-прогона
//! [32..44) nonce (encrypted)
//! [44..48) crc32c (plain)
//! [48..64) mac (encrypted)
//!
//! Прогон (run) — одна страница (Single) или ceil((64 + overflow_size) / ps) страниц
//! (Overflow). Адресуется номером первой страницы.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{
    PAGE_FLAG_OVERFLOW, PAGE_FLAG_SINGLE, PAGE_HEADER_SIZE, PAGE_OFF_FLAGS, PAGE_OFF_LOWER,
    PAGE_OFF_NUMBER, PAGE_OFF_OVERFLOW_SIZE, PAGE_OFF_UPPER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageHeader {
    pub page_number: u64,
    pub flags: u8,
    pub lower: u16,
    pub upper: u16,
    pub overflow_size: u32,
}

impl PageHeader {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(anyhow!("page buffer too small for header ({} bytes)", buf.len()));
        }
        Ok(Self {
            page_number: LittleEndian::read_u64(&buf[PAGE_OFF_NUMBER..PAGE_OFF_NUMBER + 8]),
            flags: buf[PAGE_OFF_FLAGS],
            lower: LittleEndian::read_u16(&buf[PAGE_OFF_LOWER..PAGE_OFF_LOWER + 2]),
            upper: LittleEndian::read_u16(&buf[PAGE_OFF_UPPER..PAGE_OFF_UPPER + 2]),
            overflow_size: LittleEndian::read_u32(
                &buf[PAGE_OFF_OVERFLOW_SIZE..PAGE_OFF_OVERFLOW_SIZE + 4],
            ),
        })
    }

    /// Записать plain-поля заголовка. nonce/crc/mac не трогаются.
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(anyhow!("page buffer too small for header ({} bytes)", buf.len()));
        }
        LittleEndian::write_u64(&mut buf[PAGE_OFF_NUMBER..PAGE_OFF_NUMBER + 8], self.page_number);
        buf[PAGE_OFF_FLAGS] = self.flags;
        LittleEndian::write_u16(&mut buf[PAGE_OFF_LOWER..PAGE_OFF_LOWER + 2], self.lower);
        LittleEndian::write_u16(&mut buf[PAGE_OFF_UPPER..PAGE_OFF_UPPER + 2], self.upper);
        LittleEndian::write_u32(
            &mut buf[PAGE_OFF_OVERFLOW_SIZE..PAGE_OFF_OVERFLOW_SIZE + 4],
            self.overflow_size,
        );
        Ok(())
    }

    #[inline]
    pub fn is_overflow(&self) -> bool {
        self.flags & PAGE_FLAG_OVERFLOW != 0
    }

    /// Количество страниц в прогоне, который начинается с этого заголовка.
    #[inline]
    pub fn run_pages(&self, page_size: usize) -> u64 {
        if self.is_overflow() {
            pages_for_overflow(self.overflow_size as usize, page_size)
        } else {
            1
        }
    }
}

/// Страниц, нужных для overflow-нагрузки `bytes` (вместе с заголовком).
#[inline]
pub fn pages_for_overflow(bytes: usize, page_size: usize) -> u64 {
    let total = PAGE_HEADER_SIZE + bytes;
    (((total + page_size - 1) / page_size) as u64).max(1)
}

/// Занулить прогон из `count` страниц и проинициализировать заголовок первой.
pub fn init_page_run(buf: &mut [u8], page_number: u64, count: u64, page_size: usize) -> Result<()> {
    let expected = count as usize * page_size;
    if count == 0 || buf.len() != expected {
        return Err(anyhow!(
            "page run buffer is {} bytes, expected {} for {} pages",
            buf.len(),
            expected,
            count
        ));
    }
    buf.fill(0);
    let hdr = if count == 1 {
        PageHeader {
            page_number,
            flags: PAGE_FLAG_SINGLE,
            lower: PAGE_HEADER_SIZE as u16,
            upper: page_size.min(u16::MAX as usize) as u16,
            overflow_size: 0,
        }
    } else {
        PageHeader {
            page_number,
            flags: PAGE_FLAG_OVERFLOW,
            lower: 0,
            upper: 0,
            overflow_size: (expected - PAGE_HEADER_SIZE) as u32,
        }
    };
    hdr.write(buf)
}

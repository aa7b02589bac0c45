//! pager/mmap — data file через memmap2.
//!
//! - Файл всегда кратен page_size; экстент = len / page_size страниц.
//! - Рост: set_len (минимум +50% или до нужной страницы), затем remap.
//! - Plain режим: crc32c прогона проверяется при первом доступе (acquire_page_pointer);
//!   несовпадение = IntegrityFailure.
//! - written_pages: граница записанного, растёт с каждой write_page_run. Нулевой прогон
//!   выше неё = "выделен, не записан"; ниже — затёрт.

use anyhow::{anyhow, Context, Result};
use log::debug;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::KeelError;
use crate::metrics::record_integrity_failure;
use crate::page::{run_verify_checksum, PageHeader};
use crate::pager::{is_unwritten_run, Pager, PagerTxState};

pub struct MmapPager {
    path: PathBuf,
    file: File,
    map: Option<MmapMut>,
    page_size: usize,
    allocated_pages: u64,
    written_pages: u64,
}

impl MmapPager {
    /// Открыть (или создать) data file; экстент не меньше `min_pages`.
    pub fn open(path: &Path, page_size: usize, min_pages: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open data file {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .len();
        let ps = page_size as u64;
        let pages = ((len + ps - 1) / ps).max(min_pages);

        let mut pager = Self {
            path: path.to_path_buf(),
            file,
            map: None,
            page_size,
            allocated_pages: 0,
            written_pages: 0,
        };
        pager.resize(pages)?;
        Ok(pager)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn resize(&mut self, pages: u64) -> Result<()> {
        let new_len = pages * self.page_size as u64;
        // старый map должен уйти до set_len/remap
        self.map = None;
        if self.file.metadata()?.len() != new_len {
            self.file
                .set_len(new_len)
                .with_context(|| format!("grow {} to {} bytes", self.path.display(), new_len))?;
        }
        if new_len > 0 {
            let map = unsafe {
                MmapOptions::new()
                    .len(new_len as usize)
                    .map_mut(&self.file)
                    .map_err(|e| anyhow!("mmap {}: {}", self.path.display(), e))?
            };
            self.map = Some(map);
        }
        self.allocated_pages = pages;
        debug!("data file {} mapped: {} pages", self.path.display(), pages);
        Ok(())
    }

    fn run_bounds(&self, page_number: u64) -> Result<(usize, usize)> {
        let map = self.map.as_ref().ok_or(KeelError::PageOutOfRange {
            page: page_number,
            allocated: self.allocated_pages,
        })?;
        if page_number >= self.allocated_pages {
            return Err(KeelError::PageOutOfRange {
                page: page_number,
                allocated: self.allocated_pages,
            }
            .into());
        }
        let ps = self.page_size;
        let start = page_number as usize * ps;
        let hdr = PageHeader::read(&map[start..start + ps])?;
        let count = hdr.run_pages(ps);
        let last = page_number + count - 1;
        if last >= self.allocated_pages {
            return Err(KeelError::PageOutOfRange {
                page: last,
                allocated: self.allocated_pages,
            }
            .into());
        }
        Ok((start, start + count as usize * ps))
    }
}

impl Pager for MmapPager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn allocated_pages(&self) -> u64 {
        self.allocated_pages
    }

    fn written_extent(&self) -> u64 {
        self.written_pages
    }

    fn raise_written_extent(&mut self, pages: u64) {
        self.written_pages = self.written_pages.max(pages);
    }

    fn ensure_continuous(&mut self, page_number: u64, count: u64) -> Result<()> {
        let need = page_number + count;
        if need <= self.allocated_pages {
            return Ok(());
        }
        let grown = self.allocated_pages + self.allocated_pages / 2;
        self.resize(need.max(grown))
    }

    fn read_raw_run(&self, page_number: u64) -> Result<Vec<u8>> {
        let (start, end) = self.run_bounds(page_number)?;
        match self.map.as_ref() {
            Some(map) => Ok(map[start..end].to_vec()),
            None => Err(anyhow!("data file {} is not mapped", self.path.display())),
        }
    }

    fn write_page_run(&mut self, page_number: u64, run: &[u8]) -> Result<()> {
        let ps = self.page_size;
        if run.is_empty() || run.len() % ps != 0 {
            return Err(anyhow!(
                "page run for page {} has {} bytes, not a multiple of {}",
                page_number,
                run.len(),
                ps
            ));
        }
        let count = (run.len() / ps) as u64;
        self.ensure_continuous(page_number, count)?;
        let start = page_number as usize * ps;
        match self.map.as_mut() {
            Some(map) => {
                map[start..start + run.len()].copy_from_slice(run);
                self.raise_written_extent(page_number + count);
                Ok(())
            }
            None => Err(anyhow!("data file {} is not mapped", self.path.display())),
        }
    }

    fn sync(&mut self) -> Result<()> {
        if let Some(map) = self.map.as_ref() {
            map.flush()
                .with_context(|| format!("msync {}", self.path.display()))?;
        }
        self.file
            .sync_all()
            .with_context(|| format!("fsync {}", self.path.display()))?;
        Ok(())
    }

    fn acquire_page_pointer<'s>(
        &self,
        state: &'s mut PagerTxState,
        page_number: u64,
    ) -> Result<&'s [u8]> {
        if !state.contains(page_number) {
            let raw = self.read_raw_run(page_number)?;
            let unwritten = is_unwritten_run(&raw, page_number, self.written_pages)?;
            if !unwritten && !run_verify_checksum(&raw)? {
                record_integrity_failure();
                return Err(KeelError::integrity(
                    format!("page {}", page_number),
                    "crc32c mismatch",
                )
                .into());
            }
            state.insert_clean(page_number, raw);
        }
        state
            .get(page_number)
            .ok_or_else(|| anyhow!("page {} vanished from transaction state", page_number))
    }
}

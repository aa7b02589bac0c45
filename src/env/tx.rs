//! env/tx — транзакции окружения.
//!
//! ReadTransaction: снапшот на last_committed, зарегистрирован в readers до Drop.
//! WriteTransaction: держит write_lock; страницы копируются в собственный
//! PagerTxState; commit — журнал → PageTable → last_committed → commit gate.
//! Drop без commit = откат (состояние просто выбрасывается).

use anyhow::{anyhow, Result};
use log::{debug, warn};
use std::sync::MutexGuard;

use crate::consts::{ENV_HEADER_PAGE, PAGE_FLAG_OVERFLOW};
use crate::journal::CommitRecord;
use crate::page::{pages_for_overflow, run_update_checksum, EnvHeader, PageHeader, TreeRootHeader};
use crate::pager::PagerTxState;

use super::{lock, StorageEnvironment};

pub struct ReadTransaction<'e> {
    env: &'e StorageEnvironment,
    snapshot: u64,
    next_page_number: u64,
    state: PagerTxState,
}

impl<'e> ReadTransaction<'e> {
    pub(super) fn new(env: &'e StorageEnvironment, snapshot: u64, next_page_number: u64) -> Self {
        Self {
            env,
            snapshot,
            next_page_number,
            state: PagerTxState::new(env.page_size()),
        }
    }

    /// Id последней транзакции, видимой этому снапшоту.
    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    pub fn next_page_number(&self) -> u64 {
        self.next_page_number
    }

    pub fn get_page(&mut self, page: u64) -> Result<&[u8]> {
        self.env
            .load_run(&mut self.state, page, self.snapshot, self.next_page_number)?;
        self.state
            .get(page)
            .ok_or_else(|| anyhow!("page {} not loaded", page))
    }

    pub fn env_header(&mut self) -> Result<EnvHeader> {
        EnvHeader::read(self.get_page(ENV_HEADER_PAGE)?)
    }
}

impl Drop for ReadTransaction<'_> {
    fn drop(&mut self) {
        self.env.unregister_reader(self.snapshot);
    }
}

pub struct WriteTransaction<'e> {
    env: &'e StorageEnvironment,
    guard: Option<MutexGuard<'e, ()>>,
    id: u64,
    snapshot: u64,
    next_page_number: u64,
    allocated_pages: u64,
    overflow_pages: u64,
    state: PagerTxState,
    lazy: bool,
    registered: bool,
    done: bool,
}

impl<'e> WriteTransaction<'e> {
    pub(super) fn new(
        env: &'e StorageEnvironment,
        guard: MutexGuard<'e, ()>,
        snapshot: u64,
        next_page_number: u64,
    ) -> Self {
        Self {
            env,
            guard: Some(guard),
            id: snapshot + 1,
            snapshot,
            next_page_number,
            allocated_pages: 0,
            overflow_pages: 0,
            state: PagerTxState::new(env.page_size()),
            lazy: false,
            registered: true,
            done: false,
        }
    }

    /// Id, который получит транзакция при commit.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }

    pub fn next_page_number(&self) -> u64 {
        self.next_page_number
    }

    /// Lazy: журнал не fsync'ится на commit.
    pub fn set_lazy(&mut self, lazy: bool) {
        self.lazy = lazy;
    }

    fn load(&mut self, page: u64) -> Result<()> {
        self.env
            .load_run(&mut self.state, page, self.snapshot, self.next_page_number)
    }

    pub fn get_page(&mut self, page: u64) -> Result<&[u8]> {
        self.load(page)?;
        self.state
            .get(page)
            .ok_or_else(|| anyhow!("page {} not loaded", page))
    }

    /// Образ прогона для изменения; попадёт в журнал при commit.
    pub fn modify_page(&mut self, page: u64) -> Result<&mut [u8]> {
        self.load(page)?;
        self.state.mark_dirty(page)
    }

    /// `count` смежных новых страниц. Возвращает номер первой.
    pub fn allocate_pages(&mut self, count: u64) -> Result<u64> {
        if count == 0 {
            return Err(anyhow!("cannot allocate zero pages"));
        }
        let first = self.next_page_number;
        self.env
            .pager_read()
            .acquire_new_page_pointer(&mut self.state, first, count)?;
        self.next_page_number += count;
        self.allocated_pages += count;
        if count > 1 {
            self.overflow_pages += count;
        }
        Ok(first)
    }

    /// Overflow-прогон под `bytes` полезной нагрузки.
    pub fn allocate_overflow(&mut self, bytes: usize) -> Result<u64> {
        let ps = self.env.page_size();
        let count = pages_for_overflow(bytes, ps);
        let first = self.allocate_pages(count)?;
        if count == 1 {
            self.overflow_pages += 1;
        }
        let run = self.state.mark_dirty(first)?;
        let mut hdr = PageHeader::read(run)?;
        hdr.flags = PAGE_FLAG_OVERFLOW;
        hdr.overflow_size = u32::try_from(bytes)
            .map_err(|_| anyhow!("overflow of {} bytes is too large", bytes))?;
        hdr.write(run)?;
        Ok(first)
    }

    pub fn env_header(&mut self) -> Result<EnvHeader> {
        EnvHeader::read(self.get_page(ENV_HEADER_PAGE)?)
    }

    fn update_env_header(&mut self, f: impl FnOnce(&mut EnvHeader)) -> Result<()> {
        let page = self.modify_page(ENV_HEADER_PAGE)?;
        let mut h = EnvHeader::read(page)?;
        f(&mut h);
        h.write(page)
    }

    pub fn set_schema_version(&mut self, version: u32) -> Result<()> {
        self.update_env_header(|h| h.schema_version = version)
    }

    pub fn set_root(&mut self, root: TreeRootHeader) -> Result<()> {
        self.update_env_header(|h| h.root = root)
    }

    pub fn set_features(&mut self, features: u32) -> Result<()> {
        self.update_env_header(|h| h.features = features)
    }

    fn release(&mut self) {
        if self.registered {
            self.env.unregister_reader(self.snapshot);
            self.registered = false;
        }
        self.guard.take();
    }

    /// Зафиксировать. Возвращает id транзакции (для пустой — id снапшота).
    pub fn commit(mut self) -> Result<u64> {
        let env = self.env;
        env.ensure_writable()?;

        if self.state.dirty_count() == 0 {
            self.done = true;
            return Ok(self.snapshot);
        }

        if self.allocated_pages > 0 {
            let (pages, overflow) = (self.allocated_pages, self.overflow_pages);
            self.update_env_header(|h| {
                h.root.page_count += pages;
                h.root.overflow_pages += overflow;
            })?;
        }
        let root = self.env_header()?.root;

        let ps = env.page_size();
        let mut dirty = self.state.take_dirty();
        if !env.is_encrypted() {
            for (_, run) in dirty.iter_mut() {
                run_update_checksum(run)?;
            }
        }
        let page_count: u64 = dirty.iter().map(|(_, r)| (r.len() / ps) as u64).sum();
        let last_page = dirty
            .last()
            .map(|(n, r)| n + (r.len() / ps) as u64 - 1)
            .unwrap_or(0);
        let mut payload = Vec::with_capacity(page_count as usize * ps);
        for (_, run) in &dirty {
            payload.extend_from_slice(run);
        }

        let pending = {
            let mut journal = lock(&env.journal);
            let appended = journal.append(&CommitRecord {
                transaction_id: self.id,
                next_page_number: self.next_page_number,
                last_page_number: last_page,
                page_count: u32::try_from(page_count)
                    .map_err(|_| anyhow!("transaction {} touches too many pages", self.id))?,
                root,
                lazy: self.lazy,
                pages: &payload,
            });
            env.observe(appended)?;

            let mut table = env.pages_write();
            table.insert_committed(self.id, self.next_page_number, dirty);
            let pending = table.version_count();
            drop(table);

            let mut st = lock(&env.state);
            st.last_committed = self.id;
            st.next_page_number = self.next_page_number;
            pending
        };

        self.done = true;
        self.release();
        env.commit_gate.set_and_reset_atomically();
        debug!("tx {}: committed {} page(s)", self.id, page_count);

        let threshold = env.config().flush_threshold_pages;
        if threshold > 0 && pending >= threshold {
            if let Err(e) = env.flush_to_data_file() {
                warn!("tx {}: auto-checkpoint failed: {:#}", self.id, e);
            }
        }
        Ok(self.id)
    }
}

impl Drop for WriteTransaction<'_> {
    fn drop(&mut self) {
        if !self.done {
            debug!("tx {}: rolled back ({} dirty)", self.id, self.state.dirty_count());
        }
        self.release();
    }
}

//! env — StorageEnvironment: data file + журнал + MVCC поверх Pager.
//!
//! Подмодули:
//! - page_table.rs — зафиксированные, ещё не сброшенные версии страниц.
//! - tx.rs         — ReadTransaction / WriteTransaction.
//! - recover.rs    — офлайн-экспорт проверяемых прогонов (keeldb recover).
//!
//! Поток данных:
//! - write-транзакция копирует страницы в свой PagerTxState; commit пишет их
//!   в журнал, публикует в PageTable и будит commit gate;
//! - читатель видит снапшот: PageTable (tx_id <= snapshot), иначе data file;
//! - checkpoint (flush_to_data_file) сбрасывает версии, невидимые никому, кроме
//!   снапшотов >= самого старого читателя, и обрезает журнал, когда он пуст;
//! - open: LOCK → meta → pager → реплей журнала (усечение torn-хвоста) → checkpoint
//!   → апгрейд схемы.
//!
//! Порядок блокировок: write_lock → journal → pages → state; readers → state.
//! IntegrityFailure на любом пути переводит окружение в halted: запись запрещена.
//!
//! Буферы: окружение владеет NativeMemoryPool (буферы размером в страницу) для
//! кадров журнала и шифрования прогонов; NativeMemoryCleaner по cleaner_* настройкам
//! возвращает простаивающие буферы. Фоновый поток чистильщика живёт до Drop окружения.

use anyhow::{anyhow, Context, Result};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::config::{EnvBuilder, KeelConfig};
use crate::consts::DATA_FILE;
use crate::crypto::{KeyProvider, NonceSequence, PageCipher};
use crate::error::{keel_error, KeelError};
use crate::journal::{journal_path, replay_journal, JournalWriter, ReplayOptions, ReplayReport};
use crate::lock::{try_acquire_exclusive_lock, LockGuard};
use crate::memory::{CleanerHandle, NativeMemoryCleaner, NativeMemoryPool};
use crate::meta::{read_meta, set_clean_shutdown, validate_page_size, write_meta_new, write_meta_overwrite, MetaHeader};
use crate::metrics::record_checkpoint;
use crate::page::EnvHeader;
use crate::pager::{CryptoPager, MmapPager, Pager, PagerTxState};
use crate::schema::{upgrade_to_current, StorageType};
use crate::signal::AsyncManualResetEvent;

pub mod page_table;
pub mod recover;
pub mod tx;

pub use page_table::PageTable;
pub use recover::{recover_pages, verify_journal, RecoveryReport, RECOVERY_MAGIC};
pub use tx::{ReadTransaction, WriteTransaction};

#[derive(Debug, Clone, Copy, Default)]
struct EnvState {
    last_committed: u64,
    next_page_number: u64,
    last_flushed: u64,
}

/// Итог checkpoint'а.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckpointReport {
    pub flushed_upto: u64,
    pub pages_written: u64,
    pub journal_truncated: bool,
}

/// Снимок состояния для `keeldb status`.
#[derive(Debug, Clone, Serialize)]
pub struct EnvStats {
    pub page_size: usize,
    pub storage_type: StorageType,
    pub encrypted: bool,
    pub last_committed_tx: u64,
    pub last_flushed_tx: u64,
    pub next_page_number: u64,
    pub allocated_pages: u64,
    pub pending_versions: usize,
    pub journal_bytes: u64,
    pub active_readers: usize,
    pub pooled_buffers: usize,
    pub halted: Option<String>,
}

pub struct StorageEnvironment {
    root: PathBuf,
    cfg: KeelConfig,
    storage_type: StorageType,
    page_size: usize,
    _lock: LockGuard,
    pager: RwLock<Box<dyn Pager>>,
    journal: Mutex<JournalWriter>,
    pages: RwLock<PageTable>,
    // snapshot tx_id -> число читателей
    readers: Mutex<BTreeMap<u64, usize>>,
    state: Mutex<EnvState>,
    write_lock: Mutex<()>,
    flush_lock: Mutex<()>,
    commit_gate: AsyncManualResetEvent,
    halted: Mutex<Option<String>>,
    closed: AtomicBool,
    cipher: Option<Arc<PageCipher>>,
    recovery: ReplayReport,
    buffers: Arc<NativeMemoryPool>,
    cleaner: Arc<NativeMemoryCleaner>,
    // останавливается в Drop (CleanerHandle)
    _cleaner_thread: Option<CleanerHandle>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl StorageEnvironment {
    pub fn builder() -> EnvBuilder {
        EnvBuilder::new()
    }

    /// Создать новое окружение: meta, data file, журнал и страница 0 (EnvHeader)
    /// первой транзакцией.
    pub fn create(
        root: &Path,
        cfg: KeelConfig,
        storage_type: StorageType,
        keys: Option<&dyn KeyProvider>,
    ) -> Result<Self> {
        validate_page_size(cfg.page_size)?;
        std::fs::create_dir_all(root)
            .with_context(|| format!("create environment dir {}", root.display()))?;
        let lock = try_acquire_exclusive_lock(root)?;

        let meta = MetaHeader::new(cfg.page_size, storage_type.as_u8(), cfg.encryption_enabled);
        write_meta_new(root, &meta)?;
        info!(
            "create: {} environment at {} (page_size={}, encrypted={})",
            storage_type,
            root.display(),
            cfg.page_size,
            cfg.encryption_enabled
        );

        let env = Self::open_locked(root, cfg, keys, lock)?;
        {
            let mut tx = env.write_txn()?;
            let page = tx.allocate_pages(1)?;
            let buf = tx.modify_page(page)?;
            EnvHeader::new(storage_type, storage_type.current_version()).write(buf)?;
            tx.commit()?;
        }
        Ok(env)
    }

    /// Открыть существующее окружение (реплей журнала, апгрейд схемы).
    pub fn open(root: &Path, cfg: KeelConfig, keys: Option<&dyn KeyProvider>) -> Result<Self> {
        let lock = try_acquire_exclusive_lock(root)?;
        let env = Self::open_locked(root, cfg, keys, lock)?;
        if env.cfg.auto_schema_upgrade {
            let applied = upgrade_to_current(&env)?;
            if !applied.is_empty() {
                info!("open: schema upgraded via {}", applied.join(", "));
            }
        }
        Ok(env)
    }

    fn open_locked(
        root: &Path,
        cfg: KeelConfig,
        keys: Option<&dyn KeyProvider>,
        lock: LockGuard,
    ) -> Result<Self> {
        let mut meta = read_meta(root)?;
        let storage_type = StorageType::from_u8(meta.storage_type)?;
        let page_size = meta.page_size as usize;
        let cipher = build_cipher(root, &cfg, &meta, keys)?;

        let buffers = NativeMemoryPool::new(page_size);
        let cleaner = NativeMemoryCleaner::from_config(&cfg);
        cleaner.register(&buffers);

        let data_path = root.join(DATA_FILE);
        let min_pages = cfg.initial_file_pages.max(meta.next_page_number);
        let raw = MmapPager::open(&data_path, page_size, min_pages)?;
        let mut pager: Box<dyn Pager> = match cipher.as_ref() {
            Some(c) => Box::new(
                CryptoPager::new(Box::new(raw), Arc::clone(c)).with_buffers(Arc::clone(&buffers)),
            ),
            None => Box::new(raw),
        };
        // всё ниже сброшенной границы уже лежит в data file
        pager.raise_written_extent(meta.next_page_number);

        if !meta.clean_shutdown {
            warn!("open: {} was not shut down cleanly, replaying journal", root.display());
        }
        let mut next_page = meta.next_page_number;
        let opts = ReplayOptions {
            page_size,
            cipher: cipher.clone(),
            flushed_tx_id: meta.last_flushed_tx,
            truncate: true,
        };
        let replayed = replay_journal(&journal_path(root), &opts, |h, runs| {
            for (page, run) in runs {
                pager.write_page_run(*page, run)?;
            }
            next_page = next_page.max(h.next_page_number);
            Ok(())
        });
        let report = match replayed {
            Ok(r) => r,
            Err(e) => {
                if matches!(keel_error(&e), Some(KeelError::IntegrityFailure { .. })) {
                    error!("CATASTROPHIC: journal replay in {} failed: {:#}", root.display(), e);
                }
                return Err(e);
            }
        };

        if report.applied > 0 {
            pager.sync()?;
            meta.last_flushed_tx = report.last_tx_id;
            meta.next_page_number = next_page;
        }
        meta.clean_shutdown = false;
        write_meta_overwrite(root, &meta)?;

        let zstd_level = cfg.journal_compression.then_some(cfg.journal_compression_level);
        let mut journal =
            JournalWriter::open(root, page_size, cfg.journal_fsync, zstd_level, cipher.clone())?
                .with_buffers(Arc::clone(&buffers));
        if !journal.is_empty() {
            journal.truncate_to_header()?;
        }

        let state = EnvState {
            last_committed: report.last_tx_id.max(meta.last_flushed_tx),
            next_page_number: meta.next_page_number,
            last_flushed: meta.last_flushed_tx,
        };
        debug!(
            "open: {} ready (last tx {}, next page {}, {} applied from journal)",
            root.display(),
            state.last_committed,
            state.next_page_number,
            report.applied
        );

        let cleaner_thread = if cfg.cleaner_period_ms > 0 {
            Some(cleaner.start().context("start native memory cleaner")?)
        } else {
            None
        };

        Ok(Self {
            root: root.to_path_buf(),
            cfg,
            storage_type,
            page_size,
            _lock: lock,
            pager: RwLock::new(pager),
            journal: Mutex::new(journal),
            pages: RwLock::new(PageTable::new()),
            readers: Mutex::new(BTreeMap::new()),
            state: Mutex::new(state),
            write_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            commit_gate: AsyncManualResetEvent::new(),
            halted: Mutex::new(None),
            closed: AtomicBool::new(false),
            cipher,
            recovery: report,
            buffers,
            cleaner,
            _cleaner_thread: cleaner_thread,
        })
    }

    // ---------- доступ к состоянию ----------

    fn pager_read(&self) -> RwLockReadGuard<'_, Box<dyn Pager>> {
        self.pager.read().unwrap_or_else(|e| e.into_inner())
    }

    fn pager_write(&self) -> RwLockWriteGuard<'_, Box<dyn Pager>> {
        self.pager.write().unwrap_or_else(|e| e.into_inner())
    }

    fn pages_read(&self) -> RwLockReadGuard<'_, PageTable> {
        self.pages.read().unwrap_or_else(|e| e.into_inner())
    }

    fn pages_write(&self) -> RwLockWriteGuard<'_, PageTable> {
        self.pages.write().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> EnvState {
        *lock(&self.state)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &KeelConfig {
        &self.cfg
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn last_committed_tx(&self) -> u64 {
        self.state().last_committed
    }

    pub fn last_flushed_tx(&self) -> u64 {
        self.state().last_flushed
    }

    pub fn next_page_number(&self) -> u64 {
        self.state().next_page_number
    }

    /// Что сделал реплей журнала при открытии.
    pub fn recovery_report(&self) -> &ReplayReport {
        &self.recovery
    }

    pub fn commit_gate(&self) -> &AsyncManualResetEvent {
        &self.commit_gate
    }

    /// Пул рабочих буферов окружения (размером в страницу).
    pub fn buffer_pool(&self) -> &Arc<NativeMemoryPool> {
        &self.buffers
    }

    pub fn memory_cleaner(&self) -> &Arc<NativeMemoryCleaner> {
        &self.cleaner
    }

    pub fn stats(&self) -> EnvStats {
        let st = self.state();
        EnvStats {
            page_size: self.page_size,
            storage_type: self.storage_type,
            encrypted: self.is_encrypted(),
            last_committed_tx: st.last_committed,
            last_flushed_tx: st.last_flushed,
            next_page_number: st.next_page_number,
            allocated_pages: self.pager_read().allocated_pages(),
            pending_versions: self.pages_read().version_count(),
            journal_bytes: lock(&self.journal).len(),
            active_readers: lock(&self.readers).values().sum(),
            pooled_buffers: self.buffers.tracked_items(),
            halted: self.halt_reason(),
        }
    }

    // ---------- halted ----------

    pub fn is_halted(&self) -> bool {
        lock(&self.halted).is_some()
    }

    pub fn halt_reason(&self) -> Option<String> {
        lock(&self.halted).clone()
    }

    fn halt(&self, reason: String) {
        let mut h = lock(&self.halted);
        if h.is_none() {
            error!("CATASTROPHIC: environment {} halted: {}", self.root.display(), reason);
            *h = Some(reason);
        }
    }

    /// Пропустить результат через детектор катастроф.
    fn observe<T>(&self, r: Result<T>) -> Result<T> {
        if let Err(e) = r.as_ref() {
            if matches!(keel_error(e), Some(KeelError::IntegrityFailure { .. })) {
                self.halt(format!("{:#}", e));
            }
        }
        r
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.halt_reason() {
            Some(reason) => Err(KeelError::EnvironmentHalted { reason }.into()),
            None => Ok(()),
        }
    }

    // ---------- читатели ----------

    fn register_reader(&self) -> (u64, u64) {
        let mut readers = lock(&self.readers);
        let st = self.state();
        *readers.entry(st.last_committed).or_insert(0) += 1;
        (st.last_committed, st.next_page_number)
    }

    fn unregister_reader(&self, snapshot: u64) {
        let mut readers = lock(&self.readers);
        if let Some(n) = readers.get_mut(&snapshot) {
            *n -= 1;
            if *n == 0 {
                readers.remove(&snapshot);
            }
        }
    }

    /// Снапшот на последнюю зафиксированную транзакцию.
    pub fn read_txn(&self) -> ReadTransaction<'_> {
        let (snapshot, next_page) = self.register_reader();
        ReadTransaction::new(self, snapshot, next_page)
    }

    /// Единственная write-транзакция (ожидает завершения предыдущей).
    pub fn write_txn(&self) -> Result<WriteTransaction<'_>> {
        self.ensure_writable()?;
        let guard = lock(&self.write_lock);
        let (snapshot, next_page) = self.register_reader();
        Ok(WriteTransaction::new(self, guard, snapshot, next_page))
    }

    /// Загрузить прогон `page` в состояние транзакции: PageTable, затем data file.
    fn load_run(
        &self,
        state: &mut PagerTxState,
        page: u64,
        snapshot: u64,
        next_page: u64,
    ) -> Result<()> {
        if state.contains(page) {
            return Ok(());
        }
        if page >= next_page {
            return Err(KeelError::PageOutOfRange {
                page,
                allocated: next_page,
            }
            .into());
        }
        if let Some(v) = self.pages_read().lookup(page, snapshot) {
            state.insert_clean(page, v.as_ref().clone());
            return Ok(());
        }
        let r = self
            .pager_read()
            .acquire_page_pointer(state, page)
            .map(|_| ());
        self.observe(r)
    }

    /// Заголовок окружения (страница 0) на текущем снапшоте.
    pub fn env_header(&self) -> Result<EnvHeader> {
        self.read_txn().env_header()
    }

    // ---------- commit gate ----------

    /// Дождаться фиксации транзакции `tx_id`. false — по таймауту.
    pub async fn wait_for_commit(&self, tx_id: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            // закрепить поколение до проверки, иначе сигнал можно пропустить
            let handle = self.commit_gate.wait_handle();
            if self.last_committed_tx() >= tx_id {
                return true;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() || !handle.wait_with_timeout(left).await {
                return self.last_committed_tx() >= tx_id;
            }
        }
    }

    // ---------- checkpoint ----------

    /// fsync журнала (для Lazy-транзакций).
    pub fn sync_journal(&self) -> Result<()> {
        lock(&self.journal).sync()
    }

    /// Сбросить в data file всё, что не нужно никому из активных читателей.
    pub fn flush_to_data_file(&self) -> Result<CheckpointReport> {
        let _flush = lock(&self.flush_lock);
        self.ensure_writable()?;

        let upto = {
            let readers = lock(&self.readers);
            let st = self.state();
            readers
                .keys()
                .next()
                .copied()
                .map_or(st.last_committed, |oldest| oldest.min(st.last_committed))
        };
        let flushable = self.pages_read().collect_flushable(upto);
        let mut report = CheckpointReport {
            flushed_upto: upto,
            ..Default::default()
        };

        if !flushable.runs.is_empty() {
            let r = (|| -> Result<()> {
                let mut pager = self.pager_write();
                if let Some(next) = flushable.next_page_number {
                    pager.ensure_continuous(0, next)?;
                }
                for (page, run) in &flushable.runs {
                    pager.write_page_run(*page, run)?;
                }
                pager.sync()
            })();
            self.observe(r)?;
            report.pages_written = flushable.runs.len() as u64;
        }

        let prev = self.state();
        if upto > prev.last_flushed {
            let mut meta = read_meta(&self.root)?;
            meta.last_flushed_tx = upto;
            if let Some(next) = flushable.next_page_number {
                meta.next_page_number = next;
            }
            meta.clean_shutdown = false;
            write_meta_overwrite(&self.root, &meta)?;
            self.pages_write().remove_flushed(upto);
            lock(&self.state).last_flushed = upto;
        }

        {
            let mut journal = lock(&self.journal);
            let st = self.state();
            if st.last_committed == st.last_flushed && !journal.is_empty() {
                journal.truncate_to_header()?;
                report.journal_truncated = true;
            }
        }

        record_checkpoint(report.pages_written);
        debug!(
            "checkpoint: {} run(s) written, flushed upto tx {}, journal truncated: {}",
            report.pages_written, upto, report.journal_truncated
        );
        Ok(report)
    }

    /// Явное закрытие: checkpoint (если разрешён) и отметка чистого завершения.
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if !self.cfg.flush_on_close || self.is_halted() {
            return Ok(());
        }
        let r = self.flush_to_data_file()?;
        if r.flushed_upto == self.last_committed_tx() {
            set_clean_shutdown(&self.root, true)?;
        }
        Ok(())
    }
}

impl Drop for StorageEnvironment {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("close {}: {:#}", self.root.display(), e);
        }
    }
}

fn build_cipher(
    root: &Path,
    cfg: &KeelConfig,
    meta: &MetaHeader,
    keys: Option<&dyn KeyProvider>,
) -> Result<Option<Arc<PageCipher>>> {
    if !meta.is_encrypted() {
        return Ok(None);
    }
    let provider = keys.ok_or_else(|| {
        anyhow!(
            "environment {} is encrypted; a key provider is required",
            root.display()
        )
    })?;
    let kid = cfg
        .encryption_key_id
        .clone()
        .unwrap_or_else(|| provider.default_kid().to_string());
    let key = provider.key(&kid)?;
    let seq = NonceSequence::open(root, cfg.nonce_reserve_block)?;
    Ok(Some(Arc::new(PageCipher::new(&key, Arc::new(seq)))))
}

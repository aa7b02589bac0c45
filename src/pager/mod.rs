//! pager — слой управления страницами.
//!
//! Подмодули:
//! - state.rs  — PagerTxState: страницы, загруженные в рамках одной транзакции.
//! - mmap.rs   — MmapPager: data file через memmap2, рост через set_len + remap.
//! - crypto.rs — CryptoPager: прозрачное шифрование поверх любого Pager.
//!
//! Контракт Pager:
//! - страницы адресуются номером первой страницы прогона;
//! - acquire_* возвращают ссылку в PagerTxState, она живёт столько же, сколько
//!   состояние транзакции; загрузка/расшифровка ленивые, один раз на страницу;
//! - write_page_run получает чистый (plain) образ и пишет его в хранилище (CryptoPager
//!   шифрует копию); вызывается только на checkpoint/replay;
//! - расширение файла только через ensure_continuous.
//! - граница записанного (written_extent): прогоны ниже неё уже записывались.
//!   Нулевой прогон там = затёртые данные (IntegrityFailure), а не "выделен, не записан".

use anyhow::Result;

pub mod state;
pub mod mmap;
pub mod crypto;

pub use crypto::CryptoPager;
pub use mmap::MmapPager;
pub use state::PagerTxState;

use crate::error::KeelError;
use crate::metrics::record_integrity_failure;
use crate::page::init_page_run;

pub trait Pager: Send + Sync {
    fn page_size(&self) -> usize;

    /// Страниц в выделенном экстенте data file.
    fn allocated_pages(&self) -> u64;

    /// Страницы ниже этой границы хотя бы раз записаны в хранилище.
    fn written_extent(&self) -> u64;

    /// Поднять границу записанного (open: из meta.next_page_number).
    fn raise_written_extent(&mut self, pages: u64);

    /// Гарантировать, что страницы [page_number, page_number + count) выделены.
    fn ensure_continuous(&mut self, page_number: u64, count: u64) -> Result<()>;

    /// Прогон как он лежит в хранилище (для CryptoPager — зашифрованный).
    fn read_raw_run(&self, page_number: u64) -> Result<Vec<u8>>;

    /// Записать plain-образ прогона.
    fn write_page_run(&mut self, page_number: u64, run: &[u8]) -> Result<()>;

    fn sync(&mut self) -> Result<()>;

    fn is_encrypted(&self) -> bool {
        false
    }

    /// Читаемый образ прогона в рамках транзакции.
    fn acquire_page_pointer<'s>(
        &self,
        state: &'s mut PagerTxState,
        page_number: u64,
    ) -> Result<&'s [u8]>;

    /// `count` новых смежных страниц: нули, проинициализированный заголовок, dirty.
    fn acquire_new_page_pointer<'s>(
        &self,
        state: &'s mut PagerTxState,
        page_number: u64,
        count: u64,
    ) -> Result<&'s mut [u8]> {
        let ps = self.page_size();
        let mut buf = vec![0u8; count as usize * ps];
        init_page_run(&mut buf, page_number, count, ps)?;
        Ok(state.insert_new(page_number, buf))
    }
}

/// true — прогон ни разу не записывался и читается как нули.
/// Нулевой прогон ниже границы записанного — IntegrityFailure.
pub(crate) fn is_unwritten_run(run: &[u8], page_number: u64, written_extent: u64) -> Result<bool> {
    if run.iter().any(|&b| b != 0) {
        return Ok(false);
    }
    if page_number < written_extent {
        record_integrity_failure();
        return Err(KeelError::integrity(
            format!("page {}", page_number),
            format!(
                "run reads back as zeros below the written extent ({} pages)",
                written_extent
            ),
        )
        .into());
    }
    Ok(true)
}

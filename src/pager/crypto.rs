//! pager/crypto — CryptoPager: прозрачное шифрование поверх внутреннего Pager.
//!
//! - Владеет внутренним pager'ом эксклюзивно (Box), освобождает его вместе с собой.
//! - Чтение: сырой прогон из inner → decrypt_run → plain образ в PagerTxState.
//!   Расшифровка ленивая, один раз на страницу на транзакцию.
//! - Запись (checkpoint/replay): копия образа шифруется свежим nonce и уходит в inner.
//!   Каждая запись прогона = новое значение NonceSequence, повтор невозможен.
//! - Полностью нулевой прогон выше границы записанного (выделен, но не записан)
//!   читается как нули; ниже границы это затёртые данные = IntegrityFailure.
//! - Копия для шифрования берётся из пула окружения, если прогон в него помещается.
//! - Ошибка MAC = KeelError::IntegrityFailure; окружение переводит себя в halted.

use anyhow::{anyhow, Result};
use std::sync::Arc;

use crate::crypto::PageCipher;
use crate::memory::{NativeMemoryPool, ScratchBuffer};
use crate::pager::{is_unwritten_run, Pager, PagerTxState};

pub struct CryptoPager {
    inner: Box<dyn Pager>,
    cipher: Arc<PageCipher>,
    buffers: Option<Arc<NativeMemoryPool>>,
}

impl CryptoPager {
    pub fn new(inner: Box<dyn Pager>, cipher: Arc<PageCipher>) -> Self {
        Self {
            inner,
            cipher,
            buffers: None,
        }
    }

    pub fn with_buffers(mut self, pool: Arc<NativeMemoryPool>) -> Self {
        self.buffers = Some(pool);
        self
    }

    pub fn cipher(&self) -> &Arc<PageCipher> {
        &self.cipher
    }
}

impl Pager for CryptoPager {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn allocated_pages(&self) -> u64 {
        self.inner.allocated_pages()
    }

    fn written_extent(&self) -> u64 {
        self.inner.written_extent()
    }

    fn raise_written_extent(&mut self, pages: u64) {
        self.inner.raise_written_extent(pages)
    }

    fn ensure_continuous(&mut self, page_number: u64, count: u64) -> Result<()> {
        self.inner.ensure_continuous(page_number, count)
    }

    fn read_raw_run(&self, page_number: u64) -> Result<Vec<u8>> {
        self.inner.read_raw_run(page_number)
    }

    fn write_page_run(&mut self, page_number: u64, run: &[u8]) -> Result<()> {
        let mut sealed = ScratchBuffer::rent(self.buffers.as_ref(), run.len());
        sealed.copy_from_slice(run);
        self.cipher.encrypt_run(&mut sealed)?;
        self.inner.write_page_run(page_number, &sealed)
    }

    fn sync(&mut self) -> Result<()> {
        self.inner.sync()
    }

    fn is_encrypted(&self) -> bool {
        true
    }

    fn acquire_page_pointer<'s>(
        &self,
        state: &'s mut PagerTxState,
        page_number: u64,
    ) -> Result<&'s [u8]> {
        if !state.contains(page_number) {
            let mut run = self.inner.read_raw_run(page_number)?;
            if !is_unwritten_run(&run, page_number, self.inner.written_extent())? {
                self.cipher.decrypt_run(&mut run)?;
            }
            state.insert_clean(page_number, run);
        }
        state
            .get(page_number)
            .ok_or_else(|| anyhow!("page {} vanished from transaction state", page_number))
    }
}

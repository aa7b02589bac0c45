//! memory/pool — пул буферов фиксированного размера с thread-local стеками.
//!
//! - Свободные элементы лежат в thread-local стеке пула; поток-владелец берёт их без локов.
//! - Каждый элемент также зарегистрирован в ThreadStack потока (общий реестр),
//!   который обходит NativeMemoryCleaner.
//! - Единственная синхронизация между владельцем и чистильщиком — флаг in_use:
//!   кто выиграл try_claim (CAS false→true), тот и распоряжается элементом.
//! - Пока буфер арендован, он вынут из элемента (RentedBuffer владеет Box'ом).

use log::debug;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use crate::error::KeelError;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
pub struct PooledItem {
    in_use: AtomicBool,
    disposed: AtomicBool,
    last_used_ms: AtomicU64,
    size: usize,
    buffer: Mutex<Option<Box<[u8]>>>,
}

impl PooledItem {
    /// Новый элемент, сразу захваченный создателем.
    fn new_claimed(size: usize, now_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            in_use: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            last_used_ms: AtomicU64::new(now_ms),
            size,
            buffer: Mutex::new(None),
        })
    }

    /// Эксклюзивный захват: true только у одного из конкурентов.
    pub fn try_claim(&self) -> bool {
        self.in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self, now_ms: u64) {
        self.last_used_ms.store(now_ms, Ordering::Relaxed);
        self.in_use.store(false, Ordering::Release);
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn last_used_ms(&self) -> u64 {
        self.last_used_ms.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn take_buffer(&self) -> Option<Box<[u8]>> {
        lock(&self.buffer).take()
    }

    fn put_buffer(&self, buf: Box<[u8]>) {
        *lock(&self.buffer) = Some(buf);
    }

    /// Освободить память. Вызывающий должен владеть элементом (try_claim).
    /// Повторный вызов — KeelError::AlreadyDisposed.
    pub fn dispose(&self) -> Result<usize, KeelError> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Err(KeelError::AlreadyDisposed);
        }
        let freed = self.take_buffer().map_or(0, |b| b.len());
        Ok(freed)
    }
}

/// Общий реестр элементов одного потока для одного пула.
#[derive(Debug)]
pub struct ThreadStack {
    thread: String,
    registry: Mutex<Vec<Arc<PooledItem>>>,
    alive: AtomicBool,
}

impl ThreadStack {
    fn new() -> Arc<Self> {
        let thread = std::thread::current()
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", std::thread::current().id()));
        Arc::new(Self {
            thread,
            registry: Mutex::new(Vec::new()),
            alive: AtomicBool::new(true),
        })
    }

    pub fn thread(&self) -> &str {
        &self.thread
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct LocalStack {
    free: Vec<Arc<PooledItem>>,
    shared: Arc<ThreadStack>,
}

impl Drop for LocalStack {
    fn drop(&mut self) {
        // поток завершается: свободные элементы больше никто не возьмёт
        self.shared.alive.store(false, Ordering::Release);
        for item in self.free.drain(..) {
            if item.try_claim() {
                let _ = item.dispose();
            }
        }
    }
}

thread_local! {
    static LOCAL: RefCell<HashMap<u64, LocalStack>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimStats {
    pub examined: usize,
    pub reclaimed: usize,
    pub reclaimed_bytes: usize,
}

#[derive(Debug)]
pub struct NativeMemoryPool {
    id: u64,
    buffer_size: usize,
    epoch: Instant,
    stacks: Mutex<Vec<Arc<ThreadStack>>>,
}

impl NativeMemoryPool {
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            buffer_size,
            epoch: Instant::now(),
            stacks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn new_local(&self) -> LocalStack {
        let shared = ThreadStack::new();
        lock(&self.stacks).push(Arc::clone(&shared));
        LocalStack {
            free: Vec::new(),
            shared,
        }
    }

    /// Взять буфер: из стека текущего потока или новый.
    pub fn rent(self: &Arc<Self>) -> RentedBuffer {
        let reused = LOCAL.try_with(|cell| {
            let mut map = cell.borrow_mut();
            let local = map.entry(self.id).or_insert_with(|| self.new_local());
            while let Some(item) = local.free.pop() {
                // проигранный try_claim = элемент у чистильщика, забываем его
                if !item.try_claim() {
                    continue;
                }
                match item.take_buffer() {
                    Some(buf) => return (Some((item, buf)), Some(Arc::clone(&local.shared))),
                    None => continue,
                }
            }
            (None, Some(Arc::clone(&local.shared)))
        });

        let (hit, shared) = reused.unwrap_or((None, None));
        if let Some((item, buf)) = hit {
            return RentedBuffer {
                pool: Arc::clone(self),
                item,
                buf: Some(buf),
            };
        }

        let item = PooledItem::new_claimed(self.buffer_size, self.now_ms());
        match shared {
            Some(s) => lock(&s.registry).push(Arc::clone(&item)),
            // TLS потока уже разрушается: регистрируем в отдельном мёртвом стеке
            None => {
                let s = ThreadStack::new();
                s.alive.store(false, Ordering::Release);
                lock(&s.registry).push(Arc::clone(&item));
                lock(&self.stacks).push(s);
            }
        }
        RentedBuffer {
            pool: Arc::clone(self),
            item,
            buf: Some(vec![0u8; self.buffer_size].into_boxed_slice()),
        }
    }

    fn give_back(&self, item: Arc<PooledItem>, buf: Box<[u8]>) {
        item.put_buffer(buf);
        item.release(self.now_ms());
        let id = self.id;
        let pushed = LOCAL.try_with(|cell| {
            if let Ok(mut map) = cell.try_borrow_mut() {
                if let Some(local) = map.get_mut(&id) {
                    local.free.push(Arc::clone(&item));
                    return true;
                }
            }
            false
        });
        if !matches!(pushed, Ok(true)) {
            // чужой поток без стека этого пула: элемент остаётся в реестре владельца
            // и уйдёт к чистильщику по простою
            debug!("pool {}: buffer returned on a foreign thread", id);
        }
    }

    /// Вернуть память простаивающих (или всех свободных при `force`) элементов.
    pub fn reclaim(&self, idle_ms: u64, force: bool) -> ReclaimStats {
        self.reclaim_at(self.now_ms(), idle_ms, force)
    }

    /// То же на явный момент `now_ms` (часы пула, см. now_ms).
    pub fn reclaim_at(&self, now: u64, idle_ms: u64, force: bool) -> ReclaimStats {
        let stacks: Vec<Arc<ThreadStack>> = lock(&self.stacks).clone();
        let mut stats = ReclaimStats::default();

        for stack in &stacks {
            let mut reg = lock(&stack.registry);
            reg.retain(|item| {
                stats.examined += 1;
                if item.is_disposed() {
                    return false;
                }
                if item.is_in_use() {
                    return true;
                }
                if !force && now.saturating_sub(item.last_used_ms()) < idle_ms {
                    return true;
                }
                if !item.try_claim() {
                    return true;
                }
                match item.dispose() {
                    Ok(bytes) => {
                        stats.reclaimed += 1;
                        stats.reclaimed_bytes += bytes;
                    }
                    Err(e) => debug!("pool {}: dispose skipped: {}", self.id, e),
                }
                false
            });
        }

        lock(&self.stacks).retain(|s| s.is_alive() || !s.is_empty());
        stats
    }

    /// Сколько потоковых реестров пул сейчас держит.
    pub fn thread_stacks(&self) -> usize {
        lock(&self.stacks).len()
    }

    /// Элементов во всех реестрах (включая арендованные).
    pub fn tracked_items(&self) -> usize {
        lock(&self.stacks).iter().map(|s| s.len()).sum()
    }
}

impl Drop for NativeMemoryPool {
    fn drop(&mut self) {
        for stack in lock(&self.stacks).iter() {
            for item in lock(&stack.registry).drain(..) {
                if item.try_claim() {
                    let _ = item.dispose();
                }
            }
        }
    }
}

/// Рабочий буфер длины `len`: из пула, если помещается, иначе с кучи.
/// Содержимое не обнулено, вызывающий перезаписывает его целиком.
pub enum ScratchBuffer {
    Pooled { buf: RentedBuffer, len: usize },
    Heap(Vec<u8>),
}

impl ScratchBuffer {
    pub fn rent(pool: Option<&Arc<NativeMemoryPool>>, len: usize) -> Self {
        match pool {
            Some(p) if len <= p.buffer_size() => ScratchBuffer::Pooled { buf: p.rent(), len },
            _ => ScratchBuffer::Heap(vec![0u8; len]),
        }
    }

    pub fn is_pooled(&self) -> bool {
        matches!(self, ScratchBuffer::Pooled { .. })
    }
}

impl Deref for ScratchBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ScratchBuffer::Pooled { buf, len } => &buf[..*len],
            ScratchBuffer::Heap(v) => v.as_slice(),
        }
    }
}

impl DerefMut for ScratchBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            ScratchBuffer::Pooled { buf, len } => &mut buf[..*len],
            ScratchBuffer::Heap(v) => v.as_mut_slice(),
        }
    }
}

/// Арендованный буфер; возвращается в пул в Drop.
pub struct RentedBuffer {
    pool: Arc<NativeMemoryPool>,
    item: Arc<PooledItem>,
    buf: Option<Box<[u8]>>,
}

impl RentedBuffer {
    pub fn item(&self) -> &Arc<PooledItem> {
        &self.item
    }
}

impl Deref for RentedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for RentedBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for RentedBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(Arc::clone(&self.item), buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive_and_dispose_once() {
        let item = PooledItem::new_claimed(16, 0);
        assert!(!item.try_claim());
        item.release(1);
        assert!(item.try_claim());
        assert!(!item.try_claim());
        assert_eq!(item.dispose().unwrap(), 0);
        assert!(matches!(item.dispose(), Err(KeelError::AlreadyDisposed)));
    }

    #[test]
    fn rent_reuses_on_same_thread() {
        let pool = NativeMemoryPool::new(128);
        let first = {
            let mut b = pool.rent();
            b[0] = 7;
            Arc::as_ptr(b.item())
        };
        let b = pool.rent();
        assert_eq!(Arc::as_ptr(b.item()), first);
        assert_eq!(b.len(), 128);
        assert_eq!(pool.tracked_items(), 1);
    }

    #[test]
    fn scratch_falls_back_to_heap_when_too_large() {
        let pool = NativeMemoryPool::new(64);
        let small = ScratchBuffer::rent(Some(&pool), 40);
        assert!(small.is_pooled());
        assert_eq!(small.len(), 40);
        let big = ScratchBuffer::rent(Some(&pool), 65);
        assert!(!big.is_pooled());
        assert_eq!(big.len(), 65);
        assert!(!ScratchBuffer::rent(None, 8).is_pooled());
    }
}

//! signal/event — AsyncManualResetEvent на поколениях.
//!
//! - Поколение = Arc<Generation> с watch-каналом Option<bool>:
//!   None — не завершено, Some(true) — set, Some(false) — снято без сигнала.
//! - Ожидающий держит Arc своего поколения: поздний reset не меняет,
//!   чего он ждёт.
//! - set_and_reset_atomically: сначала подмена поколения, потом завершение старого.
//! - reset/force_reset: подмена под мьютексом слота, только если слот всё ещё
//!   указывает на прочитанное поколение; иначе повтор.

use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;

use super::CancelToken;
use crate::metrics::record_commit_signal;

#[derive(Debug)]
struct Generation {
    id: u64,
    state: watch::Sender<Option<bool>>,
}

impl Generation {
    fn new(id: u64) -> Arc<Self> {
        let (state, _rx) = watch::channel(None);
        Arc::new(Self { id, state })
    }

    /// Завершить поколение. false, если оно уже было завершено.
    fn complete(&self, value: bool) -> bool {
        self.state.send_if_modified(|s| {
            if s.is_some() {
                false
            } else {
                *s = Some(value);
                true
            }
        })
    }

    fn result(&self) -> Option<bool> {
        *self.state.borrow()
    }

    async fn wait(&self) -> bool {
        let mut rx = self.state.subscribe();
        let res = match rx.wait_for(|s| s.is_some()).await {
            Ok(v) => (*v).unwrap_or(false),
            Err(_) => false,
        };
        res
    }
}

async fn any_cancelled(a: Option<&CancelToken>, b: Option<&CancelToken>) {
    match (a, b) {
        (Some(a), Some(b)) => {
            tokio::select! {
                _ = a.cancelled() => {}
                _ = b.cancelled() => {}
            }
        }
        (Some(t), None) | (None, Some(t)) => t.cancelled().await,
        (None, None) => std::future::pending::<()>().await,
    }
}

fn is_any_cancelled(a: Option<&CancelToken>, b: Option<&CancelToken>) -> bool {
    a.map_or(false, |t| t.is_cancelled()) || b.map_or(false, |t| t.is_cancelled())
}

/// Закреплённое поколение: check-then-wait без гонки с reset.
#[derive(Clone, Debug)]
pub struct WaitHandle {
    generation: Arc<Generation>,
    token: Option<CancelToken>,
}

impl WaitHandle {
    pub fn generation(&self) -> u64 {
        self.generation.id
    }

    pub fn is_set(&self) -> bool {
        self.generation.result() == Some(true)
    }

    pub async fn wait(&self) -> bool {
        self.race(None, None).await
    }

    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        self.race(Some(timeout), None).await
    }

    pub async fn wait_with_cancel(&self, cancel: &CancelToken) -> bool {
        self.race(None, Some(cancel)).await
    }

    pub async fn wait_with_timeout_and_cancel(&self, timeout: Duration, cancel: &CancelToken) -> bool {
        self.race(Some(timeout), Some(cancel)).await
    }

    async fn race(&self, timeout: Option<Duration>, cancel: Option<&CancelToken>) -> bool {
        let own = self.token.as_ref();
        if is_any_cancelled(own, cancel) {
            return false;
        }
        if let Some(v) = self.generation.result() {
            return v;
        }
        let timer = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        let signalled = tokio::select! {
            biased;
            v = self.generation.wait() => v,
            _ = any_cancelled(own, cancel) => false,
            _ = timer => false,
        };
        // сигнал и отмена могли быть готовы одновременно
        signalled && !is_any_cancelled(own, cancel)
    }
}

#[derive(Debug)]
pub struct AsyncManualResetEvent {
    current: Mutex<Arc<Generation>>,
    next_id: AtomicU64,
    token: Option<CancelToken>,
}

impl Default for AsyncManualResetEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncManualResetEvent {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(Generation::new(1)),
            next_id: AtomicU64::new(2),
            token: None,
        }
    }

    /// Событие, все ожидания которого снимаются (false) при отмене токена.
    pub fn with_cancellation(token: CancelToken) -> Self {
        Self {
            token: Some(token),
            ..Self::new()
        }
    }

    fn slot(&self) -> MutexGuard<'_, Arc<Generation>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current(&self) -> Arc<Generation> {
        self.slot().clone()
    }

    fn fresh(&self) -> Arc<Generation> {
        Generation::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn replace_if_current(&self, expected: &Arc<Generation>, new: Arc<Generation>) -> bool {
        let mut slot = self.slot();
        if Arc::ptr_eq(&slot, expected) {
            *slot = new;
            true
        } else {
            false
        }
    }

    pub fn wait_handle(&self) -> WaitHandle {
        WaitHandle {
            generation: self.current(),
            token: self.token.clone(),
        }
    }

    pub async fn wait(&self) -> bool {
        self.wait_handle().wait().await
    }

    pub async fn wait_with_timeout(&self, timeout: Duration) -> bool {
        self.wait_handle().wait_with_timeout(timeout).await
    }

    pub async fn wait_with_cancel(&self, cancel: &CancelToken) -> bool {
        self.wait_handle().wait_with_cancel(cancel).await
    }

    pub async fn wait_with_timeout_and_cancel(&self, timeout: Duration, cancel: &CancelToken) -> bool {
        self.wait_handle()
            .wait_with_timeout_and_cancel(timeout, cancel)
            .await
    }

    /// Идемпотентно: повторный set того же поколения ничего не делает.
    pub fn set(&self) {
        self.current().complete(true);
    }

    /// Подменить поколение свежим и только потом разбудить ожидавших старое.
    /// Возвращает номер завершённого поколения.
    pub fn set_and_reset_atomically(&self) -> u64 {
        let fresh = self.fresh();
        let previous = std::mem::replace(&mut *self.slot(), fresh);
        previous.complete(true);
        record_commit_signal();
        previous.id
    }

    /// Завершение в отдельной задаче runtime; продолжения ожидающих
    /// не выполняются в стеке вызывающего.
    pub async fn set_by_async_completion(&self) {
        let generation = self.current();
        match Handle::try_current() {
            Ok(handle) => {
                if let Err(e) = handle
                    .spawn(async move {
                        generation.complete(true);
                    })
                    .await
                {
                    warn!("signal: async completion task failed: {}", e);
                }
            }
            Err(_) => {
                generation.complete(true);
            }
        }
    }

    /// То же без ожидания: задача runtime, если он есть, иначе отдельный поток.
    pub fn set_fire_and_forget(&self) {
        let generation = self.current();
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    generation.complete(true);
                });
            }
            Err(_) => {
                std::thread::spawn(move || {
                    generation.complete(true);
                });
            }
        }
    }

    /// Новое поколение, только если текущее уже завершено.
    pub fn reset(&self) -> bool {
        loop {
            let cur = self.current();
            if cur.result().is_none() {
                return false;
            }
            if self.replace_if_current(&cur, self.fresh()) {
                return true;
            }
            debug!("signal: reset lost the race for generation {}, retrying", cur.id);
        }
    }

    /// Новое поколение безусловно. Незавершённое старое снимается с false,
    /// чтобы закреплённые на нём ожидающие не зависли.
    pub fn force_reset(&self) {
        loop {
            let cur = self.current();
            if self.replace_if_current(&cur, self.fresh()) {
                cur.complete(false);
                return;
            }
        }
    }

    pub fn is_set(&self) -> bool {
        self.current().result() == Some(true)
    }

    pub fn generation(&self) -> u64 {
        self.current().id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.as_ref().map_or(false, |t| t.is_cancelled())
    }

    /// Отменить токен события: все текущие и будущие ожидания вернут false.
    pub fn cancel_all(&self) -> bool {
        match self.token.as_ref() {
            Some(t) => {
                t.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_only_after_completion() {
        let ev = AsyncManualResetEvent::new();
        let g1 = ev.generation();
        assert!(!ev.reset());
        assert_eq!(ev.generation(), g1);
        ev.set();
        ev.set();
        assert!(ev.is_set());
        assert!(ev.reset());
        assert!(!ev.is_set());
        assert!(ev.generation() > g1);
    }

    #[test]
    fn stale_generation_is_not_replaced() {
        let ev = AsyncManualResetEvent::new();
        let stale = ev.current();
        ev.set_and_reset_atomically();
        let live = ev.generation();
        assert!(!ev.replace_if_current(&stale, ev.fresh()));
        assert_eq!(ev.generation(), live);

        let cur = ev.current();
        assert!(ev.replace_if_current(&cur, ev.fresh()));
        assert!(ev.generation() > live);
    }

    #[test]
    fn set_and_reset_leaves_fresh_generation() {
        let ev = AsyncManualResetEvent::new();
        let h = ev.wait_handle();
        let done = ev.set_and_reset_atomically();
        assert_eq!(done, h.generation());
        assert!(h.is_set());
        assert!(!ev.is_set());
    }
}

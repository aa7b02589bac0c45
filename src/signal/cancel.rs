//! signal/cancel — токен отмены поверх tokio::sync::watch.

use std::sync::Arc;
use tokio::sync::watch;

/// Клонируемый токен отмены. После cancel() все ожидающие cancelled() просыпаются.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { inner: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.inner.send_if_modified(|c| {
            if *c {
                false
            } else {
                *c = true;
                true
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.borrow()
    }

    /// Завершается, когда токен отменён.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.subscribe();
        // sender живёт в self, ошибка канала невозможна
        let _ = rx.wait_for(|c| *c).await;
    }
}

//! memory/cleaner — периодический сбор простаивающих буферов.
//!
//! - Пулы регистрируются слабыми ссылками; умершие вычищаются на тике.
//! - Тики не пересекаются: если предыдущий ещё идёт, новый пропускается (try_lock).
//! - LowMemoryFlag переводит тик в режим "всё свободное — под нож" без учёта простоя.
//! - Ошибки освобождения отдельного элемента глотаются; тик никогда не паникует.

use log::{debug, info, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, TryLockError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::KeelConfig;
use crate::metrics::{record_cleaner_reclaimed, record_cleaner_skipped_tick, record_cleaner_tick};

use super::pool::{lock, NativeMemoryPool};

/// Сигнал нехватки памяти от внешнего наблюдателя.
#[derive(Debug, Clone, Default)]
pub struct LowMemoryFlag(Arc<AtomicBool>);

impl LowMemoryFlag {
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub skipped: bool,
    pub low_memory: bool,
    pub pools: usize,
    pub examined: usize,
    pub reclaimed: usize,
    pub reclaimed_bytes: usize,
}

#[derive(Debug)]
pub struct NativeMemoryCleaner {
    pools: Mutex<Vec<Weak<NativeMemoryPool>>>,
    period: Duration,
    idle: Duration,
    tick_lock: Mutex<()>,
    low_memory: LowMemoryFlag,
}

impl NativeMemoryCleaner {
    pub fn new(period: Duration, idle: Duration) -> Arc<Self> {
        Arc::new(Self {
            pools: Mutex::new(Vec::new()),
            period,
            idle,
            tick_lock: Mutex::new(()),
            low_memory: LowMemoryFlag::default(),
        })
    }

    pub fn from_config(cfg: &KeelConfig) -> Arc<Self> {
        Self::new(
            Duration::from_millis(cfg.cleaner_period_ms),
            Duration::from_millis(cfg.cleaner_idle_ms),
        )
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn idle(&self) -> Duration {
        self.idle
    }

    pub fn register(&self, pool: &Arc<NativeMemoryPool>) {
        lock(&self.pools).push(Arc::downgrade(pool));
    }

    pub fn registered_pools(&self) -> usize {
        lock(&self.pools).iter().filter(|w| w.strong_count() > 0).count()
    }

    pub fn low_memory(&self) -> &LowMemoryFlag {
        &self.low_memory
    }

    /// Один проход по всем живым пулам.
    pub fn run_tick(&self) -> TickReport {
        let _guard = match self.tick_lock.try_lock() {
            Ok(g) => g,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                record_cleaner_skipped_tick();
                warn!("cleaner: previous tick still running, skipping");
                return TickReport {
                    skipped: true,
                    ..Default::default()
                };
            }
        };

        let pools: Vec<Arc<NativeMemoryPool>> = {
            let mut weak = lock(&self.pools);
            weak.retain(|w| w.strong_count() > 0);
            weak.iter().filter_map(Weak::upgrade).collect()
        };

        let force = self.low_memory.is_raised();
        let idle_ms = self.idle.as_millis() as u64;
        let mut report = TickReport {
            low_memory: force,
            pools: pools.len(),
            ..Default::default()
        };
        for pool in &pools {
            let s = pool.reclaim(idle_ms, force);
            report.examined += s.examined;
            report.reclaimed += s.reclaimed;
            report.reclaimed_bytes += s.reclaimed_bytes;
        }

        record_cleaner_tick();
        if report.reclaimed > 0 {
            record_cleaner_reclaimed(report.reclaimed_bytes);
            debug!(
                "cleaner: reclaimed {} buffer(s), {} bytes{}",
                report.reclaimed,
                report.reclaimed_bytes,
                if force { " (low memory)" } else { "" }
            );
        }
        report
    }

    /// Фоновый поток с тиком раз в `period`. Останавливается при Drop хэндла.
    pub fn start(self: &Arc<Self>) -> std::io::Result<CleanerHandle> {
        let (tx, rx) = mpsc::channel::<()>();
        let me = Arc::clone(self);
        let period = self.period.max(Duration::from_millis(1));
        let join = std::thread::Builder::new()
            .name("keeldb-cleaner".into())
            .spawn(move || loop {
                match rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        me.run_tick();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        info!("cleaner: started, period {:?}, idle {:?}", self.period, self.idle);
        Ok(CleanerHandle {
            stop: Some(tx),
            join: Some(join),
        })
    }
}

/// RAII: остановка фонового потока чистильщика.
pub struct CleanerHandle {
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl CleanerHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(tx) = self.stop.take() {
            let _ = tx.send(());
        }
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!("cleaner: background thread panicked");
            }
        }
    }
}

impl Drop for CleanerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

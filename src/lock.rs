//! lock — advisory LOCK файла окружения (fs2).
//!
//! - Exclusive: открытый StorageEnvironment, на всё время жизни.
//!   Владелец пишет свой pid в LOCK, чтобы отказ был понятен оператору.
//! - Shared: офлайн-инструменты (recover, verify-journal), только чтение файлов.
//!
//! Путь: <root>/LOCK. Снимается в Drop.

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::consts::LOCK_FILE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
    mode: LockMode,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.mode == LockMode::Exclusive {
            let _ = self.file.set_len(0);
        }
        let _ = self.file.unlock();
    }
}

/// pid последнего эксклюзивного владельца, если он его записал.
pub fn lock_owner_pid(root: &Path) -> Option<u32> {
    let mut s = String::new();
    File::open(root.join(LOCK_FILE))
        .ok()?
        .read_to_string(&mut s)
        .ok()?;
    s.trim().parse().ok()
}

fn held_by(root: &Path) -> String {
    match lock_owner_pid(root) {
        Some(pid) => format!(" (held by pid {})", pid),
        None => String::new(),
    }
}

/// Без ожидания: конфликтующий режим (в этом или другом процессе) — ошибка.
pub fn try_acquire_lock(root: &Path, mode: LockMode) -> Result<LockGuard> {
    let path = root.join(LOCK_FILE);
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))?;

    let locked = match mode {
        LockMode::Shared => FileExt::try_lock_shared(&file),
        LockMode::Exclusive => FileExt::try_lock_exclusive(&file),
    };
    if let Err(e) = locked {
        let what = match mode {
            LockMode::Shared => "environment is open for writing",
            LockMode::Exclusive => "environment is already open",
        };
        return Err(anyhow!("{}: {}{}: {}", what, root.display(), held_by(root), e));
    }

    if mode == LockMode::Exclusive {
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        let _ = file.sync_data();
    }
    Ok(LockGuard { file, path, mode })
}

pub fn try_acquire_exclusive_lock(root: &Path) -> Result<LockGuard> {
    try_acquire_lock(root, LockMode::Exclusive)
}

pub fn try_acquire_shared_lock(root: &Path) -> Result<LockGuard> {
    try_acquire_lock(root, LockMode::Shared)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclusive_excludes_and_records_pid() {
        let root = std::env::temp_dir().join(format!("keel-lock-{}", std::process::id()));
        std::fs::create_dir_all(&root).unwrap();

        let g = try_acquire_exclusive_lock(&root).unwrap();
        assert_eq!(g.mode(), LockMode::Exclusive);
        assert_eq!(lock_owner_pid(&root), Some(std::process::id()));

        let err = try_acquire_shared_lock(&root).unwrap_err().to_string();
        assert!(err.contains("held by pid"), "{err}");
        assert!(try_acquire_exclusive_lock(&root).is_err());

        drop(g);
        assert_eq!(lock_owner_pid(&root), None);
        let s1 = try_acquire_shared_lock(&root).unwrap();
        let s2 = try_acquire_shared_lock(&root).unwrap();
        assert!(try_acquire_exclusive_lock(&root).is_err());
        drop((s1, s2));
    }
}

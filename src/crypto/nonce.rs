//! crypto/nonce — персистентный монотонный счётчик для AES-GCM nonce.
//!
//! Формат файла (LE, 8 байт): <root>/nonce.seq : [u64 reserved_until]
//!
//! Поведение:
//! - Если файл отсутствует — счётчик начинается с 1.
//! - Значения выдаются блоками: прежде чем отдать первое значение из блока,
//!   граница блока (reserved_until) записывается и fsync'ается.
//! - После падения счётчик продолжается с reserved_until, т.е. выше любого
//!   значения, которое могло быть использовано до падения. Остаток блока теряется.

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::consts::NONCE_FILE;

#[inline]
pub fn nonce_state_path(root: &Path) -> PathBuf {
    root.join(NONCE_FILE)
}

/// Загрузить reserved_until (0, если файл отсутствует).
pub fn load_reserved(root: &Path) -> Result<u64> {
    let p = nonce_state_path(root);
    if !p.exists() {
        return Ok(0);
    }
    let mut f = OpenOptions::new()
        .read(true)
        .open(&p)
        .with_context(|| format!("open {}", p.display()))?;
    let mut buf = [0u8; 8];
    f.read_exact(&mut buf)
        .with_context(|| format!("read {}", p.display()))?;
    Ok(LittleEndian::read_u64(&buf))
}

/// Сохранить reserved_until. Ошибка fsync здесь не best-effort: без неё
/// повтор nonce после падения возможен.
fn store_reserved(root: &Path, v: u64) -> Result<()> {
    let p = nonce_state_path(root);
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&p)
        .with_context(|| format!("open {} for write", p.display()))?;
    let mut buf = [0u8; 8];
    LittleEndian::write_u64(&mut buf, v);
    f.write_all(&buf)?;
    f.sync_all()
        .with_context(|| format!("fsync {}", p.display()))?;
    Ok(())
}

#[derive(Debug)]
struct SeqState {
    next: u64,
    reserved_until: u64,
}

#[derive(Debug)]
pub struct NonceSequence {
    root: PathBuf,
    block: u64,
    state: Mutex<SeqState>,
}

impl NonceSequence {
    pub fn open(root: &Path, block: u64) -> Result<Self> {
        let reserved = load_reserved(root)?;
        let start = reserved.max(1);
        Ok(Self {
            root: root.to_path_buf(),
            block: block.max(1),
            state: Mutex::new(SeqState {
                next: start,
                reserved_until: start,
            }),
        })
    }

    /// Следующее уникальное значение.
    pub fn next(&self) -> Result<u64> {
        let mut st = self
            .state
            .lock()
            .map_err(|_| anyhow!("nonce sequence lock poisoned"))?;
        if st.next == u64::MAX {
            return Err(anyhow!("nonce sequence exhausted; rotate the key"));
        }
        if st.next >= st.reserved_until {
            let until = st.next.saturating_add(self.block);
            store_reserved(&self.root, until)?;
            st.reserved_until = until;
        }
        let v = st.next;
        st.next += 1;
        Ok(v)
    }

    /// Граница текущего зарезервированного блока (для status/тестов).
    pub fn reserved_until(&self) -> u64 {
        self.state
            .lock()
            .map(|st| st.reserved_until)
            .unwrap_or_else(|e| e.into_inner().reserved_until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_root(name: &str) -> PathBuf {
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let p = std::env::temp_dir().join(format!("keel-nonce-{}-{}-{}", name, std::process::id(), t));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn never_repeats_across_reopen() {
        let root = tmp_root("reopen");
        let mut seen = std::collections::HashSet::new();

        let s1 = NonceSequence::open(&root, 4).unwrap();
        for _ in 0..6 {
            assert!(seen.insert(s1.next().unwrap()));
        }
        drop(s1); // "crash": unused part of the block is lost

        let s2 = NonceSequence::open(&root, 4).unwrap();
        for _ in 0..10 {
            assert!(seen.insert(s2.next().unwrap()));
        }
        assert!(load_reserved(&root).unwrap() >= s2.reserved_until());
    }
}

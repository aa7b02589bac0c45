// src/meta.rs — KeelDB environment meta (v1)
//
// Формат <root>/meta.bin (LE):
// MAGIC8 = "KEELMETA"
// u32 version          = 1
// u32 page_size        (4 KiB..=64 KiB, power of two)
// u32 flags            (FLAG_ENCRYPTED)
// u8  storage_type     (StorageType::as_u8)
// u64 next_page_number
// u64 last_flushed_tx  (все транзакции <= этого id лежат в data file)
// u8  clean_shutdown   (1=clean, 0=unclean)
// u32 crc32c           (всех предыдущих байт)
//
// Политика:
// - Атомарная запись: tmp+rename, затем fsync родительского каталога (best‑effort на Windows).
// - meta обновляется после fsync data file на checkpoint и при закрытии окружения.

use anyhow::{anyhow, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{self, OpenOptions};
#[cfg(unix)]
use std::fs::File;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use crate::consts::{FLAG_ENCRYPTED, MAGIC, MAX_PAGE_SIZE, META_FILE, META_VERSION, MIN_PAGE_SIZE};
use crate::error::KeelError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaHeader {
    pub version: u32,
    pub page_size: u32,
    pub flags: u32,
    pub storage_type: u8,
    pub next_page_number: u64,
    pub last_flushed_tx: u64,
    pub clean_shutdown: bool,
}

impl MetaHeader {
    pub fn new(page_size: u32, storage_type: u8, encrypted: bool) -> Self {
        Self {
            version: META_VERSION,
            page_size,
            flags: if encrypted { FLAG_ENCRYPTED } else { 0 },
            storage_type,
            next_page_number: 0,
            last_flushed_tx: 0,
            clean_shutdown: true,
        }
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.flags & FLAG_ENCRYPTED != 0
    }
}

// ---- Внутренние утилиты ----

#[inline]
pub fn meta_path(root: &Path) -> PathBuf {
    root.join(META_FILE)
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            let dir = File::open(parent)?;
            dir.sync_all()?;
        }
    }
    Ok(())
}
#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Проверка размера страницы (2^n, 4 KiB .. 64 KiB).
pub fn validate_page_size(page_size: u32) -> Result<()> {
    if page_size < MIN_PAGE_SIZE || page_size > MAX_PAGE_SIZE || !page_size.is_power_of_two() {
        return Err(anyhow!(
            "page_size must be a power of two in [{} .. {}], got {}",
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE,
            page_size
        ));
    }
    Ok(())
}

/// Создать новый meta. Ошибка, если уже существует.
pub fn write_meta_new(root: &Path, h: &MetaHeader) -> Result<()> {
    let path = meta_path(root);
    if path.exists() {
        return Err(anyhow!("meta already exists at {}", path.display()));
    }
    write_meta_overwrite(root, h)
}

/// Перезаписать meta через tmp+rename.
pub fn write_meta_overwrite(root: &Path, h: &MetaHeader) -> Result<()> {
    validate_page_size(h.page_size)?;

    let path = meta_path(root);
    let tmp = root.join(format!("{}.tmp", META_FILE));
    let _ = fs::remove_file(&tmp);

    let bytes = encode_meta(h)?;
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .with_context(|| format!("open meta tmp {}", tmp.display()))?;
    f.write_all(&bytes)?;
    f.sync_all()?;

    fs::rename(&tmp, &path)
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    let _ = fsync_dir(&path);
    Ok(())
}

fn encode_meta(h: &MetaHeader) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(META_ENCODED_LEN);
    buf.write_all(MAGIC)?;
    buf.write_u32::<LittleEndian>(h.version)?;
    buf.write_u32::<LittleEndian>(h.page_size)?;
    buf.write_u32::<LittleEndian>(h.flags)?;
    buf.write_u8(h.storage_type)?;
    buf.write_u64::<LittleEndian>(h.next_page_number)?;
    buf.write_u64::<LittleEndian>(h.last_flushed_tx)?;
    buf.write_u8(u8::from(h.clean_shutdown))?;
    let crc = crc32c::crc32c(&buf);
    buf.write_u32::<LittleEndian>(crc)?;
    Ok(buf)
}

/// magic + поля + crc.
const META_ENCODED_LEN: usize = 8 + 4 + 4 + 4 + 1 + 8 + 8 + 1 + 4;

/// Прочитать meta.
pub fn read_meta(root: &Path) -> Result<MetaHeader> {
    let path = meta_path(root);
    let bytes = fs::read(&path).with_context(|| format!("open meta {}", path.display()))?;
    if bytes.len() != META_ENCODED_LEN {
        return Err(anyhow!(
            "meta {} has {} bytes, expected {}",
            path.display(),
            bytes.len(),
            META_ENCODED_LEN
        ));
    }
    if &bytes[..8] != MAGIC {
        return Err(anyhow!(
            "bad meta magic at {} (expected {:?}, got {:?})",
            path.display(),
            MAGIC,
            &bytes[..8]
        ));
    }
    let body = META_ENCODED_LEN - 4;
    let stored = u32::from_le_bytes([bytes[body], bytes[body + 1], bytes[body + 2], bytes[body + 3]]);
    let computed = crc32c::crc32c(&bytes[..body]);
    if stored != computed {
        return Err(KeelError::integrity(
            format!("meta {}", path.display()),
            format!("crc32c mismatch (stored {:#010x}, computed {:#010x})", stored, computed),
        )
        .into());
    }

    let mut c = Cursor::new(&bytes[8..body]);
    let version = c.read_u32::<LittleEndian>()?;
    if version != META_VERSION {
        return Err(anyhow!(
            "unsupported meta version {} at {} (expected {})",
            version,
            path.display(),
            META_VERSION
        ));
    }

    let page_size = c.read_u32::<LittleEndian>()?;
    validate_page_size(page_size)?;
    Ok(MetaHeader {
        version,
        page_size,
        flags: c.read_u32::<LittleEndian>()?,
        storage_type: c.read_u8()?,
        next_page_number: c.read_u64::<LittleEndian>()?,
        last_flushed_tx: c.read_u64::<LittleEndian>()?,
        clean_shutdown: c.read_u8()? != 0,
    })
}

/// Пометить meta.clean_shutdown (только при изменении).
pub fn set_clean_shutdown(root: &Path, clean: bool) -> Result<()> {
    let mut m = read_meta(root)?;
    if m.clean_shutdown != clean {
        m.clean_shutdown = clean;
        write_meta_overwrite(root, &m)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_root(name: &str) -> PathBuf {
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let p = std::env::temp_dir().join(format!("keel-meta-{}-{}-{}", name, std::process::id(), t));
        fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn meta_roundtrip_and_clean_flag() {
        let root = tmp_root("rt");
        let mut m = MetaHeader::new(8192, 2, true);
        m.next_page_number = 17;
        m.last_flushed_tx = 9;
        write_meta_new(&root, &m).unwrap();
        assert!(write_meta_new(&root, &m).is_err(), "second create must fail");

        let got = read_meta(&root).unwrap();
        assert_eq!(got, m);
        assert!(got.is_encrypted());

        set_clean_shutdown(&root, false).unwrap();
        assert!(!read_meta(&root).unwrap().clean_shutdown);
    }

    #[test]
    fn torn_meta_is_integrity_failure() {
        let root = tmp_root("crc");
        write_meta_new(&root, &MetaHeader::new(4096, 3, false)).unwrap();
        let mut bytes = fs::read(meta_path(&root)).unwrap();
        bytes[20] ^= 0x01;
        fs::write(meta_path(&root), &bytes).unwrap();
        let err = read_meta(&root).unwrap_err();
        assert!(crate::error::is_catastrophic(&err), "{err:#}");
    }

    #[test]
    fn page_size_bounds() {
        assert!(validate_page_size(4096).is_ok());
        assert!(validate_page_size(65536).is_ok());
        assert!(validate_page_size(2048).is_err());
        assert!(validate_page_size(12288).is_err());
        assert!(validate_page_size(131072).is_err());
    }
}

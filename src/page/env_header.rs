//! page/env_header — страница 0 окружения.
//!
//! После общего 64-байтового заголовка:
//! [64..72)   magic "KEELENV1"
//! [72]       storage_type u8
//! [76..80)   schema_version u32
//! [80..142)  TreeRootHeader
//! [142..146) feature bits u32
//!
//! Страница проходит через журнал и MVCC как любая другая, поэтому версия схемы
//! меняется транзакционно.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::consts::{
    ENV_MAGIC, ENV_OFF_FEATURES, ENV_OFF_MAGIC, ENV_OFF_ROOT, ENV_OFF_SCHEMA_VERSION,
    ENV_OFF_STORAGE_TYPE, TREE_ROOT_HEADER_SIZE,
};
use crate::page::TreeRootHeader;
use crate::schema::StorageType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnvHeader {
    pub storage_type: StorageType,
    pub schema_version: u32,
    pub root: TreeRootHeader,
    pub features: u32,
}

impl EnvHeader {
    pub fn new(storage_type: StorageType, schema_version: u32) -> Self {
        Self {
            storage_type,
            schema_version,
            root: TreeRootHeader::default(),
            features: 0,
        }
    }

    pub fn read(page: &[u8]) -> Result<Self> {
        if page.len() < ENV_OFF_FEATURES + 4 {
            return Err(anyhow!("environment header page too small"));
        }
        if &page[ENV_OFF_MAGIC..ENV_OFF_MAGIC + 8] != ENV_MAGIC {
            return Err(anyhow!("bad environment header magic on page 0"));
        }
        let storage_type = StorageType::from_u8(page[ENV_OFF_STORAGE_TYPE])?;
        Ok(Self {
            storage_type,
            schema_version: LittleEndian::read_u32(
                &page[ENV_OFF_SCHEMA_VERSION..ENV_OFF_SCHEMA_VERSION + 4],
            ),
            root: TreeRootHeader::read(&page[ENV_OFF_ROOT..ENV_OFF_ROOT + TREE_ROOT_HEADER_SIZE])?,
            features: LittleEndian::read_u32(&page[ENV_OFF_FEATURES..ENV_OFF_FEATURES + 4]),
        })
    }

    pub fn write(&self, page: &mut [u8]) -> Result<()> {
        if page.len() < ENV_OFF_FEATURES + 4 {
            return Err(anyhow!("environment header page too small"));
        }
        page[ENV_OFF_MAGIC..ENV_OFF_MAGIC + 8].copy_from_slice(ENV_MAGIC);
        page[ENV_OFF_STORAGE_TYPE] = self.storage_type.as_u8();
        LittleEndian::write_u32(
            &mut page[ENV_OFF_SCHEMA_VERSION..ENV_OFF_SCHEMA_VERSION + 4],
            self.schema_version,
        );
        self.root
            .write(&mut page[ENV_OFF_ROOT..ENV_OFF_ROOT + TREE_ROOT_HEADER_SIZE])?;
        LittleEndian::write_u32(&mut page[ENV_OFF_FEATURES..ENV_OFF_FEATURES + 4], self.features);
        Ok(())
    }
}

//! page/root — TreeRootHeader (62 байта, LE).
//!
//! [0]      root_type u8
//! [1]      flags u8
//! [2..10)  root_page u64
//! [10..18) branch_pages u64
//! [18..26) leaf_pages u64
//! [26..34) overflow_pages u64
//! [34..42) page_count u64
//! [42..50) number_of_entries u64
//! [50..54) depth u32
//! [54..62) reserved

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::consts::TREE_ROOT_HEADER_SIZE;

const OFF_TYPE: usize = 0;
const OFF_FLAGS: usize = 1;
const OFF_ROOT_PAGE: usize = 2;
const OFF_BRANCH: usize = 10;
const OFF_LEAF: usize = 18;
const OFF_OVERFLOW: usize = 26;
const OFF_PAGE_COUNT: usize = 34;
const OFF_ENTRIES: usize = 42;
const OFF_DEPTH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TreeRootHeader {
    pub root_type: u8,
    pub flags: u8,
    pub root_page: u64,
    pub branch_pages: u64,
    pub leaf_pages: u64,
    pub overflow_pages: u64,
    pub page_count: u64,
    pub number_of_entries: u64,
    pub depth: u32,
}

impl TreeRootHeader {
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < TREE_ROOT_HEADER_SIZE {
            return Err(anyhow!("buffer too small for tree root header"));
        }
        Ok(Self {
            root_type: buf[OFF_TYPE],
            flags: buf[OFF_FLAGS],
            root_page: LittleEndian::read_u64(&buf[OFF_ROOT_PAGE..OFF_ROOT_PAGE + 8]),
            branch_pages: LittleEndian::read_u64(&buf[OFF_BRANCH..OFF_BRANCH + 8]),
            leaf_pages: LittleEndian::read_u64(&buf[OFF_LEAF..OFF_LEAF + 8]),
            overflow_pages: LittleEndian::read_u64(&buf[OFF_OVERFLOW..OFF_OVERFLOW + 8]),
            page_count: LittleEndian::read_u64(&buf[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 8]),
            number_of_entries: LittleEndian::read_u64(&buf[OFF_ENTRIES..OFF_ENTRIES + 8]),
            depth: LittleEndian::read_u32(&buf[OFF_DEPTH..OFF_DEPTH + 4]),
        })
    }

    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < TREE_ROOT_HEADER_SIZE {
            return Err(anyhow!("buffer too small for tree root header"));
        }
        buf[..TREE_ROOT_HEADER_SIZE].fill(0);
        buf[OFF_TYPE] = self.root_type;
        buf[OFF_FLAGS] = self.flags;
        LittleEndian::write_u64(&mut buf[OFF_ROOT_PAGE..OFF_ROOT_PAGE + 8], self.root_page);
        LittleEndian::write_u64(&mut buf[OFF_BRANCH..OFF_BRANCH + 8], self.branch_pages);
        LittleEndian::write_u64(&mut buf[OFF_LEAF..OFF_LEAF + 8], self.leaf_pages);
        LittleEndian::write_u64(&mut buf[OFF_OVERFLOW..OFF_OVERFLOW + 8], self.overflow_pages);
        LittleEndian::write_u64(&mut buf[OFF_PAGE_COUNT..OFF_PAGE_COUNT + 8], self.page_count);
        LittleEndian::write_u64(&mut buf[OFF_ENTRIES..OFF_ENTRIES + 8], self.number_of_entries);
        LittleEndian::write_u32(&mut buf[OFF_DEPTH..OFF_DEPTH + 4], self.depth);
        Ok(())
    }
}

//! Общие константы форматов (meta, data file, pages, journal, nonce state).

// -------- Meta --------
pub const MAGIC: &[u8; 8] = b"KEELMETA";
pub const META_FILE: &str = "meta.bin";
pub const META_VERSION: u32 = 1;

// -------- Flags --------
pub const FLAG_ENCRYPTED: u32 = 0x1;

// -------- Data file --------
pub const DATA_FILE: &str = "data.keel";
pub const DEFAULT_PAGE_SIZE: u32 = 8192;
pub const MIN_PAGE_SIZE: u32 = 4096;
pub const MAX_PAGE_SIZE: u32 = 64 * 1024;

// -------- Pages --------
// Layout (64 bytes, LE):
// [page_number u64][flags u8][pad u8][lower u16][upper u16][pad u16]
// [overflow_size u32][reserved 12][nonce 12][crc32c u32][mac 16]
pub const PAGE_HEADER_SIZE: usize = 64;

pub const PAGE_OFF_NUMBER: usize = 0;
pub const PAGE_OFF_FLAGS: usize = 8;
pub const PAGE_OFF_LOWER: usize = 10;
pub const PAGE_OFF_UPPER: usize = 12;
pub const PAGE_OFF_OVERFLOW_SIZE: usize = 16;
pub const PAGE_OFF_NONCE: usize = 32;
pub const PAGE_OFF_CRC: usize = 44;
pub const PAGE_OFF_MAC: usize = 48;

/// Bytes of the header covered by the MAC as associated data.
pub const PAGE_AAD_LEN: usize = PAGE_OFF_NONCE;

pub const PAGE_FLAG_SINGLE: u8 = 0x01;
pub const PAGE_FLAG_OVERFLOW: u8 = 0x02;
pub const PAGE_FLAG_VARIABLE_SIZE_TREE: u8 = 0x04;
pub const PAGE_FLAG_FIXED_SIZE_TREE: u8 = 0x08;
pub const PAGE_FLAG_COMPRESSED: u8 = 0x10;
pub const PAGE_FLAG_RAW_DATA: u8 = 0x20;

// -------- Environment header page (page 0) --------
pub const ENV_HEADER_PAGE: u64 = 0;
pub const ENV_MAGIC: &[u8; 8] = b"KEELENV1";
pub const ENV_OFF_MAGIC: usize = PAGE_HEADER_SIZE;
pub const ENV_OFF_STORAGE_TYPE: usize = PAGE_HEADER_SIZE + 8;
pub const ENV_OFF_SCHEMA_VERSION: usize = PAGE_HEADER_SIZE + 12;
pub const ENV_OFF_ROOT: usize = PAGE_HEADER_SIZE + 16;
pub const ENV_OFF_FEATURES: usize = ENV_OFF_ROOT + TREE_ROOT_HEADER_SIZE;

// -------- Tree root header --------
pub const TREE_ROOT_HEADER_SIZE: usize = 62;

// -------- Journal --------
pub const JOURNAL_FILE: &str = "journal.log";
pub const JOURNAL_MAGIC: &[u8; 8] = b"KEELJRN1";
// [magic8][page_size u32][flags u32]
pub const JOURNAL_HDR_SIZE: usize = 16;

/// Transaction header marker (`KEELTXH1` read as LE u64).
pub const TX_HEADER_MARKER: u64 = u64::from_le_bytes(*b"KEELTXH1");
pub const TX_HEADER_SIZE: usize = 192;

pub const TX_OFF_MARKER: usize = 0;
pub const TX_OFF_ID: usize = 8;
pub const TX_OFF_NEXT_PAGE: usize = 16;
pub const TX_OFF_LAST_PAGE: usize = 24;
pub const TX_OFF_PAGE_COUNT: usize = 32;
pub const TX_OFF_FLAGS: usize = 36;
pub const TX_OFF_HASH: usize = 40;
pub const TX_OFF_ROOT: usize = 48;
pub const TX_OFF_MARKER_BYTE: usize = 110;
pub const TX_OFF_COMPRESSED_SIZE: usize = 111;
pub const TX_OFF_UNCOMPRESSED_SIZE: usize = 119;
pub const TX_OFF_TIMESTAMP: usize = 127;
pub const TX_OFF_RESERVED: usize = 135;
pub const TX_OFF_NONCE: usize = 168;
pub const TX_OFF_MAC: usize = 176;

pub const TX_FLAG_LAZY: u32 = 0x1;
pub const TX_FLAG_COMPRESSED: u32 = 0x100;
pub const TX_FLAG_ENCRYPTED: u32 = 0x200;

// -------- Nonce state --------
pub const NONCE_FILE: &str = "nonce.seq";
/// Nonce domain reserved for journal payloads (never a page domain in practice).
pub const NONCE_DOMAIN_JOURNAL: u32 = u32::MAX;

// -------- Lock --------
pub const LOCK_FILE: &str = "LOCK";

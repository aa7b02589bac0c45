//! page — on-disk page layout.
//!
//! Разделение по подмодулям:
//! - header.rs     — 64-байтовый заголовок страницы (номер, флаги, overflow, nonce/crc/mac).
//! - checksum.rs   — CRC32C прогона страниц (plain режим).
//! - root.rs       — TreeRootHeader (62 байта), общий для env header page и TransactionHeader.
//! - env_header.rs — страница 0: тип хранилища, версия схемы, root, feature bits.

pub mod header;
pub mod checksum;
pub mod root;
pub mod env_header;

pub use header::{init_page_run, pages_for_overflow, PageHeader};
pub use checksum::{run_update_checksum, run_verify_checksum, run_stored_crc};
pub use root::TreeRootHeader;
pub use env_header::EnvHeader;

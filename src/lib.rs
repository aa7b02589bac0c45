#![allow(non_snake_case)]

// Базовые модули
pub mod consts;
pub mod error;
pub mod meta;
pub mod lock;
pub mod metrics;
pub mod config;
pub mod hash;
pub mod util; // src/util/mod.rs

// Страницы, шифрование, пейджеры
pub mod page;   // src/page/{mod,header,checksum,root,env_header}.rs
pub mod crypto; // src/crypto/{mod,nonce,cipher}.rs
pub mod pager;  // src/pager/{mod,state,mmap,crypto}.rs

// Журнал и окружение хранилища
pub mod journal; // src/journal/{mod,header,writer,reader,replay}.rs
pub mod env;     // src/env/{mod,tx,page_table,recover}.rs
pub mod schema;  // src/schema/{mod,steps,upgrader}.rs

// Сигнал коммита (async manual-reset event)
pub mod signal; // src/signal/{mod,cancel,event}.rs

// Пулы нативных буферов и чистильщик
pub mod memory; // src/memory/{mod,pool,cleaner}.rs

// Топология кластера, владение задачами и бакетами
pub mod cluster; // src/cluster/{mod,topology,changes,sharding,record}.rs

// Удобные реэкспорты
pub use config::{EnvBuilder, KeelConfig};
pub use env::{ReadTransaction, StorageEnvironment, WriteTransaction};
pub use error::{is_catastrophic, keel_error, KeelError, Severity};
pub use meta::{
    read_meta, set_clean_shutdown, validate_page_size, write_meta_new, write_meta_overwrite,
    MetaHeader,
};
pub use schema::StorageType;
pub use signal::{AsyncManualResetEvent, CancelToken};

// Реэкспорты crypto API (для удобства использования из внешнего кода)
pub use crypto::{EnvKeyProvider, KeyMaterial, KeyProvider, StaticKeyProvider};

//! memory — пулы нативных буферов и их фоновый чистильщик.
//!
//! Layout:
//! - pool.rs    — NativeMemoryPool, PooledItem (claim через CAS), RentedBuffer, ScratchBuffer
//! - cleaner.rs — NativeMemoryCleaner: тики, LowMemoryFlag, CleanerHandle

pub mod cleaner;
pub mod pool;

pub use cleaner::{CleanerHandle, LowMemoryFlag, NativeMemoryCleaner, TickReport};
pub use pool::{NativeMemoryPool, PooledItem, ReclaimStats, RentedBuffer, ScratchBuffer};

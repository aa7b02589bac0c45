//! signal — асинхронные примитивы синхронизации.
//!
//! - cancel.rs — CancelToken (watch<bool>).
//! - event.rs  — AsyncManualResetEvent: commit gate окружения, поколения + CAS.

pub mod cancel;
pub mod event;

pub use cancel::CancelToken;
pub use event::{AsyncManualResetEvent, WaitHandle};

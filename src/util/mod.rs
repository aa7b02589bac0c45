//! util — общие утилиты.
//!
//! Содержит:
//! - now_ticks_utc(): UTC-время в 100ns тиках от Unix epoch (для TransactionHeader).
//! - decode_hex(): разбор hex-строки (ключи в ENV/CLI).

use anyhow::{anyhow, Result};

/// Ticks per second (100ns resolution).
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Текущее UTC-время в 100ns тиках от Unix epoch.
#[inline]
pub fn now_ticks_utc() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    let ticks = now.as_nanos() / 100;
    ticks.min(i64::MAX as u128) as i64
}

/// Разобрать hex-строку (пробелы по краям игнорируются).
pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(anyhow!("hex string must have even length"));
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks(2) {
        let hi = hex_val(pair[0])?;
        let lo = hex_val(pair[1])?;
        out.push((hi << 4) | lo);
    }
    Ok(out)
}

#[inline]
fn hex_val(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(anyhow!("invalid hex char '{}'", c as char)),
    }
}

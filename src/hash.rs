//! hash — стабильные хэши для payload журнала, ключей задач и бакетов.
//!
//! Результат обязан совпадать на всех узлах и между релизами: владение задачами
//! каждый узел пересчитывает сам из одной и той же записи кластера.
//!
//! - `xxhash64`: seed 0, raw bytes (no length prefix).
//! - `jump_consistent_hash`: Lamping & Veach, "A Fast, Minimal Memory,
//!   Consistent Hash Algorithm" (2014).
//! - `mix64`: финализатор murmur3 fmix64; перемешивает ключ после исключения
//!   кандидата при выборе владельца.

use std::hash::Hasher;
use twox_hash::XxHash64;

/// 64-bit xxhash (seed=0) over raw bytes.
#[inline]
pub fn xxhash64(bytes: &[u8]) -> u64 {
    let mut h = XxHash64::with_seed(0);
    h.write(bytes);
    h.finish()
}

/// Стабильный 64-битный ключ идентификатора задачи/бакета (без учёта регистра).
#[inline]
pub fn task_key(name: &str) -> u64 {
    xxhash64(name.to_ascii_lowercase().as_bytes())
}

/// Jump consistent hash. Returns a bucket in `[0, buckets)`.
/// `buckets <= 0` → -1 (бакета нет).
pub fn jump_consistent_hash(mut key: u64, buckets: i32) -> i32 {
    if buckets <= 0 {
        return -1;
    }
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2_862_933_555_777_941_757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as i32
}

/// murmur3 fmix64.
#[inline]
pub fn mix64(mut key: u64) -> u64 {
    key ^= key >> 33;
    key = key.wrapping_mul(0xff51_afd7_ed55_8ccd);
    key ^= key >> 33;
    key = key.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    key ^= key >> 33;
    key
}

/// Индекс бакета из 64-битного хэша.
#[inline]
pub fn bucket_index(hash: u64, buckets: u32) -> u32 {
    debug_assert!(buckets > 0, "buckets must be > 0");
    (hash % (buckets as u64)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_hash_known_values() {
        // эталонные значения из публикации
        assert_eq!(jump_consistent_hash(0, 1), 0);
        assert_eq!(jump_consistent_hash(1, 1), 0);
        assert_eq!(jump_consistent_hash(0xDEAD_10CC, 1), 0);
        assert_eq!(jump_consistent_hash(0, 0), -1);
        assert_eq!(jump_consistent_hash(42, -3), -1);
    }

    #[test]
    fn jump_hash_moves_minimal_keys() {
        // n -> n+1 переносит ключи только в новый бакет
        for key in 0..2000u64 {
            let k = mix64(key);
            let a = jump_consistent_hash(k, 10);
            let b = jump_consistent_hash(k, 11);
            assert!(a == b || b == 10, "key {} moved {} -> {}", key, a, b);
        }
    }

    #[test]
    fn mix64_is_fixed() {
        assert_eq!(mix64(0), 0);
        assert_ne!(mix64(1), 1);
        assert_eq!(mix64(12345), mix64(12345));
    }

    #[test]
    fn xxhash_has_no_length_prefix() {
        let mut h = XxHash64::with_seed(0);
        h.write(b"abc");
        assert_eq!(xxhash64(b"abc"), h.finish());
        assert_eq!(task_key("Orders/1"), task_key("orders/1"));
    }
}

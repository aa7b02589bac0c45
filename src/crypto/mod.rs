//! crypto — ключи и AES-256-GCM для страниц и журнала.
//!
//! Состав:
//! - KeyProvider (KID -> 32-байтный ключ), StaticKeyProvider / EnvKeyProvider.
//! - NonceSequence (nonce.rs) — персистентный монотонный счётчик для nonce.
//! - PageCipher (cipher.rs) — шифрование прогонов страниц и payload журнала.
//!
//! Nonce (12 байт) = [seq u64 LE][domain u32 LE]:
//! - seq — следующее значение NonceSequence, каждое шифрование берёт новое;
//! - domain — младшие 32 бита номера страницы или NONCE_DOMAIN_JOURNAL.
//! Повтор nonce под одним ключом исключён структурно: seq никогда не повторяется,
//! включая перезапуски (см. nonce.rs).
//!
//! Ключи обнуляются (Zeroize) в Drop провайдеров и KeyMaterial.

use anyhow::{anyhow, Result};
use base64::Engine;
use rand::RngCore;
use std::sync::OnceLock;
use zeroize::Zeroize;

use crate::util::decode_hex;

pub mod nonce;
pub mod cipher;

pub use cipher::PageCipher;
pub use nonce::NonceSequence;

/// 32-байтный материал ключа + его KID (идентификатор).
#[derive(Clone, Debug)]
pub struct KeyMaterial {
    pub kid: String,
    pub key: [u8; 32],
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.key.zeroize();
        self.kid.zeroize();
    }
}

/// Источник мастер-ключей. Thread-safe.
pub trait KeyProvider: Send + Sync {
    /// Вернуть KeyMaterial для указанного KID.
    fn key(&self, kid: &str) -> Result<KeyMaterial>;
    /// KID по умолчанию (например, "default").
    fn default_kid(&self) -> &str;
}

/// In-memory провайдер на один ключ (тесты, CLI keygen).
#[derive(Clone, Debug)]
pub struct StaticKeyProvider {
    kid: String,
    key: [u8; 32],
}

impl StaticKeyProvider {
    pub fn new<S: Into<String>>(kid: S, key: [u8; 32]) -> Self {
        Self {
            kid: kid.into(),
            key,
        }
    }

    /// Провайдер со случайным ключом (OS RNG).
    pub fn random<S: Into<String>>(kid: S) -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self::new(kid, key)
    }

    /// Ключ в hex (для вывода оператору).
    pub fn key_hex(&self) -> String {
        self.key.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl KeyProvider for StaticKeyProvider {
    fn key(&self, kid: &str) -> Result<KeyMaterial> {
        if kid == self.kid {
            Ok(KeyMaterial {
                kid: self.kid.clone(),
                key: self.key,
            })
        } else {
            Err(anyhow!("unknown KID '{}'", kid))
        }
    }
    fn default_kid(&self) -> &str {
        &self.kid
    }
}

impl Drop for StaticKeyProvider {
    fn drop(&mut self) {
        self.key.zeroize();
        self.kid.zeroize();
    }
}

/// Провайдер из переменных окружения (обёртка над StaticKeyProvider):
/// - KEEL_MASTER_KEY_HEX / KEEL_MASTER_KEY_BASE64 — 32 байта ключа;
/// - KEEL_KEY_ID — KID, по умолчанию "default".
#[derive(Clone, Debug)]
pub struct EnvKeyProvider(StaticKeyProvider);

impl EnvKeyProvider {
    pub fn from_env() -> Result<Self> {
        let kid = std::env::var("KEEL_KEY_ID").unwrap_or_else(|_| "default".to_string());
        let key = match (
            std::env::var("KEEL_MASTER_KEY_HEX"),
            std::env::var("KEEL_MASTER_KEY_BASE64"),
        ) {
            (Ok(hex), _) => slice32(&decode_hex(&hex)?)?,
            (Err(_), Ok(b64)) => slice32(&decode_base64_trimmed(&b64)?)?,
            _ => {
                return Err(anyhow!(
                    "encrypted environment: set KEEL_MASTER_KEY_HEX or KEEL_MASTER_KEY_BASE64"
                ))
            }
        };
        Ok(Self(StaticKeyProvider::new(kid, key)))
    }
}

impl KeyProvider for EnvKeyProvider {
    fn key(&self, kid: &str) -> Result<KeyMaterial> {
        self.0.key(kid)
    }
    fn default_kid(&self) -> &str {
        self.0.default_kid()
    }
}

/// Порог предупреждения для счётчика nonce: 2^47.
const NONCE_WARN_THRESHOLD: u64 = 1u64 << 47;
static NONCE_WARN_ONCE: OnceLock<()> = OnceLock::new();

#[inline]
fn warn_nonce_exhaustion_if_needed(seq: u64) {
    if seq >= NONCE_WARN_THRESHOLD && NONCE_WARN_ONCE.set(()).is_ok() {
        log::warn!(
            "nonce counter reached {} (>= 2^47); plan a key rotation for this environment",
            seq
        );
    }
}

/// Собрать 12-байтовый nonce из значения счётчика и домена.
#[inline]
pub fn build_gcm_nonce(seq: u64, domain: u32) -> [u8; 12] {
    warn_nonce_exhaustion_if_needed(seq);
    let mut n = [0u8; 12];
    n[0..8].copy_from_slice(&seq.to_le_bytes());
    n[8..12].copy_from_slice(&domain.to_le_bytes());
    n
}

/// Домен nonce для страницы: младшие 32 бита номера.
#[inline]
pub fn page_nonce_domain(page_number: u64) -> u32 {
    page_number as u32
}

// ---------------------- helpers ----------------------

fn slice32(bytes: &[u8]) -> Result<[u8; 32]> {
    if bytes.len() != 32 {
        return Err(anyhow!("key must be exactly 32 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn decode_base64_trimmed(s: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s.trim().as_bytes())
        .map_err(|e| anyhow!("base64 decode: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_provider_rejects_unknown_kid() {
        let kp = StaticKeyProvider::new("k1", [7u8; 32]);
        assert_eq!(kp.key("k1").unwrap().key, [7u8; 32]);
        assert!(kp.key("k2").is_err());
        assert_eq!(kp.key_hex().len(), 64);
    }

    #[test]
    fn nonce_layout() {
        let n = build_gcm_nonce(0x0102_0304_0506_0708, 0xAABB_CCDD);
        assert_eq!(&n[0..8], &0x0102_0304_0506_0708u64.to_le_bytes());
        assert_eq!(&n[8..12], &0xAABB_CCDDu32.to_le_bytes());
        assert_eq!(page_nonce_domain(0x1_0000_0005), 5);
    }

    #[test]
    fn random_keys_differ() {
        let a = StaticKeyProvider::random("a");
        let b = StaticKeyProvider::random("a");
        assert_ne!(a.key_hex(), b.key_hex());
    }
}

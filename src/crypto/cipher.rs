//! crypto/cipher — AES-256-GCM для прогонов страниц и payload журнала.
//!
//! Прогон страниц:
//! - шифруется всё после 64-байтового заголовка: run[64..];
//! - AAD = run[0..32] (номер страницы, флаги, overflow_size);
//! - nonce пишется в [32..44), тег в [48..64), crc [44..48) зануляется;
//! - после расшифровки [32..64) зануляются, в кэш транзакции попадает чистый образ.
//!
//! Payload журнала:
//! - AAD передаёт вызывающий (заголовок транзакции с занулённым hash);
//! - в заголовке хранится только seq (8 байт), домен = NONCE_DOMAIN_JOURNAL.
//!
//! Ошибка проверки тега = KeelError::IntegrityFailure (катастрофа, без повторов).

use aes_gcm::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use std::sync::Arc;

use crate::consts::{
    NONCE_DOMAIN_JOURNAL, PAGE_AAD_LEN, PAGE_HEADER_SIZE, PAGE_OFF_MAC, PAGE_OFF_NONCE,
    PAGE_OFF_NUMBER,
};
use crate::crypto::{build_gcm_nonce, page_nonce_domain, KeyMaterial, NonceSequence};
use crate::error::KeelError;
use crate::metrics::{record_integrity_failure, record_page_decrypted, record_page_encrypted};

pub struct PageCipher {
    aead: Aes256Gcm,
    kid: String,
    seq: Arc<NonceSequence>,
}

impl std::fmt::Debug for PageCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCipher").field("kid", &self.kid).finish()
    }
}

impl PageCipher {
    pub fn new(key: &KeyMaterial, seq: Arc<NonceSequence>) -> Self {
        let aead = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.key));
        Self {
            aead,
            kid: key.kid.clone(),
            seq,
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Зашифровать прогон на месте свежим nonce.
    pub fn encrypt_run(&self, run: &mut [u8]) -> Result<()> {
        if run.len() < PAGE_HEADER_SIZE {
            return Err(anyhow!("page run too small for encryption"));
        }
        let page_number = LittleEndian::read_u64(&run[PAGE_OFF_NUMBER..PAGE_OFF_NUMBER + 8]);
        let nonce = build_gcm_nonce(self.seq.next()?, page_nonce_domain(page_number));

        let mut aad = [0u8; PAGE_AAD_LEN];
        aad.copy_from_slice(&run[..PAGE_AAD_LEN]);
        run[PAGE_OFF_NONCE..PAGE_HEADER_SIZE].fill(0);

        let tag = self
            .aead
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, &mut run[PAGE_HEADER_SIZE..])
            .map_err(|e| anyhow!("encrypt page {}: {}", page_number, e))?;

        run[PAGE_OFF_NONCE..PAGE_OFF_NONCE + 12].copy_from_slice(&nonce);
        run[PAGE_OFF_MAC..PAGE_OFF_MAC + 16].copy_from_slice(tag.as_slice());
        record_page_encrypted();
        Ok(())
    }

    /// Расшифровать прогон на месте. Несовпадение тега — IntegrityFailure.
    pub fn decrypt_run(&self, run: &mut [u8]) -> Result<()> {
        if run.len() < PAGE_HEADER_SIZE {
            return Err(anyhow!("page run too small for decryption"));
        }
        let page_number = LittleEndian::read_u64(&run[PAGE_OFF_NUMBER..PAGE_OFF_NUMBER + 8]);

        let mut aad = [0u8; PAGE_AAD_LEN];
        aad.copy_from_slice(&run[..PAGE_AAD_LEN]);
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&run[PAGE_OFF_NONCE..PAGE_OFF_NONCE + 12]);
        let mut tag = [0u8; 16];
        tag.copy_from_slice(&run[PAGE_OFF_MAC..PAGE_OFF_MAC + 16]);

        let res = self.aead.decrypt_in_place_detached(
            Nonce::from_slice(&nonce),
            &aad,
            &mut run[PAGE_HEADER_SIZE..],
            GenericArray::from_slice(&tag),
        );
        if res.is_err() {
            record_integrity_failure();
            return Err(KeelError::integrity(
                format!("page {}", page_number),
                "MAC verification failed (wrong key or corrupted page)",
            )
            .into());
        }
        run[PAGE_OFF_NONCE..PAGE_HEADER_SIZE].fill(0);
        record_page_decrypted();
        Ok(())
    }

    /// Зашифровать payload журнала. Возвращает (seq, tag).
    pub fn encrypt_payload(&self, aad: &[u8], payload: &mut [u8]) -> Result<(u64, [u8; 16])> {
        let seq = self.seq.next()?;
        let nonce = build_gcm_nonce(seq, NONCE_DOMAIN_JOURNAL);
        let tag = self
            .aead
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, payload)
            .map_err(|e| anyhow!("encrypt journal payload: {}", e))?;
        let mut out = [0u8; 16];
        out.copy_from_slice(tag.as_slice());
        Ok((seq, out))
    }

    /// Расшифровать payload журнала. Несовпадение тега — IntegrityFailure.
    pub fn decrypt_payload(
        &self,
        tx_id: u64,
        aad: &[u8],
        payload: &mut [u8],
        seq: u64,
        tag: &[u8; 16],
    ) -> Result<()> {
        let nonce = build_gcm_nonce(seq, NONCE_DOMAIN_JOURNAL);
        self.aead
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                aad,
                payload,
                GenericArray::from_slice(tag),
            )
            .map_err(|_| {
                record_integrity_failure();
                anyhow::Error::from(KeelError::integrity(
                    format!("journal transaction {}", tx_id),
                    "payload MAC verification failed",
                ))
            })
    }
}

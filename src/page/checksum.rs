//! page/checksum — CRC32C прогона страниц (plain режим).
//!
//! - crc хранится в заголовке первой страницы: [44..48) LE;
//! - считается по всему прогону с занулённой областью [32..64) (nonce/crc/mac);
//! - 0 никогда не бывает валидным crc: "выделен, но не записан" решает pager
//!   по границе записанного, а не по crc.
//!
//! В encrypted режиме целостность обеспечивает MAC (см. crypto::PageCipher), crc = 0.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};

use crate::consts::{PAGE_HEADER_SIZE, PAGE_OFF_CRC, PAGE_OFF_NONCE};

#[inline]
fn compute(run: &[u8]) -> u32 {
    let mut crc = crc32c::crc32c(&run[..PAGE_OFF_NONCE]);
    crc = crc32c::crc32c_append(crc, &[0u8; PAGE_HEADER_SIZE - PAGE_OFF_NONCE]);
    crc = crc32c::crc32c_append(crc, &run[PAGE_HEADER_SIZE..]);
    // 0 зарезервирован под "не записано"
    if crc == 0 { 1 } else { crc }
}

#[inline]
pub fn run_stored_crc(run: &[u8]) -> u32 {
    LittleEndian::read_u32(&run[PAGE_OFF_CRC..PAGE_OFF_CRC + 4])
}

/// Пересчитать и записать crc прогона.
pub fn run_update_checksum(run: &mut [u8]) -> Result<()> {
    if run.len() < PAGE_HEADER_SIZE {
        return Err(anyhow!("page run too small for checksum"));
    }
    let crc = compute(run);
    LittleEndian::write_u32(&mut run[PAGE_OFF_CRC..PAGE_OFF_CRC + 4], crc);
    Ok(())
}

/// Проверить crc прогона. true = ок.
pub fn run_verify_checksum(run: &[u8]) -> Result<bool> {
    if run.len() < PAGE_HEADER_SIZE {
        return Err(anyhow!("page run too small for checksum verify"));
    }
    Ok(run_stored_crc(run) == compute(run))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc_detects_body_flip_and_ignores_crypto_area() {
        let mut run = vec![0u8; 4096];
        run[0] = 3;
        run[100] = 0x42;
        run_update_checksum(&mut run).unwrap();
        assert!(run_verify_checksum(&run).unwrap());

        // nonce/mac area is not covered
        run[40] = 0xEE;
        assert!(run_verify_checksum(&run).unwrap());

        run[100] ^= 1;
        assert!(!run_verify_checksum(&run).unwrap());
    }

    #[test]
    fn zeroed_run_does_not_verify() {
        let run = vec![0u8; 4096];
        assert!(!run_verify_checksum(&run).unwrap());
    }
}

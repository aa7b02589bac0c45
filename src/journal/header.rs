//! journal/header — TransactionHeader (192 байта, LE, фиксированные смещения).
//!
//! Сериализация явная (byteorder по смещениям TX_OFF_*), без repr(C).
//! decode() проверяет только размер: marker/hash/MAC валидирует JournalReader.

use anyhow::{anyhow, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::consts::{
    TREE_ROOT_HEADER_SIZE, TX_FLAG_COMPRESSED, TX_FLAG_ENCRYPTED, TX_FLAG_LAZY, TX_HEADER_MARKER,
    TX_HEADER_SIZE, TX_OFF_COMPRESSED_SIZE, TX_OFF_FLAGS, TX_OFF_HASH, TX_OFF_ID,
    TX_OFF_LAST_PAGE, TX_OFF_MAC, TX_OFF_MARKER, TX_OFF_MARKER_BYTE, TX_OFF_NEXT_PAGE,
    TX_OFF_NONCE, TX_OFF_PAGE_COUNT, TX_OFF_ROOT, TX_OFF_TIMESTAMP, TX_OFF_UNCOMPRESSED_SIZE,
};
use crate::page::TreeRootHeader;

/// Тег типа коммита (битовые флаги).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TxMarker(pub u8);

impl TxMarker {
    pub const NONE: TxMarker = TxMarker(0);
    pub const SPLIT: TxMarker = TxMarker(1);
    pub const COMMIT: TxMarker = TxMarker(2);
    pub const MERGED: TxMarker = TxMarker(4);

    #[inline]
    pub fn contains(self, other: TxMarker) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionHeader {
    pub header_marker: u64,
    pub transaction_id: u64,
    pub next_page_number: u64,
    pub last_page_number: u64,
    pub page_count: u32,
    pub flags: u32,
    pub hash: u64,
    pub root: TreeRootHeader,
    pub tx_marker: TxMarker,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub timestamp_ticks: i64,
    pub nonce: [u8; 8],
    pub mac: [u8; 16],
}

impl TransactionHeader {
    pub fn new(transaction_id: u64) -> Self {
        Self {
            header_marker: TX_HEADER_MARKER,
            transaction_id,
            next_page_number: 0,
            last_page_number: 0,
            page_count: 0,
            flags: 0,
            hash: 0,
            root: TreeRootHeader::default(),
            tx_marker: TxMarker::COMMIT,
            compressed_size: 0,
            uncompressed_size: 0,
            timestamp_ticks: 0,
            nonce: [0u8; 8],
            mac: [0u8; 16],
        }
    }

    #[inline]
    pub fn is_lazy(&self) -> bool {
        self.flags & TX_FLAG_LAZY != 0
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.flags & TX_FLAG_COMPRESSED != 0
    }

    #[inline]
    pub fn is_encrypted(&self) -> bool {
        self.flags & TX_FLAG_ENCRYPTED != 0
    }

    pub fn encode(&self) -> [u8; TX_HEADER_SIZE] {
        let mut b = [0u8; TX_HEADER_SIZE];
        LittleEndian::write_u64(&mut b[TX_OFF_MARKER..TX_OFF_MARKER + 8], self.header_marker);
        LittleEndian::write_u64(&mut b[TX_OFF_ID..TX_OFF_ID + 8], self.transaction_id);
        LittleEndian::write_u64(&mut b[TX_OFF_NEXT_PAGE..TX_OFF_NEXT_PAGE + 8], self.next_page_number);
        LittleEndian::write_u64(&mut b[TX_OFF_LAST_PAGE..TX_OFF_LAST_PAGE + 8], self.last_page_number);
        LittleEndian::write_u32(&mut b[TX_OFF_PAGE_COUNT..TX_OFF_PAGE_COUNT + 4], self.page_count);
        LittleEndian::write_u32(&mut b[TX_OFF_FLAGS..TX_OFF_FLAGS + 4], self.flags);
        LittleEndian::write_u64(&mut b[TX_OFF_HASH..TX_OFF_HASH + 8], self.hash);
        // TreeRootHeader::write не падает на буфере ровно нужного размера
        let _ = self
            .root
            .write(&mut b[TX_OFF_ROOT..TX_OFF_ROOT + TREE_ROOT_HEADER_SIZE]);
        b[TX_OFF_MARKER_BYTE] = self.tx_marker.0;
        LittleEndian::write_u64(
            &mut b[TX_OFF_COMPRESSED_SIZE..TX_OFF_COMPRESSED_SIZE + 8],
            self.compressed_size,
        );
        LittleEndian::write_u64(
            &mut b[TX_OFF_UNCOMPRESSED_SIZE..TX_OFF_UNCOMPRESSED_SIZE + 8],
            self.uncompressed_size,
        );
        LittleEndian::write_i64(&mut b[TX_OFF_TIMESTAMP..TX_OFF_TIMESTAMP + 8], self.timestamp_ticks);
        b[TX_OFF_NONCE..TX_OFF_NONCE + 8].copy_from_slice(&self.nonce);
        b[TX_OFF_MAC..TX_OFF_MAC + 16].copy_from_slice(&self.mac);
        b
    }

    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < TX_HEADER_SIZE {
            return Err(anyhow!(
                "transaction header needs {} bytes, got {}",
                TX_HEADER_SIZE,
                b.len()
            ));
        }
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&b[TX_OFF_NONCE..TX_OFF_NONCE + 8]);
        let mut mac = [0u8; 16];
        mac.copy_from_slice(&b[TX_OFF_MAC..TX_OFF_MAC + 16]);
        Ok(Self {
            header_marker: LittleEndian::read_u64(&b[TX_OFF_MARKER..TX_OFF_MARKER + 8]),
            transaction_id: LittleEndian::read_u64(&b[TX_OFF_ID..TX_OFF_ID + 8]),
            next_page_number: LittleEndian::read_u64(&b[TX_OFF_NEXT_PAGE..TX_OFF_NEXT_PAGE + 8]),
            last_page_number: LittleEndian::read_u64(&b[TX_OFF_LAST_PAGE..TX_OFF_LAST_PAGE + 8]),
            page_count: LittleEndian::read_u32(&b[TX_OFF_PAGE_COUNT..TX_OFF_PAGE_COUNT + 4]),
            flags: LittleEndian::read_u32(&b[TX_OFF_FLAGS..TX_OFF_FLAGS + 4]),
            hash: LittleEndian::read_u64(&b[TX_OFF_HASH..TX_OFF_HASH + 8]),
            root: TreeRootHeader::read(&b[TX_OFF_ROOT..TX_OFF_ROOT + TREE_ROOT_HEADER_SIZE])?,
            tx_marker: TxMarker(b[TX_OFF_MARKER_BYTE]),
            compressed_size: LittleEndian::read_u64(
                &b[TX_OFF_COMPRESSED_SIZE..TX_OFF_COMPRESSED_SIZE + 8],
            ),
            uncompressed_size: LittleEndian::read_u64(
                &b[TX_OFF_UNCOMPRESSED_SIZE..TX_OFF_UNCOMPRESSED_SIZE + 8],
            ),
            timestamp_ticks: LittleEndian::read_i64(&b[TX_OFF_TIMESTAMP..TX_OFF_TIMESTAMP + 8]),
            nonce,
            mac,
        })
    }
}

/// AAD для payload: заголовок [0..168) с занулённым hash.
pub fn payload_aad(encoded: &[u8; TX_HEADER_SIZE]) -> [u8; TX_OFF_NONCE] {
    let mut aad = [0u8; TX_OFF_NONCE];
    aad.copy_from_slice(&encoded[..TX_OFF_NONCE]);
    aad[TX_OFF_HASH..TX_OFF_HASH + 8].fill(0);
    aad
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::TX_OFF_RESERVED;

    #[test]
    fn layout_offsets_are_fixed() {
        let mut h = TransactionHeader::new(0x1122_3344_5566_7788);
        h.next_page_number = 10;
        h.last_page_number = 9;
        h.page_count = 3;
        h.flags = TX_FLAG_COMPRESSED;
        h.hash = 0xABCD;
        h.root.page_count = 77;
        h.compressed_size = 100;
        h.uncompressed_size = 3 * 4096;
        h.timestamp_ticks = 638_000_000_000_000_000;
        h.nonce = [1u8; 8];
        h.mac = [2u8; 16];

        let b = h.encode();
        assert_eq!(b.len(), 192);
        assert_eq!(&b[0..8], b"KEELTXH1");
        assert_eq!(LittleEndian::read_u64(&b[8..16]), 0x1122_3344_5566_7788);
        assert_eq!(LittleEndian::read_u32(&b[32..36]), 3);
        assert_eq!(LittleEndian::read_u64(&b[40..48]), 0xABCD);
        assert_eq!(b[110], TxMarker::COMMIT.0);
        assert_eq!(LittleEndian::read_u64(&b[111..119]), 100);
        assert!(b[TX_OFF_RESERVED..TX_OFF_NONCE].iter().all(|&x| x == 0));
        assert_eq!(&b[168..176], &[1u8; 8]);
        assert_eq!(&b[176..192], &[2u8; 16]);

        assert_eq!(TransactionHeader::decode(&b).unwrap(), h);
    }

    #[test]
    fn aad_ignores_hash_and_crypto_fields() {
        let mut h = TransactionHeader::new(5);
        let a = payload_aad(&h.encode());
        h.hash = 123;
        h.mac = [9u8; 16];
        let b = payload_aad(&h.encode());
        assert_eq!(a, b);
        h.page_count = 2;
        assert_ne!(a, payload_aad(&h.encode()));
    }
}

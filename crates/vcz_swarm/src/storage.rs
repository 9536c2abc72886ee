//! The piece store seen by the swarm.
//!
//! The engine never touches files, it asks a [`Storage`] what pieces and
//! blocks are present, wanted, and at which priority, and hands it the
//! blocks peers send. [`MemoryStorage`] keeps everything in a buffer and is
//! what the tests and small embedders use.

use bitvec::{bitvec, order::Msb0};
use bytes::Bytes;
use tracing::debug;

use crate::{
    bitfield::Bitfield,
    error::Error,
    types::Priority,
    wire::{Block, BlockInfo, BLOCK_LEN},
};

pub trait Storage: Send {
    fn piece_count(&self) -> usize;

    /// Nominal piece length, every piece but the last has it.
    fn piece_len(&self) -> usize;

    fn total_len(&self) -> u64;

    /// The piece is present and verified.
    fn has_piece(&self, piece: usize) -> bool;

    fn has_block(&self, piece: usize, block: usize) -> bool;

    fn is_wanted(&self, piece: usize) -> bool;

    fn piece_priority(&self, piece: usize) -> Priority;

    fn write_block(&mut self, block: &Block) -> Result<(), Error>;

    /// `None` when the block is not present or out of range.
    fn read_block(&self, info: &BlockInfo) -> Option<Bytes>;

    /// Hash the piece once all of its blocks arrived. A corrupt piece
    /// loses its blocks.
    fn verify_piece(&mut self, piece: usize) -> bool;

    fn piece_size(&self, piece: usize) -> usize {
        let count = self.piece_count();
        if piece + 1 < count {
            return self.piece_len();
        }
        if piece + 1 > count {
            return 0;
        }
        let rest = self.total_len() - (self.piece_len() as u64 * (count as u64 - 1));
        rest as usize
    }

    fn blocks_in_piece(&self, piece: usize) -> usize {
        self.piece_size(piece).div_ceil(BLOCK_LEN)
    }

    /// The `block`th block of `piece`, the last one may be short.
    fn block_info(&self, piece: usize, block: usize) -> BlockInfo {
        let begin = block * BLOCK_LEN;
        let len = self.piece_size(piece).saturating_sub(begin).min(BLOCK_LEN);
        BlockInfo::new(piece, begin, len)
    }

    fn missing_blocks(&self, piece: usize) -> usize {
        if self.has_piece(piece) {
            return 0;
        }
        (0..self.blocks_in_piece(piece))
            .filter(|&b| !self.has_block(piece, b))
            .count()
    }

    /// Every block of the piece arrived, it may not be verified yet.
    fn has_all_blocks(&self, piece: usize) -> bool {
        (0..self.blocks_in_piece(piece)).all(|b| self.has_block(piece, b))
    }

    /// Bytes of the wanted pieces that are still missing.
    fn left_until_done(&self) -> u64 {
        (0..self.piece_count())
            .filter(|&p| self.is_wanted(p) && !self.has_piece(p))
            .flat_map(|p| {
                (0..self.blocks_in_piece(p))
                    .filter(move |&b| !self.has_block(p, b))
                    .map(move |b| self.block_info(p, b).len as u64)
            })
            .sum()
    }

    /// Every wanted piece is present.
    fn is_done(&self) -> bool {
        (0..self.piece_count()).all(|p| !self.is_wanted(p) || self.has_piece(p))
    }

    /// Every piece is present, we can serve the whole torrent.
    fn is_seed(&self) -> bool {
        (0..self.piece_count()).all(|p| self.has_piece(p))
    }

    fn bitfield(&self) -> Bitfield {
        let mut bitfield = bitvec![u8, Msb0; 0; self.piece_count()];
        for p in 0..self.piece_count() {
            if self.has_piece(p) {
                bitfield.set(p, true);
            }
        }
        bitfield
    }
}

/// All the data of a torrent in memory.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    data: Vec<u8>,
    piece_len: usize,
    hashes: Vec<[u8; 20]>,
    pieces: Bitfield,
    /// One bit per block of the torrent.
    blocks: Bitfield,
    wanted: Bitfield,
    priorities: Vec<Priority>,
}

impl MemoryStorage {
    /// An empty torrent that will download `total_len` bytes.
    pub fn new(hashes: Vec<[u8; 20]>, piece_len: usize, total_len: usize) -> Self {
        let count = hashes.len();
        let blocks_per_piece = piece_len.div_ceil(BLOCK_LEN);
        Self {
            data: vec![0; total_len],
            piece_len,
            hashes,
            pieces: bitvec![u8, Msb0; 0; count],
            blocks: bitvec![u8, Msb0; 0; count * blocks_per_piece],
            wanted: bitvec![u8, Msb0; 1; count],
            priorities: vec![Priority::Normal; count],
        }
    }

    /// A complete torrent made of `data`.
    pub fn seeded(data: Vec<u8>, piece_len: usize) -> Self {
        let hashes = Self::hashes_of(&data, piece_len);
        let mut storage = Self::new(hashes, piece_len, data.len());
        storage.data = data;
        storage.pieces.fill(true);
        storage.blocks.fill(true);
        storage
    }

    pub fn hashes_of(data: &[u8], piece_len: usize) -> Vec<[u8; 20]> {
        data.chunks(piece_len)
            .map(|chunk| sha1_smol::Sha1::from(chunk).digest().bytes())
            .collect()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn set_wanted(&mut self, piece: usize, wanted: bool) {
        if piece < self.wanted.len() {
            self.wanted.set(piece, wanted);
        }
    }

    pub fn set_priority(&mut self, piece: usize, priority: Priority) {
        if let Some(p) = self.priorities.get_mut(piece) {
            *p = priority;
        }
    }

    fn blocks_per_piece(&self) -> usize {
        self.piece_len.div_ceil(BLOCK_LEN)
    }

    fn block_bit(&self, piece: usize, block: usize) -> usize {
        piece * self.blocks_per_piece() + block
    }

    fn offset(&self, info: &BlockInfo) -> Option<usize> {
        if info.index >= self.piece_count()
            || info.begin % BLOCK_LEN != 0
            || *info != self.block_info(info.index, info.begin / BLOCK_LEN)
            || info.len == 0
        {
            return None;
        }
        Some(info.index * self.piece_len + info.begin)
    }
}

impl Storage for MemoryStorage {
    fn piece_count(&self) -> usize {
        self.hashes.len()
    }

    fn piece_len(&self) -> usize {
        self.piece_len
    }

    fn total_len(&self) -> u64 {
        self.data.len() as u64
    }

    fn has_piece(&self, piece: usize) -> bool {
        self.pieces.get(piece).map(|b| *b).unwrap_or(false)
    }

    fn has_block(&self, piece: usize, block: usize) -> bool {
        if block >= self.blocks_in_piece(piece) {
            return false;
        }
        self.blocks.get(self.block_bit(piece, block)).map(|b| *b).unwrap_or(false)
    }

    fn is_wanted(&self, piece: usize) -> bool {
        self.wanted.get(piece).map(|b| *b).unwrap_or(false)
    }

    fn piece_priority(&self, piece: usize) -> Priority {
        self.priorities.get(piece).copied().unwrap_or_default()
    }

    fn write_block(&mut self, block: &Block) -> Result<(), Error> {
        let info = BlockInfo::from(block);
        let offset = self.offset(&info).ok_or(Error::InvalidBlock(info))?;

        self.data[offset..offset + info.len].copy_from_slice(&block.block);
        let bit = self.block_bit(info.index, info.begin / BLOCK_LEN);
        self.blocks.set(bit, true);
        Ok(())
    }

    fn read_block(&self, info: &BlockInfo) -> Option<Bytes> {
        let offset = self.offset(info)?;
        if !self.has_block(info.index, info.begin / BLOCK_LEN) {
            return None;
        }
        Some(Bytes::copy_from_slice(&self.data[offset..offset + info.len]))
    }

    fn verify_piece(&mut self, piece: usize) -> bool {
        if piece >= self.piece_count() || !self.has_all_blocks(piece) {
            return false;
        }

        let begin = piece * self.piece_len;
        let end = begin + self.piece_size(piece);
        let hash = sha1_smol::Sha1::from(&self.data[begin..end]).digest().bytes();

        if hash == self.hashes[piece] {
            self.pieces.set(piece, true);
            return true;
        }

        debug!("piece {piece} failed the hash check");
        for b in 0..self.blocks_in_piece(piece) {
            let bit = self.block_bit(piece, b);
            self.blocks.set(bit, false);
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn geometry() {
        // two full pieces and a short one
        let s = MemoryStorage::seeded(data(2 * 2 * BLOCK_LEN + 100), 2 * BLOCK_LEN);
        assert_eq!(s.piece_count(), 3);
        assert_eq!(s.piece_size(0), 2 * BLOCK_LEN);
        assert_eq!(s.piece_size(2), 100);
        assert_eq!(s.piece_size(3), 0);
        assert_eq!(s.blocks_in_piece(1), 2);
        assert_eq!(s.blocks_in_piece(2), 1);
        assert_eq!(s.block_info(2, 0), BlockInfo::new(2, 0, 100));
        assert!(s.is_seed());
        assert_eq!(s.left_until_done(), 0);
        assert_eq!(s.bitfield().count_ones(), 3);
    }

    #[test]
    fn download_and_verify() {
        let src = MemoryStorage::seeded(data(3 * BLOCK_LEN), 2 * BLOCK_LEN);
        let mut dst = MemoryStorage::new(
            MemoryStorage::hashes_of(src.data(), 2 * BLOCK_LEN),
            2 * BLOCK_LEN,
            3 * BLOCK_LEN,
        );
        assert_eq!(dst.left_until_done(), 3 * BLOCK_LEN as u64);
        assert_eq!(dst.missing_blocks(0), 2);

        let info = dst.block_info(0, 1);
        let block = Block { index: 0, begin: info.begin, block: src.read_block(&info).unwrap() };
        dst.write_block(&block).unwrap();

        assert!(dst.has_block(0, 1));
        assert_eq!(dst.missing_blocks(0), 1);
        assert!(!dst.verify_piece(0));
        assert!(dst.has_block(0, 1), "an incomplete piece is not checked");

        let info = dst.block_info(0, 0);
        let block = Block { index: 0, begin: 0, block: src.read_block(&info).unwrap() };
        dst.write_block(&block).unwrap();
        assert!(dst.verify_piece(0));
        assert!(dst.has_piece(0));
        assert_eq!(dst.left_until_done(), BLOCK_LEN as u64);
        assert!(!dst.is_done());
    }

    #[test]
    fn corrupt_piece_loses_its_blocks() {
        let src = MemoryStorage::seeded(data(BLOCK_LEN), BLOCK_LEN);
        let mut dst = MemoryStorage::new(
            MemoryStorage::hashes_of(src.data(), BLOCK_LEN),
            BLOCK_LEN,
            BLOCK_LEN,
        );

        let block = Block { index: 0, begin: 0, block: Bytes::from(vec![0u8; BLOCK_LEN]) };
        dst.write_block(&block).unwrap();
        assert!(!dst.verify_piece(0));
        assert!(!dst.has_block(0, 0));
        assert_eq!(dst.missing_blocks(0), 1);
    }

    #[test]
    fn rejects_blocks_that_do_not_fit() {
        let mut s = MemoryStorage::new(vec![[0; 20]; 2], BLOCK_LEN, BLOCK_LEN + 10);

        let short = Block { index: 1, begin: 0, block: Bytes::from(vec![1u8; 11]) };
        assert!(matches!(s.write_block(&short), Err(Error::InvalidBlock(_))));

        let unaligned = Block { index: 0, begin: 5, block: Bytes::from(vec![1u8; 10]) };
        assert!(s.write_block(&unaligned).is_err());

        let out = Block { index: 2, begin: 0, block: Bytes::from(vec![1u8; 10]) };
        assert!(s.write_block(&out).is_err());

        let ok = Block { index: 1, begin: 0, block: Bytes::from(vec![1u8; 10]) };
        assert!(s.write_block(&ok).is_ok());
        assert!(s.read_block(&BlockInfo::new(1, 0, 10)).is_some());
        assert!(s.read_block(&BlockInfo::new(0, 0, BLOCK_LEN)).is_none());
    }

    #[test]
    fn unwanted_pieces_do_not_count() {
        let mut s = MemoryStorage::new(vec![[0; 20]; 2], BLOCK_LEN, 2 * BLOCK_LEN);
        s.set_wanted(1, false);
        s.set_priority(0, Priority::High);

        assert_eq!(s.left_until_done(), BLOCK_LEN as u64);
        assert_eq!(s.piece_priority(0), Priority::High);
        assert_eq!(s.piece_priority(1), Priority::Normal);
        assert!(!s.is_wanted(1));
    }
}

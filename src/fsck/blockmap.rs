/* Mapa de estados de bloque que arma el fsck, independiente del bitmap en
disco. Cuatro bits por bloque, dos bloques por byte. */

use crate::error::{FsError, Result};
use crate::format::FileType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockMark {
    Free = 0,
    Used = 1,
    Indir = 2,
    InodeDir = 3,
    InodeFile = 4,
    InodeLnk = 5,
    InodeDevice = 6,
    InodeFifo = 7,
    InodeSock = 8,
    Leaf = 9,
    JData = 10,
    Rgrp = 11,
    Eattr = 12,
    BadBlock = 13,
    MetaInval = 14,
    FreeMeta = 15,
}

impl BlockMark {
    fn from_nibble(n: u8) -> Self {
        match n & 0xf {
            0 => BlockMark::Free,
            1 => BlockMark::Used,
            2 => BlockMark::Indir,
            3 => BlockMark::InodeDir,
            4 => BlockMark::InodeFile,
            5 => BlockMark::InodeLnk,
            6 => BlockMark::InodeDevice,
            7 => BlockMark::InodeFifo,
            8 => BlockMark::InodeSock,
            9 => BlockMark::Leaf,
            10 => BlockMark::JData,
            11 => BlockMark::Rgrp,
            12 => BlockMark::Eattr,
            13 => BlockMark::BadBlock,
            14 => BlockMark::MetaInval,
            _ => BlockMark::FreeMeta,
        }
    }

    /// Marca de dinode para un tipo de archivo; None si el modo no es válido.
    pub fn for_inode(ft: FileType) -> Option<Self> {
        match ft {
            FileType::Directory => Some(BlockMark::InodeDir),
            FileType::Regular => Some(BlockMark::InodeFile),
            FileType::Symlink => Some(BlockMark::InodeLnk),
            FileType::BlockDev | FileType::CharDev => Some(BlockMark::InodeDevice),
            FileType::Fifo => Some(BlockMark::InodeFifo),
            FileType::Socket => Some(BlockMark::InodeSock),
            FileType::Unknown => None,
        }
    }

    pub fn is_inode(self) -> bool {
        matches!(
            self,
            BlockMark::InodeDir
                | BlockMark::InodeFile
                | BlockMark::InodeLnk
                | BlockMark::InodeDevice
                | BlockMark::InodeFifo
                | BlockMark::InodeSock
        )
    }
}

#[derive(Debug, Clone)]
pub struct BlockMap {
    size: u64,
    map: Vec<u8>,
}

impl BlockMap {
    pub fn new(size: u64) -> Self {
        Self { size, map: vec![0u8; size.div_ceil(2) as usize] }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn slot(&self, blk: u64) -> Result<(usize, u32)> {
        if blk >= self.size {
            return Err(FsError::OutOfRange { block: blk });
        }
        Ok(((blk / 2) as usize, ((blk % 2) * 4) as u32))
    }

    pub fn query(&self, blk: u64) -> Result<BlockMark> {
        let (byte, shift) = self.slot(blk)?;
        Ok(BlockMark::from_nibble(self.map[byte] >> shift))
    }

    /// Cambia la marca de `blk` y devuelve la anterior.
    pub fn mark(&mut self, blk: u64, mark: BlockMark) -> Result<BlockMark> {
        let (byte, shift) = self.slot(blk)?;
        let prev = BlockMark::from_nibble(self.map[byte] >> shift);
        self.map[byte] &= !(0xf << shift);
        self.map[byte] |= (mark as u8) << shift;
        Ok(prev)
    }

    pub fn count(&self, mark: BlockMark) -> u64 {
        (0..self.size)
            .filter(|&b| matches!(self.query(b), Ok(m) if m == mark))
            .count() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neighbours_do_not_clobber_each_other() {
        let mut bl = BlockMap::new(5);
        assert_eq!(bl.mark(2, BlockMark::FreeMeta).unwrap(), BlockMark::Free);
        bl.mark(3, BlockMark::Leaf).unwrap();
        assert_eq!(bl.query(2).unwrap(), BlockMark::FreeMeta);
        assert_eq!(bl.query(3).unwrap(), BlockMark::Leaf);

        assert_eq!(bl.mark(2, BlockMark::Used).unwrap(), BlockMark::FreeMeta);
        assert_eq!(bl.query(3).unwrap(), BlockMark::Leaf);
        assert_eq!(bl.query(4).unwrap(), BlockMark::Free);
    }

    #[test]
    fn test_out_of_range_is_an_error() {
        let mut bl = BlockMap::new(4);
        assert!(matches!(bl.query(4), Err(FsError::OutOfRange { block: 4 })));
        assert!(bl.mark(9, BlockMark::Used).is_err());
    }

    #[test]
    fn test_inode_marks() {
        assert_eq!(BlockMark::for_inode(FileType::CharDev), Some(BlockMark::InodeDevice));
        assert_eq!(BlockMark::for_inode(FileType::Unknown), None);
        assert!(BlockMark::InodeSock.is_inode());
        assert!(!BlockMark::Leaf.is_inode());
    }

    #[test]
    fn test_count() {
        let mut bl = BlockMap::new(10);
        bl.mark(1, BlockMark::Rgrp).unwrap();
        bl.mark(2, BlockMark::Rgrp).unwrap();
        bl.mark(7, BlockMark::InodeDir).unwrap();
        assert_eq!(bl.count(BlockMark::Rgrp), 2);
        assert_eq!(bl.count(BlockMark::Free), 7);
    }
}

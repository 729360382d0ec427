/* Índice de grupos de recursos. Cada grupo tiene un bloque de encabezado,
bloques de bitmap y luego su área de datos; el bitmap usa 2 bits por bloque
(4 bloques por byte). El índice es un BTreeMap ordenado por el primer bloque
del grupo, así que ubicar el grupo de un bloque es buscar el predecesor. */

use std::collections::BTreeMap;

use log::{debug, error};

use crate::buf::{Buffer, BufferCache};
use crate::error::{FsError, Result};
use crate::ondisk::*;

const SEARCH: [u64; 4] = [
    0xffff_ffff_ffff_ffff,
    0xaaaa_aaaa_aaaa_aaaa,
    0x5555_5555_5555_5555,
    0x0000_0000_0000_0000,
];
const LOW_BITS: u64 = 0x5555_5555_5555_5555;

/// Busca, desde el bloque `goal` (relativo a `buf`), el primer bloque en
/// `state`. Recorre el bitmap de a 64 bits: 32 bloques por palabra.
pub fn bitfit(buf: &[u8], goal: u32, state: BlockState) -> Option<u32> {
    let len = buf.len();
    let nwords = (len + 7) / 8;
    let mut word = (goal >> 5) as usize;
    if word >= nwords {
        return None;
    }
    let pattern = SEARCH[state as usize];
    let mut mask = LOW_BITS << ((goal << 1) & 63);

    while word < nwords {
        let start = word * 8;
        let end = (start + 8).min(len);
        let mut raw = [0u8; 8];
        raw[..end - start].copy_from_slice(&buf[start..end]);

        let mut tmp = u64::from_le_bytes(raw) ^ pattern;
        tmp &= tmp >> 1;
        tmp &= mask;
        if end - start < 8 {
            // los bytes de relleno no son bloques
            tmp &= (1u64 << ((end - start) * 8)) - 1;
        }
        if tmp != 0 {
            return Some(word as u32 * 32 + tmp.trailing_zeros() / 2);
        }
        mask = LOW_BITS;
        word += 1;
    }
    None
}

/// Cuántos bloques de `buf` están en `state`.
pub fn bitcount(buf: &[u8], state: BlockState) -> u32 {
    let want = state.bits();
    buf.iter()
        .map(|&byte| (0..NBBY).filter(|k| (byte >> (k * BIT_SIZE)) & BIT_MASK == want).count() as u32)
        .sum()
}

/// Qué parte de un bloque de bitmap describe a qué bloques del grupo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapDesc {
    /// Offset dentro del buffer donde empiezan los bits.
    pub offset: u32,
    /// Primer byte (del bitmap completo del grupo) que cubre este bloque.
    pub start: u32,
    /// Bytes de bitmap en este bloque.
    pub len: u32,
}

#[derive(Debug, Clone)]
pub struct Rgrp {
    pub ri: Rindex,
    pub rg: RgrpHeader,
    pub bits: Vec<BitmapDesc>,
    /// Encabezado + bloques de bitmap; vacío mientras no se lean.
    pub bh: Vec<Buffer>,
}

impl Rgrp {
    pub fn new(ri: Rindex) -> Self {
        Self { ri, rg: RgrpHeader::default(), bits: Vec::new(), bh: Vec::new() }
    }

    pub fn compute_bitstructs(&mut self, bsize: u32) -> Result<()> {
        let length = self.ri.length;
        if length == 0 {
            return Err(FsError::BadRindex(format!("grupo en {} sin bloques de bitmap", self.ri.addr)));
        }
        let total = self.ri.bitbytes;
        let mut bytes_left = total;
        let mut bits = Vec::with_capacity(length as usize);

        for x in 0..length {
            let (offset, len) = if length == 1 {
                (RGRP_SIZE as u32, bytes_left)
            } else if x == 0 {
                (RGRP_SIZE as u32, bsize - RGRP_SIZE as u32)
            } else if x + 1 == length {
                (META_HEADER_SIZE as u32, bytes_left)
            } else {
                (META_HEADER_SIZE as u32, bsize - META_HEADER_SIZE as u32)
            };
            if len > bytes_left || offset + len > bsize {
                return Err(FsError::BadRindex(format!(
                    "grupo en {}: {} bytes de bitmap no caben en {} bloques",
                    self.ri.addr, total, length
                )));
            }
            bits.push(BitmapDesc { offset, start: total - bytes_left, len });
            bytes_left -= len;
        }

        if bytes_left != 0 {
            return Err(FsError::BadRindex(format!(
                "grupo en {}: sobran {} bytes de bitmap",
                self.ri.addr, bytes_left
            )));
        }
        if (total as u64) * (NBBY as u64) < (self.ri.data as u64) {
            return Err(FsError::BadRindex(format!(
                "grupo en {}: el bitmap no cubre {} bloques de datos",
                self.ri.addr, self.ri.data
            )));
        }
        self.bits = bits;
        Ok(())
    }

    /// true si `blk` cae en cualquier parte del grupo (encabezado incluido).
    pub fn contains(&self, blk: u64) -> bool {
        blk >= self.ri.addr && blk < self.ri.data_end()
    }

    pub fn is_loaded(&self) -> bool {
        !self.bh.is_empty()
    }

    /// Lee el encabezado y los bloques de bitmap.
    pub fn read(&mut self, cache: &mut BufferCache) -> Result<()> {
        let mut bh = Vec::with_capacity(self.ri.length as usize);
        for x in 0..self.ri.length as u64 {
            let buf = cache.bread(self.ri.addr + x)?;
            let expected = if x == 0 { METATYPE_RG } else { METATYPE_RB };
            if !check_meta(&buf.data, expected) {
                error!(
                    "el bloque {} (0x{:x}) del grupo {} no es de tipo {}",
                    buf.blocknr, buf.blocknr, self.ri.addr, expected
                );
                return Err(FsError::BadMeta { block: buf.blocknr, expected });
            }
            bh.push(buf);
        }
        self.rg = RgrpHeader::decode(&bh[0].data);
        self.bh = bh;
        Ok(())
    }

    /// Escribe los bloques de bitmap modificados.
    pub fn write_back(&mut self, cache: &mut BufferCache) -> Result<()> {
        for buf in self.bh.iter_mut().filter(|b| b.is_modified()) {
            cache.bwrite(buf)?;
            buf.clear_modified();
        }
        Ok(())
    }

    fn update_header(&mut self) {
        if let Some(b0) = self.bh.first_mut() {
            self.rg.encode(&mut b0.data);
            b0.mark_modified();
        }
    }

    /// (índice del bitmap, byte dentro del buffer, desplazamiento del bit)
    fn locate_bit(&self, blk: u64) -> Result<(usize, usize, u32)> {
        if blk < self.ri.data0 {
            return Err(FsError::OutOfRange { block: blk });
        }
        let rblk = blk - self.ri.data0;
        let i = self
            .bits
            .iter()
            .position(|bi| rblk < (bi.start as u64 + bi.len as u64) * NBBY as u64)
            .ok_or(FsError::OutOfRange { block: blk })?;
        let bi = &self.bits[i];
        let byte = bi.offset as usize + (rblk / NBBY as u64) as usize - bi.start as usize;
        let bit = (rblk % NBBY as u64) as u32 * BIT_SIZE;
        Ok((i, byte, bit))
    }

    pub fn get_state(&self, blk: u64) -> Result<BlockState> {
        let (i, byte, bit) = self.locate_bit(blk)?;
        if self.bh.is_empty() {
            return Ok(BlockState::Free);
        }
        let raw = (self.bh[i].data[byte] >> bit) & BIT_MASK;
        BlockState::from_bits(raw).ok_or(FsError::InvalidState(raw))
    }

    pub fn set_state(&mut self, blk: u64, state: BlockState) -> Result<()> {
        let (i, byte, bit) = self.locate_bit(blk)?;
        if self.bh.is_empty() {
            return Err(FsError::Fatal(format!(
                "bitmap del grupo {} no cargado",
                self.ri.addr
            )));
        }
        let buf = &mut self.bh[i];
        let cur = (buf.data[byte] >> bit) & BIT_MASK;
        buf.data[byte] ^= cur << bit;
        buf.data[byte] |= state.bits() << bit;
        buf.mark_modified();
        Ok(())
    }

    /// Primer bloque en `state` desde `goal` (absoluto), dentro de los datos.
    pub fn find_state(&self, goal: u64, state: BlockState) -> Option<u64> {
        if self.bh.is_empty() || goal >= self.ri.data_end() {
            return None;
        }
        let rgoal = goal.saturating_sub(self.ri.data0);
        for (bi, buf) in self.bits.iter().zip(&self.bh) {
            let first = bi.start as u64 * NBBY as u64;
            let last = (bi.start as u64 + bi.len as u64) * NBBY as u64;
            if rgoal >= last {
                continue;
            }
            let local = rgoal.saturating_sub(first) as u32;
            let area = &buf.data[bi.offset as usize..(bi.offset + bi.len) as usize];
            if let Some(found) = bitfit(area, local, state) {
                let blk = self.ri.data0 + first + found as u64;
                return (blk < self.ri.data_end()).then_some(blk);
            }
        }
        None
    }

    pub fn count_state(&self, state: BlockState) -> u32 {
        self.bits
            .iter()
            .zip(&self.bh)
            .map(|(bi, buf)| bitcount(&buf.data[bi.offset as usize..(bi.offset + bi.len) as usize], state))
            .sum()
    }
}

#[derive(Debug, Default)]
pub struct RgrpIndex {
    groups: BTreeMap<u64, Rgrp>,
}

impl RgrpIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, rgrp: Rgrp) -> Result<()> {
        let addr = rgrp.ri.addr;
        let overlaps_prev = self.locate(addr).is_some();
        let overlaps_next = self
            .groups
            .range(addr..)
            .next()
            .map(|(&next, _)| next < rgrp.ri.data_end())
            .unwrap_or(false);
        if overlaps_prev || overlaps_next {
            return Err(FsError::BadRindex(format!("el grupo en {} se solapa con otro", addr)));
        }
        self.groups.insert(addr, rgrp);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rgrp> {
        self.groups.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Rgrp> {
        self.groups.values_mut()
    }

    pub fn addrs(&self) -> Vec<u64> {
        self.groups.keys().copied().collect()
    }

    pub fn get(&self, addr: u64) -> Option<&Rgrp> {
        self.groups.get(&addr)
    }

    pub fn get_mut(&mut self, addr: u64) -> Option<&mut Rgrp> {
        self.groups.get_mut(&addr)
    }

    /// Grupo que contiene `blk`.
    pub fn locate(&self, blk: u64) -> Option<&Rgrp> {
        self.groups
            .range(..=blk)
            .next_back()
            .map(|(_, rg)| rg)
            .filter(|rg| rg.contains(blk))
    }

    pub fn locate_mut(&mut self, blk: u64) -> Option<&mut Rgrp> {
        self.groups
            .range_mut(..=blk)
            .next_back()
            .map(|(_, rg)| rg)
            .filter(|rg| rg.contains(blk))
    }

    pub fn get_state(&self, blk: u64) -> Result<BlockState> {
        self.locate(blk)
            .ok_or(FsError::OutOfRange { block: blk })?
            .get_state(blk)
    }

    pub fn set_state(&mut self, blk: u64, state: BlockState) -> Result<()> {
        self.locate_mut(blk)
            .ok_or(FsError::OutOfRange { block: blk })?
            .set_state(blk, state)
    }

    /// Fin del último grupo: ningún bloque válido está más allá.
    pub fn fs_end(&self) -> u64 {
        self.groups.values().map(|rg| rg.ri.data_end()).max().unwrap_or(0)
    }

    /// Toma el primer bloque libre que `skip` no rechace y lo marca `state`.
    pub fn alloc<F>(&mut self, state: BlockState, skip: F) -> Result<u64>
    where
        F: Fn(u64) -> bool,
    {
        for rg in self.groups.values_mut() {
            if !rg.is_loaded() || rg.rg.free == 0 {
                continue;
            }
            let mut goal = rg.ri.data0;
            while let Some(blk) = rg.find_state(goal, BlockState::Free) {
                if skip(blk) {
                    goal = blk + 1;
                    continue;
                }
                rg.set_state(blk, state)?;
                rg.rg.free -= 1;
                if state == BlockState::Dinode {
                    rg.rg.dinodes += 1;
                }
                rg.update_header();
                debug!("bloque {} (0x{:x}) asignado como {:?}", blk, blk, state);
                return Ok(blk);
            }
        }
        Err(FsError::NoSpace)
    }

    pub fn write_back(&mut self, cache: &mut BufferCache) -> Result<()> {
        for rg in self.groups.values_mut() {
            rg.write_back(cache)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loaded_rgrp(bsize: u32, addr: u64, length: u32, data: u32) -> Rgrp {
        let ri = Rindex {
            addr,
            length,
            data0: addr + length as u64,
            data,
            bitbytes: data / NBBY,
        };
        let mut rg = Rgrp::new(ri);
        rg.compute_bitstructs(bsize).unwrap();
        rg.bh = (0..length as u64)
            .map(|x| Buffer::new(addr + x, vec![0u8; bsize as usize]))
            .collect();
        rg
    }

    #[test]
    fn test_bitstructs_split_across_blocks() {
        // 1024 - 128 = 896 bytes en el primero, 1000 en los siguientes
        let rg = loaded_rgrp(1024, 10, 3, 4 * 2000);
        assert_eq!(rg.bits[0], BitmapDesc { offset: 128, start: 0, len: 896 });
        assert_eq!(rg.bits[1], BitmapDesc { offset: 24, start: 896, len: 1000 });
        assert_eq!(rg.bits[2], BitmapDesc { offset: 24, start: 1896, len: 104 });
    }

    #[test]
    fn test_bitstructs_reject_short_bitmap() {
        let ri = Rindex { addr: 10, length: 1, data0: 11, data: 4000, bitbytes: 1000 };
        let mut rg = Rgrp::new(ri);
        assert!(matches!(rg.compute_bitstructs(1024), Err(FsError::BadRindex(_))));
    }

    #[test]
    fn test_bitstructs_reject_bitmap_shorter_than_data() {
        // 800 bytes caben en el bloque pero solo cubren 3200 bloques
        let ri = Rindex { addr: 10, length: 1, data0: 11, data: 4000, bitbytes: 800 };
        let mut rg = Rgrp::new(ri);
        let err = rg.compute_bitstructs(1024).unwrap_err();
        assert!(err.to_string().contains("no cubre"), "{}", err);
    }

    #[test]
    fn test_state_round_trip_in_second_bitmap_block() {
        let mut rg = loaded_rgrp(1024, 10, 3, 4 * 2000);
        let blk = rg.ri.data0 + 896 * 4 + 5;
        for state in [BlockState::Dinode, BlockState::Used, BlockState::Invalid, BlockState::Free] {
            rg.set_state(blk, state).unwrap();
            assert_eq!(rg.get_state(blk).unwrap(), state);
        }
        assert_eq!(rg.get_state(blk - 1).unwrap(), BlockState::Free);
        assert!(rg.bh[1].is_modified());
    }

    #[test]
    fn test_header_blocks_have_no_state() {
        let rg = loaded_rgrp(1024, 10, 2, 4000);
        assert!(matches!(rg.get_state(10), Err(FsError::OutOfRange { .. })));
        assert!(matches!(rg.get_state(11), Err(FsError::OutOfRange { .. })));
    }

    #[test]
    fn test_unloaded_bitmap_reads_as_free() {
        let mut rg = loaded_rgrp(1024, 10, 1, 400);
        rg.set_state(rg.ri.data0, BlockState::Dinode).unwrap();
        rg.bh.clear();
        assert_eq!(rg.get_state(rg.ri.data0).unwrap(), BlockState::Free);
    }

    #[test]
    fn test_bitfit_finds_single_match_after_goal() {
        let mut buf = vec![0x55u8; 64]; // todo Used
        // bloque 150 en Dinode: byte 37, campo 2
        buf[37] |= 0b11 << 4;
        assert_eq!(bitfit(&buf, 0, BlockState::Dinode), Some(150));
        assert_eq!(bitfit(&buf, 150, BlockState::Dinode), Some(150));
        assert_eq!(bitfit(&buf, 151, BlockState::Dinode), None);
    }

    #[test]
    fn test_bitfit_masks_bits_below_goal_in_first_word() {
        let buf = vec![0u8; 16];
        assert_eq!(bitfit(&buf, 7, BlockState::Free), Some(7));
        assert_eq!(bitfit(&buf, 33, BlockState::Free), Some(33));
        assert_eq!(bitfit(&buf, 64, BlockState::Free), None);
    }

    #[test]
    fn test_bitfit_ignores_padding_past_end() {
        // 10 bytes usados: la palabra final está incompleta y rellena con ceros
        let buf = vec![0x55u8; 10];
        assert_eq!(bitfit(&buf, 0, BlockState::Free), None);
        assert_eq!(bitfit(&buf, 0, BlockState::Used), Some(0));
    }

    #[test]
    fn test_bitcount_counts_each_state() {
        let buf = [0b11_10_01_00u8, 0b00_00_00_11];
        assert_eq!(bitcount(&buf, BlockState::Free), 4);
        assert_eq!(bitcount(&buf, BlockState::Used), 1);
        assert_eq!(bitcount(&buf, BlockState::Invalid), 1);
        assert_eq!(bitcount(&buf, BlockState::Dinode), 2);
    }

    #[test]
    fn test_index_locates_by_predecessor() {
        let mut idx = RgrpIndex::new();
        idx.insert(loaded_rgrp(1024, 17, 1, 400)).unwrap();
        idx.insert(loaded_rgrp(1024, 418, 1, 400)).unwrap();

        assert_eq!(idx.locate(17).map(|r| r.ri.addr), Some(17));
        assert_eq!(idx.locate(417).map(|r| r.ri.addr), Some(17));
        assert_eq!(idx.locate(500).map(|r| r.ri.addr), Some(418));
        assert!(idx.locate(16).is_none());
        assert!(idx.locate(819).is_none());
        assert_eq!(idx.fs_end(), 819);
        assert!(idx.insert(loaded_rgrp(1024, 300, 1, 40)).is_err());
    }

    #[test]
    fn test_alloc_skips_rejected_blocks() {
        let mut idx = RgrpIndex::new();
        let mut rg = loaded_rgrp(1024, 17, 1, 400);
        rg.rg.free = 400;
        idx.insert(rg).unwrap();

        let blk = idx.alloc(BlockState::Dinode, |b| b == 18).unwrap();
        assert_eq!(blk, 19);
        assert_eq!(idx.get_state(19).unwrap(), BlockState::Dinode);
        assert_eq!(idx.get_state(18).unwrap(), BlockState::Free);
        let rg = idx.locate(19).unwrap();
        assert_eq!((rg.rg.free, rg.rg.dinodes), (399, 1));
    }
}

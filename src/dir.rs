// src/dir.rs
//
// Entradas de directorio. Un directorio "lineal" guarda sus dirents dentro
// del bloque del dinode; uno con hash (DIF_EXHASH) guarda una tabla de
// 2^depth punteros a hojas y cada hoja puede encadenar otras por lf_next.

use std::collections::BTreeSet;

use libc::{EEXIST, EIO, ENAMETOOLONG, ENOENT, ENOSPC, ENOTDIR};
use log::{debug, warn};
use thiserror::Error;

use crate::error::{FsError, Result};
use crate::format::FileType;
use crate::fs::{BlockAllocator, Gfs2Fs};
use crate::inode::Inode;
use crate::ondisk::*;

#[derive(Debug, Error)]
pub enum DirError {
    #[error("el inodo {0} no es un directorio")]
    NotDirectory(u64),
    #[error("entrada no encontrada")]
    NotFound,
    #[error("la entrada ya existe")]
    Exists,
    #[error("espacio insuficiente en el directorio")]
    NoSpace,
    #[error("bloque de directorio {block} corrupto")]
    Corrupt { block: u64 },
    #[error("nombre demasiado largo")]
    NameTooLong,
}

impl DirError {
    pub fn as_errno(&self) -> i32 {
        match self {
            DirError::NotDirectory(_) => ENOTDIR,
            DirError::NotFound => ENOENT,
            DirError::Exists => EEXIST,
            DirError::NoSpace => ENOSPC,
            DirError::Corrupt { .. } => EIO,
            DirError::NameTooLong => ENAMETOOLONG,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inum: Inum,
    pub name: String,
    pub hash: u32,
    pub de_type: u16,
    pub file_type: FileType,
}

/// Hash de nombres de GFS2 (CRC32 estándar).
pub fn disk_hash(name: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in name {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

/// Posición en la tabla de hash para `hash` con profundidad `depth`.
pub fn hash_index(hash: u32, depth: u16) -> u64 {
    if depth == 0 {
        0
    } else {
        (hash >> (32 - depth as u32)) as u64
    }
}

// -------------------- Dirents dentro de un bloque --------------------

struct RawDirent {
    off: usize,
    de: Dirent,
}

impl RawDirent {
    fn name<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        let from = self.off + DIRENT_SIZE;
        let to = (from + self.de.name_len as usize).min(buf.len());
        &buf[from..to]
    }
}

fn scan_region(buf: &[u8], start: usize, blk: u64) -> std::result::Result<Vec<RawDirent>, DirError> {
    let mut out = Vec::new();
    let mut off = start;
    while off + DIRENT_SIZE <= buf.len() {
        let de = Dirent::decode(&buf[off..]);
        let rec = de.rec_len as usize;
        if rec < DIRENT_SIZE || off + rec > buf.len() || DIRENT_SIZE + de.name_len as usize > rec {
            return Err(DirError::Corrupt { block: blk });
        }
        out.push(RawDirent { off, de });
        off += rec;
    }
    Ok(out)
}

/// Deja la región como un solo dirent vacío.
pub(crate) fn init_region(buf: &mut [u8], start: usize) {
    buf[start..].fill(0);
    let de = Dirent { rec_len: (buf.len() - start) as u16, ..Default::default() };
    de.encode(&mut buf[start..]);
}

fn write_dirent(buf: &mut [u8], off: usize, rec_len: usize, name: &[u8], inum: Inum, de_type: u16) {
    let de = Dirent {
        inum,
        hash: disk_hash(name),
        rec_len: rec_len as u16,
        name_len: name.len() as u16,
        de_type,
    };
    de.encode(&mut buf[off..]);
    buf[off + DIRENT_SIZE..off + DIRENT_SIZE + name.len()].copy_from_slice(name);
}

fn region_insert(
    buf: &mut [u8],
    start: usize,
    blk: u64,
    name: &[u8],
    inum: Inum,
    de_type: u16,
) -> std::result::Result<bool, DirError> {
    let need = dirent_size(name.len());
    for rd in scan_region(buf, start, blk)? {
        let rec = rd.de.rec_len as usize;
        if rd.de.inum.addr == 0 {
            if rec >= need {
                write_dirent(buf, rd.off, rec, name, inum, de_type);
                return Ok(true);
            }
            continue;
        }
        let used = dirent_size(rd.de.name_len as usize);
        if rec >= used + need {
            let mut cur = rd.de.clone();
            cur.rec_len = used as u16;
            cur.encode(&mut buf[rd.off..]);
            write_dirent(buf, rd.off + used, rec - used, name, inum, de_type);
            return Ok(true);
        }
    }
    Ok(false)
}

fn region_remove<F>(buf: &mut [u8], start: usize, blk: u64, pred: F) -> std::result::Result<Option<Dirent>, DirError>
where
    F: Fn(&Dirent, &[u8]) -> bool,
{
    let entries = scan_region(buf, start, blk)?;
    for (i, rd) in entries.iter().enumerate() {
        if rd.de.inum.addr == 0 || !pred(&rd.de, rd.name(buf)) {
            continue;
        }
        if i > 0 {
            // el anterior absorbe el espacio
            let mut prev = entries[i - 1].de.clone();
            prev.rec_len += rd.de.rec_len;
            prev.encode(&mut buf[entries[i - 1].off..]);
        } else {
            let mut cur = rd.de.clone();
            cur.inum = Inum::default();
            cur.encode(&mut buf[rd.off..]);
        }
        return Ok(Some(rd.de.clone()));
    }
    Ok(None)
}

// --------- Operaciones sobre directorios ---------

impl Gfs2Fs {
    fn to_entry(&self, buf: &[u8], rd: &RawDirent) -> DirEntry {
        DirEntry {
            inum: rd.de.inum,
            name: String::from_utf8_lossy(rd.name(buf)).into_owned(),
            hash: rd.de.hash,
            de_type: rd.de.de_type,
            file_type: self.format.dirent_file_type(rd.de.de_type),
        }
    }

    /// Entradas en uso de un bloque de directorio a partir de `start`.
    pub fn block_entries(&self, buf: &[u8], start: usize, blk: u64) -> Result<Vec<DirEntry>> {
        Ok(scan_region(buf, start, blk)?
            .iter()
            .filter(|rd| rd.de.inum.addr != 0)
            .map(|rd| self.to_entry(buf, rd))
            .collect())
    }

    fn leaf_read(&mut self, blk: u64) -> Result<crate::buf::Buffer> {
        if !self.check_range(blk) {
            return Err(DirError::Corrupt { block: blk }.into());
        }
        let bh = self.cache.bread(blk)?;
        if !check_meta(&bh.data, METATYPE_LF) {
            return Err(DirError::Corrupt { block: blk }.into());
        }
        Ok(bh)
    }

    pub fn dir_table_get(&mut self, dip: &Inode, idx: u64) -> Result<u64> {
        let raw = self.readi(dip, idx * 8, 8)?;
        if raw.len() < 8 {
            return Ok(0);
        }
        Ok(read_be64(&raw, 0))
    }

    pub fn dir_table_put(&mut self, dip: &mut Inode, idx: u64, val: u64) -> Result<()> {
        self.writei(dip, idx * 8, &val.to_be_bytes())
    }

    /// Hojas distintas del directorio, incluidas las encadenadas.
    pub fn dir_leaves(&mut self, dip: &Inode) -> Result<Vec<u64>> {
        if dip.di.depth > DIR_MAX_DEPTH {
            return Err(DirError::Corrupt { block: dip.addr }.into());
        }
        let slots = 1u64 << dip.di.depth;
        let table = self.readi(dip, 0, (slots * 8) as usize)?;
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for head in pointers(&table, 0) {
            let mut blk = head;
            while blk != 0 && seen.insert(blk) {
                let bh = self.leaf_read(blk)?;
                out.push(blk);
                blk = Leaf::decode(&bh.data).next;
            }
        }
        Ok(out)
    }

    pub fn dir_entries(&mut self, dip: &Inode) -> Result<Vec<DirEntry>> {
        if !self.is_dir(dip) {
            return Err(DirError::NotDirectory(dip.addr).into());
        }
        if !dip.is_exhash() {
            let list = scan_region(&dip.bh.data, DINODE_SIZE, dip.addr)?;
            return Ok(list
                .iter()
                .filter(|rd| rd.de.inum.addr != 0)
                .map(|rd| self.to_entry(&dip.bh.data, rd))
                .collect());
        }
        let mut out = Vec::new();
        for blk in self.dir_leaves(dip)? {
            let bh = self.cache.bread(blk)?;
            for rd in scan_region(&bh.data, LEAF_SIZE, blk)? {
                if rd.de.inum.addr != 0 {
                    out.push(self.to_entry(&bh.data, &rd));
                }
            }
        }
        Ok(out)
    }

    pub fn dir_search(&mut self, dip: &Inode, name: &[u8]) -> Result<Option<DirEntry>> {
        if !self.is_dir(dip) {
            return Err(DirError::NotDirectory(dip.addr).into());
        }
        if !dip.is_exhash() {
            let list = scan_region(&dip.bh.data, DINODE_SIZE, dip.addr)?;
            return Ok(list
                .iter()
                .find(|rd| rd.de.inum.addr != 0 && rd.name(&dip.bh.data) == name)
                .map(|rd| self.to_entry(&dip.bh.data, rd)));
        }
        let idx = hash_index(disk_hash(name), dip.di.depth);
        let mut blk = self.dir_table_get(dip, idx)?;
        let mut seen = BTreeSet::new();
        while blk != 0 && seen.insert(blk) {
            let bh = self.leaf_read(blk)?;
            for rd in scan_region(&bh.data, LEAF_SIZE, blk)? {
                if rd.de.inum.addr != 0 && rd.name(&bh.data) == name {
                    return Ok(Some(self.to_entry(&bh.data, &rd)));
                }
            }
            blk = Leaf::decode(&bh.data).next;
        }
        Ok(None)
    }

    /// Agrega una entrada. Si el directorio lineal se llena pasa a usar
    /// hash; si la hoja se llena encadena una hoja nueva.
    pub fn dir_add(
        &mut self,
        dip: &mut Inode,
        name: &[u8],
        inum: Inum,
        de_type: u16,
        alloc: &mut dyn BlockAllocator,
    ) -> Result<()> {
        if name.is_empty() || name.len() > FNAME_MAX {
            return Err(DirError::NameTooLong.into());
        }
        if self.dir_search(dip, name)?.is_some() {
            return Err(DirError::Exists.into());
        }

        if !dip.is_exhash() {
            if region_insert(&mut dip.bh.data, DINODE_SIZE, dip.addr, name, inum, de_type)? {
                dip.di.entries += 1;
                dip.mark_dirty();
                return Ok(());
            }
            self.dir_make_exhash(dip, alloc)?;
        }

        let idx = hash_index(disk_hash(name), dip.di.depth);
        let mut blk = self.dir_table_get(dip, idx)?;
        let mut hops = 0u32;
        loop {
            let mut bh = self.leaf_read(blk)?;
            let mut leaf = Leaf::decode(&bh.data);
            if region_insert(&mut bh.data, LEAF_SIZE, blk, name, inum, de_type)? {
                leaf.entries += 1;
                leaf.encode(&mut bh.data);
                bh.mark_modified();
                self.cache.brelse(bh)?;
                break;
            }
            if leaf.next == 0 {
                let nblk = alloc.alloc(self, self.format.meta_state())?;
                debug!("directorio {}: hoja nueva {} encadenada a {}", dip.addr, nblk, blk);
                let mut nb = self.cache.bget(nblk);
                init_region(&mut nb.data, LEAF_SIZE);
                let mut nleaf = Leaf::new(leaf.depth);
                if !region_insert(&mut nb.data, LEAF_SIZE, nblk, name, inum, de_type)? {
                    return Err(DirError::NoSpace.into());
                }
                nleaf.entries = 1;
                nleaf.encode(&mut nb.data);
                self.cache.brelse(nb)?;

                leaf.next = nblk;
                leaf.encode(&mut bh.data);
                bh.mark_modified();
                self.cache.brelse(bh)?;
                dip.di.blocks += 1;
                break;
            }
            hops += 1;
            if hops > 1 << DIR_MAX_DEPTH {
                return Err(DirError::Corrupt { block: blk }.into());
            }
            blk = leaf.next;
        }
        dip.di.entries += 1;
        dip.mark_dirty();
        Ok(())
    }

    /// Convierte un directorio lineal en uno con tabla de hash y una hoja.
    fn dir_make_exhash(&mut self, dip: &mut Inode, alloc: &mut dyn BlockAllocator) -> Result<()> {
        let lblk = alloc.alloc(self, self.format.meta_state())?;
        let mut lb = self.cache.bget(lblk);
        init_region(&mut lb.data, LEAF_SIZE);
        let mut leaf = Leaf::new(0);

        for rd in scan_region(&dip.bh.data, DINODE_SIZE, dip.addr)? {
            if rd.de.inum.addr == 0 {
                continue;
            }
            let name = rd.name(&dip.bh.data).to_vec();
            if !region_insert(&mut lb.data, LEAF_SIZE, lblk, &name, rd.de.inum, rd.de.de_type)? {
                return Err(DirError::NoSpace.into());
            }
            leaf.entries += 1;
        }
        leaf.encode(&mut lb.data);
        self.cache.brelse(lb)?;

        let room = self.bsize as u64 - DINODE_SIZE as u64;
        let mut depth = 0u16;
        while (8u64 << (depth + 1)) <= room {
            depth += 1;
        }
        dip.bh.data[DINODE_SIZE..].fill(0);
        for i in 0..(1usize << depth) {
            write_be64(&mut dip.bh.data, DINODE_SIZE + i * 8, lblk);
        }
        dip.di.flags |= DIF_EXHASH;
        dip.di.depth = depth;
        dip.di.size = 8 << depth;
        dip.di.blocks += 1;
        dip.mark_dirty();
        debug!("directorio {} convertido a hash con profundidad {}", dip.addr, depth);
        Ok(())
    }

    fn dir_remove_where<F>(&mut self, dip: &mut Inode, hint: Option<u64>, pred: F) -> Result<bool>
    where
        F: Fn(&Dirent, &[u8]) -> bool,
    {
        if !self.is_dir(dip) {
            return Err(DirError::NotDirectory(dip.addr).into());
        }
        if !dip.is_exhash() {
            let found = region_remove(&mut dip.bh.data, DINODE_SIZE, dip.addr, &pred)?;
            if found.is_some() {
                dip.di.entries = dip.di.entries.saturating_sub(1);
                dip.mark_dirty();
            }
            return Ok(found.is_some());
        }

        let leaves = match hint {
            Some(idx) => {
                let mut chain = Vec::new();
                let mut blk = self.dir_table_get(dip, idx)?;
                let mut seen = BTreeSet::new();
                while blk != 0 && seen.insert(blk) {
                    let bh = self.leaf_read(blk)?;
                    chain.push(blk);
                    blk = Leaf::decode(&bh.data).next;
                }
                chain
            }
            None => self.dir_leaves(dip)?,
        };
        for blk in leaves {
            let mut bh = self.cache.bread(blk)?;
            if region_remove(&mut bh.data, LEAF_SIZE, blk, &pred)?.is_some() {
                let mut leaf = Leaf::decode(&bh.data);
                leaf.entries = leaf.entries.saturating_sub(1);
                leaf.encode(&mut bh.data);
                bh.mark_modified();
                self.cache.brelse(bh)?;
                dip.di.entries = dip.di.entries.saturating_sub(1);
                dip.mark_dirty();
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Borra la entrada `name`.
    pub fn dirent_del(&mut self, dip: &mut Inode, name: &[u8]) -> Result<()> {
        let hint = dip.is_exhash().then(|| hash_index(disk_hash(name), dip.di.depth));
        if self.dir_remove_where(dip, hint, |_, n| n == name)? {
            Ok(())
        } else {
            Err(FsError::Dir(DirError::NotFound))
        }
    }

    /// Borra la primera entrada (que no sea "." ni "..") que apunte a `target`.
    pub fn dir_remove_inum(&mut self, dip: &mut Inode, target: u64) -> Result<bool> {
        let removed = self.dir_remove_where(dip, None, |de, n| {
            de.inum.addr == target && n != b"." && n != b".."
        })?;
        if !removed {
            warn!("el directorio {} no tiene una entrada hacia {}", dip.addr, target);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_hash_is_crc32() {
        assert_eq!(disk_hash(b""), 0);
        assert_eq!(disk_hash(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_hash_index_uses_top_bits() {
        assert_eq!(hash_index(0xF000_0000, 0), 0);
        assert_eq!(hash_index(0xF000_0000, 2), 3);
        assert_eq!(hash_index(0x4000_0000, 2), 1);
    }

    #[test]
    fn test_region_insert_splits_and_remove_merges() {
        let mut buf = vec![0u8; 512];
        init_region(&mut buf, 104);
        let a = Inum::new(1, 100);
        let b = Inum::new(2, 200);
        assert!(region_insert(&mut buf, 104, 0, b"a", a, 8).unwrap());
        assert!(region_insert(&mut buf, 104, 0, b"bee", b, 8).unwrap());

        let list = scan_region(&buf, 104, 0).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].de.rec_len as usize, dirent_size(1));
        assert_eq!(list[1].name(&buf), b"bee");

        let gone = region_remove(&mut buf, 104, 0, |_, n| n == b"bee").unwrap();
        assert_eq!(gone.map(|d| d.inum), Some(b));
        let list = scan_region(&buf, 104, 0).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].de.rec_len as usize, 512 - 104);

        // borrar el primero lo deja vacío pero ocupando su lugar
        region_remove(&mut buf, 104, 0, |_, n| n == b"a").unwrap();
        let list = scan_region(&buf, 104, 0).unwrap();
        assert_eq!(list[0].de.inum.addr, 0);
        assert!(region_insert(&mut buf, 104, 0, b"c", a, 8).unwrap());
    }

    #[test]
    fn test_region_full_reports_no_room() {
        let mut buf = vec![0u8; 104 + 96];
        init_region(&mut buf, 104);
        assert!(region_insert(&mut buf, 104, 0, b"x", Inum::new(1, 1), 8).unwrap());
        assert!(region_insert(&mut buf, 104, 0, b"y", Inum::new(1, 2), 8).unwrap());
        assert!(!region_insert(&mut buf, 104, 0, b"z", Inum::new(1, 3), 8).unwrap());
    }

    #[test]
    fn test_corrupt_rec_len_is_detected() {
        let mut buf = vec![0u8; 256];
        init_region(&mut buf, 104);
        buf[104 + 20] = 0;
        buf[104 + 21] = 8;
        assert!(matches!(scan_region(&buf, 104, 9), Err(DirError::Corrupt { block: 9 })));
    }
}
